//! 访问日志事件模型：请求摘要与连接收尾事件的统一载体。
//!
//! # 教案式说明
//! - **意图（Why）**：访问日志服务按名称配置、可整体替换；牧马层只负责在
//!   响应写完 / 连接收尾时投递结构化事件，格式化与落盘是服务实现的事；
//! - **契约（What）**：[`AccessLogSink::record`] 必须快速返回（通常仅向事件
//!   链追加）；事件的消费顺序与投递顺序一致由事件链保证。

use std::net::SocketAddr;
use std::time::Duration;

/// 连接收尾原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端正常关闭（EOF）。
    Eof,
    /// 读空闲超时。
    Timeout,
    /// 套接字或协议错误。
    Error,
    /// 服务端主动停机。
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Eof => "eof",
            CloseReason::Timeout => "timeout",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// 单个请求的访问摘要：响应完整写出后投递。
#[derive(Clone, Debug)]
pub struct RequestSummary {
    pub request_id: String,
    pub peer: SocketAddr,
    pub method: String,
    pub target: String,
    pub protocol: &'static str,
    pub status: u16,
    pub duration: Duration,
}

/// 访问日志事件。
#[derive(Clone, Debug)]
pub enum AccessEvent {
    Request(RequestSummary),
    ConnectionClosed {
        connection_id: u64,
        peer: SocketAddr,
        reason: CloseReason,
        bytes_written: u64,
    },
}

/// 访问日志服务契约。
pub trait AccessLogSink: Send + Sync + 'static {
    /// 投递一条访问事件；实现必须快速返回。
    fn record(&self, event: AccessEvent);
}
