//! 网络层错误域：绑定、握手、证书与连接服务阶段的结构化失败。
//!
//! # 教案式说明
//! - **意图（Why）**：准入拒绝、协议错误等“局部可恢复”失败在连接或请求层面
//!   日志化处理，不上抛；本模块只承载需要跨层传播的失败，
//!   并为每类操作给出稳定语义；
//! - **契约（What）**：所有变体携带定位问题所需的操作上下文；`io::Error` 作为
//!   `source` 保留原始链路。

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// 网络端点核心的统一错误形态。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    #[error("监听地址 {addr} 绑定失败: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS 握手失败: {source}")]
    TlsHandshake {
        #[source]
        source: io::Error,
    },

    #[error("证书材料无效: {reason}")]
    BadCertificate { reason: String },

    #[error("HTTP 连接服务失败: {reason}")]
    Serve { reason: String },
}

impl NetError {
    pub(crate) fn bad_certificate(reason: impl Into<String>) -> Self {
        NetError::BadCertificate {
            reason: reason.into(),
        }
    }

    pub(crate) fn serve(reason: impl std::fmt::Display) -> Self {
        NetError::Serve {
            reason: reason.to_string(),
        }
    }
}
