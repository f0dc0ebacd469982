//! 内建服务组件：令牌桶连接准入、令牌桶字节整形与内存访问日志。
//!
//! # 教案级说明
//! - **意图（Why）**：端点按名称从服务管理器解析协作方；内建实现覆盖
//!   三类服务槽位，替换实现只需提供同接口的新组件类；
//! - **契约（What）**：
//!   - [`TokenBucketConnectionLimiter`]：每条连接申请恰好 1 枚令牌，零等待
//!     预算（纯 `take_now`），拒绝即时可见；停止时关停底层桶；
//!   - [`TokenBucketDataShaper`]：以整形写入器包装套接字写路径，字节计数
//!     直接对应令牌数；停止时关停底层桶以释放阻塞中的写；
//!   - [`MemoryAccessLog`]：事件链承载访问事件，消费任务在组件 Span 上
//!     结构化输出；停止采用排空语义——已投递事件必然被消费；
//! - **注意（Trade-offs）**：内存访问日志保留最近 N 条事件供检视，真正的
//!   落盘与轮转属于外部日志管线。

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::Span;

use hearth_core::bucket::{TokenBucket, TokenBucketOptions};
use hearth_core::component::{Component, ComponentCell, ComponentName, InterfaceId, downcast_arc};
use hearth_core::error::{BoxError, ConfigError};
use hearth_core::event::{EventSink, EventSource};
use hearth_core::time::TimeSource;
use hearth_net::access::{AccessEvent, AccessLogSink};
use hearth_net::rate::{BoxedIo, ConnectionRateLimiter, DataRateLimiter, ShapedWriter};

/// 访问日志接口标记。
pub fn access_log_interface() -> InterfaceId {
    InterfaceId::of::<dyn AccessLogSink>("AccessLog")
}

/// 连接准入接口标记。
pub fn connection_rate_limiter_interface() -> InterfaceId {
    InterfaceId::of::<dyn ConnectionRateLimiter>("ConnectionRateLimiter")
}

/// 字节整形接口标记。
pub fn data_rate_limiter_interface() -> InterfaceId {
    InterfaceId::of::<dyn DataRateLimiter>("DataRateLimiter")
}

/// 令牌桶连接准入服务。
pub struct TokenBucketConnectionLimiter {
    cell: ComponentCell,
    name: ComponentName,
    bucket: TokenBucket,
}

impl TokenBucketConnectionLimiter {
    /// 以桶参数构造准入服务；`flow_rate` 为每秒补充的连接额度。
    pub fn new(
        name: ComponentName,
        options: TokenBucketOptions,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>, ConfigError> {
        Ok(Arc::new(Self {
            cell: ComponentCell::new(),
            name,
            bucket: TokenBucket::new(options, time)?,
        }))
    }
}

#[async_trait]
impl ConnectionRateLimiter for TokenBucketConnectionLimiter {
    async fn new_connection(&self, span: &Span) -> bool {
        // 零等待预算：当下无令牌即拒绝，不排队。
        let outcome = self.bucket.take_now(1.0);
        if !outcome.done {
            tracing::info!(
                parent: span,
                min_wait_atu = outcome.min_wait_atu,
                "connection rate limit exceeded",
            );
        }
        outcome.done
    }
}

#[async_trait]
impl Component for TokenBucketConnectionLimiter {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "connection-rate-limiter"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![connection_rate_limiter_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
        self.bucket.deny_all_requests().await;
        Ok(())
    }
}

/// 令牌桶字节整形服务。
pub struct TokenBucketDataShaper {
    cell: ComponentCell,
    name: ComponentName,
    bucket: TokenBucket,
}

impl TokenBucketDataShaper {
    /// 以桶参数构造整形服务；1 令牌 = 1 字节。
    pub fn new(
        name: ComponentName,
        options: TokenBucketOptions,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>, ConfigError> {
        Ok(Arc::new(Self {
            cell: ComponentCell::new(),
            name,
            bucket: TokenBucket::new(options, time)?,
        }))
    }
}

impl DataRateLimiter for TokenBucketDataShaper {
    fn wrap_writer(&self, io: BoxedIo, _span: &Span) -> BoxedIo {
        Box::new(ShapedWriter::new(io, self.bucket.clone()))
    }
}

#[async_trait]
impl Component for TokenBucketDataShaper {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "data-rate-limiter"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![data_rate_limiter_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
        // 关停底层桶：阻塞中的整形写以错误返回，避免悬挂连接。
        self.bucket.deny_all_requests().await;
        Ok(())
    }
}

/// 内存访问日志：事件链承载，消费任务结构化输出并保留近期事件。
pub struct MemoryAccessLog {
    cell: ComponentCell,
    name: ComponentName,
    source: Arc<EventSource<AccessEvent>>,
    recent: Arc<Mutex<Vec<AccessEvent>>>,
    sink: Mutex<Option<EventSink<AccessEvent>>>,
    keep_recent: usize,
}

impl MemoryAccessLog {
    pub fn new(name: ComponentName, keep_count: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            cell: ComponentCell::new(),
            name,
            // 源侧保留量始终有界：消费任务推进后旧节点即可回收。
            source: Arc::new(EventSource::with_keep_count(Some(
                keep_count.unwrap_or(256),
            ))),
            recent: Arc::new(Mutex::new(Vec::new())),
            sink: Mutex::new(None),
            keep_recent: keep_count.unwrap_or(256),
        })
    }

    /// 已消费事件的快照（测试与诊断用）。
    pub fn recent_events(&self) -> Vec<AccessEvent> {
        self.recent.lock().clone()
    }
}

impl AccessLogSink for MemoryAccessLog {
    fn record(&self, event: AccessEvent) {
        self.source.emit(event);
    }
}

#[async_trait]
impl Component for MemoryAccessLog {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "memory-access-log"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![access_log_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        let span = self
            .cell
            .context()
            .map(|ctx| ctx.span().clone())
            .unwrap_or_else(Span::none);
        let recent = Arc::clone(&self.recent);
        let keep_recent = self.keep_recent;
        // 以“首个事件”的 Future 绑定链头：启动不等待任何事件出现。
        let source = Arc::clone(&self.source);
        let head = async move { source.current_event().await };
        let sink = EventSink::from_future(head, move |event| {
            let recent = Arc::clone(&recent);
            let span = span.clone();
            Box::pin(async move {
                match event.payload() {
                    AccessEvent::Request(summary) => {
                        tracing::info!(
                            parent: &span,
                            id = %summary.request_id,
                            peer = %summary.peer,
                            method = %summary.method,
                            target = %summary.target,
                            protocol = summary.protocol,
                            status = summary.status,
                            duration_ms = summary.duration.as_millis() as u64,
                            "access",
                        );
                    }
                    AccessEvent::ConnectionClosed {
                        connection_id,
                        peer,
                        reason,
                        bytes_written,
                    } => {
                        tracing::info!(
                            parent: &span,
                            conn = connection_id,
                            peer = %peer,
                            reason = reason.as_str(),
                            bytes_written,
                            "connection closed",
                        );
                    }
                }
                let mut recent_guard = recent.lock();
                recent_guard.push(event.payload().clone());
                let overflow = recent_guard.len().saturating_sub(keep_recent);
                if overflow > 0 {
                    recent_guard.drain(..overflow);
                }
                Ok(())
            })
        });
        sink.run();
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            // 排空停机：已投递的访问事件必然被消费。
            sink.drain_and_stop().await?;
        }
        Ok(())
    }
}

/// 由服务配置记录构造内建服务组件（`class` 槽位选择类别）。
pub fn build_service(
    config: crate::config::ServiceConfig,
    time: &Arc<dyn TimeSource>,
) -> Result<Arc<dyn Component>, ConfigError> {
    use crate::config::ServiceConfig;

    let parse_name = |raw: &str| {
        ComponentName::parse(raw)
            .map_err(|_| ConfigError::invalid("name", format!("服务名 {raw:?} 非法")))
    };
    match config {
        ServiceConfig::ConnectionRateLimiter {
            name,
            max_burst,
            flow_rate,
            initial_burst,
        } => {
            let mut options = TokenBucketOptions::new(max_burst, flow_rate);
            options.initial_volume = initial_burst;
            let component =
                TokenBucketConnectionLimiter::new(parse_name(&name)?, options, Arc::clone(time))?;
            Ok(component as Arc<dyn Component>)
        }
        ServiceConfig::DataRateLimiter {
            name,
            max_burst,
            flow_rate,
            max_waiters,
        } => {
            let mut options = TokenBucketOptions::new(max_burst, flow_rate);
            options.max_waiters = max_waiters;
            let component =
                TokenBucketDataShaper::new(parse_name(&name)?, options, Arc::clone(time))?;
            Ok(component as Arc<dyn Component>)
        }
        ServiceConfig::MemoryAccessLog { name, keep_count } => {
            let component = MemoryAccessLog::new(parse_name(&name)?, keep_count);
            Ok(component as Arc<dyn Component>)
        }
    }
}

/// 服务解析助手：把服务组件还原为各自的功能对象。
///
/// 内建类别在此穷举；新增服务类别时同步扩展对应分支。
pub fn as_access_log(component: Arc<dyn Component>) -> Option<Arc<dyn AccessLogSink>> {
    downcast_arc::<MemoryAccessLog>(component).map(|log| log as Arc<dyn AccessLogSink>)
}

pub fn as_connection_rate_limiter(
    component: Arc<dyn Component>,
) -> Option<Arc<dyn ConnectionRateLimiter>> {
    downcast_arc::<TokenBucketConnectionLimiter>(component)
        .map(|limiter| limiter as Arc<dyn ConnectionRateLimiter>)
}

pub fn as_data_rate_limiter(component: Arc<dyn Component>) -> Option<Arc<dyn DataRateLimiter>> {
    downcast_arc::<TokenBucketDataShaper>(component)
        .map(|shaper| shaper as Arc<dyn DataRateLimiter>)
}
