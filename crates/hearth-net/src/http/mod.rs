//! 协议牧马层：HTTP/1、HTTP/2 与 HTTPS 的连接级状态机。
//!
//! # 教案级说明
//! - **意图（Why）**：TCP 牧马层交付的是“已准入的字节流”；本层负责可选的
//!   TLS 握手、HTTP 帧级解析（委托 hyper）、请求模型装配、请求体上限、向
//!   端点处理器的分发，以及访问日志投递；
//! - **契约（What）**：
//!   - 协议 `http` 为明文（HTTP/1.1 与先验知识 h2c 均可），`https` 为
//!     TLS + HTTP/1.1，`http2` 为 TLS + ALPN（h2 优先、http/1.1 兜底）；
//!   - 处理器返回 `None` 翻译为 404；处理器报错或 panic 翻译为 500，并在
//!     请求 Span 上记录，连接本身继续存活；
//!   - 声明长度超出请求体上限的请求在分发前即 413；流式超限在读取时失败，
//!     同样映射为 413；
//!   - 响应完整写出后，请求摘要投递给访问日志服务；
//! - **停机（How）**：连接上下文的收尾指令（destroy-soon / 停机广播）触发
//!   hyper 连接的优雅关闭，随后由 TCP 层的宽限阶梯兜底。

mod headers;
mod request;

pub use headers::{SINGLE_VALUED, is_single_valued, normalized_value};
pub use request::{BodyError, HostInfo, IncomingRequest, RequestTarget};

use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant as TokioInstant;
use tokio_rustls::TlsAcceptor;
use tracing::Span;

use hearth_core::component::{Component, ComponentCell};
use hearth_core::error::{BoxError, ConfigError};

use crate::access::{AccessEvent, AccessLogSink, RequestSummary};
use crate::error::NetError;
use crate::rate::{ConnectionRateLimiter, DataRateLimiter};
use crate::tcp::{Connection, ConnectionHandler, TcpWrangler, TcpWranglerConfig, WranglerTimeouts};

/// 端点支持的线协议。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Http2,
    Https,
}

impl Protocol {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "http" => Ok(Protocol::Http),
            "http2" => Ok(Protocol::Http2),
            "https" => Ok(Protocol::Https),
            other => Err(ConfigError::invalid(
                "protocol",
                format!("未识别的协议 {other:?}（可选 http / http2 / https）"),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Https => "https",
        }
    }

    /// 是否需要 TLS（即需要主机证书子集）。
    pub fn requires_tls(self) -> bool {
        !matches!(self, Protocol::Http)
    }

    /// TLS 握手的 ALPN 列表。
    pub fn alpn(self) -> &'static [&'static [u8]] {
        match self {
            Protocol::Http => &[],
            Protocol::Https => &[b"http/1.1"],
            Protocol::Http2 => &[b"h2", b"http/1.1"],
        }
    }
}

/// 响应体的统一形态。
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// 处理器产出的响应。
pub type OutgoingResponse = http::Response<ResponseBody>;

/// 以完整字节构造响应体。
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).boxed()
}

/// 空响应体。
pub fn empty_body() -> ResponseBody {
    Empty::new().boxed()
}

/// 纯文本响应的便捷构造。
pub fn text_response(status: http::StatusCode, text: &str) -> OutgoingResponse {
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(text.to_string()))
        .expect("static response construction cannot fail")
}

/// 请求处理器契约（端点实现）。
///
/// 返回 `Ok(None)` 表示“未处理”，由协议层翻译为 404。
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(
        &self,
        request: IncomingRequest,
    ) -> Result<Option<OutgoingResponse>, BoxError>;
}

/// 协议牧马层构造参数。
pub struct ProtocolWranglerConfig {
    pub protocol: Protocol,
    pub interface: SocketAddr,
    pub max_request_body: Option<u64>,
    pub timeouts: WranglerTimeouts,
    /// TLS 服务端配置；`protocol.requires_tls()` 时必须提供。
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub connection_gate: Option<Arc<dyn ConnectionRateLimiter>>,
    pub data_shaper: Option<Arc<dyn DataRateLimiter>>,
    pub access_log: Option<Arc<dyn AccessLogSink>>,
}

/// 协议牧马层组件：作为端点的子组件被初始化与启动。
pub struct ProtocolWrangler {
    cell: ComponentCell,
    protocol: Protocol,
    interface: SocketAddr,
    max_request_body: Option<u64>,
    timeouts: WranglerTimeouts,
    tls: Option<Arc<rustls::ServerConfig>>,
    connection_gate: Option<Arc<dyn ConnectionRateLimiter>>,
    data_shaper: Option<Arc<dyn DataRateLimiter>>,
    access_log: Option<Arc<dyn AccessLogSink>>,
    handler: Arc<dyn RequestHandler>,
    tcp: parking_lot::Mutex<Option<Arc<TcpWrangler>>>,
}

impl ProtocolWrangler {
    /// 校验配置并构造牧马层。
    pub fn new(
        config: ProtocolWranglerConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<Self>, ConfigError> {
        if config.protocol.requires_tls() && config.tls.is_none() {
            return Err(ConfigError::invalid(
                "protocol",
                format!("协议 {} 需要主机证书", config.protocol.as_str()),
            ));
        }
        Ok(Arc::new(Self {
            cell: ComponentCell::new(),
            protocol: config.protocol,
            interface: config.interface,
            max_request_body: config.max_request_body,
            timeouts: config.timeouts,
            tls: config.tls,
            connection_gate: config.connection_gate,
            data_shaper: config.data_shaper,
            access_log: config.access_log,
            handler,
            tcp: parking_lot::Mutex::new(None),
        }))
    }

    /// 实际监听地址（启动后可用）。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.lock().as_ref().map(|tcp| tcp.local_addr())
    }

    async fn serve_io<IO>(
        &self,
        io: IO,
        meta: Arc<ConnMeta>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let access_log = self.access_log.clone();
        let max_body = self.max_request_body;
        let service = service_fn(move |request: http::Request<Incoming>| {
            let handler = Arc::clone(&handler);
            let access_log = access_log.clone();
            let meta = Arc::clone(&meta);
            async move {
                Ok::<_, Infallible>(dispatch(request, handler, access_log, max_body, meta).await)
            }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let connection = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(connection);

        let mut graceful = false;
        loop {
            if graceful {
                return connection
                    .as_mut()
                    .await
                    .map_err(|err| NetError::serve(err).into());
            }
            tokio::select! {
                result = connection.as_mut() => {
                    return result.map_err(|err| NetError::serve(err).into());
                }
                _ = shutdown.wait_for(|requested| *requested) => {
                    // 收尾指令：让 hyper 停止接受新请求并完成在途响应。
                    connection.as_mut().graceful_shutdown();
                    graceful = true;
                }
            }
        }
    }
}

#[async_trait]
impl Component for ProtocolWrangler {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "protocol-wrangler"
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
        let as_handler: Arc<dyn ConnectionHandler> = Arc::clone(&self) as _;
        let tcp = TcpWrangler::bind(
            TcpWranglerConfig {
                interface: self.interface,
                timeouts: self.timeouts,
                connection_gate: self.connection_gate.clone(),
                data_shaper: self.data_shaper.clone(),
                access_log: self.access_log.clone(),
            },
            Arc::downgrade(&as_handler),
            span,
        )
        .await?;
        tcp.start().await;
        *self.tcp.lock() = Some(Arc::new(tcp));
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
        let tcp = self.tcp.lock().take();
        if let Some(tcp) = tcp {
            tcp.stop().await;
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionHandler for ProtocolWrangler {
    async fn handle_connection(&self, connection: Connection) -> Result<(), BoxError> {
        let shutdown = connection.shutdown_signal();
        let meta = Arc::new(ConnMeta {
            peer: connection.peer,
            local_port: connection.local.port(),
            scheme: if self.protocol.requires_tls() {
                "https"
            } else {
                "http"
            },
            connection_id: connection.id,
            span: connection.span.clone(),
            request_seq: AtomicU64::new(0),
        });

        match &self.tls {
            None => self.serve_io(connection.io, meta, shutdown).await,
            Some(config) => {
                let acceptor = TlsAcceptor::from(Arc::clone(config));
                let tls = acceptor
                    .accept(connection.io)
                    .await
                    .map_err(|source| NetError::TlsHandshake { source })?;
                self.serve_io(tls, meta, shutdown).await
            }
        }
    }
}

struct ConnMeta {
    peer: SocketAddr,
    local_port: u16,
    scheme: &'static str,
    connection_id: u64,
    span: Span,
    request_seq: AtomicU64,
}

fn declared_content_length(headers: &http::HeaderMap) -> Option<u64> {
    headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn dispatch(
    request: http::Request<Incoming>,
    handler: Arc<dyn RequestHandler>,
    access_log: Option<Arc<dyn AccessLogSink>>,
    max_body: Option<u64>,
    meta: Arc<ConnMeta>,
) -> OutgoingResponse {
    let started = TokioInstant::now();
    let sequence = meta.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let request_id = format!("{}-{}", meta.connection_id, sequence);
    let span = tracing::info_span!(parent: &meta.span, "request", id = %request_id);
    let method = request.method().to_string();
    let raw_target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().to_string());
    let protocol = request::protocol_name(request.version());

    // 声明长度超限：在分发前即拒绝（请求体永不触达处理器）。
    let response = if let Some(max) = max_body
        && declared_content_length(request.headers()).is_some_and(|len| len > max)
    {
        tracing::info!(parent: &span, declared = ?declared_content_length(request.headers()), "request body over limit");
        text_response(http::StatusCode::PAYLOAD_TOO_LARGE, "payload too large\n")
    } else {
        let incoming = IncomingRequest::assemble(
            request,
            request_id.clone(),
            meta.scheme,
            meta.peer,
            meta.local_port,
            max_body,
            span.clone(),
        );
        let outcome = std::panic::AssertUnwindSafe(handler.handle_request(incoming))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => text_response(http::StatusCode::NOT_FOUND, "not found\n"),
            Ok(Err(err)) => {
                if err.downcast_ref::<BodyError>()
                    .is_some_and(|body_err| matches!(body_err, BodyError::TooLarge))
                {
                    tracing::info!(parent: &span, "request body over limit");
                    text_response(http::StatusCode::PAYLOAD_TOO_LARGE, "payload too large\n")
                } else {
                    tracing::error!(parent: &span, error = %err, "request handler failed");
                    text_response(
                        http::StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error\n",
                    )
                }
            }
            Err(_panic) => {
                tracing::error!(parent: &span, "request handler panicked");
                text_response(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error\n",
                )
            }
        }
    };

    if let Some(log) = access_log {
        log.record(AccessEvent::Request(RequestSummary {
            request_id,
            peer: meta.peer,
            method,
            target: raw_target,
            protocol,
            status: response.status().as_u16(),
            duration: started.elapsed(),
        }));
    }
    response
}
