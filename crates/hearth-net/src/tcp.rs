//! TCP 牧马层：监听套接字所有权、连接准入与套接字生命周期治理。
//!
//! # 教案级说明
//! - **意图（Why）**：协议层只应面对“已准入、已包装、已登记”的连接；监听、
//!   限流、空闲超时、半关闭冲刷与收尾日志全部收敛在本层；
//! - **契约（What）**：每个 `connection` 事件要么产出一个进入开放集合、收尾
//!   时必然被移除的连接，要么当场销毁套接字——本层绝不持有集合之外的套接字。
//!   单条连接的治理顺序：
//!   1. 停机进行中 → 立即销毁；
//!   2. 以新铸连接号建立连接级 Span；
//!   3. 配置了连接限流则申请准入，拒绝即销毁（仅日志，不上抛）；
//!   4. 配置了数据限流则以整形写入器替换套接字；
//!   5. 登记进开放集合并置位“有连接”条件；
//!   6. 读空闲超时（默认 3 分钟）：先请求尽快收尾（destroy-soon），经宽限
//!      （默认 250 ms）仍未退出则硬销毁；
//!   7. 对端半关闭随服务自然返回，经冲刷宽限（默认 10 ms）后收尾；
//!   8. 字节数与收尾原因恰好记录一次，并投递给访问日志服务；
//!   9. 连接上下文交给协议层（[`ConnectionHandler`]）。
//! - **停机（How）**：接受循环是 Threadlet，以 `select!` 竞赛“下一个连接”与
//!   停止请求；停止后向所有在途连接广播收尾指令，等待开放集合清空才算停完；
//! - **注意（Trade-offs）**：Rust 中丢弃连接 Future 即确定性地关闭套接字，
//!   “硬销毁之后再等一轮宽限并放弃”的兜底阶梯在这里不再需要。

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant as TokioInstant;
use tracing::Span;

use hearth_core::error::BoxError;
use hearth_core::threadlet::{Threadlet, ThreadletRunner};

use crate::access::{AccessEvent, AccessLogSink, CloseReason};
use crate::error::NetError;
use crate::rate::{BoxedIo, ConnectionRateLimiter, DataRateLimiter};

/// 套接字治理的时序参数；全部可在测试中缩短。
#[derive(Clone, Copy, Debug)]
pub struct WranglerTimeouts {
    /// 读空闲上限。
    pub idle: Duration,
    /// 请求收尾后的关闭宽限。
    pub close_grace: Duration,
    /// 半关闭后的冲刷宽限。
    pub half_close_grace: Duration,
}

impl Default for WranglerTimeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(3 * 60),
            close_grace: Duration::from_millis(250),
            half_close_grace: Duration::from_millis(10),
        }
    }
}

/// 牧马层构造参数。
pub struct TcpWranglerConfig {
    pub interface: SocketAddr,
    pub timeouts: WranglerTimeouts,
    pub connection_gate: Option<Arc<dyn ConnectionRateLimiter>>,
    pub data_shaper: Option<Arc<dyn DataRateLimiter>>,
    pub access_log: Option<Arc<dyn AccessLogSink>>,
}

/// 交给协议层的连接上下文。
pub struct Connection {
    pub io: BoxedIo,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub id: u64,
    pub span: Span,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    /// 收尾指令是否已置位（destroy-soon 或停机）。
    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 返回收尾指令的订阅端，供协议层在 `select!` 中竞赛。
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

/// 协议层契约：接收已准入的连接并驱动其全部请求。
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle_connection(&self, connection: Connection) -> Result<(), BoxError>;
}

struct WranglerInner {
    listener: parking_lot::Mutex<Option<Arc<TokioTcpListener>>>,
    local_addr: SocketAddr,
    timeouts: WranglerTimeouts,
    handler: Weak<dyn ConnectionHandler>,
    connection_gate: Option<Arc<dyn ConnectionRateLimiter>>,
    data_shaper: Option<Arc<dyn DataRateLimiter>>,
    access_log: Option<Arc<dyn AccessLogSink>>,
    span: Span,
    open: DashMap<u64, SocketAddr>,
    any_open: watch::Sender<bool>,
    stop_conns: watch::Sender<bool>,
    next_conn_id: AtomicU64,
}

/// TCP 牧马层实例。
pub struct TcpWrangler {
    inner: Arc<WranglerInner>,
    acceptor: Threadlet,
}

impl TcpWrangler {
    /// 绑定监听地址并装配接受循环（尚未开始接受连接）。
    pub async fn bind(
        config: TcpWranglerConfig,
        handler: Weak<dyn ConnectionHandler>,
        span: Span,
    ) -> Result<Self, NetError> {
        let listener = TokioTcpListener::bind(config.interface)
            .await
            .map_err(|source| NetError::Bind {
                addr: config.interface,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NetError::Bind {
            addr: config.interface,
            source,
        })?;

        let (any_open, _) = watch::channel(false);
        let (stop_conns, _) = watch::channel(false);
        let inner = Arc::new(WranglerInner {
            listener: parking_lot::Mutex::new(Some(Arc::new(listener))),
            local_addr,
            timeouts: config.timeouts,
            handler,
            connection_gate: config.connection_gate,
            data_shaper: config.data_shaper,
            access_log: config.access_log,
            span,
            open: DashMap::new(),
            any_open,
            stop_conns,
            next_conn_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        let acceptor = Threadlet::new(move |runner| {
            let weak = weak.clone();
            Box::pin(async move {
                accept_loop(weak, runner).await;
                Ok(())
            })
        });
        Ok(Self { inner, acceptor })
    }

    /// 实际绑定的本地地址（`:0` 绑定后可据此取回端口）。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// 启动接受循环并等待其就绪。
    pub async fn start(&self) {
        self.acceptor.start();
        self.acceptor.when_started().await;
    }

    /// 停止：不再接受新连接，向在途连接广播收尾，等待开放集合清空。
    pub async fn stop(&self) {
        let _ = self.inner.stop_conns.send(true);
        // 关闭监听套接字：停机后新的连接尝试应被内核拒绝。
        *self.inner.listener.lock() = None;
        let _ = self.acceptor.stop().await;

        let mut open = self.inner.any_open.subscribe();
        let _ = open.wait_for(|any| !*any).await;
    }

    /// 当前开放连接数（测试与诊断用）。
    pub fn open_connections(&self) -> usize {
        self.inner.open.len()
    }
}

async fn accept_loop(weak: Weak<WranglerInner>, runner: ThreadletRunner) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let Some(listener) = inner.listener.lock().clone() else {
            return;
        };
        tokio::select! {
            biased;
            _ = runner.when_stop_requested() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => admit(&inner, stream, peer),
                Err(err) => {
                    // 接受失败（drop 事件）：记录后继续循环。
                    tracing::warn!(parent: &inner.span, error = %err, "accept failed");
                }
            },
        }
    }
}

/// 硬销毁：linger 置零使关闭立即可见（RST），不留下内核缓冲等待。
fn destroy(stream: TcpStream) {
    let sock = socket2::SockRef::from(&stream);
    let _ = sock.set_linger(Some(Duration::ZERO));
    drop(stream);
}

fn admit(inner: &Arc<WranglerInner>, stream: TcpStream, peer: SocketAddr) {
    if *inner.stop_conns.borrow() {
        // 停机进行中：当场销毁。
        destroy(stream);
        return;
    }
    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(parent: &inner.span, "connection", conn = id, peer = %peer);
    inner.open.insert(id, peer);
    let _ = inner.any_open.send(true);

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        drive_connection(inner, stream, peer, id, span).await;
    });
}

async fn drive_connection(
    inner: Arc<WranglerInner>,
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    span: Span,
) {
    let local = stream.local_addr().unwrap_or(inner.local_addr);

    if let Some(gate) = &inner.connection_gate
        && !gate.new_connection(&span).await
    {
        tracing::info!(parent: &span, "connection admission denied");
        destroy(stream);
        untrack(&inner, id);
        return;
    }

    let bytes_written = Arc::new(AtomicU64::new(0));
    let idle = IdleTracker::new(inner.timeouts.idle);
    let mut io: BoxedIo = Box::new(InstrumentedIo {
        inner: stream,
        idle: idle.clone(),
        written: Arc::clone(&bytes_written),
    });
    if let Some(shaper) = &inner.data_shaper {
        io = shaper.wrap_writer(io, &span);
    }

    let (soon_tx, soon_rx) = watch::channel(false);
    let connection = Connection {
        io,
        peer,
        local,
        id,
        span: span.clone(),
        shutdown: soon_rx,
    };
    let Some(handler) = inner.handler.upgrade() else {
        untrack(&inner, id);
        return;
    };

    let serve = handler.handle_connection(connection);
    tokio::pin!(serve);
    let mut stop_rx = inner.stop_conns.subscribe();

    let reason = tokio::select! {
        biased;
        result = &mut serve => match result {
            Ok(()) => {
                // 半关闭/自然收尾：给协议层一个冲刷窗口。
                tokio::time::sleep(inner.timeouts.half_close_grace).await;
                CloseReason::Eof
            }
            Err(err) => {
                tracing::warn!(parent: &span, error = %err, "connection failed");
                CloseReason::Error
            }
        },
        _ = idle.expired() => {
            tracing::info!(parent: &span, "read idle timeout; requesting close");
            let _ = soon_tx.send(true);
            tokio::select! {
                _ = &mut serve => {}
                _ = tokio::time::sleep(inner.timeouts.close_grace) => {
                    tracing::warn!(parent: &span, "close grace elapsed; destroying socket");
                }
            }
            CloseReason::Timeout
        },
        _ = async { stop_rx.wait_for(|stop| *stop).await.map(|_| ()) } => {
            let _ = soon_tx.send(true);
            tokio::select! {
                _ = &mut serve => {}
                _ = tokio::time::sleep(inner.timeouts.close_grace) => {
                    tracing::warn!(parent: &span, "stop grace elapsed; destroying socket");
                }
            }
            CloseReason::Shutdown
        },
    };

    // 丢弃 serve 即硬销毁仍存活的套接字。
    drop(serve);

    let written = bytes_written.load(Ordering::SeqCst);
    tracing::info!(
        parent: &span,
        bytes_written = written,
        reason = reason.as_str(),
        "connection closed",
    );
    if let Some(log) = &inner.access_log {
        log.record(AccessEvent::ConnectionClosed {
            connection_id: id,
            peer,
            reason,
            bytes_written: written,
        });
    }
    untrack(&inner, id);
}

fn untrack(inner: &Arc<WranglerInner>, id: u64) {
    inner.open.remove(&id);
    if inner.open.is_empty() {
        let _ = inner.any_open.send(false);
    }
}

/// 读空闲跟踪：每次成功读取刷新活动时刻，`expired` 在超时达成时完成。
#[derive(Clone)]
struct IdleTracker {
    inner: Arc<IdleInner>,
}

struct IdleInner {
    timeout: Duration,
    last_activity: parking_lot::Mutex<TokioInstant>,
}

impl IdleTracker {
    fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(IdleInner {
                timeout,
                last_activity: parking_lot::Mutex::new(TokioInstant::now()),
            }),
        }
    }

    fn touch(&self) {
        *self.inner.last_activity.lock() = TokioInstant::now();
    }

    async fn expired(&self) {
        loop {
            let deadline = *self.inner.last_activity.lock() + self.inner.timeout;
            if TokioInstant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// 计量包装：读路径刷新空闲时刻，写路径累计套接字字节数。
struct InstrumentedIo<S> {
    inner: S,
    idle: IdleTracker,
    written: Arc<AtomicU64>,
}

impl<S: AsyncRead + Unpin> AsyncRead for InstrumentedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.idle.touch();
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for InstrumentedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.written.fetch_add(written as u64, Ordering::SeqCst);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 回显处理器：读到什么写回什么，直至 EOF 或收尾指令。
    struct EchoHandler;

    #[async_trait]
    impl ConnectionHandler for EchoHandler {
        async fn handle_connection(&self, mut connection: Connection) -> Result<(), BoxError> {
            let mut shutdown = connection.shutdown_signal();
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    biased;
                    _ = async { shutdown.wait_for(|v| *v).await.map(|_| ()) } => return Ok(()),
                    read = connection.io.read(&mut buf) => match read? {
                        0 => return Ok(()),
                        n => connection.io.write_all(&buf[..n]).await?,
                    },
                }
            }
        }
    }

    /// 永不准入的连接限流。
    struct DenyAll;

    #[async_trait]
    impl ConnectionRateLimiter for DenyAll {
        async fn new_connection(&self, _span: &Span) -> bool {
            false
        }
    }

    async fn bind_echo(
        gate: Option<Arc<dyn ConnectionRateLimiter>>,
        timeouts: WranglerTimeouts,
    ) -> (TcpWrangler, Arc<dyn ConnectionHandler>) {
        let handler: Arc<dyn ConnectionHandler> = Arc::new(EchoHandler);
        let wrangler = TcpWrangler::bind(
            TcpWranglerConfig {
                interface: "127.0.0.1:0".parse().unwrap(),
                timeouts,
                connection_gate: gate,
                data_shaper: None,
                access_log: None,
            },
            Arc::downgrade(&handler),
            tracing::info_span!("test-wrangler"),
        )
        .await
        .expect("bind");
        // 返回 handler 保活：牧马层仅持有 Weak。
        (wrangler, handler)
    }

    /// 正常路径：接受、回显、EOF 收尾，开放集合清空。
    #[tokio::test]
    async fn echoes_and_untracks() {
        let (wrangler, _handler) = bind_echo(None, WranglerTimeouts::default()).await;
        wrangler.start().await;

        let mut client = TcpStream::connect(wrangler.local_addr()).await.expect("connect");
        client.write_all(b"ping").await.expect("write");
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(&reply, b"ping");

        drop(client);
        wrangler.stop().await;
        assert_eq!(wrangler.open_connections(), 0);
    }

    /// 准入被拒：对端立即观察到连接关闭。
    #[tokio::test]
    async fn denied_connection_is_destroyed() {
        let (wrangler, _handler) =
            bind_echo(Some(Arc::new(DenyAll)), WranglerTimeouts::default()).await;
        wrangler.start().await;

        let mut client = TcpStream::connect(wrangler.local_addr()).await.expect("connect");
        let mut buf = [0u8; 1];
        // 硬销毁可能以 RST 呈现：EOF 与连接复位都算“立即关闭”。
        let read = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(read, 0, "peer must see an immediate close");

        wrangler.stop().await;
    }

    /// 停止后：在途连接收到收尾指令，新的连接不再被服务。
    #[tokio::test]
    async fn stop_drains_open_connections() {
        let (wrangler, _handler) = bind_echo(None, WranglerTimeouts::default()).await;
        wrangler.start().await;

        let mut client = TcpStream::connect(wrangler.local_addr()).await.expect("connect");
        client.write_all(b"hi").await.expect("write");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.expect("read");

        wrangler.stop().await;
        assert_eq!(wrangler.open_connections(), 0);

        // 监听套接字已关闭：连接要么被拒绝，要么立即 EOF。
        match TcpStream::connect(wrangler.local_addr()).await {
            Err(_) => {}
            Ok(mut stranded) => {
                let mut buf = [0u8; 1];
                assert_eq!(stranded.read(&mut buf).await.unwrap_or(0), 0);
            }
        }
    }

    /// 读空闲超时：无流量的连接在超时 + 宽限后被销毁，集合清空。
    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let timeouts = WranglerTimeouts {
            idle: Duration::from_millis(200),
            close_grace: Duration::from_millis(50),
            half_close_grace: Duration::from_millis(1),
        };
        let (wrangler, _handler) = bind_echo(None, timeouts).await;
        wrangler.start().await;

        let client = TcpStream::connect(wrangler.local_addr()).await.expect("connect");
        // 等待连接被登记。
        while wrangler.open_connections() == 0 {
            tokio::task::yield_now().await;
        }

        // 推进暂停时钟越过空闲上限与宽限窗口。
        tokio::time::sleep(Duration::from_millis(400)).await;
        while wrangler.open_connections() > 0 {
            tokio::task::yield_now().await;
        }
        drop(client);
        wrangler.stop().await;
    }
}
