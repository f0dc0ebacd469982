//! 限流服务契约与出站字节整形写入器。
//!
//! # 教案级说明
//! - **意图（Why）**：牧马层（wrangler）按名称解析限流服务并经 trait 对象调用，
//!   服务实现可整体替换；调用一律经显式 trait 分发，不走字符串方法名；
//! - **契约（What）**：
//!   - [`ConnectionRateLimiter::new_connection`]：为一条新连接申请准入；拒绝时
//!     调用方必须立即销毁套接字，拒绝只记日志、不上抛；
//!   - [`DataRateLimiter::wrap_writer`]：以字节整形包装套接字的可写半部，读取
//!     侧原样透传；
//!   - [`ShapedWriter`]：按“先取额度、后写套接字”的顺序整形出站字节；桶空时
//!     写操作挂起，直至令牌到位或申请被整体拒绝（映射为写错误）；
//! - **注意（Trade-offs）**：额度在套接字短写时保留为“信用”，下次写入优先
//!   消耗，避免令牌泄漏；整形以写调用为粒度，突发精度受调用方缓冲策略影响。

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::Span;

use hearth_core::bucket::{GrantOutcome, GrantQuantity, TokenBucket};

/// 对象安全的双向异步流别名。
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// 装箱的双向流：牧马层在包装链上传递的统一形态。
pub type BoxedIo = Box<dyn AsyncIo>;

/// 连接准入服务契约。
#[async_trait::async_trait]
pub trait ConnectionRateLimiter: Send + Sync + 'static {
    /// 为一条新连接申请准入；返回 `false` 表示拒绝。
    async fn new_connection(&self, span: &Span) -> bool;
}

/// 出站字节整形服务契约。
pub trait DataRateLimiter: Send + Sync + 'static {
    /// 以整形写入器包装套接字；读取侧透传。
    fn wrap_writer(&self, io: BoxedIo, span: &Span) -> BoxedIo;
}

enum ShapeState {
    /// 可直接尝试同步取额度。
    Idle,
    /// 等待异步授予；`want` 记录本轮申请上限。
    Waiting(BoxFuture<'static, GrantOutcome>),
}

/// 令牌桶驱动的整形写入器。
///
/// # 逻辑解析（How）
/// 1. 写路径先消耗既有“信用”（已授予未写出的字节额度）；
/// 2. 无信用时尝试 [`TokenBucket::take_now`]（区间 `[1, len]`，有多少先给多少）；
/// 3. 同步不可得则排队 [`TokenBucket::request_grant`]，Future 驻留在写入器中
///    跨 poll 持续推进；申请被拒绝（例如桶被 `deny_all_requests` 关停）时写
///    操作以 `BrokenPipe` 失败；
/// 4. 套接字短写时剩余额度保留为信用，下次写入优先消耗。
pub struct ShapedWriter<W> {
    io: W,
    bucket: TokenBucket,
    credit: usize,
    state: ShapeState,
}

impl<W> ShapedWriter<W> {
    /// 以底层流与令牌桶构造整形写入器。
    pub fn new(io: W, bucket: TokenBucket) -> Self {
        Self {
            io,
            bucket,
            credit: 0,
            state: ShapeState::Idle,
        }
    }
}

impl<W: AsyncRead + Unpin> AsyncRead for ShapedWriter<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ShapedWriter<W>
where
    W: Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut this.io).poll_write(cx, buf);
        }
        loop {
            if this.credit > 0 {
                let allowed = this.credit.min(buf.len());
                return match Pin::new(&mut this.io).poll_write(cx, &buf[..allowed]) {
                    Poll::Ready(Ok(written)) => {
                        this.credit -= written;
                        Poll::Ready(Ok(written))
                    }
                    other => other,
                };
            }

            match &mut this.state {
                ShapeState::Waiting(future) => match future.as_mut().poll(cx) {
                    Poll::Ready(outcome) => {
                        this.state = ShapeState::Idle;
                        if outcome.done {
                            this.credit = outcome.grant as usize;
                            continue;
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "data rate limiter refused outbound bytes",
                        )));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                ShapeState::Idle => {
                    let want = buf.len() as f64;
                    let taken = this.bucket.take_now(GrantQuantity::range(1.0, want));
                    if taken.done {
                        this.credit = taken.grant as usize;
                        continue;
                    }
                    let bucket = this.bucket.clone();
                    this.state = ShapeState::Waiting(Box::pin(async move {
                        bucket.request_grant(GrantQuantity::range(1.0, want)).await
                    }));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::bucket::TokenBucketOptions;
    use hearth_core::time::VirtualTimeSource;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    fn shaping_bucket(capacity: f64, flow: f64, initial: f64, time: &VirtualTimeSource) -> TokenBucket {
        let mut options = TokenBucketOptions::new(capacity, flow);
        options.initial_volume = Some(initial);
        TokenBucket::new(options, Arc::new(time.clone())).expect("valid")
    }

    /// 额度充足时写入不被整形延迟。
    #[tokio::test]
    async fn write_passes_through_with_tokens() {
        let time = VirtualTimeSource::new();
        let bucket = shaping_bucket(64.0, 1.0, 64.0, &time);
        let mut writer = ShapedWriter::new(Vec::new(), bucket);

        writer.write_all(b"hello hearth").await.expect("write");
        assert_eq!(&writer.io, b"hello hearth");
    }

    /// 桶空时写入挂起，令牌补充后完成；授予量受补充预算约束。
    #[tokio::test]
    async fn write_blocks_until_refill() {
        let time = VirtualTimeSource::new();
        let bucket = shaping_bucket(16.0, 2.0, 0.0, &time);
        let mut writer = ShapedWriter::new(Vec::new(), bucket);

        let write = tokio::spawn(async move {
            writer.write_all(b"abcdef").await.expect("write completes");
            writer.io
        });

        for _ in 0..80 {
            tokio::task::yield_now().await;
            time.advance(0.1);
        }

        let sink = write.await.expect("join");
        assert_eq!(&sink, b"abcdef");
    }

    /// 桶被整体关停时，挂起的写以 BrokenPipe 失败。
    #[tokio::test]
    async fn denied_grant_surfaces_as_write_error() {
        let time = VirtualTimeSource::new();
        let bucket = shaping_bucket(16.0, 0.001, 0.0, &time);
        let mut writer = ShapedWriter::new(Vec::new(), bucket.clone());

        let write = tokio::spawn(async move { writer.write_all(b"stalled").await });
        // 等待写入方排入等待队列。
        while bucket.snapshot_now().waiters == 0 {
            tokio::task::yield_now().await;
        }
        bucket.deny_all_requests().await;

        let result = write.await.expect("join");
        let err = result.expect_err("write must fail");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
