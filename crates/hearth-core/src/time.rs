//! 可注入时间源：以 ATU（Arbitrary Time Unit）为单位的“取当前时间 + 定时等待”抽象。
//!
//! # 教案级说明
//! - **意图（Why）**：令牌桶、等待队列等节律敏感组件必须在测试中以确定性的虚拟
//!   时间轴驱动，因此“当前时间”与“延迟等待”都要经由统一接口注入，而不是直接
//!   触碰 `tokio::time`；
//! - **契约（What）**：[`TimeSource::now_atu`] 返回自时间源建立以来的单调偏移，
//!   [`TimeSource::sleep_atu`] 返回在指定 ATU 后完成的 Future。生产实现
//!   [`TokioTimeSource`] 以 1 ATU = 1 秒落地；[`VirtualTimeSource`] 由测试显式
//!   推进；
//! - **实现提示（How）**：虚拟时钟内部以互斥锁聚合状态，到期唤醒在锁外执行，
//!   避免在锁内运行用户代码。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 时间源统一返回的延迟 Future 类型。
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// 抽象可注入的时钟：获取当前 ATU 偏移并生成延迟 Future。
///
/// # 教案式注释
/// - **意图（Why）**：通过 trait 限定统一契约，令牌桶与服务线程可以在生产与
///   测试之间无缝替换时间来源；
/// - **契约（What）**：`now_atu` 必须单调不减；`sleep_atu` 对非正时长立即完成；
/// - **注意（Trade-offs）**：ATU 采用 `f64`，极长运行时间下精度下降，但换取了
///   部分令牌等分数语义的自然表达。
pub trait TimeSource: Send + Sync + 'static {
    /// 返回自时间源建立以来的单调偏移（ATU）。
    fn now_atu(&self) -> f64;

    /// 返回一个在指定 ATU 之后完成的延迟 Future。
    fn sleep_atu(&self, atu: f64) -> Sleep;
}

/// 生产运行时的时间源：1 ATU = 1 秒，底层依赖 Tokio 计时器。
///
/// # 教案式注释
/// - **契约（What）**：`now_atu` 基于构造时刻的 `Instant` 计算偏移；`sleep_atu`
///   直接委托 `tokio::time::sleep`，因此在 `start_paused` 测试中同样可控；
/// - **前置条件**：`sleep_atu` 必须在 Tokio 运行时内 `await`。
#[derive(Clone, Debug)]
pub struct TokioTimeSource {
    origin: Instant,
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioTimeSource {
    /// 以当前时刻为原点构造时间源。
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for TokioTimeSource {
    fn now_atu(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep_atu(&self, atu: f64) -> Sleep {
        if atu <= 0.0 {
            return Box::pin(async {});
        }
        let duration = Duration::from_secs_f64(atu);
        Box::pin(tokio::time::sleep(duration))
    }
}

/// 手动推进的虚拟时间源，服务于单元测试的确定性需求。
///
/// # 教案式注释
/// - **意图（Why）**：验证令牌桶补充节律、等待队列唤醒顺序时，测试需要完全
///   控制时间流逝；`advance` 显式推进虚拟时间并唤醒到期的睡眠者；
/// - **契约（What）**：
///   - `now_atu` 返回累计推进量；
///   - `sleep_atu` 注册一个在虚拟时间到达截止点时完成的 Future；
///   - `advance(delta)` 推进时间轴并唤醒所有到期 waker；
/// - **注意（Trade-offs）**：内部以互斥锁管理睡眠者列表，牺牲并发度换取语义
///   清晰；到期判定采用闭区间（`now >= deadline`）。
#[derive(Clone, Debug, Default)]
pub struct VirtualTimeSource {
    inner: Arc<VirtualInner>,
}

#[derive(Debug, Default)]
struct VirtualInner {
    state: Mutex<VirtualState>,
}

#[derive(Debug, Default)]
struct VirtualState {
    now: f64,
    sleepers: Vec<Arc<SleeperShared>>,
}

impl VirtualTimeSource {
    /// 创建原点为 0 ATU 的虚拟时间源。
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进虚拟时间并唤醒所有到期的睡眠 Future。
    pub fn advance(&self, delta: f64) {
        assert!(delta >= 0.0, "virtual time can only move forward");
        let due = {
            let mut state = self.inner.state.lock();
            state.now += delta;
            let now = state.now;
            let mut due = Vec::new();
            state.sleepers.retain(|sleeper| {
                if sleeper.deadline <= now {
                    sleeper.mark_done();
                    due.push(Arc::clone(sleeper));
                    false
                } else {
                    true
                }
            });
            due
        };
        // 在锁外唤醒，避免唤醒逻辑反向进入时间源。
        for sleeper in due {
            sleeper.wake();
        }
    }
}

impl TimeSource for VirtualTimeSource {
    fn now_atu(&self) -> f64 {
        self.inner.state.lock().now
    }

    fn sleep_atu(&self, atu: f64) -> Sleep {
        let shared = {
            let mut state = self.inner.state.lock();
            let deadline = state.now + atu.max(0.0);
            let shared = Arc::new(SleeperShared::new(deadline));
            if deadline <= state.now {
                shared.mark_done();
            } else {
                state.sleepers.push(Arc::clone(&shared));
            }
            shared
        };
        Box::pin(VirtualSleep { shared })
    }
}

#[derive(Debug)]
struct SleeperShared {
    deadline: f64,
    done: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl SleeperShared {
    fn new(deadline: f64) -> Self {
        Self {
            deadline,
            done: AtomicBool::new(false),
            waker: Mutex::new(None),
        }
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

struct VirtualSleep {
    shared: Arc<SleeperShared>,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.is_done() {
            return Poll::Ready(());
        }
        *self.shared.waker.lock() = Some(cx.waker().clone());
        if self.shared.is_done() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};

    fn poll_once(sleep: &mut Sleep) -> Poll<()> {
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        sleep.as_mut().poll(&mut cx)
    }

    /// 虚拟时间推进到截止点前，睡眠 Future 必须保持 Pending。
    #[test]
    fn virtual_sleep_completes_only_after_advance() {
        let time = VirtualTimeSource::new();
        let mut sleep = time.sleep_atu(5.0);
        assert_eq!(poll_once(&mut sleep), Poll::Pending);

        time.advance(4.9);
        assert_eq!(poll_once(&mut sleep), Poll::Pending);

        time.advance(0.1);
        assert_eq!(poll_once(&mut sleep), Poll::Ready(()));
        assert!((time.now_atu() - 5.0).abs() < 1e-9);
    }

    /// 非正时长的睡眠立即完成，不进入睡眠者列表。
    #[test]
    fn zero_sleep_is_immediately_ready() {
        let time = VirtualTimeSource::new();
        let mut sleep = time.sleep_atu(0.0);
        assert_eq!(poll_once(&mut sleep), Poll::Ready(()));
    }
}
