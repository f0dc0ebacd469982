//! Threadlet：带显式 start / stop-request / stop 语义的协作式任务。
//!
//! # 教案级说明
//! - **意图（Why）**：框架内所有长寿命循环（接受连接、事件消费、令牌桶服务）都
//!   需要统一的“请求停止 → 协作退出 → 等待结果”协议；Threadlet 把这一协议从
//!   各业务循环中抽离，避免每处手写 `tokio::select!` 样板；
//! - **契约（What）**：
//!   - `start()` 调度启动函数（可选）与主函数，返回本轮运行结果的共享 Future，
//!     重复调用合并到同一结果；
//!   - `stop()` 置位停止意图并返回与 `start()` 相同的结果 Future；从未启动时
//!     立即以空结果完成；
//!   - 任务体通过 [`ThreadletRunner::should_stop`] 与
//!     [`ThreadletRunner::when_stop_requested`] 协作感知停止请求；
//!   - 运行结束后实例回到空闲态，允许再次 `start()`；
//! - **风险提示（Trade-offs）**：取消完全协作式——主函数若不检查停止信号，
//!   `stop()` 只能等待其自然返回；结果以消息文本（[`ThreadletError`]）广播，
//!   放弃了结构化 cause 链。

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{BoxError, ThreadletError};

/// 单轮运行的统一结果。
pub type ThreadletResult = Result<(), ThreadletError>;

/// `start()` / `stop()` 返回的共享结果 Future。
pub type ThreadletOutcome = Shared<BoxFuture<'static, ThreadletResult>>;

type BodyFn = dyn Fn(ThreadletRunner) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// 任务体内可见的协作句柄。
///
/// # 契约说明（What）
/// - `should_stop`：同步探测是否已请求停止；
/// - `when_stop_requested`：返回在停止请求置位时完成的 Future，供
///   `tokio::select!` 与长等待竞赛。
#[derive(Clone)]
pub struct ThreadletRunner {
    stop_rx: watch::Receiver<bool>,
}

impl ThreadletRunner {
    /// 是否已请求停止。
    pub fn should_stop(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// 等待停止请求；发送端被丢弃（本轮运行已结束）同样视为停止。
    pub async fn when_stop_requested(&self) {
        let mut rx = self.stop_rx.clone();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct RunState {
    phase: Phase,
    stop_tx: Option<watch::Sender<bool>>,
    outcome: Option<ThreadletOutcome>,
}

struct ThreadletInner {
    start_fn: Option<Box<BodyFn>>,
    main_fn: Box<BodyFn>,
    state: Mutex<RunState>,
    // 跨轮次的“主函数已开始”信号：true 表示当前轮次主函数在运行。
    started: watch::Sender<bool>,
}

/// 协作式任务实例。
///
/// # 设计背景（Why）
/// - 借鉴任务句柄的一次性消费语义，但把“同一轮运行的结果可被 start/stop 双方
///   共同等待”作为第一类需求，因此内部以 `Shared` Future 承载结果；
/// - 停止信号选用 `watch` 通道：置位即广播，任意数量的 `select!` 分支都能以
///   `wait_for` 观察到。
///
/// # 逻辑解析（How）
/// - `start()` 在空闲态创建新的停止通道并 `tokio::spawn` 任务体；任务体按
///   “启动函数 →（置 Running）→ 主函数”的顺序执行，结束时把实例归位为空闲；
/// - 任何阶段的错误都折叠为 [`ThreadletError`] 并经共享 Future 广播；
/// - `stop()` 仅置位意图，不抢占执行。
#[derive(Clone)]
pub struct Threadlet {
    inner: Arc<ThreadletInner>,
}

impl Threadlet {
    /// 以主函数构造任务。
    pub fn new<F>(main_fn: F) -> Self
    where
        F: Fn(ThreadletRunner) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(None, Box::new(main_fn))
    }

    /// 以启动函数 + 主函数构造任务；启动函数返回后才视为“已启动”。
    pub fn with_start<S, F>(start_fn: S, main_fn: F) -> Self
    where
        S: Fn(ThreadletRunner) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
        F: Fn(ThreadletRunner) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(Some(Box::new(start_fn)), Box::new(main_fn))
    }

    fn build(start_fn: Option<Box<BodyFn>>, main_fn: Box<BodyFn>) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(ThreadletInner {
                start_fn,
                main_fn,
                state: Mutex::new(RunState {
                    phase: Phase::Idle,
                    stop_tx: None,
                    outcome: None,
                }),
                started,
            }),
        }
    }

    /// 启动任务并返回本轮运行结果的共享 Future；重复调用合并。
    pub fn start(&self) -> ThreadletOutcome {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Idle {
            return state
                .outcome
                .clone()
                .expect("non-idle threadlet must hold an outcome");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        state.phase = Phase::Starting;
        state.stop_tx = Some(stop_tx);

        let inner = Arc::clone(&self.inner);
        let runner = ThreadletRunner { stop_rx };
        let task = async move {
            let result: ThreadletResult = async {
                if let Some(start_fn) = inner.start_fn.as_ref() {
                    start_fn(runner.clone())
                        .await
                        .map_err(|err| ThreadletError::start(&err))?;
                }
                {
                    let mut state = inner.state.lock();
                    if state.phase == Phase::Starting {
                        state.phase = Phase::Running;
                    }
                }
                let _ = inner.started.send(true);
                (inner.main_fn)(runner)
                    .await
                    .map_err(|err| ThreadletError::main(&err))
            }
            .await;

            // 归位：允许后续重新启动，同一轮的结果仍可经共享 Future 读取。
            {
                let mut state = inner.state.lock();
                state.phase = Phase::Idle;
                state.stop_tx = None;
            }
            let _ = inner.started.send(false);
            result
        };

        let handle = tokio::spawn(task);
        let outcome: ThreadletOutcome = async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => Err(ThreadletError::Panicked),
            }
        }
        .boxed()
        .shared();
        state.outcome = Some(outcome.clone());
        outcome
    }

    /// 请求停止并返回与 `start()` 相同的结果 Future。
    ///
    /// 从未启动过的实例立即以 `Ok(())` 完成（空结果哨兵）。
    pub fn stop(&self) -> ThreadletOutcome {
        let mut state = self.inner.state.lock();
        if let Some(stop_tx) = state.stop_tx.as_ref() {
            let _ = stop_tx.send(true);
            if matches!(state.phase, Phase::Starting | Phase::Running) {
                state.phase = Phase::Stopping;
            }
        }
        match state.outcome.clone() {
            Some(outcome) => outcome,
            None => futures_util::future::ready(Ok(())).boxed().shared(),
        }
    }

    /// 主函数是否正在运行（停止请求尚未置位）。
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().phase == Phase::Running
    }

    /// 本轮运行是否已越过启动阶段（主函数已开始）。
    pub fn is_started(&self) -> bool {
        *self.inner.started.borrow()
    }

    /// 等待主函数开始运行。
    pub async fn when_started(&self) {
        let mut rx = self.inner.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }
}
