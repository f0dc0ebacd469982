//! 令牌桶：固定容量、连续补充的通用限流原语。
//!
//! # 教案级说明
//! - **意图（Why）**：连接准入与出站字节整形共享同一套限流数学；把“容量 + 补充
//!   速率 + 等待队列”收敛到一个原语中，上层服务只做语义适配；
//! - **契约（What）**：
//!   - 同步路径 [`TokenBucket::take_now`]：按当前可用量立即授予（可能部分授予），
//!     并给出剩余缺口折算的等待时间；
//!   - 异步路径 [`TokenBucket::request_grant`]：FIFO 等待队列 + 服务任务；队列
//!     已满时**同步拒绝**（语义由测试锚定，调用方不应依赖排队兜底）；
//!   - [`TokenBucket::deny_all_requests`]：停止服务任务并以失败完成所有等待者，
//!     保留其累计等待时长；
//! - **不变量（Invariants）**：任意操作后 `0 ≤ volume ≤ capacity`；两次观察之间
//!   的体积由 `min(capacity, prev + flow_rate × Δt)` 定义；等待者严格按入队顺序
//!   被服务，仅当队列为空时新调用者才可能经同步路径“插队”；
//! - **风险提示（Trade-offs）**：体积与速率采用 `f64`，在极端时长下存在精度
//!   损耗；服务任务每轮按队首缺口睡眠，粒度受注入时间源的精度约束。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ConfigError;
use crate::threadlet::{Threadlet, ThreadletRunner};
use crate::time::TimeSource;

/// 申请数量：闭区间 `[min_inclusive, max_inclusive]`。
///
/// 标量数量等价于 `min == max`；区间申请允许“有多少先给多少（不低于下限）”。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrantQuantity {
    pub min_inclusive: f64,
    pub max_inclusive: f64,
}

impl GrantQuantity {
    /// 构造区间申请；要求 `0 ≤ min ≤ max` 且两端有限。
    pub fn range(min_inclusive: f64, max_inclusive: f64) -> Self {
        Self {
            min_inclusive,
            max_inclusive,
        }
    }
}

impl From<f64> for GrantQuantity {
    fn from(quantity: f64) -> Self {
        Self {
            min_inclusive: quantity,
            max_inclusive: quantity,
        }
    }
}

/// `take_now` 的结果：立即授予量与剩余缺口的等待时间估计（ATU）。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TakeOutcome {
    /// 是否满足了申请下限。
    pub done: bool,
    /// 实际授予量；`done == false` 时恒为 0。
    pub grant: f64,
    /// 补足申请下限所需的最短等待（ATU）。
    pub min_wait_atu: f64,
    /// 补足申请上限所需的等待（ATU）。
    pub max_wait_atu: f64,
}

/// `request_grant` 的最终结果。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GrantOutcome {
    pub done: bool,
    pub grant: f64,
    /// 从发起申请到完成（或被拒绝）的累计等待（ATU）。
    pub wait_atu: f64,
}

/// 当前桶状态快照。
#[derive(Clone, Copy, Debug)]
pub struct BucketSnapshot {
    /// 顶满后的即时可用量（`partial_tokens == false` 时向下取整）。
    pub available_burst: f64,
    pub now_atu: f64,
    pub waiters: usize,
    pub capacity: f64,
    pub flow_rate: f64,
    pub max_waiters: Option<usize>,
    pub partial_tokens: bool,
}

/// 构造选项；`initial_volume` 缺省等于容量，`max_waiters` 缺省不设上限。
#[derive(Clone, Debug)]
pub struct TokenBucketOptions {
    pub capacity: f64,
    pub flow_rate: f64,
    pub initial_volume: Option<f64>,
    pub max_waiters: Option<usize>,
    pub partial_tokens: bool,
}

impl TokenBucketOptions {
    /// 以容量与补充速率构造最小选项集。
    pub fn new(capacity: f64, flow_rate: f64) -> Self {
        Self {
            capacity,
            flow_rate,
            initial_volume: None,
            max_waiters: None,
            partial_tokens: false,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ConfigError::invalid("capacity", "必须为有限正数"));
        }
        if !(self.flow_rate.is_finite() && self.flow_rate > 0.0) {
            return Err(ConfigError::invalid("flow_rate", "必须为有限正数"));
        }
        if let Some(initial) = self.initial_volume
            && !(initial.is_finite() && (0.0..=self.capacity).contains(&initial))
        {
            return Err(ConfigError::invalid(
                "initial_volume",
                "必须位于 [0, capacity] 区间",
            ));
        }
        Ok(())
    }
}

struct Waiter {
    quantity: GrantQuantity,
    start_atu: f64,
    completion: oneshot::Sender<GrantOutcome>,
}

struct BucketState {
    volume: f64,
    last_now: f64,
    waiters: VecDeque<Waiter>,
    // 服务任务存在即代表“队列非空或正在收尾”；每次激活都是全新实例，
    // 避免与上一轮任务的收尾状态竞争。
    servicer: Option<Threadlet>,
}

struct BucketInner {
    capacity: f64,
    flow_rate: f64,
    partial_tokens: bool,
    max_waiters: Option<usize>,
    time: Arc<dyn TimeSource>,
    state: Mutex<BucketState>,
}

/// 令牌桶实例；克隆共享同一桶状态。
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<BucketInner>,
}

impl TokenBucket {
    /// 校验选项并构造桶。
    pub fn new(
        options: TokenBucketOptions,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let now = time.now_atu();
        let volume = options.initial_volume.unwrap_or(options.capacity);
        Ok(Self {
            inner: Arc::new(BucketInner {
                capacity: options.capacity,
                flow_rate: options.flow_rate,
                partial_tokens: options.partial_tokens,
                max_waiters: options.max_waiters,
                time,
                state: Mutex::new(BucketState {
                    volume,
                    last_now: now,
                    waiters: VecDeque::new(),
                    servicer: None,
                }),
            }),
        })
    }

    /// 立即尝试取出指定数量的令牌。
    ///
    /// # 契约说明（What）
    /// 1. 先按 `min(capacity, volume + flow_rate × Δt)` 顶满；
    /// 2. `partial_tokens == false` 时可用量向下取整；可用量低于申请下限则
    ///    `done == false` 且不扣减；否则授予 `min(可用量, 上限)`；
    /// 3. 等待时间按“授予后的剩余缺口 − 桶内剩余体积”折算到补充速率。
    pub fn take_now(&self, quantity: impl Into<GrantQuantity>) -> TakeOutcome {
        let mut state = self.inner.state.lock();
        Self::take_locked(&self.inner, &mut state, quantity.into())
    }

    fn top_up(inner: &BucketInner, state: &mut BucketState, now: f64) {
        let elapsed = (now - state.last_now).max(0.0);
        state.volume = inner.capacity.min(state.volume + inner.flow_rate * elapsed);
        state.last_now = now;
    }

    fn take_locked(
        inner: &BucketInner,
        state: &mut BucketState,
        quantity: GrantQuantity,
    ) -> TakeOutcome {
        let now = inner.time.now_atu();
        Self::top_up(inner, state, now);

        let available = if inner.partial_tokens {
            state.volume
        } else {
            state.volume.floor()
        };
        let (done, grant) = if available < quantity.min_inclusive {
            (false, 0.0)
        } else {
            (true, available.min(quantity.max_inclusive))
        };
        state.volume -= grant;

        let remaining = state.volume;
        let min_shortfall = ((quantity.min_inclusive - grant).max(0.0) - remaining).max(0.0);
        let max_shortfall = ((quantity.max_inclusive - grant).max(0.0) - remaining).max(0.0);
        TakeOutcome {
            done,
            grant,
            min_wait_atu: min_shortfall / inner.flow_rate,
            max_wait_atu: max_shortfall / inner.flow_rate,
        }
    }

    /// 申请授予：队列为空时先走同步路径；否则排队并由服务任务按 FIFO 兑现。
    ///
    /// 队列已达 `max_waiters` 上限时同步拒绝（`done == false`，`wait_atu == 0`）。
    pub async fn request_grant(&self, quantity: impl Into<GrantQuantity>) -> GrantOutcome {
        let quantity = quantity.into();
        let (receiver, servicer) = {
            let mut state = self.inner.state.lock();
            if state.waiters.is_empty() {
                let outcome = Self::take_locked(&self.inner, &mut state, quantity);
                if outcome.done {
                    return GrantOutcome {
                        done: true,
                        grant: outcome.grant,
                        wait_atu: 0.0,
                    };
                }
            }
            if let Some(max) = self.inner.max_waiters
                && state.waiters.len() >= max
            {
                return GrantOutcome {
                    done: false,
                    grant: 0.0,
                    wait_atu: 0.0,
                };
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                quantity,
                start_atu: self.inner.time.now_atu(),
                completion: tx,
            });
            let servicer = if state.servicer.is_none() {
                let threadlet = Self::make_servicer(&self.inner);
                state.servicer = Some(threadlet.clone());
                Some(threadlet)
            } else {
                None
            };
            (rx, servicer)
        };

        if let Some(servicer) = servicer {
            // 激活服务任务；结果经等待者各自的通道送达，此处无需保留句柄。
            let _ = servicer.start();
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => GrantOutcome {
                done: false,
                grant: 0.0,
                wait_atu: 0.0,
            },
        }
    }

    fn make_servicer(inner: &Arc<BucketInner>) -> Threadlet {
        let weak = Arc::downgrade(inner);
        Threadlet::new(move |runner| {
            let weak = weak.clone();
            Box::pin(async move {
                Self::service_loop(weak, runner).await;
                Ok(())
            })
        })
    }

    async fn service_loop(weak: Weak<BucketInner>, runner: ThreadletRunner) {
        enum Step {
            Finished,
            Resolved,
            Wait(f64),
        }

        loop {
            if runner.should_stop() {
                return;
            }
            let Some(inner) = weak.upgrade() else { return };

            let step = {
                let mut state = inner.state.lock();
                let head_quantity = state.waiters.front().map(|waiter| waiter.quantity);
                match head_quantity {
                    None => {
                        // 队列清空后本次激活结束；置空由同一把锁保护，
                        // 使后续申请者能看见并创建新的服务任务。
                        state.servicer = None;
                        Step::Finished
                    }
                    Some(quantity) => {
                        let outcome = Self::take_locked(&inner, &mut state, quantity);
                        if outcome.done {
                            let now = inner.time.now_atu();
                            let waiter = state
                                .waiters
                                .pop_front()
                                .expect("head checked above");
                            let _ = waiter.completion.send(GrantOutcome {
                                done: true,
                                grant: outcome.grant,
                                wait_atu: (now - waiter.start_atu).max(0.0),
                            });
                            Step::Resolved
                        } else {
                            Step::Wait(outcome.min_wait_atu)
                        }
                    }
                }
            };

            match step {
                Step::Finished => return,
                Step::Resolved => continue,
                Step::Wait(wait_atu) => {
                    // 浮点取整可能把极小缺口折算成 0 等待；强制下限防忙转。
                    let sleep = inner.time.sleep_atu(wait_atu.max(1e-6));
                    drop(inner);
                    tokio::select! {
                        biased;
                        _ = runner.when_stop_requested() => return,
                        _ = sleep => {}
                    }
                }
            }
        }
    }

    /// 停止服务任务并以失败完成所有排队等待者（保留累计等待时长）。
    pub async fn deny_all_requests(&self) {
        let servicer = {
            let mut state = self.inner.state.lock();
            state.servicer.take()
        };
        if let Some(servicer) = servicer {
            let _ = servicer.stop().await;
        }
        let drained: Vec<Waiter> = {
            let mut state = self.inner.state.lock();
            state.waiters.drain(..).collect()
        };
        let now = self.inner.time.now_atu();
        for waiter in drained {
            let _ = waiter.completion.send(GrantOutcome {
                done: false,
                grant: 0.0,
                wait_atu: (now - waiter.start_atu).max(0.0),
            });
        }
    }

    /// 顶满后的状态快照。
    pub fn snapshot_now(&self) -> BucketSnapshot {
        let mut state = self.inner.state.lock();
        let now = self.inner.time.now_atu();
        Self::top_up(&self.inner, &mut state, now);
        let available = if self.inner.partial_tokens {
            state.volume
        } else {
            state.volume.floor()
        };
        BucketSnapshot {
            available_burst: available,
            now_atu: now,
            waiters: state.waiters.len(),
            capacity: self.inner.capacity,
            flow_rate: self.inner.flow_rate,
            max_waiters: self.inner.max_waiters,
            partial_tokens: self.inner.partial_tokens,
        }
    }
}
