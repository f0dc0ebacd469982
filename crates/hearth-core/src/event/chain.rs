//! 链式事件：只追加、前向单链的异步事件节点。
//!
//! # 教案级说明
//! - **意图（Why）**：访问日志、连接事件等异步流需要“已追加即不可变”的有序
//!   载体；单链节点 + 一次性发射器把“谁有权追加”显式化为所有权事实；
//! - **契约（What）**：
//!   - 每个节点持有负载与一个后继槽位；槽位一旦解析（由发射器或异步后继任务
//!     写入）便永不改变；
//!   - 发射器对任一节点至多被取走一次；[`EventEmitter::emit`] 按值消费自身并
//!     返回下一槽位的新发射器，“至多调用一次”由移动语义保证；
//!   - 异步后继解析失败会污染槽位：此后所有读取返回同一 [`ChainError::Broken`]；
//! - **注意（Trade-offs）**：负载类型由泛型参数约束（链上只接受同一 `T`），
//!   源实现中的运行期类型校验因此消解为编译期事实。

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::error::{BoxError, ChainError};

/// 节点后继槽位：一次写入、多次读取、可等待。
pub(crate) struct NextSlot<T> {
    cell: OnceLock<Result<ChainedEvent<T>, ChainError>>,
    notify: Notify,
    taken: AtomicBool,
}

impl<T> NextSlot<T> {
    /// 发射器尚可取走的悬置槽位。
    pub(crate) fn pending_available() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceLock::new(),
            notify: Notify::new(),
            taken: AtomicBool::new(false),
        })
    }

    /// 发射权已被占用（由 `emit` 返回值或异步解析任务持有）的悬置槽位。
    pub(crate) fn pending_taken() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceLock::new(),
            notify: Notify::new(),
            taken: AtomicBool::new(true),
        })
    }

    fn resolve(&self, result: Result<ChainedEvent<T>, ChainError>) {
        let _ = self.cell.set(result);
        self.notify.notify_waiters();
    }

    fn peek(&self) -> Option<Result<ChainedEvent<T>, ChainError>> {
        self.cell.get().cloned()
    }

    /// 等待槽位解析；唤醒注册先于再次检查，避免丢失通知。
    pub(crate) async fn resolved(&self) -> Result<ChainedEvent<T>, ChainError> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.cell.get() {
                return result.clone();
            }
            notified.await;
        }
    }
}

struct EventNode<T> {
    payload: T,
    next: Arc<NextSlot<T>>,
    // 视图（`with_payload`）与预解析节点不具备发射能力。
    emitter_allowed: bool,
}

/// 链上的单个事件节点；克隆仅复制引用。
pub struct ChainedEvent<T> {
    node: Arc<EventNode<T>>,
}

impl<T> Clone for ChainedEvent<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T> fmt::Debug for ChainedEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedEvent")
            .field("next_resolved", &self.node.next.cell.get().is_some())
            .finish_non_exhaustive()
    }
}

impl<T> ChainedEvent<T> {
    /// 构造链头：后继悬置，发射器可经 [`Self::take_emitter`] 取走一次。
    pub fn new(payload: T) -> Self {
        Self {
            node: Arc::new(EventNode {
                payload,
                next: NextSlot::pending_available(),
                emitter_allowed: true,
            }),
        }
    }

    /// 构造已知后继的节点；该节点不再产生发射器。
    pub fn with_successor(payload: T, successor: ChainedEvent<T>) -> Self {
        let next = NextSlot::pending_taken();
        next.resolve(Ok(successor));
        Self {
            node: Arc::new(EventNode {
                payload,
                next,
                emitter_allowed: false,
            }),
        }
    }

    /// 读取负载。
    pub fn payload(&self) -> &T {
        &self.node.payload
    }

    /// 同步读取后继：未解析返回 `Ok(None)`；槽位被污染则返回原始失败原因。
    pub fn next_now(&self) -> Result<Option<ChainedEvent<T>>, ChainError> {
        match self.node.next.peek() {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// 等待后继解析。
    pub async fn next(&self) -> Result<ChainedEvent<T>, ChainError> {
        self.node.next.resolved().await
    }

    /// 取走本节点的发射器；仅链头持有发射能力，且至多成功一次。
    pub fn take_emitter(&self) -> Result<EventEmitter<T>, ChainError> {
        if !self.node.emitter_allowed {
            return Err(ChainError::EmitterUnavailable);
        }
        if self.node.next.taken.swap(true, Ordering::SeqCst) {
            return Err(ChainError::EmitterTaken);
        }
        Ok(EventEmitter {
            slot: Arc::clone(&self.node.next),
        })
    }

    /// 以新负载构造共享同一后继序列的视图；视图不具备发射能力。
    pub fn with_payload(&self, payload: T) -> ChainedEvent<T> {
        Self {
            node: Arc::new(EventNode {
                payload,
                next: Arc::clone(&self.node.next),
                emitter_allowed: false,
            }),
        }
    }

    /// 以新负载构造前插头：其后继即本节点。
    pub fn with_pushed_head(&self, payload: T) -> ChainedEvent<T> {
        Self::with_successor(payload, self.clone())
    }

    pub(crate) fn next_slot(&self) -> Arc<NextSlot<T>> {
        Arc::clone(&self.node.next)
    }
}

impl<T> ChainedEvent<T>
where
    T: Send + Sync + 'static,
{
    /// 构造带异步后继的节点：后台任务负责解析；解析失败将污染槽位，
    /// 此后 `next_now` / `next` 以同一原因失败。
    ///
    /// # 前置条件
    /// - 必须在 Tokio 运行时内调用（内部 `tokio::spawn` 解析任务）。
    pub fn with_successor_future<F>(payload: T, successor: F) -> Self
    where
        F: Future<Output = Result<ChainedEvent<T>, BoxError>> + Send + 'static,
    {
        let next = NextSlot::pending_taken();
        let slot = Arc::clone(&next);
        tokio::spawn(async move {
            let result = successor.await.map_err(ChainError::broken);
            slot.resolve(result);
        });
        Self {
            node: Arc::new(EventNode {
                payload,
                next,
                emitter_allowed: false,
            }),
        }
    }
}

/// 一次性事件发射器：按值消费，追加后返回下一槽位的发射器。
pub struct EventEmitter<T> {
    slot: Arc<NextSlot<T>>,
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish_non_exhaustive()
    }
}

impl<T> EventEmitter<T> {
    pub(crate) fn for_slot(slot: Arc<NextSlot<T>>) -> Self {
        Self { slot }
    }

    /// 追加一个事件并返回（新事件, 新事件槽位的发射器）。
    ///
    /// 新事件节点自身的 `take_emitter` 将失败——发射权已由返回值持有。
    pub fn emit(self, payload: T) -> (ChainedEvent<T>, EventEmitter<T>) {
        let next_slot = NextSlot::pending_taken();
        let event = ChainedEvent {
            node: Arc::new(EventNode {
                payload,
                next: Arc::clone(&next_slot),
                emitter_allowed: true,
            }),
        };
        self.slot.resolve(Ok(event.clone()));
        (event, EventEmitter { slot: next_slot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 发射器只能被取走一次；视图不具备发射能力。
    #[test]
    fn emitter_is_exclusive() {
        let head = ChainedEvent::new(1u32);
        let emitter = head.take_emitter().expect("first take succeeds");
        assert_eq!(head.take_emitter().unwrap_err(), ChainError::EmitterTaken);

        let view = head.with_payload(7);
        assert_eq!(
            view.take_emitter().unwrap_err(),
            ChainError::EmitterUnavailable,
        );
        drop(emitter);
    }

    /// 经发射器追加的事件按链序可达，emit 产出的节点不再允许 take。
    #[test]
    fn emit_appends_in_order() {
        let head = ChainedEvent::new(0u32);
        let emitter = head.take_emitter().expect("take");
        let (second, emitter) = emitter.emit(1);
        let (third, _tail) = emitter.emit(2);
        assert_eq!(second.take_emitter().unwrap_err(), ChainError::EmitterTaken);

        let step1 = head.next_now().expect("intact").expect("resolved");
        assert_eq!(*step1.payload(), 1);
        let step2 = step1.next_now().expect("intact").expect("resolved");
        assert_eq!(*step2.payload(), 2);
        assert!(step2.next_now().expect("intact").is_none());
        assert_eq!(*third.payload(), 2);
    }

    /// 前插头的后继即原链头；视图共享原节点的后继。
    #[test]
    fn pushed_head_and_payload_views() {
        let head = ChainedEvent::new(10u32);
        let pushed = head.with_pushed_head(9);
        let back = pushed.next_now().expect("intact").expect("resolved");
        assert_eq!(*back.payload(), 10);

        let emitter = head.take_emitter().expect("take");
        let view = head.with_payload(99);
        let (_, _tail) = emitter.emit(11);
        let via_view = view.next_now().expect("intact").expect("shared successor");
        assert_eq!(*via_view.payload(), 11);
    }

    /// 异步后继解析成功后 `next` 返回同一节点。
    #[tokio::test]
    async fn future_successor_resolves() {
        let tail = ChainedEvent::new(2u32);
        let head = ChainedEvent::with_successor_future(1u32, {
            let tail = tail.clone();
            async move { Ok(tail) }
        });
        let next = head.next().await.expect("resolved");
        assert_eq!(*next.payload(), 2);
    }

    /// 异步后继解析失败污染槽位：此后所有读取以同一原因失败。
    #[tokio::test]
    async fn broken_successor_poisons_reads() {
        let head = ChainedEvent::with_successor_future(1u32, async {
            Err::<ChainedEvent<u32>, _>("resolver exploded".into())
        });
        let err = head.next().await.unwrap_err();
        assert!(matches!(err, ChainError::Broken(_)));
        let again = head.next_now().unwrap_err();
        assert_eq!(err, again);
    }
}
