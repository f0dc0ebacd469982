//! 事件源：持有链头并负责追加的容器，支持“保留计数”回收旧事件。
//!
//! # 教案式注释
//! - **意图（Why）**：链本身是只追加结构，若无人回收会无限增长；事件源把
//!   “保留最近 N 个”策略收敛到追加入口，消费者仍以普通链节点游走；
//! - **契约（What）**：
//!   - [`EventSource::emit`] 追加负载并返回新事件；配置了保留计数时最旧事件
//!     随之被丢弃（引用随之失效，由消费者自身的引用保活）；
//!   - [`EventSource::earliest_event_now`] / [`EventSource::earliest_event`]
//!     返回当前最旧的保留事件（或其 Future）；
//!   - [`EventSource::current_event`] 返回“当前最新事件”的 Future，首个事件
//!     出现前挂起；
//! - **注意（Trade-offs）**：保留计数下限为 1（至少保留最新事件）；回收只
//!   裁剪事件源自身的引用，已被下游持有的节点不受影响。

use std::sync::Arc;

use parking_lot::Mutex;

use super::chain::{ChainedEvent, EventEmitter, NextSlot};
use crate::error::ChainError;

struct SourceState<T> {
    emitter: Option<EventEmitter<T>>,
    genesis: Arc<NextSlot<T>>,
    earliest: Option<ChainedEvent<T>>,
    latest: Option<ChainedEvent<T>>,
    retained: usize,
}

/// 链头容器；`keep_count` 为 `None` 表示不回收。
pub struct EventSource<T> {
    state: Mutex<SourceState<T>>,
    keep_count: Option<usize>,
}

impl<T> EventSource<T> {
    /// 构造不回收旧事件的事件源。
    pub fn new() -> Self {
        Self::with_keep_count(None)
    }

    /// 构造带保留计数的事件源；计数按下限 1 截断。
    pub fn with_keep_count(keep_count: Option<usize>) -> Self {
        // 起始槽位：首个事件经由它解析，earliest/current 的 Future 也等待它。
        // 发射权自始由事件源自身持有，因此以“已占用”形态创建。
        let genesis = NextSlot::pending_taken();
        Self {
            state: Mutex::new(SourceState {
                emitter: Some(EventEmitter::for_slot(Arc::clone(&genesis))),
                genesis,
                earliest: None,
                latest: None,
                retained: 0,
            }),
            keep_count: keep_count.map(|count| count.max(1)),
        }
    }

    /// 追加事件：推进链尾，按保留计数回收最旧事件，返回刚追加的事件。
    pub fn emit(&self, payload: T) -> ChainedEvent<T> {
        let mut state = self.state.lock();
        let emitter = state
            .emitter
            .take()
            .expect("event source always holds the tail emitter between emits");
        let (event, next_emitter) = emitter.emit(payload);
        state.emitter = Some(next_emitter);
        state.latest = Some(event.clone());
        if state.earliest.is_none() {
            state.earliest = Some(event.clone());
            state.retained = 1;
        } else {
            state.retained += 1;
        }

        if let Some(keep) = self.keep_count {
            while state.retained > keep {
                let oldest = state
                    .earliest
                    .take()
                    .expect("retained > 0 implies earliest exists");
                let successor = oldest
                    .next_now()
                    .expect("in-source chain is never poisoned")
                    .expect("non-latest events always have a resolved successor");
                state.earliest = Some(successor);
                state.retained -= 1;
            }
        }
        event
    }

    /// 当前最旧的保留事件；尚无事件时返回 `None`。
    pub fn earliest_event_now(&self) -> Option<ChainedEvent<T>> {
        self.state.lock().earliest.clone()
    }

    /// 当前保留的事件数量。
    pub fn retained_count(&self) -> usize {
        self.state.lock().retained
    }

    /// 最旧保留事件的 Future：首个事件出现前挂起。
    pub async fn earliest_event(&self) -> Result<ChainedEvent<T>, ChainError> {
        let (existing, genesis) = {
            let state = self.state.lock();
            (state.earliest.clone(), Arc::clone(&state.genesis))
        };
        match existing {
            Some(event) => Ok(event),
            None => genesis.resolved().await,
        }
    }

    /// “当前最新事件”的 Future：首个事件出现前挂起。
    pub async fn current_event(&self) -> Result<ChainedEvent<T>, ChainError> {
        let (latest, genesis) = {
            let state = self.state.lock();
            (state.latest.clone(), Arc::clone(&state.genesis))
        };
        match latest {
            Some(event) => Ok(event),
            None => genesis.resolved().await,
        }
    }
}

impl<T> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 追加序列沿链可达，earliest/latest 跟随推进。
    #[test]
    fn emit_tracks_earliest_and_latest() {
        let source = EventSource::new();
        assert!(source.earliest_event_now().is_none());

        source.emit(1u32);
        source.emit(2u32);
        let third = source.emit(3u32);

        let earliest = source.earliest_event_now().expect("present");
        assert_eq!(*earliest.payload(), 1);
        assert_eq!(source.retained_count(), 3);
        assert_eq!(*third.payload(), 3);

        let second = earliest.next_now().expect("intact").expect("resolved");
        assert_eq!(*second.payload(), 2);
    }

    /// 保留计数回收最旧事件；消费者持有的旧节点仍可继续游走。
    #[test]
    fn keep_count_discards_oldest() {
        let source = EventSource::with_keep_count(Some(2));
        let first = source.emit(1u32);
        source.emit(2u32);
        source.emit(3u32);

        assert_eq!(source.retained_count(), 2);
        let earliest = source.earliest_event_now().expect("present");
        assert_eq!(*earliest.payload(), 2);

        // 已被回收的头在消费者手里依旧有效。
        let via_old = first.next_now().expect("intact").expect("resolved");
        assert_eq!(*via_old.payload(), 2);
    }

    /// 首个事件出现前，current_event 的 Future 保持挂起并在 emit 后完成。
    #[tokio::test]
    async fn current_event_waits_for_first_emit() {
        let source = Arc::new(EventSource::new());
        let waiter = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.current_event().await }
        });
        tokio::task::yield_now().await;
        source.emit(42u32);

        let event = waiter.await.expect("join").expect("resolved");
        assert_eq!(*event.payload(), 42);
    }
}
