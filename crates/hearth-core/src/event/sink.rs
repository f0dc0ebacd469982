//! 事件汇：绑定链头与处理函数的消费任务，严格按链序逐个处理。
//!
//! # 教案级说明
//! - **意图（Why）**：访问日志落盘、连接事件统计等消费者需要“先追加先处理”
//!   的顺序保证与可控的停机语义；事件汇把消费循环托管在 [`Threadlet`] 上，
//!   停止协议与框架内其它长循环保持一致；
//! - **契约（What）**：
//!   - [`EventSink::run`] 启动消费循环；处理函数对每个事件被异步调用，绝不
//!     与 `emit` 同步内联；
//!   - [`EventSink::stop`] 在当前事件处理完成后尽快退出；
//!   - [`EventSink::drain_and_stop`] 进入排空模式：继续处理所有已追加（含
//!     排空期间追加）的事件，直到没有已解析的后继为止；排空标记不会泄漏到
//!     之后的运行轮次——下一次 `run` 后的普通 `stop` 不继承排空行为；
//!   - 处理函数返回错误会终止消费循环，错误经 Threadlet 结果面向 `run` /
//!     `stop` 的等待者暴露；
//! - **注意（Trade-offs)**：游标保存“已处理至”的位置，停止后再次 `run` 从
//!   中断处继续，不重复处理。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use super::chain::ChainedEvent;
use crate::error::{BoxError, ChainError};
use crate::threadlet::{Threadlet, ThreadletOutcome};

type Processor<T> =
    Arc<dyn Fn(ChainedEvent<T>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

type HeadFuture<T> = Shared<BoxFuture<'static, Result<ChainedEvent<T>, ChainError>>>;

enum Cursor<T> {
    /// 链头尚未解析（以 Future 形式绑定）。
    Pending(HeadFuture<T>),
    /// 下一个待处理事件。
    At(ChainedEvent<T>),
    /// 已处理完该事件，等待其后继。
    After(ChainedEvent<T>),
}

impl<T> Clone for Cursor<T> {
    fn clone(&self) -> Self {
        match self {
            Cursor::Pending(future) => Cursor::Pending(future.clone()),
            Cursor::At(event) => Cursor::At(event.clone()),
            Cursor::After(event) => Cursor::After(event.clone()),
        }
    }
}

struct SinkShared<T> {
    cursor: Mutex<Cursor<T>>,
    drain: AtomicBool,
    processor: Processor<T>,
}

/// 链式事件的消费任务。
pub struct EventSink<T> {
    threadlet: Threadlet,
    shared: Arc<SinkShared<T>>,
}

impl<T> EventSink<T>
where
    T: Send + Sync + 'static,
{
    /// 以已解析的链头构造事件汇。
    pub fn new<P>(head: ChainedEvent<T>, processor: P) -> Self
    where
        P: Fn(ChainedEvent<T>) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(Cursor::At(head), Arc::new(processor))
    }

    /// 以链头 Future 构造事件汇；首个事件解析前消费循环保持等待。
    pub fn from_future<F, P>(head: F, processor: P) -> Self
    where
        F: std::future::Future<Output = Result<ChainedEvent<T>, ChainError>> + Send + 'static,
        P: Fn(ChainedEvent<T>) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(Cursor::Pending(head.boxed().shared()), Arc::new(processor))
    }

    fn build(cursor: Cursor<T>, processor: Processor<T>) -> Self {
        let shared = Arc::new(SinkShared {
            cursor: Mutex::new(cursor),
            drain: AtomicBool::new(false),
            processor,
        });
        let loop_shared = Arc::clone(&shared);
        let threadlet = Threadlet::new(move |runner| {
            let shared = Arc::clone(&loop_shared);
            Box::pin(async move {
                let mut draining = false;
                loop {
                    if runner.should_stop() && !draining {
                        if shared.drain.load(Ordering::SeqCst) {
                            draining = true;
                        } else {
                            return Ok(());
                        }
                    }

                    let cursor = shared.cursor.lock().clone();
                    let event = match cursor {
                        Cursor::At(event) => event,
                        Cursor::After(previous) => {
                            if draining {
                                match previous.next_now() {
                                    Ok(Some(event)) => event,
                                    Ok(None) => return Ok(()),
                                    Err(err) => return Err(err.into()),
                                }
                            } else {
                                tokio::select! {
                                    biased;
                                    _ = runner.when_stop_requested() => continue,
                                    result = previous.next() => match result {
                                        Ok(event) => event,
                                        Err(err) => return Err(err.into()),
                                    },
                                }
                            }
                        }
                        Cursor::Pending(head) => {
                            if draining {
                                // 排空模式不再等待未解析的链头。
                                match head.peek() {
                                    Some(Ok(event)) => event.clone(),
                                    Some(Err(err)) => return Err(err.clone().into()),
                                    None => return Ok(()),
                                }
                            } else {
                                tokio::select! {
                                    biased;
                                    _ = runner.when_stop_requested() => continue,
                                    result = head.clone() => match result {
                                        Ok(event) => event,
                                        Err(err) => return Err(err.into()),
                                    },
                                }
                            }
                        }
                    };

                    (shared.processor)(event.clone()).await?;
                    *shared.cursor.lock() = Cursor::After(event);
                }
            })
        });
        Self { threadlet, shared }
    }

    /// 启动消费循环；返回本轮运行结果的共享 Future。
    ///
    /// 启动前清除排空标记：上一轮的 `drain_and_stop` 不泄漏进新一轮，
    /// 而本轮随后发出的排空请求不会被吞掉。
    pub fn run(&self) -> ThreadletOutcome {
        self.shared.drain.store(false, Ordering::SeqCst);
        self.threadlet.start()
    }

    /// 请求停止：当前事件处理完毕后尽快退出。
    pub fn stop(&self) -> ThreadletOutcome {
        self.threadlet.stop()
    }

    /// 请求排空后停止：处理完所有可达事件（含排空期间追加者）再退出。
    pub fn drain_and_stop(&self) -> ThreadletOutcome {
        self.shared.drain.store(true, Ordering::SeqCst);
        self.threadlet.stop()
    }

    /// 消费循环是否在运行。
    pub fn is_running(&self) -> bool {
        self.threadlet.is_running()
    }
}
