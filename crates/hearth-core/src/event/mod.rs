//! 链式事件原语：节点（chain）、追加容器（source）与消费任务（sink）。
//!
//! 三者协作构成“只追加、严格有序、可排空停机”的异步事件流；
//! 详细契约见各子模块的教案级注释。

mod chain;
mod sink;
mod source;

pub use chain::{ChainedEvent, EventEmitter};
pub use sink::EventSink;
pub use source::EventSource;
