#![doc = r#"
# hearth-core

## 设计动机（Why）
- **定位**：该 crate 提供 Hearth 自托管 Web 框架的核心原语——组件树生命周期、
  链式事件与消费任务、协作式 Threadlet 以及通用令牌桶，供网络层与宿主层
  复用。
- **架构角色**：处于依赖图最底层，不含任何套接字或协议细节；网络端点核心
  （`hearth-net`）与宿主装配（`hearth-hosting`）都以这里的契约为地基。
- **设计理念**：所有长寿命对象都是树上的组件，遵循确定性的
  `init → start → stop` 协议；所有长循环都是可协作停止的 Threadlet；所有
  节律敏感逻辑都经由可注入的时间源驱动，保证测试的确定性。

## 核心契约（What）
- **组件树**：状态机沿固定迁移图推进，非法迁移同步报错；父子拓扑唯一，
  名称自根成路径，接口查询基于显式声明的接口集合；
- **事件链**：只追加、前向单链；发射器的“至多调用一次”由移动语义保证；
  消费任务严格按链序处理并支持排空停机；
- **令牌桶**：容量 + 连续补充 + FIFO 等待队列；队列满时同步拒绝，
  `deny_all_requests` 保证无等待者悬挂。

## 实现策略（How）
- **执行框架**：完全依赖 Tokio 的任务与同步原语；长等待一律以
  `tokio::select!` 与停止信号竞赛；
- **日志**：组件上下文持有 `tracing` Span，子组件的 Span 挂在父 Span 之下，
  生命周期事件在对应 Span 上结构化记录；
- **时间**：令牌桶等节律组件经 `TimeSource`（ATU 抽象）取时与睡眠，生产
  实现为 1 ATU = 1 秒的 Tokio 时钟，测试使用手动推进的虚拟时钟。

## 风险与考量（Trade-offs）
- **协作取消**：停止信号不抢占；不检查信号的任务体只能等待其自然返回；
- **错误广播**：Threadlet 与事件链的共享结果要求错误可克隆，底层原因折叠
  为消息文本，放弃了结构化 cause 链。
"#]

pub mod bucket;
pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod threadlet;
pub mod time;

pub use bucket::{
    BucketSnapshot, GrantOutcome, GrantQuantity, TakeOutcome, TokenBucket, TokenBucketOptions,
};
pub use component::{
    Component, ComponentCell, ComponentManager, ComponentName, ComponentState, ControlContext,
    InterfaceId, NamePath,
};
pub use error::{BoxError, ChainError, ConfigError, LifecycleError, ThreadletError};
pub use event::{ChainedEvent, EventEmitter, EventSink, EventSource};
pub use threadlet::{Threadlet, ThreadletOutcome, ThreadletResult, ThreadletRunner};
pub use time::{Sleep, TimeSource, TokioTimeSource, VirtualTimeSource};

/// 生命周期驱动器的命名空间别名：`lifecycle::start(&component)` 的书写形态
/// 比根级自由函数更能表达“这是驱动器而非组件方法”。
pub mod lifecycle {
    pub use crate::component::{attach_child, init_root, start, stop, when_stopped};
}
