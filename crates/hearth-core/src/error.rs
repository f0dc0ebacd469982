//! 核心错误域：生命周期、配置、事件链与协作任务的稳定错误形态。
//!
//! # 教案式说明
//! - **意图（Why）**：框架内的错误分为“致命于所在作用域”（配置、生命周期协议、
//!   事件链损坏）与“局部可恢复”（准入拒绝、协议错误等，由上层 crate 定义）两类；
//!   本模块承载前者，保证错误码与语义在跨 crate 传播时保持稳定。
//! - **契约（What）**：所有枚举变体均携带足以定位问题的上下文（组件路径、配置槽位、
//!   钩子名称）；`ChainError` 与 `ThreadletError` 额外要求 `Clone`，以便共享型
//!   Future（`Shared`）与被污染的链位可以向多个读者重复返回同一原因。
//! - **注意（Trade-offs）**：`Clone` 约束迫使底层原因以消息文本形式保存，放弃了
//!   `source()` 链路；换取的是错误可以安全地驻留在 `OnceLock`/`Shared` 中。

use thiserror::Error;

use crate::component::ComponentState;

/// 跨组件边界传播的动态错误形态，供 `_impl_*` 钩子与请求处理器使用。
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 生命周期协议错误：`init` 重入、非法状态迁移、父子拓扑违规。
///
/// # 设计背景（Why）
/// - 生命周期协议错误在其作用域内不可恢复，必须以同步、
///   显式的方式抛给调用方，而不是退化为日志；
/// - 错误信息中统一携带组件的绝对名称路径，使排障者无需还原调用栈即可定位节点。
///
/// # 契约说明（What）
/// - `InvalidTransition`：当前状态不允许请求的操作（例如 `start` 时并非 `stopped`）；
/// - `AlreadyInitialized`：`init` 被重复调用；
/// - `AlreadyAttached` / `RootAsChild`：父子拓扑约束被破坏；
/// - `HookFailed`：子类钩子返回错误，携带底层原因。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("组件 {path} 已完成初始化，拒绝重复 init")]
    AlreadyInitialized { path: String },

    #[error("组件 {path} 处于 {state} 状态，无法执行 {operation}")]
    InvalidTransition {
        path: String,
        state: ComponentState,
        operation: &'static str,
    },

    #[error("组件 {child} 已经归属于其它父组件")]
    AlreadyAttached { child: String },

    #[error("根组件不允许作为子组件挂载")]
    RootAsChild,

    #[error("名称 {name:?} 不满足组件命名语法")]
    InvalidName { name: String },

    #[error("在 {path} 下找不到名为 {name} 的子组件")]
    NoSuchChild { path: String, name: String },

    #[error("组件 {path} 未声明所需接口 {interface}")]
    MissingInterface {
        path: String,
        interface: &'static str,
    },

    #[error("组件 {path} 的 {hook} 钩子执行失败: {source}")]
    HookFailed {
        path: String,
        hook: &'static str,
        #[source]
        source: BoxError,
    },
}

/// 配置验证错误：构造期一次性暴露，永不恢复。
///
/// # 契约说明（What）
/// - `MissingProperty` / `ExtraProperty`：结构化记录缺槽位或带未识别槽位；
/// - `InvalidValue`：槽位存在但取值非法，`message` 面向排障者描述原因。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("配置缺少必需属性 {slot}")]
    MissingProperty { slot: &'static str },

    #[error("配置携带未识别的属性 {slot}")]
    ExtraProperty { slot: String },

    #[error("配置属性 {slot} 取值非法: {message}")]
    InvalidValue { slot: &'static str, message: String },
}

impl ConfigError {
    /// 以槽位名与格式化消息构造 `InvalidValue` 的便捷入口。
    pub fn invalid(slot: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            slot,
            message: message.into(),
        }
    }
}

/// 事件链错误：发射器独占性与异步后继损坏。
///
/// # 设计背景（Why）
/// - 链位一旦因异步后继解析失败而“污染”，后续所有读取都必须返回同一原因；
///   为此变体保持 `Clone`，原因以不可变文本保存。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainError {
    #[error("事件节点的发射器已被取走")]
    EmitterTaken,

    #[error("该事件视图不具备发射能力")]
    EmitterUnavailable,

    #[error("异步后继解析失败: {0}")]
    Broken(std::sync::Arc<str>),
}

impl ChainError {
    /// 以任意错误原因构造 `Broken`，原因被折叠为文本以满足 `Clone` 约束。
    pub fn broken(reason: impl std::fmt::Display) -> Self {
        ChainError::Broken(std::sync::Arc::from(reason.to_string().as_str()))
    }
}

/// 协作任务（Threadlet）的统一失败形态。
///
/// # 契约说明（What）
/// - `Start`：启动函数返回错误，主函数不会被调度；
/// - `Main`：主函数返回错误；
/// - `Panicked`：任务体触发 panic，由运行时捕获后映射而来。
///
/// # 风险提示（Trade-offs）
/// - 为了让结果可以通过 `Shared` Future 广播给 `start()` 与 `stop()` 的全部
///   调用方，底层原因以消息文本保存，放弃了结构化 cause 链。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ThreadletError {
    #[error("threadlet start hook failed: {0}")]
    Start(std::sync::Arc<str>),

    #[error("threadlet main failed: {0}")]
    Main(std::sync::Arc<str>),

    #[error("threadlet panicked")]
    Panicked,
}

impl ThreadletError {
    pub(crate) fn start(err: &BoxError) -> Self {
        ThreadletError::Start(std::sync::Arc::from(err.to_string().as_str()))
    }

    pub(crate) fn main(err: &BoxError) -> Self {
        ThreadletError::Main(std::sync::Arc::from(err.to_string().as_str()))
    }
}

/// 令牌桶构造参数错误的便捷别名，复用配置错误域。
pub type BucketConfigError = ConfigError;
