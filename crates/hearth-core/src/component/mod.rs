//! 组件树：生命周期状态机、父子拓扑、命名与接口查询。
//!
//! 子模块分工：`state`（状态枚举与迁移图）、`name`（名称语法与根起路径）、
//! `context`（萌芽/活体上下文）、`component`（组件契约与生命周期驱动器）、
//! `manager`（同类子组件的管理器）。

mod component;
mod context;
mod manager;
mod name;
mod state;

pub use component::{
    Component, ComponentCell, InterfaceId, attach_child, downcast_arc, init_root,
    instance_of_all, start, stop, when_stopped,
};
pub use context::ControlContext;
pub use manager::ComponentManager;
pub use name::{ComponentName, NamePath};
pub use state::ComponentState;
