//! 组件管理器：同类子组件的收纳、名称解析与批量生命周期传播。
//!
//! # 教案级说明
//! - **意图（Why）**：服务、应用、端点等集合型节点共享同一管理语义——子组件
//!   必须声明指定接口、按名称唯一可查、随管理器 start/stop 批量推进；
//! - **契约（What）**：
//!   - [`ComponentManager::add_all`]：逐个校验接口并挂载；重名子组件被拒绝；
//!   - [`ComponentManager::get`]：按名称查找，可叠加接口校验；
//!   - `impl_start` 按挂载顺序逐个启动子组件；`impl_stop` 对所有运行中的
//!     子组件并行停止（顺序无要求）；
//! - **注意（Trade-offs）**：停止阶段对单个子组件的失败仅记录并继续，最后
//!   返回首个错误——树的收尾不因个别节点失败而中断。

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use super::component::{
    Component, ComponentCell, InterfaceId, attach_child, instance_of_all, start, stop,
};
use super::name::ComponentName;
use super::state::ComponentState;
use crate::error::{BoxError, LifecycleError};

/// 同类子组件的管理器。
pub struct ComponentManager {
    cell: ComponentCell,
    class_name: &'static str,
    name: Option<ComponentName>,
    required: Option<InterfaceId>,
}

impl ComponentManager {
    /// 构造管理器；`required` 为子组件必须声明的接口（可缺省）。
    pub fn new(
        class_name: &'static str,
        name: Option<ComponentName>,
        required: Option<InterfaceId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cell: ComponentCell::new(),
            class_name,
            name,
            required,
        })
    }

    /// 批量挂载子组件：先校验接口与重名，再逐个挂载（已初始化的父会级联
    /// init，运行中的父会随即 start）。
    pub async fn add_all(
        self: &Arc<Self>,
        children: Vec<Arc<dyn Component>>,
    ) -> Result<(), LifecycleError> {
        for child in children {
            if let Some(required) = self.required
                && !instance_of_all(child.as_ref(), &[required])
            {
                return Err(LifecycleError::MissingInterface {
                    path: child.class_name().to_string(),
                    interface: required.label(),
                });
            }
            if let Some(name) = child.configured_name()
                && self.lookup(name.as_str()).is_some()
            {
                return Err(LifecycleError::AlreadyAttached {
                    child: name.to_string(),
                });
            }
            let parent: Arc<dyn Component> = Arc::clone(self) as Arc<dyn Component>;
            attach_child(&parent, child).await?;
        }
        Ok(())
    }

    /// 按名称解析子组件；`required` 非空时校验其接口声明。
    pub fn get(
        &self,
        name: &str,
        required: Option<InterfaceId>,
    ) -> Result<Arc<dyn Component>, LifecycleError> {
        let Some(child) = self.lookup(name) else {
            let path = self
                .cell
                .context()
                .map(|ctx| ctx.path().to_string())
                .unwrap_or_else(|| self.class_name.to_string());
            return Err(LifecycleError::NoSuchChild {
                path,
                name: name.to_string(),
            });
        };
        if let Some(required) = required
            && !instance_of_all(child.as_ref(), &[required])
        {
            return Err(LifecycleError::MissingInterface {
                path: child.class_name().to_string(),
                interface: required.label(),
            });
        }
        Ok(child)
    }

    /// 子组件快照（挂载顺序）。
    pub fn children(&self) -> Vec<Arc<dyn Component>> {
        match self.cell.context() {
            Some(ctx) => ctx.children(),
            None => Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn Component>> {
        // 已初始化的子组件以路径末段为准；萌芽期暂存者以配置名为准。
        for child in self.children() {
            let matches = match child.cell().context() {
                Some(ctx) => ctx.path().last().as_str() == name,
                None => child
                    .configured_name()
                    .is_some_and(|n| n.as_str() == name),
            };
            if matches {
                return Some(child);
            }
        }
        None
    }
}

#[async_trait]
impl Component for ComponentManager {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        self.class_name
    }

    fn configured_name(&self) -> Option<ComponentName> {
        self.name.clone()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        for child in self.children() {
            start(&child).await?;
        }
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, will_reload: bool) -> Result<(), BoxError> {
        let running: Vec<_> = self
            .children()
            .into_iter()
            .filter(|child| child.cell().state() == ComponentState::Running)
            .collect();
        let results = join_all(
            running
                .iter()
                .map(|child| stop(child, will_reload)),
        )
        .await;

        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                tracing::warn!(error = %err, "child stop failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
