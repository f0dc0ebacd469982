//! 组件契约与生命周期驱动器。
//!
//! # 教案级说明
//! - **意图（Why）**：所有长寿命对象统一实现 [`Component`]，由驱动器函数执行
//!   `init → start → stop` 协议：状态迁移的校验、钩子调用、子组件挂载与日志
//!   落点都集中在驱动器中，子类钩子只关心自身语义；
//! - **契约（What）**：
//!   - [`init_root`] / [`attach_child`]：建立树形拓扑并初始化；`init` 重入、
//!     一子二父、根作子均同步报错；
//!   - [`start`] 要求 `stopped`，[`stop`] 要求 `running`；钩子失败以
//!     [`LifecycleError::HookFailed`] 浮出，且先在组件 Span 上记录；
//!   - [`when_stopped`] 在 `impl_stop` 完成、状态落回 `stopped` 后解析；
//!   - 接口查询 [`instance_of_all`] 基于组件显式声明的 [`InterfaceId`] 集合，
//!     名称解析方借助 [`downcast_arc`] 还原具体类型；
//! - **注意（Trade-offs）**：没有基类继承，钩子分发走 trait + 显式驱动器；
//!   “祖先类查询”随之收敛为接口集合查询。

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::{ContextSlot, ControlContext, NascentContext};
use super::name::{ComponentName, NamePath};
use super::state::ComponentState;
use crate::error::{BoxError, LifecycleError};

/// 接口标识：以类型标识为锚点、附带稳定标签的可比对令牌。
///
/// # 契约说明（What）
/// - 同一接口 trait 经 [`InterfaceId::of`] 生成的标识彼此相等；
/// - `label` 仅用于日志与错误消息，相等性只看类型标识。
#[derive(Clone, Copy, Debug)]
pub struct InterfaceId {
    id: TypeId,
    label: &'static str,
}

impl InterfaceId {
    /// 以接口类型与稳定标签构造标识。
    pub fn of<T: ?Sized + 'static>(label: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            label,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl PartialEq for InterfaceId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InterfaceId {}

/// 组件携带的上下文槽位：萌芽态暂存待挂载子组件，活体态指向控制上下文。
pub struct ComponentCell {
    pub(crate) slot: parking_lot::Mutex<ContextSlot>,
    pub(crate) attached: std::sync::atomic::AtomicBool,
}

impl ComponentCell {
    /// 普通组件的萌芽槽位。
    pub fn new() -> Self {
        Self {
            slot: parking_lot::Mutex::new(ContextSlot::Nascent(NascentContext {
                pending_children: Vec::new(),
                is_root: false,
            })),
            attached: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// 根组件的萌芽槽位（预留根席位，拒绝被挂载为子组件）。
    pub fn new_root() -> Self {
        Self {
            slot: parking_lot::Mutex::new(ContextSlot::Nascent(NascentContext {
                pending_children: Vec::new(),
                is_root: true,
            })),
            attached: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// 活体上下文；`init` 前返回 `None`。
    pub fn context(&self) -> Option<Arc<ControlContext>> {
        match &*self.slot.lock() {
            ContextSlot::Live(ctx) => Some(Arc::clone(ctx)),
            ContextSlot::Nascent(_) => None,
        }
    }

    /// 当前状态；萌芽态视为 `new`。
    pub fn state(&self) -> ComponentState {
        match &*self.slot.lock() {
            ContextSlot::Live(ctx) => ctx.state(),
            ContextSlot::Nascent(_) => ComponentState::New,
        }
    }

    fn is_root(&self) -> bool {
        match &*self.slot.lock() {
            ContextSlot::Nascent(nascent) => nascent.is_root,
            // 已初始化者以“是否有父上下文”判定。
            ContextSlot::Live(ctx) => ctx.parent().is_none(),
        }
    }
}

impl Default for ComponentCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 生命周期受管对象的统一契约。
///
/// # 契约说明（What）
/// - `cell`：返回组件持有的上下文槽位，驱动器据此管理状态；
/// - `class_name`：稳定类名，用于合成名称与日志；
/// - `configured_name`：配置指定的名称（缺省匿名，挂载时合成）；
/// - `interfaces`：显式声明实现的接口集合，供名称解析方校验；
/// - `as_any`：向下转型入口，约定实现体恒为 `self`；
/// - `impl_init` / `impl_start` / `impl_stop`：子类钩子，由驱动器在正确的
///   状态窗口内调用；钩子自身**不得**直接操纵状态机。
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn cell(&self) -> &ComponentCell;

    fn class_name(&self) -> &'static str;

    fn configured_name(&self) -> Option<ComponentName> {
        None
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        Vec::new()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    async fn impl_init(self: Arc<Self>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
        Ok(())
    }
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("class_name", &self.class_name())
            .finish()
    }
}

/// 接口查询：要求的每个接口都必须出现在组件声明的集合中。
pub fn instance_of_all(component: &dyn Component, required: &[InterfaceId]) -> bool {
    let declared = component.interfaces();
    required.iter().all(|needed| declared.contains(needed))
}

/// 把 `Arc<dyn Component>` 还原为具体组件类型。
pub fn downcast_arc<T: Send + Sync + 'static>(component: Arc<dyn Component>) -> Option<Arc<T>> {
    component.as_any().downcast::<T>().ok()
}

/// 初始化根组件：建立根上下文并级联初始化萌芽期暂存的子组件。
pub async fn init_root(root: &Arc<dyn Component>) -> Result<(), LifecycleError> {
    let name = match root.configured_name() {
        Some(name) => name,
        None => ComponentName::parse(root.class_name())?,
    };
    init_with(root, None, name).await
}

async fn init_with(
    component: &Arc<dyn Component>,
    parent: Option<Arc<ControlContext>>,
    name: ComponentName,
) -> Result<(), LifecycleError> {
    let (ctx, pending) = {
        let mut slot = component.cell().slot.lock();
        if let ContextSlot::Live(ctx) = &*slot {
            return Err(LifecycleError::AlreadyInitialized {
                path: ctx.path().to_string(),
            });
        }
        let path = match parent.as_ref() {
            Some(parent_ctx) => parent_ctx.path().child(name),
            None => NamePath::root(name),
        };
        let ctx = ControlContext::new(parent, path);
        let pending = match std::mem::replace(&mut *slot, ContextSlot::Live(Arc::clone(&ctx))) {
            ContextSlot::Nascent(nascent) => nascent.pending_children,
            ContextSlot::Live(_) => unreachable!("checked above"),
        };
        (ctx, pending)
    };

    ctx.set_associate(component);
    ctx.transition(ComponentState::Initializing, "init")?;
    tracing::debug!(parent: ctx.span(), "initializing");

    if let Err(source) = Arc::clone(component).impl_init().await {
        tracing::error!(parent: ctx.span(), error = %source, "init hook failed");
        return Err(LifecycleError::HookFailed {
            path: ctx.path().to_string(),
            hook: "init",
            source,
        });
    }

    for child in pending {
        Box::pin(attach_to(&ctx, child)).await?;
    }

    ctx.transition(ComponentState::Stopped, "init")?;
    Ok(())
}

/// 挂载子组件。
///
/// - 父组件尚未初始化：子组件暂存于萌芽上下文，随父 `init` 一并初始化；
/// - 父组件已初始化：子组件立即初始化；父组件处于 `running` 时随即启动；
/// - 一个组件至多归属一个父组件，根组件不可被挂载。
pub async fn attach_child(
    parent: &Arc<dyn Component>,
    child: Arc<dyn Component>,
) -> Result<(), LifecycleError> {
    if child.cell().is_root() {
        return Err(LifecycleError::RootAsChild);
    }
    if child
        .cell()
        .attached
        .swap(true, std::sync::atomic::Ordering::SeqCst)
    {
        return Err(LifecycleError::AlreadyAttached {
            child: child.class_name().to_string(),
        });
    }

    let live_ctx = {
        let mut slot = parent.cell().slot.lock();
        match &mut *slot {
            ContextSlot::Nascent(nascent) => {
                nascent.pending_children.push(child.clone());
                None
            }
            ContextSlot::Live(ctx) => Some(Arc::clone(ctx)),
        }
    };
    match live_ctx {
        None => Ok(()),
        Some(ctx) => attach_to(&ctx, child).await,
    }
}

async fn attach_to(
    ctx: &Arc<ControlContext>,
    child: Arc<dyn Component>,
) -> Result<(), LifecycleError> {
    let name = match child.configured_name() {
        Some(name) => name,
        None => {
            // 匿名子组件：以类名 + 序号合成稳定名称。
            let synthesized = format!("{}-{}", child.class_name(), ctx.next_ordinal());
            ComponentName::parse(&synthesized)?
        }
    };
    ctx.push_child(child.clone());
    init_with(&child, Some(Arc::clone(ctx)), name).await?;
    if ctx.state() == ComponentState::Running {
        start(&child).await?;
    }
    Ok(())
}

/// 启动组件：要求 `stopped`；钩子失败回退到 `stopped` 并报错。
pub async fn start(component: &Arc<dyn Component>) -> Result<(), LifecycleError> {
    let ctx = live_context(component, "start")?;
    ctx.transition(ComponentState::Starting, "start")?;
    tracing::debug!(parent: ctx.span(), "starting");

    if let Err(source) = Arc::clone(component).impl_start().await {
        tracing::error!(parent: ctx.span(), error = %source, "start hook failed");
        let _ = ctx.transition(ComponentState::Stopped, "start-rollback");
        return Err(LifecycleError::HookFailed {
            path: ctx.path().to_string(),
            hook: "start",
            source,
        });
    }
    ctx.transition(ComponentState::Running, "start")?;
    tracing::debug!(parent: ctx.span(), "running");
    Ok(())
}

/// 停止组件：要求 `running`；`will_reload` 提示即将重启，钩子可跳过永久清理。
pub async fn stop(component: &Arc<dyn Component>, will_reload: bool) -> Result<(), LifecycleError> {
    let ctx = live_context(component, "stop")?;
    ctx.transition(ComponentState::Stopping, "stop")?;
    tracing::debug!(parent: ctx.span(), will_reload, "stopping");

    if let Err(source) = Arc::clone(component).impl_stop(will_reload).await {
        tracing::error!(parent: ctx.span(), error = %source, "stop hook failed");
        // 钩子失败不阻止状态落回 stopped：树的收尾必须能继续。
        let _ = ctx.transition(ComponentState::Stopped, "stop");
        return Err(LifecycleError::HookFailed {
            path: ctx.path().to_string(),
            hook: "stop",
            source,
        });
    }
    ctx.transition(ComponentState::Stopped, "stop")?;
    tracing::debug!(parent: ctx.span(), "stopped");
    Ok(())
}

/// 等待组件状态落回 `stopped`；尚未初始化的组件立即返回。
pub async fn when_stopped(component: &Arc<dyn Component>) {
    let Some(ctx) = component.cell().context() else {
        return;
    };
    ctx.wait_for_state(|state| state == ComponentState::Stopped)
        .await;
}

fn live_context(
    component: &Arc<dyn Component>,
    operation: &'static str,
) -> Result<Arc<ControlContext>, LifecycleError> {
    component.cell().context().ok_or_else(|| {
        LifecycleError::InvalidTransition {
            path: component.class_name().to_string(),
            state: ComponentState::New,
            operation,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        cell: ComponentCell,
        name: Option<ComponentName>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: Option<&str>, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                cell: ComponentCell::new(),
                name: name.map(|n| ComponentName::parse(n).unwrap()),
                log,
            })
        }

        fn as_component(self: &Arc<Self>) -> Arc<dyn Component> {
            Arc::clone(self) as Arc<dyn Component>
        }
    }

    #[async_trait]
    impl Component for Recorder {
        fn cell(&self) -> &ComponentCell {
            &self.cell
        }

        fn class_name(&self) -> &'static str {
            "recorder"
        }

        fn configured_name(&self) -> Option<ComponentName> {
            self.name.clone()
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }

        async fn impl_init(self: Arc<Self>) -> Result<(), BoxError> {
            self.log.lock().push(format!("init:{}", self.tag()));
            Ok(())
        }

        async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
            self.log.lock().push(format!("start:{}", self.tag()));
            Ok(())
        }

        async fn impl_stop(self: Arc<Self>, _will_reload: bool) -> Result<(), BoxError> {
            self.log.lock().push(format!("stop:{}", self.tag()));
            Ok(())
        }
    }

    impl Recorder {
        fn tag(&self) -> String {
            self.name
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "anon".to_string())
        }
    }

    struct RootMarker {
        cell: ComponentCell,
    }

    #[async_trait]
    impl Component for RootMarker {
        fn cell(&self) -> &ComponentCell {
            &self.cell
        }

        fn class_name(&self) -> &'static str {
            "root-marker"
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    /// init 重入被拒绝；状态沿迁移图推进。
    #[tokio::test]
    async fn init_is_single_shot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let component = Recorder::new(Some("solo"), log).as_component();
        assert_eq!(component.cell().state(), ComponentState::New);

        init_root(&component).await.expect("first init");
        assert_eq!(component.cell().state(), ComponentState::Stopped);

        let err = init_root(&component).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInitialized { .. }));
    }

    /// start 要求 stopped，stop 要求 running；非法操作同步报错。
    #[tokio::test]
    async fn transitions_follow_the_graph() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let component = Recorder::new(Some("solo"), log).as_component();

        // 未初始化即 start：非法。
        assert!(start(&component).await.is_err());

        init_root(&component).await.expect("init");
        assert!(stop(&component, false).await.is_err());

        start(&component).await.expect("start");
        assert_eq!(component.cell().state(), ComponentState::Running);
        assert!(start(&component).await.is_err());

        stop(&component, false).await.expect("stop");
        assert_eq!(component.cell().state(), ComponentState::Stopped);

        // 重启回环。
        start(&component).await.expect("restart");
        stop(&component, false).await.expect("stop again");
    }

    /// 萌芽期暂存的子组件在父 init 时初始化；运行中的父立即 init+start 新子。
    #[tokio::test]
    async fn children_queue_then_attach() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = Recorder::new(Some("parent"), Arc::clone(&log)).as_component();
        let early = Recorder::new(Some("early"), Arc::clone(&log)).as_component();
        let late = Recorder::new(Some("late"), Arc::clone(&log)).as_component();

        attach_child(&parent, early).await.expect("queue on nascent");
        init_root(&parent).await.expect("init");
        assert_eq!(
            *log.lock(),
            vec!["init:parent".to_string(), "init:early".to_string()],
        );

        start(&parent).await.expect("start");
        attach_child(&parent, late).await.expect("attach to running");
        let entries = log.lock().clone();
        assert!(entries.contains(&"init:late".to_string()));
        assert!(entries.contains(&"start:late".to_string()));
    }

    /// 一子二父与根作子均被拒绝。
    #[tokio::test]
    async fn topology_violations_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent_a = Recorder::new(Some("a"), Arc::clone(&log)).as_component();
        let parent_b = Recorder::new(Some("b"), Arc::clone(&log)).as_component();
        let child = Recorder::new(Some("c"), Arc::clone(&log)).as_component();

        attach_child(&parent_a, child.clone()).await.expect("first");
        let err = attach_child(&parent_b, child).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyAttached { .. }));

        let root = Arc::new(RootMarker {
            cell: ComponentCell::new_root(),
        }) as Arc<dyn Component>;
        let err = attach_child(&parent_a, root).await.unwrap_err();
        assert!(matches!(err, LifecycleError::RootAsChild));
    }

    /// when_stopped 在 impl_stop 完成后解析。
    #[tokio::test]
    async fn when_stopped_resolves_after_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let component = Recorder::new(Some("solo"), Arc::clone(&log)).as_component();
        init_root(&component).await.expect("init");
        start(&component).await.expect("start");

        let waiter = tokio::spawn({
            let component = component.clone();
            async move { when_stopped(&component).await }
        });
        tokio::task::yield_now().await;

        stop(&component, false).await.expect("stop");
        waiter.await.expect("join");
        assert!(log.lock().contains(&"stop:solo".to_string()));
    }
}
