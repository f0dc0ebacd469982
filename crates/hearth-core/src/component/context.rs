//! 控制上下文：组件在树中的“活体”元数据与状态条件变量。
//!
//! # 教案级说明
//! - **意图（Why）**：组件自身只承载业务行为；树位置、状态机、日志 Span、子节点
//!   列表统一收敛到控制上下文中，生命周期驱动器据此执行与校验迁移；
//! - **契约（What）**：
//!   - 上下文在 `init` 时创建并与组件互相关联（组件侧强引用上下文，上下文侧
//!     以 `Weak` 回指，避免引用环）；
//!   - 状态经 `watch` 通道广播，任何等待者都可以用谓词订阅状态变化（即
//!     状态条件变量）；
//!   - 迁移必须经 [`ControlContext::transition`]，非法迁移同步报错；
//! - **注意（Trade-offs）**：子节点列表由互斥锁保护，读取返回快照；上下文
//!   独占拥有子组件（树形所有权），组件销毁随根释放级联。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Span;

use super::component::Component;
use super::name::NamePath;
use super::state::ComponentState;
use crate::error::LifecycleError;

/// 活体控制上下文。
pub struct ControlContext {
    associate: Mutex<Option<Weak<dyn Component>>>,
    parent: Option<Arc<ControlContext>>,
    path: NamePath,
    state: watch::Sender<ComponentState>,
    span: Span,
    children: Mutex<Vec<Arc<dyn Component>>>,
    child_ordinal: AtomicUsize,
}

impl ControlContext {
    pub(crate) fn new(parent: Option<Arc<ControlContext>>, path: NamePath) -> Arc<Self> {
        let span = match parent.as_ref() {
            Some(parent_ctx) => {
                tracing::info_span!(parent: &parent_ctx.span, "component", path = %path)
            }
            None => tracing::info_span!("component", path = %path),
        };
        let (state, _) = watch::channel(ComponentState::New);
        Arc::new(Self {
            associate: Mutex::new(None),
            parent,
            path,
            state,
            span,
            children: Mutex::new(Vec::new()),
            child_ordinal: AtomicUsize::new(0),
        })
    }

    /// 当前状态。
    pub fn state(&self) -> ComponentState {
        *self.state.borrow()
    }

    /// 校验并执行状态迁移；非法迁移返回 [`LifecycleError::InvalidTransition`]。
    pub(crate) fn transition(
        &self,
        next: ComponentState,
        operation: &'static str,
    ) -> Result<(), LifecycleError> {
        let current = *self.state.borrow();
        if !current.may_become(next) {
            return Err(LifecycleError::InvalidTransition {
                path: self.path.to_string(),
                state: current,
                operation,
            });
        }
        self.state.send_replace(next);
        Ok(())
    }

    /// 等待状态满足谓词；当前值即满足时立即返回。
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(ComponentState) -> bool) {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|state| predicate(*state)).await;
    }

    /// 自根起的绝对名称路径。
    pub fn path(&self) -> &NamePath {
        &self.path
    }

    /// 组件的结构化日志 Span（父组件 Span 的子节点）。
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// 父上下文；根返回 `None`。
    pub fn parent(&self) -> Option<&Arc<ControlContext>> {
        self.parent.as_ref()
    }

    /// 子组件快照（按挂载顺序）。
    pub fn children(&self) -> Vec<Arc<dyn Component>> {
        self.children.lock().clone()
    }

    /// 回查关联的组件本体。
    pub fn component(&self) -> Option<Arc<dyn Component>> {
        self.associate.lock().as_ref()?.upgrade()
    }

    pub(crate) fn set_associate(&self, component: &Arc<dyn Component>) {
        *self.associate.lock() = Some(Arc::downgrade(component));
    }

    pub(crate) fn push_child(&self, child: Arc<dyn Component>) {
        self.children.lock().push(child);
    }

    /// 从子列表移除指定组件（按指针同一性）；返回是否确有移除。
    ///
    /// 仅供父组件在子组件停止后做树面整理（例如端点每轮启动重建牧马层）。
    pub fn remove_child(&self, child: &Arc<dyn Component>) -> bool {
        let mut children = self.children.lock();
        let before = children.len();
        children.retain(|existing| !Arc::ptr_eq(existing, child));
        children.len() != before
    }

    /// 为匿名子组件合成名称序号。
    pub(crate) fn next_ordinal(&self) -> usize {
        self.child_ordinal.fetch_add(1, Ordering::Relaxed)
    }
}

/// 初始化前的“萌芽”上下文：暂存待挂载子组件与根席位预留。
pub(crate) struct NascentContext {
    pub(crate) pending_children: Vec<Arc<dyn Component>>,
    pub(crate) is_root: bool,
}

/// 组件上下文槽位：萌芽态或活体态。
pub(crate) enum ContextSlot {
    Nascent(NascentContext),
    Live(Arc<ControlContext>),
}
