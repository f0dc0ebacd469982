//! 应用接口与应用承载组件。
//!
//! # 教案式说明
//! - **意图（Why）**：具体应用（静态文件、重定向等）是外部协作方；框架只
//!   约定请求处理接口与“承载组件”——后者把任意应用实现挂进组件树并打上
//!   应用接口标记，供端点按名称解析；
//! - **契约（What）**：应用收到的 `dispatch` 始终是根路径视角的全新
//!   [`DispatchInfo`]；返回 `Ok(None)` 表示未处理（上游翻译为 404），返回
//!   错误由协议层翻译为 500 并保持连接存活。

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use hearth_core::component::{Component, ComponentCell, ComponentName, InterfaceId};
use hearth_core::error::BoxError;
use hearth_net::http::{IncomingRequest, OutgoingResponse};

/// 一次分发的路径视角。
#[derive(Clone, Debug, Default)]
pub struct DispatchInfo {
    /// 上游已消费的额外路径段；端点分发时恒为空。
    pub extra: Vec<String>,
    /// 本次分发可见的路径名（origin 目标之外为 `None`）。
    pub path: Option<String>,
}

/// 应用契约。
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn handle_request(
        &self,
        request: IncomingRequest,
        dispatch: DispatchInfo,
    ) -> Result<Option<OutgoingResponse>, BoxError>;
}

/// 应用接口标记。
pub fn application_interface() -> InterfaceId {
    InterfaceId::of::<dyn Application>("Application")
}

/// 应用承载组件：把任意 [`Application`] 实现挂进组件树。
pub struct HostedApplication {
    cell: ComponentCell,
    name: ComponentName,
    inner: Arc<dyn Application>,
}

impl HostedApplication {
    pub fn new(name: ComponentName, application: Arc<dyn Application>) -> Arc<Self> {
        Arc::new(Self {
            cell: ComponentCell::new(),
            name,
            inner: application,
        })
    }

    /// 被承载的应用本体。
    pub fn application(&self) -> Arc<dyn Application> {
        Arc::clone(&self.inner)
    }
}

#[async_trait]
impl Component for HostedApplication {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "hosted-application"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![application_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
