//! Webapp 根组件：四大管理器的装配与有序启停编排。
//!
//! # 教案级说明
//! - **意图（Why）**：根是组件树的唯一入口，负责把“配置记录 + 应用对象”
//!   装配成固定形态的树（服务、应用、主机、端点四个管理器），并以确定性的
//!   顺序推进整树的启动与停机；
//! - **契约（What）**：
//!   - 子组件固定顺序：服务管理器、应用管理器、主机管理器、端点管理器
//!     （该顺序定义依赖方向）；
//!   - 启动顺序：主机 → 服务 → 应用 → 端点，逐个等待完成；
//!   - 停机序列：
//!     1. 请求端点停机，与宽限窗口（默认 250 ms）竞赛；
//!     2. 请求应用停机，与第二个宽限窗口竞赛；
//!     3. 停止服务与主机，等待全部四个管理器落回 stopped；
//!   - 停机结束后在根 Span 上输出各阶段耗时的结构化摘要；
//! - **注意（Trade-offs）**：宽限窗口只决定“何时开始下一阶段”，不抢占仍在
//!   收尾的组件——最终一致由第 3 步的全量等待保证。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant as TokioInstant;

use hearth_core::component::{
    Component, ComponentCell, ComponentManager, ComponentName, downcast_arc,
};
use hearth_core::error::BoxError;
use hearth_core::lifecycle;
use hearth_core::time::{TimeSource, TokioTimeSource};

use crate::application::{Application, HostedApplication, application_interface};
use crate::config::{EndpointConfig, HostConfig, ServiceConfig};
use crate::endpoint::NetworkEndpoint;
use crate::managers::HostManager;
use crate::service::build_service;

/// 根装配输入：配置记录 + 以代码交付的应用对象。
pub struct WebappAssembly {
    pub hosts: Vec<HostConfig>,
    pub services: Vec<ServiceConfig>,
    pub applications: Vec<(String, Arc<dyn Application>)>,
    pub endpoints: Vec<EndpointConfig>,
}

/// 根行为参数。
pub struct WebappRootOptions {
    /// 端点与应用停机各自的宽限窗口。
    pub stop_grace: Duration,
    /// 注入限流服务的时间源。
    pub time_source: Arc<dyn TimeSource>,
}

impl Default for WebappRootOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(250),
            time_source: Arc::new(TokioTimeSource::new()),
        }
    }
}

/// Webapp 根组件。
pub struct WebappRoot {
    cell: ComponentCell,
    services: Arc<ComponentManager>,
    applications: Arc<ComponentManager>,
    hosts: Arc<HostManager>,
    endpoints: Arc<ComponentManager>,
    stop_grace: Duration,
}

impl WebappRoot {
    /// 装配根组件：创建四个管理器并按固定顺序挂载全部子内容。
    ///
    /// 返回的根尚未初始化；调用方随后执行
    /// `lifecycle::init_root` 与 `lifecycle::start`。
    pub async fn assemble(
        assembly: WebappAssembly,
        options: WebappRootOptions,
    ) -> Result<Arc<Self>, BoxError> {
        let services = ComponentManager::new(
            "service-manager",
            ComponentName::parse("services").ok(),
            None,
        );
        let applications = ComponentManager::new(
            "application-manager",
            ComponentName::parse("applications").ok(),
            Some(application_interface()),
        );
        let hosts = HostManager::from_configs(&assembly.hosts)?;
        let endpoints = ComponentManager::new(
            "endpoint-manager",
            ComponentName::parse("endpoints").ok(),
            None,
        );

        let root = Arc::new(Self {
            cell: ComponentCell::new_root(),
            services: Arc::clone(&services),
            applications: Arc::clone(&applications),
            hosts: Arc::clone(&hosts),
            endpoints: Arc::clone(&endpoints),
            stop_grace: options.stop_grace,
        });
        let root_dyn: Arc<dyn Component> = Arc::clone(&root) as Arc<dyn Component>;

        // 固定子顺序（定义依赖方向）：服务、应用、主机、端点。
        lifecycle::attach_child(&root_dyn, Arc::clone(&services) as Arc<dyn Component>).await?;
        lifecycle::attach_child(&root_dyn, Arc::clone(&applications) as Arc<dyn Component>)
            .await?;
        lifecycle::attach_child(&root_dyn, Arc::clone(&hosts) as Arc<dyn Component>).await?;
        lifecycle::attach_child(&root_dyn, Arc::clone(&endpoints) as Arc<dyn Component>).await?;

        for config in assembly.services {
            services
                .add_all(vec![build_service(config, &options.time_source)?])
                .await?;
        }
        for (name, application) in assembly.applications {
            let component_name = ComponentName::parse(&name)?;
            applications
                .add_all(vec![
                    HostedApplication::new(component_name, application) as Arc<dyn Component>,
                ])
                .await?;
        }
        for config in assembly.endpoints {
            endpoints
                .add_all(vec![NetworkEndpoint::from_config(&config)? as Arc<dyn Component>])
                .await?;
        }
        Ok(root)
    }

    pub fn services(&self) -> &Arc<ComponentManager> {
        &self.services
    }

    pub fn applications(&self) -> &Arc<ComponentManager> {
        &self.applications
    }

    pub fn hosts(&self) -> &Arc<HostManager> {
        &self.hosts
    }

    pub fn endpoints(&self) -> &Arc<ComponentManager> {
        &self.endpoints
    }

    /// 按名称取回端点组件（测试与诊断用）。
    pub fn endpoint(&self, name: &str) -> Option<Arc<NetworkEndpoint>> {
        let component = self.endpoints.get(name, None).ok()?;
        downcast_arc::<NetworkEndpoint>(component)
    }

    fn manager_handles(&self) -> [(&'static str, Arc<dyn Component>); 4] {
        [
            ("hosts", Arc::clone(&self.hosts) as Arc<dyn Component>),
            ("services", Arc::clone(&self.services) as Arc<dyn Component>),
            (
                "applications",
                Arc::clone(&self.applications) as Arc<dyn Component>,
            ),
            ("endpoints", Arc::clone(&self.endpoints) as Arc<dyn Component>),
        ]
    }
}

#[async_trait]
impl Component for WebappRoot {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "webapp-root"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        ComponentName::parse("webapp").ok()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        // 启动顺序：主机 → 服务 → 应用 → 端点，逐个等待。
        for (label, manager) in self.manager_handles() {
            lifecycle::start(&manager).await?;
            tracing::debug!(manager = label, "manager started");
        }
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, will_reload: bool) -> Result<(), BoxError> {
        let span = self
            .cell
            .context()
            .map(|ctx| ctx.span().clone())
            .unwrap_or_else(tracing::Span::none);
        let started = TokioInstant::now();

        let endpoints: Arc<dyn Component> = Arc::clone(&self.endpoints) as Arc<dyn Component>;
        let applications: Arc<dyn Component> =
            Arc::clone(&self.applications) as Arc<dyn Component>;
        let services: Arc<dyn Component> = Arc::clone(&self.services) as Arc<dyn Component>;
        let hosts: Arc<dyn Component> = Arc::clone(&self.hosts) as Arc<dyn Component>;

        // 1. 请求端点停机，与宽限窗口竞赛。
        let endpoint_stop = tokio::spawn({
            let endpoints = Arc::clone(&endpoints);
            async move {
                if let Err(err) = lifecycle::stop(&endpoints, will_reload).await {
                    tracing::warn!(error = %err, "endpoint manager stop failed");
                }
            }
        });
        tokio::select! {
            _ = lifecycle::when_stopped(&endpoints) => {}
            _ = tokio::time::sleep(self.stop_grace) => {
                tracing::warn!(parent: &span, "endpoints exceeded stop grace window");
            }
        }

        // 2. 请求应用停机，与第二个宽限窗口竞赛。
        let application_stop = tokio::spawn({
            let applications = Arc::clone(&applications);
            async move {
                if let Err(err) = lifecycle::stop(&applications, will_reload).await {
                    tracing::warn!(error = %err, "application manager stop failed");
                }
            }
        });
        tokio::select! {
            _ = lifecycle::when_stopped(&applications) => {}
            _ = tokio::time::sleep(self.stop_grace) => {
                tracing::warn!(parent: &span, "applications exceeded stop grace window");
            }
        }

        // 3. 停止服务与主机，并等待四者全部落回 stopped。
        if let Err(err) = lifecycle::stop(&services, will_reload).await {
            tracing::warn!(error = %err, "service manager stop failed");
        }
        if let Err(err) = lifecycle::stop(&hosts, will_reload).await {
            tracing::warn!(error = %err, "host manager stop failed");
        }
        lifecycle::when_stopped(&endpoints).await;
        lifecycle::when_stopped(&applications).await;
        let _ = endpoint_stop.await;
        let _ = application_stop.await;

        tracing::info!(
            parent: &span,
            elapsed_ms = started.elapsed().as_millis() as u64,
            will_reload,
            "webapp root stopped",
        );
        Ok(())
    }
}
