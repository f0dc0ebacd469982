//! 网络端点组件：把一组（接口、协议、主机名）绑定到一个具名应用。
//!
//! # 教案级说明
//! - **意图（Why）**：端点是“配置 → 运行实体”的汇聚点——应用与服务仅以
//!   名称出现在配置中，启动时才依据根组件的各管理器解析为活对象，因此
//!   替换服务或应用无需改动端点自身；
//! - **契约（What）**：`impl_start` 依次
//!   1. 按名称（附应用接口校验）解析应用；
//!   2. 按名称（附各自接口校验）解析访问日志、连接准入与字节整形服务；
//!   3. 协议需要 TLS 时向主机管理器索取主机名子集并构造 SNI 服务端配置；
//!   4. 以上述协作方构造协议牧马层，挂为子组件后显式启动；
//!   `impl_stop` 停止并摘除本轮的牧马层（每轮启动重建，支持重启）；
//! - **分发（How）**：端点自身就是牧马层的请求处理器——始终以根路径视角
//!   构造全新的 [`DispatchInfo`] 再调用应用；应用返回 `None` 由协议层翻译
//!   为 404。

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use hearth_core::component::{
    Component, ComponentCell, ComponentName, ControlContext, InterfaceId, downcast_arc,
};
use hearth_core::error::{BoxError, ConfigError};
use hearth_core::lifecycle;
use hearth_net::access::AccessLogSink;
use hearth_net::hosts::HostnamePattern;
use hearth_net::http::{
    IncomingRequest, OutgoingResponse, Protocol, ProtocolWrangler, ProtocolWranglerConfig,
    RequestHandler,
};
use hearth_net::rate::{ConnectionRateLimiter, DataRateLimiter};
use hearth_net::tcp::WranglerTimeouts;

use crate::application::{Application, DispatchInfo, HostedApplication, application_interface};
use crate::config::{EndpointConfig, EndpointServices};
use crate::error::HostingError;
use crate::root::WebappRoot;
use crate::service::{
    access_log_interface, as_access_log, as_connection_rate_limiter, as_data_rate_limiter,
    connection_rate_limiter_interface, data_rate_limiter_interface,
};

/// 端点接口标记。
pub fn endpoint_interface() -> InterfaceId {
    InterfaceId::of::<NetworkEndpoint>("NetworkEndpoint")
}

/// 网络端点组件。
pub struct NetworkEndpoint {
    cell: ComponentCell,
    name: ComponentName,
    application_name: String,
    hostname_selectors: Vec<HostnamePattern>,
    interface: SocketAddr,
    protocol: Protocol,
    max_request_body: Option<u64>,
    timeouts: WranglerTimeouts,
    service_names: EndpointServices,
    application: Mutex<Option<Arc<dyn Application>>>,
    wrangler: Mutex<Option<Arc<ProtocolWrangler>>>,
}

impl NetworkEndpoint {
    /// 由端点配置记录构造组件；所有字面量与语法验证在此一次性完成。
    pub fn from_config(config: &EndpointConfig) -> Result<Arc<Self>, ConfigError> {
        let name = ComponentName::parse(&config.name)
            .map_err(|_| ConfigError::invalid("name", format!("端点名 {:?} 非法", config.name)))?;
        let protocol = config.protocol()?;
        let interface = config.interface.to_socket_addr()?;
        let hostname_selectors = config
            .hostnames
            .clone()
            .into_vec()
            .iter()
            .map(|raw| HostnamePattern::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let max_request_body = config
            .max_request_body_size
            .as_ref()
            .map(|size| size.resolve())
            .transpose()?;
        let timeouts = match &config.socket_timeouts {
            Some(overrides) => overrides.resolve()?,
            None => WranglerTimeouts::default(),
        };
        Ok(Arc::new(Self {
            cell: ComponentCell::new(),
            name,
            application_name: config.application.clone(),
            hostname_selectors,
            interface,
            protocol,
            max_request_body,
            timeouts,
            service_names: config.services.clone(),
            application: Mutex::new(None),
            wrangler: Mutex::new(None),
        }))
    }

    /// 实际监听地址（启动后可用；`:0` 绑定后由此取回端口）。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.wrangler.lock().as_ref().and_then(|w| w.local_addr())
    }

    fn resolve_services(
        &self,
        root: &Arc<WebappRoot>,
    ) -> Result<ResolvedServices, BoxError> {
        let services = root.services();
        let access_log: Option<Arc<dyn AccessLogSink>> = match &self.service_names.access_log {
            None => None,
            Some(name) => {
                let component = services.get(name, Some(access_log_interface()))?;
                Some(as_access_log(component).ok_or_else(|| HostingError::ServiceMismatch {
                    name: name.clone(),
                    interface: "AccessLog",
                })?)
            }
        };
        let connection_gate: Option<Arc<dyn ConnectionRateLimiter>> =
            match &self.service_names.connection_rate_limiter {
                None => None,
                Some(name) => {
                    let component =
                        services.get(name, Some(connection_rate_limiter_interface()))?;
                    Some(as_connection_rate_limiter(component).ok_or_else(|| {
                        HostingError::ServiceMismatch {
                            name: name.clone(),
                            interface: "ConnectionRateLimiter",
                        }
                    })?)
                }
            };
        let data_shaper: Option<Arc<dyn DataRateLimiter>> =
            match &self.service_names.data_rate_limiter {
                None => None,
                Some(name) => {
                    let component = services.get(name, Some(data_rate_limiter_interface()))?;
                    Some(as_data_rate_limiter(component).ok_or_else(|| {
                        HostingError::ServiceMismatch {
                            name: name.clone(),
                            interface: "DataRateLimiter",
                        }
                    })?)
                }
            };
        Ok(ResolvedServices {
            access_log,
            connection_gate,
            data_shaper,
        })
    }
}

struct ResolvedServices {
    access_log: Option<Arc<dyn AccessLogSink>>,
    connection_gate: Option<Arc<dyn ConnectionRateLimiter>>,
    data_shaper: Option<Arc<dyn DataRateLimiter>>,
}

fn find_root(ctx: &Arc<ControlContext>) -> Option<Arc<WebappRoot>> {
    let mut current = Arc::clone(ctx);
    loop {
        let Some(parent) = current.parent().map(Arc::clone) else {
            break;
        };
        current = parent;
    }
    downcast_arc::<WebappRoot>(current.component()?)
}

#[async_trait]
impl Component for NetworkEndpoint {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "network-endpoint"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        Some(self.name.clone())
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![endpoint_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn impl_start(self: Arc<Self>) -> Result<(), BoxError> {
        let ctx = self
            .cell
            .context()
            .ok_or(HostingError::RootUnavailable)?;
        let root = find_root(&ctx).ok_or(HostingError::RootUnavailable)?;

        // 1. 应用解析（名称 + 接口校验 + 还原为功能对象）。
        let app_component = root
            .applications()
            .get(&self.application_name, Some(application_interface()))?;
        let hosted = downcast_arc::<HostedApplication>(app_component).ok_or_else(|| {
            HostingError::NotAnApplication {
                name: self.application_name.clone(),
            }
        })?;
        *self.application.lock() = Some(hosted.application());

        // 2. 服务解析。
        let services = self.resolve_services(&root)?;

        // 3. TLS 材料：非明文协议向主机管理器索取主机名子集。
        let tls = if self.protocol.requires_tls() {
            let subset = root.hosts().subset(&self.hostname_selectors)?;
            Some(subset.server_config(self.protocol.alpn()))
        } else {
            None
        };

        // 4. 构造、挂载并启动协议牧马层（每轮启动全新实例）。
        let wrangler = ProtocolWrangler::new(
            ProtocolWranglerConfig {
                protocol: self.protocol,
                interface: self.interface,
                max_request_body: self.max_request_body,
                timeouts: self.timeouts,
                tls,
                connection_gate: services.connection_gate,
                data_shaper: services.data_shaper,
                access_log: services.access_log,
            },
            Arc::clone(&self) as Arc<dyn RequestHandler>,
        )?;
        let wrangler_dyn: Arc<dyn Component> = Arc::clone(&wrangler) as Arc<dyn Component>;
        let self_dyn: Arc<dyn Component> = Arc::clone(&self) as Arc<dyn Component>;
        lifecycle::attach_child(&self_dyn, Arc::clone(&wrangler_dyn)).await?;
        lifecycle::start(&wrangler_dyn).await?;
        *self.wrangler.lock() = Some(wrangler);
        Ok(())
    }

    async fn impl_stop(self: Arc<Self>, will_reload: bool) -> Result<(), BoxError> {
        let wrangler = self.wrangler.lock().take();
        if let Some(wrangler) = wrangler {
            let wrangler_dyn: Arc<dyn Component> = wrangler as Arc<dyn Component>;
            lifecycle::stop(&wrangler_dyn, will_reload).await?;
            // 摘除本轮实例：下一轮启动重建全新牧马层。
            if let Some(ctx) = self.cell.context() {
                ctx.remove_child(&wrangler_dyn);
            }
        }
        if !will_reload {
            *self.application.lock() = None;
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for NetworkEndpoint {
    async fn handle_request(
        &self,
        request: IncomingRequest,
    ) -> Result<Option<OutgoingResponse>, BoxError> {
        let application = self
            .application
            .lock()
            .clone()
            .ok_or(HostingError::ApplicationUnresolved)?;
        // 端点永远以根路径视角分发（上游没有消费任何路径段）。
        let dispatch = DispatchInfo {
            extra: Vec::new(),
            path: request.pathname(),
        };
        application.handle_request(request, dispatch).await
    }
}
