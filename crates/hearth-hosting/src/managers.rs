//! 主机管理器组件：主机名 → TLS 材料映射的生命周期宿主。
//!
//! # 教案式说明
//! - **意图（Why)**：主机绑定注册表本身是纯数据结构；管理器组件把它挂进
//!   组件树，承担配置验证、启动期可用性与（经 `ArcSwap` 的）整表热替换；
//! - **契约（What）**：
//!   - [`HostManager::from_configs`]：逐条验证主机名语法并登记绑定，重复
//!     与非法配置在构造期报错；
//!   - [`HostManager::subset`]：为端点产出按主机名选择的注册表子集；
//!   - [`HostManager::replace_registry`]：原子替换整表——已建立的连接继续
//!     持有旧表引用，新握手读取新表（RCU 语义，借鉴证书热更容器的做法）；
//! - **注意（Trade-offs）**：TLS 上下文按绑定惰性构建并缓存至绑定存续期
//!   结束；整表替换即新绑定、新缓存。

use std::any::Any;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use hearth_core::component::{Component, ComponentCell, ComponentName, InterfaceId};
use hearth_core::error::ConfigError;
use hearth_net::hosts::{HostBinding, HostRegistry, HostnamePattern};

use crate::config::HostConfig;

/// 主机管理器接口标记。
pub fn host_manager_interface() -> InterfaceId {
    InterfaceId::of::<HostManager>("HostManager")
}

/// 主机管理器组件。
pub struct HostManager {
    cell: ComponentCell,
    registry: ArcSwap<HostRegistry>,
}

impl HostManager {
    /// 由主机配置记录构造管理器；所有验证在此一次性完成。
    pub fn from_configs(configs: &[HostConfig]) -> Result<Arc<Self>, ConfigError> {
        let mut registry = HostRegistry::new();
        for config in configs {
            for hostname in config.hostnames.clone().into_vec() {
                let pattern = HostnamePattern::parse(&hostname)?;
                registry.add(HostBinding::new(
                    pattern,
                    config.certificate.clone(),
                    config.private_key.clone(),
                ))?;
            }
        }
        Ok(Arc::new(Self {
            cell: ComponentCell::new(),
            registry: ArcSwap::from_pointee(registry),
        }))
    }

    /// 当前注册表快照。
    pub fn registry(&self) -> Arc<HostRegistry> {
        self.registry.load_full()
    }

    /// 原子替换整表；返回被换下的旧表。
    pub fn replace_registry(&self, next: HostRegistry) -> Arc<HostRegistry> {
        self.registry.swap(Arc::new(next))
    }

    /// 产出被选择模式覆盖的注册表子集。
    pub fn subset(&self, selectors: &[HostnamePattern]) -> Result<Arc<HostRegistry>, ConfigError> {
        Ok(Arc::new(self.registry().make_subset(selectors)?))
    }
}

#[async_trait]
impl Component for HostManager {
    fn cell(&self) -> &ComponentCell {
        &self.cell
    }

    fn class_name(&self) -> &'static str {
        "host-manager"
    }

    fn configured_name(&self) -> Option<ComponentName> {
        ComponentName::parse("hosts").ok()
    }

    fn interfaces(&self) -> Vec<InterfaceId> {
        vec![host_manager_interface()]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
