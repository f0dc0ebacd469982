#![doc = r#"
# hearth-hosting

## 设计动机（Why）
- **定位**：该 crate 是 Hearth 的宿主装配层——把配置记录与应用对象装配成
  组件树（服务、应用、主机、端点四个管理器挂在 Webapp 根之下），并提供
  确定性的启动顺序与两段宽限停机编排。
- **架构角色**：依赖 `hearth-core` 的组件协议与 `hearth-net` 的牧马层；
  对外是框架使用者的主要入口。
- **设计理念**：应用与服务在配置中只以名称出现，端点启动时才经管理器
  解析为活对象并校验接口声明；替换协作方不触动端点与牧马层。

## 核心契约（What）
- **装配**：[`WebappRoot::assemble`] 一次性完成全部配置验证（主机名语法、
  字节/时长字面量、服务类别）；验证失败即启动失败，永不带病运行；
- **启动**：主机 → 服务 → 应用 → 端点，逐个等待完成；
- **停机**：端点宽限 → 应用宽限 → 服务与主机 → 全量等待，结束后输出
  结构化停机摘要。

## 使用方式（How）
```text
let root = WebappRoot::assemble(assembly, options).await?;
let root_dyn: Arc<dyn Component> = root.clone();
lifecycle::init_root(&root_dyn).await?;
lifecycle::start(&root_dyn).await?;
// ……
lifecycle::stop(&root_dyn, false).await?;
```

## 风险与考量（Trade-offs）
- **内建服务穷举**：服务组件到功能对象的还原按内建类别穷举，新增类别需
  同步扩展解析助手；
- **宽限语义**：宽限窗口只推进停机节奏，不抢占收尾中的组件。
"#]

pub mod application;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod managers;
pub mod root;
pub mod service;

pub use application::{Application, DispatchInfo, HostedApplication, application_interface};
pub use config::{
    EndpointConfig, EndpointServices, HostConfig, InterfaceConfig, MaxBodySize, OneOrMany,
    ServiceConfig, SocketTimeoutsConfig,
};
pub use endpoint::NetworkEndpoint;
pub use error::HostingError;
pub use managers::HostManager;
pub use root::{WebappAssembly, WebappRoot, WebappRootOptions};
pub use service::{
    MemoryAccessLog, TokenBucketConnectionLimiter, TokenBucketDataShaper, build_service,
};
