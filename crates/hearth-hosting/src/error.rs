//! 宿主装配层错误域。

use thiserror::Error;

/// 端点装配与服务解析阶段的失败形态。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostingError {
    #[error("端点尚未挂载到根组件之下，无法解析协作方")]
    RootUnavailable,

    #[error("组件 {name} 不是应用承载组件")]
    NotAnApplication { name: String },

    #[error("服务 {name} 无法以 {interface} 身份使用")]
    ServiceMismatch {
        name: String,
        interface: &'static str,
    },

    #[error("应用引用尚未解析（端点未启动）")]
    ApplicationUnresolved,
}
