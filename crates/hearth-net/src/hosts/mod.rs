//! 虚拟主机层：主机名模式、绑定注册表与 SNI 解析。

mod pattern;
mod registry;

pub use pattern::HostnamePattern;
pub use registry::{HostBinding, HostRegistry};
