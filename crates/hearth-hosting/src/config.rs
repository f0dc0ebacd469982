//! 宿主配置记录：端点、主机与服务的结构化（已验证、不可变）配置。
//!
//! # 教案级说明
//! - **意图（Why）**：配置文件解析属于外部装载器；本模块只约定“装载器交付
//!   的平面记录”的形状与验证规则——未识别属性即错、缺失必需属性即错、字面
//!   量在构造期一次性解析；
//! - **契约（What）**：
//!   - [`EndpointConfig`]：`application` / `hostnames` / `interface` /
//!     `protocol` / `maxRequestBodySize` / `services` 槽位；
//!   - [`ServiceConfig`]：`class` 槽位选择服务类别（tagged enum）；
//!   - [`HostConfig`]：主机名集合 + PEM 证书材料；
//!   - 所有记录经 `deny_unknown_fields` 拒绝多余属性，反序列化完成即冻结；
//! - **注意（Trade-offs）**：字节大小与时长接受数字或 `"8 MiB"` / `"250 ms"`
//!   风格的字面量；文件描述符式 interface 引用被识别但当前拒绝。

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use hearth_core::config::{parse_byte_size, parse_duration};
use hearth_core::error::ConfigError;
use hearth_net::http::Protocol;
use hearth_net::tcp::WranglerTimeouts;

/// 接受 `"x"` 或 `["x", "y"]` 两种形态的字符串集合。
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// 时长：带单位字面量。
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct DurationLiteral(pub String);

impl DurationLiteral {
    pub fn resolve(&self, slot: &'static str) -> Result<Duration, ConfigError> {
        parse_duration(slot, &self.0)
    }
}

/// 监听位置：`{address, port}` 记录或文件描述符式引用。
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum InterfaceConfig {
    Address { address: String, port: u16 },
    FdReference(String),
}

impl InterfaceConfig {
    /// 解析为套接字地址；文件描述符引用被识别但当前不支持。
    pub fn to_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        match self {
            InterfaceConfig::Address { address, port } => {
                let ip: std::net::IpAddr = address.parse().map_err(|_| {
                    ConfigError::invalid(
                        "interface",
                        format!("监听地址 {address:?} 不是合法的 IP 地址"),
                    )
                })?;
                Ok(SocketAddr::new(ip, *port))
            }
            InterfaceConfig::FdReference(reference) => Err(ConfigError::invalid(
                "interface",
                format!("文件描述符引用 {reference:?} 暂不支持"),
            )),
        }
    }
}

/// 端点引用的服务名称集合。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EndpointServices {
    pub access_log: Option<String>,
    pub connection_rate_limiter: Option<String>,
    pub data_rate_limiter: Option<String>,
}

/// 套接字治理时序的可选覆盖。
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SocketTimeoutsConfig {
    pub idle: Option<DurationLiteral>,
    pub close_grace: Option<DurationLiteral>,
    pub half_close_grace: Option<DurationLiteral>,
}

impl SocketTimeoutsConfig {
    pub fn resolve(&self) -> Result<WranglerTimeouts, ConfigError> {
        let mut timeouts = WranglerTimeouts::default();
        if let Some(idle) = &self.idle {
            timeouts.idle = idle.resolve("socketTimeouts.idle")?;
        }
        if let Some(grace) = &self.close_grace {
            timeouts.close_grace = grace.resolve("socketTimeouts.closeGrace")?;
        }
        if let Some(grace) = &self.half_close_grace {
            timeouts.half_close_grace = grace.resolve("socketTimeouts.halfCloseGrace")?;
        }
        Ok(timeouts)
    }
}

/// 端点配置记录。
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EndpointConfig {
    pub name: String,
    pub application: String,
    #[serde(default = "default_hostnames")]
    pub hostnames: OneOrMany,
    pub interface: InterfaceConfig,
    pub protocol: String,
    pub max_request_body_size: Option<MaxBodySize>,
    #[serde(default)]
    pub services: EndpointServices,
    #[serde(default)]
    pub socket_timeouts: Option<SocketTimeoutsConfig>,
}

fn default_hostnames() -> OneOrMany {
    OneOrMany::One("*".to_string())
}

/// 请求体上限：数字（字节）或 `"8 MiB"` 字面量。
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum MaxBodySize {
    Count(u64),
    Literal(String),
}

impl MaxBodySize {
    pub fn resolve(&self) -> Result<u64, ConfigError> {
        match self {
            MaxBodySize::Count(count) => Ok(*count),
            MaxBodySize::Literal(text) => parse_byte_size("maxRequestBodySize", text),
        }
    }
}

impl EndpointConfig {
    /// 解析协议槽位。
    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        Protocol::parse(&self.protocol)
    }
}

/// 主机配置记录。
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HostConfig {
    pub hostnames: OneOrMany,
    pub certificate: String,
    pub private_key: String,
}

/// 服务配置记录；`class` 槽位选择类别。
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "class")]
pub enum ServiceConfig {
    #[serde(rename = "ConnectionRateLimiter", rename_all = "camelCase")]
    ConnectionRateLimiter {
        name: String,
        max_burst: f64,
        flow_rate: f64,
        #[serde(default)]
        initial_burst: Option<f64>,
    },

    #[serde(rename = "DataRateLimiter", rename_all = "camelCase")]
    DataRateLimiter {
        name: String,
        max_burst: f64,
        flow_rate: f64,
        #[serde(default)]
        max_waiters: Option<usize>,
    },

    #[serde(rename = "MemoryAccessLog", rename_all = "camelCase")]
    MemoryAccessLog {
        name: String,
        #[serde(default)]
        keep_count: Option<usize>,
    },
}
