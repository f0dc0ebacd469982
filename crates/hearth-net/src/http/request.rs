//! 入站请求模型：伪头、目标分类、懒解析 Cookie 与体积受限的请求体。
//!
//! # 教案级说明
//! - **意图（Why）**：应用层不应关心 HTTP/1 与 HTTP/2 的表示差异；请求模型把
//!   两者折叠为同一形态——HTTP/1 的 `:authority` / `:scheme` 由 Host 头与请求
//!   行合成；
//! - **契约（What）**：
//!   - 请求目标按五类分类（origin / asterisk / absolute / authority / other），
//!     origin 目标进一步产出规范化路径分量与查询串；
//!   - 头部映射大小写不敏感，`set-cookie` 保留多值槽位；Cookie 首次访问时
//!     惰性解析；
//!   - 请求体带上限包装：声明长度超限在分发前即 413，流式超限在读取时以
//!     [`BodyError::TooLarge`] 失败；
//!   - 每个请求携带自连接日志派生的稳定标识（连接号-序号）。

use std::net::SocketAddr;
use std::sync::OnceLock;

use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use thiserror::Error;
use tracing::Span;

use super::headers;

/// 请求体读取失败。
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("请求体超出配置上限")]
    TooLarge,

    #[error("请求体读取失败: {0}")]
    Read(String),
}

/// 请求目标的五类分类。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestTarget {
    /// 以 `/` 开头的 origin-form：规范化路径分量 + 查询串（不含 `?`）。
    Origin {
        components: Vec<String>,
        search: String,
    },
    /// 独立 `*`（如 `OPTIONS *`）。
    Asterisk,
    /// 带 scheme 的绝对形式。
    Absolute(String),
    /// 仅 `host:port` 的 authority 形式。
    Authority(String),
    /// 其余无法归类的形态。
    Other(String),
}

impl RequestTarget {
    /// 对请求行目标做分类。
    pub fn classify(raw: &str) -> RequestTarget {
        if raw == "*" {
            return RequestTarget::Asterisk;
        }
        if let Some(rest) = raw.strip_prefix('/') {
            let (path, search) = match rest.split_once('?') {
                Some((path, search)) => (path, search.to_string()),
                None => (rest, String::new()),
            };
            let components = path
                .split('/')
                .filter(|segment| !segment.is_empty() && *segment != ".")
                .map(str::to_string)
                .collect();
            return RequestTarget::Origin { components, search };
        }
        if raw.contains("://") {
            return RequestTarget::Absolute(raw.to_string());
        }
        if !raw.contains('/') && raw.parse::<http::uri::Authority>().is_ok() {
            return RequestTarget::Authority(raw.to_string());
        }
        RequestTarget::Other(raw.to_string())
    }

    /// origin 目标重建的路径名（`/a/b` 形态）。
    pub fn pathname(&self) -> Option<String> {
        match self {
            RequestTarget::Origin { components, .. } => {
                if components.is_empty() {
                    Some("/".to_string())
                } else {
                    Some(format!("/{}", components.join("/")))
                }
            }
            _ => None,
        }
    }
}

/// 权威主机信息：authority 解析结果，端口缺省回退到本地监听端口。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    pub port: u16,
}

/// 统一的入站请求。
pub struct IncomingRequest {
    pub id: String,
    pub protocol_name: &'static str,
    pub method: Method,
    pub scheme: &'static str,
    pub authority: Option<String>,
    pub raw_target: String,
    pub target: RequestTarget,
    pub headers: HeaderMap,
    pub origin: SocketAddr,
    pub host: HostInfo,
    pub span: Span,
    body: Option<Limited<Incoming>>,
    cookies: OnceLock<Vec<(String, String)>>,
}

/// HTTP 版本到协议名的稳定映射。
pub(crate) fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "http-0.9",
        Version::HTTP_10 => "http-1.0",
        Version::HTTP_11 => "http-1.1",
        Version::HTTP_2 => "http-2.0",
        Version::HTTP_3 => "http-3.0",
        _ => "http-unknown",
    }
}

impl IncomingRequest {
    /// 由 hyper 请求与连接元数据装配统一模型。
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        request: http::Request<Incoming>,
        id: String,
        scheme: &'static str,
        origin: SocketAddr,
        local_port: u16,
        max_body: Option<u64>,
        span: Span,
    ) -> Self {
        let (parts, body) = request.into_parts();
        let raw_target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.to_string());

        // HTTP/2 从 `:authority` 取权威；HTTP/1 由 Host 头合成。
        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        let host = parse_host(authority.as_deref(), local_port);

        let limit = max_body.map(|max| max as usize).unwrap_or(usize::MAX);
        Self {
            id,
            protocol_name: protocol_name(parts.version),
            method: parts.method,
            scheme,
            authority,
            target: RequestTarget::classify(&raw_target),
            raw_target,
            headers: parts.headers,
            origin,
            host,
            span,
            body: Some(Limited::new(body, limit)),
            cookies: OnceLock::new(),
        }
    }

    /// 请求的规范化路径名（非 origin 目标返回 `None`）。
    pub fn pathname(&self) -> Option<String> {
        self.target.pathname()
    }

    /// 按单值清单规整读取头部文本。
    pub fn header_str(&self, name: &http::header::HeaderName) -> Option<String> {
        headers::normalized_value(&self.headers, name)
    }

    /// 惰性解析的 Cookie 列表（保持出现顺序）。
    pub fn cookies(&self) -> &[(String, String)] {
        self.cookies.get_or_init(|| {
            let Some(raw) = self
                .headers
                .get(http::header::COOKIE)
                .and_then(|v| v.to_str().ok())
            else {
                return Vec::new();
            };
            raw.split(';')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    let key = key.trim();
                    if key.is_empty() {
                        return None;
                    }
                    Some((key.to_string(), value.trim().to_string()))
                })
                .collect()
        })
    }

    /// 取走并收集完整请求体；超限以 [`BodyError::TooLarge`] 失败。
    pub async fn collect_body(&mut self) -> Result<Bytes, BodyError> {
        let Some(body) = self.body.take() else {
            return Ok(Bytes::new());
        };
        match body.collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(err) => {
                if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                    Err(BodyError::TooLarge)
                } else {
                    Err(BodyError::Read(err.to_string()))
                }
            }
        }
    }
}

fn parse_host(authority: Option<&str>, local_port: u16) -> HostInfo {
    match authority {
        Some(raw) => match raw.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() => match port.parse::<u16>() {
                Ok(port) => HostInfo {
                    name: name.to_string(),
                    port,
                },
                Err(_) => HostInfo {
                    name: raw.to_string(),
                    port: local_port,
                },
            },
            _ => HostInfo {
                name: raw.to_string(),
                port: local_port,
            },
        },
        None => HostInfo {
            name: String::new(),
            port: local_port,
        },
    }
}
