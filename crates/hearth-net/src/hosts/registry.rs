//! 主机绑定注册表：主机名 → TLS 材料的有序映射与 SNI 解析。
//!
//! # 教案级说明
//! - **意图（Why）**：一个进程可为多个虚拟主机持有不同证书；TLS 握手期间
//!   需要按 SNI 即时选出最具体的绑定，且证书解析成本只应支付一次；
//! - **契约（What）**：
//!   - [`HostRegistry::add`]：校验模式并登记，重复模式被拒绝；
//!   - [`HostRegistry::find_context`]：最长后缀（最具体）匹配——精确绑定
//!     优先于同位置的通配绑定；证书构建失败记录日志并按“无证书”处理，
//!     绝不从解析路径抛出（SNI 回调契约）；
//!   - [`HostRegistry::make_subset`]：按选择模式产出共享绑定的新注册表，
//!     任一选择模式无匹配即报错；
//!   - 每个绑定的 TLS 上下文在启动后的首次使用时惰性构建，并在绑定存续期
//!     内缓存（`OnceLock`），订阅注册表的各端共享同一份材料；
//! - **注意（Trade-offs）**：绑定列表为构建期固定的向量，查找为线性扫描——
//!   虚拟主机数量级下无需前缀树；热更新经由宿主层重建注册表完成。

use std::fmt;
use std::sync::{Arc, OnceLock};

use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use hearth_core::error::ConfigError;

use super::pattern::HostnamePattern;
use crate::error::NetError;

/// 单个主机绑定：模式 + PEM 证书材料 + 惰性构建的 TLS 上下文。
pub struct HostBinding {
    pattern: HostnamePattern,
    certificate_pem: String,
    private_key_pem: String,
    context: OnceLock<Result<Arc<CertifiedKey>, String>>,
}

impl HostBinding {
    /// 以模式与 PEM 文本构造绑定；证书在首次使用时才解析。
    pub fn new(
        pattern: HostnamePattern,
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Self {
        Self {
            pattern,
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
            context: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &HostnamePattern {
        &self.pattern
    }

    /// 惰性构建（并缓存）本绑定的 TLS 上下文。
    pub fn tls_context(&self) -> Result<Arc<CertifiedKey>, NetError> {
        let cached = self.context.get_or_init(|| {
            build_certified_key(&self.certificate_pem, &self.private_key_pem)
                .map(Arc::new)
                .map_err(|reason| reason.to_string())
        });
        match cached {
            Ok(context) => Ok(Arc::clone(context)),
            Err(reason) => Err(NetError::bad_certificate(reason.clone())),
        }
    }
}

impl fmt::Debug for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBinding")
            .field("pattern", &self.pattern.to_string())
            .field("resolved", &self.context.get().map(|r| r.is_ok()))
            .finish_non_exhaustive()
    }
}

fn build_certified_key(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, String> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("证书链解析失败: {err}"))?;
    if certs.is_empty() {
        return Err("证书链为空".to_string());
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|err| format!("私钥解析失败: {err}"))?
        .ok_or_else(|| "未找到私钥".to_string())?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|err| format!("私钥类型不受支持: {err}"))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// 主机绑定注册表。
#[derive(Default)]
pub struct HostRegistry {
    bindings: Vec<Arc<HostBinding>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记绑定；与既有绑定模式重复时报错。
    pub fn add(&mut self, binding: HostBinding) -> Result<(), ConfigError> {
        if self
            .bindings
            .iter()
            .any(|existing| existing.pattern() == binding.pattern())
        {
            return Err(ConfigError::invalid(
                "hostname",
                format!("主机绑定 {} 重复", binding.pattern()),
            ));
        }
        self.bindings.push(Arc::new(binding));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[Arc<HostBinding>] {
        &self.bindings
    }

    /// 选出主机名的最具体绑定：精确 ≻ 部分通配 ≻ 全通配。
    pub fn find_binding(&self, hostname: &str) -> Option<&Arc<HostBinding>> {
        self.bindings
            .iter()
            .filter(|binding| binding.pattern().matches(hostname))
            .max_by_key(|binding| {
                (
                    binding.pattern().specificity(),
                    !binding.pattern().has_wildcard(),
                )
            })
    }

    /// 解析主机名对应的 TLS 上下文；证书构建失败记录日志并返回 `None`。
    pub fn find_context(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let binding = self.find_binding(hostname)?;
        match binding.tls_context() {
            Ok(context) => Some(context),
            Err(err) => {
                tracing::warn!(
                    hostname,
                    pattern = %binding.pattern(),
                    error = %err,
                    "host certificate unavailable",
                );
                None
            }
        }
    }

    /// 全通配绑定的 TLS 上下文（供未携带 SNI 的客户端回退）。
    pub fn full_wildcard_context(&self) -> Option<Arc<CertifiedKey>> {
        let binding = self
            .bindings
            .iter()
            .find(|binding| binding.pattern().is_full_wildcard())?;
        match binding.tls_context() {
            Ok(context) => Some(context),
            Err(err) => {
                tracing::warn!(error = %err, "wildcard host certificate unavailable");
                None
            }
        }
    }

    /// 产出被选择模式覆盖的绑定子集（共享底层绑定与惰性上下文）。
    ///
    /// 任一选择模式没有匹配到绑定即报错。
    pub fn make_subset(&self, selectors: &[HostnamePattern]) -> Result<HostRegistry, ConfigError> {
        let mut subset = HostRegistry::new();
        for selector in selectors {
            let mut matched = false;
            for binding in &self.bindings {
                if selector.covers(binding.pattern()) {
                    matched = true;
                    if !subset
                        .bindings
                        .iter()
                        .any(|existing| existing.pattern() == binding.pattern())
                    {
                        subset.bindings.push(Arc::clone(binding));
                    }
                }
            }
            if !matched {
                return Err(ConfigError::invalid(
                    "hostnames",
                    format!("主机名 {selector} 未匹配任何已配置的主机绑定"),
                ));
            }
        }
        Ok(subset)
    }

    /// 以本注册表构造 rustls 服务端配置（SNI 解析 + ALPN 列表）。
    pub fn server_config(self: &Arc<Self>, alpn: &[&[u8]]) -> Arc<ServerConfig> {
        static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();
        CRYPTO_PROVIDER.get_or_init(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                registry: Arc::clone(self),
            }));
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        Arc::new(config)
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// rustls SNI 回调：握手线程同步调用，错误一律折叠为“无证书”。
#[derive(Debug)]
struct SniResolver {
    registry: Arc<HostRegistry>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => self.registry.find_context(name),
            // 未携带 SNI：存在全通配绑定时以其兜底。
            None => self.registry.full_wildcard_context(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(raw: &str) -> HostnamePattern {
        HostnamePattern::parse(raw).unwrap()
    }

    fn registry_of(patterns: &[&str]) -> HostRegistry {
        let mut registry = HostRegistry::new();
        for raw in patterns {
            registry
                .add(HostBinding::new(pattern(raw), "", ""))
                .unwrap();
        }
        registry
    }

    /// 最具体匹配：精确 ≻ 部分通配 ≻ 全通配。
    #[test]
    fn find_binding_prefers_most_specific() {
        let registry = registry_of(&["a.example", "*.example", "*"]);

        let exact = registry.find_binding("a.example").unwrap();
        assert_eq!(exact.pattern().to_string(), "a.example");

        let wild = registry.find_binding("b.example").unwrap();
        assert_eq!(wild.pattern().to_string(), "*.example");

        let any = registry.find_binding("other.host").unwrap();
        assert_eq!(any.pattern().to_string(), "*");
    }

    /// 重复绑定在登记期被拒绝。
    #[test]
    fn duplicate_bindings_are_rejected() {
        let mut registry = registry_of(&["a.example"]);
        let err = registry
            .add(HostBinding::new(pattern("a.example"), "", ""))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    /// 子集：命中的绑定共享引用；无匹配的选择模式报错。
    #[test]
    fn make_subset_selects_and_validates() {
        let registry = registry_of(&["a.example", "b.example", "*.example"]);

        let subset = registry
            .make_subset(&[pattern("a.example"), pattern("*.example")])
            .unwrap();
        // `*.example` 覆盖 a.example 与 b.example 两个精确绑定，加上自身。
        assert_eq!(subset.len(), 3);

        let err = registry.make_subset(&[pattern("missing.host")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    /// 证书材料非法时解析路径不恐慌，返回 None。
    #[test]
    fn broken_certificate_resolves_to_none() {
        let registry = registry_of(&["a.example"]);
        assert!(registry.find_context("a.example").is_none());
    }
}
