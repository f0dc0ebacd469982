//! 主机名模式：DNS 标签语法、通配规则与最长后缀匹配的基础判定。
//!
//! # 教案式说明
//! - **契约（What）**：
//!   - 标签为 1–63 个 `[A-Za-z0-9-]` 字符，不得以连字符开头或结尾；
//!   - `*` 仅允许出现在最左侧位置，独立的 `*` 表示“任意主机”；
//!   - 通配标签吞掉**一个或多个**前导标签：`*.b.c` 匹配 `a.b.c` 与
//!     `x.a.b.c`，但不匹配裸 `b.c`；
//! - **实现提示（How）**：内部以“反转标签序列”存储精确后缀，匹配与覆盖
//!   判定都化为前缀比较；比较前统一折叠为小写。

use std::fmt;

use hearth_core::error::ConfigError;

/// 校验单个 DNS 标签。
fn valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    (1..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        && bytes.first() != Some(&b'-')
        && bytes.last() != Some(&b'-')
}

/// 把具体主机名折叠为反转的小写标签序列；语法非法返回 `None`。
pub(crate) fn canonical_labels(hostname: &str) -> Option<Vec<String>> {
    let lowered = hostname.to_ascii_lowercase();
    let labels: Vec<&str> = lowered.split('.').collect();
    if labels.is_empty() || !labels.iter().all(|label| valid_label(label)) {
        return None;
    }
    Some(labels.into_iter().rev().map(str::to_string).collect())
}

/// 经过语法校验的主机名模式（精确、部分通配或全通配）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostnamePattern {
    /// 反转存储的精确后缀标签（`*.b.c` → `["c", "b"]`）。
    exact_rev: Vec<String>,
    wildcard: bool,
}

impl HostnamePattern {
    /// 解析模式文本；语法违规在构造期一次性报错。
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let lowered = raw.to_ascii_lowercase();
        let labels: Vec<&str> = lowered.split('.').collect();
        if labels.is_empty() || labels.iter().any(|label| label.is_empty()) {
            return Err(ConfigError::invalid(
                "hostname",
                format!("主机名 {raw:?} 含空标签"),
            ));
        }

        let (wildcard, exact) = match labels.split_first() {
            Some((&"*", rest)) => (true, rest),
            _ => (false, &labels[..]),
        };
        if exact.iter().any(|label| *label == "*") {
            return Err(ConfigError::invalid(
                "hostname",
                format!("主机名 {raw:?} 的通配标签只允许出现在最左侧"),
            ));
        }
        if !exact.iter().all(|label| valid_label(label)) {
            return Err(ConfigError::invalid(
                "hostname",
                format!("主机名 {raw:?} 含非法标签"),
            ));
        }
        Ok(Self {
            exact_rev: exact.iter().rev().map(|s| s.to_string()).collect(),
            wildcard,
        })
    }

    /// 是否为独立 `*`（任意主机）。
    pub fn is_full_wildcard(&self) -> bool {
        self.wildcard && self.exact_rev.is_empty()
    }

    pub fn has_wildcard(&self) -> bool {
        self.wildcard
    }

    /// 精确标签数量：最长后缀排序中的特异度。
    pub fn specificity(&self) -> usize {
        self.exact_rev.len()
    }

    /// 判定具体主机名是否落入本模式。
    pub fn matches(&self, hostname: &str) -> bool {
        let Some(labels_rev) = canonical_labels(hostname) else {
            return false;
        };
        if self.wildcard {
            labels_rev.len() > self.exact_rev.len()
                && labels_rev[..self.exact_rev.len()] == self.exact_rev[..]
        } else {
            labels_rev == self.exact_rev
        }
    }

    /// 覆盖判定：`self` 作为选择模式时能否选中 `other` 绑定。
    ///
    /// - 全通配覆盖一切；
    /// - 精确模式仅覆盖同名绑定；
    /// - 通配模式覆盖“后缀严格延伸自身后缀”的精确绑定，以及“后缀不短于
    ///   自身后缀”的通配绑定。
    pub fn covers(&self, other: &HostnamePattern) -> bool {
        if self.is_full_wildcard() {
            return true;
        }
        if !self.wildcard {
            return self == other;
        }
        let prefix_matches = other.exact_rev.len() >= self.exact_rev.len()
            && other.exact_rev[..self.exact_rev.len()] == self.exact_rev[..];
        if !prefix_matches {
            return false;
        }
        if other.wildcard {
            true
        } else {
            other.exact_rev.len() > self.exact_rev.len()
        }
    }
}

impl fmt::Display for HostnamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if self.wildcard {
            f.write_str("*")?;
            first = false;
        }
        for label in self.exact_rev.iter().rev() {
            if !first {
                f.write_str(".")?;
            }
            f.write_str(label)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// 语法：精确、部分通配、全通配合法；中置通配与非法标签被拒。
    #[test]
    fn grammar_is_enforced() {
        assert!(HostnamePattern::parse("a.example.com").is_ok());
        assert!(HostnamePattern::parse("*.example.com").is_ok());
        assert!(HostnamePattern::parse("*").is_ok());

        assert!(HostnamePattern::parse("a.*.com").is_err());
        assert!(HostnamePattern::parse("-bad.com").is_err());
        assert!(HostnamePattern::parse("bad-.com").is_err());
        assert!(HostnamePattern::parse("").is_err());
        assert!(HostnamePattern::parse("a..b").is_err());
    }

    /// 匹配：通配吞掉一个或多个前导标签，大小写折叠。
    #[test]
    fn matching_semantics() {
        let exact = HostnamePattern::parse("a.example.com").unwrap();
        assert!(exact.matches("A.Example.COM"));
        assert!(!exact.matches("b.example.com"));

        let wildcard = HostnamePattern::parse("*.example.com").unwrap();
        assert!(wildcard.matches("a.example.com"));
        assert!(wildcard.matches("x.a.example.com"));
        assert!(!wildcard.matches("example.com"));

        let any = HostnamePattern::parse("*").unwrap();
        assert!(any.matches("example"));
        assert!(any.matches("a.b.c"));
    }

    /// 覆盖：子集选择的判定边界。
    #[test]
    fn covers_semantics() {
        let any = HostnamePattern::parse("*").unwrap();
        let wild = HostnamePattern::parse("*.example.com").unwrap();
        let exact = HostnamePattern::parse("a.example.com").unwrap();
        let bare = HostnamePattern::parse("example.com").unwrap();

        assert!(any.covers(&wild));
        assert!(any.covers(&exact));
        assert!(wild.covers(&exact));
        assert!(!wild.covers(&bare));
        assert!(exact.covers(&exact));
        assert!(!exact.covers(&wild));
    }

    proptest! {
        /// 全通配匹配一切合法主机名；精确模式匹配自身文本。
        #[test]
        fn full_wildcard_matches_everything(labels in proptest::collection::vec("[a-z][a-z0-9]{0,8}", 1..4)) {
            let hostname = labels.join(".");
            let any = HostnamePattern::parse("*").unwrap();
            prop_assert!(any.matches(&hostname));

            let exact = HostnamePattern::parse(&hostname).unwrap();
            prop_assert!(exact.matches(&hostname));
        }
    }
}
