//! 组件命名：标识符式名称语法与根起绝对路径。

use std::fmt;
use std::sync::Arc;

use crate::error::LifecycleError;

/// 经过语法校验的组件名。
///
/// # 契约说明（What）
/// - 语法：首字符 `[A-Za-z_]`，其余 `[A-Za-z0-9_-]`，非空；
/// - 名称不可变、可哈希，克隆仅复制引用。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentName(Arc<str>);

impl ComponentName {
    /// 校验并构造名称。
    pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
        let mut chars = raw.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid_head && valid_tail {
            Ok(Self(Arc::from(raw)))
        } else {
            Err(LifecycleError::InvalidName {
                name: raw.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 自根起的绝对名称路径；以 `/` 连接显示（如 `/root/endpoints/main`）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamePath {
    segments: Arc<[ComponentName]>,
}

impl NamePath {
    /// 根路径：仅含根自身的名称。
    pub fn root(name: ComponentName) -> Self {
        Self {
            segments: Arc::from(vec![name].into_boxed_slice()),
        }
    }

    /// 在本路径下追加一段子名称。
    pub fn child(&self, name: ComponentName) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(name);
        Self {
            segments: Arc::from(segments.into_boxed_slice()),
        }
    }

    /// 路径的最后一段（组件自身的名称）。
    pub fn last(&self) -> &ComponentName {
        self.segments
            .last()
            .expect("name path always has at least the root segment")
    }

    pub fn segments(&self) -> &[ComponentName] {
        &self.segments
    }
}

impl fmt::Display for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in self.segments.iter() {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 名称语法：合法标识符通过，空串与非法字符被拒绝。
    #[test]
    fn name_grammar_is_enforced() {
        assert!(ComponentName::parse("main").is_ok());
        assert!(ComponentName::parse("_hidden").is_ok());
        assert!(ComponentName::parse("rate-limiter_2").is_ok());

        assert!(ComponentName::parse("").is_err());
        assert!(ComponentName::parse("1st").is_err());
        assert!(ComponentName::parse("-lead").is_err());
        assert!(ComponentName::parse("空格 name").is_err());
    }

    /// 路径显示为根起 `/` 连接的形式。
    #[test]
    fn path_display_is_rooted() {
        let root = NamePath::root(ComponentName::parse("webapp").unwrap());
        let child = root.child(ComponentName::parse("endpoints").unwrap());
        assert_eq!(child.to_string(), "/webapp/endpoints");
        assert_eq!(child.last().as_str(), "endpoints");
    }
}
