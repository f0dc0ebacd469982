//! 头部规整：单值头允许清单与多值折叠规则。
//!
//! # 教案式说明
//! - **契约（What）**：HTTP/1 与 HTTP/2 的多值头折叠规则不同；读取时按
//!   [`SINGLE_VALUED`] 清单规整——单值头取首个出现的值，其余头以 `", "`
//!   连接，`set-cookie` 保留多值槽位（经 `HeaderMap::get_all` 访问）；
//! - **注意（Trade-offs）**：清单为实现定义，此处取互操作所需的最小集合。

use http::HeaderMap;
use http::header::HeaderName;

/// 必须按单值处理的头名（小写、有序，便于二分查找）。
pub const SINGLE_VALUED: &[&str] = &[
    "age",
    "authorization",
    "content-length",
    "content-type",
    "etag",
    "expires",
    "from",
    "host",
    "if-modified-since",
    "if-unmodified-since",
    "last-modified",
    "location",
    "max-forwards",
    "proxy-authorization",
    "referer",
    "retry-after",
    "server",
    "user-agent",
];

/// 头名是否属于单值清单。
pub fn is_single_valued(name: &str) -> bool {
    SINGLE_VALUED.binary_search(&name.to_ascii_lowercase().as_str()).is_ok()
}

/// 按规整规则读取头部文本值。
///
/// - 单值头：仅取首个出现的值；
/// - `set-cookie`：多值槽位，此入口不折叠，返回 `None`；
/// - 其余头：全部值以 `", "` 连接。
pub fn normalized_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    if name == http::header::SET_COOKIE {
        return None;
    }
    let mut values = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok());
    if is_single_valued(name.as_str()) {
        values.next().map(str::to_string)
    } else {
        let joined: Vec<&str> = values.collect();
        if joined.is_empty() {
            None
        } else {
            Some(joined.join(", "))
        }
    }
}
