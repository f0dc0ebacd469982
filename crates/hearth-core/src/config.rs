//! 配置字面量辅助：字节大小与时长的文本解析。
//!
//! # 教案式说明
//! - **意图（Why）**：外部装载器交付的配置记录中，“最大请求体 `8 MiB`”“宽限
//!   窗口 `250 ms`” 这类字面量需要统一且严格的解析入口，错误在构造期一次性
//!   暴露（配置错误不可恢复）；
//! - **契约（What）**：
//!   - [`parse_byte_size`]：十进制数字（允许 `_` 分隔）+ 可选二进制单位
//!     （`B`/`KiB`/`MiB`/`GiB`/`TiB`），缺省单位为字节；
//!   - [`parse_duration`]：十进制数字 + 单位（`ms`/`s`/`sec`/`min`/`h`）；
//! - **注意（Trade-offs）**：拒绝负值、非有限值与溢出；单位区分大小写，以免
//!   `mb`/`MB` 的十进制/二进制歧义悄悄放大配额。

use std::time::Duration;

use crate::error::ConfigError;

/// 解析 `"8 MiB"` 风格的字节大小字面量。
pub fn parse_byte_size(slot: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let (number, unit) = split_literal(raw);
    let value: f64 = number
        .replace('_', "")
        .parse()
        .map_err(|_| ConfigError::invalid(slot, format!("无法解析数值 {number:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(slot, "字节大小必须为非负有限数"));
    }
    let multiplier: u64 = match unit {
        "" | "B" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        other => {
            return Err(ConfigError::invalid(
                slot,
                format!("未识别的字节单位 {other:?}"),
            ));
        }
    };
    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(ConfigError::invalid(slot, "字节大小溢出"));
    }
    Ok(bytes as u64)
}

/// 解析 `"250 ms"` / `"3 min"` 风格的时长字面量。
pub fn parse_duration(slot: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let (number, unit) = split_literal(raw);
    let value: f64 = number
        .replace('_', "")
        .parse()
        .map_err(|_| ConfigError::invalid(slot, format!("无法解析数值 {number:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(slot, "时长必须为非负有限数"));
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" | "sec" => value,
        "min" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(ConfigError::invalid(
                slot,
                format!("未识别的时长单位 {other:?}"),
            ));
        }
    };
    Ok(Duration::from_secs_f64(seconds))
}

fn split_literal(raw: &str) -> (&str, &str) {
    let trimmed = raw.trim();
    match trimmed.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '_')) {
        Some(index) => {
            let (number, unit) = trimmed.split_at(index);
            (number.trim(), unit.trim())
        }
        None => (trimmed, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 字节大小：裸数字、带单位与下划线分隔都可解析。
    #[test]
    fn byte_sizes_parse() {
        assert_eq!(parse_byte_size("max", "8").unwrap(), 8);
        assert_eq!(parse_byte_size("max", "8 B").unwrap(), 8);
        assert_eq!(parse_byte_size("max", "8 KiB").unwrap(), 8 * 1024);
        assert_eq!(parse_byte_size("max", "1.5 MiB").unwrap(), 1_572_864);
        assert_eq!(parse_byte_size("max", "100_000 B").unwrap(), 100_000);

        assert!(parse_byte_size("max", "8 MB").is_err());
        assert!(parse_byte_size("max", "-1 B").is_err());
        assert!(parse_byte_size("max", "lots").is_err());
    }

    /// 时长：毫秒到小时各单位可解析，未知单位报错。
    #[test]
    fn durations_parse() {
        assert_eq!(
            parse_duration("grace", "250 ms").unwrap(),
            Duration::from_millis(250),
        );
        assert_eq!(parse_duration("idle", "3 min").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("idle", "10 s").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("idle", "10").is_err());
        assert!(parse_duration("idle", "10 days").is_err());
    }
}
