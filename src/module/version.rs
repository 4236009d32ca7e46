//! 版本与版本区间
//!
//! 版本使用 `semver::Version`，缺省的次版本和修订号补零（"1.0" 即 1.0.0）。
//! 区间使用数学区间记法：`[1.0.0,2.0.0)`、`(1.0,2.0]`；单独一个版本表示"不低于"。

use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::{CoreError, Result};

/// 解析版本号，缺省部分补零
///
/// 第四段（限定符）作为构建元数据保留。
pub fn parse_version(text: &str) -> Result<Version> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Version::new(0, 0, 0));
    }

    let mut parts = text.splitn(4, '.');
    let mut numbers = [0u64; 3];
    for slot in numbers.iter_mut() {
        match parts.next() {
            Some(part) => {
                *slot = part.parse().map_err(|_| {
                    CoreError::InvalidManifest(format!("无效的版本号 '{}'", text))
                })?;
            }
            None => break,
        }
    }

    let mut version = Version::new(numbers[0], numbers[1], numbers[2]);
    if let Some(qualifier) = parts.next() {
        version.build = semver::BuildMetadata::new(qualifier)?;
    }
    Ok(version)
}

/// 以补零规则读写版本号的 serde 适配
pub(crate) mod serde_version {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_version(&text).map_err(serde::de::Error::custom)
    }
}

/// 版本区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    floor: Version,
    floor_inclusive: bool,
    ceiling: Option<(Version, bool)>,
}

impl VersionRange {
    /// 匹配任意版本
    pub fn any() -> Self {
        Self::at_least(Version::new(0, 0, 0))
    }

    /// 不低于给定版本
    pub fn at_least(version: Version) -> Self {
        Self {
            floor: version,
            floor_inclusive: true,
            ceiling: None,
        }
    }

    /// 只匹配给定版本
    pub fn exact(version: Version) -> Self {
        Self {
            floor: version.clone(),
            floor_inclusive: true,
            ceiling: Some((version, true)),
        }
    }

    /// 左闭右开区间 `[floor, ceiling)`
    pub fn between(floor: Version, ceiling: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: Some((ceiling, false)),
        }
    }

    /// 解析区间文本
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::any());
        }

        let first = text.chars().next().unwrap_or_default();
        if first != '[' && first != '(' {
            return Ok(Self::at_least(parse_version(text)?));
        }

        let last = text.chars().last().unwrap_or_default();
        if last != ']' && last != ')' {
            return Err(CoreError::InvalidManifest(format!(
                "版本区间 '{}' 缺少右边界",
                text
            )));
        }

        let inner = &text[1..text.len() - 1];
        let (low, high) = inner.split_once(',').ok_or_else(|| {
            CoreError::InvalidManifest(format!("版本区间 '{}' 缺少逗号", text))
        })?;

        let range = Self {
            floor: parse_version(low)?,
            floor_inclusive: first == '[',
            ceiling: Some((parse_version(high)?, last == ']')),
        };

        if range.is_empty() {
            return Err(CoreError::InvalidManifest(format!("版本区间 '{}' 为空", text)));
        }
        Ok(range)
    }

    /// 版本是否落在区间内
    pub fn includes(&self, version: &Version) -> bool {
        let above_floor = if self.floor_inclusive {
            version >= &self.floor
        } else {
            version > &self.floor
        };
        if !above_floor {
            return false;
        }
        match &self.ceiling {
            Some((ceiling, true)) => version <= ceiling,
            Some((ceiling, false)) => version < ceiling,
            None => true,
        }
    }

    fn is_empty(&self) -> bool {
        match &self.ceiling {
            Some((ceiling, inclusive)) => {
                if self.floor == *ceiling {
                    !(self.floor_inclusive && *inclusive)
                } else {
                    self.floor > *ceiling
                }
            }
            None => false,
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ceiling {
            None => write!(f, "{}", self.floor),
            Some((ceiling, inclusive)) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if *inclusive { ']' } else { ')' }
            ),
        }
    }
}

impl FromStr for VersionRange {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VersionRange> for String {
    fn from(range: VersionRange) -> Self {
        range.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        parse_version(text).unwrap()
    }

    #[test]
    fn test_zero_filled_versions() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.5"), Version::new(1, 5, 0));
        assert_eq!(v("2.0.3"), Version::new(2, 0, 3));
        assert_eq!(v("1.0.0.beta").build.as_str(), "beta");
        assert!(parse_version("x.1").is_err());
    }

    #[test]
    fn test_half_open_range() {
        let range = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
        assert!(range.includes(&v("1.0.0")));
        assert!(range.includes(&v("1.5.0")));
        assert!(!range.includes(&v("2.0.0")));
        assert!(!range.includes(&v("0.9.9")));
    }

    #[test]
    fn test_exclusive_floor() {
        let range = VersionRange::parse("(1.0,2.0]").unwrap();
        assert!(!range.includes(&v("1.0")));
        assert!(range.includes(&v("2.0")));
    }

    #[test]
    fn test_bare_version_is_at_least() {
        let range = VersionRange::parse("1.2").unwrap();
        assert!(range.includes(&v("1.2.0")));
        assert!(range.includes(&v("9.0.0")));
        assert!(!range.includes(&v("1.1.9")));
        assert_eq!(range.to_string(), "1.2.0");
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(VersionRange::parse("[2.0,1.0)").is_err());
        assert!(VersionRange::parse("[1.0,1.0)").is_err());
        assert!(VersionRange::parse("[1.0 2.0)").is_err());
        assert!(VersionRange::parse("[1.0,2.0").is_err());
    }

    #[test]
    fn test_range_serde_as_string() {
        let range: VersionRange = serde_yaml::from_str("\"[1.0.0,2.0.0)\"").unwrap();
        assert_eq!(range, VersionRange::between(v("1"), v("2")));
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\"[1.0.0,2.0.0)\"");
    }
}
