//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置可以来自 YAML/JSON 文件，也可以用构建器组装。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{CoreError, Result};

/// 超时后的工作线程处置策略
///
/// 超时的调用方不会再等待工作线程；回调最终返回后，工作线程自己完成回滚，
/// 然后按此策略决定是否回到空闲池。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortPolicy {
    /// 完成回滚后照常回到空闲池
    #[default]
    Ignore,
    /// 完成回滚后退出，不再复用
    Retire,
}

/// 单例冲突判定策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SingletonPolicy {
    /// 同符号名即冲突
    SymbolicName,
    /// 同符号名且同版本才冲突
    #[default]
    SymbolicNameAndVersion,
}

/// 操作执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// START/STOP 操作超时（毫秒），事件分发不受此限制
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// 空闲工作线程保活时间（毫秒）
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// 超时处置策略
    #[serde(default)]
    pub abort_policy: AbortPolicy,

    /// 最大工作线程数（0 表示不限制）
    #[serde(default)]
    pub max_workers: usize,
}

fn default_operation_timeout_ms() -> u64 {
    30000
}

fn default_keep_alive_ms() -> u64 {
    60000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            abort_policy: AbortPolicy::default(),
            max_workers: 0,
        }
    }
}

impl ExecutorConfig {
    /// 操作超时
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// 保活时间
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

/// 解析器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// 单例冲突判定策略
    #[serde(default)]
    pub singleton_policy: SingletonPolicy,

    /// 委托给基础加载器的包模式（例如 "java.*"）
    #[serde(default)]
    pub boot_delegation: Vec<String>,

    /// 安装后立即尝试解析
    #[serde(default)]
    pub eager_resolve_on_install: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            singleton_policy: SingletonPolicy::default(),
            boot_delegation: vec![],
            eager_resolve_on_install: false,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数，0 表示不清理旧文件
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 操作执行器配置
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// 解析器配置
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

impl FrameworkConfig {
    /// 创建配置构建器
    pub fn builder() -> FrameworkConfigBuilder {
        FrameworkConfigBuilder::new()
    }

    /// 从文件加载配置（`.json` 按 JSON 解析，其余按 YAML）
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            CoreError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config: FrameworkConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.executor.operation_timeout_ms == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "executor.operation_timeout_ms".to_string(),
                reason: "超时时间必须大于 0".to_string(),
            });
        }
        for pattern in &self.resolver.boot_delegation {
            if pattern.is_empty() || pattern[..pattern.len() - 1].contains('*') {
                return Err(CoreError::InvalidConfigValue {
                    key: "resolver.boot_delegation".to_string(),
                    reason: format!("无效的包模式 '{}'", pattern),
                });
            }
        }
        Ok(())
    }

    /// 合并另一个配置（只覆盖非默认值）
    pub fn merge(&mut self, other: FrameworkConfig) {
        if other.executor.operation_timeout_ms != default_operation_timeout_ms() {
            self.executor.operation_timeout_ms = other.executor.operation_timeout_ms;
        }
        if other.executor.keep_alive_ms != default_keep_alive_ms() {
            self.executor.keep_alive_ms = other.executor.keep_alive_ms;
        }
        if other.executor.abort_policy != AbortPolicy::default() {
            self.executor.abort_policy = other.executor.abort_policy;
        }
        if other.executor.max_workers != 0 {
            self.executor.max_workers = other.executor.max_workers;
        }
        if other.resolver.singleton_policy != SingletonPolicy::default() {
            self.resolver.singleton_policy = other.resolver.singleton_policy;
        }
        if !other.resolver.boot_delegation.is_empty() {
            self.resolver
                .boot_delegation
                .extend(other.resolver.boot_delegation);
        }
        if other.resolver.eager_resolve_on_install {
            self.resolver.eager_resolve_on_install = true;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FrameworkConfigBuilder {
    config: FrameworkConfig,
}

impl FrameworkConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: FrameworkConfig::default(),
        }
    }

    /// 设置 START/STOP 操作超时
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.executor.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置空闲工作线程保活时间
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.executor.keep_alive_ms = keep_alive.as_millis() as u64;
        self
    }

    /// 设置超时处置策略
    pub fn abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.config.executor.abort_policy = policy;
        self
    }

    /// 设置最大工作线程数
    pub fn max_workers(mut self, count: usize) -> Self {
        self.config.executor.max_workers = count;
        self
    }

    /// 设置单例冲突判定策略
    pub fn singleton_policy(mut self, policy: SingletonPolicy) -> Self {
        self.config.resolver.singleton_policy = policy;
        self
    }

    /// 添加基础加载器委托的包模式
    pub fn boot_delegation(mut self, pattern: impl Into<String>) -> Self {
        self.config.resolver.boot_delegation.push(pattern.into());
        self
    }

    /// 安装后立即解析
    pub fn eager_resolve(mut self) -> Self {
        self.config.resolver.eager_resolve_on_install = true;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> FrameworkConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FrameworkConfig::default();
        assert_eq!(config.executor.operation_timeout_ms, 30000);
        assert_eq!(config.executor.abort_policy, AbortPolicy::Ignore);
        assert_eq!(
            config.resolver.singleton_policy,
            SingletonPolicy::SymbolicNameAndVersion
        );
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FrameworkConfig::builder()
            .operation_timeout(Duration::from_millis(250))
            .abort_policy(AbortPolicy::Retire)
            .boot_delegation("java.*")
            .log_level("debug")
            .build();

        assert_eq!(config.executor.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.executor.abort_policy, AbortPolicy::Retire);
        assert_eq!(config.resolver.boot_delegation, vec!["java.*"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_config_merge() {
        let mut base = FrameworkConfig::default();
        let overlay = FrameworkConfig::builder()
            .singleton_policy(SingletonPolicy::SymbolicName)
            .max_workers(4)
            .eager_resolve()
            .build();

        base.merge(overlay);

        assert_eq!(base.resolver.singleton_policy, SingletonPolicy::SymbolicName);
        assert_eq!(base.executor.max_workers, 4);
        assert!(base.resolver.eager_resolve_on_install);
        assert_eq!(base.executor.operation_timeout_ms, 30000);
    }

    #[test]
    fn test_invalid_boot_delegation_pattern() {
        let config = FrameworkConfig::builder().boot_delegation("ja*va.x").build();
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfigValue { .. })
        ));
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let yaml = r#"
executor:
  operation_timeout_ms: 500
  abort_policy: retire
resolver:
  singleton_policy: symbolic-name
  boot_delegation: ["java.*", "sun.misc"]
"#;
        let config: FrameworkConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.executor.operation_timeout_ms, 500);
        assert_eq!(config.executor.keep_alive_ms, 60000);
        assert_eq!(config.executor.abort_policy, AbortPolicy::Retire);
        assert_eq!(config.resolver.singleton_policy, SingletonPolicy::SymbolicName);
        assert_eq!(config.resolver.boot_delegation.len(), 2);
    }
}
