//! 日志系统模块
//!
//! 基于 tracing 生态初始化运行时的日志输出：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR）
//! - 结构化日志（JSON 格式输出）
//! - 文件日志输出（非阻塞写入，按时间轮转）
//! - 按模块过滤（EnvFilter 指令）
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_modular::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let config = LoggerConfig::builder()
//!     .level("debug")
//!     .json_format(true)
//!     .file_output("./logs")
//!     .rotation(RotationStrategy::Daily)
//!     .build();
//!
//! let _guard = Logger::init(config).unwrap();
//! tracing::info!(module_id = 3, generation = 5, "模块已解析");
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::utils::{CoreError, Result};

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转（单个日志文件）
    Never,
    /// 每分钟轮转（主要用于测试）
    Minutely,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Minutely => Rotation::MINUTELY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，无法识别时回退到每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "minutely" | "minute" => RotationStrategy::Minutely,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationStrategy::Never => write!(f, "never"),
            RotationStrategy::Minutely => write!(f, "minutely"),
            RotationStrategy::Hourly => write!(f, "hourly"),
            RotationStrategy::Daily => write!(f, "daily"),
        }
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（"trace", "debug", "info", "warn", "error"）
    pub level: String,

    /// 是否使用 JSON 格式输出
    pub json_format: bool,

    /// 是否输出到控制台
    pub console_output: bool,

    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 日志轮转策略
    pub rotation: RotationStrategy,

    /// 保留的最大日志文件数，超出时删除最旧的；0 表示不清理
    pub max_files: usize,

    /// 是否显示线程名（工作线程按操作命名，排查挂起的回调时有用）
    pub show_thread_names: bool,

    /// 是否显示文件名和行号
    pub show_file_line: bool,

    /// 自定义过滤指令（EnvFilter 格式）
    /// 例如："chips_modular=info,chips_modular::module::resolver=trace"
    pub filter_directives: Option<String>,

    /// 是否启用 ANSI 颜色（控制台输出）
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "chips-modular".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: 7,
            show_thread_names: true,
            show_file_line: false,
            filter_directives: None,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::new()
    }

    /// 从 FrameworkConfig 的 LogConfig 创建
    pub fn from_log_config(log_config: &crate::core::config::LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            max_files: log_config.max_files,
            ..Default::default()
        }
    }

    fn parse_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: LoggerConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用 JSON 格式输出
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    /// 设置控制台输出
    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置日志文件前缀
    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 设置保留文件数
    pub fn max_files(mut self, count: usize) -> Self {
        self.config.max_files = count;
        self
    }

    /// 显示线程名
    pub fn show_thread_names(mut self, enable: bool) -> Self {
        self.config.show_thread_names = enable;
        self
    }

    /// 显示文件名和行号
    pub fn show_file_line(mut self, enable: bool) -> Self {
        self.config.show_file_line = enable;
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    /// 启用 ANSI 颜色
    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，丢弃时等待挂起的日志写完。
pub struct LogGuard {
    _console_guard: Option<WorkerGuard>,
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn empty() -> Self {
        Self {
            _console_guard: None,
            _file_guard: None,
        }
    }
}

// ============================================================================
// 日志系统
// ============================================================================

static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// 返回的 `LogGuard` 必须保持存活直到程序退出。
    ///
    /// # Errors
    ///
    /// 日志系统已初始化或全局订阅者已被设置时返回 `InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guard = LogGuard::empty();

        let console_writer = if config.console_output {
            let (writer, console_guard) = tracing_appender::non_blocking(io::stdout());
            guard._console_guard = Some(console_guard);
            Some(writer)
        } else {
            None
        };

        let file_writer = match config.file_output.as_ref() {
            Some(log_dir) => {
                let appender = Self::file_appender(&config, log_dir)?;
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard._file_guard = Some(file_guard);
                Some(writer)
            }
            None => None,
        };

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if config.json_format {
            registry
                .with(console_writer.map(|w| {
                    fmt::layer()
                        .json()
                        .with_writer(w)
                        .with_thread_names(config.show_thread_names)
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                }))
                .with(file_writer.map(|w| {
                    fmt::layer()
                        .json()
                        .with_writer(w)
                        .with_thread_names(config.show_thread_names)
                }))
                .try_init()
        } else {
            registry
                .with(console_writer.map(|w| {
                    fmt::layer()
                        .with_writer(w)
                        .with_thread_names(config.show_thread_names)
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_ansi(config.ansi_colors)
                }))
                .with(file_writer.map(|w| {
                    fmt::layer()
                        .with_writer(w)
                        .with_thread_names(config.show_thread_names)
                        .with_ansi(false)
                }))
                .try_init()
        };
        result.map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(true);
        Ok(guard)
    }

    /// 尝试初始化日志系统，已初始化时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_else(|_| LogGuard::empty())
    }

    /// 按轮转策略和保留数构建文件输出
    fn file_appender(config: &LoggerConfig, log_dir: &Path) -> Result<RollingFileAppender> {
        let mut builder = RollingFileAppender::builder()
            .rotation(config.rotation.to_rotation())
            .filename_prefix(config.file_prefix.clone())
            .filename_suffix("log");
        if config.max_files > 0 {
            builder = builder.max_log_files(config.max_files);
        }
        builder.build(log_dir).map_err(|e| {
            CoreError::InitFailed(format!("无法创建日志文件 {}: {}", log_dir.display(), e))
        })
    }

    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        // RUST_LOG 优先
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.parse_level().to_string().to_lowercase()));

        match config.filter_directives {
            Some(ref directives) => directives
                .split(',')
                .filter_map(|d| d.trim().parse().ok())
                .fold(filter, |f, directive| f.add_directive(directive)),
            None => filter,
        }
    }
}

// ============================================================================
// 结构化日志字段定义
// ============================================================================

/// 标准日志字段名称
pub mod fields {
    /// 模块 ID
    pub const MODULE_ID: &str = "module_id";
    /// 代 ID
    pub const GENERATION: &str = "generation";
    /// 包名
    pub const PACKAGE: &str = "package";
    /// 操作类型
    pub const KIND: &str = "kind";
    /// 状态
    pub const STATE: &str = "state";
    /// 错误码
    pub const ERROR_CODE: &str = "error_code";
    /// 耗时（毫秒）
    pub const DURATION_MS: &str = "duration_ms";
}

/// 创建生命周期操作的 span
///
/// ```rust,ignore
/// let span = operation_span!(7, "START");
/// let _enter = span.enter();
/// ```
#[macro_export]
macro_rules! operation_span {
    ($module_id:expr, $kind:expr) => {
        tracing::info_span!("operation", module_id = $module_id, kind = %$kind)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_strategy_parse() {
        assert_eq!(RotationStrategy::parse("daily"), RotationStrategy::Daily);
        assert_eq!(RotationStrategy::parse("HOURLY"), RotationStrategy::Hourly);
        assert_eq!(RotationStrategy::parse("minute"), RotationStrategy::Minutely);
        assert_eq!(RotationStrategy::parse("none"), RotationStrategy::Never);
        assert_eq!(RotationStrategy::parse("whatever"), RotationStrategy::Daily);
        assert_eq!(RotationStrategy::Hourly.to_string(), "hourly");
    }

    #[test]
    fn test_logger_config_builder() {
        let config = LoggerConfig::builder()
            .level("debug")
            .json_format(true)
            .file_output("/var/log/chips")
            .file_prefix("runtime")
            .rotation(RotationStrategy::Hourly)
            .max_files(14)
            .show_thread_names(false)
            .filter_directives("chips_modular=trace")
            .ansi_colors(false)
            .build();

        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        assert_eq!(config.file_output, Some(PathBuf::from("/var/log/chips")));
        assert_eq!(config.file_prefix, "runtime");
        assert_eq!(config.rotation, RotationStrategy::Hourly);
        assert_eq!(config.max_files, 14);
        assert!(!config.show_thread_names);
        assert!(!config.ansi_colors);
    }

    #[test]
    fn test_parse_level() {
        for (raw, expected) in [
            ("trace", Level::TRACE),
            ("DEBUG", Level::DEBUG),
            ("warning", Level::WARN),
            ("error", Level::ERROR),
            ("bogus", Level::INFO),
        ] {
            let config = LoggerConfig::builder().level(raw).build();
            assert_eq!(config.parse_level(), expected, "level: {}", raw);
        }
    }

    #[test]
    fn test_from_log_config() {
        use crate::core::config::LogConfig;

        let log_config = LogConfig {
            level: "debug".to_string(),
            file_output: false,
            log_dir: Some(PathBuf::from("/var/log")),
            json_format: true,
            rotation: "hourly".to_string(),
            max_files: 3,
        };

        let config = LoggerConfig::from_log_config(&log_config);
        assert_eq!(config.level, "debug");
        assert!(config.json_format);
        // file_output=false 时即使配置了目录也不输出
        assert!(config.file_output.is_none());
        assert_eq!(config.rotation, RotationStrategy::Hourly);
        assert_eq!(config.max_files, 3);
    }

    #[test]
    fn test_file_appender_writes_with_prefix() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig::builder()
            .file_prefix("runtime")
            .rotation(RotationStrategy::Never)
            .max_files(2)
            .build();
        let mut appender = Logger::file_appender(&config, dir.path()).unwrap();
        appender.write_all(b"line\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["runtime.log".to_string()]);
    }

    #[test]
    fn test_logger_try_init_never_fails() {
        let _guard = Logger::try_init(LoggerConfig::default());
        let _guard2 = Logger::try_init(LoggerConfig::default());
    }
}
