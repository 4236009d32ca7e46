//! 工具模块
//!
//! 包含错误类型与日志系统。

pub mod error;
pub mod logger;

pub use error::{error_code, CoreError, ResolutionError, Result};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
