//! 核心模块
//!
//! 包含运行时配置。

pub mod config;

pub use config::{
    AbortPolicy, ExecutorConfig, FrameworkConfig, FrameworkConfigBuilder, LogConfig,
    ResolverConfig, SingletonPolicy,
};
