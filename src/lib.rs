//! # Chips Modular - 薯片动态模块运行时
//!
//! 在单个进程内安装、解析、启动、更新和卸载模块：
//!
//! - **解析与布线**: 按清单声明的导入、依赖和能力为每一代选择提供者，失败时不留下部分布线
//! - **委托查找**: 类与资源按固定顺序在启动委托、导入、依赖、本地内容和动态导入之间查找
//! - **代**: 更新只追加新的代，旧代在仍被使用时保持布线不变，直到刷新
//! - **生命周期**: 启动、停止、延迟激活，回调在带超时的工作线程上执行
//! - **配置与日志**: YAML 配置文件与 tracing 结构化日志
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_modular::{Framework, FrameworkConfig, MemoryArchive, ModuleManifest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let framework = Framework::new(FrameworkConfig::default())?;
//!
//!     let manifest = ModuleManifest::builder("chips.hello", "1.0.0")
//!         .export("chips.hello.api", "1.0.0")
//!         .build()?;
//!     let id = framework.install(Arc::new(MemoryArchive::new("mem:hello", manifest)))?;
//!     framework.start(id)?;
//!
//!     framework.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `api` - 运行时主接口
//! - `module` - 清单、注册表、解析器、查找、生命周期与执行器
//! - `core` - 配置
//! - `utils` - 错误类型与日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{Framework, FrameworkBuilder, ModuleContext, ModuleInfo};

pub use module::{
    Activator, ArchiveProvider, BroadcastEventSink, CollisionFilter, DirectoryArchive, ErrorSink,
    EventKind, EventSink, FrameworkEvent, GenerationId, MemoryArchive, ModuleManifest, ModuleState,
    Namespace, ResolverHook, VersionRange, Wire,
};

pub use utils::{error_code, CoreError, ResolutionError, Result};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{
    AbortPolicy, ExecutorConfig, FrameworkConfig, FrameworkConfigBuilder, LogConfig,
    ResolverConfig, SingletonPolicy,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
