//! API 模块
//!
//! 对外提供的运行时接口。
//!
//! - `framework`: [`Framework`] 主接口与交给激活器的 [`ModuleContext`]
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_modular::api::Framework;
//! use chips_modular::core::config::FrameworkConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FrameworkConfig::from_file("chips.yaml")?;
//!     let framework = Framework::new(config)?;
//!
//!     let ids = framework.install_directories(&[std::path::PathBuf::from("modules")]);
//!     for id in ids {
//!         framework.start(id)?;
//!     }
//!     framework.shutdown();
//!     Ok(())
//! }
//! ```

pub mod framework;

pub use framework::{Framework, FrameworkBuilder, ModuleContext, ModuleInfo};
