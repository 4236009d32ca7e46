//! 模块运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。所有错误都只影响涉及的模块，
//! 不会使整个运行时失效。

use thiserror::Error;

/// 解析失败的具体原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// 必需的包导入无法满足
    #[error("模块 {module_id} 的必需导入 '{package}' ({range}) 没有可用的提供者")]
    MissingImport {
        module_id: u64,
        package: String,
        range: String,
    },

    /// 必需的模块依赖无法满足
    #[error("模块 {module_id} 的必需模块 '{symbolic_name}' ({range}) 没有可用的提供者")]
    MissingRequire {
        module_id: u64,
        symbolic_name: String,
        range: String,
    },

    /// 必需的通用能力无法满足
    #[error("模块 {module_id} 在命名空间 '{namespace}' 中的必需能力没有可用的提供者")]
    MissingCapability { module_id: u64, namespace: String },

    /// 片段找不到可附着的宿主
    #[error("片段模块 {module_id} 找不到可附着的宿主 '{host}'")]
    MissingHost { module_id: u64, host: String },

    /// 单例冲突
    #[error("模块 {module_id} 与已解析的单例模块 {conflicts:?} 冲突: '{symbolic_name}'")]
    DuplicateSingleton {
        module_id: u64,
        symbolic_name: String,
        conflicts: Vec<u64>,
    },

    /// 片段无法附着（宿主已解析或不允许附着）
    #[error("片段模块 {module_id} 无法附着到宿主: {reason}")]
    FragmentNotAttachable { module_id: u64, reason: String },

    /// 加载器工厂无法为模块构造加载器
    #[error("模块 {module_id} 的加载器构造失败: {reason}")]
    LoaderUnavailable { module_id: u64, reason: String },
}

/// 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 解析错误 ====================

    /// 解析失败，模块保持 INSTALLED
    #[error("解析失败: {0}")]
    Resolution(#[from] ResolutionError),

    // ==================== 生命周期错误 ====================

    /// 激活回调失败，模块回滚到 RESOLVED
    #[error("模块 {module_id} 激活失败: {reason}")]
    Activation { module_id: u64, reason: String },

    /// 停用回调失败，模块仍被强制置为 RESOLVED
    #[error("模块 {module_id} 停用失败: {reason}")]
    Deactivation { module_id: u64, reason: String },

    /// 操作超时
    #[error("模块 {module_id} 的 {kind} 操作在 {timeout_ms}ms 后超时")]
    Timeout {
        module_id: u64,
        kind: String,
        timeout_ms: u64,
    },

    /// 非法状态（已卸载、重入冲突操作等）
    #[error("模块 {module_id} 状态非法: {reason}")]
    IllegalState { module_id: u64, reason: String },

    /// 模块未找到
    #[error("模块未找到: {0}")]
    ModuleNotFound(u64),

    /// 无效的模块清单
    #[error("无效的模块清单: {0}")]
    InvalidManifest(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 解析错误 (RESOLVE-xxx)
    pub const RESOLVE_MISSING_IMPORT: &str = "RESOLVE-001";
    pub const RESOLVE_MISSING_REQUIRE: &str = "RESOLVE-002";
    pub const RESOLVE_MISSING_CAPABILITY: &str = "RESOLVE-003";
    pub const RESOLVE_MISSING_HOST: &str = "RESOLVE-004";
    pub const RESOLVE_DUPLICATE: &str = "RESOLVE-005";
    pub const RESOLVE_FRAGMENT: &str = "RESOLVE-006";
    pub const RESOLVE_LOADER: &str = "RESOLVE-007";

    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_ACTIVATION: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_DEACTIVATION: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_TIMEOUT: &str = "LIFECYCLE-003";
    pub const LIFECYCLE_ILLEGAL_STATE: &str = "LIFECYCLE-004";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_INVALID_MANIFEST: &str = "MODULE-002";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 资源错误 (RESOURCE-xxx)
    pub const RESOURCE_ACCESS_FAILED: &str = "RESOURCE-001";
}

impl ResolutionError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            ResolutionError::MissingImport { .. } => error_code::RESOLVE_MISSING_IMPORT,
            ResolutionError::MissingRequire { .. } => error_code::RESOLVE_MISSING_REQUIRE,
            ResolutionError::MissingCapability { .. } => error_code::RESOLVE_MISSING_CAPABILITY,
            ResolutionError::MissingHost { .. } => error_code::RESOLVE_MISSING_HOST,
            ResolutionError::DuplicateSingleton { .. } => error_code::RESOLVE_DUPLICATE,
            ResolutionError::FragmentNotAttachable { .. } => error_code::RESOLVE_FRAGMENT,
            ResolutionError::LoaderUnavailable { .. } => error_code::RESOLVE_LOADER,
        }
    }

    /// 失败所属的模块
    pub fn module_id(&self) -> u64 {
        match self {
            ResolutionError::MissingImport { module_id, .. }
            | ResolutionError::MissingRequire { module_id, .. }
            | ResolutionError::MissingCapability { module_id, .. }
            | ResolutionError::MissingHost { module_id, .. }
            | ResolutionError::DuplicateSingleton { module_id, .. }
            | ResolutionError::FragmentNotAttachable { module_id, .. }
            | ResolutionError::LoaderUnavailable { module_id, .. } => *module_id,
        }
    }
}

impl CoreError {
    /// 构造非法状态错误
    pub fn illegal_state(module_id: u64, reason: impl Into<String>) -> Self {
        CoreError::IllegalState {
            module_id,
            reason: reason.into(),
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Resolution(e) => e.error_code(),
            CoreError::Activation { .. } => error_code::LIFECYCLE_ACTIVATION,
            CoreError::Deactivation { .. } => error_code::LIFECYCLE_DEACTIVATION,
            CoreError::Timeout { .. } => error_code::LIFECYCLE_TIMEOUT,
            CoreError::IllegalState { .. } => error_code::LIFECYCLE_ILLEGAL_STATE,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::InvalidManifest(_) => error_code::MODULE_INVALID_MANIFEST,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::Io(_) => error_code::RESOURCE_ACCESS_FAILED,
            _ => "UNKNOWN",
        }
    }

    /// 是否为解析错误
    pub fn is_resolution(&self) -> bool {
        matches!(self, CoreError::Resolution(_))
    }

    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout { .. })
    }

    /// 是否为非法状态错误
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, CoreError::IllegalState { .. })
    }

    /// 调用方是否可以在修正条件后重试
    ///
    /// 非法状态错误总是直接交给调用方，运行时不会自动重试。
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CoreError::IllegalState { .. } | CoreError::ModuleNotFound(_)
        )
    }
}
