//! 模块清单定义
//!
//! 定义模块清单 (module.yaml) 中的所有数据结构，以及模块的生命周期状态。

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::version::{serde_version, VersionRange};

/// 模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// 已安装，尚未解析
    #[default]
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终态）
    Uninstalled,
}

impl ModuleState {
    /// 当前代是否已完成布线
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ModuleState::Resolved
                | ModuleState::Starting
                | ModuleState::Active
                | ModuleState::Stopping
        )
    }

    /// 启动是否为空操作
    pub fn start_is_noop(&self) -> bool {
        matches!(self, ModuleState::Active | ModuleState::Starting)
    }

    /// 停止是否为空操作
    pub fn stop_is_noop(&self) -> bool {
        matches!(self, ModuleState::Installed | ModuleState::Resolved)
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        *self == ModuleState::Uninstalled
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        };
        f.write_str(name)
    }
}

/// 片段附着策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentAttachment {
    /// 任何时候都可以附着
    #[default]
    Always,
    /// 只在宿主解析时附着
    ResolveTime,
    /// 不允许附着
    Never,
}

/// 激活方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    /// 启动时立即激活
    #[default]
    Eager,
    /// 首次从匹配包加载类时激活
    Lazy,
}

/// 激活策略
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationPolicy {
    /// 激活方式
    #[serde(default)]
    pub mode: ActivationMode,

    /// 触发延迟激活的包（为空时任意包都会触发）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
}

impl ActivationPolicy {
    /// 延迟激活
    pub fn lazy(include: Vec<String>) -> Self {
        Self {
            mode: ActivationMode::Lazy,
            include,
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.mode == ActivationMode::Lazy
    }

    /// 从该包加载类是否触发激活
    pub fn triggered_by(&self, package: &str) -> bool {
        self.is_lazy() && (self.include.is_empty() || self.include.iter().any(|p| p == package))
    }
}

/// 片段宿主选择器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSelector {
    /// 宿主符号名
    pub symbolic_name: String,

    /// 宿主版本区间
    #[serde(default)]
    pub version: VersionRange,
}

impl HostSelector {
    pub fn matches(&self, symbolic_name: &str, version: &Version) -> bool {
        self.symbolic_name == symbolic_name && self.version.includes(version)
    }
}

/// 包导出声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDecl {
    /// 包名
    pub package: String,

    /// 包版本
    #[serde(with = "serde_version", default = "zero_version")]
    pub version: Version,
}

fn zero_version() -> Version {
    Version::new(0, 0, 0)
}

/// 包导入声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDecl {
    /// 包名
    pub package: String,

    /// 可接受的版本区间
    #[serde(default)]
    pub version: VersionRange,

    /// 可选导入无法满足时不导致解析失败
    #[serde(default)]
    pub optional: bool,

    /// 限定提供者的符号名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_module: Option<String>,
}

/// 整模块依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireDecl {
    /// 被依赖模块的符号名
    pub symbolic_name: String,

    /// 可接受的版本区间
    #[serde(default)]
    pub version: VersionRange,

    #[serde(default)]
    pub optional: bool,

    /// 将被依赖模块的包再导出给自己的依赖者
    #[serde(default)]
    pub reexport: bool,
}

/// 通用能力声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub namespace: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// 通用需求声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementDecl {
    pub namespace: String,

    /// 必须逐项相等的属性
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// 对能力 `version` 属性的区间约束
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionRange>,

    #[serde(default)]
    pub optional: bool,
}

impl RequirementDecl {
    /// 能力是否满足此需求
    pub fn matched_by(&self, capability: &CapabilityDecl) -> bool {
        if capability.namespace != self.namespace {
            return false;
        }
        let attributes_match = self
            .attributes
            .iter()
            .all(|(key, value)| capability.attributes.get(key) == Some(value));
        if !attributes_match {
            return false;
        }
        match &self.version {
            Some(range) => capability
                .attributes
                .get("version")
                .and_then(|v| super::version::parse_version(v).ok())
                .map(|v| range.includes(&v))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// 模块清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// 符号名
    pub symbolic_name: String,

    /// 模块版本
    #[serde(with = "serde_version", default = "zero_version")]
    pub version: Version,

    /// 是否为单例
    #[serde(default)]
    pub singleton: bool,

    /// 作为宿主时接受片段的策略
    #[serde(default)]
    pub fragment_attachment: FragmentAttachment,

    /// 作为片段时的宿主选择器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<HostSelector>,

    #[serde(default)]
    pub exports: Vec<ExportDecl>,

    #[serde(default)]
    pub imports: Vec<ImportDecl>,

    #[serde(default)]
    pub requires: Vec<RequireDecl>,

    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,

    #[serde(default)]
    pub requirements: Vec<RequirementDecl>,

    /// 动态导入模式（`*`、`a.b.*` 或精确包名）
    #[serde(default)]
    pub dynamic_imports: Vec<String>,

    #[serde(default)]
    pub activation: ActivationPolicy,

    /// 激活器名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    /// 自由格式的头信息
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ModuleManifest {
    /// 创建清单构建器
    pub fn builder(symbolic_name: impl Into<String>, version: &str) -> ManifestBuilder {
        ManifestBuilder::new(symbolic_name, version)
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    pub fn exports_package(&self, package: &str) -> bool {
        self.exports.iter().any(|e| e.package == package)
    }

    pub fn imports_package(&self, package: &str) -> bool {
        self.imports.iter().any(|i| i.package == package)
    }

    /// 包是否匹配某个动态导入模式
    pub fn dynamically_imports(&self, package: &str) -> bool {
        self.dynamic_imports
            .iter()
            .any(|pattern| package_matches(pattern, package))
    }
}

/// 包名模式匹配
///
/// `*` 匹配所有包，`a.b.*` 匹配 `a.b` 的子包，其余按精确匹配。
pub fn package_matches(pattern: &str, package: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => package.starts_with(prefix),
        None => pattern == package,
    }
}

/// 清单构建器
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    manifest: ModuleManifest,
    error: Option<String>,
}

impl ManifestBuilder {
    pub fn new(symbolic_name: impl Into<String>, version: &str) -> Self {
        let (version, error) = match super::version::parse_version(version) {
            Ok(v) => (v, None),
            Err(e) => (zero_version(), Some(e.to_string())),
        };
        Self {
            manifest: ModuleManifest {
                symbolic_name: symbolic_name.into(),
                version,
                singleton: false,
                fragment_attachment: FragmentAttachment::Always,
                fragment_host: None,
                exports: vec![],
                imports: vec![],
                requires: vec![],
                capabilities: vec![],
                requirements: vec![],
                dynamic_imports: vec![],
                activation: ActivationPolicy::default(),
                activator: None,
                headers: BTreeMap::new(),
            },
            error,
        }
    }

    fn range(&mut self, text: &str) -> VersionRange {
        match VersionRange::parse(text) {
            Ok(range) => range,
            Err(e) => {
                self.error.get_or_insert(e.to_string());
                VersionRange::any()
            }
        }
    }

    pub fn singleton(mut self) -> Self {
        self.manifest.singleton = true;
        self
    }

    pub fn fragment_attachment(mut self, policy: FragmentAttachment) -> Self {
        self.manifest.fragment_attachment = policy;
        self
    }

    /// 声明为片段
    pub fn fragment_of(mut self, host: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.fragment_host = Some(HostSelector {
            symbolic_name: host.into(),
            version,
        });
        self
    }

    pub fn export(mut self, package: impl Into<String>, version: &str) -> Self {
        let version = match super::version::parse_version(version) {
            Ok(v) => v,
            Err(e) => {
                self.error.get_or_insert(e.to_string());
                zero_version()
            }
        };
        self.manifest.exports.push(ExportDecl {
            package: package.into(),
            version,
        });
        self
    }

    pub fn import(mut self, package: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.imports.push(ImportDecl {
            package: package.into(),
            version,
            optional: false,
            from_module: None,
        });
        self
    }

    pub fn optional_import(mut self, package: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.imports.push(ImportDecl {
            package: package.into(),
            version,
            optional: true,
            from_module: None,
        });
        self
    }

    pub fn require(mut self, symbolic_name: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.requires.push(RequireDecl {
            symbolic_name: symbolic_name.into(),
            version,
            optional: false,
            reexport: false,
        });
        self
    }

    pub fn optional_require(mut self, symbolic_name: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.requires.push(RequireDecl {
            symbolic_name: symbolic_name.into(),
            version,
            optional: true,
            reexport: false,
        });
        self
    }

    /// 依赖并再导出
    pub fn reexport(mut self, symbolic_name: impl Into<String>, range: &str) -> Self {
        let version = self.range(range);
        self.manifest.requires.push(RequireDecl {
            symbolic_name: symbolic_name.into(),
            version,
            optional: false,
            reexport: true,
        });
        self
    }

    pub fn capability(mut self, namespace: impl Into<String>, attributes: &[(&str, &str)]) -> Self {
        self.manifest.capabilities.push(CapabilityDecl {
            namespace: namespace.into(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    pub fn requirement(mut self, namespace: impl Into<String>, attributes: &[(&str, &str)]) -> Self {
        self.manifest.requirements.push(RequirementDecl {
            namespace: namespace.into(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            version: None,
            optional: false,
        });
        self
    }

    pub fn dynamic_import(mut self, pattern: impl Into<String>) -> Self {
        self.manifest.dynamic_imports.push(pattern.into());
        self
    }

    pub fn lazy(mut self, include: &[&str]) -> Self {
        self.manifest.activation =
            ActivationPolicy::lazy(include.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn activator(mut self, name: impl Into<String>) -> Self {
        self.manifest.activator = Some(name.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.headers.insert(key.into(), value.into());
        self
    }

    /// 构建并校验清单
    pub fn build(self) -> crate::utils::Result<ModuleManifest> {
        if let Some(error) = self.error {
            return Err(crate::utils::CoreError::InvalidManifest(error));
        }
        super::parser::ManifestParser::validate(&self.manifest)?;
        Ok(self.manifest)
    }
}
