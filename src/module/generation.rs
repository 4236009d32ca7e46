//! 模块代与布线
//!
//! 每次安装或更新都会为模块追加一个新的代。代在解析前没有布线也没有加载器；
//! 解析后布线固定，直到被清除都不会回到未解析状态。

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::archive::ArchiveProvider;
use super::hooks::ModuleCandidate;
use super::loader::ModuleLoader;
use super::metadata::{ExportDecl, ModuleManifest};

/// 代标识，全局单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// 布线命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// 包导入
    Package,
    /// 整模块依赖
    Module,
    /// 片段到宿主
    Host,
    /// 通用能力
    Generic(String),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Package => f.write_str("package"),
            Namespace::Module => f.write_str("module"),
            Namespace::Host => f.write_str("host"),
            Namespace::Generic(ns) => f.write_str(ns),
        }
    }
}

/// 从消费者代到提供者代的已解析依赖边，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wire {
    pub consumer: GenerationId,
    pub consumer_module: u64,
    pub provider: GenerationId,
    pub provider_module: u64,
    pub namespace: Namespace,
    /// 匹配到的包名、模块名或能力命名空间
    pub name: String,
    /// 提供方的版本
    pub version: Version,
}

/// 代的完整布线
#[derive(Debug, Clone, Default)]
pub struct Wiring {
    /// 包导入：包名 -> 边
    pub imports: BTreeMap<String, Wire>,
    /// 整模块依赖，按声明顺序
    pub requires: Vec<Wire>,
    /// 通用能力依赖
    pub capabilities: Vec<Wire>,
    /// 片段到宿主的边（仅片段）
    pub hosts: Vec<Wire>,
    /// 已附着的片段，按模块 id 升序（仅宿主）
    pub fragments: Vec<GenerationId>,
    /// 生效的导出（自身加片段贡献）
    pub exports: Vec<ExportDecl>,
    /// 经由模块依赖可见的包：包名 -> 按声明顺序的提供者
    pub required_packages: BTreeMap<String, Vec<GenerationId>>,
    /// 经再导出依赖对自己的依赖者可见的包
    pub reexported: BTreeSet<String>,
}

impl Wiring {
    /// 所有静态布线边
    pub fn wires(&self) -> Vec<Wire> {
        self.imports
            .values()
            .chain(self.requires.iter())
            .chain(self.capabilities.iter())
            .chain(self.hosts.iter())
            .cloned()
            .collect()
    }

    pub fn exports_package(&self, package: &str) -> bool {
        self.exports.iter().any(|e| e.package == package)
    }

    /// 依赖该代的模块可以看到的包
    pub fn visible_packages(&self) -> BTreeSet<String> {
        self.exports
            .iter()
            .map(|e| e.package.clone())
            .chain(self.reexported.iter().cloned())
            .collect()
    }
}

/// 模块代
pub struct Generation {
    pub id: GenerationId,
    pub module_id: u64,
    pub manifest: Arc<ModuleManifest>,
    pub archive: Arc<dyn ArchiveProvider>,
    /// 已解析时为 `Some`
    pub wiring: Option<Wiring>,
    /// 动态导入建立的边，一经建立永久保留
    pub dynamic_wires: BTreeMap<String, Wire>,
    pub loader: Option<Arc<dyn ModuleLoader>>,
}

impl Generation {
    pub fn new(
        id: GenerationId,
        module_id: u64,
        manifest: ModuleManifest,
        archive: Arc<dyn ArchiveProvider>,
    ) -> Self {
        Self {
            id,
            module_id,
            manifest: Arc::new(manifest),
            archive,
            wiring: None,
            dynamic_wires: BTreeMap::new(),
            loader: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.wiring.is_some()
    }

    pub fn is_fragment(&self) -> bool {
        self.manifest.is_fragment()
    }

    pub fn symbolic_name(&self) -> &str {
        &self.manifest.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// 该代的所有边，包括动态导入
    pub fn wires(&self) -> Vec<Wire> {
        let mut wires = self.wiring.as_ref().map(Wiring::wires).unwrap_or_default();
        wires.extend(self.dynamic_wires.values().cloned());
        wires
    }

    /// 包导入的提供者，包括动态导入
    pub fn import_provider(&self, package: &str) -> Option<GenerationId> {
        self.wiring
            .as_ref()
            .and_then(|w| w.imports.get(package))
            .or_else(|| self.dynamic_wires.get(package))
            .map(|wire| wire.provider)
    }

    pub fn candidate(&self) -> ModuleCandidate {
        ModuleCandidate {
            module_id: self.module_id,
            generation: self.id,
            symbolic_name: self.manifest.symbolic_name.clone(),
            version: self.manifest.version.clone(),
        }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("module_id", &self.module_id)
            .field("symbolic_name", &self.manifest.symbolic_name)
            .field("version", &self.manifest.version.to_string())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::archive::MemoryArchive;

    fn wire(consumer: u64, provider: u64, namespace: Namespace, name: &str) -> Wire {
        Wire {
            consumer: GenerationId(consumer),
            consumer_module: consumer,
            provider: GenerationId(provider),
            provider_module: provider,
            namespace,
            name: name.to_string(),
            version: Version::new(1, 0, 0),
        }
    }

    #[test]
    fn test_generation_id_display() {
        assert_eq!(GenerationId(12).to_string(), "g12");
        assert!(GenerationId(1) < GenerationId(2));
    }

    #[test]
    fn test_unresolved_generation_has_no_wires() {
        let manifest = ModuleManifest::builder("a", "1.0").build().unwrap();
        let archive = Arc::new(MemoryArchive::new("mem:a", manifest.clone()));
        let generation = Generation::new(GenerationId(1), 1, manifest, archive);

        assert!(!generation.is_resolved());
        assert!(generation.wires().is_empty());
        assert_eq!(generation.import_provider("pkg.x"), None);
    }

    #[test]
    fn test_dynamic_wire_is_visible_as_import() {
        let manifest = ModuleManifest::builder("a", "1.0").build().unwrap();
        let archive = Arc::new(MemoryArchive::new("mem:a", manifest.clone()));
        let mut generation = Generation::new(GenerationId(1), 1, manifest, archive);
        generation.wiring = Some(Wiring::default());
        generation
            .dynamic_wires
            .insert("ext.x".to_string(), wire(1, 2, Namespace::Package, "ext.x"));

        assert_eq!(generation.import_provider("ext.x"), Some(GenerationId(2)));
        assert_eq!(generation.wires().len(), 1);
    }

    #[test]
    fn test_wiring_collects_all_wires() {
        let mut wiring = Wiring::default();
        wiring
            .imports
            .insert("p".to_string(), wire(1, 2, Namespace::Package, "p"));
        wiring.requires.push(wire(1, 3, Namespace::Module, "m"));
        wiring
            .capabilities
            .push(wire(1, 4, Namespace::Generic("ext".to_string()), "ext"));
        assert_eq!(wiring.wires().len(), 3);
        assert_eq!(Namespace::Generic("ext".to_string()).to_string(), "ext");
    }
}
