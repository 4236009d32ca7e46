//! 布线图
//!
//! 按包名记录所有已知的导出记录以及需要该包的消费者，按命名空间记录通用能力，
//! 并维护提供者到消费者的反向边。
//!
//! # 示例
//!
//! ```rust
//! use chips_modular::module::generation::GenerationId;
//! use chips_modular::module::hooks::ModuleCandidate;
//! use chips_modular::module::metadata::ExportDecl;
//! use chips_modular::module::version::VersionRange;
//! use chips_modular::module::wiring::WiringGraph;
//! use semver::Version;
//!
//! let provider = ModuleCandidate {
//!     module_id: 1,
//!     generation: GenerationId(1),
//!     symbolic_name: "chips.a".to_string(),
//!     version: Version::new(1, 0, 0),
//! };
//! let mut graph = WiringGraph::new();
//! graph.register_generation(
//!     &provider,
//!     &[ExportDecl { package: "pkg.x".to_string(), version: Version::new(1, 0, 0) }],
//!     &[],
//! );
//!
//! let consumer = ModuleCandidate { module_id: 2, generation: GenerationId(2), ..provider.clone() };
//! let range = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
//! let best = graph.best_provider(&consumer, "pkg.x", &range, |_| true, |_| true, None);
//! assert_eq!(best.map(|r| r.provider.module_id), Some(1));
//! ```

use semver::Version;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::generation::{GenerationId, Namespace, Wire};
use super::hooks::{ModuleCandidate, ResolverHook};
use super::metadata::{CapabilityDecl, ExportDecl, RequirementDecl};
use super::version::VersionRange;

/// 导出记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub provider: ModuleCandidate,
    pub package: String,
    pub version: Version,
}

/// 能力记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub provider: ModuleCandidate,
    pub capability: CapabilityDecl,
}

/// 布线图
#[derive(Debug, Default)]
pub struct WiringGraph {
    /// 包名 -> 导出记录
    exports: HashMap<String, Vec<ExportRecord>>,
    /// 命名空间 -> 能力记录
    capabilities: HashMap<String, Vec<CapabilityRecord>>,
    /// 提供者 -> 消费者
    consumers: HashMap<GenerationId, BTreeSet<GenerationId>>,
    /// 消费者 -> 边
    outgoing: HashMap<GenerationId, Vec<Wire>>,
    /// 包名 -> 已布线的导入方
    importers: HashMap<String, BTreeSet<GenerationId>>,
}

impl WiringGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记代的导出和能力
    ///
    /// 片段附着时以宿主的身份再次登记片段贡献的导出。
    pub fn register_generation(
        &mut self,
        provider: &ModuleCandidate,
        exports: &[ExportDecl],
        capabilities: &[CapabilityDecl],
    ) {
        for export in exports {
            let records = self.exports.entry(export.package.clone()).or_default();
            let exists = records
                .iter()
                .any(|r| r.provider.generation == provider.generation && r.version == export.version);
            if !exists {
                records.push(ExportRecord {
                    provider: provider.clone(),
                    package: export.package.clone(),
                    version: export.version.clone(),
                });
            }
        }
        for capability in capabilities {
            self.capabilities
                .entry(capability.namespace.clone())
                .or_default()
                .push(CapabilityRecord {
                    provider: provider.clone(),
                    capability: capability.clone(),
                });
        }
    }

    /// 注销代
    ///
    /// 其导出仍有其他消费者时返回 `false` 且不做任何修改，除非 `force`。
    pub fn unregister_generation(&mut self, generation: GenerationId, force: bool) -> bool {
        if !force && !self.consumers_of(generation).is_empty() {
            return false;
        }

        for records in self.exports.values_mut() {
            records.retain(|r| r.provider.generation != generation);
        }
        self.exports.retain(|_, records| !records.is_empty());
        for records in self.capabilities.values_mut() {
            records.retain(|r| r.provider.generation != generation);
        }
        self.capabilities.retain(|_, records| !records.is_empty());

        if let Some(wires) = self.outgoing.remove(&generation) {
            for wire in wires {
                if let Some(set) = self.consumers.get_mut(&wire.provider) {
                    set.remove(&generation);
                }
                if wire.namespace == Namespace::Package {
                    if let Some(set) = self.importers.get_mut(&wire.name) {
                        set.remove(&generation);
                    }
                }
            }
        }
        self.consumers.remove(&generation);
        self.consumers.retain(|_, set| !set.is_empty());
        self.importers.retain(|_, set| !set.is_empty());
        true
    }

    /// 记录已提交的边
    pub fn add_wires(&mut self, wires: &[Wire]) {
        for wire in wires {
            self.consumers
                .entry(wire.provider)
                .or_default()
                .insert(wire.consumer);
            if wire.namespace == Namespace::Package {
                self.importers
                    .entry(wire.name.clone())
                    .or_default()
                    .insert(wire.consumer);
            }
            self.outgoing.entry(wire.consumer).or_default().push(wire.clone());
        }
    }

    /// 消费者的所有边
    pub fn wires_of(&self, consumer: GenerationId) -> &[Wire] {
        self.outgoing.get(&consumer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 提供者的消费者（不含自身）
    pub fn consumers_of(&self, provider: GenerationId) -> Vec<GenerationId> {
        self.consumers
            .get(&provider)
            .map(|set| set.iter().copied().filter(|c| *c != provider).collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, provider: GenerationId) -> usize {
        self.consumers_of(provider).len()
    }

    /// 已布线导入该包的代
    pub fn importers_of(&self, package: &str) -> Vec<GenerationId> {
        self.importers
            .get(package)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn export_candidates(&self, package: &str) -> &[ExportRecord] {
        self.exports.get(package).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 按提供者选择规则排序的候选
    ///
    /// 依次比较：版本从高到低；已有消费者数从多到少；已解析优先；模块 id 从小到大。
    /// 被解析钩子否决的候选不会出现在结果中。
    pub fn ranked_providers(
        &self,
        consumer: &ModuleCandidate,
        package: &str,
        range: &VersionRange,
        eligible: impl Fn(&ExportRecord) -> bool,
        is_resolved: impl Fn(GenerationId) -> bool,
        hook: Option<&dyn ResolverHook>,
    ) -> Vec<ExportRecord> {
        let mut records: Vec<ExportRecord> = self
            .export_candidates(package)
            .iter()
            .filter(|r| range.includes(&r.version) && eligible(r))
            .cloned()
            .collect();

        if let Some(hook) = hook {
            let mut seen = HashSet::new();
            let mut visible: Vec<ModuleCandidate> = records
                .iter()
                .filter(|r| seen.insert(r.provider.generation))
                .map(|r| r.provider.clone())
                .collect();
            hook.filter_providers(consumer, &mut visible);
            let visible: HashSet<GenerationId> = visible.iter().map(|c| c.generation).collect();
            records.retain(|r| visible.contains(&r.provider.generation));
        }

        records.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| {
                    self.consumer_count(b.provider.generation)
                        .cmp(&self.consumer_count(a.provider.generation))
                })
                .then_with(|| {
                    match (
                        is_resolved(a.provider.generation),
                        is_resolved(b.provider.generation),
                    ) {
                        (true, false) => Ordering::Less,
                        (false, true) => Ordering::Greater,
                        _ => Ordering::Equal,
                    }
                })
                .then_with(|| a.provider.module_id.cmp(&b.provider.module_id))
        });
        records
    }

    /// 最佳提供者
    pub fn best_provider(
        &self,
        consumer: &ModuleCandidate,
        package: &str,
        range: &VersionRange,
        eligible: impl Fn(&ExportRecord) -> bool,
        is_resolved: impl Fn(GenerationId) -> bool,
        hook: Option<&dyn ResolverHook>,
    ) -> Option<ExportRecord> {
        self.ranked_providers(consumer, package, range, eligible, is_resolved, hook)
            .into_iter()
            .next()
    }

    /// 满足通用需求的能力
    pub fn capability_candidates(&self, requirement: &RequirementDecl) -> Vec<CapabilityRecord> {
        self.capabilities
            .get(&requirement.namespace)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| requirement.matched_by(&r.capability))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(module_id: u64, generation: u64) -> ModuleCandidate {
        ModuleCandidate {
            module_id,
            generation: GenerationId(generation),
            symbolic_name: format!("m{}", module_id),
            version: Version::new(1, 0, 0),
        }
    }

    fn export(package: &str, version: &str) -> ExportDecl {
        ExportDecl {
            package: package.to_string(),
            version: Version::parse(version).unwrap(),
        }
    }

    fn package_wire(consumer: &ModuleCandidate, provider: &ModuleCandidate, package: &str) -> Wire {
        Wire {
            consumer: consumer.generation,
            consumer_module: consumer.module_id,
            provider: provider.generation,
            provider_module: provider.module_id,
            namespace: Namespace::Package,
            name: package.to_string(),
            version: Version::new(1, 0, 0),
        }
    }

    fn best(graph: &WiringGraph, consumer: &ModuleCandidate, package: &str) -> Option<u64> {
        graph
            .best_provider(consumer, package, &VersionRange::any(), |_| true, |_| true, None)
            .map(|r| r.provider.module_id)
    }

    #[test]
    fn test_highest_version_wins() {
        let mut graph = WiringGraph::new();
        graph.register_generation(&candidate(1, 1), &[export("p", "1.0.0")], &[]);
        graph.register_generation(&candidate(2, 2), &[export("p", "1.5.0")], &[]);

        assert_eq!(best(&graph, &candidate(9, 9), "p"), Some(2));

        let narrow = VersionRange::parse("[1.0.0,1.5.0)").unwrap();
        let chosen = graph.best_provider(&candidate(9, 9), "p", &narrow, |_| true, |_| true, None);
        assert_eq!(chosen.map(|r| r.provider.module_id), Some(1));
    }

    #[test]
    fn test_equal_version_prefers_existing_consumers() {
        let mut graph = WiringGraph::new();
        let a = candidate(1, 1);
        let b = candidate(2, 2);
        graph.register_generation(&a, &[export("p", "1.0.0")], &[]);
        graph.register_generation(&b, &[export("p", "1.0.0")], &[]);
        assert_eq!(best(&graph, &candidate(9, 9), "p"), Some(1));

        graph.add_wires(&[package_wire(&candidate(5, 5), &b, "p")]);
        assert_eq!(best(&graph, &candidate(9, 9), "p"), Some(2));
        assert_eq!(graph.importers_of("p"), vec![GenerationId(5)]);
    }

    #[test]
    fn test_resolved_preferred_on_tie() {
        let mut graph = WiringGraph::new();
        graph.register_generation(&candidate(1, 1), &[export("p", "1.0.0")], &[]);
        graph.register_generation(&candidate(2, 2), &[export("p", "1.0.0")], &[]);

        let chosen = graph.best_provider(
            &candidate(9, 9),
            "p",
            &VersionRange::any(),
            |_| true,
            |g| g == GenerationId(2),
            None,
        );
        assert_eq!(chosen.map(|r| r.provider.module_id), Some(2));
    }

    #[test]
    fn test_hook_vetoes_provider() {
        let mut graph = WiringGraph::new();
        graph.register_generation(&candidate(1, 1), &[export("p", "2.0.0")], &[]);
        graph.register_generation(&candidate(2, 2), &[export("p", "1.0.0")], &[]);

        let hook = |_c: &ModuleCandidate, p: &ModuleCandidate| p.module_id != 1;
        let chosen = graph.best_provider(
            &candidate(9, 9),
            "p",
            &VersionRange::any(),
            |_| true,
            |_| true,
            Some(&hook),
        );
        assert_eq!(chosen.map(|r| r.provider.module_id), Some(2));
    }

    #[test]
    fn test_unregister_refuses_while_in_use() {
        let mut graph = WiringGraph::new();
        let provider = candidate(1, 1);
        let consumer = candidate(2, 2);
        graph.register_generation(&provider, &[export("p", "1.0.0")], &[]);
        graph.add_wires(&[package_wire(&consumer, &provider, "p")]);

        assert!(!graph.unregister_generation(GenerationId(1), false));
        assert_eq!(graph.export_candidates("p").len(), 1);

        assert!(graph.unregister_generation(GenerationId(1), true));
        assert!(graph.export_candidates("p").is_empty());
        assert!(graph.consumers_of(GenerationId(1)).is_empty());
    }

    #[test]
    fn test_unregister_consumer_releases_provider() {
        let mut graph = WiringGraph::new();
        let provider = candidate(1, 1);
        let consumer = candidate(2, 2);
        graph.register_generation(&provider, &[export("p", "1.0.0")], &[]);
        graph.add_wires(&[package_wire(&consumer, &provider, "p")]);

        assert!(graph.unregister_generation(GenerationId(2), false));
        assert_eq!(graph.consumer_count(GenerationId(1)), 0);
        assert!(graph.importers_of("p").is_empty());
        assert!(graph.unregister_generation(GenerationId(1), false));
    }

    #[test]
    fn test_self_wire_does_not_block_unregister() {
        let mut graph = WiringGraph::new();
        let module = candidate(1, 1);
        graph.register_generation(&module, &[export("p", "1.0.0")], &[]);
        graph.add_wires(&[package_wire(&module, &module, "p")]);
        assert!(graph.unregister_generation(GenerationId(1), false));
    }

    #[test]
    fn test_capability_candidates() {
        let mut graph = WiringGraph::new();
        let capability = CapabilityDecl {
            namespace: "chips.extender".to_string(),
            attributes: [("type".to_string(), "codec".to_string())].into_iter().collect(),
        };
        graph.register_generation(&candidate(1, 1), &[], &[capability]);

        let requirement = RequirementDecl {
            namespace: "chips.extender".to_string(),
            attributes: [("type".to_string(), "codec".to_string())].into_iter().collect(),
            version: None,
            optional: false,
        };
        assert_eq!(graph.capability_candidates(&requirement).len(), 1);

        let other = RequirementDecl {
            attributes: [("type".to_string(), "ui".to_string())].into_iter().collect(),
            ..requirement
        };
        assert!(graph.capability_candidates(&other).is_empty());
    }
}
