//! 解析器
//!
//! 把模块代声明的导入、模块依赖和通用需求解析为布线边。
//!
//! - 深度优先地先解析尚未解析的提供者；一次解析中已进入的代记入访问集合，
//!   在同一路径上再次遇到时视为"没有提供者"，保证环形依赖有限步内结束。
//! - 宿主解析前按模块 id 升序附着匹配的片段；必需边无法满足时卸下最后附着的片段重试，
//!   同一触发模块的解析中失败过的片段集合会被记住，不会重复尝试。
//! - 失败的尝试不留下任何边；成功时一次性提交布线、构造加载器并标记为已解析。
//! - 单例模块在提交前检查冲突，冲突过滤器可以先移除冲突候选。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::generation::{Generation, GenerationId, Namespace, Wire, Wiring};
use super::hooks::{CollisionFilter, ModuleCandidate, ResolverHook};
use super::loader::{ContentSource, LoaderSpec, ModuleLoaderFactory};
use super::metadata::{
    CapabilityDecl, ExportDecl, FragmentAttachment, ImportDecl, ModuleManifest, ModuleState,
    RequireDecl, RequirementDecl,
};
use super::registry::FrameworkState;
use super::version::VersionRange;
use super::wiring::{CapabilityRecord, ExportRecord};
use super::events::EventKind;
use crate::core::config::{ResolverConfig, SingletonPolicy};
use crate::utils::ResolutionError;

/// 解析所需的外部协作者
#[derive(Clone, Copy)]
pub struct ResolverContext<'a> {
    pub config: &'a ResolverConfig,
    pub hook: Option<&'a dyn ResolverHook>,
    pub collision_filter: Option<&'a dyn CollisionFilter>,
    pub loader_factory: &'a dyn ModuleLoaderFactory,
}

/// 一次解析的结果
#[derive(Debug, Default, Clone)]
pub struct ResolveReport {
    /// 本次新解析的模块（含被附着的片段），按解析顺序
    pub resolved: Vec<u64>,
    pub failures: Vec<ResolutionError>,
}

impl ResolveReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 解析器
///
/// 持有包锁下的状态的可变借用，整个解析过程同步完成。
pub struct Resolver<'a> {
    state: &'a mut FrameworkState,
    ctx: ResolverContext<'a>,
    visited: HashSet<GenerationId>,
    failed_sets: HashMap<(GenerationId, Vec<GenerationId>), ResolutionError>,
    resolved: Vec<u64>,
}

impl<'a> Resolver<'a> {
    pub fn new(state: &'a mut FrameworkState, ctx: ResolverContext<'a>) -> Self {
        Self {
            state,
            ctx,
            visited: HashSet::new(),
            failed_sets: HashMap::new(),
            resolved: vec![],
        }
    }

    /// 解析一组模块的当前代
    pub fn resolve(mut self, triggers: &[u64]) -> ResolveReport {
        let mut failures = vec![];
        for &module_id in triggers {
            let Some(generation) = self.state.registry.current_generation(module_id).map(|g| g.id)
            else {
                continue;
            };
            // 因环而排除的失败只对本轮成立
            self.visited.clear();
            self.failed_sets.clear();
            if let Err(e) = self.resolve_generation(generation) {
                warn!(module_id, error = %e, "模块解析失败");
                failures.push(e);
            }
        }
        ResolveReport {
            resolved: self.resolved,
            failures,
        }
    }

    /// 解析单个代
    pub fn resolve_generation(&mut self, generation: GenerationId) -> Result<(), ResolutionError> {
        if self.is_resolved(generation) {
            return Ok(());
        }
        self.visited.insert(generation);
        self.resolve_visited(generation)
    }

    /// 为代建立到 `package` 的动态导入
    ///
    /// 包已布线时返回原提供者；新建的边永久保留。
    pub fn dynamic_wire(mut self, consumer: GenerationId, package: &str) -> Option<GenerationId> {
        let generation = self.state.registry.generation(consumer)?;
        if let Some(provider) = generation.import_provider(package) {
            return Some(provider);
        }
        if !generation.is_resolved() || !generation.manifest.dynamically_imports(package) {
            return None;
        }
        let candidate = generation.candidate();
        self.visited.insert(consumer);

        let ranked = self.rank_package_providers(&candidate, package, &VersionRange::any(), None);
        for record in ranked {
            let provider = record.provider.generation;
            if provider == consumer || !self.try_provider(provider) {
                continue;
            }
            let wire = Wire {
                consumer,
                consumer_module: candidate.module_id,
                provider,
                provider_module: record.provider.module_id,
                namespace: Namespace::Package,
                name: package.to_string(),
                version: record.version.clone(),
            };
            self.state.wiring.add_wires(std::slice::from_ref(&wire));
            if let Some(g) = self.state.registry.generation_mut(consumer) {
                g.dynamic_wires.insert(package.to_string(), wire);
            }
            info!(
                module_id = candidate.module_id,
                package,
                provider_module = record.provider.module_id,
                "建立动态导入"
            );
            return Some(provider);
        }
        debug!(module_id = candidate.module_id, package, "动态导入没有提供者");
        None
    }

    fn is_resolved(&self, generation: GenerationId) -> bool {
        self.state
            .registry
            .generation(generation)
            .map(Generation::is_resolved)
            .unwrap_or(false)
    }

    /// 作为提供者尝试解析；已在访问集合中的未解析代视为不可用
    fn try_provider(&mut self, generation: GenerationId) -> bool {
        if self.is_resolved(generation) {
            return true;
        }
        if !self.visited.insert(generation) {
            return false;
        }
        self.resolve_visited(generation).is_ok()
    }

    fn resolve_visited(&mut self, generation: GenerationId) -> Result<(), ResolutionError> {
        let Some(g) = self.state.registry.generation(generation) else {
            return Err(ResolutionError::LoaderUnavailable {
                module_id: 0,
                reason: format!("代 {} 不存在", generation),
            });
        };
        if g.is_fragment() {
            return self.resolve_fragment(generation);
        }

        let mut fragments = self.pending_fragments(generation);
        loop {
            let key = (generation, fragments.clone());
            let outcome = match self.failed_sets.get(&key) {
                Some(e) => Err(e.clone()),
                None => {
                    let outcome = self.attempt(generation, &fragments);
                    if let Err(e) = &outcome {
                        self.failed_sets.insert(key, e.clone());
                    }
                    outcome
                }
            };

            match outcome {
                Ok(wiring) => return self.commit(generation, wiring),
                Err(e) => match fragments.pop() {
                    Some(detached) => {
                        debug!(%generation, fragment = %detached, error = %e, "卸下片段后重试");
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// 片段通过解析匹配的宿主完成附着
    fn resolve_fragment(&mut self, generation: GenerationId) -> Result<(), ResolutionError> {
        let Some((module_id, selector)) = self
            .state
            .registry
            .generation(generation)
            .and_then(|g| g.manifest.fragment_host.clone().map(|s| (g.module_id, s)))
        else {
            return Ok(());
        };

        let hosts: Vec<(GenerationId, bool)> = self
            .state
            .registry
            .current_generations()
            .filter(|g| {
                !g.is_fragment()
                    && g.manifest.fragment_attachment != FragmentAttachment::Never
                    && selector.matches(g.symbolic_name(), g.version())
            })
            .map(|g| (g.id, g.is_resolved()))
            .collect();

        if hosts.is_empty() {
            return Err(ResolutionError::MissingHost {
                module_id,
                host: selector.symbolic_name,
            });
        }
        for (host, resolved) in hosts {
            if !resolved {
                self.try_provider(host);
            }
        }

        if self.is_resolved(generation) {
            Ok(())
        } else {
            Err(ResolutionError::FragmentNotAttachable {
                module_id,
                reason: format!("宿主 '{}' 已解析或无法带片段解析", selector.symbolic_name),
            })
        }
    }

    /// 可附着到宿主的片段，按模块 id 升序
    ///
    /// 已附着在其他宿主上的片段代不再参与。
    fn pending_fragments(&self, host: GenerationId) -> Vec<GenerationId> {
        let Some(h) = self.state.registry.generation(host) else {
            return vec![];
        };
        if h.manifest.fragment_attachment == FragmentAttachment::Never {
            return vec![];
        }
        self.state
            .registry
            .current_generations()
            .filter(|g| {
                !g.is_resolved()
                    && g.manifest
                        .fragment_host
                        .as_ref()
                        .map(|s| s.matches(h.symbolic_name(), h.version()))
                        .unwrap_or(false)
            })
            .map(|g| g.id)
            .collect()
    }

    /// 在给定的片段集合下尝试为代建立全部必需边，不修改任何状态
    fn attempt(
        &mut self,
        generation: GenerationId,
        fragments: &[GenerationId],
    ) -> Result<Wiring, ResolutionError> {
        let Some(g) = self.state.registry.generation(generation) else {
            return Err(ResolutionError::LoaderUnavailable {
                module_id: 0,
                reason: format!("代 {} 不存在", generation),
            });
        };
        let consumer = g.candidate();
        let mut manifests: Vec<Arc<ModuleManifest>> = vec![g.manifest.clone()];
        manifests.extend(
            fragments
                .iter()
                .filter_map(|f| self.state.registry.generation(*f))
                .map(|f| f.manifest.clone()),
        );

        let exports: Vec<ExportDecl> = manifests.iter().flat_map(|m| m.exports.clone()).collect();
        let imports: Vec<ImportDecl> = manifests.iter().flat_map(|m| m.imports.clone()).collect();
        let requires: Vec<RequireDecl> = manifests.iter().flat_map(|m| m.requires.clone()).collect();
        let requirements: Vec<RequirementDecl> =
            manifests.iter().flat_map(|m| m.requirements.clone()).collect();

        let mut wiring = Wiring {
            fragments: fragments.to_vec(),
            ..Default::default()
        };
        for export in exports {
            if !wiring.exports_package(&export.package) {
                wiring.exports.push(export);
            }
        }

        for import in &imports {
            if wiring.imports.contains_key(&import.package) {
                continue;
            }
            match self.select_package_provider(&consumer, import) {
                Some(record) => {
                    wiring.imports.insert(
                        import.package.clone(),
                        Wire {
                            consumer: generation,
                            consumer_module: consumer.module_id,
                            provider: record.provider.generation,
                            provider_module: record.provider.module_id,
                            namespace: Namespace::Package,
                            name: import.package.clone(),
                            version: record.version,
                        },
                    );
                }
                None if import.optional => {
                    debug!(module_id = consumer.module_id, package = %import.package, "可选导入未布线");
                }
                None => {
                    return Err(ResolutionError::MissingImport {
                        module_id: consumer.module_id,
                        package: import.package.clone(),
                        range: import.version.to_string(),
                    });
                }
            }
        }

        let mut reexports = Vec::new();
        for require in &requires {
            match self.select_module_provider(&consumer, require) {
                Some(provider) => {
                    if require.reexport {
                        reexports.push(provider.generation);
                    }
                    wiring.requires.push(Wire {
                        consumer: generation,
                        consumer_module: consumer.module_id,
                        provider: provider.generation,
                        provider_module: provider.module_id,
                        namespace: Namespace::Module,
                        name: require.symbolic_name.clone(),
                        version: provider.version,
                    });
                }
                None if require.optional => {
                    debug!(module_id = consumer.module_id, require = %require.symbolic_name, "可选模块依赖未布线");
                }
                None => {
                    return Err(ResolutionError::MissingRequire {
                        module_id: consumer.module_id,
                        symbolic_name: require.symbolic_name.clone(),
                        range: require.version.to_string(),
                    });
                }
            }
        }

        for requirement in &requirements {
            match self.select_capability_provider(&consumer, requirement) {
                Some(record) => {
                    wiring.capabilities.push(Wire {
                        consumer: generation,
                        consumer_module: consumer.module_id,
                        provider: record.provider.generation,
                        provider_module: record.provider.module_id,
                        namespace: Namespace::Generic(requirement.namespace.clone()),
                        name: requirement.namespace.clone(),
                        version: record.provider.version,
                    });
                }
                None if requirement.optional => {}
                None => {
                    return Err(ResolutionError::MissingCapability {
                        module_id: consumer.module_id,
                        namespace: requirement.namespace.clone(),
                    });
                }
            }
        }

        for wire in &wiring.requires {
            for package in self.visible_packages(wire.provider) {
                let providers = wiring.required_packages.entry(package).or_default();
                if !providers.contains(&wire.provider) {
                    providers.push(wire.provider);
                }
            }
        }
        for provider in reexports {
            wiring.reexported.extend(self.visible_packages(provider));
        }

        Ok(wiring)
    }

    fn visible_packages(&self, generation: GenerationId) -> Vec<String> {
        self.state
            .registry
            .generation(generation)
            .and_then(|g| g.wiring.as_ref())
            .map(|w| w.visible_packages().into_iter().collect())
            .unwrap_or_default()
    }

    /// 候选提供者：当前代，已解析或尚未进入本次解析
    fn eligible(&self, generation: GenerationId, consumer: &ModuleCandidate) -> bool {
        if generation == consumer.generation {
            return true;
        }
        self.state.registry.is_current(generation)
            && (self.is_resolved(generation) || !self.visited.contains(&generation))
    }

    fn rank_package_providers(
        &self,
        consumer: &ModuleCandidate,
        package: &str,
        range: &VersionRange,
        from_module: Option<&str>,
    ) -> Vec<ExportRecord> {
        self.state.wiring.ranked_providers(
            consumer,
            package,
            range,
            |record| {
                from_module
                    .map(|name| name == record.provider.symbolic_name)
                    .unwrap_or(true)
                    && self.eligible(record.provider.generation, consumer)
            },
            |generation| self.is_resolved(generation),
            self.ctx.hook,
        )
    }

    fn select_package_provider(
        &mut self,
        consumer: &ModuleCandidate,
        import: &ImportDecl,
    ) -> Option<ExportRecord> {
        let ranked = self.rank_package_providers(
            consumer,
            &import.package,
            &import.version,
            import.from_module.as_deref(),
        );
        ranked.into_iter().find(|record| {
            record.provider.generation == consumer.generation
                || self.try_provider(record.provider.generation)
        })
    }

    fn select_module_provider(
        &mut self,
        consumer: &ModuleCandidate,
        require: &RequireDecl,
    ) -> Option<ModuleCandidate> {
        let mut candidates: Vec<ModuleCandidate> = self
            .state
            .registry
            .current_generations()
            .filter(|g| {
                !g.is_fragment()
                    && g.module_id != consumer.module_id
                    && g.symbolic_name() == require.symbolic_name
                    && require.version.includes(g.version())
                    && (g.is_resolved() || !self.visited.contains(&g.id))
            })
            .map(Generation::candidate)
            .collect();
        if let Some(hook) = self.ctx.hook {
            hook.filter_providers(consumer, &mut candidates);
        }
        candidates.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| self.is_resolved(b.generation).cmp(&self.is_resolved(a.generation)))
                .then_with(|| a.module_id.cmp(&b.module_id))
        });
        candidates
            .into_iter()
            .find(|candidate| self.try_provider(candidate.generation))
    }

    fn select_capability_provider(
        &mut self,
        consumer: &ModuleCandidate,
        requirement: &RequirementDecl,
    ) -> Option<CapabilityRecord> {
        let mut records: Vec<CapabilityRecord> = self
            .state
            .wiring
            .capability_candidates(requirement)
            .into_iter()
            .filter(|r| self.eligible(r.provider.generation, consumer))
            .collect();
        if let Some(hook) = self.ctx.hook {
            let mut visible: Vec<ModuleCandidate> = records.iter().map(|r| r.provider.clone()).collect();
            hook.filter_providers(consumer, &mut visible);
            records.retain(|r| visible.iter().any(|v| v.generation == r.provider.generation));
        }
        records.sort_by(|a, b| {
            self.is_resolved(b.provider.generation)
                .cmp(&self.is_resolved(a.provider.generation))
                .then_with(|| a.provider.module_id.cmp(&b.provider.module_id))
        });
        records.into_iter().find(|record| {
            record.provider.generation == consumer.generation
                || self.try_provider(record.provider.generation)
        })
    }

    /// 单例冲突检查
    fn check_singleton(&self, generation: GenerationId) -> Result<(), ResolutionError> {
        let Some(g) = self.state.registry.generation(generation) else {
            return Ok(());
        };
        if !g.manifest.singleton {
            return Ok(());
        }
        let same_version = self.ctx.config.singleton_policy == SingletonPolicy::SymbolicNameAndVersion;
        let registry = &self.state.registry;
        let mut collisions: Vec<ModuleCandidate> = registry
            .modules()
            .filter(|m| !m.is_uninstalled() && m.id != g.module_id)
            .flat_map(|m| m.generations.iter())
            .filter_map(|id| registry.generation(*id))
            .filter(|other| {
                other.is_resolved()
                    && other.manifest.singleton
                    && other.symbolic_name() == g.symbolic_name()
                    && (!same_version || other.version() == g.version())
            })
            .map(Generation::candidate)
            .collect();

        if collisions.is_empty() {
            return Ok(());
        }
        if let Some(filter) = self.ctx.collision_filter {
            filter.filter_collisions(&g.candidate(), &mut collisions);
        }
        if collisions.is_empty() {
            return Ok(());
        }
        Err(ResolutionError::DuplicateSingleton {
            module_id: g.module_id,
            symbolic_name: g.symbolic_name().to_string(),
            conflicts: collisions.iter().map(|c| c.module_id).collect(),
        })
    }

    /// 提交布线：构造加载器、登记边、附着片段、更新状态
    fn commit(&mut self, generation: GenerationId, wiring: Wiring) -> Result<(), ResolutionError> {
        self.check_singleton(generation)?;

        let Some(g) = self.state.registry.generation(generation) else {
            return Ok(());
        };
        let candidate = g.candidate();
        let manifest = g.manifest.clone();

        let mut contents = vec![ContentSource {
            module_id: g.module_id,
            generation,
            archive: g.archive.clone(),
        }];
        let mut fragment_exports: Vec<ExportDecl> = vec![];
        let mut fragment_capabilities: Vec<CapabilityDecl> = vec![];
        for f in &wiring.fragments {
            if let Some(fg) = self.state.registry.generation(*f) {
                contents.push(ContentSource {
                    module_id: fg.module_id,
                    generation: fg.id,
                    archive: fg.archive.clone(),
                });
                fragment_exports.extend(fg.manifest.exports.iter().cloned());
                fragment_capabilities.extend(fg.manifest.capabilities.iter().cloned());
            }
        }

        let loader = self
            .ctx
            .loader_factory
            .create_loader(LoaderSpec {
                module_id: candidate.module_id,
                generation,
                manifest: &manifest,
                contents,
            })
            .map_err(|e| ResolutionError::LoaderUnavailable {
                module_id: candidate.module_id,
                reason: e.to_string(),
            })?;

        let wires = wiring.wires();
        self.state.wiring.add_wires(&wires);
        if !fragment_exports.is_empty() || !fragment_capabilities.is_empty() {
            self.state
                .wiring
                .register_generation(&candidate, &fragment_exports, &fragment_capabilities);
        }

        let fragments = wiring.fragments.clone();
        if let Some(g) = self.state.registry.generation_mut(generation) {
            g.wiring = Some(wiring);
            g.loader = Some(loader);
        }
        self.mark_resolved(candidate.module_id, generation);

        for fragment in &fragments {
            let Some(fragment_module) = self.state.registry.generation(*fragment).map(|f| f.module_id)
            else {
                continue;
            };
            let host_wire = Wire {
                consumer: *fragment,
                consumer_module: fragment_module,
                provider: generation,
                provider_module: candidate.module_id,
                namespace: Namespace::Host,
                name: candidate.symbolic_name.clone(),
                version: candidate.version.clone(),
            };
            self.state.wiring.add_wires(std::slice::from_ref(&host_wire));
            if let Some(fg) = self.state.registry.generation_mut(*fragment) {
                match fg.wiring.as_mut() {
                    Some(w) => w.hosts.push(host_wire),
                    None => {
                        fg.wiring = Some(Wiring {
                            hosts: vec![host_wire],
                            ..Default::default()
                        })
                    }
                }
            }
            self.mark_resolved(fragment_module, *fragment);
        }

        info!(
            module_id = candidate.module_id,
            %generation,
            wires = wires.len(),
            fragments = fragments.len(),
            "模块已解析"
        );
        Ok(())
    }

    fn mark_resolved(&mut self, module_id: u64, generation: GenerationId) {
        if !self.state.registry.is_current(generation) {
            return;
        }
        let installed = self
            .state
            .registry
            .module(module_id)
            .map(|m| m.state == ModuleState::Installed)
            .unwrap_or(false);
        if installed {
            self.state.set_state(module_id, ModuleState::Resolved);
            self.state.events.record(EventKind::Resolved, module_id);
            self.resolved.push(module_id);
        }
    }
}
