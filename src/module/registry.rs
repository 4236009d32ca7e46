//! 模块注册表
//!
//! 管理所有已安装的模块及其代，并提供包锁保护下的共享状态 [`FrameworkState`]。

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::archive::{ArchiveProvider, DirectoryArchive};
use super::events::{EventKind, FrameworkEvent};
use super::generation::{Generation, GenerationId};
use super::loader::Activator;
use super::metadata::ModuleState;
use super::parser::{ManifestParser, MANIFEST_FILE};
use super::wiring::WiringGraph;
use crate::utils::{CoreError, Result};

/// 已安装的模块
pub struct Module {
    pub id: u64,
    pub location: String,
    /// 仍存活的代，最后一个是当前代
    pub generations: Vec<GenerationId>,
    pub state: ModuleState,
    pub installed_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// ACTIVE 期间持有的激活器
    pub(crate) activator: Option<Box<dyn Activator>>,
    /// 延迟激活：已进入 STARTING，等待首次类加载
    pub(crate) lazy_pending: bool,
}

impl Module {
    fn new(id: u64, location: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            location,
            generations: vec![],
            state: ModuleState::Installed,
            installed_at: now,
            last_modified: now,
            activator: None,
            lazy_pending: false,
        }
    }

    pub fn current_generation(&self) -> Option<GenerationId> {
        self.generations.last().copied()
    }

    pub fn is_uninstalled(&self) -> bool {
        self.state == ModuleState::Uninstalled
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("generations", &self.generations)
            .field("state", &self.state)
            .field("lazy_pending", &self.lazy_pending)
            .finish()
    }
}

/// 模块注册表
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: BTreeMap<u64, Module>,
    generations: HashMap<GenerationId, Generation>,
    /// 安装位置 -> 模块 id
    locations: HashMap<String, u64>,
    next_module_id: u64,
    next_generation: u64,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
            generations: HashMap::new(),
            locations: HashMap::new(),
            next_module_id: 1,
            next_generation: 1,
        }
    }

    /// 安装模块
    ///
    /// 同一位置已安装且未卸载时返回已有模块，第二个值为 `false`。
    pub fn install(&mut self, archive: Arc<dyn ArchiveProvider>) -> Result<(u64, bool)> {
        let location = archive.location().to_string();
        if let Some(&existing) = self.locations.get(&location) {
            if self.modules.get(&existing).map(|m| !m.is_uninstalled()).unwrap_or(false) {
                debug!(location = %location, module_id = existing, "位置已安装，返回已有模块");
                return Ok((existing, false));
            }
        }

        let manifest = archive.manifest()?;
        ManifestParser::validate(&manifest)?;

        let id = self.next_module_id;
        self.next_module_id += 1;
        self.modules.insert(id, Module::new(id, location.clone()));
        self.locations.insert(location, id);
        self.add_generation(id, archive)?;
        Ok((id, true))
    }

    /// 为模块追加新的代并设为当前代
    pub fn add_generation(&mut self, module_id: u64, archive: Arc<dyn ArchiveProvider>) -> Result<GenerationId> {
        let manifest = archive.manifest()?;
        ManifestParser::validate(&manifest)?;

        let module = self
            .modules
            .get_mut(&module_id)
            .ok_or(CoreError::ModuleNotFound(module_id))?;
        let id = GenerationId(self.next_generation);
        self.next_generation += 1;

        module.generations.push(id);
        module.last_modified = Utc::now();
        self.generations
            .insert(id, Generation::new(id, module_id, manifest, archive));
        Ok(id)
    }

    /// 从注册表移除代
    pub fn remove_generation(&mut self, generation: GenerationId) -> Option<Generation> {
        let removed = self.generations.remove(&generation)?;
        if let Some(module) = self.modules.get_mut(&removed.module_id) {
            module.generations.retain(|g| *g != generation);
        }
        Some(removed)
    }

    pub fn module(&self, id: u64) -> Option<&Module> {
        self.modules.get(&id)
    }

    pub fn module_mut(&mut self, id: u64) -> Option<&mut Module> {
        self.modules.get_mut(&id)
    }

    /// 查找模块，不存在时返回 `ModuleNotFound`
    pub fn require_module(&self, id: u64) -> Result<&Module> {
        self.modules.get(&id).ok_or(CoreError::ModuleNotFound(id))
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn generation(&self, id: GenerationId) -> Option<&Generation> {
        self.generations.get(&id)
    }

    pub fn generation_mut(&mut self, id: GenerationId) -> Option<&mut Generation> {
        self.generations.get_mut(&id)
    }

    pub fn current_generation(&self, module_id: u64) -> Option<&Generation> {
        self.modules
            .get(&module_id)
            .and_then(Module::current_generation)
            .and_then(|g| self.generations.get(&g))
    }

    /// 代是否为未卸载模块的当前代
    pub fn is_current(&self, generation: GenerationId) -> bool {
        self.generations
            .get(&generation)
            .and_then(|g| self.modules.get(&g.module_id))
            .map(|m| !m.is_uninstalled() && m.current_generation() == Some(generation))
            .unwrap_or(false)
    }

    /// 所有未卸载模块的当前代，按模块 id 升序
    pub fn current_generations(&self) -> impl Iterator<Item = &Generation> {
        self.modules
            .values()
            .filter(|m| !m.is_uninstalled())
            .filter_map(|m| m.current_generation())
            .filter_map(|g| self.generations.get(&g))
    }

    /// 是否还有其他存活的代共享同一个归档
    pub fn archive_shared(&self, generation: GenerationId, archive: &Arc<dyn ArchiveProvider>) -> bool {
        let target = Arc::as_ptr(archive) as *const ();
        self.generations
            .values()
            .any(|g| g.id != generation && Arc::as_ptr(&g.archive) as *const () == target)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// 待投递的事件队列
#[derive(Debug, Default)]
pub struct EventQueue {
    sequence: u64,
    pending: VecDeque<FrameworkEvent>,
}

impl EventQueue {
    /// 按发生顺序记录事件
    pub fn record(&mut self, kind: EventKind, module_id: u64) {
        self.sequence += 1;
        self.pending
            .push_back(FrameworkEvent::new(self.sequence, kind, module_id));
    }

    pub fn drain(&mut self) -> Vec<FrameworkEvent> {
        self.pending.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 包锁保护的运行时状态
#[derive(Debug, Default)]
pub struct FrameworkState {
    pub registry: ModuleRegistry,
    pub wiring: WiringGraph,
    pub events: EventQueue,
}

impl FrameworkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新代的导出和能力（片段的贡献在附着时以宿主身份登记）
    pub fn register_generation(&mut self, generation: GenerationId) {
        if let Some(g) = self.registry.generation(generation) {
            if g.is_fragment() {
                return;
            }
            let candidate = g.candidate();
            let manifest = g.manifest.clone();
            self.wiring
                .register_generation(&candidate, &manifest.exports, &manifest.capabilities);
        }
    }

    /// 设置模块状态
    pub fn set_state(&mut self, module_id: u64, state: ModuleState) {
        if let Some(module) = self.registry.module_mut(module_id) {
            if module.state != state {
                debug!(module_id, from = %module.state, to = %state, "状态转换");
                module.state = state;
                module.last_modified = Utc::now();
            }
        }
    }

    /// 清除代
    ///
    /// 关闭加载器、注销布线、解除片段附着。代仍被其他消费者使用且未设置 `force` 时
    /// 返回 `false` 且不做任何修改。
    pub fn purge_generation(&mut self, generation: GenerationId, force: bool) -> bool {
        if !self.wiring.unregister_generation(generation, force) {
            debug!(%generation, "代仍在使用，跳过清除");
            return false;
        }
        let Some(removed) = self.registry.remove_generation(generation) else {
            return true;
        };

        if let Some(loader) = &removed.loader {
            loader.close();
        }
        if let Some(wiring) = &removed.wiring {
            for fragment in &wiring.fragments {
                self.unresolve_fragment(*fragment);
            }
            // 片段：从仍存活的宿主上解除
            for host_wire in &wiring.hosts {
                if let Some(host) = self.registry.generation_mut(host_wire.provider) {
                    if let Some(host_wiring) = host.wiring.as_mut() {
                        host_wiring.fragments.retain(|f| *f != generation);
                    }
                    if let Some(loader) = &host.loader {
                        loader.detach_fragment(generation);
                    }
                }
            }
        }
        if !self.registry.archive_shared(generation, &removed.archive) {
            removed.archive.close();
        }
        info!(%generation, module_id = removed.module_id, "代已清除");
        true
    }

    /// 宿主代被清除后，附着在它上面的片段代随之作废
    ///
    /// 当前代的片段以同一归档重建新代并回到 INSTALLED，旧代直接清除。
    fn unresolve_fragment(&mut self, fragment: GenerationId) {
        let Some((module_id, archive)) = self
            .registry
            .generation(fragment)
            .map(|g| (g.module_id, g.archive.clone()))
        else {
            return;
        };
        if self.registry.is_current(fragment) {
            if let Err(e) = self.registry.add_generation(module_id, archive) {
                warn!(module_id, error = %e, "片段重建代失败");
            }
        }
        self.purge_generation(fragment, true);

        let attached = self
            .registry
            .module(module_id)
            .map(|m| !m.is_uninstalled() && m.state != ModuleState::Installed)
            .unwrap_or(false);
        if attached {
            self.set_state(module_id, ModuleState::Installed);
            self.events.record(EventKind::Unresolved, module_id);
            debug!(module_id, %fragment, "宿主已清除，片段回到 INSTALLED");
        }
    }

    /// 模块的代中仍被其他模块使用的那些消费者所属模块
    pub fn dependents_of(&self, module_id: u64) -> Vec<u64> {
        let Some(module) = self.registry.module(module_id) else {
            return vec![];
        };
        let mut dependents: Vec<u64> = module
            .generations
            .iter()
            .flat_map(|g| self.wiring.consumers_of(*g))
            .filter_map(|c| self.registry.generation(c).map(|g| g.module_id))
            .filter(|m| *m != module_id)
            .collect();
        dependents.sort_unstable();
        dependents.dedup();
        dependents
    }
}

/// 扫描模块目录，返回包含 module.yaml 的子目录对应的归档
///
/// 解析失败的目录记录警告后跳过。
pub fn scan_module_dirs(dirs: &[PathBuf]) -> Vec<DirectoryArchive> {
    let mut archives = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "模块目录不可读，跳过");
                continue;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir() && p.join(MANIFEST_FILE).exists())
            .collect();
        paths.sort();
        for path in paths {
            match DirectoryArchive::open(&path) {
                Ok(archive) => archives.push(archive),
                Err(e) => warn!(path = %path.display(), error = %e, "模块清单无效，跳过"),
            }
        }
    }
    archives
}
