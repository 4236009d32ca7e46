//! 委托查找
//!
//! 从某个代的加载上下文出发查找类或资源，顺序固定：
//!
//! 1. 基础加载器委托的包先交给基础加载器，找到即返回
//! 2. 已布线导入的包整体交给提供者，无论结果如何都到此为止
//! 3. 经模块依赖可见的包按声明顺序交给各提供者，第一个非空结果胜出
//! 4. 自身内容，然后按模块 id 升序查找附着片段的内容
//! 5. 第 4 步找到则返回
//! 6. 自身导出或导入的包到此返回未找到
//! 7. 匹配动态导入模式的包现场选择提供者，建立永久的边后交给它
//!
//! 读取内容的 I/O 错误报告给错误通道并按未找到处理。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::Arc;
use tracing::trace;

use super::generation::{Generation, GenerationId};
use super::loader::{class_package, resource_package, LoadedClass, ModuleLoader, ResourceHandle};
use super::metadata::ModuleManifest;
use crate::utils::CoreError;

/// 平台自身的基础加载器
pub trait BootLoader: Send + Sync {
    fn find_class(&self, name: &str) -> Option<Arc<LoadedClass>>;

    fn find_resources(&self, path: &str) -> Vec<ResourceHandle>;
}

/// 查找目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTarget<'a> {
    /// 类名，如 `a.b.C`
    Class(&'a str),
    /// 资源路径，如 `a/b/x.txt`
    Resource(&'a str),
}

impl LookupTarget<'_> {
    pub fn package(&self) -> String {
        match self {
            LookupTarget::Class(name) => class_package(name).to_string(),
            LookupTarget::Resource(path) => resource_package(path),
        }
    }

    pub fn is_class(&self) -> bool {
        matches!(self, LookupTarget::Class(_))
    }
}

/// 查找结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Found {
    Class(Arc<LoadedClass>),
    Resource(ResourceHandle),
}

impl Found {
    /// 内容所在的代
    pub fn generation(&self) -> GenerationId {
        match self {
            Found::Class(class) => class.generation,
            Found::Resource(resource) => resource.generation,
        }
    }

    pub fn module_id(&self) -> u64 {
        match self {
            Found::Class(class) => class.module_id,
            Found::Resource(resource) => resource.module_id,
        }
    }

    pub fn into_class(self) -> Option<Arc<LoadedClass>> {
        match self {
            Found::Class(class) => Some(class),
            Found::Resource(_) => None,
        }
    }

    pub fn into_resource(self) -> Option<ResourceHandle> {
        match self {
            Found::Resource(resource) => Some(resource),
            Found::Class(_) => None,
        }
    }
}

/// 查找期间需要的已解析代的信息
///
/// 在包锁下复制出来，查找本身不持锁。
#[derive(Clone)]
pub struct LookupSnapshot {
    pub generation: GenerationId,
    pub module_id: u64,
    pub manifest: Arc<ModuleManifest>,
    pub loader: Arc<dyn ModuleLoader>,
    /// 包 -> 提供者，含动态导入
    pub imports: BTreeMap<String, GenerationId>,
    pub required_packages: BTreeMap<String, Vec<GenerationId>>,
    pub exports: BTreeSet<String>,
}

impl LookupSnapshot {
    /// 已解析且有加载器的代才有快照
    pub fn of(generation: &Generation) -> Option<Self> {
        let wiring = generation.wiring.as_ref()?;
        let loader = generation.loader.clone()?;
        let mut imports: BTreeMap<String, GenerationId> = wiring
            .imports
            .iter()
            .map(|(package, wire)| (package.clone(), wire.provider))
            .collect();
        for (package, wire) in &generation.dynamic_wires {
            imports.entry(package.clone()).or_insert(wire.provider);
        }
        Some(Self {
            generation: generation.id,
            module_id: generation.module_id,
            manifest: generation.manifest.clone(),
            loader,
            imports,
            required_packages: wiring.required_packages.clone(),
            exports: wiring.exports.iter().map(|e| e.package.clone()).collect(),
        })
    }
}

/// 查找所依赖的运行时服务
pub trait LookupContext {
    fn snapshot(&self, generation: GenerationId) -> Option<LookupSnapshot>;

    /// 包是否委托给基础加载器
    fn boot_delegated(&self, package: &str) -> bool;

    fn boot_loader(&self) -> Option<&dyn BootLoader>;

    /// 为动态导入选择提供者并建立边
    fn dynamic_provider(&self, consumer: GenerationId, package: &str) -> Option<GenerationId>;

    /// 报告非致命错误
    fn report(&self, module_id: u64, error: CoreError);

    /// 代自身定义了一个类（延迟激活的触发点）
    fn class_loaded(&self, _snapshot: &LookupSnapshot, _package: &str) {}
}

/// 委托查找
pub struct DelegatingLookup<'c, C: LookupContext + ?Sized> {
    ctx: &'c C,
    visited: HashSet<GenerationId>,
}

impl<'c, C: LookupContext + ?Sized> DelegatingLookup<'c, C> {
    pub fn new(ctx: &'c C) -> Self {
        Self {
            ctx,
            visited: HashSet::new(),
        }
    }

    pub fn find_class(ctx: &'c C, generation: GenerationId, name: &str) -> Option<Arc<LoadedClass>> {
        Self::new(ctx)
            .find(generation, LookupTarget::Class(name), true)
            .into_iter()
            .find_map(Found::into_class)
    }

    pub fn find_resource(ctx: &'c C, generation: GenerationId, path: &str) -> Option<ResourceHandle> {
        Self::new(ctx)
            .find(generation, LookupTarget::Resource(path), true)
            .into_iter()
            .find_map(Found::into_resource)
    }

    pub fn find_resources(ctx: &'c C, generation: GenerationId, path: &str) -> Vec<ResourceHandle> {
        Self::new(ctx)
            .find(generation, LookupTarget::Resource(path), false)
            .into_iter()
            .filter_map(Found::into_resource)
            .collect()
    }

    /// 从 `generation` 出发查找
    pub fn find(&mut self, generation: GenerationId, target: LookupTarget<'_>, only_first: bool) -> Vec<Found> {
        let Some(snapshot) = self.ctx.snapshot(generation) else {
            return vec![];
        };
        let package = target.package();

        if !self.visited.insert(generation) {
            return self.local(&snapshot, target, &package, only_first);
        }

        if self.ctx.boot_delegated(&package) {
            if let Some(boot) = self.ctx.boot_loader() {
                let found = boot_find(boot, target, only_first);
                if !found.is_empty() {
                    trace!(%generation, package = %package, "基础加载器命中");
                    return found;
                }
            }
        }

        if let Some(&provider) = snapshot.imports.get(&package) {
            if provider == generation {
                return self.local(&snapshot, target, &package, only_first);
            }
            return self.find(provider, target, only_first);
        }

        if let Some(providers) = snapshot.required_packages.get(&package) {
            for &provider in providers {
                let found = self.find(provider, target, only_first);
                if !found.is_empty() {
                    return found;
                }
            }
        }

        let found = self.local(&snapshot, target, &package, only_first);
        if !found.is_empty() {
            return found;
        }

        if snapshot.exports.contains(&package) || snapshot.manifest.imports_package(&package) {
            return vec![];
        }

        match self.ctx.dynamic_provider(generation, &package) {
            Some(provider) => self.find(provider, target, only_first),
            None => vec![],
        }
    }

    fn local(
        &self,
        snapshot: &LookupSnapshot,
        target: LookupTarget<'_>,
        package: &str,
        only_first: bool,
    ) -> Vec<Found> {
        let mut errors: Vec<(u64, io::Error)> = Vec::new();
        let mut on_error = |owner: u64, e: io::Error| errors.push((owner, e));
        let found: Vec<Found> = match target {
            LookupTarget::Class(name) => snapshot
                .loader
                .load_class(name, &mut on_error)
                .map(Found::Class)
                .into_iter()
                .collect(),
            LookupTarget::Resource(path) => snapshot
                .loader
                .find_entries(path, only_first, &mut on_error)
                .into_iter()
                .map(Found::Resource)
                .collect(),
        };
        for (owner, e) in errors {
            self.ctx.report(owner, CoreError::Io(e));
        }
        if target.is_class() && !found.is_empty() {
            self.ctx.class_loaded(snapshot, package);
        }
        found
    }
}

fn boot_find(boot: &dyn BootLoader, target: LookupTarget<'_>, only_first: bool) -> Vec<Found> {
    match target {
        LookupTarget::Class(name) => boot.find_class(name).map(Found::Class).into_iter().collect(),
        LookupTarget::Resource(path) => {
            let mut resources = boot.find_resources(path);
            if only_first {
                resources.truncate(1);
            }
            resources.into_iter().map(Found::Resource).collect()
        }
    }
}
