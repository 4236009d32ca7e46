//! 模块加载器
//!
//! 运行时不规定模块"代码"如何执行。解析完成后，[`ModuleLoaderFactory`] 为代构造一个
//! 不透明的 [`ModuleLoader`]，委托查找通过它读取代自身（以及附着片段）的内容条目。
//!
//! 类 `a.b.C` 对应内容条目 `a/b/C.class`，由所在代定义一次并缓存为 [`LoadedClass`]。

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::archive::ArchiveProvider;
use super::generation::GenerationId;
use super::metadata::ModuleManifest;
use crate::api::ModuleContext;
use crate::utils::Result;

/// 类名对应的内容条目路径
pub fn class_entry_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// 类所在的包
pub fn class_package(class_name: &str) -> &str {
    class_name
        .rsplit_once('.')
        .map(|(package, _)| package)
        .unwrap_or("")
}

/// 资源所在的包（目录部分，`/` 换成 `.`）
pub fn resource_package(path: &str) -> String {
    path.trim_start_matches('/')
        .rsplit_once('/')
        .map(|(dir, _)| dir.replace('/', "."))
        .unwrap_or_default()
}

/// 已定义的类
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    pub name: String,
    /// 定义该类的代
    pub generation: GenerationId,
    pub module_id: u64,
    pub bytes: Vec<u8>,
}

/// 资源句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub path: String,
    /// 内容所在的代（片段内容指向片段自身）
    pub generation: GenerationId,
    pub module_id: u64,
    pub bytes: Vec<u8>,
}

/// 模块激活器
///
/// 回调总是在操作执行器的工作线程上、且不持有包锁时运行。
pub trait Activator: Send {
    fn start(&mut self, context: &ModuleContext) -> anyhow::Result<()>;

    fn stop(&mut self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// 激活器工厂
pub type ActivatorFactory = Arc<dyn Fn() -> Box<dyn Activator> + Send + Sync>;

/// 一个内容来源：宿主或片段的归档
#[derive(Clone)]
pub struct ContentSource {
    pub module_id: u64,
    pub generation: GenerationId,
    pub archive: Arc<dyn ArchiveProvider>,
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentSource")
            .field("module_id", &self.module_id)
            .field("generation", &self.generation)
            .field("location", &self.archive.location())
            .finish()
    }
}

/// 构造加载器所需的信息
pub struct LoaderSpec<'a> {
    pub module_id: u64,
    pub generation: GenerationId,
    pub manifest: &'a ModuleManifest,
    /// 宿主在前，片段按模块 id 升序
    pub contents: Vec<ContentSource>,
}

/// 模块加载器
pub trait ModuleLoader: Send + Sync {
    /// 所属的代
    fn generation(&self) -> GenerationId;

    /// 按内容顺序查找条目
    ///
    /// 读取失败的条目交给 `on_error`（参数为内容所属模块）并视为不存在。
    fn find_entries(
        &self,
        path: &str,
        only_first: bool,
        on_error: &mut dyn FnMut(u64, io::Error),
    ) -> Vec<ResourceHandle>;

    /// 定义或取回已缓存的类
    fn load_class(
        &self,
        class_name: &str,
        on_error: &mut dyn FnMut(u64, io::Error),
    ) -> Option<Arc<LoadedClass>>;

    /// 为一次启动创建新的激活器实例
    fn create_activator(&self) -> anyhow::Result<Option<Box<dyn Activator>>>;

    /// 移除已附着片段的内容
    fn detach_fragment(&self, _fragment: GenerationId) {}

    /// 释放加载器
    fn close(&self) {}
}

/// 模块加载器工厂
pub trait ModuleLoaderFactory: Send + Sync {
    fn create_loader(&self, spec: LoaderSpec<'_>) -> Result<Arc<dyn ModuleLoader>>;
}

type ActivatorTable = Arc<RwLock<HashMap<String, ActivatorFactory>>>;

/// 默认加载器工厂
///
/// 内容直接从归档读取；清单中的 `activator` 名称在进程内的激活器表中查找。
#[derive(Default)]
pub struct ArchiveLoaderFactory {
    activators: ActivatorTable,
}

impl ArchiveLoaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册激活器
    pub fn register_activator<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Activator> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(activator = %name, "注册激活器");
        self.activators.write().insert(name, Arc::new(factory));
    }

    pub fn has_activator(&self, name: &str) -> bool {
        self.activators.read().contains_key(name)
    }
}

impl ModuleLoaderFactory for ArchiveLoaderFactory {
    fn create_loader(&self, spec: LoaderSpec<'_>) -> Result<Arc<dyn ModuleLoader>> {
        Ok(Arc::new(ArchiveModuleLoader {
            module_id: spec.module_id,
            generation: spec.generation,
            activator: spec.manifest.activator.clone(),
            activators: self.activators.clone(),
            contents: RwLock::new(spec.contents),
            classes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// 基于归档的加载器
pub struct ArchiveModuleLoader {
    module_id: u64,
    generation: GenerationId,
    activator: Option<String>,
    activators: ActivatorTable,
    contents: RwLock<Vec<ContentSource>>,
    classes: Mutex<HashMap<String, Arc<LoadedClass>>>,
    closed: AtomicBool,
}

impl ArchiveModuleLoader {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl ModuleLoader for ArchiveModuleLoader {
    fn generation(&self) -> GenerationId {
        self.generation
    }

    fn find_entries(
        &self,
        path: &str,
        only_first: bool,
        on_error: &mut dyn FnMut(u64, io::Error),
    ) -> Vec<ResourceHandle> {
        if self.is_closed() {
            return vec![];
        }
        let path = path.trim_start_matches('/');
        let contents = self.contents.read().clone();
        let mut found = Vec::new();
        for source in contents {
            match source.archive.read_entry(path) {
                Ok(Some(bytes)) => {
                    found.push(ResourceHandle {
                        path: path.to_string(),
                        generation: source.generation,
                        module_id: source.module_id,
                        bytes,
                    });
                    if only_first {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => on_error(source.module_id, e),
            }
        }
        found
    }

    fn load_class(
        &self,
        class_name: &str,
        on_error: &mut dyn FnMut(u64, io::Error),
    ) -> Option<Arc<LoadedClass>> {
        if let Some(class) = self.classes.lock().get(class_name) {
            return Some(class.clone());
        }

        let entry = self
            .find_entries(&class_entry_path(class_name), true, on_error)
            .into_iter()
            .next()?;

        let mut classes = self.classes.lock();
        let class = classes
            .entry(class_name.to_string())
            .or_insert_with(|| {
                Arc::new(LoadedClass {
                    name: class_name.to_string(),
                    generation: self.generation,
                    module_id: self.module_id,
                    bytes: entry.bytes,
                })
            })
            .clone();
        Some(class)
    }

    fn create_activator(&self) -> anyhow::Result<Option<Box<dyn Activator>>> {
        let Some(name) = &self.activator else {
            return Ok(None);
        };
        let factory = self
            .activators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("激活器 '{}' 未注册", name))?;
        Ok(Some(factory()))
    }

    fn detach_fragment(&self, fragment: GenerationId) {
        self.contents
            .write()
            .retain(|source| source.generation != fragment);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.classes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::archive::MemoryArchive;

    fn source(module_id: u64, archive: MemoryArchive) -> ContentSource {
        ContentSource {
            module_id,
            generation: GenerationId(module_id * 100),
            archive: Arc::new(archive),
        }
    }

    fn loader(contents: Vec<ContentSource>, activator: Option<&str>) -> (ArchiveLoaderFactory, Arc<dyn ModuleLoader>) {
        let manifest = match activator {
            Some(name) => ModuleManifest::builder("host", "1.0").activator(name),
            None => ModuleManifest::builder("host", "1.0"),
        }
        .build()
        .unwrap();
        let factory = ArchiveLoaderFactory::new();
        let loader = factory
            .create_loader(LoaderSpec {
                module_id: 1,
                generation: GenerationId(100),
                manifest: &manifest,
                contents,
            })
            .unwrap();
        (factory, loader)
    }

    fn manifest(name: &str) -> ModuleManifest {
        ModuleManifest::builder(name, "1.0").build().unwrap()
    }

    #[test]
    fn test_name_mapping() {
        assert_eq!(class_entry_path("a.b.C"), "a/b/C.class");
        assert_eq!(class_package("a.b.C"), "a.b");
        assert_eq!(class_package("Top"), "");
        assert_eq!(resource_package("a/b/x.txt"), "a.b");
        assert_eq!(resource_package("/a/x.txt"), "a");
        assert_eq!(resource_package("x.txt"), "");
    }

    #[test]
    fn test_host_before_fragments() {
        let host = MemoryArchive::new("mem:host", manifest("host")).with_entry("r.txt", "host");
        let frag = MemoryArchive::new("mem:frag", manifest("frag")).with_entry("r.txt", "frag");
        let (_, loader) = loader(vec![source(1, host), source(2, frag)], None);

        let mut errors = 0;
        let first = loader.find_entries("r.txt", true, &mut |_, _| errors += 1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].bytes, b"host".to_vec());

        let all = loader.find_entries("r.txt", false, &mut |_, _| errors += 1);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].module_id, 2);
        assert_eq!(errors, 0);
    }

    #[test]
    fn test_read_error_reported_and_skipped() {
        let host = MemoryArchive::new("mem:host", manifest("host")).with_entry("r.txt", "host");
        host.fail_reads("r.txt");
        let frag = MemoryArchive::new("mem:frag", manifest("frag")).with_entry("r.txt", "frag");
        let (_, loader) = loader(vec![source(1, host), source(2, frag)], None);

        let mut failed = Vec::new();
        let found = loader.find_entries("r.txt", true, &mut |module, _| failed.push(module));
        assert_eq!(failed, vec![1]);
        assert_eq!(found[0].bytes, b"frag".to_vec());
    }

    #[test]
    fn test_class_defined_once_by_host() {
        let host = MemoryArchive::new("mem:host", manifest("host"));
        let frag = MemoryArchive::new("mem:frag", manifest("frag")).with_class("p.C", "frag-c");
        let (_, loader) = loader(vec![source(1, host), source(2, frag)], None);

        let first = loader.load_class("p.C", &mut |_, _| {}).unwrap();
        let second = loader.load_class("p.C", &mut |_, _| {}).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.generation, GenerationId(100));
        assert_eq!(first.module_id, 1);
    }

    #[test]
    fn test_detach_fragment() {
        let host = MemoryArchive::new("mem:host", manifest("host"));
        let frag = MemoryArchive::new("mem:frag", manifest("frag")).with_entry("f.txt", "f");
        let (_, loader) = loader(vec![source(1, host), source(2, frag)], None);

        assert_eq!(loader.find_entries("f.txt", true, &mut |_, _| {}).len(), 1);
        loader.detach_fragment(GenerationId(200));
        assert!(loader.find_entries("f.txt", true, &mut |_, _| {}).is_empty());
    }

    #[test]
    fn test_unregistered_activator() {
        let (factory, loader) = loader(vec![], Some("missing"));
        assert!(loader.create_activator().is_err());
        assert!(!factory.has_activator("missing"));

        let (_, plain) = self::loader(vec![], None);
        assert!(plain.create_activator().unwrap().is_none());
    }
}
