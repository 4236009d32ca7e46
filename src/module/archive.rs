//! 模块归档
//!
//! 归档是模块原始内容的来源。运行时只通过 [`ArchiveProvider`] 读取清单和内容条目，
//! 存储格式完全由实现决定。

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::metadata::ModuleManifest;
use super::parser::{ManifestParser, MANIFEST_FILE};
use crate::utils::Result;

/// 归档提供者
///
/// 在所属代解析之后仍可安全调用；代被清除后 [`close`](ArchiveProvider::close)，
/// 之后的读取可以失败。
pub trait ArchiveProvider: Send + Sync {
    /// 安装位置
    fn location(&self) -> &str;

    /// 读取模块清单
    fn manifest(&self) -> Result<ModuleManifest>;

    /// 读取清单头信息
    fn attribute(&self, name: &str) -> Option<String> {
        self.manifest().ok()?.headers.get(name).cloned()
    }

    /// 列出以 `prefix` 开头的内容条目
    fn entry_paths(&self, prefix: &str) -> Vec<String>;

    /// 打开内容条目，不存在时返回 `Ok(None)`
    fn open_entry(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// 签名证书链
    fn certificate_chains(&self) -> Vec<Vec<String>> {
        vec![]
    }

    fn persisted_start_level(&self) -> u32;

    fn set_persisted_start_level(&self, level: u32);

    /// 释放归档资源
    fn close(&self) {}

    /// 读取整个条目
    fn read_entry(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match self.open_entry(path)? {
            Some(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}

/// 内存归档
///
/// 条目保存在内存中，可以注入读取失败。
pub struct MemoryArchive {
    location: String,
    manifest: ModuleManifest,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    failing: RwLock<HashSet<String>>,
    certificates: Vec<Vec<String>>,
    start_level: AtomicU32,
    closed: AtomicBool,
}

impl MemoryArchive {
    pub fn new(location: impl Into<String>, manifest: ModuleManifest) -> Self {
        Self {
            location: location.into(),
            manifest,
            entries: RwLock::new(BTreeMap::new()),
            failing: RwLock::new(HashSet::new()),
            certificates: vec![],
            start_level: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// 添加内容条目
    pub fn with_entry(self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.write().insert(path.into(), bytes.into());
        self
    }

    /// 以类名添加条目（`a.b.C` 存为 `a/b/C.class`）
    pub fn with_class(self, class_name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.with_entry(super::loader::class_entry_path(class_name), bytes)
    }

    pub fn with_certificates(mut self, chains: Vec<Vec<String>>) -> Self {
        self.certificates = chains;
        self
    }

    /// 使该条目的读取返回 IO 错误
    pub fn fail_reads(&self, path: impl Into<String>) {
        self.failing.write().insert(path.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemoryArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArchive")
            .field("location", &self.location)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl ArchiveProvider for MemoryArchive {
    fn location(&self) -> &str {
        &self.location
    }

    fn manifest(&self) -> Result<ModuleManifest> {
        Ok(self.manifest.clone())
    }

    fn entry_paths(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn open_entry(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::Other, "归档已关闭"));
        }
        if self.failing.read().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("读取条目 '{}' 失败", path),
            ));
        }
        Ok(self
            .entries
            .read()
            .get(path)
            .map(|bytes| Box::new(io::Cursor::new(bytes.clone())) as Box<dyn Read + Send>))
    }

    fn certificate_chains(&self) -> Vec<Vec<String>> {
        self.certificates.clone()
    }

    fn persisted_start_level(&self) -> u32 {
        self.start_level.load(Ordering::Relaxed)
    }

    fn set_persisted_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// 目录归档
///
/// 目录根下的 `module.yaml` 是清单，其余文件都是内容条目。
#[derive(Debug)]
pub struct DirectoryArchive {
    location: String,
    root: PathBuf,
    manifest: ModuleManifest,
    start_level: AtomicU32,
}

impl DirectoryArchive {
    /// 打开目录并解析清单
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest = ManifestParser::parse_file(&root.join(MANIFEST_FILE))?;
        Ok(Self {
            location: format!("file:{}", root.display()),
            root,
            manifest,
            start_level: AtomicU32::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect(dir: &Path, relative: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };
            if entry.file_type()?.is_dir() {
                Self::collect(&entry.path(), &path, out)?;
            } else if path != MANIFEST_FILE {
                out.push(path);
            }
        }
        Ok(())
    }
}

impl ArchiveProvider for DirectoryArchive {
    fn location(&self) -> &str {
        &self.location
    }

    fn manifest(&self) -> Result<ModuleManifest> {
        Ok(self.manifest.clone())
    }

    fn entry_paths(&self, prefix: &str) -> Vec<String> {
        let mut paths = Vec::new();
        if let Err(e) = Self::collect(&self.root, "", &mut paths) {
            tracing::warn!(location = %self.location, error = %e, "列出归档条目失败");
        }
        paths.retain(|path| path.starts_with(prefix));
        paths.sort();
        paths
    }

    fn open_entry(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        if path == MANIFEST_FILE || path.split('/').any(|part| part == "..") {
            return Ok(None);
        }
        match std::fs::File::open(self.root.join(path)) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn persisted_start_level(&self) -> u32 {
        self.start_level.load(Ordering::Relaxed)
    }

    fn set_persisted_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::Relaxed);
    }
}
