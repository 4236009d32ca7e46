//! 模块清单解析器
//!
//! 负责从 module.yaml 解析并校验模块清单。

use std::collections::HashSet;
use std::path::Path;

use crate::module::metadata::ModuleManifest;
use crate::utils::{CoreError, Result};

/// 清单文件名
pub const MANIFEST_FILE: &str = "module.yaml";

/// 模块清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 创建新的解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析模块清单
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 内容不符合 YAML 格式时返回 YAML 错误
    /// - 校验失败时返回 `InvalidManifest` 错误
    pub fn parse_file(path: &Path) -> Result<ModuleManifest> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    /// 从字符串解析模块清单
    pub fn parse_str(content: &str) -> Result<ModuleManifest> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 校验模块清单
    ///
    /// 执行以下校验：
    /// - 符号名与包名格式
    /// - 同一包不能重复导出或导入
    /// - 动态导入模式只允许末尾通配
    /// - 片段不能声明激活器或延迟激活
    pub fn validate(manifest: &ModuleManifest) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !Self::is_valid_symbolic_name(&manifest.symbolic_name) {
            errors.push(format!("符号名 '{}' 格式无效", manifest.symbolic_name));
        }

        let mut exported = HashSet::new();
        for export in &manifest.exports {
            if !Self::is_valid_package(&export.package) {
                errors.push(format!("导出包名 '{}' 格式无效", export.package));
            }
            if !exported.insert(export.package.as_str()) {
                errors.push(format!("包 '{}' 重复导出", export.package));
            }
        }

        let mut imported = HashSet::new();
        for import in &manifest.imports {
            if !Self::is_valid_package(&import.package) {
                errors.push(format!("导入包名 '{}' 格式无效", import.package));
            }
            if !imported.insert(import.package.as_str()) {
                errors.push(format!("包 '{}' 重复导入", import.package));
            }
        }

        for require in &manifest.requires {
            if !Self::is_valid_symbolic_name(&require.symbolic_name) {
                errors.push(format!("依赖模块名 '{}' 格式无效", require.symbolic_name));
            }
        }

        for requirement in &manifest.requirements {
            if requirement.namespace.is_empty() {
                errors.push("需求的命名空间不能为空".to_string());
            }
        }

        for pattern in &manifest.dynamic_imports {
            let body = pattern.strip_suffix('*').unwrap_or(pattern);
            if body.contains('*') || (pattern != "*" && body.is_empty()) {
                errors.push(format!("动态导入模式 '{}' 格式无效", pattern));
            }
        }

        if manifest.is_fragment() {
            if manifest.activator.is_some() {
                errors.push("片段不能声明激活器".to_string());
            }
            if manifest.activation.is_lazy() {
                errors.push("片段不能声明延迟激活".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidManifest(errors.join("; ")))
        }
    }

    /// 符号名：以字母开头，由字母、数字、`.`、`_`、`-` 组成
    fn is_valid_symbolic_name(name: &str) -> bool {
        match name.chars().next() {
            Some(c) if c.is_ascii_alphabetic() => name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
            _ => false,
        }
    }

    /// 包名：以 `.` 分隔的非空标识符
    fn is_valid_package(package: &str) -> bool {
        !package.is_empty()
            && package.split('.').all(|part| {
                !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            })
    }
}
