//! 配置集成测试
//!
//! 测试配置文件加载、合并以及与运行时、日志配置的衔接

use std::time::Duration;

use chips_modular::{
    AbortPolicy, CoreError, Framework, FrameworkConfig, LoggerConfig, SingletonPolicy,
};
use tempfile::TempDir;

/// 测试从 YAML 文件加载配置
#[test]
fn test_load_yaml_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("chips.yaml");
    std::fs::write(
        &path,
        r#"
executor:
  operation_timeout_ms: 500
  keep_alive_ms: 1000
  abort_policy: retire
resolver:
  singleton_policy: symbolic-name
  boot_delegation: ["java.*", "sun.misc"]
logging:
  level: debug
  json_format: true
"#,
    )
    .unwrap();

    let config = FrameworkConfig::from_file(&path).unwrap();
    assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.executor.operation_timeout(), Duration::from_millis(500));
    assert_eq!(config.executor.keep_alive(), Duration::from_secs(1));
    assert_eq!(config.executor.abort_policy, AbortPolicy::Retire);
    assert_eq!(config.resolver.singleton_policy, SingletonPolicy::SymbolicName);
    assert_eq!(config.resolver.boot_delegation.len(), 2);
    assert!(!config.resolver.eager_resolve_on_install);

    let logger = LoggerConfig::from_log_config(&config.logging);
    assert_eq!(logger.level, "debug");
    assert!(logger.json_format);

    let framework = Framework::new(config).unwrap();
    assert_eq!(framework.config().executor.operation_timeout_ms, 500);
}

/// 测试 JSON 格式与缺省字段
#[test]
fn test_load_json_config_with_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("chips.json");
    std::fs::write(&path, r#"{ "resolver": { "eager_resolve_on_install": true } }"#).unwrap();

    let config = FrameworkConfig::from_file(&path).unwrap();
    assert!(config.resolver.eager_resolve_on_install);
    assert_eq!(config.executor.operation_timeout_ms, 30000);
    assert_eq!(config.logging.level, "info");
}

/// 测试无效配置
#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.yaml");
    std::fs::write(&path, "executor:\n  operation_timeout_ms: 0\n").unwrap();
    assert!(matches!(
        FrameworkConfig::from_file(&path),
        Err(CoreError::InvalidConfigValue { .. })
    ));

    assert!(matches!(
        FrameworkConfig::from_file(temp_dir.path().join("missing.yaml")),
        Err(CoreError::ConfigLoadFailed(_))
    ));

    let config = FrameworkConfig::builder().boot_delegation("ja*va").build();
    assert!(Framework::new(config).is_err());
}

/// 测试配置合并只覆盖非默认值
#[test]
fn test_merge_config() {
    let mut base = FrameworkConfig::builder()
        .operation_timeout(Duration::from_secs(5))
        .boot_delegation("java.*")
        .build();
    let overlay = FrameworkConfig::builder()
        .abort_policy(AbortPolicy::Retire)
        .boot_delegation("javax.*")
        .log_level("warn")
        .build();

    base.merge(overlay);
    assert_eq!(base.executor.operation_timeout_ms, 5000);
    assert_eq!(base.executor.abort_policy, AbortPolicy::Retire);
    assert_eq!(base.resolver.boot_delegation, vec!["java.*", "javax.*"]);
    assert_eq!(base.logging.level, "warn");
}
