//! # 生命周期集成测试
//!
//! 测试模块的启动、停止、延迟激活与卸载，包括：
//! - 幂等的 start/stop
//! - 回调失败与超时后的状态
//! - 回调中重入运行时
//! - 生命周期事件

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chips_modular::module::{ArchiveLoaderFactory, TracingErrorSink};
use chips_modular::{
    Activator, BroadcastEventSink, CoreError, EventKind, Framework, FrameworkConfig,
    MemoryArchive, ModuleContext, ModuleManifest, ModuleState,
};
use parking_lot::Mutex;

// ============================================================================
// 测试辅助结构
// ============================================================================

/// 记录回调次数
#[derive(Default)]
struct Calls {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Calls {
    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Default)]
enum Behavior {
    #[default]
    Normal,
    FailStart,
    FailStop,
    SlowStart(Duration),
}

struct TestActivator {
    calls: Arc<Calls>,
    behavior: Behavior,
}

impl Activator for TestActivator {
    fn start(&mut self, _context: &ModuleContext) -> anyhow::Result<()> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::FailStart => anyhow::bail!("启动失败"),
            Behavior::SlowStart(delay) => {
                std::thread::sleep(delay);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn stop(&mut self, _context: &ModuleContext) -> anyhow::Result<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::FailStop => anyhow::bail!("停止失败"),
            _ => Ok(()),
        }
    }
}

struct Harness {
    framework: Framework,
    factory: Arc<ArchiveLoaderFactory>,
    errors: Arc<TracingErrorSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(FrameworkConfig::default())
    }

    fn with_config(config: FrameworkConfig) -> Self {
        let factory = Arc::new(ArchiveLoaderFactory::new());
        let errors = Arc::new(TracingErrorSink::new());
        let framework = Framework::builder()
            .config(config)
            .loader_factory(factory.clone())
            .error_sink(errors.clone())
            .build()
            .unwrap();
        Self {
            framework,
            factory,
            errors,
        }
    }

    /// 注册激活器并安装带该激活器的模块
    fn install_active(&self, name: &str, behavior: Behavior) -> (u64, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let shared = calls.clone();
        self.factory.register_activator(name, move || -> Box<dyn Activator> {
            Box::new(TestActivator {
                calls: shared.clone(),
                behavior,
            })
        });
        let manifest = ModuleManifest::builder(name, "1.0.0")
            .activator(name)
            .build()
            .unwrap();
        (self.install(manifest), calls)
    }

    fn install(&self, manifest: ModuleManifest) -> u64 {
        let location = format!("mem:{}", manifest.symbolic_name);
        self.framework
            .install(Arc::new(MemoryArchive::new(location, manifest)))
            .unwrap()
    }
}

// ============================================================================
// 启动与停止
// ============================================================================

#[test]
fn test_start_and_stop_are_idempotent() {
    let h = Harness::new();
    let (id, calls) = h.install_active("chips.counter", Behavior::Normal);

    // INSTALLED 上的 stop 不调用回调
    h.framework.stop(id).unwrap();
    assert_eq!(calls.stops(), 0);

    h.framework.start(id).unwrap();
    h.framework.start(id).unwrap();
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Active);
    assert_eq!(calls.starts(), 1);

    h.framework.stop(id).unwrap();
    h.framework.stop(id).unwrap();
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Resolved);
    assert_eq!(calls.stops(), 1);

    // 重新启动会创建新的激活器实例
    h.framework.start(id).unwrap();
    assert_eq!(calls.starts(), 2);
}

#[test]
fn test_start_reports_resolution_failure() {
    let h = Harness::new();
    let id = h.install(
        ModuleManifest::builder("chips.orphan", "1.0.0")
            .import("chips.missing", "1.0.0")
            .build()
            .unwrap(),
    );

    let err = h.framework.start(id).unwrap_err();
    assert!(err.is_resolution());
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Installed);
}

#[test]
fn test_activation_failure_rolls_back() {
    let h = Harness::new();
    let (id, calls) = h.install_active("chips.broken", Behavior::FailStart);

    let err = h.framework.start(id).unwrap_err();
    assert!(matches!(err, CoreError::Activation { module_id, .. } if module_id == id));
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Resolved);
    assert_eq!(calls.starts(), 1);
    assert_eq!(h.errors.reported(), 1);
}

#[test]
fn test_unregistered_activator_is_activation_failure() {
    let h = Harness::new();
    let id = h.install(
        ModuleManifest::builder("chips.ghost", "1.0.0")
            .activator("nobody")
            .build()
            .unwrap(),
    );

    let err = h.framework.start(id).unwrap_err();
    assert!(matches!(err, CoreError::Activation { .. }));
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Resolved);
}

#[test]
fn test_stop_failure_still_stops_module() {
    let h = Harness::new();
    let (id, calls) = h.install_active("chips.stubborn", Behavior::FailStop);
    h.framework.start(id).unwrap();

    let err = h.framework.stop(id).unwrap_err();
    assert!(matches!(err, CoreError::Deactivation { .. }));
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Resolved);
    assert_eq!(calls.stops(), 1);
    assert_eq!(h.errors.reported(), 1);
}

#[test]
fn test_fragment_cannot_start() {
    let h = Harness::new();
    h.install(ModuleManifest::builder("chips.host", "1.0.0").build().unwrap());
    let fragment = h.install(
        ModuleManifest::builder("chips.host.extra", "1.0.0")
            .fragment_of("chips.host", "1.0.0")
            .build()
            .unwrap(),
    );

    let err = h.framework.start(fragment).unwrap_err();
    assert!(err.is_illegal_state());
}

// ============================================================================
// 超时与隔离
// ============================================================================

#[test]
fn test_start_timeout_does_not_block_other_modules() {
    let config = FrameworkConfig::builder()
        .operation_timeout(Duration::from_millis(200))
        .build();
    let h = Harness::with_config(config);
    let (slow, _) = h.install_active("chips.slow", Behavior::SlowStart(Duration::from_secs(1)));
    let (fast, fast_calls) = h.install_active("chips.fast", Behavior::Normal);

    let begin = Instant::now();
    let err = h.framework.start(slow).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(h.framework.state(slow).unwrap(), ModuleState::Resolved);
    assert_eq!(h.errors.reported(), 1);

    // 慢模块的回调仍在运行，无关模块照常启动
    h.framework.start(fast).unwrap();
    assert!(begin.elapsed() < Duration::from_millis(900));
    assert_eq!(fast_calls.starts(), 1);
    assert_eq!(h.framework.state(fast).unwrap(), ModuleState::Active);
}

// ============================================================================
// 回调重入
// ============================================================================

/// 在 start 中停止自身
struct SelfStopper {
    result: Arc<Mutex<Option<CoreError>>>,
}

impl Activator for SelfStopper {
    fn start(&mut self, context: &ModuleContext) -> anyhow::Result<()> {
        if let Err(e) = context.framework().stop(context.module_id()) {
            *self.result.lock() = Some(e);
        }
        Ok(())
    }

    fn stop(&mut self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_reentrant_operation_on_same_module_is_illegal() {
    let h = Harness::new();
    let result = Arc::new(Mutex::new(None));
    let slot = result.clone();
    h.factory.register_activator("self-stopper", move || -> Box<dyn Activator> {
        Box::new(SelfStopper {
            result: slot.clone(),
        })
    });
    let id = h.install(
        ModuleManifest::builder("chips.reentrant", "1.0.0")
            .activator("self-stopper")
            .build()
            .unwrap(),
    );

    h.framework.start(id).unwrap();
    assert!(result.lock().as_ref().map(CoreError::is_illegal_state).unwrap_or(false));
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Active);
}

/// 在 start 中启动另一个模块
struct Launcher {
    target: u64,
}

impl Activator for Launcher {
    fn start(&mut self, context: &ModuleContext) -> anyhow::Result<()> {
        context.framework().start(self.target)?;
        Ok(())
    }

    fn stop(&mut self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_callback_can_start_other_module() {
    let h = Harness::new();
    let (target, calls) = h.install_active("chips.target", Behavior::Normal);
    h.factory.register_activator("launcher", move || -> Box<dyn Activator> {
        Box::new(Launcher { target })
    });
    let launcher = h.install(
        ModuleManifest::builder("chips.launcher", "1.0.0")
            .activator("launcher")
            .build()
            .unwrap(),
    );

    h.framework.start(launcher).unwrap();
    assert_eq!(h.framework.state(launcher).unwrap(), ModuleState::Active);
    assert_eq!(h.framework.state(target).unwrap(), ModuleState::Active);
    assert_eq!(calls.starts(), 1);
}

/// 线程上限为 1 时，回调中的事件投递和嵌套启动不能等待自己占用的线程
#[test]
fn test_bounded_pool_with_reentrant_callbacks() {
    let config = FrameworkConfig::builder()
        .max_workers(1)
        .operation_timeout(Duration::from_millis(300))
        .build();
    let h = Harness::with_config(config);
    let (plain, _) = h.install_active("chips.plain", Behavior::Normal);
    let (target, calls) = h.install_active("chips.target", Behavior::Normal);
    h.factory.register_activator("launcher", move || -> Box<dyn Activator> {
        Box::new(Launcher { target })
    });
    let launcher = h.install(
        ModuleManifest::builder("chips.launcher", "1.0.0")
            .activator("launcher")
            .build()
            .unwrap(),
    );

    let (tx, rx) = crossbeam_channel::bounded(1);
    let framework = h.framework.clone();
    std::thread::spawn(move || {
        let plain_started = framework.start(plain);
        let launcher_started = framework.start(launcher);
        let _ = tx.send((plain_started, launcher_started));
    });

    let (plain_started, launcher_started) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("start 未在 5 秒内返回");
    assert!(plain_started.is_ok());
    assert!(launcher_started.is_ok());
    assert_eq!(h.framework.state(plain).unwrap(), ModuleState::Active);
    assert_eq!(h.framework.state(launcher).unwrap(), ModuleState::Active);
    assert_eq!(h.framework.state(target).unwrap(), ModuleState::Active);
    assert_eq!(calls.starts(), 1);
    assert_eq!(h.framework.executor_stats().abandoned, 0);
}

// ============================================================================
// 延迟激活
// ============================================================================

fn lazy_module(h: &Harness, calls: Arc<Calls>) -> u64 {
    h.factory.register_activator("lazy", move || -> Box<dyn Activator> {
        Box::new(TestActivator {
            calls: calls.clone(),
            behavior: Behavior::Normal,
        })
    });
    let manifest = ModuleManifest::builder("chips.lazy", "1.0.0")
        .export("chips.lazy.api", "1.0.0")
        .lazy(&["chips.lazy.api"])
        .activator("lazy")
        .build()
        .unwrap();
    let archive = MemoryArchive::new("mem:lazy", manifest)
        .with_class("chips.lazy.api.Service", b"service".to_vec())
        .with_class("chips.lazy.internal.Helper", b"helper".to_vec());
    h.framework.install(Arc::new(archive)).unwrap()
}

#[test]
fn test_lazy_activation_on_first_class_load() {
    let h = Harness::new();
    let calls = Arc::new(Calls::default());
    let id = lazy_module(&h, calls.clone());

    h.framework.start(id).unwrap();
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Starting);
    assert_eq!(calls.starts(), 0);

    // 非触发包的类不激活
    assert!(h.framework.find_class(id, "chips.lazy.internal.Helper").unwrap().is_some());
    assert_eq!(calls.starts(), 0);

    let class = h.framework.find_class(id, "chips.lazy.api.Service").unwrap().unwrap();
    assert_eq!(class.bytes, b"service".to_vec());
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Active);
    assert_eq!(calls.starts(), 1);
}

#[test]
fn test_stop_cancels_pending_lazy_activation() {
    let h = Harness::new();
    let calls = Arc::new(Calls::default());
    let id = lazy_module(&h, calls.clone());

    h.framework.start(id).unwrap();
    h.framework.stop(id).unwrap();
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Resolved);

    h.framework.find_class(id, "chips.lazy.api.Service").unwrap();
    assert_eq!(calls.starts(), 0);
    assert_eq!(calls.stops(), 0);
}

// ============================================================================
// 卸载与关闭
// ============================================================================

#[test]
fn test_uninstall_is_terminal() {
    let h = Harness::new();
    let (id, calls) = h.install_active("chips.gone", Behavior::Normal);
    h.framework.start(id).unwrap();

    h.framework.uninstall(id).unwrap();
    assert_eq!(calls.stops(), 1);
    assert_eq!(h.framework.state(id).unwrap(), ModuleState::Uninstalled);
    assert!(h.framework.generations(id).unwrap().is_empty());

    assert!(h.framework.start(id).unwrap_err().is_illegal_state());
    assert!(h.framework.stop(id).unwrap_err().is_illegal_state());
    assert!(h.framework.uninstall(id).unwrap_err().is_illegal_state());
    assert!(h.framework.find_class(id, "any.Class").unwrap_err().is_illegal_state());
}

#[test]
fn test_unknown_module() {
    let h = Harness::new();
    assert!(matches!(h.framework.start(42), Err(CoreError::ModuleNotFound(42))));
}

#[test]
fn test_shutdown_stops_active_modules() {
    let h = Harness::new();
    let (a, calls_a) = h.install_active("chips.one", Behavior::Normal);
    let (b, calls_b) = h.install_active("chips.two", Behavior::Normal);
    h.framework.start(a).unwrap();
    h.framework.start(b).unwrap();

    h.framework.shutdown();
    assert_eq!(calls_a.stops(), 1);
    assert_eq!(calls_b.stops(), 1);
    assert_eq!(h.framework.state(a).unwrap(), ModuleState::Resolved);
}

// ============================================================================
// 事件
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let sink = BroadcastEventSink::new(64);
    let mut rx = sink.subscribe();
    let framework = Framework::builder()
        .event_sink(Arc::new(sink))
        .build()
        .unwrap();

    let manifest = ModuleManifest::builder("chips.events", "1.0.0").build().unwrap();
    let id = framework
        .install(Arc::new(MemoryArchive::new("mem:events", manifest)))
        .unwrap();
    framework.start(id).unwrap();
    framework.stop(id).unwrap();

    let mut kinds = Vec::new();
    let mut last_sequence = None;
    for _ in 0..6 {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.module_id, id);
        if let Some(previous) = last_sequence {
            assert!(event.sequence > previous);
        }
        last_sequence = Some(event.sequence);
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            EventKind::Installed,
            EventKind::Resolved,
            EventKind::Starting,
            EventKind::Started,
            EventKind::Stopping,
            EventKind::Stopped,
        ]
    );
}
