//! Framework
//!
//! 动态模块运行时的对外接口。所有注册、解析和状态记账都在包锁下同步完成；
//! 模块回调交给操作执行器，在不持有包锁的工作线程上运行，因此回调可以通过
//! [`ModuleContext`] 重新调用运行时。
//!
//! # 示例
//!
//! ```rust
//! use std::sync::Arc;
//! use chips_modular::api::Framework;
//! use chips_modular::core::config::FrameworkConfig;
//! use chips_modular::module::{MemoryArchive, ModuleManifest, ModuleState};
//!
//! let framework = Framework::new(FrameworkConfig::default()).unwrap();
//!
//! let a = ModuleManifest::builder("chips.a", "1.0.0").export("pkg.x", "1.0.0").build().unwrap();
//! let b = ModuleManifest::builder("chips.b", "1.0.0").import("pkg.x", "[1.0.0,2.0.0)").build().unwrap();
//! let a = framework.install(Arc::new(MemoryArchive::new("mem:a", a))).unwrap();
//! let b = framework.install(Arc::new(MemoryArchive::new("mem:b", b))).unwrap();
//!
//! framework.start(b).unwrap();
//! assert_eq!(framework.state(b).unwrap(), ModuleState::Active);
//! assert_eq!(framework.wires(b).unwrap()[0].provider_module, a);
//! ```

use parking_lot::Mutex;
use semver::Version;
use serde::Serialize;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::FrameworkConfig;
use crate::module::archive::{ArchiveProvider, DirectoryArchive};
use crate::module::events::{ErrorSink, EventKind, EventSink, TracingErrorSink, TracingEventSink};
use crate::module::executor::{
    in_event_dispatch, in_lifecycle_operation, panic_message, ExecutorStats, OperationExecutor,
    OperationKind,
};
use crate::module::generation::{GenerationId, Wire};
use crate::module::hooks::{CollisionFilter, ResolverHook};
use crate::module::lifecycle::{LifecycleController, StartPlan, StopPlan};
use crate::module::loader::{
    Activator, ArchiveLoaderFactory, LoadedClass, ModuleLoaderFactory, ResourceHandle,
};
use crate::module::lookup::{BootLoader, DelegatingLookup, LookupContext, LookupSnapshot};
use crate::module::metadata::{package_matches, ModuleState};
use crate::module::registry::{scan_module_dirs, FrameworkState, Module};
use crate::module::resolver::{ResolveReport, Resolver, ResolverContext};
use crate::utils::{CoreError, Result};

// ============================================================================
// 公共类型
// ============================================================================

/// 模块概要
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub id: u64,
    pub location: String,
    /// 已卸载的模块没有当前代，以下两项为空
    pub symbolic_name: Option<String>,
    pub version: Option<Version>,
    pub state: ModuleState,
    pub generations: Vec<GenerationId>,
    pub fragment: bool,
}

/// 交给激活器的模块上下文
///
/// 持有运行时的句柄，回调可以安装、启动其他模块或查找类。
#[derive(Clone)]
pub struct ModuleContext {
    module_id: u64,
    framework: Framework,
}

impl ModuleContext {
    pub fn new(module_id: u64, framework: Framework) -> Self {
        Self {
            module_id,
            framework,
        }
    }

    pub fn module_id(&self) -> u64 {
        self.module_id
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    /// 从本模块的加载上下文查找类
    pub fn find_class(&self, name: &str) -> Result<Option<Arc<LoadedClass>>> {
        self.framework.find_class(self.module_id, name)
    }

    pub fn find_resource(&self, path: &str) -> Result<Option<ResourceHandle>> {
        self.framework.find_resource(self.module_id, path)
    }
}

enum StartOutcome {
    /// 状态已变化，无需启动
    Skipped,
    Started(Option<Box<dyn Activator>>),
    Failed(String),
}

enum StopOutcome {
    Skipped,
    Stopped,
    Failed(String),
}

// ============================================================================
// 构建器
// ============================================================================

/// Framework 构建器
#[derive(Default)]
pub struct FrameworkBuilder {
    config: Option<FrameworkConfig>,
    loader_factory: Option<Arc<dyn ModuleLoaderFactory>>,
    hook: Option<Arc<dyn ResolverHook>>,
    collision_filter: Option<Arc<dyn CollisionFilter>>,
    boot_loader: Option<Arc<dyn BootLoader>>,
    event_sink: Option<Arc<dyn EventSink>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl FrameworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: FrameworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 加载器工厂，默认为 [`ArchiveLoaderFactory`]
    pub fn loader_factory(mut self, factory: Arc<dyn ModuleLoaderFactory>) -> Self {
        self.loader_factory = Some(factory);
        self
    }

    pub fn resolver_hook(mut self, hook: Arc<dyn ResolverHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn collision_filter(mut self, filter: Arc<dyn CollisionFilter>) -> Self {
        self.collision_filter = Some(filter);
        self
    }

    pub fn boot_loader(mut self, loader: Arc<dyn BootLoader>) -> Self {
        self.boot_loader = Some(loader);
        self
    }

    /// 事件接收端，默认为 [`TracingEventSink`]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// 错误通道，默认为 [`TracingErrorSink`]
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// 构建运行时
    ///
    /// # Errors
    ///
    /// 配置校验失败时返回 `InvalidConfigValue`。
    pub fn build(self) -> Result<Framework> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        info!(
            timeout_ms = config.executor.operation_timeout_ms,
            abort_policy = ?config.executor.abort_policy,
            singleton_policy = ?config.resolver.singleton_policy,
            "创建模块运行时"
        );

        Ok(Framework {
            shared: Arc::new(Shared {
                executor: OperationExecutor::new(config.executor.clone()),
                state: Mutex::new(FrameworkState::new()),
                loader_factory: self
                    .loader_factory
                    .unwrap_or_else(|| Arc::new(ArchiveLoaderFactory::new())),
                hook: self.hook,
                collision_filter: self.collision_filter,
                boot_loader: self.boot_loader,
                event_sink: self.event_sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
                error_sink: self
                    .error_sink
                    .unwrap_or_else(|| Arc::new(TracingErrorSink::new())),
                dispatch_lock: Mutex::new(()),
                config,
            }),
        })
    }
}

// ============================================================================
// Framework
// ============================================================================

struct Shared {
    config: FrameworkConfig,
    /// 包锁
    state: Mutex<FrameworkState>,
    executor: OperationExecutor,
    loader_factory: Arc<dyn ModuleLoaderFactory>,
    hook: Option<Arc<dyn ResolverHook>>,
    collision_filter: Option<Arc<dyn CollisionFilter>>,
    boot_loader: Option<Arc<dyn BootLoader>>,
    event_sink: Arc<dyn EventSink>,
    error_sink: Arc<dyn ErrorSink>,
    /// 保证事件按发生顺序投递
    dispatch_lock: Mutex<()>,
}

/// 动态模块运行时
///
/// 句柄可以廉价克隆，所有克隆共享同一个运行时。
#[derive(Clone)]
pub struct Framework {
    shared: Arc<Shared>,
}

impl Framework {
    pub fn new(config: FrameworkConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::new()
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.shared.config
    }

    // ========================================================================
    // 安装与解析
    // ========================================================================

    /// 安装模块
    ///
    /// 同一位置重复安装返回已有模块的 id。
    pub fn install(&self, archive: Arc<dyn ArchiveProvider>) -> Result<u64> {
        let installed = {
            let mut state = self.shared.state.lock();
            self.register_install(&mut state, archive)
        };
        self.flush_events();
        installed
    }

    fn register_install(&self, state: &mut FrameworkState, archive: Arc<dyn ArchiveProvider>) -> Result<u64> {
        let (id, created) = state.registry.install(archive)?;
        if !created {
            return Ok(id);
        }
        if let Some(generation) = state.registry.module(id).and_then(Module::current_generation) {
            state.register_generation(generation);
        }
        state.events.record(EventKind::Installed, id);
        info!(module_id = id, "模块已安装");

        if self.shared.config.resolver.eager_resolve_on_install {
            let report = self.run_resolver(state, &[id]);
            if !report.is_success() {
                debug!(module_id = id, failures = report.failures.len(), "安装后解析未完成");
            }
        }
        Ok(id)
    }

    /// 从包含 module.yaml 的目录安装
    pub fn install_directory(&self, path: impl AsRef<Path>) -> Result<u64> {
        let archive = DirectoryArchive::open(path)?;
        self.install(Arc::new(archive))
    }

    /// 安装模块目录下的所有模块，返回成功安装的 id
    pub fn install_directories(&self, dirs: &[PathBuf]) -> Vec<u64> {
        scan_module_dirs(dirs)
            .into_iter()
            .filter_map(|archive| {
                let location = archive.location().to_string();
                match self.install(Arc::new(archive)) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(location = %location, error = %e, "安装模块失败");
                        None
                    }
                }
            })
            .collect()
    }

    /// 解析一组模块，空集合表示所有未解析的模块
    ///
    /// 全部成功时返回 `true`。失败的模块保持 INSTALLED。
    pub fn resolve(&self, ids: &[u64]) -> bool {
        let report = {
            let mut state = self.shared.state.lock();
            let targets: Vec<u64> = if ids.is_empty() {
                state
                    .registry
                    .modules()
                    .filter(|m| m.state == ModuleState::Installed)
                    .map(|m| m.id)
                    .collect()
            } else {
                ids.iter()
                    .copied()
                    .filter(|id| {
                        state
                            .registry
                            .module(*id)
                            .map(|m| !m.is_uninstalled())
                            .unwrap_or(false)
                    })
                    .collect()
            };
            self.run_resolver(&mut state, &targets)
        };
        self.flush_events();
        report.is_success()
    }

    /// 解析单个模块
    ///
    /// # Errors
    ///
    /// 解析失败返回 `Resolution`；模块已卸载返回 `IllegalState`。
    pub fn resolve_module(&self, id: u64) -> Result<()> {
        let result = {
            let mut state = self.shared.state.lock();
            self.ensure_resolved(&mut state, id).map(|_| ())
        };
        self.flush_events();
        result
    }

    fn run_resolver(&self, state: &mut FrameworkState, ids: &[u64]) -> ResolveReport {
        let shared = &*self.shared;
        let ctx = ResolverContext {
            config: &shared.config.resolver,
            hook: shared.hook.as_deref(),
            collision_filter: shared.collision_filter.as_deref(),
            loader_factory: shared.loader_factory.as_ref(),
        };
        Resolver::new(state, ctx).resolve(ids)
    }

    /// 确保模块当前代已解析，返回该代
    fn ensure_resolved(&self, state: &mut FrameworkState, id: u64) -> Result<GenerationId> {
        let module = state.registry.require_module(id)?;
        if module.is_uninstalled() {
            return Err(CoreError::illegal_state(id, "模块已卸载"));
        }
        let generation = module
            .current_generation()
            .ok_or_else(|| CoreError::illegal_state(id, "模块没有可用的代"))?;
        if state.registry.generation(generation).map(|g| g.is_resolved()).unwrap_or(false) {
            return Ok(generation);
        }

        let report = self.run_resolver(state, &[id]);
        let resolved = state
            .registry
            .generation(generation)
            .map(|g| g.is_resolved())
            .unwrap_or(false);
        if resolved {
            return Ok(generation);
        }
        Err(match report.failures.into_iter().next() {
            Some(failure) => CoreError::Resolution(failure),
            None => CoreError::Internal(format!("模块 {} 未能解析", id)),
        })
    }

    // ========================================================================
    // 生命周期
    // ========================================================================

    /// 启动模块
    ///
    /// 已是 ACTIVE 或 STARTING 时直接返回。INSTALLED 的模块先解析。
    /// 声明了延迟激活的模块进入 STARTING，等到首次从触发包加载类时才运行激活器。
    ///
    /// # Errors
    ///
    /// * `Resolution` - 解析失败，模块保持 INSTALLED
    /// * `Activation` - 激活回调失败，模块回到 RESOLVED
    /// * `Timeout` - 激活回调超时，模块回到 RESOLVED
    /// * `IllegalState` - 模块已卸载、是片段，或在自身回调中重入
    pub fn start(&self, id: u64) -> Result<()> {
        let planned = {
            let mut state = self.shared.state.lock();
            self.prepare_start(&mut state, id)
        };
        self.flush_events();
        match planned? {
            StartPlan::Activate => self.activate(id),
            _ => Ok(()),
        }
    }

    fn prepare_start(&self, state: &mut FrameworkState, id: u64) -> Result<StartPlan> {
        let mut plan = self.plan_start(state, id)?;
        if plan == StartPlan::Resolve {
            self.ensure_resolved(state, id)?;
            plan = self.plan_start(state, id)?;
        }
        if plan == StartPlan::Defer {
            LifecycleController::transition(
                state,
                id,
                ModuleState::Starting,
                Some(EventKind::LazyActivation),
            )?;
            if let Some(module) = state.registry.module_mut(id) {
                module.lazy_pending = true;
            }
            info!(module_id = id, "延迟激活，等待首次类加载");
        }
        Ok(plan)
    }

    fn plan_start(&self, state: &FrameworkState, id: u64) -> Result<StartPlan> {
        let module = state.registry.require_module(id)?;
        if module.is_uninstalled() {
            return Err(CoreError::illegal_state(id, "模块已卸载"));
        }
        let manifest = state
            .registry
            .current_generation(id)
            .map(|g| g.manifest.clone())
            .ok_or_else(|| CoreError::illegal_state(id, "模块没有可用的代"))?;
        LifecycleController::plan_start(module, &manifest)
    }

    fn activate(&self, id: u64) -> Result<()> {
        let span = crate::operation_span!(id, OperationKind::Start);
        let _enter = span.enter();

        let worker = self.clone();
        let cleanup = self.clone();
        let result = self.shared.executor.execute(
            id,
            OperationKind::Start,
            move || worker.run_start(id),
            move |outcome| cleanup.abandon_start(id, outcome),
        );
        let outcome = match result {
            Ok((outcome, _guard)) => self.commit_start(id, outcome),
            Err(e) => {
                if e.is_timeout() || matches!(e, CoreError::Internal(_)) {
                    self.rollback_start(id);
                    self.shared.error_sink.report(id, &e);
                }
                Err(e)
            }
        };
        self.flush_events();
        outcome
    }

    /// 工作线程：进入 STARTING 并运行激活回调
    fn run_start(&self, id: u64) -> StartOutcome {
        let loader = {
            let mut state = self.shared.state.lock();
            let Some(module) = state.registry.module_mut(id) else {
                return StartOutcome::Skipped;
            };
            let startable = module.state == ModuleState::Resolved
                || (module.state == ModuleState::Starting && module.lazy_pending);
            if !startable {
                return StartOutcome::Skipped;
            }
            module.lazy_pending = false;
            if let Err(e) = LifecycleController::transition(
                &mut state,
                id,
                ModuleState::Starting,
                Some(EventKind::Starting),
            ) {
                return StartOutcome::Failed(e.to_string());
            }
            state.registry.current_generation(id).and_then(|g| g.loader.clone())
        };
        self.flush_events();

        let Some(loader) = loader else {
            return StartOutcome::Failed("模块没有加载器".to_string());
        };
        let mut activator = match loader.create_activator() {
            Ok(activator) => activator,
            Err(e) => return StartOutcome::Failed(format!("{:#}", e)),
        };
        if let Some(activator) = activator.as_mut() {
            let context = ModuleContext::new(id, self.clone());
            match catch_unwind(AssertUnwindSafe(|| activator.start(&context))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return StartOutcome::Failed(format!("{:#}", e)),
                Err(payload) => {
                    return StartOutcome::Failed(format!("激活回调 panic: {}", panic_message(&*payload)))
                }
            }
        }
        StartOutcome::Started(activator)
    }

    fn commit_start(&self, id: u64, outcome: StartOutcome) -> Result<()> {
        let mut state = self.shared.state.lock();
        match outcome {
            StartOutcome::Skipped => {
                if state.registry.require_module(id)?.is_uninstalled() {
                    return Err(CoreError::illegal_state(id, "模块已卸载"));
                }
                Ok(())
            }
            StartOutcome::Started(activator) => {
                if let Some(module) = state.registry.module_mut(id) {
                    module.activator = activator;
                }
                LifecycleController::transition(
                    &mut state,
                    id,
                    ModuleState::Active,
                    Some(EventKind::Started),
                )?;
                info!(module_id = id, "模块已启动");
                Ok(())
            }
            StartOutcome::Failed(reason) => {
                LifecycleController::transition(
                    &mut state,
                    id,
                    ModuleState::Resolved,
                    Some(EventKind::Stopped),
                )?;
                drop(state);
                let error = CoreError::Activation {
                    module_id: id,
                    reason,
                };
                warn!(module_id = id, error = %error, "激活失败，回到 RESOLVED");
                self.shared.error_sink.report(id, &error);
                Err(error)
            }
        }
    }

    fn rollback_start(&self, id: u64) {
        let mut state = self.shared.state.lock();
        let starting = state
            .registry
            .module(id)
            .map(|m| m.state == ModuleState::Starting && !m.lazy_pending)
            .unwrap_or(false);
        if starting {
            let _ = LifecycleController::transition(
                &mut state,
                id,
                ModuleState::Resolved,
                Some(EventKind::Stopped),
            );
        }
    }

    /// 工作线程：调用方已超时放弃，释放激活器并回滚
    fn abandon_start(&self, id: u64, outcome: StartOutcome) {
        drop(outcome);
        self.rollback_start(id);
        self.flush_events();
        debug!(module_id = id, "已放弃的启动完成回滚");
    }

    /// 停止模块
    ///
    /// INSTALLED 或 RESOLVED 时直接返回，不调用停用回调。
    ///
    /// # Errors
    ///
    /// * `Deactivation` - 停用回调失败，模块仍置为 RESOLVED 并报告一次
    /// * `Timeout` - 停用回调超时，模块置为 RESOLVED
    /// * `IllegalState` - 模块已卸载，或在自身回调中重入
    pub fn stop(&self, id: u64) -> Result<()> {
        let planned = {
            let mut state = self.shared.state.lock();
            self.prepare_stop(&mut state, id)
        };
        self.flush_events();
        match planned? {
            StopPlan::Deactivate => self.deactivate(id),
            _ => Ok(()),
        }
    }

    fn prepare_stop(&self, state: &mut FrameworkState, id: u64) -> Result<StopPlan> {
        let plan = LifecycleController::plan_stop(state.registry.require_module(id)?)?;
        if plan == StopPlan::CancelLazy {
            if let Some(module) = state.registry.module_mut(id) {
                module.lazy_pending = false;
            }
            LifecycleController::transition(state, id, ModuleState::Resolved, Some(EventKind::Stopped))?;
        }
        Ok(plan)
    }

    fn deactivate(&self, id: u64) -> Result<()> {
        let span = crate::operation_span!(id, OperationKind::Stop);
        let _enter = span.enter();

        let worker = self.clone();
        let cleanup = self.clone();
        let result = self.shared.executor.execute(
            id,
            OperationKind::Stop,
            move || worker.run_stop(id),
            move |outcome| cleanup.abandon_stop(id, outcome),
        );
        let outcome = match result {
            Ok((outcome, _guard)) => self.commit_stop(id, outcome),
            Err(e) => {
                if e.is_timeout() || matches!(e, CoreError::Internal(_)) {
                    self.force_stopped(id);
                    self.shared.error_sink.report(id, &e);
                }
                Err(e)
            }
        };
        self.flush_events();
        outcome
    }

    /// 工作线程：进入 STOPPING 并运行停用回调
    fn run_stop(&self, id: u64) -> StopOutcome {
        let activator = {
            let mut state = self.shared.state.lock();
            let Some(module) = state.registry.module_mut(id) else {
                return StopOutcome::Skipped;
            };
            if module.state != ModuleState::Active {
                return StopOutcome::Skipped;
            }
            let activator = module.activator.take();
            if let Err(e) = LifecycleController::transition(
                &mut state,
                id,
                ModuleState::Stopping,
                Some(EventKind::Stopping),
            ) {
                return StopOutcome::Failed(e.to_string());
            }
            activator
        };
        self.flush_events();

        let Some(mut activator) = activator else {
            return StopOutcome::Stopped;
        };
        let context = ModuleContext::new(id, self.clone());
        match catch_unwind(AssertUnwindSafe(|| activator.stop(&context))) {
            Ok(Ok(())) => StopOutcome::Stopped,
            Ok(Err(e)) => StopOutcome::Failed(format!("{:#}", e)),
            Err(payload) => StopOutcome::Failed(format!("停用回调 panic: {}", panic_message(&*payload))),
        }
    }

    fn commit_stop(&self, id: u64, outcome: StopOutcome) -> Result<()> {
        match outcome {
            StopOutcome::Skipped => Ok(()),
            StopOutcome::Stopped => {
                self.force_stopped(id);
                info!(module_id = id, "模块已停止");
                Ok(())
            }
            StopOutcome::Failed(reason) => {
                self.force_stopped(id);
                let error = CoreError::Deactivation {
                    module_id: id,
                    reason,
                };
                warn!(module_id = id, error = %error, "停用失败，模块仍置为 RESOLVED");
                self.shared.error_sink.report(id, &error);
                Err(error)
            }
        }
    }

    fn force_stopped(&self, id: u64) {
        let mut state = self.shared.state.lock();
        let stopping = state
            .registry
            .module(id)
            .map(|m| m.state == ModuleState::Stopping)
            .unwrap_or(false);
        if stopping {
            let _ = LifecycleController::transition(
                &mut state,
                id,
                ModuleState::Resolved,
                Some(EventKind::Stopped),
            );
        }
    }

    fn abandon_stop(&self, id: u64, outcome: StopOutcome) {
        if let StopOutcome::Failed(reason) = outcome {
            debug!(module_id = id, reason = %reason, "已放弃的停用回调失败");
        }
        self.force_stopped(id);
        self.flush_events();
    }

    /// 更新模块
    ///
    /// 追加新的代并设为当前代（状态回到 INSTALLED）。旧代仍被其他模块使用时保留，
    /// 直到 [`refresh`](Self::refresh)。原先 ACTIVE 的模块会先停止再重新启动。
    pub fn update(&self, id: u64, archive: Arc<dyn ArchiveProvider>) -> Result<()> {
        let was_active = {
            let state = self.shared.state.lock();
            let module = state.registry.require_module(id)?;
            if module.is_uninstalled() {
                return Err(CoreError::illegal_state(id, "模块已卸载"));
            }
            matches!(module.state, ModuleState::Active | ModuleState::Starting)
        };
        if was_active {
            self.stop_tolerant(id)?;
        }

        let updated = {
            let mut state = self.shared.state.lock();
            self.replace_generation(&mut state, id, archive)
        };
        self.flush_events();
        let generation = updated?;
        info!(module_id = id, %generation, "模块已更新");

        if was_active {
            self.start(id)?;
        }
        Ok(())
    }

    fn replace_generation(
        &self,
        state: &mut FrameworkState,
        id: u64,
        archive: Arc<dyn ArchiveProvider>,
    ) -> Result<GenerationId> {
        let old = state.registry.require_module(id)?.current_generation();
        let generation = state.registry.add_generation(id, archive)?;
        state.register_generation(generation);
        if let Some(module) = state.registry.module_mut(id) {
            module.lazy_pending = false;
        }
        if state.registry.require_module(id)?.state != ModuleState::Installed {
            LifecycleController::transition(
                state,
                id,
                ModuleState::Installed,
                Some(EventKind::Unresolved),
            )?;
        }
        state.events.record(EventKind::Updated, id);
        if let Some(old) = old {
            if state.purge_generation(old, false) {
                debug!(module_id = id, generation = %old, "旧代无人使用，已清除");
            }
        }
        Ok(generation)
    }

    /// 卸载模块
    ///
    /// 先停止模块，再以 `force` 清除它的所有代。卸载是终态。
    pub fn uninstall(&self, id: u64) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if state.registry.require_module(id)?.is_uninstalled() {
                return Err(CoreError::illegal_state(id, "模块已卸载"));
            }
        }
        self.stop_tolerant(id)?;

        let result = {
            let mut state = self.shared.state.lock();
            let generations = state.registry.require_module(id).map(|m| m.generations.clone());
            generations.and_then(|generations| {
                for generation in generations {
                    state.purge_generation(generation, true);
                }
                if let Some(module) = state.registry.module_mut(id) {
                    module.activator = None;
                    module.lazy_pending = false;
                }
                LifecycleController::transition(
                    &mut state,
                    id,
                    ModuleState::Uninstalled,
                    Some(EventKind::Uninstalled),
                )
            })
        };
        self.flush_events();
        if result.is_ok() {
            info!(module_id = id, "模块已卸载");
        }
        result
    }

    /// 停止模块；回调失败或超时已报告，不阻止后续操作
    fn stop_tolerant(&self, id: u64) -> Result<()> {
        match self.stop(id) {
            Ok(()) => Ok(()),
            Err(e @ (CoreError::Deactivation { .. } | CoreError::Timeout { .. })) => {
                warn!(module_id = id, error = %e, "停止失败，继续");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 刷新模块
    ///
    /// 计算依赖这些模块的传递闭包，停止其中活动的模块，为它们重建新的代并以
    /// `force` 清除所有旧代，然后重新解析并重启原先活动的模块。返回被刷新的模块。
    pub fn refresh(&self, ids: &[u64]) -> Result<Vec<u64>> {
        let closure: Vec<u64> = {
            let state = self.shared.state.lock();
            let mut closure = BTreeSet::new();
            let mut queue: Vec<u64> = ids.to_vec();
            while let Some(id) = queue.pop() {
                let live = state.registry.module(id).map(|m| !m.is_uninstalled()).unwrap_or(false);
                if !live || !closure.insert(id) {
                    continue;
                }
                queue.extend(state.dependents_of(id));
                queue.extend(hosts_of(&state, id));
            }
            closure.into_iter().collect()
        };
        if closure.is_empty() {
            return Ok(closure);
        }
        info!(modules = ?closure, "刷新模块");

        let mut restart = Vec::new();
        for &id in closure.iter().rev() {
            let active = {
                let state = self.shared.state.lock();
                state
                    .registry
                    .module(id)
                    .map(|m| matches!(m.state, ModuleState::Active | ModuleState::Starting))
                    .unwrap_or(false)
            };
            if active {
                restart.push(id);
                self.stop_tolerant(id)?;
            }
        }

        {
            let mut state = self.shared.state.lock();
            for &id in &closure {
                self.renew_generation(&mut state, id);
            }
            let report = self.run_resolver(&mut state, &closure);
            if !report.is_success() {
                debug!(failures = report.failures.len(), "刷新后部分模块未能解析");
            }
        }
        self.flush_events();

        for id in restart.into_iter().rev() {
            if let Err(e) = self.start(id) {
                warn!(module_id = id, error = %e, "刷新后重启模块失败");
            }
        }
        Ok(closure)
    }

    /// 用当前归档重建代，清除所有旧代
    fn renew_generation(&self, state: &mut FrameworkState, id: u64) {
        let Some(old) = state.registry.module(id).map(|m| m.generations.clone()) else {
            return;
        };
        let Some(archive) = state.registry.current_generation(id).map(|g| g.archive.clone()) else {
            return;
        };
        let fresh = match state.registry.add_generation(id, archive) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(module_id = id, error = %e, "重建代失败");
                return;
            }
        };
        state.register_generation(fresh);
        for generation in old {
            state.purge_generation(generation, true);
        }
        if let Some(module) = state.registry.module_mut(id) {
            module.lazy_pending = false;
        }
        let current = state.registry.module(id).map(|m| m.state);
        if current != Some(ModuleState::Installed) {
            if let Err(e) = LifecycleController::transition(
                state,
                id,
                ModuleState::Installed,
                Some(EventKind::Unresolved),
            ) {
                warn!(module_id = id, error = %e, "刷新时状态回退失败");
            }
        }
    }

    /// 停止所有活动模块并关闭执行器
    pub fn shutdown(&self) {
        let active: Vec<u64> = {
            let state = self.shared.state.lock();
            state
                .registry
                .modules()
                .filter(|m| matches!(m.state, ModuleState::Active | ModuleState::Starting))
                .map(|m| m.id)
                .collect()
        };
        for id in active.into_iter().rev() {
            if let Err(e) = self.stop(id) {
                warn!(module_id = id, error = %e, "关闭时停止模块失败");
            }
        }
        self.shared.executor.shutdown();
        info!("模块运行时已关闭");
    }

    // ========================================================================
    // 查找
    // ========================================================================

    /// 从模块的加载上下文查找类，必要时先解析模块
    pub fn find_class(&self, id: u64, name: &str) -> Result<Option<Arc<LoadedClass>>> {
        let origin = self.lookup_origin(id)?;
        Ok(DelegatingLookup::find_class(self, origin, name))
    }

    pub fn find_resource(&self, id: u64, path: &str) -> Result<Option<ResourceHandle>> {
        let origin = self.lookup_origin(id)?;
        Ok(DelegatingLookup::find_resource(self, origin, path))
    }

    /// 查找所有同名资源
    pub fn find_resources(&self, id: u64, path: &str) -> Result<Vec<ResourceHandle>> {
        let origin = self.lookup_origin(id)?;
        Ok(DelegatingLookup::find_resources(self, origin, path))
    }

    /// 查找起点：模块的当前代，片段则为其宿主
    fn lookup_origin(&self, id: u64) -> Result<GenerationId> {
        let result = {
            let mut state = self.shared.state.lock();
            self.ensure_resolved(&mut state, id).map(|generation| {
                state
                    .registry
                    .generation(generation)
                    .and_then(|g| g.wiring.as_ref())
                    .and_then(|w| w.hosts.first())
                    .map(|wire| wire.provider)
                    .unwrap_or(generation)
            })
        };
        self.flush_events();
        result
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn state(&self, id: u64) -> Result<ModuleState> {
        Ok(self.shared.state.lock().registry.require_module(id)?.state)
    }

    /// 当前代的所有边，含动态导入
    pub fn wires(&self, id: u64) -> Result<Vec<Wire>> {
        let state = self.shared.state.lock();
        state.registry.require_module(id)?;
        Ok(state
            .registry
            .current_generation(id)
            .map(|g| g.wires())
            .unwrap_or_default())
    }

    /// 指定代的所有边
    pub fn generation_wires(&self, generation: GenerationId) -> Vec<Wire> {
        self.shared
            .state
            .lock()
            .registry
            .generation(generation)
            .map(|g| g.wires())
            .unwrap_or_default()
    }

    /// 仍存活的代，最后一个是当前代
    pub fn generations(&self, id: u64) -> Result<Vec<GenerationId>> {
        Ok(self
            .shared
            .state
            .lock()
            .registry
            .require_module(id)?
            .generations
            .clone())
    }

    pub fn module_info(&self, id: u64) -> Result<ModuleInfo> {
        let state = self.shared.state.lock();
        let module = state.registry.require_module(id)?;
        Ok(module_info(&state, module))
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        let state = self.shared.state.lock();
        state
            .registry
            .modules()
            .map(|m| module_info(&state, m))
            .collect()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.shared.executor.stats()
    }

    // ========================================================================
    // 事件投递
    // ========================================================================

    /// 投递包锁下记录的事件
    ///
    /// 事件分发回调中不再投递；生命周期回调中只在分发锁空闲时投递，
    /// 否则由持锁方或调用方稍后的投递带走。
    fn flush_events(&self) {
        if in_event_dispatch() {
            return;
        }
        if in_lifecycle_operation() {
            if let Some(_guard) = self.shared.dispatch_lock.try_lock() {
                self.deliver_pending();
            }
            return;
        }
        let _guard = self.shared.dispatch_lock.lock();
        self.deliver_pending();
    }

    fn deliver_pending(&self) {
        loop {
            let events = self.shared.state.lock().events.drain();
            if events.is_empty() {
                return;
            }
            let sink = self.shared.event_sink.clone();
            let delivered = self.shared.executor.execute(
                0,
                OperationKind::BundleEvent,
                move || {
                    for event in &events {
                        sink.notify(event);
                    }
                },
                |_| {},
            );
            if let Err(e) = delivered {
                warn!(error = %e, "事件投递失败");
                return;
            }
        }
    }
}

fn hosts_of(state: &FrameworkState, id: u64) -> Vec<u64> {
    state
        .registry
        .module(id)
        .map(|m| m.generations.as_slice())
        .unwrap_or(&[])
        .iter()
        .filter_map(|g| state.registry.generation(*g))
        .filter_map(|g| g.wiring.as_ref())
        .flat_map(|w| w.hosts.iter().map(|wire| wire.provider_module))
        .collect()
}

fn module_info(state: &FrameworkState, module: &Module) -> ModuleInfo {
    let current = state.registry.current_generation(module.id);
    ModuleInfo {
        id: module.id,
        location: module.location.clone(),
        symbolic_name: current.map(|g| g.symbolic_name().to_string()),
        version: current.map(|g| g.version().clone()),
        state: module.state,
        generations: module.generations.clone(),
        fragment: current.map(|g| g.is_fragment()).unwrap_or(false),
    }
}

impl LookupContext for Framework {
    fn snapshot(&self, generation: GenerationId) -> Option<LookupSnapshot> {
        self.shared
            .state
            .lock()
            .registry
            .generation(generation)
            .and_then(LookupSnapshot::of)
    }

    fn boot_delegated(&self, package: &str) -> bool {
        self.shared
            .config
            .resolver
            .boot_delegation
            .iter()
            .any(|pattern| package_matches(pattern, package))
    }

    fn boot_loader(&self) -> Option<&dyn BootLoader> {
        self.shared.boot_loader.as_deref()
    }

    fn dynamic_provider(&self, consumer: GenerationId, package: &str) -> Option<GenerationId> {
        let provider = {
            let mut state = self.shared.state.lock();
            let shared = &*self.shared;
            let ctx = ResolverContext {
                config: &shared.config.resolver,
                hook: shared.hook.as_deref(),
                collision_filter: shared.collision_filter.as_deref(),
                loader_factory: shared.loader_factory.as_ref(),
            };
            Resolver::new(&mut state, ctx).dynamic_wire(consumer, package)
        };
        self.flush_events();
        provider
    }

    fn report(&self, module_id: u64, error: CoreError) {
        self.shared.error_sink.report(module_id, &error);
    }

    fn class_loaded(&self, snapshot: &LookupSnapshot, package: &str) {
        let triggered = {
            let state = self.shared.state.lock();
            state
                .registry
                .module(snapshot.module_id)
                .map(|m| {
                    m.state == ModuleState::Starting
                        && m.lazy_pending
                        && m.current_generation() == Some(snapshot.generation)
                })
                .unwrap_or(false)
        } && snapshot.manifest.activation.triggered_by(package);
        if !triggered {
            return;
        }

        info!(module_id = snapshot.module_id, package, "首次类加载触发延迟激活");
        if let Err(e) = self.activate(snapshot.module_id) {
            debug!(module_id = snapshot.module_id, error = %e, "延迟激活未完成");
        }
    }
}
