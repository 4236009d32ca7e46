//! 生命周期控制
//!
//! 状态转换表以及 start/stop 的前置判定。真正的回调执行由框架交给操作执行器完成。

use tracing::debug;

use super::events::EventKind;
use super::metadata::{ModuleManifest, ModuleState};
use super::registry::{FrameworkState, Module};
use crate::utils::{CoreError, Result};

/// `start` 的执行计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPlan {
    /// 已是 ACTIVE 或 STARTING
    AlreadyStarted,
    /// 需要先解析
    Resolve,
    /// 延迟激活：进入 STARTING 等待首次类加载
    Defer,
    /// 立即激活
    Activate,
}

/// `stop` 的执行计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPlan {
    /// 已是 INSTALLED 或 RESOLVED
    AlreadyStopped,
    /// 尚未触发的延迟激活，直接回到 RESOLVED
    CancelLazy,
    /// 在工作线程上执行停用回调
    Deactivate,
}

/// 生命周期控制器
pub struct LifecycleController;

impl LifecycleController {
    /// 转换是否合法
    pub fn allowed(from: ModuleState, to: ModuleState) -> bool {
        use ModuleState::*;
        match (from, to) {
            (Uninstalled, _) => false,
            (_, Uninstalled) => true,
            (a, b) if a == b => true,
            (Installed, Resolved)
            | (Resolved, Installed)
            | (Resolved, Starting)
            | (Starting, Active)
            | (Starting, Resolved)
            | (Active, Stopping)
            | (Stopping, Resolved) => true,
            _ => false,
        }
    }

    /// 执行一次状态转换并记录事件
    ///
    /// # Errors
    ///
    /// 模块不存在返回 `ModuleNotFound`；转换不合法返回 `IllegalState`。
    pub fn transition(
        state: &mut FrameworkState,
        module_id: u64,
        to: ModuleState,
        event: Option<EventKind>,
    ) -> Result<()> {
        let from = state.registry.require_module(module_id)?.state;
        if !Self::allowed(from, to) {
            return Err(CoreError::illegal_state(
                module_id,
                format!("不允许从 {} 转换到 {}", from, to),
            ));
        }
        state.set_state(module_id, to);
        if let Some(kind) = event {
            state.events.record(kind, module_id);
        }
        Ok(())
    }

    pub fn plan_start(module: &Module, manifest: &ModuleManifest) -> Result<StartPlan> {
        if manifest.is_fragment() {
            return Err(CoreError::illegal_state(module.id, "片段模块不能启动"));
        }
        let plan = match module.state {
            ModuleState::Uninstalled => {
                return Err(CoreError::illegal_state(module.id, "模块已卸载"));
            }
            state if state.start_is_noop() => StartPlan::AlreadyStarted,
            ModuleState::Installed => StartPlan::Resolve,
            _ if manifest.activation.is_lazy() => StartPlan::Defer,
            _ => StartPlan::Activate,
        };
        debug!(module_id = module.id, state = %module.state, ?plan, "启动计划");
        Ok(plan)
    }

    pub fn plan_stop(module: &Module) -> Result<StopPlan> {
        let plan = match module.state {
            ModuleState::Uninstalled => {
                return Err(CoreError::illegal_state(module.id, "模块已卸载"));
            }
            state if state.stop_is_noop() => StopPlan::AlreadyStopped,
            ModuleState::Starting if module.lazy_pending => StopPlan::CancelLazy,
            _ => StopPlan::Deactivate,
        };
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::archive::{ArchiveProvider, MemoryArchive};
    use std::sync::Arc;

    fn install(state: &mut FrameworkState, manifest: ModuleManifest) -> u64 {
        let location = format!("mem:{}", manifest.symbolic_name);
        let archive: Arc<dyn ArchiveProvider> = Arc::new(MemoryArchive::new(location, manifest));
        state.registry.install(archive).unwrap().0
    }

    #[test]
    fn test_transition_table() {
        use ModuleState::*;
        assert!(LifecycleController::allowed(Installed, Resolved));
        assert!(LifecycleController::allowed(Resolved, Starting));
        assert!(LifecycleController::allowed(Starting, Resolved));
        assert!(LifecycleController::allowed(Active, Stopping));
        assert!(LifecycleController::allowed(Active, Uninstalled));
        assert!(!LifecycleController::allowed(Installed, Active));
        assert!(!LifecycleController::allowed(Active, Resolved));
        assert!(!LifecycleController::allowed(Uninstalled, Installed));
        assert!(!LifecycleController::allowed(Uninstalled, Uninstalled));
    }

    #[test]
    fn test_transition_records_event() {
        let mut state = FrameworkState::new();
        let id = install(&mut state, ModuleManifest::builder("a", "1.0").build().unwrap());

        LifecycleController::transition(&mut state, id, ModuleState::Resolved, Some(EventKind::Resolved))
            .unwrap();
        assert_eq!(state.registry.module(id).unwrap().state, ModuleState::Resolved);
        assert_eq!(state.events.drain()[0].kind, EventKind::Resolved);

        let err = LifecycleController::transition(&mut state, id, ModuleState::Active, None).unwrap_err();
        assert!(err.is_illegal_state());
        assert!(state.events.is_empty());
    }

    #[test]
    fn test_start_plans() {
        let mut state = FrameworkState::new();
        let eager = install(&mut state, ModuleManifest::builder("eager", "1.0").build().unwrap());
        let lazy = install(
            &mut state,
            ModuleManifest::builder("lazy", "1.0").lazy(&["lazy.api"]).build().unwrap(),
        );
        let manifest = |state: &FrameworkState, id| state.registry.current_generation(id).unwrap().manifest.clone();

        let m = manifest(&state, eager);
        assert_eq!(
            LifecycleController::plan_start(state.registry.module(eager).unwrap(), &m).unwrap(),
            StartPlan::Resolve
        );

        state.set_state(eager, ModuleState::Resolved);
        state.set_state(lazy, ModuleState::Resolved);
        assert_eq!(
            LifecycleController::plan_start(state.registry.module(eager).unwrap(), &m).unwrap(),
            StartPlan::Activate
        );
        let lm = manifest(&state, lazy);
        assert_eq!(
            LifecycleController::plan_start(state.registry.module(lazy).unwrap(), &lm).unwrap(),
            StartPlan::Defer
        );

        state.set_state(eager, ModuleState::Active);
        assert_eq!(
            LifecycleController::plan_start(state.registry.module(eager).unwrap(), &m).unwrap(),
            StartPlan::AlreadyStarted
        );

        state.set_state(eager, ModuleState::Uninstalled);
        assert!(LifecycleController::plan_start(state.registry.module(eager).unwrap(), &m).is_err());
    }

    #[test]
    fn test_fragment_cannot_start() {
        let mut state = FrameworkState::new();
        let frag = install(
            &mut state,
            ModuleManifest::builder("frag", "1.0").fragment_of("host", "0").build().unwrap(),
        );
        let m = state.registry.current_generation(frag).unwrap().manifest.clone();
        let err = LifecycleController::plan_start(state.registry.module(frag).unwrap(), &m).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_stop_plans() {
        let mut state = FrameworkState::new();
        let id = install(&mut state, ModuleManifest::builder("a", "1.0").build().unwrap());
        let plan = |state: &FrameworkState| LifecycleController::plan_stop(state.registry.module(id).unwrap());

        assert_eq!(plan(&state).unwrap(), StopPlan::AlreadyStopped);
        state.set_state(id, ModuleState::Active);
        assert_eq!(plan(&state).unwrap(), StopPlan::Deactivate);

        state.set_state(id, ModuleState::Starting);
        state.registry.module_mut(id).unwrap().lazy_pending = true;
        assert_eq!(plan(&state).unwrap(), StopPlan::CancelLazy);

        state.set_state(id, ModuleState::Uninstalled);
        assert!(plan(&state).unwrap_err().is_illegal_state());
    }
}
