//! 模块引擎
//!
//! 包含动态模块运行时的全部核心组件：
//! - 清单、版本区间与归档
//! - 模块注册表与代
//! - 布线图与解析器
//! - 委托查找
//! - 生命周期控制与操作执行器

pub mod archive;
pub mod events;
pub mod executor;
pub mod generation;
pub mod hooks;
pub mod lifecycle;
pub mod loader;
pub mod lookup;
pub mod metadata;
pub mod parser;
pub mod registry;
pub mod resolver;
pub mod version;
pub mod wiring;

// 重导出常用类型
pub use archive::{ArchiveProvider, DirectoryArchive, MemoryArchive};
pub use events::{
    BroadcastEventSink, ErrorSink, EventKind, EventSink, FrameworkEvent, TracingErrorSink,
    TracingEventSink,
};
pub use executor::{ExecutorStats, OperationExecutor, OperationKind};
pub use generation::{Generation, GenerationId, Namespace, Wire, Wiring};
pub use hooks::{AllowAllCollisions, CollisionFilter, ModuleCandidate, ResolverHook};
pub use lifecycle::{LifecycleController, StartPlan, StopPlan};
pub use loader::{
    Activator, ArchiveLoaderFactory, LoadedClass, ModuleLoader, ModuleLoaderFactory,
    ResourceHandle,
};
pub use lookup::{BootLoader, DelegatingLookup, Found, LookupContext, LookupTarget};
pub use metadata::{
    ActivationMode, ActivationPolicy, FragmentAttachment, ModuleManifest, ModuleState,
};
pub use parser::ManifestParser;
pub use registry::{FrameworkState, Module, ModuleRegistry};
pub use resolver::{ResolveReport, Resolver, ResolverContext};
pub use version::VersionRange;
pub use wiring::WiringGraph;
