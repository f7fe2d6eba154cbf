//! Extension step execution
//!
//! Step functions run in an isolated worker process owned by a [`Supervisor`].
//! The supervisor performs the `ready` handshake, dispatches invocations with
//! per-call timeouts, answers capability requests for host-held information,
//! restarts the worker after crashes and after extension source changes.
//! The [`WorkerRuntime`] is the other end: it resolves and loads the step,
//! builds its [`StepContext`] and replies exactly once per invocation.

pub mod bridge;
pub mod context;
pub mod error;
pub mod extensions;
pub mod ipc;
pub mod loader;
pub mod lookup;
pub mod outbox;
pub mod sink;
pub mod spawner;
pub mod step;
pub mod storage;
pub mod supervisor;
pub mod watcher;
pub mod worker;

// Re-export main types
pub use bridge::{BridgeError, CapabilityBridge, APP_INFO_RESOURCE, DEVICE_INFO_RESOURCE};
pub use context::{InfoAccessor, SettingsReader, StepContext, StepLogger, StepStorage, StorageScope};
pub use error::{codes, ExecutionError};
pub use extensions::{
    AttachedExtension, AttachedExtensionMap, AttachedExtensions, AttachedExtensionsFile,
    ExtensionsError, StaticExtensions,
};
pub use loader::{LoadError, StepExport, StepLoader, StepLocation, StepRegistry};
pub use lookup::{HttpInfoLookup, InfoLookup, InfoLookupError};
pub use sink::{StepLogSink, TracingStepSink};
pub use spawner::{
    ExitStatusInfo, InProcessSpawner, ProcessSpawner, SpawnOptions, WorkerConnection,
    WorkerControl, WorkerSpawner,
};
pub use step::{async_step, callback_step, Done, Step, StepCall, StepFuture, StepReturn};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use supervisor::{StepCallback, Supervisor, SupervisorState, SupervisorStatus};
pub use watcher::{is_extension_source, ChangeEvent, ExtensionWatcher};
pub use worker::{WorkerExit, WorkerRuntime};

// Re-export IPC types for convenience
pub use ipc::{InvocationMeta, LogLevel, StepMeta, TransportError};
