//! Error types for step execution

use thiserror::Error;

use crate::ipc::{IpcError, TransportError};

/// Error codes attached to step failures
pub mod codes {
    /// The step did not complete within the configured timeout
    pub const TIMEOUT: &str = "ETIMEOUT";
    /// The worker exited while the call was outstanding
    pub const TERMINATED: &str = "ETERMINATED";
    /// `execute` was called with no connected worker
    pub const NOT_RUNNING: &str = "ENOTRUNNING";
    /// The invocation named an extension that is not attached
    pub const UNREGISTERED: &str = "EUNREGISTERED";
    /// The step file does not exist
    pub const NOT_FOUND: &str = "ENOENT";
    /// The step export is not callable, or it never completed
    pub const CONTRACT: &str = "ECONTRACT";
    /// The step could not be loaded
    pub const LOAD: &str = "ELOAD";
    /// The step panicked
    pub const PANIC: &str = "EPANIC";
}

/// Supervisor-side execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Worker process already running")]
    AlreadyRunning,

    #[error("Process not running, please restart or try again in a few seconds")]
    NotRunning,

    #[error("Step '{path}' timeout")]
    Timeout { path: String },

    /// The step itself reported an error
    #[error("{0}")]
    Step(TransportError),

    #[error("Worker process terminated before step '{path}' completed")]
    WorkerTerminated { path: String },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Worker handshake failed: {0}")]
    Handshake(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Worker crashed {attempts} times in a row, giving up")]
    RestartLimit { attempts: u32 },
}

impl ExecutionError {
    /// Machine-readable code, if the error carries one
    pub fn code(&self) -> Option<&str> {
        match self {
            ExecutionError::Timeout { .. } => Some(codes::TIMEOUT),
            ExecutionError::WorkerTerminated { .. } => Some(codes::TERMINATED),
            ExecutionError::NotRunning => Some(codes::NOT_RUNNING),
            ExecutionError::Step(err) => err.code.as_deref(),
            _ => None,
        }
    }

    /// Errors produced by step code rather than by the runtime
    pub fn is_step_error(&self) -> bool {
        matches!(self, ExecutionError::Step(_))
    }

    /// Error shape suitable for handing to a caller across a boundary
    pub fn to_transport(&self) -> TransportError {
        match self {
            ExecutionError::Step(err) => err.clone(),
            other => {
                let err = TransportError::new(other.to_string());
                match other.code() {
                    Some(code) => err.with_code(code),
                    None => err,
                }
            }
        }
    }
}
