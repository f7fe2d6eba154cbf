//! Worker process creation
//!
//! The supervisor only sees a [`WorkerConnection`]: a pair of byte streams
//! and a [`WorkerControl`] to wait for or terminate the worker. Production
//! uses [`ProcessSpawner`]; [`InProcessSpawner`] runs a [`WorkerRuntime`] on
//! a task, which keeps tests fast and deterministic.

use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ExecutionError;
use crate::ipc::{FrameReader, FrameWriter};
use crate::worker::{WorkerExit, WorkerRuntime};

/// Signal number reported for a terminated worker
pub const SIGINT: i32 = 2;

/// How a worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatusInfo {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatusInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Per-spawn options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Start the worker in debug-attach mode
    pub inspect: bool,
    /// Worker generation, unique per supervisor
    pub generation: u64,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle handle of one worker
#[async_trait]
pub trait WorkerControl: Send {
    /// Wait for the worker to end. Must be safe to call again after the
    /// returned future was dropped.
    async fn wait(&mut self) -> Result<ExitStatusInfo, ExecutionError>;

    /// Ask the worker to stop
    fn terminate(&mut self) -> Result<(), ExecutionError>;
}

/// Channel and lifecycle handle of a freshly spawned worker
pub struct WorkerConnection {
    pub pid: Option<u32>,
    /// Frames from the worker
    pub reader: BoxedReader,
    /// Frames to the worker
    pub writer: BoxedWriter,
    pub control: Box<dyn WorkerControl>,
}

/// Creates workers
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerConnection, ExecutionError>;
}

/// Spawns the worker as a child process talking over stdin and stdout.
/// The child's stderr is inherited.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable
    pub fn current_exe() -> Result<Self, ExecutionError> {
        let program = std::env::current_exe()
            .map_err(|e| ExecutionError::Spawn(format!("Cannot locate current executable: {}", e)))?;
        Ok(Self::new(program))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Arguments passed for `options`
    pub fn command_args(&self, options: &SpawnOptions) -> Vec<OsString> {
        let mut args = self.args.clone();
        if options.inspect {
            args.push("--inspect".into());
        }
        args
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerConnection, ExecutionError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.command_args(options))
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::Spawn(format!("{:?}: {}", self.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdout unavailable".to_string()))?;

        let pid = child.id();
        info!("Spawned worker process {:?} (generation {})", pid, options.generation);

        Ok(WorkerConnection {
            pid,
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ProcessControl { child }),
        })
    }
}

struct ProcessControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ProcessControl {
    async fn wait(&mut self) -> Result<ExitStatusInfo, ExecutionError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecutionError::Spawn(format!("Failed to wait for worker: {}", e)))?;
        Ok(status.into())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), ExecutionError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        debug!("Sending SIGINT to worker {}", pid);
        kill(Pid::from_raw(pid as i32), Signal::SIGINT)
            .map_err(|e| ExecutionError::Spawn(format!("Failed to signal worker {}: {}", pid, e)))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), ExecutionError> {
        self.child
            .start_kill()
            .map_err(|e| ExecutionError::Spawn(format!("Failed to kill worker: {}", e)))
    }
}

/// Runs the worker on a task of the current runtime, connected through an
/// in-memory pipe. Termination aborts the task and reports `SIGINT`.
#[derive(Clone)]
pub struct InProcessSpawner {
    runtime: WorkerRuntime,
    buffer_size: usize,
}

impl InProcessSpawner {
    pub fn new(runtime: WorkerRuntime) -> Self {
        Self {
            runtime,
            buffer_size: 64 * 1024,
        }
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self, options: &SpawnOptions) -> Result<WorkerConnection, ExecutionError> {
        let (supervisor_side, worker_side) = tokio::io::duplex(self.buffer_size);
        let (reader, writer) = tokio::io::split(supervisor_side);
        let (worker_reader, worker_writer) = tokio::io::split(worker_side);

        let runtime = self.runtime.clone().with_inspect(options.inspect);
        let task = tokio::spawn(runtime.run(
            FrameReader::new(worker_reader),
            FrameWriter::new(worker_writer),
        ));
        debug!("Started in-process worker (generation {})", options.generation);

        Ok(WorkerConnection {
            pid: None,
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(TaskControl { task }),
        })
    }
}

struct TaskControl {
    task: JoinHandle<WorkerExit>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    async fn wait(&mut self) -> Result<ExitStatusInfo, ExecutionError> {
        match (&mut self.task).await {
            Ok(exit) => Ok(ExitStatusInfo::exited(exit.code())),
            Err(e) if e.is_cancelled() => Ok(ExitStatusInfo::signaled(SIGINT)),
            Err(e) => Err(ExecutionError::Spawn(format!("Worker task failed: {}", e))),
        }
    }

    fn terminate(&mut self) -> Result<(), ExecutionError> {
        self.task.abort();
        Ok(())
    }
}
