//! Worker runtime
//!
//! Runs inside the isolated worker process. Answers the handshake, resolves
//! each invocation to a step, runs it with a fresh [`StepContext`] and replies
//! with exactly one `output` per call. Invocations run concurrently. A step
//! panic is fatal, including one in a task that held the step's completion
//! callback: its caller gets the panic as an error and the worker exits so
//! the supervisor can start a clean one.

use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use extrun_config::WorkspaceConfig;

use crate::bridge::CapabilityBridge;
use crate::context::{ContextParts, StepContext, StepLogger};
use crate::error::codes;
use crate::extensions::{AttachedExtensions, AttachedExtensionsFile};
use crate::ipc::{
    FrameReader, FrameWriter, IpcError, LogLevel, StdioTransport, StepMeta, SupervisorMessage,
    TransportError, WorkerMessage,
};
use crate::loader::{StepExport, StepLoader, StepLocation};
use crate::outbox::{spawn_writer, Outbox};
use crate::step::{self, StepResult};
use crate::storage::{FileStorage, Storage};

/// Upper bound for getting queued frames out before the worker exits
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The supervisor closed the channel
    Disconnected,
    /// A step panicked
    Fatal,
}

impl WorkerExit {
    /// Process exit code for this outcome
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Disconnected => 0,
            WorkerExit::Fatal => 1,
        }
    }
}

type InvocationOutcome = (u64, Result<(), Box<dyn Any + Send>>);

/// Step execution side of the worker channel
#[derive(Clone)]
pub struct WorkerRuntime {
    extensions_path: PathBuf,
    extensions: Arc<dyn AttachedExtensions>,
    loader: Arc<dyn StepLoader>,
    storage: Arc<dyn Storage>,
    http: reqwest::Client,
    inspect: bool,
}

impl WorkerRuntime {
    pub fn new(
        extensions_path: impl Into<PathBuf>,
        extensions: Arc<dyn AttachedExtensions>,
        loader: Arc<dyn StepLoader>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            extensions_path: extensions_path.into(),
            extensions,
            loader,
            storage,
            http: reqwest::Client::new(),
            inspect: false,
        }
    }

    /// Runtime reading the attached extensions and storage files of `workspace`
    pub fn from_workspace(workspace: &WorkspaceConfig, loader: Arc<dyn StepLoader>) -> Self {
        Self::new(
            workspace.extensions_path(),
            Arc::new(AttachedExtensionsFile::new(workspace.attached_extensions_path())),
            loader,
            Arc::new(FileStorage::new(workspace.storage_path())),
        )
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Announce the process id so a debugger can attach
    pub fn with_inspect(mut self, inspect: bool) -> Self {
        self.inspect = inspect;
        self
    }

    pub fn extensions_path(&self) -> &Path {
        &self.extensions_path
    }

    /// Serve the supervisor over this process's stdin and stdout
    pub async fn run_stdio(self) -> WorkerExit {
        let (reader, writer) = StdioTransport::stdio().into_split();
        self.run(reader, writer).await
    }

    /// Serve one supervisor channel until it closes or a step panics
    pub async fn run<R, W>(self, mut reader: FrameReader<R>, writer: FrameWriter<W>) -> WorkerExit
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, rx) = Outbox::channel();
        let writer_task = spawn_writer(writer, rx);
        let bridge = Arc::new(CapabilityBridge::new(outbox.clone()));
        let runtime = Arc::new(self);
        let mut invocations: JoinSet<InvocationOutcome> = JoinSet::new();

        if runtime.inspect {
            system_log(
                &outbox,
                LogLevel::Info,
                format!("Worker running in inspect mode, pid {}", std::process::id()),
            );
        }

        let exit = loop {
            tokio::select! {
                Some(joined) = invocations.join_next(), if !invocations.is_empty() => {
                    match joined {
                        Ok((call_id, Err(panic))) => {
                            let err = TransportError::from_panic(panic).with_code(codes::PANIC);
                            error!("Step panicked during call {}: {}", call_id, err);
                            system_log(&outbox, LogLevel::Error, format!("Step panicked: {}", err));
                            let _ = outbox.send(SupervisorMessage::Output {
                                call_id,
                                err: Some(err),
                                output: None,
                            });
                            break WorkerExit::Fatal;
                        }
                        Ok((_, Ok(()))) => {}
                        Err(e) => warn!("Invocation task ended abnormally: {}", e),
                    }
                }
                frame = reader.receive::<WorkerMessage>() => match frame {
                    Ok(envelope) => runtime.dispatch(envelope.message, &outbox, &bridge, &mut invocations),
                    Err(IpcError::ConnectionClosed) => {
                        info!("Supervisor closed the channel");
                        break WorkerExit::Disconnected;
                    }
                    Err(e) if e.is_recoverable() => warn!("Skipping unreadable frame: {}", e),
                    Err(e) => {
                        error!("IPC transport error: {}", e);
                        break WorkerExit::Disconnected;
                    }
                }
            }
        };

        invocations.abort_all();
        if tokio::time::timeout(FLUSH_TIMEOUT, outbox.flush()).await.is_err() {
            warn!("Timed out flushing frames to supervisor");
        }
        writer_task.abort();
        debug!("Worker loop finished: {:?}", exit);
        exit
    }

    fn dispatch(
        self: &Arc<Self>,
        message: WorkerMessage,
        outbox: &Outbox<SupervisorMessage>,
        bridge: &Arc<CapabilityBridge>,
        invocations: &mut JoinSet<InvocationOutcome>,
    ) {
        match message {
            WorkerMessage::Ready { .. } => {
                debug!("Handshake request received");
                if outbox.send(SupervisorMessage::ready()).is_err() {
                    warn!("Could not answer handshake, channel closed");
                }
            }
            WorkerMessage::Invoke {
                input,
                step_meta,
                call_id,
            } => {
                let runtime = self.clone();
                let outbox = outbox.clone();
                let bridge = bridge.clone();
                invocations.spawn(async move {
                    let invocation = runtime.invoke(call_id, input, step_meta, outbox, bridge);
                    let outcome = AssertUnwindSafe(invocation).catch_unwind().await;
                    (call_id, outcome)
                });
            }
            WorkerMessage::DcResponse {
                request_id,
                info,
                err,
            } => {
                if let Err(e) = bridge.handle_response(&request_id, info, err) {
                    system_log(outbox, LogLevel::Error, e.to_string());
                }
            }
            WorkerMessage::Unknown => warn!("Ignoring unknown message from supervisor"),
        }
    }

    async fn invoke(
        self: Arc<Self>,
        call_id: u64,
        input: JsonValue,
        step_meta: StepMeta,
        outbox: Outbox<SupervisorMessage>,
        bridge: Arc<CapabilityBridge>,
    ) {
        system_log(&outbox, LogLevel::Info, "Starting step execution ...");

        let result = self
            .run_step(call_id, input, &step_meta, &outbox, &bridge)
            .await;

        system_log(&outbox, LogLevel::Info, "Step executed");
        let (err, output) = match result {
            Ok(output) => (None, Some(output)),
            Err(err) => (Some(err), None),
        };
        if outbox
            .send(SupervisorMessage::Output {
                call_id,
                err,
                output,
            })
            .is_err()
        {
            warn!("Dropping output of call {}, channel closed", call_id);
        }
    }

    async fn run_step(
        &self,
        call_id: u64,
        input: JsonValue,
        meta: &StepMeta,
        outbox: &Outbox<SupervisorMessage>,
        bridge: &Arc<CapabilityBridge>,
    ) -> StepResult {
        let attached = self
            .extensions
            .load()
            .await
            .map_err(|e| TransportError::from_std(&e).with_code(codes::LOAD))?;

        let Some(extension) = attached.get(&meta.id) else {
            let message = format!("Got step execution of unregistered extension: \"{}\"", meta.id);
            error!("{}", message);
            return Err(TransportError::new(message).with_code(codes::UNREGISTERED));
        };

        let source_dir = extension.source_dir(&self.extensions_path);
        let relative_path = meta.relative_path().to_string();
        let file = source_dir.join(&relative_path);
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            let message = format!("StepFile {} not found", file.display());
            error!("{}", message);
            return Err(TransportError::new(message).with_code(codes::NOT_FOUND));
        }

        let location = StepLocation {
            extension_id: meta.id.clone(),
            relative_path,
            file,
        };
        let step = match self.loader.load(&location) {
            Ok(StepExport::Step(step)) => step,
            Ok(StepExport::Value(_)) => {
                let message = format!(
                    "Can't find step function in {}; the step must export a callable step",
                    meta.path
                );
                error!("{}", message);
                return Err(TransportError::named("TypeError", message).with_code(codes::CONTRACT));
            }
            Err(e) => {
                error!("{}", e);
                return Err(TransportError::from_std(&e).with_code(codes::LOAD));
            }
        };

        let context = StepContext::new(ContextParts {
            extension_id: meta.id.clone(),
            config: read_extension_config(&source_dir).await,
            meta: meta.meta.clone(),
            storage: self.storage.clone(),
            bridge: bridge.clone(),
            logger: StepLogger::new(outbox.clone(), call_id),
            http: self.http.clone(),
        });

        let prior_error = if meta.is_error_catching {
            meta.catchable_error.clone()
        } else {
            None
        };

        debug!("Running step {} for call {}", meta.path, call_id);
        step::drive(step, prior_error, context, input).await
    }
}

/// `config.json` of an extension, or `{}` when absent or unreadable
async fn read_extension_config(source_dir: &Path) -> JsonValue {
    let file = source_dir.join("config.json");
    match tokio::fs::read(&file).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!("Ignoring invalid {:?}: {}", file, e);
            JsonValue::Object(Default::default())
        }),
        Err(_) => JsonValue::Object(Default::default()),
    }
}

fn system_log(outbox: &Outbox<SupervisorMessage>, level: LogLevel, message: impl Into<String>) {
    let _ = outbox.send(SupervisorMessage::SystemLog {
        level: Some(level),
        arguments: vec![JsonValue::String(message.into())],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{AttachedExtension, StaticExtensions};
    use crate::ipc::{InvocationMeta, MessageEnvelope};
    use crate::loader::StepRegistry;
    use crate::step::{async_step, callback_step};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    struct Harness {
        to_worker: FrameWriter<WriteHalf<DuplexStream>>,
        from_worker: FrameReader<ReadHalf<DuplexStream>>,
        worker: JoinHandle<WorkerExit>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn start(registry: StepRegistry) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("foobar").join("extension");
            std::fs::create_dir_all(&source).unwrap();
            for file in [
                "simple.js",
                "value.js",
                "panic.js",
                "spawned-panic.js",
                "bridge.js",
                "unregistered.js",
            ] {
                std::fs::write(source.join(file), "").unwrap();
            }
            std::fs::write(source.join("config.json"), r#"{"greeting": "hi"}"#).unwrap();

            let extensions = StaticExtensions::new();
            extensions.attach("@foo/bar", AttachedExtension::new("foobar"));

            let runtime = WorkerRuntime::new(
                dir.path(),
                Arc::new(extensions),
                Arc::new(registry),
                Arc::new(MemoryStorage::new()),
            );

            let (supervisor_side, worker_side) = tokio::io::duplex(64 * 1024);
            let (sup_read, sup_write) = tokio::io::split(supervisor_side);
            let (w_read, w_write) = tokio::io::split(worker_side);
            let worker = tokio::spawn(runtime.run(FrameReader::new(w_read), FrameWriter::new(w_write)));

            Self {
                to_worker: FrameWriter::new(sup_write),
                from_worker: FrameReader::new(sup_read),
                worker,
                _dir: dir,
            }
        }

        async fn send(&mut self, message: WorkerMessage) {
            self.to_worker.send_message(message).await.unwrap();
        }

        async fn invoke(&mut self, call_id: u64, path: &str, input: JsonValue) {
            let meta = StepMeta::new("@foo/bar", path, InvocationMeta::new("shop_1", "dev_1"));
            self.send(WorkerMessage::Invoke {
                input,
                step_meta: meta,
                call_id,
            })
            .await;
        }

        async fn recv(&mut self) -> SupervisorMessage {
            let envelope: MessageEnvelope<SupervisorMessage> =
                self.from_worker.receive().await.unwrap();
            envelope.message
        }

        /// Skip log lines until the next non-log frame
        async fn next_reply(&mut self) -> SupervisorMessage {
            loop {
                match self.recv().await {
                    SupervisorMessage::SystemLog { .. } | SupervisorMessage::Log { .. } => continue,
                    other => return other,
                }
            }
        }

        async fn output(&mut self) -> (u64, Option<TransportError>, Option<JsonValue>) {
            match self.next_reply().await {
                SupervisorMessage::Output {
                    call_id,
                    err,
                    output,
                } => (call_id, err, output),
                other => panic!("expected output, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_answers_handshake() {
        let mut harness = Harness::start(StepRegistry::new());
        harness.send(WorkerMessage::ready()).await;
        assert_eq!(harness.recv().await, SupervisorMessage::ready());
    }

    #[tokio::test]
    async fn test_runs_step_with_config() {
        let registry = StepRegistry::new();
        registry.register(
            "@foo/bar",
            "simple.js",
            callback_step(|call| {
                let greeting = call.context.config["greeting"].clone();
                call.done.ok(json!({ "greeting": greeting, "input": call.input }));
            }),
        );
        let mut harness = Harness::start(registry);

        harness.invoke(3, "@foo/bar/simple.js", json!(5)).await;
        match harness.recv().await {
            SupervisorMessage::SystemLog { arguments, .. } => {
                assert_eq!(arguments, vec![json!("Starting step execution ...")])
            }
            other => panic!("expected systemLog, got {:?}", other),
        }

        let (call_id, err, output) = harness.output().await;
        assert_eq!(call_id, 3);
        assert!(err.is_none());
        assert_eq!(output, Some(json!({ "greeting": "hi", "input": 5 })));
    }

    #[tokio::test]
    async fn test_unregistered_extension() {
        let mut harness = Harness::start(StepRegistry::new());
        let meta = StepMeta::new("@other/ext", "@other/ext/simple.js", InvocationMeta::new("a", "d"));
        harness
            .send(WorkerMessage::Invoke {
                input: json!(null),
                step_meta: meta,
                call_id: 1,
            })
            .await;

        let (_, err, _) = harness.output().await;
        let err = err.unwrap();
        assert_eq!(err.code.as_deref(), Some(codes::UNREGISTERED));
        assert_eq!(err.message, "Got step execution of unregistered extension: \"@other/ext\"");
    }

    #[tokio::test]
    async fn test_missing_step_file() {
        let mut harness = Harness::start(StepRegistry::new());
        harness.invoke(1, "@foo/bar/missing.js", json!(null)).await;

        let (_, err, _) = harness.output().await;
        let err = err.unwrap();
        assert_eq!(err.code.as_deref(), Some(codes::NOT_FOUND));
        assert!(err.message.starts_with("StepFile "));
        assert!(err.message.ends_with("missing.js not found"));
    }

    #[tokio::test]
    async fn test_non_callable_export() {
        let registry = StepRegistry::new();
        registry.register_value("@foo/bar", "value.js", json!({"not": "a step"}));
        let mut harness = Harness::start(registry);

        harness.invoke(1, "@foo/bar/value.js", json!(null)).await;
        let (_, err, _) = harness.output().await;
        assert_eq!(err.unwrap().code.as_deref(), Some(codes::CONTRACT));

        // The worker keeps serving after a contract violation.
        harness.send(WorkerMessage::ready()).await;
        assert_eq!(harness.next_reply().await, SupervisorMessage::ready());
    }

    #[tokio::test]
    async fn test_file_without_registered_step_is_load_error() {
        let mut harness = Harness::start(StepRegistry::new());
        harness.invoke(1, "@foo/bar/unregistered.js", json!(null)).await;

        let (_, err, _) = harness.output().await;
        assert_eq!(err.unwrap().code.as_deref(), Some(codes::LOAD));
    }

    #[tokio::test]
    async fn test_panic_is_fatal() {
        let registry = StepRegistry::new();
        registry.register(
            "@foo/bar",
            "panic.js",
            async_step(|call| async move {
                if call.input.is_null() {
                    panic!("kaboom");
                }
                Ok(call.input)
            }),
        );
        let mut harness = Harness::start(registry);

        harness.invoke(9, "@foo/bar/panic.js", json!(null)).await;
        let (call_id, err, _) = harness.output().await;
        assert_eq!(call_id, 9);
        let err = err.unwrap();
        assert_eq!(err.code.as_deref(), Some(codes::PANIC));
        assert_eq!(err.message, "kaboom");

        let exit = harness.worker.await.unwrap();
        assert_eq!(exit, WorkerExit::Fatal);
        assert_eq!(exit.code(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_spawned_task_is_fatal() {
        let registry = StepRegistry::new();
        registry.register(
            "@foo/bar",
            "spawned-panic.js",
            callback_step(|call| {
                let done = call.done;
                tokio::spawn(async move {
                    let _keep = done;
                    panic!("async boom");
                });
            }),
        );
        let mut harness = Harness::start(registry);

        harness.invoke(4, "@foo/bar/spawned-panic.js", json!(null)).await;
        let (call_id, err, output) = harness.output().await;
        assert_eq!(call_id, 4);
        assert!(output.is_none());
        assert_eq!(err.unwrap().code.as_deref(), Some(codes::PANIC));

        assert_eq!(harness.worker.await.unwrap(), WorkerExit::Fatal);
    }

    #[tokio::test]
    async fn test_bridge_round_trip_and_unmatched_response() {
        let registry = StepRegistry::new();
        registry.register(
            "@foo/bar",
            "bridge.js",
            async_step(|call| async move {
                let info = call.context.app.get_info().await?;
                Ok(json!({ "app": info }))
            }),
        );
        let mut harness = Harness::start(registry);

        harness.invoke(1, "@foo/bar/bridge.js", json!(null)).await;
        let request_id = match harness.next_reply().await {
            SupervisorMessage::DcRequest {
                resource_name,
                request_id,
                ..
            } => {
                assert_eq!(resource_name, "appinfos");
                request_id
            }
            other => panic!("expected dcRequest, got {:?}", other),
        };

        harness
            .send(WorkerMessage::DcResponse {
                request_id: "unknown".to_string(),
                info: json!(null),
                err: None,
            })
            .await;
        match harness.recv().await {
            SupervisorMessage::SystemLog { level, arguments } => {
                assert_eq!(level, Some(LogLevel::Error));
                assert!(arguments[0].as_str().unwrap().contains("unknown"));
            }
            other => panic!("expected systemLog, got {:?}", other),
        }

        harness
            .send(WorkerMessage::DcResponse {
                request_id,
                info: json!({"name": "Shop"}),
                err: None,
            })
            .await;
        let (_, err, output) = harness.output().await;
        assert!(err.is_none());
        assert_eq!(output, Some(json!({ "app": { "name": "Shop" } })));
    }

    #[tokio::test]
    async fn test_exits_cleanly_on_disconnect() {
        let mut harness = Harness::start(StepRegistry::new());
        harness.to_worker.close().await.unwrap();
        assert_eq!(harness.worker.await.unwrap(), WorkerExit::Disconnected);
    }
}
