//! Worker supervision
//!
//! The [`Supervisor`] owns at most one worker at a time. It performs the
//! `ready` handshake, tracks each in-flight call with its own timeout,
//! routes worker messages, answers capability requests and restarts the
//! worker after a crash or after extension sources change.
//!
//! Every worker gets a generation number. Exit and handshake events carry
//! the generation they belong to, so a late event from an old worker never
//! touches its successor.

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use extrun_config::ExecutionConfig;

use crate::error::ExecutionError;
use crate::ipc::{
    FrameReader, FrameWriter, IpcError, StepMeta, SupervisorMessage, TransportError,
    WorkerMessage,
};
use crate::lookup::InfoLookup;
use crate::outbox::{spawn_writer, Outbox};
use crate::sink::{StepLogSink, TracingStepSink};
use crate::spawner::{
    BoxedReader, ExitStatusInfo, SpawnOptions, WorkerConnection, WorkerControl, WorkerSpawner,
};
use crate::watcher::ChangeEvent;

/// Upper bound for reading a dead worker's last frames
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives the result of one call, exactly once
pub type StepCallback = Box<dyn FnOnce(Result<JsonValue, ExecutionError>) + Send + 'static>;

/// Lifecycle state of the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Waiting to respawn after a crash or a change
    Restarting,
}

/// State plus the generation of the current (or last) worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub generation: u64,
}

struct PendingCall {
    callback: StepCallback,
    timer: AbortHandle,
    path: String,
    generation: u64,
}

struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    /// Set once the handshake completed; dropped on disconnect
    outbox: Option<Outbox<WorkerMessage>>,
    stop_requested: bool,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

struct Shared {
    worker: Option<WorkerHandle>,
    pending: HashMap<u64, PendingCall>,
    next_call_id: u64,
    generation: u64,
    latest_step_path: Option<String>,
    consecutive_crashes: u32,
}

struct Inner {
    config: ExecutionConfig,
    spawner: Arc<dyn WorkerSpawner>,
    lookup: Arc<dyn InfoLookup>,
    sink: Arc<dyn StepLogSink>,
    shared: Mutex<Shared>,
    status: watch::Sender<SupervisorStatus>,
    restart_queued: AtomicBool,
}

/// Outcome of a worker exit, decided under the lock
enum ExitAction {
    Ignore,
    Stay,
    Restart,
}

/// Cloneable handle to the supervisor. Background tasks hold weak
/// references, so dropping the last handle shuts the worker down.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: ExecutionConfig,
        spawner: Arc<dyn WorkerSpawner>,
        lookup: Arc<dyn InfoLookup>,
    ) -> Self {
        Self::with_sink(config, spawner, lookup, Arc::new(TracingStepSink))
    }

    pub fn with_sink(
        config: ExecutionConfig,
        spawner: Arc<dyn WorkerSpawner>,
        lookup: Arc<dyn InfoLookup>,
        sink: Arc<dyn StepLogSink>,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorStatus {
            state: SupervisorState::Stopped,
            generation: 0,
        });

        Self {
            inner: Arc::new(Inner {
                config,
                spawner,
                lookup,
                sink,
                shared: Mutex::new(Shared {
                    worker: None,
                    pending: HashMap::new(),
                    next_call_id: 0,
                    generation: 0,
                    latest_step_path: None,
                    consecutive_crashes: 0,
                }),
                status,
                restart_queued: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.inner.status.borrow()
    }

    /// Follow lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.status.subscribe()
    }

    /// Whether a worker is connected and accepting calls
    pub fn is_running(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared
            .worker
            .as_ref()
            .is_some_and(|worker| worker.outbox.is_some())
    }

    /// Process id of the current worker, if it runs as a process
    pub fn pid(&self) -> Option<u32> {
        self.inner.shared.lock().worker.as_ref().and_then(|w| w.pid)
    }

    /// Number of calls waiting for their output
    pub fn pending_calls(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    fn set_state(&self, state: SupervisorState, generation: u64) {
        self.inner
            .status
            .send_replace(SupervisorStatus { state, generation });
    }

    /// Spawn a worker and wait for its handshake
    pub async fn start(&self) -> Result<(), ExecutionError> {
        self.launch(false).await
    }

    /// Crash restarts keep counting towards the restart limit; any other
    /// start begins a fresh count.
    async fn launch(&self, after_crash: bool) -> Result<(), ExecutionError> {
        let (generation, exited_tx) = {
            let mut shared = self.inner.shared.lock();
            if shared.worker.is_some() {
                return Err(ExecutionError::AlreadyRunning);
            }
            if !after_crash {
                shared.consecutive_crashes = 0;
            }
            shared.generation += 1;
            let generation = shared.generation;
            let (exited_tx, exited_rx) = watch::channel(false);
            shared.worker = Some(WorkerHandle {
                generation,
                pid: None,
                outbox: None,
                stop_requested: false,
                kill: None,
                exited: exited_rx,
            });
            (generation, exited_tx)
        };
        self.set_state(SupervisorState::Starting, generation);

        let options = SpawnOptions {
            inspect: self.inner.config.inspect,
            generation,
        };
        let connection = match self.inner.spawner.spawn(&options).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to start worker: {}", e);
                self.release(generation);
                let _ = exited_tx.send(true);
                self.set_state(SupervisorState::Stopped, generation);
                return Err(e);
            }
        };

        let WorkerConnection {
            pid,
            reader,
            writer,
            control,
        } = connection;

        let (outbox, outbound) = Outbox::channel();
        let writer_task = spawn_writer(FrameWriter::new(writer), outbound);
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_task = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            generation,
            reader,
            ready_tx,
        ));
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(
            Arc::downgrade(&self.inner),
            generation,
            control,
            kill_rx,
            reader_task,
            writer_task,
            exited_tx,
        ));

        {
            let mut shared = self.inner.shared.lock();
            match shared.worker.as_mut() {
                Some(worker) if worker.generation == generation => {
                    worker.pid = pid;
                    worker.kill = Some(kill_tx);
                    if worker.stop_requested {
                        // stop() came in while spawning
                        if let Some(kill) = worker.kill.take() {
                            let _ = kill.send(());
                        }
                        return Err(ExecutionError::Handshake(
                            "worker stopped during startup".to_string(),
                        ));
                    }
                }
                _ => {
                    let _ = kill_tx.send(());
                    return Err(ExecutionError::Handshake(
                        "worker replaced during startup".to_string(),
                    ));
                }
            }
        }

        if outbox.send(WorkerMessage::ready()).is_err() {
            warn!("Could not send handshake request");
        }

        let handshake = tokio::time::timeout(self.inner.config.handshake_timeout, ready_rx).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some("worker closed the channel before answering".to_string()),
            Err(_) => Some(format!(
                "no ready reply within {:?}",
                self.inner.config.handshake_timeout
            )),
        };

        if let Some(reason) = failure {
            error!("Worker handshake failed: {}", reason);
            self.abandon(generation);
            return Err(ExecutionError::Handshake(reason));
        }

        {
            let mut shared = self.inner.shared.lock();
            match shared.worker.as_mut() {
                Some(worker) if worker.generation == generation && !worker.stop_requested => {
                    worker.outbox = Some(outbox);
                }
                _ => {
                    return Err(ExecutionError::Handshake(
                        "worker went away during handshake".to_string(),
                    ))
                }
            }
        }

        self.set_state(SupervisorState::Running, generation);
        info!("Runtime started (generation {}, pid {:?})", generation, pid);
        Ok(())
    }

    /// Forget a worker that never got past spawning
    fn release(&self, generation: u64) {
        let mut shared = self.inner.shared.lock();
        if shared
            .worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
        {
            shared.worker = None;
        }
    }

    /// Kill a worker without restarting it
    fn abandon(&self, generation: u64) {
        let mut shared = self.inner.shared.lock();
        if let Some(worker) = shared.worker.as_mut() {
            if worker.generation == generation {
                worker.stop_requested = true;
                worker.outbox = None;
                if let Some(kill) = worker.kill.take() {
                    let _ = kill.send(());
                }
            }
        }
    }

    /// Disconnect and terminate the worker, waiting until it has exited.
    /// No restart follows. Stopping a stopped supervisor is a no-op.
    pub async fn stop(&self) -> Result<(), ExecutionError> {
        let (generation, mut exited) = {
            let mut shared = self.inner.shared.lock();
            let Some(worker) = shared.worker.as_mut() else {
                return Ok(());
            };
            worker.stop_requested = true;
            // Dropping the outbox closes the worker's input.
            worker.outbox = None;
            if let Some(kill) = worker.kill.take() {
                let _ = kill.send(());
            }
            (worker.generation, worker.exited.clone())
        };
        self.set_state(SupervisorState::Stopping, generation);
        info!("Stopping runtime (generation {})", generation);

        let _ = exited.wait_for(|done| *done).await;
        Ok(())
    }

    /// Stop the current worker, then start a new one
    pub async fn restart(&self) -> Result<(), ExecutionError> {
        self.stop().await?;
        let generation = self.status().generation;
        self.set_state(SupervisorState::Restarting, generation);
        self.start().await
    }

    /// Run a step. `callback` is invoked exactly once: with the output, the
    /// step's error, a timeout, or [`ExecutionError::NotRunning`] (synchronously,
    /// without sending anything) when no worker is connected.
    pub fn execute_with<F>(&self, input: JsonValue, step_meta: StepMeta, callback: F)
    where
        F: FnOnce(Result<JsonValue, ExecutionError>) + Send + 'static,
    {
        let mut shared = self.inner.shared.lock();
        let connected = shared
            .worker
            .as_ref()
            .and_then(|worker| worker.outbox.clone().map(|outbox| (worker.generation, outbox)));
        let Some((generation, outbox)) = connected else {
            drop(shared);
            callback(Err(ExecutionError::NotRunning));
            return;
        };

        let call_id = shared.next_call_id;
        shared.next_call_id += 1;

        let weak = Arc::downgrade(&self.inner);
        let step_timeout = self.inner.config.step_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(step_timeout).await;
            if let Some(supervisor) = Supervisor::from_weak(&weak) {
                supervisor.expire(call_id);
            }
        })
        .abort_handle();

        let path = step_meta.path.clone();
        shared.pending.insert(
            call_id,
            PendingCall {
                callback: Box::new(callback),
                timer,
                path: path.clone(),
                generation,
            },
        );
        shared.latest_step_path = Some(path.clone());
        drop(shared);

        debug!("Dispatching call {} to step {}", call_id, path);
        let sent = outbox.send(WorkerMessage::Invoke {
            input,
            step_meta,
            call_id,
        });
        if sent.is_err() {
            if let Some(call) = self.take_call(call_id) {
                call.timer.abort();
                (call.callback)(Err(ExecutionError::NotRunning));
            }
        }
    }

    /// Promise flavour of [`execute_with`](Self::execute_with)
    pub async fn execute(
        &self,
        input: JsonValue,
        step_meta: StepMeta,
    ) -> Result<JsonValue, ExecutionError> {
        let path = step_meta.path.clone();
        let (tx, rx) = oneshot::channel();
        self.execute_with(input, step_meta, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or(Err(ExecutionError::WorkerTerminated { path }))
    }

    fn take_call(&self, call_id: u64) -> Option<PendingCall> {
        self.inner.shared.lock().pending.remove(&call_id)
    }

    fn expire(&self, call_id: u64) {
        if let Some(call) = self.take_call(call_id) {
            warn!("Step '{}' timed out (call {})", call.path, call_id);
            (call.callback)(Err(ExecutionError::Timeout { path: call.path }));
        }
    }

    /// Route one message from the worker of `generation`
    fn on_message(&self, generation: u64, message: SupervisorMessage) {
        match message {
            SupervisorMessage::Log {
                level,
                arguments,
                call_id,
            } => {
                let path = {
                    let shared = self.inner.shared.lock();
                    call_id
                        .and_then(|id| shared.pending.get(&id).map(|call| call.path.clone()))
                        .or_else(|| shared.latest_step_path.clone())
                };
                self.inner
                    .sink
                    .log(level.unwrap_or_default(), path.as_deref(), &arguments);
            }
            SupervisorMessage::SystemLog { level, arguments } => {
                self.inner
                    .sink
                    .log(level.unwrap_or_default(), None, &arguments);
            }
            SupervisorMessage::Output {
                call_id,
                err,
                output,
            } => {
                let call = {
                    let mut shared = self.inner.shared.lock();
                    let call = shared.pending.remove(&call_id);
                    if call.is_some() {
                        shared.consecutive_crashes = 0;
                    }
                    call
                };
                let Some(call) = call else {
                    warn!(
                        "Got output for call {} but no callback is waiting, maybe it timed out",
                        call_id
                    );
                    return;
                };
                call.timer.abort();
                let result = match err {
                    Some(err) => Err(ExecutionError::Step(err)),
                    None => Ok(output.unwrap_or(JsonValue::Null)),
                };
                (call.callback)(result);
            }
            SupervisorMessage::DcRequest {
                resource_name,
                app_id,
                device_id,
                request_id,
            } => {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    let response = match supervisor
                        .inner
                        .lookup
                        .lookup(&resource_name, &app_id, &device_id)
                        .await
                    {
                        Ok(info) => WorkerMessage::DcResponse {
                            request_id,
                            info,
                            err: None,
                        },
                        Err(e) => {
                            warn!("Lookup of {} for app {} failed: {}", resource_name, app_id, e);
                            WorkerMessage::DcResponse {
                                request_id,
                                info: JsonValue::Null,
                                err: Some(TransportError::from_std(&e)),
                            }
                        }
                    };
                    supervisor.reply(generation, response);
                });
            }
            SupervisorMessage::Ready { .. } => {
                trace!("Duplicate ready from worker generation {}", generation);
            }
            SupervisorMessage::Unknown => {
                warn!("Unknown message from worker generation {}", generation);
            }
        }
    }

    fn reply(&self, generation: u64, message: WorkerMessage) {
        let outbox = {
            let shared = self.inner.shared.lock();
            shared
                .worker
                .as_ref()
                .filter(|worker| worker.generation == generation)
                .and_then(|worker| worker.outbox.clone())
        };
        match outbox {
            Some(outbox) => {
                if outbox.send(message).is_err() {
                    warn!("Worker channel closed, dropping reply");
                }
            }
            None => warn!("Worker generation {} is gone, dropping reply", generation),
        }
    }

    fn on_disconnect(&self, generation: u64) {
        let mut shared = self.inner.shared.lock();
        if let Some(worker) = shared.worker.as_mut() {
            if worker.generation == generation && worker.outbox.take().is_some() {
                debug!("Worker generation {} disconnected", generation);
            }
        }
    }

    /// Bookkeeping after the worker of `generation` ended
    fn on_exit(&self, generation: u64, status: ExitStatusInfo) -> ExitAction {
        let config = &self.inner.config;
        let (action, failed, crashed, crashes) = {
            let mut shared = self.inner.shared.lock();
            let current = shared
                .worker
                .as_ref()
                .is_some_and(|worker| worker.generation == generation);
            if !current {
                return ExitAction::Ignore;
            }
            let requested = shared
                .worker
                .take()
                .is_some_and(|worker| worker.stop_requested);

            let failed: Vec<PendingCall> = if config.fail_pending_on_exit {
                let ids: Vec<u64> = shared
                    .pending
                    .iter()
                    .filter(|(_, call)| call.generation == generation)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| shared.pending.remove(&id))
                    .collect()
            } else {
                Vec::new()
            };

            let action = if requested {
                ExitAction::Stay
            } else {
                shared.consecutive_crashes += 1;
                let over_limit = config
                    .max_restart_attempts
                    .is_some_and(|max| shared.consecutive_crashes > max);
                if config.restart_on_crash && !over_limit {
                    ExitAction::Restart
                } else {
                    ExitAction::Stay
                }
            };
            (action, failed, !requested, shared.consecutive_crashes)
        };

        for call in failed {
            call.timer.abort();
            (call.callback)(Err(ExecutionError::WorkerTerminated { path: call.path }));
        }

        match action {
            ExitAction::Restart => {
                error!("Runtime crashed ({}), restarting", status);
                self.set_state(SupervisorState::Restarting, generation);
            }
            ExitAction::Stay if crashed => {
                if config.restart_on_crash {
                    let err = ExecutionError::RestartLimit { attempts: crashes };
                    error!("Runtime crashed ({}): {}", status, err);
                } else {
                    error!("Runtime crashed ({}), restart disabled", status);
                }
                self.set_state(SupervisorState::Stopped, generation);
            }
            _ => {
                info!("Runtime stopped ({})", status);
                self.set_state(SupervisorState::Stopped, generation);
            }
        }
        action
    }

    /// Boxed: `start` spawns the monitor that runs this
    fn restart_after_crash(&self) -> BoxFuture<'static, ()> {
        let supervisor = self.clone();
        async move {
            let delay = supervisor.inner.config.restart_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = supervisor.launch(true).await {
                match e {
                    ExecutionError::AlreadyRunning => debug!("Worker already restarted"),
                    other => error!("Failed to restart runtime: {}", other),
                }
            }
        }
        .boxed()
    }

    /// Restart the worker on change events. Events arriving while a restart
    /// is queued or running are coalesced into it.
    pub fn watch_changes<S>(&self, events: S) -> JoinHandle<()>
    where
        S: Stream<Item = ChangeEvent> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                let Some(supervisor) = Supervisor::from_weak(&weak) else {
                    break;
                };
                supervisor.on_change(event);
            }
            debug!("Change stream ended");
        })
    }

    fn on_change(&self, event: ChangeEvent) {
        if self.inner.restart_queued.swap(true, Ordering::SeqCst) {
            trace!("Restart already queued, ignoring {:?}", event.paths);
            return;
        }
        debug!("Extension source changed: {:?}", event.paths);

        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.inner.config.restart_debounce).await;
            info!("Extension file was changed, restarting runtime");
            if let Err(e) = supervisor.restart().await {
                error!("Failed to restart runtime after change: {}", e);
            }
            supervisor.inner.restart_queued.store(false, Ordering::SeqCst);
        });
    }
}

/// Read frames of one worker until its channel closes
async fn read_loop(
    weak: Weak<Inner>,
    generation: u64,
    reader: BoxedReader,
    ready: oneshot::Sender<()>,
) {
    let mut reader = FrameReader::new(reader);
    let mut ready = Some(ready);

    loop {
        match reader.receive::<SupervisorMessage>().await {
            Ok(envelope) => {
                let Some(supervisor) = Supervisor::from_weak(&weak) else {
                    break;
                };
                match envelope.message {
                    SupervisorMessage::Ready { .. } if ready.is_some() => {
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                    }
                    message => supervisor.on_message(generation, message),
                }
            }
            Err(IpcError::ConnectionClosed) => {
                debug!("Worker generation {} closed its output", generation);
                break;
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping unreadable frame from worker: {}", e);
            }
            Err(e) => {
                error!("Worker transport error: {}", e);
                break;
            }
        }
    }

    if let Some(supervisor) = Supervisor::from_weak(&weak) {
        supervisor.on_disconnect(generation);
    }
}

/// Wait for one worker to end, then settle its bookkeeping
async fn monitor(
    weak: Weak<Inner>,
    generation: u64,
    mut control: Box<dyn WorkerControl>,
    mut kill: oneshot::Receiver<()>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    exited: watch::Sender<bool>,
) {
    let ended = tokio::select! {
        status = control.wait() => Some(status),
        _ = &mut kill => None,
    };
    let killed = ended.is_none();
    let status = match ended {
        Some(status) => status,
        None => {
            if let Err(e) = control.terminate() {
                warn!("Failed to terminate worker: {}", e);
            }
            control.wait().await
        }
    };
    let status = status.unwrap_or_else(|e| {
        error!("Lost track of worker generation {}: {}", generation, e);
        ExitStatusInfo {
            code: None,
            signal: None,
        }
    });

    // Outputs a crashed worker wrote before exiting still count.
    if killed {
        reader_task.abort();
    } else if tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await.is_err() {
        warn!("Worker output still open after exit");
    }
    writer_task.abort();

    let action = match Supervisor::from_weak(&weak) {
        Some(supervisor) => {
            let action = supervisor.on_exit(generation, status);
            let _ = exited.send(true);
            if matches!(action, ExitAction::Restart) {
                supervisor.restart_after_crash().await;
            }
            action
        }
        None => {
            let _ = exited.send(true);
            ExitAction::Ignore
        }
    };
    trace!(
        "Monitor for generation {} done (restart: {})",
        generation,
        matches!(action, ExitAction::Restart)
    );
}
