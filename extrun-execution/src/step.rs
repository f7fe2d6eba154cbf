//! Step calling convention
//!
//! A step receives `(prior_error?, context, input, done)` as a [`StepCall`].
//! It either returns a future ([`StepReturn::Future`]) or signals completion
//! later through [`Done`] ([`StepReturn::Callback`]). Whichever settles first
//! wins; later completions are ignored.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::context::StepContext;
use crate::error::codes;
use crate::ipc::TransportError;

/// Outcome of one step: its output or a flattened error
pub type StepResult = Result<JsonValue, TransportError>;

/// Future returned by promise-style steps
pub type StepFuture = BoxFuture<'static, anyhow::Result<JsonValue>>;

/// Everything a step is called with
pub struct StepCall {
    /// Error being handled; only set for error-catching steps
    pub prior_error: Option<TransportError>,
    pub context: StepContext,
    pub input: JsonValue,
    pub done: Done,
}

/// How a step reports its result
pub enum StepReturn {
    /// The step will call [`Done`]
    Callback,
    /// The step's result is this future; `done` is disarmed
    Future(StepFuture),
}

impl StepReturn {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        StepReturn::Future(Box::pin(future))
    }
}

/// A loaded, callable step
pub trait Step: Send + Sync {
    fn call(&self, call: StepCall) -> StepReturn;
}

/// What reached the completion cell first
pub(crate) enum Settled {
    Finished(StepResult),
    /// A task holding [`Done`] unwound before completing
    Panicked,
}

struct CompletionState {
    sender: Mutex<Option<oneshot::Sender<Settled>>>,
    callback_armed: AtomicBool,
}

/// Single-settlement cell shared by [`Done`] and the runtime
#[derive(Clone)]
pub(crate) struct Completion(Arc<CompletionState>);

impl Completion {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Settled>) {
        let (tx, rx) = oneshot::channel();
        let state = CompletionState {
            sender: Mutex::new(Some(tx)),
            callback_armed: AtomicBool::new(true),
        };
        (Self(Arc::new(state)), rx)
    }

    /// Settle with `result`. Returns false if already settled.
    pub(crate) fn complete(&self, result: StepResult) -> bool {
        self.settle(Settled::Finished(result))
    }

    fn settle(&self, settled: Settled) -> bool {
        match self.0.sender.lock().take() {
            Some(tx) => {
                let _ = tx.send(settled);
                true
            }
            None => false,
        }
    }

    fn disarm_callback(&self) {
        self.0.callback_armed.store(false, Ordering::SeqCst);
    }

    fn callback_armed(&self) -> bool {
        self.0.callback_armed.load(Ordering::SeqCst)
    }
}

/// Completion callback handed to every step.
///
/// Only the first call counts. Once the step has returned a future, calls
/// are ignored. Dropping every `Done` without calling it, for a step that
/// returned [`StepReturn::Callback`], fails the call with a contract error.
#[derive(Clone)]
pub struct Done {
    completion: Completion,
}

impl Done {
    pub(crate) fn new(completion: Completion) -> Self {
        Self { completion }
    }

    /// Complete with `result`. Returns whether the result was accepted.
    pub fn call(&self, result: anyhow::Result<JsonValue>) -> bool {
        if !self.completion.callback_armed() {
            warn!("Step returned a future, ignoring completion callback");
            return false;
        }
        let accepted = self
            .completion
            .complete(result.map_err(TransportError::from_anyhow));
        if !accepted {
            warn!("Step completed more than once, ignoring");
        }
        accepted
    }

    pub fn ok(&self, output: JsonValue) -> bool {
        self.call(Ok(output))
    }

    pub fn err(&self, error: impl Into<anyhow::Error>) -> bool {
        self.call(Err(error.into()))
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if std::thread::panicking() && self.completion.callback_armed() {
            self.completion.settle(Settled::Panicked);
        }
    }
}

/// Call `step` and wait for whichever completion path settles first.
///
/// A panic in a task that held the step's [`Done`] is resumed here, so the
/// invocation fails the same way as a panic in the step itself.
pub(crate) async fn drive(
    step: Arc<dyn Step>,
    prior_error: Option<TransportError>,
    context: StepContext,
    input: JsonValue,
) -> StepResult {
    let (completion, mut settled) = Completion::new();
    let call = StepCall {
        prior_error,
        context,
        input,
        done: Done::new(completion.clone()),
    };

    let settlement = match step.call(call) {
        StepReturn::Future(future) => {
            completion.disarm_callback();
            // `completion` keeps the cell open while the future runs
            tokio::select! {
                biased;
                settlement = &mut settled => settlement,
                result = future => Ok(Settled::Finished(result.map_err(TransportError::from_anyhow))),
            }
        }
        StepReturn::Callback => {
            drop(completion);
            settled.await
        }
    };

    match settlement {
        Ok(Settled::Finished(result)) => result,
        Ok(Settled::Panicked) => std::panic::resume_unwind(Box::new(
            "Step task panicked before completing".to_string(),
        )),
        Err(_) => Err(TransportError::new(
            "Step finished without calling its completion callback",
        )
        .with_code(codes::CONTRACT)),
    }
}

/// Callback-style step backed by a closure
pub struct FnStep<F>(F);

impl<F> Step for FnStep<F>
where
    F: Fn(StepCall) + Send + Sync,
{
    fn call(&self, call: StepCall) -> StepReturn {
        (self.0)(call);
        StepReturn::Callback
    }
}

/// Promise-style step backed by an async closure
pub struct AsyncFnStep<F>(F);

impl<F, Fut> Step for AsyncFnStep<F>
where
    F: Fn(StepCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    fn call(&self, call: StepCall) -> StepReturn {
        StepReturn::future((self.0)(call))
    }
}

/// Wrap a closure that completes through `call.done`
pub fn callback_step<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepCall) + Send + Sync + 'static,
{
    Arc::new(FnStep(f))
}

/// Wrap a closure returning the step's future
pub fn async_step<F, Fut>(f: F) -> Arc<dyn Step>
where
    F: Fn(StepCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    Arc::new(AsyncFnStep(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use futures::FutureExt;
    use serde_json::json;
    use std::panic::AssertUnwindSafe;
    use std::time::Duration;

    #[tokio::test]
    async fn test_callback_step_completes() {
        let step = callback_step(|call| {
            call.done.ok(json!({ "echo": call.input }));
        });
        let result = drive(step, None, test_context(), json!(1)).await;
        assert_eq!(result.unwrap(), json!({ "echo": 1 }));
    }

    #[tokio::test]
    async fn test_callback_from_another_task() {
        let step = callback_step(|call| {
            let done = call.done;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.ok(json!("later"));
            });
        });
        let result = drive(step, None, test_context(), json!(null)).await;
        assert_eq!(result.unwrap(), json!("later"));
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let step = callback_step(|call| {
            assert!(call.done.ok(json!("first")));
            assert!(!call.done.err(anyhow::anyhow!("second")));
        });
        let result = drive(step, None, test_context(), json!(null)).await;
        assert_eq!(result.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_future_disarms_callback() {
        let step: Arc<dyn Step> = Arc::new(AsyncFnStep(|call: StepCall| {
            let done = call.done;
            async move {
                assert!(!done.ok(json!("from callback")));
                Ok(json!("from future"))
            }
        }));
        let result = drive(step, None, test_context(), json!(null)).await;
        assert_eq!(result.unwrap(), json!("from future"));
    }

    #[tokio::test]
    async fn test_callback_before_future_replies_at_once() {
        let step = async_step(|call| {
            call.done.ok(json!("from callback"));
            async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(json!("from future"))
            }
        });
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            drive(step, None, test_context(), json!(null)),
        )
        .await
        .unwrap();
        assert_eq!(result.unwrap(), json!("from callback"));
    }

    #[tokio::test]
    async fn test_panic_in_task_holding_done_is_resumed() {
        let step = callback_step(|call| {
            let done = call.done;
            tokio::spawn(async move {
                let _keep = done;
                panic!("async boom");
            });
        });
        let outcome = AssertUnwindSafe(drive(step, None, test_context(), json!(null)))
            .catch_unwind()
            .await;
        let payload = match outcome {
            Err(payload) => payload,
            Ok(result) => panic!("expected a panic, got {:?}", result),
        };
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("Step task panicked before completing")
        );
    }

    #[tokio::test]
    async fn test_future_error_is_flattened() {
        let step = async_step(|_call| async { Err(anyhow::anyhow!("boom")) });
        let err = drive(step, None, test_context(), json!(null)).await.unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.name, "Error");
    }

    #[tokio::test]
    async fn test_dropped_done_is_contract_error() {
        let step = callback_step(|_call| {});
        let err = drive(step, None, test_context(), json!(null)).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(codes::CONTRACT));
    }

    #[tokio::test]
    async fn test_prior_error_reaches_step() {
        let step = callback_step(|call| {
            let message = call.prior_error.map(|e| e.message).unwrap_or_default();
            call.done.ok(json!({ "handled": message }));
        });
        let result = drive(
            step,
            Some(TransportError::new("upstream")),
            test_context(),
            json!(null),
        )
        .await;
        assert_eq!(result.unwrap(), json!({ "handled": "upstream" }));
    }
}
