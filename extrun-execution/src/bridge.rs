//! Capability bridge
//!
//! Lets step code inside the worker ask the supervisor for host-held
//! information. Each request gets a fresh UUID and waits in a pending table
//! until the matching `dcResponse` arrives. One bridge exists per worker run
//! and is handed to every step context.

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use crate::ipc::{SupervisorMessage, TransportError};
use crate::outbox::Outbox;

/// Resource name for application information
pub const APP_INFO_RESOURCE: &str = "appinfos";
/// Resource name for device information
pub const DEVICE_INFO_RESOURCE: &str = "deviceinfos";

/// Bridge errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Received response for unknown request id '{request_id}'")]
    UnmatchedResponse { request_id: String },

    /// The supervisor answered with an error
    #[error("{0}")]
    Lookup(TransportError),

    #[error("Connection to supervisor lost")]
    ChannelClosed,
}

type Resolver = oneshot::Sender<Result<JsonValue, BridgeError>>;

struct PendingRequest {
    request_id: String,
    resolver: Resolver,
}

/// Request/response correlation over the worker's channel
pub struct CapabilityBridge {
    outbox: Outbox<SupervisorMessage>,
    requests: Mutex<Vec<PendingRequest>>,
}

impl CapabilityBridge {
    pub fn new(outbox: Outbox<SupervisorMessage>) -> Self {
        Self {
            outbox,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Ask the supervisor for `resource_name` and wait for the answer
    pub async fn request(
        &self,
        resource_name: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<JsonValue, BridgeError> {
        let answer = self.begin(resource_name, app_id, device_id);
        answer.await.unwrap_or(Err(BridgeError::ChannelClosed))
    }

    /// Callback flavour of [`request`](Self::request). `callback` runs on a
    /// separate task once the answer arrives.
    pub fn request_with<F>(&self, resource_name: &str, app_id: &str, device_id: &str, callback: F)
    where
        F: FnOnce(Result<JsonValue, BridgeError>) + Send + 'static,
    {
        let answer = self.begin(resource_name, app_id, device_id);
        tokio::spawn(async move {
            callback(answer.await.unwrap_or(Err(BridgeError::ChannelClosed)));
        });
    }

    fn begin(
        &self,
        resource_name: &str,
        app_id: &str,
        device_id: &str,
    ) -> oneshot::Receiver<Result<JsonValue, BridgeError>> {
        let (resolver, answer) = oneshot::channel();
        let request_id = Uuid::new_v4().to_string();

        self.requests.lock().push(PendingRequest {
            request_id: request_id.clone(),
            resolver,
        });

        let sent = self.outbox.send(SupervisorMessage::DcRequest {
            resource_name: resource_name.to_string(),
            app_id: app_id.to_string(),
            device_id: device_id.to_string(),
            request_id: request_id.clone(),
        });

        if sent.is_err() {
            if let Some(pending) = self.take(&request_id) {
                let _ = pending.resolver.send(Err(BridgeError::ChannelClosed));
            }
        } else {
            debug!("Sent {} request {}", resource_name, request_id);
        }
        answer
    }

    /// Resolve the request waiting on `request_id`. An `err` from the
    /// supervisor fails the request. Unknown ids leave every pending request
    /// untouched and are reported as an error.
    pub fn handle_response(
        &self,
        request_id: &str,
        info: JsonValue,
        err: Option<TransportError>,
    ) -> Result<(), BridgeError> {
        let Some(pending) = self.take(request_id) else {
            error!("Received response for unknown request id '{}'", request_id);
            return Err(BridgeError::UnmatchedResponse {
                request_id: request_id.to_string(),
            });
        };

        let result = match err {
            Some(err) => Err(BridgeError::Lookup(err)),
            None => Ok(info),
        };
        // The requester may have given up; nothing to do then.
        let _ = pending.resolver.send(result);
        Ok(())
    }

    /// Number of requests still waiting for an answer
    pub fn pending(&self) -> usize {
        self.requests.lock().len()
    }

    fn take(&self, request_id: &str) -> Option<PendingRequest> {
        let mut requests = self.requests.lock();
        let index = requests.iter().position(|r| r.request_id == request_id)?;
        Some(requests.remove(index))
    }
}

impl std::fmt::Debug for CapabilityBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityBridge")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Shared handle used by step contexts
pub type SharedBridge = Arc<CapabilityBridge>;
