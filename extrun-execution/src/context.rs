//! Per-invocation step context
//!
//! Built fresh for every call. Storage scopes resolve their key prefixes
//! here, so a step only ever sees plain keys.

use serde_json::Value as JsonValue;
use std::fmt::Display;
use std::sync::Arc;
use tracing::warn;

use crate::bridge::{BridgeError, CapabilityBridge, APP_INFO_RESOURCE, DEVICE_INFO_RESOURCE};
use crate::ipc::{InvocationMeta, LogLevel, SupervisorMessage};
use crate::outbox::Outbox;
use crate::storage::{Storage, StorageError};

const USER_NOT_LOGGED_IN: &str = "user is not logged in";

/// A view on [`Storage`] restricted to one key prefix
#[derive(Clone)]
pub struct StorageScope {
    storage: Arc<dyn Storage>,
    prefix: Result<String, &'static str>,
}

impl StorageScope {
    fn new(storage: Arc<dyn Storage>, prefix: String) -> Self {
        Self {
            storage,
            prefix: Ok(prefix),
        }
    }

    fn unavailable(storage: Arc<dyn Storage>, reason: &'static str) -> Self {
        Self {
            storage,
            prefix: Err(reason),
        }
    }

    /// Full storage path for `key`
    pub fn path(&self, key: &str) -> Result<String, StorageError> {
        match &self.prefix {
            Ok(prefix) => Ok(format!("{}{}", prefix, key)),
            Err(reason) => Err(StorageError::Unavailable((*reason).to_string())),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        let path = self.path(key)?;
        self.storage.get(&path).await
    }

    pub async fn set(&self, key: &str, value: JsonValue) -> Result<(), StorageError> {
        let path = self.path(key)?;
        self.storage.set(&path, value).await
    }

    pub async fn del(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        self.storage.del(&path).await
    }
}

/// The three storage scopes available to a step
#[derive(Clone)]
pub struct StepStorage {
    /// Shared by every app using the extension
    pub extension: StorageScope,
    /// Per app and device
    pub device: StorageScope,
    /// Per app and user; fails when the invocation has no user
    pub user: StorageScope,
}

/// Read-only access to the extension's settings for the current app
#[derive(Clone)]
pub struct SettingsReader {
    scope: StorageScope,
}

impl SettingsReader {
    pub async fn get(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        self.scope.get(key).await
    }
}

/// Fetches one kind of host-held information through the bridge
#[derive(Clone)]
pub struct InfoAccessor {
    bridge: Arc<CapabilityBridge>,
    resource: &'static str,
    app_id: String,
    device_id: String,
}

impl InfoAccessor {
    pub async fn get_info(&self) -> Result<JsonValue, BridgeError> {
        self.bridge
            .request(self.resource, &self.app_id, &self.device_id)
            .await
    }

    /// Callback flavour of [`get_info`](Self::get_info)
    pub fn get_info_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<JsonValue, BridgeError>) + Send + 'static,
    {
        self.bridge
            .request_with(self.resource, &self.app_id, &self.device_id, callback);
    }

    pub fn resource(&self) -> &str {
        self.resource
    }
}

/// Step logger. Lines are sent to the supervisor tagged with the call id.
#[derive(Clone)]
pub struct StepLogger {
    outbox: Outbox<SupervisorMessage>,
    call_id: u64,
}

impl StepLogger {
    pub(crate) fn new(outbox: Outbox<SupervisorMessage>, call_id: u64) -> Self {
        Self { outbox, call_id }
    }

    pub fn log(&self, level: LogLevel, arguments: Vec<JsonValue>) {
        let sent = self.outbox.send(SupervisorMessage::Log {
            level: Some(level),
            arguments,
            call_id: Some(self.call_id),
        });
        if sent.is_err() {
            warn!("Dropping step log line, supervisor channel is closed");
        }
    }

    pub fn trace(&self, message: impl Display) {
        self.log(LogLevel::Trace, vec![JsonValue::String(message.to_string())]);
    }

    pub fn debug(&self, message: impl Display) {
        self.log(LogLevel::Debug, vec![JsonValue::String(message.to_string())]);
    }

    pub fn info(&self, message: impl Display) {
        self.log(LogLevel::Info, vec![JsonValue::String(message.to_string())]);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(LogLevel::Warn, vec![JsonValue::String(message.to_string())]);
    }

    pub fn error(&self, message: impl Display) {
        self.log(LogLevel::Error, vec![JsonValue::String(message.to_string())]);
    }

    pub fn fatal(&self, message: impl Display) {
        self.log(LogLevel::Fatal, vec![JsonValue::String(message.to_string())]);
    }
}

/// Inputs needed to assemble a [`StepContext`]
pub struct ContextParts {
    pub extension_id: String,
    pub config: JsonValue,
    pub meta: InvocationMeta,
    pub storage: Arc<dyn Storage>,
    pub bridge: Arc<CapabilityBridge>,
    pub logger: StepLogger,
    pub http: reqwest::Client,
}

/// Capabilities handed to a step for one invocation
#[derive(Clone)]
pub struct StepContext {
    pub storage: StepStorage,
    pub settings: SettingsReader,
    pub app: InfoAccessor,
    pub device: InfoAccessor,
    /// Contents of the extension's `config.json`
    pub config: JsonValue,
    pub meta: InvocationMeta,
    pub log: StepLogger,
    extension_id: String,
    http: reqwest::Client,
}

impl StepContext {
    pub fn new(parts: ContextParts) -> Self {
        let ContextParts {
            extension_id,
            config,
            meta,
            storage,
            bridge,
            logger,
            http,
        } = parts;

        let user = match &meta.user_id {
            Some(user_id) => StorageScope::new(
                storage.clone(),
                format!("{}/{}/{}/storage/", meta.app_id, user_id, extension_id),
            ),
            None => StorageScope::unavailable(storage.clone(), USER_NOT_LOGGED_IN),
        };
        let step_storage = StepStorage {
            extension: StorageScope::new(storage.clone(), format!("{}/storage/", extension_id)),
            device: StorageScope::new(
                storage.clone(),
                format!("{}/{}/{}/storage/", meta.app_id, meta.device_id, extension_id),
            ),
            user,
        };
        let settings = SettingsReader {
            scope: StorageScope::new(
                storage,
                format!("{}/{}/settings/", meta.app_id, extension_id),
            ),
        };

        let accessor = |resource| InfoAccessor {
            bridge: bridge.clone(),
            resource,
            app_id: meta.app_id.clone(),
            device_id: meta.device_id.clone(),
        };
        let app = accessor(APP_INFO_RESOURCE);
        let device = accessor(DEVICE_INFO_RESOURCE);

        Self {
            storage: step_storage,
            settings,
            app,
            device,
            config,
            meta,
            log: logger,
            extension_id,
            http,
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// HTTP client for outbound requests made by the step
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}
