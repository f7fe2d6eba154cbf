//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::transport_error::TransportError;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Invocation metadata handed to a step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMeta {
    pub app_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl InvocationMeta {
    pub fn new(app_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            device_id: device_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Identifies the step to run and how to run it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMeta {
    /// Extension id, e.g. `@acme/cart`
    pub id: String,
    /// Extension-relative step path, e.g. `@acme/cart/steps/add.js`
    pub path: String,
    #[serde(default)]
    pub is_error_catching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catchable_error: Option<TransportError>,
    #[serde(default)]
    pub meta: InvocationMeta,
}

impl StepMeta {
    pub fn new(id: impl Into<String>, path: impl Into<String>, meta: InvocationMeta) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            is_error_catching: false,
            catchable_error: None,
            meta,
        }
    }

    /// Turn this into an error-catching invocation carrying `error`
    pub fn catching(mut self, error: Option<TransportError>) -> Self {
        self.is_error_catching = true;
        self.catchable_error = error;
        self
    }

    /// The part of `path` beyond the extension id, without a leading separator
    pub fn relative_path(&self) -> &str {
        let suffix = self.path.strip_prefix(self.id.as_str()).unwrap_or(&self.path);
        suffix.trim_start_matches('/')
    }
}

/// Log levels understood by the step output sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Messages sent from the supervisor to the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Handshake request
    Ready { ready: bool },

    /// Run one step
    Invoke {
        input: JsonValue,
        step_meta: StepMeta,
        call_id: u64,
    },

    /// Answer to a `dcRequest`
    DcResponse {
        request_id: String,
        #[serde(default)]
        info: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<TransportError>,
    },

    #[serde(other)]
    Unknown,
}

/// Messages sent from the worker process to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SupervisorMessage {
    /// Handshake reply
    Ready { ready: bool },

    /// Step log line
    Log {
        #[serde(default)]
        level: Option<LogLevel>,
        #[serde(default)]
        arguments: Vec<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<u64>,
    },

    /// Runtime log line, never prefixed
    SystemLog {
        #[serde(default)]
        level: Option<LogLevel>,
        #[serde(default)]
        arguments: Vec<JsonValue>,
    },

    /// Result of one invocation
    Output {
        call_id: u64,
        #[serde(default)]
        err: Option<TransportError>,
        #[serde(default)]
        output: Option<JsonValue>,
    },

    /// Host-held information requested by step code
    DcRequest {
        resource_name: String,
        app_id: String,
        device_id: String,
        request_id: String,
    },

    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn ready() -> Self {
        WorkerMessage::Ready { ready: true }
    }
}

impl SupervisorMessage {
    pub fn ready() -> Self {
        SupervisorMessage::Ready { ready: true }
    }

    /// Message kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorMessage::Ready { .. } => "ready",
            SupervisorMessage::Log { .. } => "log",
            SupervisorMessage::SystemLog { .. } => "systemLog",
            SupervisorMessage::Output { .. } => "output",
            SupervisorMessage::DcRequest { .. } => "dcRequest",
            SupervisorMessage::Unknown => "unknown",
        }
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_wire_shape() {
        let meta = StepMeta::new(
            "@foo/bar",
            "@foo/bar/simple.js",
            InvocationMeta::new("shop_123", "dev-1"),
        );
        let message = WorkerMessage::Invoke {
            input: json!({"foo": "bar"}),
            step_meta: meta,
            call_id: 7,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "invoke");
        assert_eq!(value["callId"], 7);
        assert_eq!(value["stepMeta"]["isErrorCatching"], false);
        assert_eq!(value["stepMeta"]["meta"]["appId"], "shop_123");
        assert!(value["stepMeta"]["meta"].get("userId").is_none());
    }

    #[test]
    fn test_dc_request_from_wire() {
        let raw = json!({
            "type": "dcRequest",
            "resourceName": "appinfos",
            "appId": "shop_1337",
            "deviceId": "d-1",
            "requestId": "abc"
        });

        let message: SupervisorMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            message,
            SupervisorMessage::DcRequest {
                resource_name: "appinfos".to_string(),
                app_id: "shop_1337".to_string(),
                device_id: "d-1".to_string(),
                request_id: "abc".to_string(),
            }
        );
    }

    #[test]
    fn test_log_without_level_or_call() {
        let message: SupervisorMessage =
            serde_json::from_value(json!({"type": "log", "arguments": ["hi", 1]})).unwrap();

        match message {
            SupervisorMessage::Log {
                level,
                arguments,
                call_id,
            } => {
                assert_eq!(level.unwrap_or_default(), LogLevel::Debug);
                assert_eq!(arguments, vec![json!("hi"), json!(1)]);
                assert!(call_id.is_none());
            }
            other => panic!("Expected log message, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let message: SupervisorMessage =
            serde_json::from_value(json!({"type": "somethingElse", "x": 1})).unwrap();
        assert_eq!(message, SupervisorMessage::Unknown);
        assert_eq!(message.kind(), "unknown");
    }

    #[test]
    fn test_relative_path() {
        let meta = StepMeta::new("@foo/bar", "@foo/bar/sub/step.js", InvocationMeta::default());
        assert_eq!(meta.relative_path(), "sub/step.js");

        let meta = StepMeta::new("@foo/bar", "other/step.js", InvocationMeta::default());
        assert_eq!(meta.relative_path(), "other/step.js");
    }

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(WorkerMessage::ready());
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: MessageEnvelope<WorkerMessage> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.message, WorkerMessage::Ready { ready: true });
    }
}
