//! Structural error representation that survives the process boundary

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::any::Any;
use std::fmt;

fn default_name() -> String {
    "Error".to_string()
}

/// An error flattened to data: name, message, optional stack and code, plus
/// any extra fields the producer attached.
///
/// Errors never cross the supervisor/worker boundary as Rust types. The worker
/// converts whatever failed into this shape, and the supervisor hands the same
/// shape back to callers, which is why it implements [`std::error::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportError {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl TransportError {
    /// Plain `Error` with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
            extra: Map::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach an arbitrary field; it is serialized next to `name` and `message`
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.extra.get(key)
    }

    /// Flatten any standard error, keeping its source chain as the stack
    pub fn from_std(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("Caused by: {}", cause));
            source = cause.source();
        }

        let mut transport = Self::new(err.to_string());
        if !chain.is_empty() {
            transport.stack = Some(chain.join("\n"));
        }
        transport
    }

    /// Flatten an `anyhow::Error`. A `TransportError` wrapped by anyhow is
    /// returned as-is so steps can control name, code and extra fields.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<TransportError>() {
            Ok(transport) => transport,
            Err(err) => {
                let mut transport = Self::new(err.to_string());
                if err.chain().nth(1).is_some() {
                    transport.stack = Some(format!("{:?}", err));
                }
                transport
            }
        }
    }

    /// Flatten a panic payload caught from a step
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "step panicked".to_string()
        };
        Self::named("Panic", message)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}
