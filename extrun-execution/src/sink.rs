//! Destination for log lines emitted by steps and by the worker runtime

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, trace, warn};

use crate::ipc::LogLevel;

/// Receives every `log` and `systemLog` line the worker sends.
///
/// `step_path` is set for step output and is the path of the step that
/// produced the line; runtime lines have none.
pub trait StepLogSink: Send + Sync {
    fn log(&self, level: LogLevel, step_path: Option<&str>, arguments: &[JsonValue]);
}

/// Forwards lines to `tracing` under the `extrun::step` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStepSink;

impl StepLogSink for TracingStepSink {
    fn log(&self, level: LogLevel, step_path: Option<&str>, arguments: &[JsonValue]) {
        let line = format_line(step_path, arguments);
        match level {
            LogLevel::Trace => trace!(target: "extrun::step", "{}", line),
            LogLevel::Debug => debug!(target: "extrun::step", "{}", line),
            LogLevel::Info => info!(target: "extrun::step", "{}", line),
            LogLevel::Warn => warn!(target: "extrun::step", "{}", line),
            LogLevel::Error | LogLevel::Fatal => error!(target: "extrun::step", "{}", line),
        }
    }
}

/// `[path]: arg1 arg2`. String arguments are printed bare, anything else as JSON.
pub fn format_line(step_path: Option<&str>, arguments: &[JsonValue]) -> String {
    let body = arguments
        .iter()
        .map(|argument| match argument {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    match step_path {
        Some(path) => format!("[{}]: {}", path, body),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_with_prefix() {
        let line = format_line(
            Some("@foo/bar/simple.js"),
            &[json!("count"), json!(3), json!({"a": true})],
        );
        assert_eq!(line, r#"[@foo/bar/simple.js]: count 3 {"a":true}"#);
    }

    #[test]
    fn test_format_without_prefix() {
        assert_eq!(format_line(None, &[json!("Step executed")]), "Step executed");
        assert_eq!(format_line(None, &[]), "");
    }
}
