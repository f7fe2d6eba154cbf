//! Step execution and worker supervision configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Supervisor settings: per-call timeout, restart behaviour, debug attach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Time a step may take before its caller receives a timeout error
    #[serde(with = "crate::domains::utils::serde_millis", default = "default_step_timeout")]
    pub step_timeout: Duration,

    /// Window in which source change events coalesce into one restart
    #[serde(with = "crate::domains::utils::serde_millis", default = "default_restart_debounce")]
    pub restart_debounce: Duration,

    /// Time allowed for the worker to answer the `ready` request
    #[serde(with = "crate::domains::utils::serde_millis", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Start the worker in debug-attach mode
    #[serde(default = "crate::domains::utils::default_false")]
    pub inspect: bool,

    /// Restart the worker after an exit nobody asked for
    #[serde(default = "crate::domains::utils::default_true")]
    pub restart_on_crash: bool,

    /// Consecutive crashes tolerated before giving up; unbounded when unset
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,

    /// Pause between a crash and the restart
    #[serde(with = "crate::domains::utils::serde_millis", default)]
    pub restart_delay: Duration,

    /// Fail calls still pending on a worker generation once it exits
    #[serde(default = "crate::domains::utils::default_true")]
    pub fail_pending_on_exit: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
            restart_debounce: default_restart_debounce(),
            handshake_timeout: default_handshake_timeout(),
            inspect: false,
            restart_on_crash: true,
            max_restart_attempts: None,
            restart_delay: Duration::ZERO,
            fail_pending_on_exit: true,
        }
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.step_timeout.as_millis(), "step_timeout", self.domain_name())?;
        validate_positive(
            self.handshake_timeout.as_millis(),
            "handshake_timeout",
            self.domain_name(),
        )?;

        if let Some(attempts) = self.max_restart_attempts {
            validate_positive(attempts, "max_restart_attempts", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}

fn default_step_timeout() -> Duration {
    Duration::from_millis(8000)
}

fn default_restart_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::default();
        assert_eq!(config.step_timeout, Duration::from_millis(8000));
        assert_eq!(config.restart_debounce, Duration::from_millis(500));
        assert!(config.restart_on_crash);
        assert!(config.max_restart_attempts.is_none());
        assert_eq!(config.restart_delay, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ExecutionConfig {
            step_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_restart_attempts_rejected() {
        let config = ExecutionConfig {
            max_restart_attempts: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
