//! Access to the vendor backend that answers app and device info lookups

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_http_address, validate_positive, Validatable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base address of the developer connector
    pub address: String,

    #[serde(with = "crate::domains::utils::serde_millis", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Bearer token sent with every lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: "https://developer-connector.example.com".to_string(),
            request_timeout: default_request_timeout(),
            access_token: None,
        }
    }
}

impl Validatable for BackendConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_http_address(&self.address, "address", self.domain_name())?;
        validate_positive(
            self.request_timeout.as_millis(),
            "request_timeout",
            self.domain_name(),
        )?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "backend"
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(2000)
}
