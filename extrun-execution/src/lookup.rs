//! App and device info lookups on the supervisor side

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use extrun_config::BackendConfig;

/// Lookup errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InfoLookupError {
    #[error("Info request failed: {0}")]
    Request(String),

    /// The backend answered with a non-success status
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Invalid info response: {0}")]
    Decode(String),
}

/// Answers `dcRequest` messages from the worker
#[async_trait]
pub trait InfoLookup: Send + Sync {
    async fn lookup(
        &self,
        resource_type: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<JsonValue, InfoLookupError>;
}

#[async_trait]
impl<F> InfoLookup for F
where
    F: Fn(&str, &str, &str) -> Result<JsonValue, InfoLookupError> + Send + Sync,
{
    async fn lookup(
        &self,
        resource_type: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<JsonValue, InfoLookupError> {
        (self)(resource_type, app_id, device_id)
    }
}

/// Lookup against the backend's REST API:
/// `GET {address}/applications/{app_id}/{resource_type}/{device_id}`
#[derive(Debug, Clone)]
pub struct HttpInfoLookup {
    client: reqwest::Client,
    address: String,
    access_token: Option<String>,
}

impl HttpInfoLookup {
    pub fn new(
        address: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InfoLookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InfoLookupError::Request(e.to_string()))?;
        Ok(Self {
            client,
            address: address.into(),
            access_token,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, InfoLookupError> {
        Self::new(
            config.address.clone(),
            config.access_token.clone(),
            config.request_timeout,
        )
    }

    pub fn url(&self, resource_type: &str, app_id: &str, device_id: &str) -> String {
        format!(
            "{}/applications/{}/{}/{}",
            self.address.trim_end_matches('/'),
            app_id,
            resource_type,
            device_id
        )
    }
}

#[async_trait]
impl InfoLookup for HttpInfoLookup {
    async fn lookup(
        &self,
        resource_type: &str,
        app_id: &str,
        device_id: &str,
    ) -> Result<JsonValue, InfoLookupError> {
        let url = self.url(resource_type, app_id, device_id);
        debug!("Fetching {} from {}", resource_type, url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InfoLookupError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InfoLookupError::Request(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            let message = serde_json::from_str::<JsonValue>(&body)
                .ok()
                .and_then(|value| value.get("message")?.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("could not get {}", resource_type));
            return Err(InfoLookupError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| InfoLookupError::Decode(e.to_string()))
    }
}
