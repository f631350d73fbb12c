use std::time::Duration;

use reqwest::header::{HeaderValue, ACCEPT};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::telemetry::TelemetrySample;

/// Why a status fetch did not produce a usable sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device answered with HTTP status {0}")]
    HttpError(u16),
    #[error("malformed status response: {0}")]
    MalformedResponse(String),
    #[error("status response has no emeters[{}] ({available} channel(s) reported)", .required - 1)]
    NoChannelData { required: usize, available: usize },
}

impl FetchError {
    /// Short machine friendly name used as a structured log field
    pub fn classification(&self) -> &'static str {
        match self {
            FetchError::Unreachable(_) => "unreachable",
            FetchError::HttpError(_) => "http_error",
            FetchError::MalformedResponse(_) => "malformed_response",
            FetchError::NoChannelData { .. } => "no_channel_data",
        }
    }
}

/// Where a device lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEndpoint {
    /// `host` or `host:port`
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn status_url(&self) -> String {
        format!("http://{}/status", self.host)
    }
}

/// HTTP client for one Shelly device. Owns its own connection pool so devices never share
/// connection state.
pub struct MeterClient {
    endpoint: DeviceEndpoint,
    status_url: String,
    client: reqwest::Client,
    required_channels: usize,
}

impl MeterClient {
    /// `required_channels` is the minimum length of the `emeters` array for a sample to be usable.
    pub fn new(
        endpoint: DeviceEndpoint,
        request_timeout: Duration,
        required_channels: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            status_url: endpoint.status_url(),
            endpoint,
            client,
            required_channels: required_channels.max(1),
        })
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Fetches and validates one telemetry sample.
    pub async fn fetch(&self) -> Result<TelemetrySample, FetchError> {
        let document = self.fetch_document().await?;
        let sample = TelemetrySample::from_json(document)
            .map_err(|e| FetchError::MalformedResponse(format!("{} from {}", e, self.status_url)))?;
        if sample.channels.len() < self.required_channels {
            return Err(FetchError::NoChannelData {
                required: self.required_channels,
                available: sample.channels.len(),
            });
        }
        Ok(sample)
    }

    /// Reads the device MAC address, used once at startup as the serial number.
    pub async fn fetch_serial(&self) -> Result<String, FetchError> {
        let document = self.fetch_document().await?;
        document
            .get("mac")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|mac| !mac.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                FetchError::MalformedResponse("response does not contain 'mac' attribute".to_string())
            })
    }

    async fn fetch_document(&self) -> Result<Value, FetchError> {
        let response = match self.send().await {
            // Shelly firmware occasionally stalls a single response; one quick retry covers it
            Err(e) if e.is_timeout() && !e.is_connect() => {
                debug!(url = %self.status_url, "read timeout, retrying once");
                self.send().await
            }
            other => other,
        }
        .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpError(status.as_u16()));
        }

        let body = response.bytes().await.map_err(classify_transport_error)?;
        let document: Value = serde_json::from_slice(&body).map_err(|e| {
            FetchError::MalformedResponse(format!("invalid JSON from {}: {}", self.status_url, e))
        })?;
        if !document.is_object() {
            return Err(FetchError::MalformedResponse(format!(
                "unexpected JSON structure from {}",
                self.status_url
            )));
        }
        Ok(document)
    }

    async fn send(&self) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .get(&self.status_url)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(username) = &self.endpoint.username {
            request = request.basic_auth(username, self.endpoint.password.as_deref());
        }
        request.send().await
    }
}

fn classify_transport_error(error: reqwest::Error) -> FetchError {
    if error.is_decode() {
        FetchError::MalformedResponse(error.to_string())
    } else {
        FetchError::Unreachable(error.to_string())
    }
}
