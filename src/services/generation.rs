use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use strum::{Display, EnumString};

/// Classification of a failed generation attempt.
///
/// Every kind moves the circuit breaker identically; the distinction exists
/// for telemetry and operator triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call exceeded the adaptive timeout.
    Timeout,
    /// Upstream rate limiting or quota exhaustion (HTTP 429).
    Quota,
    /// Upstream server error (HTTP 5xx).
    Server,
    /// Request rejected by the upstream (HTTP 4xx other than 429).
    Client,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("generation failed ({kind}): {detail}")]
pub struct GenerationError {
    pub kind: FailureKind,
    pub detail: String,
}

impl GenerationError {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Options for one generation call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Synthetic recovery probe rather than user traffic.
    pub is_probe: bool,
    /// Hard deadline; the underlying HTTP request is aborted past it.
    pub timeout: Duration,
}

/// A generated image returned by the upstream API.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    /// File extension for the storage key ("png", "jpeg", ...).
    pub format: String,
}

/// Port to the external image-generation API.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<GeneratedImage, GenerationError>;
}

#[derive(Deserialize)]
struct GenerationResponse {
    result: GenerationResult,
}

#[derive(Deserialize)]
struct GenerationResult {
    /// Base64-encoded image payload.
    image: String,
}

/// HTTP client for the hosted image-generation API.
pub struct HttpGenerationClient {
    http: reqwest::Client,
    endpoint: String,
    api_token: String,
}

impl HttpGenerationClient {
    pub fn new(endpoint: &str, api_token: &str) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GenerationError::new(FailureKind::Unknown, e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
        })
    }

    fn classify(err: &reqwest::Error) -> FailureKind {
        if err.is_timeout() {
            return FailureKind::Timeout;
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 => FailureKind::Quota,
            Some(status) if status.is_server_error() => FailureKind::Server,
            Some(status) if status.is_client_error() => FailureKind::Client,
            _ => FailureKind::Unknown,
        }
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<GeneratedImage, GenerationError> {
        let request_body = serde_json::json!({
            "prompt": prompt,
            "probe": opts.is_probe,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .timeout(opts.timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GenerationError::new(Self::classify(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let kind = match status.as_u16() {
                429 => FailureKind::Quota,
                500..=599 => FailureKind::Server,
                400..=499 => FailureKind::Client,
                _ => FailureKind::Unknown,
            };
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::new(
                kind,
                format!("upstream returned {status}: {body}"),
            ));
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::new(Self::classify(&e), e.to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(parsed.result.image.as_bytes())
            .map_err(|e| {
                GenerationError::new(FailureKind::Unknown, format!("invalid image payload: {e}"))
            })?;

        // Reject payloads that are not actually an image before they reach
        // storage and clients.
        let format = image::guess_format(&bytes).map_err(|e| {
            GenerationError::new(FailureKind::Unknown, format!("unrecognized image data: {e}"))
        })?;

        Ok(GeneratedImage {
            bytes,
            format: format.extensions_str().first().unwrap_or(&"png").to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_have_stable_labels() {
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
        assert_eq!(FailureKind::Server.to_string(), "server");
        assert_eq!("quota".parse::<FailureKind>().ok(), Some(FailureKind::Quota));
    }

    #[test]
    fn generation_error_formats_kind_and_detail() {
        let err = GenerationError::new(FailureKind::Quota, "rate limited");
        assert_eq!(err.to_string(), "generation failed (quota): rate limited");
    }
}
