use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentSourceError {
    #[error("content source request failed: {0}")]
    Transport(String),
    #[error("content source answered with status {0}")]
    Status(u16),
    #[error("content source payload is invalid: {0}")]
    Decode(String),
}

/// Where the publish trigger gets a value to broadcast.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self) -> Result<String, ContentSourceError>;
}

/// Random advice from an adviceslip-compatible API (`{"slip":{"advice":"…"}}`).
pub struct AdviceSlipSource {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct AdviceSlipResponse {
    slip: AdviceSlip,
}

#[derive(Debug, Deserialize)]
struct AdviceSlip {
    advice: String,
}

impl AdviceSlipSource {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ContentSource for AdviceSlipSource {
    async fn fetch(&self) -> Result<String, ContentSourceError> {
        let response = self
            .http
            .get(self.url.as_str())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|error| ContentSourceError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ContentSourceError::Status(status.as_u16()));
        }
        // The upstream API serves JSON as text/html, so decode the raw body.
        let body = response
            .bytes()
            .await
            .map_err(|error| ContentSourceError::Transport(error.to_string()))?;
        let parsed: AdviceSlipResponse = serde_json::from_slice(&body)
            .map_err(|error| ContentSourceError::Decode(error.to_string()))?;
        let advice = parsed.slip.advice.trim().to_string();
        if advice.is_empty() {
            return Err(ContentSourceError::Decode("advice is empty".to_string()));
        }
        Ok(advice)
    }
}
