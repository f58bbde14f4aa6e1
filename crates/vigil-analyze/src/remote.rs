//! Relay to a remote analysis server.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use vigil_core::protocol::{AnalysisRequest, AnalysisSummary};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("analysis server timed out after {0:?}")]
    Timeout(Duration),

    #[error("analysis server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("analysis server returned invalid JSON: {0}")]
    InvalidResponse(String),

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Full endpoint URL the request document is POSTed to.
    pub url: String,
    pub timeout: Duration,
}

/// What the server sends back. Anything beyond these keys is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAnalysis {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub analysis: AnalysisSummary,
}

pub struct RemoteAnalyzer {
    http: Client,
    config: RemoteConfig,
}

impl RemoteAnalyzer {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RemoteError::Network)?;
        Ok(Self { http, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// POST the request document and parse the server's summary.
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<RemoteAnalysis, RemoteError> {
        debug!(url = %self.config.url, samples = request.time_series_data.len(), "sending analysis request");

        let response = self
            .http
            .post(&self.config.url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(|e| self.classify(e))?;
        serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    fn classify(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.config.timeout)
        } else {
            RemoteError::Network(e)
        }
    }
}
