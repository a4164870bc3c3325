//! Error types for the devflow SDK.

use serde::{Deserialize, Serialize};

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;

/// Error types that can occur when talking to the cluster, a peer or a download source.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote side answered with an unexpected status.
    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        reason: Option<String>,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file system error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl SdkError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Timeout => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Create an API error from a status code and response body.
    pub fn from_response(status: u16, body: &str) -> Self {
        // Kubernetes answers with a Status object, peers with plain text
        if let Ok(status_body) = serde_json::from_str::<StatusResponse>(body) {
            Self::Api {
                status,
                message: status_body.message,
                reason: status_body.reason,
            }
        } else {
            Self::Api {
                status,
                message: body.trim().to_string(),
                reason: None,
            }
        }
    }

    /// HTTP status of an API error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Error body returned by the Kubernetes API server.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(alias = "error")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
