//! Classification error types.

use thiserror::Error;

pub type MlResult<T> = Result<T, MlError>;

#[derive(Debug, Error)]
pub enum MlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Classifier returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MlError {
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            MlError::Http { status, .. } => *status == 429 || *status >= 500,
            MlError::Timeout(_) => true,
            MlError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// The classifier refused the request outright (401/403).
    pub fn is_security_fault(&self) -> bool {
        matches!(self, MlError::Http { status: 401 | 403, .. })
    }
}
