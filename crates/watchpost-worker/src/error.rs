//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Classification failed: {0}")]
    Classification(#[from] watchpost_ml_client::MlError),

    #[error("Reporting failed: {0}")]
    ReportingFailed(String),

    #[error("Notification failed: {0}")]
    NotificationFailed(String),

    #[error("Firestore error: {0}")]
    Firestore(#[from] watchpost_firestore::FirestoreError),

    #[error("Media error: {0}")]
    Media(#[from] watchpost_media::MediaError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn reporting_failed(msg: impl Into<String>) -> Self {
        Self::ReportingFailed(msg.into())
    }

    pub fn notification_failed(msg: impl Into<String>) -> Self {
        Self::NotificationFailed(msg.into())
    }
}
