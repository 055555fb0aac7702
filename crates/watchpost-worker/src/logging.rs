//! Structured session logging.

use tracing::{error, info, warn, Span};
use watchpost_models::{AnalysisMode, SessionId};

/// Logs session lifecycle events with the session ID and mode attached.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    session_id: String,
    mode: AnalysisMode,
}

impl SessionLogger {
    pub fn new(session_id: &SessionId, mode: AnalysisMode) -> Self {
        Self {
            session_id: session_id.to_string(),
            mode,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            mode = %self.mode,
            "Session started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            mode = %self.mode,
            "Session progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            session_id = %self.session_id,
            mode = %self.mode,
            "Session warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            session_id = %self.session_id,
            mode = %self.mode,
            "Session error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            mode = %self.mode,
            "Session finished: {}", message
        );
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    /// Span that carries the session's fields for everything run inside it.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "session",
            session_id = %self.session_id,
            mode = %self.mode
        )
    }
}
