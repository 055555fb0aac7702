//! Incident analysis sessions.
//!
//! This crate provides:
//! - Incident deduplication per frame and per session
//! - The per-frame classify, dedup and report pipeline
//! - Incident reporting (persist, then notify)
//! - Session start/stop per analysis mode

pub mod config;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod reporter;
pub mod session;

pub use config::WatchpostConfig;
pub use dedup::{dedup_frame, key_of, DedupKey, SessionSeenSet};
pub use error::{WorkerError, WorkerResult};
pub use logging::SessionLogger;
pub use orchestrator::AnalysisOrchestrator;
pub use reporter::{
    FirestoreIncidentStore, IncidentReporter, IncidentStore, NotificationOutcome, Notifier,
    PersistThenNotify, ReportOutcome, StoredIncident, WebhookNotifier,
};
pub use session::{SessionHandle, SessionManager};
