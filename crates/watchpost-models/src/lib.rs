//! Shared data models for the watchpost pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Captured frames and their encoded images
//! - Incidents as detected by the classifier and as persisted
//! - Analysis modes (upload, live camera, external stream)
//! - Session event messages and terminal summaries

pub mod event;
pub mod frame;
pub mod incident;
pub mod mode;

// Re-export common types
pub use event::{SessionEvent, SessionOutcome, SessionSummary};
pub use frame::{Frame, FrameImage};
pub use incident::{DetectedIncident, IncidentId, IncidentRecord, Severity};
pub use mode::{AnalysisMode, SessionId};
