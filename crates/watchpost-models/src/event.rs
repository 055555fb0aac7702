//! Session event messages.
//!
//! Everything a session wants to tell its operator (progress, per-frame
//! failures, saved incidents, the terminal summary) flows through
//! [`SessionEvent`].

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{AnalysisMode, IncidentId, SessionId};

/// How a session run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Bounded source fully sampled
    Completed,
    /// Source reported zero duration or zero dimensions
    EmptySource,
    /// Explicit stop, or forced stop after a security fault
    Stopped,
    /// Fatal extraction error
    Failed { message: String },
}

/// Terminal summary of a session run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub incidents_accepted: u64,
    pub outcome: SessionOutcome,
}

impl SessionSummary {
    /// One-line human readable result.
    pub fn headline(&self) -> String {
        if self.frames_processed == 0 {
            "No frames processed".to_string()
        } else if self.incidents_accepted == 0 {
            format!(
                "No new incidents detected in {} frames",
                self.frames_processed
            )
        } else {
            format!(
                "{} new unique incident(s) identified across {} frames",
                self.incidents_accepted, self.frames_processed
            )
        }
    }
}

/// Session event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        mode: AnalysisMode,
        timestamp: DateTime<Utc>,
    },

    /// Extraction progress (0-100), never decreasing within a session
    Progress { value: u8 },

    /// Source or capture fault reported by the extractor
    ExtractionError { message: String },

    ClassificationFailed {
        #[serde(rename = "videoTimestamp")]
        video_timestamp: f64,
        message: String,
    },

    /// Live frame dropped because every analysis slot was busy
    FrameSkipped {
        #[serde(rename = "videoTimestamp")]
        video_timestamp: f64,
    },

    /// Number of new incidents accepted from one frame
    IncidentsReported {
        #[serde(rename = "videoTimestamp")]
        video_timestamp: f64,
        count: u32,
    },

    IncidentSaved {
        #[serde(rename = "incidentId")]
        incident_id: IncidentId,
        #[serde(rename = "incidentType")]
        incident_type: String,
    },

    NotificationSent {
        #[serde(rename = "incidentId")]
        incident_id: IncidentId,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Incident persisted but the notification could not be delivered
    NotificationFailed {
        #[serde(rename = "incidentId")]
        incident_id: IncidentId,
        message: String,
    },

    /// Incident could not be persisted
    ReportingFailed { message: String },

    /// Evidence frame is close to the document store's size limit
    LargeFrameWarning { bytes: usize },

    /// Session was stopped because its source became inaccessible
    SecurityStop { message: String },

    Stopped,

    Completed { summary: SessionSummary },
}

impl SessionEvent {
    /// Create a progress event.
    pub fn progress(value: u8) -> Self {
        SessionEvent::Progress {
            value: value.min(100),
        }
    }

    pub fn started(session_id: SessionId, mode: AnalysisMode) -> Self {
        SessionEvent::Started {
            session_id,
            mode,
            timestamp: Utc::now(),
        }
    }

    /// Whether this event reports a problem to the operator.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionEvent::ExtractionError { .. }
                | SessionEvent::ClassificationFailed { .. }
                | SessionEvent::NotificationFailed { .. }
                | SessionEvent::ReportingFailed { .. }
                | SessionEvent::SecurityStop { .. }
        )
    }
}
