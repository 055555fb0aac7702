//! Incident types: as detected by the classifier, and as persisted.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{AnalysisMode, Frame, FrameImage, SessionId};

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    /// Assigned at acceptance when the classifier gave no usable severity
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
            Severity::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a severity label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised severity: {0:?}")]
pub struct ParseSeverityError(pub String);

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            "unknown" => Ok(Severity::Unknown),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

/// Treat empty, null or unrecognised severities as absent.
fn lenient_severity<'de, D>(deserializer: D) -> Result<Option<Severity>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// One incident as returned by a single classification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetectedIncident {
    /// Category, e.g. "Trespassing" or "Abandoned Object"
    pub incident_type: String,
    /// Free-text description, possibly prefixed with "Observed at <ISO>: "
    #[serde(default)]
    pub description: String,
    /// Where in the frame the incident was seen
    #[serde(default)]
    pub location: String,
    /// Classifier confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
    /// Severity, if the classifier supplied a recognisable one
    #[serde(default, deserialize_with = "lenient_severity")]
    pub severity: Option<Severity>,
}

impl DetectedIncident {
    pub fn new(
        incident_type: impl Into<String>,
        description: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            incident_type: incident_type.into(),
            description: description.into(),
            location: location.into(),
            confidence: 0.0,
            severity: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Unique identifier for a persisted incident.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct IncidentId(pub String);

impl IncidentId {
    /// Generate a new random incident ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An accepted, deduplicated incident handed to the reporter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentRecord {
    pub id: IncidentId,
    pub incident_type: String,
    pub description: String,
    pub location: String,
    pub confidence: f64,
    /// Always concrete; `Unknown` when the classifier omitted it
    pub severity: Severity,
    /// Evidence frame
    #[serde(skip)]
    pub frame_image: FrameImage,
    /// Position of the evidence frame in the source, in seconds
    pub video_timestamp: f64,
    pub mode: AnalysisMode,
    pub session_id: SessionId,
    /// Wall-clock time of acceptance
    pub detected_at: DateTime<Utc>,
}

impl IncidentRecord {
    /// Build the record for an incident accepted from `frame`.
    pub fn accept(
        incident: DetectedIncident,
        frame: &Frame,
        mode: AnalysisMode,
        session_id: SessionId,
    ) -> Self {
        Self {
            id: IncidentId::new(),
            incident_type: incident.incident_type,
            description: incident.description,
            location: incident.location,
            confidence: incident.confidence,
            severity: incident.severity.unwrap_or(Severity::Unknown),
            frame_image: frame.image.clone(),
            video_timestamp: frame.video_timestamp,
            mode,
            session_id,
            detected_at: Utc::now(),
        }
    }

    /// Confidence as a whole percentage.
    pub fn confidence_percentage(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}
