//! Analysis modes and session identifiers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which kind of source a session analyses.
///
/// Each mode owns an independent session context, so an upload run and a
/// live camera run never share deduplication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Uploaded video file with a known duration
    Upload,
    /// Local camera device
    Live,
    /// External network stream
    External,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 3] = [
        AnalysisMode::Upload,
        AnalysisMode::Live,
        AnalysisMode::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Upload => "upload",
            AnalysisMode::Live => "live",
            AnalysisMode::External => "external",
        }
    }

    /// Bounded modes run to completion over a finite source.
    pub fn is_bounded(&self) -> bool {
        matches!(self, AnalysisMode::Upload)
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for one analysis session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
