//! Frame classification.
//!
//! The [`FrameClassifier`] trait is the seam the analysis pipeline calls;
//! [`GeminiVisionClient`] implements it against Google's Gemini API with
//! per-model retries and model fallback.

pub mod classifier;
pub mod error;
pub mod gemini;
pub mod types;

pub use classifier::FrameClassifier;
pub use error::{MlError, MlResult};
pub use gemini::{GeminiConfig, GeminiVisionClient, INCIDENT_CATEGORIES};
pub use types::parse_incidents;
