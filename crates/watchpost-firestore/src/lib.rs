//! Firestore REST API client.
//!
//! This crate provides:
//! - Document creation with retry and token refresh
//! - Service account authentication via gcp_auth, or the emulator's fixed token
//! - The incident repository used to persist accepted incidents

pub mod client;
pub mod error;
pub mod incidents;
pub mod token;
pub mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use incidents::{IncidentRepository, SavedIncident, INCIDENTS_COLLECTION, LARGE_FRAME_WARNING_BYTES};
pub use token::{AccessTokenSource, StaticToken, TokenCache};
pub use types::{Document, Value};
