//! Incident reporting: persist, then notify.
//!
//! Persistence and notification are reported separately. An incident that
//! was saved is never reported as failed because its notification could not
//! be delivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use watchpost_firestore::IncidentRepository;
use watchpost_models::{IncidentId, IncidentRecord};

use crate::error::{WorkerError, WorkerResult};

/// Outcome of the notification half of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Sent { message_id: Option<String> },
    Failed { error: String },
    /// No notifier configured
    Skipped,
}

/// Outcome of a report whose persistence succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub incident_id: IncidentId,
    pub notification: NotificationOutcome,
    /// Encoded frame size when it is close to the store's document limit
    pub frame_size_warning: Option<usize>,
}

/// Result of persisting an incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIncident {
    pub incident_id: IncidentId,
    pub frame_size_warning: Option<usize>,
}

/// Hands accepted incidents off for persistence and notification.
///
/// Returns `Err` only when persistence failed.
#[async_trait]
pub trait IncidentReporter: Send + Sync {
    async fn report(&self, record: &IncidentRecord) -> WorkerResult<ReportOutcome>;
}

/// Persists incidents.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn save(&self, record: &IncidentRecord) -> WorkerResult<StoredIncident>;
}

/// Delivers a notification for a persisted incident.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns the delivery's message ID, if the channel provides one.
    async fn notify(&self, incident_id: &IncidentId, record: &IncidentRecord) -> WorkerResult<Option<String>>;
}

/// Store then notify, reporting each outcome separately.
pub struct PersistThenNotify {
    store: Arc<dyn IncidentStore>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PersistThenNotify {
    pub fn new(store: Arc<dyn IncidentStore>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl IncidentReporter for PersistThenNotify {
    async fn report(&self, record: &IncidentRecord) -> WorkerResult<ReportOutcome> {
        let stored = self.store.save(record).await?;

        let notification = match &self.notifier {
            None => NotificationOutcome::Skipped,
            Some(notifier) => match notifier.notify(&stored.incident_id, record).await {
                Ok(message_id) => NotificationOutcome::Sent { message_id },
                Err(e) => {
                    warn!(
                        incident_id = %stored.incident_id,
                        "Incident saved ({}), but failed to send notification: {}",
                        stored.incident_id,
                        e
                    );
                    NotificationOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
        };

        Ok(ReportOutcome {
            incident_id: stored.incident_id,
            notification,
            frame_size_warning: stored.frame_size_warning,
        })
    }
}

/// Stores incidents in Firestore.
pub struct FirestoreIncidentStore {
    repo: IncidentRepository,
}

impl FirestoreIncidentStore {
    pub fn new(repo: IncidentRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl IncidentStore for FirestoreIncidentStore {
    async fn save(&self, record: &IncidentRecord) -> WorkerResult<StoredIncident> {
        let saved = self
            .repo
            .save(record)
            .await
            .map_err(|e| WorkerError::reporting_failed(format!("failed to save incident: {}", e)))?;

        Ok(StoredIncident {
            incident_id: IncidentId::from_string(saved.id),
            frame_size_warning: saved.large_frame_bytes,
        })
    }
}

/// JSON body posted by [`WebhookNotifier`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IncidentNotification<'a> {
    incident_id: &'a str,
    incident_type: &'a str,
    description: &'a str,
    location: &'a str,
    severity: &'a str,
    confidence_percentage: u32,
    video_timestamp: f64,
    mode: &'a str,
    detected_at: String,
    subject: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookReply {
    id: Option<String>,
    message_id: Option<String>,
}

/// POSTs a JSON summary of each incident to a URL.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> WorkerResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, incident_id: &IncidentId, record: &IncidentRecord) -> WorkerResult<Option<String>> {
        let body = IncidentNotification {
            incident_id: incident_id.as_str(),
            incident_type: &record.incident_type,
            description: &record.description,
            location: &record.location,
            severity: record.severity.as_str(),
            confidence_percentage: record.confidence_percentage(),
            video_timestamp: record.video_timestamp,
            mode: record.mode.as_str(),
            detected_at: record.detected_at.to_rfc3339(),
            subject: format!(
                "Incident Alert: {} at {}",
                record.incident_type, record.location
            ),
        };

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkerError::notification_failed(format!(
                "webhook returned {}: {}",
                status, text
            )));
        }

        // The reply body is optional
        let message_id = response
            .json::<WebhookReply>()
            .await
            .ok()
            .and_then(|reply| reply.message_id.or(reply.id));
        info!(incident_id = %incident_id, message_id = ?message_id, "Notification sent");
        Ok(message_id)
    }
}
