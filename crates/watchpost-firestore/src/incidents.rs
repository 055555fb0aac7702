//! Incident persistence.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};
use watchpost_models::IncidentRecord;

use crate::client::FirestoreClient;
use crate::error::FirestoreResult;
use crate::types::Value;

/// Default collection for incident documents.
pub const INCIDENTS_COLLECTION: &str = "incidents";

/// Firestore rejects documents over 1 MiB; warn when the frame alone gets close.
pub const LARGE_FRAME_WARNING_BYTES: usize = 943_718;

/// Result of persisting one incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedIncident {
    pub id: String,
    /// Encoded frame size when it is close to the document limit
    pub large_frame_bytes: Option<usize>,
}

/// Document fields for an incident.
pub fn incident_fields(record: &IncidentRecord, frame_data_uri: String) -> HashMap<String, Value> {
    HashMap::from([
        ("incidentType".to_string(), Value::string(&record.incident_type)),
        ("description".to_string(), Value::string(&record.description)),
        ("location".to_string(), Value::string(&record.location)),
        ("confidence".to_string(), Value::DoubleValue(record.confidence)),
        ("severity".to_string(), Value::string(record.severity.as_str())),
        ("frameDataUri".to_string(), Value::StringValue(frame_data_uri)),
        ("videoTimestamp".to_string(), Value::DoubleValue(record.video_timestamp)),
        ("mode".to_string(), Value::string(record.mode.as_str())),
        ("sessionId".to_string(), Value::string(record.session_id.as_str())),
        ("detectedAt".to_string(), Value::timestamp(record.detected_at)),
        ("createdAt".to_string(), Value::timestamp(Utc::now())),
    ])
}

/// Repository for incident documents.
#[derive(Clone)]
pub struct IncidentRepository {
    client: FirestoreClient,
    collection: String,
}

impl IncidentRepository {
    pub fn new(client: FirestoreClient) -> Self {
        Self::with_collection(client, INCIDENTS_COLLECTION)
    }

    pub fn with_collection(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Save an incident under its own ID.
    pub async fn save(&self, record: &IncidentRecord) -> FirestoreResult<SavedIncident> {
        let frame_data_uri = record.frame_image.to_data_uri();
        let large_frame_bytes = (frame_data_uri.len() > LARGE_FRAME_WARNING_BYTES).then_some(frame_data_uri.len());
        if let Some(bytes) = large_frame_bytes {
            warn!(
                incident_id = %record.id,
                bytes,
                "Frame is close to the 1 MiB document limit; save may fail"
            );
        }

        let fields = incident_fields(record, frame_data_uri);
        let doc = self
            .client
            .create_document(&self.collection, record.id.as_str(), fields)
            .await?;

        let id = doc.id().unwrap_or(record.id.as_str()).to_string();
        info!(incident_id = %id, incident_type = %record.incident_type, "Saved incident");
        Ok(SavedIncident {
            id,
            large_frame_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FirestoreConfig;
    use crate::token::StaticToken;
    use serde_json::json;
    use std::sync::Arc;
    use watchpost_models::{AnalysisMode, DetectedIncident, Frame, FrameImage, SessionId};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(jpeg_len: usize) -> IncidentRecord {
        let frame = Frame::new(FrameImage::from_jpeg(vec![7u8; jpeg_len], 2, 2), 10.0);
        IncidentRecord::accept(
            DetectedIncident::new("Road Hazards", "pothole", "Ring Road"),
            &frame,
            AnalysisMode::Upload,
            SessionId::new(),
        )
    }

    #[test]
    fn test_incident_fields() {
        let record = record(4);
        let fields = incident_fields(&record, record.frame_image.to_data_uri());
        assert_eq!(fields["severity"].as_str(), Some("Unknown"));
        assert_eq!(fields["mode"].as_str(), Some("upload"));
        assert!(fields["frameDataUri"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
        assert!(matches!(fields["createdAt"], Value::TimestampValue(_)));
    }

    #[tokio::test]
    async fn test_save_flags_large_frames() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"fields": {"incidentType": {"stringValue": "Road Hazards"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fields": {}})))
            .mount(&server)
            .await;

        let mut config = FirestoreConfig::new("p");
        config.endpoint = server.uri();
        let client = FirestoreClient::with_token_source(config, Arc::new(StaticToken("t".into()))).unwrap();
        let repo = IncidentRepository::new(client);

        let small = record(16);
        let saved = repo.save(&small).await.unwrap();
        assert_eq!(saved.id, small.id.as_str());
        assert_eq!(saved.large_frame_bytes, None);

        let large = record(800 * 1024);
        let saved = repo.save(&large).await.unwrap();
        assert!(saved.large_frame_bytes.unwrap() > LARGE_FRAME_WARNING_BYTES);
    }
}
