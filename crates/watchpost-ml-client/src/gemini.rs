//! Gemini vision client for incident detection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use tracing::{debug, info, warn};
use watchpost_models::{DetectedIncident, FrameImage};

use crate::classifier::FrameClassifier;
use crate::error::{MlError, MlResult};
use crate::types::{
    parse_incidents, Content, GeminiRequest, GeminiResponse, GenerationConfig, Part,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_MODELS: [&str; 3] = ["gemini-2.5-flash", "gemini-2.5-flash-lite", "gemini-2.5-pro"];

/// Incident categories the classifier is asked to look for.
pub const INCIDENT_CATEGORIES: [&str; 5] = [
    "Trespassing",
    "Abandoned Object",
    "Suspicious Loitering",
    "Crowd Disturbance",
    "Road Hazards",
];

/// Configuration for the Gemini client.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    /// API root, overridable for tests
    pub base_url: String,
    /// Models to try, in order
    pub models: Vec<String>,
    /// Request timeout
    pub timeout: Duration,
    /// Retries per model for retryable failures
    pub max_retries: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            models: DEFAULT_MODELS.iter().map(|m| m.to_string()).collect(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

impl GeminiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> MlResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| MlError::Config("GEMINI_API_KEY not set".to_string()))?;

        let defaults = Self::default();
        let models = std::env::var("GEMINI_MODELS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.models);

        Ok(Self {
            api_key,
            base_url: std::env::var("GEMINI_BASE_URL").unwrap_or(defaults.base_url),
            models,
            timeout: Duration::from_secs(
                std::env::var("GEMINI_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            max_retries: std::env::var("GEMINI_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
        })
    }
}

/// Build the instruction text for one frame.
fn build_prompt(video_timestamp: f64, wall_clock_iso: &str) -> String {
    format!(
        r#"You are an AI assistant specializing in public safety incident detection.

Analyze the attached video frame.
The frame was captured at video time: {video_timestamp:.1}s.
The current real-world analysis time is: {wall_clock_iso}.

Infer the context from the visual information in the frame (time of day, type of place, people, objects, conditions).

Identify any incidents in these categories: {categories}. For each incident provide:
1. incidentType: one of the categories above
2. description: begin with "Observed at {wall_clock_iso}: " followed by a detailed description
3. location: a plausible public place or street name matching the scene
4. confidence: a number between 0 and 1
5. severity: one of "Low", "Medium", "High", "Critical"

Return ONLY a single JSON object of the form {{"incidents": [...]}}.
If no incidents are detected, return {{"incidents": []}}."#,
        categories = INCIDENT_CATEGORIES.join(", "),
    )
}

/// Gemini API client implementing [`FrameClassifier`].
pub struct GeminiVisionClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiVisionClient {
    /// Create a new client.
    pub fn new(config: GeminiConfig) -> MlResult<Self> {
        if config.models.is_empty() {
            return Err(MlError::Config("no Gemini models configured".to_string()));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(MlError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> MlResult<Self> {
        Self::new(GeminiConfig::from_env()?)
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Call one model once.
    async fn call_model(&self, model: &str, request: &GeminiRequest) -> MlResult<Vec<DetectedIncident>> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MlError::Timeout(self.config.timeout.as_secs())
                } else {
                    MlError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MlError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let response: GeminiResponse = response.json().await?;
        let text = response
            .first_text()
            .ok_or_else(|| MlError::invalid_response("No content in Gemini response"))?;

        parse_incidents(&text)
    }

    /// Execute with retry logic.
    async fn with_retry<F, Fut, T>(&self, operation: F) -> MlResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = MlResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Classification request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl FrameClassifier for GeminiVisionClient {
    async fn classify(
        &self,
        image: &FrameImage,
        video_timestamp: f64,
        wall_clock: DateTime<Utc>,
    ) -> MlResult<Vec<DetectedIncident>> {
        let wall_clock_iso = wall_clock.to_rfc3339_opts(SecondsFormat::Millis, true);
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![
                    Part::inline(image.mime_type(), image.to_base64()),
                    Part::text(build_prompt(video_timestamp, &wall_clock_iso)),
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        let mut last_error = None;
        for model in &self.config.models {
            debug!(model = %model, video_ts = video_timestamp, "Classifying frame");
            match self.with_retry(|| self.call_model(model, &request)).await {
                Ok(incidents) => {
                    info!(
                        model = %model,
                        video_ts = video_timestamp,
                        incidents = incidents.len(),
                        "Frame classified"
                    );
                    return Ok(incidents);
                }
                // A rejected key is rejected for every model
                Err(e) if e.is_security_fault() => return Err(e),
                Err(e) => {
                    warn!("Failed with model {}: {}", model, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MlError::invalid_response("All Gemini models failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, models: &[&str]) -> GeminiConfig {
        GeminiConfig {
            api_key: "test-key".to_string(),
            base_url: server.uri(),
            models: models.iter().map(|m| m.to_string()).collect(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
        }
    }

    fn image() -> FrameImage {
        FrameImage::from_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9], 1, 1)
    }

    fn gemini_body(text: &str) -> serde_json::Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
    }

    #[test]
    fn test_prompt_carries_timestamps() {
        let prompt = build_prompt(12.34, "2024-07-29T18:35:00.000Z");
        assert!(prompt.contains("12.3s"));
        assert!(prompt.contains("Observed at 2024-07-29T18:35:00.000Z: "));
        assert!(prompt.contains("Road Hazards"));
    }

    #[test]
    fn test_config_defaults() {
        let config = GeminiConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.models.len(), DEFAULT_MODELS.len());
        assert_eq!(config.max_retries, 2);
    }

    #[tokio::test]
    async fn test_classify_parses_incidents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/model-a:generateContent"))
            .and(query_param("key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_body(
                r#"{"incidents":[{"incidentType":"Trespassing","description":"Observed at 2024-07-29T18:35:00Z: person over fence","location":"MG Road","confidence":0.9}]}"#,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiVisionClient::new(config(&server, &["model-a"])).unwrap();
        let incidents = client.classify(&image(), 5.0, Utc::now()).await.unwrap();

        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_type, "Trespassing");
        assert_eq!(incidents[0].severity, None);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/model-a:generateContent"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/model-b:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_body(r#"{"incidents":[]}"#)))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiVisionClient::new(config(&server, &["model-a", "model-b"])).unwrap();
        let incidents = client.classify(&image(), 0.0, Utc::now()).await.unwrap();
        assert!(incidents.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_key_is_security_fault() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiVisionClient::new(config(&server, &["model-a", "model-b"])).unwrap();
        let err = client.classify(&image(), 0.0, Utc::now()).await.unwrap_err();
        assert!(err.is_security_fault());
    }

    #[tokio::test]
    async fn test_retries_retryable_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_body("[]")))
            .mount(&server)
            .await;

        let mut config = config(&server, &["model-a"]);
        config.max_retries = 1;
        let client = GeminiVisionClient::new(config).unwrap();
        assert!(client.classify(&image(), 0.0, Utc::now()).await.unwrap().is_empty());
    }

    #[test]
    fn test_empty_model_list_rejected() {
        let config = GeminiConfig {
            models: Vec::new(),
            ..GeminiConfig::default()
        };
        assert!(matches!(GeminiVisionClient::new(config), Err(MlError::Config(_))));
    }
}
