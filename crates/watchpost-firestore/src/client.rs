//! Firestore REST API client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::token::{AccessTokenSource, StaticToken, TokenCache};
use crate::types::{Document, Value};

const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com";

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// API root; points at the emulator when one is configured
    pub endpoint: String,
    /// Request timeout
    pub timeout: Duration,
    /// Retries for retryable failures
    pub max_retries: u32,
    /// Talk to the local emulator with its fixed credentials
    pub emulator: bool,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            emulator: false,
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                FirestoreError::auth_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty",
            ));
        }

        let emulator_host = std::env::var("FIRESTORE_EMULATOR_HOST").ok().filter(|h| !h.is_empty());
        let mut config = Self::new(project_id);
        config.database_id =
            std::env::var("FIRESTORE_DATABASE_ID").unwrap_or_else(|_| "(default)".to_string());
        config.timeout = Duration::from_secs(
            std::env::var("FIRESTORE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        );
        config.max_retries = std::env::var("FIRESTORE_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        if let Some(host) = emulator_host {
            config.endpoint = format!("http://{}", host);
            config.emulator = true;
        }
        Ok(config)
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/{}/documents",
            self.endpoint.trim_end_matches('/'),
            self.project_id,
            self.database_id
        )
    }
}

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    tokens: Arc<dyn AccessTokenSource>,
}

impl FirestoreClient {
    /// Create a client authenticated by the environment's service account,
    /// or by the emulator's fixed token.
    pub fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let tokens: Arc<dyn AccessTokenSource> = if config.emulator {
            Arc::new(StaticToken("owner".to_string()))
        } else {
            Arc::new(TokenCache::from_env()?)
        };
        Self::with_token_source(config, tokens)
    }

    pub fn with_token_source(
        config: FirestoreConfig,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> FirestoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("watchpost-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        Ok(Self {
            base_url: config.documents_url(),
            http,
            config,
            tokens,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?)
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// Create a document with an explicit ID.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> FirestoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);
        let span = info_span!("firestore_request", operation = "create_document", collection = %collection, doc_id = %doc_id);

        self.with_retry(|| self.post_document(&url, &body, collection, doc_id))
            .instrument(span)
            .await
    }

    async fn post_document(
        &self,
        url: &str,
        body: &Document,
        collection: &str,
        doc_id: &str,
    ) -> FirestoreResult<Document> {
        let mut token = self.tokens.access_token().await?;
        let mut response = self.http.post(url).bearer_auth(&token).json(body).send().await?;
        let mut status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            let body_text = response.text().await.unwrap_or_default();
            if !Self::is_access_token_expired(&body_text) {
                return Err(FirestoreError::from_http_status(
                    status.as_u16(),
                    format!("{} failed: {}", url, body_text),
                ));
            }
            self.tokens.invalidate().await;
            token = self.tokens.access_token().await?;
            response = self.http.post(url).bearer_auth(&token).json(body).send().await?;
            status = response.status();
        }

        match status {
            StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
            StatusCode::CONFLICT => Err(FirestoreError::AlreadyExists(format!(
                "{}/{}",
                collection, doc_id
            ))),
            _ => {
                let body_text = response.text().await.unwrap_or_default();
                Err(FirestoreError::from_http_status(
                    status.as_u16(),
                    format!("{} failed: {}", url, body_text),
                ))
            }
        }
    }

    async fn with_retry<F, Fut, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(
                        "Firestore request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("Firestore request failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}
