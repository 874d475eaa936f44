//! Client side of the embedding collaborator.
//!
//! The model itself runs in a separate service; this module only knows how to
//! turn text into a vector over HTTP:
//! - `Embedder` trait, so the core can be driven by any text -> vector function
//! - `HttpEmbedder`, talking to `GET {url}/search?user_text=...`
//! - readiness polling used at startup
//! - `embed_with_timeout`, which bounds every call regardless of implementation

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::EmbedderConfig;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedder request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("embedder answered with status {0}")]
    Status(reqwest::StatusCode),

    #[error("embedder did not answer within {0:?}")]
    Timeout(Duration),

    #[error("embedder returned an empty embedding")]
    Empty,

    #[error("embedder is not ready after {0} attempts")]
    NotReady(u32),
}

/// Text -> fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Name of the model, stored (hashed) in index files.
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 of the model name, used to refuse index files built by another model.
    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Run `embedder.embed` with a hard deadline.
///
/// A call that runs past the deadline is dropped; its result is never seen.
pub async fn embed_with_timeout(
    embedder: &dyn Embedder,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>, EmbeddingError> {
    match tokio::time::timeout(timeout, embedder.embed(text)).await {
        Ok(result) => result,
        Err(_) => Err(EmbeddingError::Timeout(timeout)),
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    query_embedding: Vec<f32>,
}

/// Embedder reached over HTTP.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(config: &EmbedderConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout(),
        })
    }

    /// Block until the embedder answers any HTTP request.
    ///
    /// `max_attempts == 0` keeps polling forever.
    pub async fn wait_ready(
        &self,
        attempt_timeout: Duration,
        sleep: Duration,
        max_attempts: u32,
    ) -> Result<(), EmbeddingError> {
        log::info!("Running readiness checks.");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            log::info!("Trying to connect to '{}'", self.base_url);

            match self
                .client
                .get(&self.base_url)
                .timeout(attempt_timeout)
                .send()
                .await
            {
                Ok(_) => {
                    log::info!("Successfully connected to '{}'", self.base_url);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("Failed to connect to '{}': {err}", self.base_url);
                }
            }

            if max_attempts != 0 && attempt >= max_attempts {
                return Err(EmbeddingError::NotReady(attempt));
            }

            tokio::time::sleep(sleep).await;
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/search", self.base_url);
        log::debug!("embedding {} chars via {url}", text.chars().count());

        let response = self
            .client
            .get(&url)
            .query(&[("user_text", text)])
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    EmbeddingError::Timeout(self.timeout)
                } else {
                    EmbeddingError::Request(err)
                }
            })?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Status(response.status()));
        }

        let body: EmbeddingResponse = response.json().await?;
        if body.query_embedding.is_empty() {
            return Err(EmbeddingError::Empty);
        }

        Ok(body.query_embedding)
    }
}
