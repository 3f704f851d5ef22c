//! Embeddings from a local Ollama server (`POST {base}/api/embeddings`).

use crate::{
    error::{ApiError, Result},
    ml::embedder::{embed_in_order, validate_input, Embedder},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{debug, info, instrument};

const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const PREWARM_TEXT: &str = "This is a test sentence for prewarming the embeddings model.";

pub struct OllamaEmbedder {
    client: Client,
    url: String,
    model: String,
    concurrency: usize,
    prewarmed: AtomicBool,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, concurrency: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
            .build()
            .map_err(|e| ApiError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        let url = format!("{}/api/embeddings", base_url.trim_end_matches('/'));
        info!("Using Ollama embeddings at {} with model {}", url, model);

        Ok(Self {
            client,
            url,
            model: model.to_string(),
            concurrency,
            prewarmed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = validate_input(text)?;

        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingsRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| ApiError::ModelError(format!("Ollama embeddings request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let snippet: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(240)
                .collect();
            return Err(ApiError::ModelError(format!(
                "Ollama embeddings returned {}: {}",
                status, snippet
            )));
        }

        let body: EmbeddingsResponse = response.json().await.map_err(|e| {
            ApiError::ModelError(format!("Unexpected Ollama embeddings response: {}", e))
        })?;

        if body.embedding.is_empty() {
            return Err(ApiError::ModelError(format!(
                "Model '{}' returned an empty embedding",
                self.model
            )));
        }

        debug!("Got embedding of size {}", body.embedding.len());
        Ok(body.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_order(self, texts, self.concurrency).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn prewarm(&self) -> Result<bool> {
        if self.prewarmed.load(Ordering::Acquire) {
            debug!("Ollama embedder already prewarmed, skipping");
            return Ok(false);
        }

        self.embed(PREWARM_TEXT).await?;
        let was_first = !self.prewarmed.swap(true, Ordering::AcqRel);
        Ok(was_first)
    }
}
