//! Sentence embeddings from the HuggingFace inference API
//! (feature-extraction pipeline of a sentence-transformers model).

use crate::error::{ApiError, Result};
use crate::ml::embedder::{embed_in_order, validate_input, Embedder};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use lru::LruCache;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;
const BATCH_CONCURRENCY: usize = 4;
const QUERY_CACHE_SIZE: usize = 256;

/// Outcome of one HTTP round trip. Only transient failures are retried.
enum Attempt {
    Done(Vec<f32>),
    Transient(ApiError),
    Fatal(ApiError),
}

#[derive(Serialize)]
struct FeatureRequest<'a> {
    inputs: &'a str,
    options: FeatureOptions,
}

#[derive(Serialize)]
struct FeatureOptions {
    wait_for_model: bool,
}

pub struct HuggingFaceEmbedder {
    client: Client,
    pipeline_url: String,
    model_name: String,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    prewarmed: AtomicBool,
}

impl HuggingFaceEmbedder {
    /// No request is made until the first `embed` or `prewarm` call.
    pub fn new(base_url: &str, model_name: &str, api_key: &str) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ApiError::ConfigError(
                "HuggingFace API key is empty".to_string(),
            ));
        }

        let mut headers = header::HeaderMap::new();
        let bearer = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| ApiError::ConfigError("HuggingFace API key is not a valid header".to_string()))?;
        headers.insert(header::AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| ApiError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        let pipeline_url = format!(
            "{}/pipeline/feature-extraction/{}",
            base_url.trim_end_matches('/'),
            model_name
        );
        info!("HuggingFace embedder configured for {}", pipeline_url);

        let capacity = NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            client,
            pipeline_url,
            model_name: model_name.to_string(),
            cache: Mutex::new(LruCache::new(capacity)),
            prewarmed: AtomicBool::new(false),
        })
    }

    fn cached(&self, text: &str) -> Option<Vec<f32>> {
        self.cache.lock().ok()?.get(text).cloned()
    }

    fn remember(&self, text: &str, embedding: &[f32]) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(text.to_string(), embedding.to_vec());
        }
    }

    async fn attempt(&self, text: &str) -> Attempt {
        let request = FeatureRequest {
            inputs: text,
            options: FeatureOptions {
                wait_for_model: true,
            },
        };

        let response = match self.client.post(&self.pipeline_url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Transient(ApiError::ModelError(format!(
                    "HuggingFace request failed: {}",
                    e
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return classify_failure(status, &self.model_name, &body);
        }

        match response.json::<serde_json::Value>().await {
            Ok(value) => match parse_embedding(value) {
                Ok(embedding) => Attempt::Done(unit_length(embedding)),
                Err(e) => Attempt::Fatal(e),
            },
            Err(e) => Attempt::Fatal(ApiError::ModelError(format!(
                "HuggingFace returned invalid JSON: {}",
                e
            ))),
        }
    }
}

fn classify_failure(status: StatusCode, model: &str, body: &str) -> Attempt {
    match status {
        StatusCode::NOT_FOUND => {
            Attempt::Fatal(ApiError::ModelError(format!("Model not found: {}", model)))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Attempt::Fatal(ApiError::ModelError(
            "HuggingFace rejected the API key".to_string(),
        )),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => Attempt::Transient(
            ApiError::ModelError(format!("HuggingFace returned {}: {}", s, body)),
        ),
        s => Attempt::Fatal(ApiError::ModelError(format!(
            "HuggingFace returned {}: {}",
            s, body
        ))),
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = validate_input(text)?;
        if let Some(hit) = self.cached(text) {
            debug!("Embedding cache hit");
            return Ok(hit);
        }

        let mut attempt = 1;
        loop {
            match self.attempt(text).await {
                Attempt::Done(embedding) => {
                    self.remember(text, &embedding);
                    return Ok(embedding);
                }
                Attempt::Transient(e) if attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(BASE_BACKOFF_MS << (attempt - 1));
                    warn!(
                        "Embedding attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, MAX_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Transient(e) | Attempt::Fatal(e) => {
                    error!("Embedding failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_order(self, texts, BATCH_CONCURRENCY).await
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn prewarm(&self) -> Result<bool> {
        if self.prewarmed.load(Ordering::Acquire) {
            return Ok(false);
        }

        info!("Prewarming HuggingFace model {}", self.model_name);
        self.embed("warm-up sentence for the embedding model").await?;
        Ok(!self.prewarmed.swap(true, Ordering::AcqRel))
    }
}

/// Accepts `[f32]`, `[[f32]]` (first row), `{"embedding": [...]}` and
/// `{"embeddings": [[...]]}`.
fn parse_embedding(value: serde_json::Value) -> Result<Vec<f32>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Flat(Vec<f32>),
        Rows(Vec<Vec<f32>>),
        Single { embedding: Vec<f32> },
        Many { embeddings: Vec<Vec<f32>> },
    }

    let embedding = match serde_json::from_value::<Shape>(value) {
        Ok(Shape::Flat(v)) | Ok(Shape::Single { embedding: v }) => v,
        Ok(Shape::Rows(rows)) | Ok(Shape::Many { embeddings: rows }) => {
            rows.into_iter().next().unwrap_or_default()
        }
        Err(_) => Vec::new(),
    };

    if embedding.is_empty() {
        return Err(ApiError::ModelError(
            "No embedding found in HuggingFace response".to_string(),
        ));
    }
    Ok(embedding)
}

fn unit_length(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.into_iter().map(|x| x / norm).collect()
    } else {
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_response_shapes() {
        assert_eq!(parse_embedding(json!([0.1, 0.2, 0.3])).unwrap().len(), 3);
        assert_eq!(
            parse_embedding(json!([[1.0, 2.0], [3.0, 4.0]])).unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            parse_embedding(json!({"embedding": [0.5, 0.5]})).unwrap(),
            vec![0.5, 0.5]
        );
        assert_eq!(
            parse_embedding(json!({"embeddings": [[0.25, 0.75]]})).unwrap(),
            vec![0.25, 0.75]
        );
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(parse_embedding(json!([])).is_err());
        assert!(parse_embedding(json!({"other": 1})).is_err());
        assert!(parse_embedding(json!("text")).is_err());
    }

    #[test]
    fn test_unit_length() {
        let v = unit_length(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(unit_length(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_only_rate_limits_and_server_errors_retry() {
        let transient = |s| matches!(classify_failure(s, "m", ""), Attempt::Transient(_));
        assert!(transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!transient(StatusCode::NOT_FOUND));
        assert!(!transient(StatusCode::UNAUTHORIZED));
        assert!(!transient(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(HuggingFaceEmbedder::new("https://api-inference.huggingface.co", "m", " ").is_err());
    }
}
