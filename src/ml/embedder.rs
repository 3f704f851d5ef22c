use crate::{
    config::{Config, EmbeddingProvider},
    error::{ApiError, Result},
    ml::{huggingface_embedder::HuggingFaceEmbedder, ollama_embedder::OllamaEmbedder},
};
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;

/// Sentence-embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts. The output is in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        embed_in_order(self, texts, 1).await
    }

    fn model_name(&self) -> &str;

    /// Warm up the backend. Returns `true` only on the first successful call.
    async fn prewarm(&self) -> Result<bool>;
}

/// Run `embed` with bounded concurrency while keeping input order.
pub async fn embed_in_order<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
    concurrency: usize,
) -> Result<Vec<Vec<f32>>> {
    let pending: Vec<_> = texts.iter().map(|text| embedder.embed(text)).collect();
    // `buffered` yields in submission order; index positions depend on it.
    stream::iter(pending)
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

pub(crate) fn validate_input(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ApiError::InvalidInput(
            "Cannot embed empty text".to_string(),
        ));
    }
    Ok(trimmed)
}

pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.embedding_provider {
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            &config.embedding_base_url,
            &config.embedding_model,
            config.embedding_concurrency,
        )?),
        EmbeddingProvider::HuggingFace => {
            let api_key = config.embedding_api_key.as_deref().ok_or_else(|| {
                ApiError::ConfigError(
                    "embedding_api_key is required for the huggingface provider".to_string(),
                )
            })?;
            Arc::new(HuggingFaceEmbedder::new(
                &config.embedding_base_url,
                &config.embedding_model,
                api_key,
            )?)
        }
    };

    Ok(embedder)
}


#[cfg(test)]
mod tests {
    use super::test_support::{vector_for, HashEmbedder};
    use super::*;

    #[tokio::test]
    async fn test_embed_in_order_preserves_order() {
        let embedder = HashEmbedder::new();
        let texts: Vec<String> = ["a", "a much longer text", "mid text", "z"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let embeddings = embed_in_order(&embedder, &texts, 4).await.unwrap();
        let expected: Vec<Vec<f32>> = texts.iter().map(|t| vector_for(t)).collect();
        assert_eq!(embeddings, expected);
    }

    #[tokio::test]
    async fn test_default_batch_through_trait_object() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
        let texts = vec!["first".to_string(), "second one".to_string()];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings, vec![vector_for("first"), vector_for("second one")]);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let embedder = HashEmbedder::new();
        let texts = vec!["ok".to_string(), "   ".to_string()];
        let result = embed_in_order(&embedder, &texts, 2).await;
        assert!(matches!(result, Err(ApiError::InvalidInput(_))));
    }
}
