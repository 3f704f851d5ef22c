use crate::{
    error::{ApiError, Result},
    models::{ChatMessage, ProductVariant, RecommendationResponse, ScoredProduct},
    services::{
        catalog_repository::CatalogQueries,
        llm::{ChatModel, ChatOptions},
        semantic_index::{SemanticHit, SemanticIndexService},
    },
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

const MAX_TOP_K: usize = 100;
const PREWARM_QUERY: &str = "comfortable running shoes";

pub const NOT_LISTED_REPLY: &str =
    "The product you are looking for is not listed as one of our current products.";
const OUT_OF_STOCK_REPLY: &str = "The product you are looking for is currently out of stock, but here are the next best matching products.";

const SYSTEM_PROMPT: &str =
    "You are a helpful shopping assistant. Your task is to help customers find products.";

#[derive(Clone)]
pub struct RecommendationService {
    index: SemanticIndexService,
    catalog: Arc<dyn CatalogQueries>,
    chat: Arc<dyn ChatModel>,
    options: ChatOptions,
    default_top_k: usize,
    prewarmed: Arc<AtomicBool>,
}

impl RecommendationService {
    pub fn new(
        index: SemanticIndexService,
        catalog: Arc<dyn CatalogQueries>,
        chat: Arc<dyn ChatModel>,
        options: ChatOptions,
        default_top_k: usize,
    ) -> Self {
        Self {
            index,
            catalog,
            chat,
            options,
            default_top_k,
            prewarmed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Warms up the embedding model and loads the latest index into memory.
    ///
    /// Returns true if this was the first warm-up operation. A missing index
    /// is logged and does not fail the warm-up.
    pub async fn prewarm(&self) -> Result<bool> {
        if self.prewarmed.load(Ordering::Acquire) {
            debug!("RecommendationService already prewarmed, skipping");
            return Ok(false);
        }

        info!("Warming up RecommendationService...");
        let start = Instant::now();

        self.index.embedder().prewarm().await?;

        match self.index.active().await {
            Ok(active) => {
                let warm_query = self.index.embedder().embed(PREWARM_QUERY).await?;
                active.search(&warm_query, 1)?;
                info!(
                    snapshot_id = active.snapshot_id,
                    vectors = active.len(),
                    "Semantic index loaded"
                );
            }
            Err(ApiError::IndexError(msg)) => warn!("Prewarm skipped index load: {}", msg),
            Err(e) => return Err(e),
        }

        info!("RecommendationService prewarmed in {:?}", start.elapsed());
        Ok(!self.prewarmed.swap(true, Ordering::AcqRel))
    }

    /// Nearest catalog rows for a query, closest first. No LLM involved.
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, top_k: Option<usize>) -> Result<Vec<ScoredProduct>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
        }

        let k = top_k.unwrap_or(self.default_top_k).clamp(1, MAX_TOP_K);
        let hits = self.index.search(query, k).await?;

        let pairs: Vec<(i64, i64)> = hits.iter().map(|h| (h.product_id, h.variant_id)).collect();
        let rows = self.catalog.fetch_pairs(&pairs).await?;
        Ok(attach_distances(&hits, rows))
    }

    #[instrument(skip(self))]
    pub async fn recommend(&self, query: &str, top_k: Option<usize>) -> Result<RecommendationResponse> {
        let start = Instant::now();
        let products = self.search(query, top_k).await?;

        if products.is_empty() {
            return Ok(RecommendationResponse {
                response: NOT_LISTED_REPLY.to_string(),
                products,
            });
        }

        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(build_prompt(query.trim(), &products)),
        ];
        let response = self.chat.chat(&messages, &self.options).await?;

        info!(
            candidates = products.len(),
            model = self.chat.model_name(),
            "Recommendation generated in {:?}",
            start.elapsed()
        );
        Ok(RecommendationResponse { response, products })
    }
}

fn attach_distances(
    hits: &[SemanticHit],
    rows: Vec<ProductVariant>,
) -> Vec<ScoredProduct> {
    let distances: HashMap<(i64, i64), f32> = hits
        .iter()
        .map(|h| ((h.product_id, h.variant_id), h.distance))
        .collect();

    rows.into_iter()
        .filter_map(|product| {
            distances
                .get(&(product.product_id, product.variant_id))
                .map(|&distance| ScoredProduct { product, distance })
        })
        .collect()
}

fn build_prompt(query: &str, products: &[ScoredProduct]) -> String {
    let descriptions = products
        .iter()
        .map(|p| format!("- {}", p.product.prompt_line()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Customer Request: {query}\n\
         Products:\n{descriptions}\n\n\
         Task:\n\
         - Identify and recommend products from the product descriptions that match the customer's request based on product details (e.g., option, category), ignoring case sensitivity.\n\
         - If an exact match is found, but the inventory_quantity is 0, respond with:\n  \"{OUT_OF_STOCK_REPLY}\"\n\
         - If no exact match exists, suggest the best available alternatives within the same category or closest possible matches, ensuring that the alternatives are in stock and active.\n\
         - If no suitable products are found, respond with:\n  \"{NOT_LISTED_REPLY}\"\n\
         - Do not suggest products that are archived or have a status other than \"active\".\n\
         - Output only the final response in a short, concise format, followed by the matching products in JSON format.\n\
         - Use the same language as the customer's request.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::embedder::test_support::HashEmbedder;
    use crate::models::sample_pair;
    use crate::services::{
        catalog_repository::test_support::InMemoryCatalog,
        index_repository::test_support::InMemorySnapshots,
        llm::test_support::ScriptedChat,
    };

    fn pairs() -> Vec<ProductVariant> {
        vec![
            sample_pair(1, 10, "Trail Runner", 90.0),
            sample_pair(2, 20, "Court Classic", 45.0),
        ]
    }

    /// Index built over `indexed`; retrieval reads rows from `listed`.
    async fn service(
        indexed: Vec<ProductVariant>,
        listed: Vec<ProductVariant>,
        chat: Arc<ScriptedChat>,
    ) -> RecommendationService {
        let index = SemanticIndexService::new(
            Arc::new(HashEmbedder::new()),
            Arc::new(InMemoryCatalog::new(Vec::new()).with_pairs(indexed)),
            Arc::new(InMemorySnapshots::default()),
        );
        index.rebuild().await.unwrap();

        RecommendationService::new(
            index,
            Arc::new(InMemoryCatalog::new(Vec::new()).with_pairs(listed)),
            chat,
            ChatOptions {
                temperature: 0.3,
                max_tokens: 300,
            },
            5,
        )
    }

    #[tokio::test]
    async fn test_recommend_sends_nearest_candidates_to_llm() {
        let chat = Arc::new(ScriptedChat::new(&["Try the Court Classic."]));
        let service = service(pairs(), pairs(), Arc::clone(&chat)).await;

        let query = sample_pair(2, 20, "Court Classic", 45.0).search_text();
        let response = service.recommend(&query, Some(2)).await.unwrap();

        assert_eq!(response.response, "Try the Court Classic.");
        assert_eq!(response.products.len(), 2);
        assert_eq!(response.products[0].product.variant_id, 20);
        assert!(response.products[0].distance <= response.products[1].distance);

        let requests = chat.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0][1].content.contains("variant id: 20, name: Court Classic"));
    }

    #[tokio::test]
    async fn test_recommend_without_candidates_skips_llm() {
        let chat = Arc::new(ScriptedChat::new(&[]));
        // Indexed rows that have since left the catalog.
        let service = service(pairs(), Vec::new(), Arc::clone(&chat)).await;

        let response = service.recommend("running shoes", None).await.unwrap();
        assert_eq!(response.response, NOT_LISTED_REPLY);
        assert!(response.products.is_empty());
        assert!(chat.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_rejects_blank_query() {
        let service = service(pairs(), pairs(), Arc::new(ScriptedChat::new(&[]))).await;
        assert!(matches!(
            service.search("  ", None).await,
            Err(ApiError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_attach_distances_keeps_row_order() {
        let hits = [
            SemanticHit {
                product_id: 2,
                variant_id: 20,
                distance: 0.1,
            },
            SemanticHit {
                product_id: 1,
                variant_id: 10,
                distance: 0.4,
            },
        ];
        let rows = vec![
            sample_pair(2, 20, "Court Classic", 70.0),
            sample_pair(1, 10, "Trail Runner", 90.0),
        ];

        let scored = attach_distances(&hits, rows);
        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].product.product_id, 2);
        assert_eq!(scored[0].distance, 0.1);
        assert_eq!(scored[1].distance, 0.4);
    }

    #[test]
    fn test_attach_distances_drops_rows_without_hit() {
        let hits = [SemanticHit {
            product_id: 1,
            variant_id: 10,
            distance: 0.2,
        }];
        let scored = attach_distances(&hits, vec![sample_pair(9, 90, "Stray", 1.0)]);
        assert!(scored.is_empty());
    }

    #[test]
    fn test_prompt_lists_candidates_and_rules() {
        let products = vec![ScoredProduct {
            product: sample_pair(1, 10, "Trail Runner", 89.5),
            distance: 0.3,
        }];
        let prompt = build_prompt("red running shoes", &products);

        assert!(prompt.starts_with("Customer Request: red running shoes"));
        assert!(prompt.contains("product id: 1, variant id: 10, name: Trail Runner - category: Shoes"));
        assert!(prompt.contains("price: $89.50"));
        assert!(prompt.contains(NOT_LISTED_REPLY));
        assert!(prompt.contains(OUT_OF_STOCK_REPLY));
    }
}
