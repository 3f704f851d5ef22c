use serde::{Deserialize, Serialize};

pub use product::{Product, ProductSummary, ProductVariant, Variant};
pub use session::{is_exit_command, ChatMessage, Role, SessionFilters};

mod product;
mod session;

#[cfg(test)]
pub(crate) use product::sample_pair;

/// Request structure for semantic search and recommendations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    /// What the customer is looking for, in their own words
    pub query: String,
    /// Number of candidates retrieved from the index (defaults to the configured value)
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// A retrieved candidate: the catalog row plus its distance to the query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredProduct {
    #[serde(flatten)]
    pub product: ProductVariant,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredProduct>,
}

/// Response structure for LLM-backed recommendations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    /// Text synthesized by the LLM from the candidates
    pub response: String,
    /// Candidates handed to the LLM, nearest first
    pub products: Vec<ScoredProduct>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogSource {
    Rest,
    Graphql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default = "default_source")]
    pub source: CatalogSource,
}

fn default_source() -> CatalogSource {
    CatalogSource::Graphql
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub products: usize,
    pub variants: usize,
    pub skipped_variants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub snapshot_id: i64,
    pub vectors: usize,
    pub dimension: usize,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterChatResponse {
    pub session_id: String,
    pub message: String,
    pub filters: SessionFilters,
    pub complete: bool,
    pub fallback: bool,
    pub products: Vec<ProductSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentAnswer {
    pub message: String,
    pub query: String,
    pub result: Vec<serde_json::Value>,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: String,
    pub response: AgentAnswer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub route: String,
    pub response: String,
    pub product_types: Vec<String>,
}
