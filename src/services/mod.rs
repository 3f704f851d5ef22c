pub mod assistant_router;
pub mod catalog_repository;
pub mod catalog_sync;
pub mod filter_chat;
pub mod index_repository;
pub mod llm;
pub mod recommendation;
pub mod semantic_index;
pub mod session_store;
pub mod shopify;
pub mod sql_agent;

// Re-export public types
pub use assistant_router::AssistantRouter;
pub use catalog_repository::{CatalogQueries, CatalogRepository};
pub use catalog_sync::CatalogSync;
pub use filter_chat::FilterChatService;
pub use index_repository::{IndexRepository, SnapshotStore};
pub use llm::{build_chat_model, ChatModel, ChatOptions};
pub use recommendation::RecommendationService;
pub use semantic_index::SemanticIndexService;
pub use session_store::{RedisSessionBackend, SessionStore};
pub use shopify::ShopifyClient;
pub use sql_agent::SqlAgentService;
