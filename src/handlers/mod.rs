pub mod catalog;
pub mod chat;
pub mod health;
pub mod prewarm;
pub mod recommendations;

pub use catalog::catalog_config;
pub use chat::chat_config;
pub use health::health_check;
pub use prewarm::prewarm as prewarm_endpoint;
pub use recommendations::recommendations_config;
