pub mod embedder;
pub mod flat_index;
pub mod huggingface_embedder;
pub mod ollama_embedder;

pub use embedder::{build_embedder, Embedder};
pub use flat_index::{FlatL2Index, Neighbor};
