pub mod cache;
pub mod embedding_cache;
pub mod request_scope;

pub use cache::*;
pub use embedding_cache::*;
pub use request_scope::*;

// Re-export common types for convenience
pub use kos_core::{CacheKey, EmbeddingVector, KosError, Result};
