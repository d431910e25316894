pub mod batch;
pub mod computer;
pub mod hybrid;
#[cfg(feature = "ollama")]
pub mod ollama;
pub mod prefetch;
pub mod unified;

pub use batch::{BatchConfig, BatchStats, EmbeddingBatchProcessor};
pub use computer::{truncate_chars, EmbeddingComputer};
pub use hybrid::{
    extract_keywords, hybrid_search, keyword_search, FallbackReason, HybridSearcher,
    SearchOutcome, VectorSearch,
};
#[cfg(feature = "ollama")]
pub use ollama::{OllamaEmbeddingComputer, OllamaEmbeddingConfig};
pub use prefetch::{
    backoff_delay, PrefetchReport, PrefetchScheduler, PrefetchStats, RagPrefetch,
    SchedulerConfig, DEFAULT_FREQUENT_QUERIES,
};
pub use unified::{RequestScope, UnifiedEmbeddingProvider};

pub use kos_core::{EmbeddingVector, HybridResult, KosError, Result};
