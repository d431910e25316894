use kos_cache::EmbeddingCache;
use kos_concurrent::ConcurrencyLimiter;
use kos_core::{Result, Settings};
use kos_vector::{
    BatchConfig, EmbeddingBatchProcessor, EmbeddingComputer, OllamaEmbeddingComputer,
    OllamaEmbeddingConfig, RagPrefetch, UnifiedEmbeddingProvider,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Composition root shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub batcher: Arc<EmbeddingBatchProcessor>,
    pub provider: UnifiedEmbeddingProvider,
    pub prefetch: Arc<RagPrefetch>,
    pub limiter: ConcurrencyLimiter,
    pub started_at: Instant,
}

impl AppState {
    /// Wires the Ollama client configured in `settings`.
    pub fn new(settings: Settings) -> Result<Self> {
        let computer = OllamaEmbeddingComputer::new(OllamaEmbeddingConfig::from(&settings.embedding))?;
        Ok(Self::with_computer(settings, Arc::new(computer)))
    }

    /// Same wiring with an arbitrary downstream.
    pub fn with_computer(settings: Settings, computer: Arc<dyn EmbeddingComputer>) -> Self {
        let cache = EmbeddingCache::from_settings(&settings.cache);
        // Shared with the batcher so every downstream call is gated, whoever issues it
        let limiter = ConcurrencyLimiter::from_settings(&settings.limiter);
        let batcher = Arc::new(EmbeddingBatchProcessor::with_limiter(
            computer,
            cache,
            BatchConfig::from(&settings.batch),
            limiter.clone(),
        ));
        let provider = UnifiedEmbeddingProvider::new(Arc::clone(&batcher));
        let prefetch = Arc::new(RagPrefetch::from_settings(
            Arc::clone(&batcher),
            &settings.prefetch,
        ));

        info!(
            "app state ready: limiter={} cache_capacity={:?}",
            limiter.max_concurrent(),
            batcher.cache().capacity()
        );

        Self {
            settings: Arc::new(settings),
            batcher,
            provider,
            prefetch,
            limiter,
            started_at: Instant::now(),
        }
    }
}
