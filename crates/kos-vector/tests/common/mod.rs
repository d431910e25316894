#![allow(dead_code)]

use async_trait::async_trait;
use kos_cache::EmbeddingCache;
use kos_concurrent::ConcurrencyLimiter;
use kos_core::{EmbeddingVector, KosError, Result};
use kos_vector::{BatchConfig, EmbeddingBatchProcessor, EmbeddingComputer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records every downstream call and derives a vector from the text length.
#[derive(Default)]
pub struct CountingComputer {
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    fail: AtomicBool,
}

impl CountingComputer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingComputer for CountingComputer {
    async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push(texts.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(KosError::DownstreamUnavailable("mock outage".into()));
        }
        Ok(texts
            .iter()
            .map(|t| EmbeddingVector::new(vec![t.len() as f32, 1.0]))
            .collect())
    }

    fn name(&self) -> &str {
        "counting-mock"
    }
}

fn test_config(batch_size: usize, timeout_ms: u64) -> BatchConfig {
    BatchConfig {
        batch_size,
        batch_timeout: Duration::from_millis(timeout_ms),
        queue_capacity: 256,
    }
}

pub fn batcher(
    computer: Arc<dyn EmbeddingComputer>,
    batch_size: usize,
    timeout_ms: u64,
) -> Arc<EmbeddingBatchProcessor> {
    Arc::new(EmbeddingBatchProcessor::new(
        computer,
        EmbeddingCache::new(0, 500),
        test_config(batch_size, timeout_ms),
    ))
}

/// Batcher whose downstream calls each take a slot from `limiter`.
pub fn gated_batcher(
    computer: Arc<dyn EmbeddingComputer>,
    batch_size: usize,
    timeout_ms: u64,
    limiter: ConcurrencyLimiter,
) -> Arc<EmbeddingBatchProcessor> {
    Arc::new(EmbeddingBatchProcessor::with_limiter(
        computer,
        EmbeddingCache::new(0, 500),
        test_config(batch_size, timeout_ms),
        limiter,
    ))
}
