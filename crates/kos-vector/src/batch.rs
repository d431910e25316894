use kos_cache::{CacheStats, EmbeddingCache};
use kos_concurrent::ConcurrencyLimiter;
use kos_core::{BatchSettings, CacheKey, EmbeddingVector, KosError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::computer::EmbeddingComputer;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from(&BatchSettings::default())
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            batch_timeout: Duration::from_millis(settings.batch_timeout_ms),
            queue_capacity: settings.queue_capacity.max(1),
        }
    }
}

/// What a waiter receives once its batch settles.
#[derive(Debug, Clone)]
enum BatchReply {
    Ready(EmbeddingVector),
    Failed,
    /// No downstream slot within the limiter's wait timeout.
    Overloaded,
}

struct BatchRequest {
    key: CacheKey,
    text: String,
    submitted_at: Instant,
    tx: oneshot::Sender<BatchReply>,
}

#[derive(Debug, Default)]
struct BatchCounters {
    requests_total: AtomicU64,
    cache_hits: AtomicU64,
    batches_dispatched: AtomicU64,
    failed_batches: AtomicU64,
    overloaded_batches: AtomicU64,
    texts_computed: AtomicU64,
    in_flight_batches: AtomicUsize,
    /// Requests taken off the channel but not yet dispatched.
    buffered: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub queue_size: usize,
    pub cache_size: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub batches_dispatched: u64,
    pub requests_total: u64,
    pub cache_hits: u64,
    pub failed_batches: u64,
    pub overloaded_batches: u64,
    pub texts_computed: u64,
    pub in_flight_batches: usize,
    pub cache: CacheStats,
}

/// Coalesces concurrent embedding requests into batched downstream calls.
///
/// A single dispatcher task owns the pending buffer. It flushes when
/// `batch_size` requests are waiting or when the oldest one has waited
/// `batch_timeout`, whichever happens first. Each flush becomes one
/// [`EmbeddingComputer::compute_batch`] call running on its own task, so the
/// dispatcher keeps collecting and timing the next batch while a slow call is
/// outstanding. With a limiter attached, every downstream call holds one of
/// its slots. Every waiter gets its own result, or `None` when the call failed.
pub struct EmbeddingBatchProcessor {
    tx: mpsc::Sender<BatchRequest>,
    cache: EmbeddingCache,
    config: BatchConfig,
    counters: Arc<BatchCounters>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingBatchProcessor {
    /// Spawns the dispatcher on the current Tokio runtime. Downstream calls
    /// are not gated.
    pub fn new(
        computer: Arc<dyn EmbeddingComputer>,
        cache: EmbeddingCache,
        config: BatchConfig,
    ) -> Self {
        Self::spawn(computer, cache, config, None)
    }

    /// Like [`new`](Self::new), but each downstream call first takes a slot
    /// from `limiter`. A batch that gets no slot in time resolves as overloaded.
    pub fn with_limiter(
        computer: Arc<dyn EmbeddingComputer>,
        cache: EmbeddingCache,
        config: BatchConfig,
        limiter: ConcurrencyLimiter,
    ) -> Self {
        Self::spawn(computer, cache, config, Some(limiter))
    }

    fn spawn(
        computer: Arc<dyn EmbeddingComputer>,
        cache: EmbeddingCache,
        config: BatchConfig,
        limiter: Option<ConcurrencyLimiter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let counters = Arc::new(BatchCounters::default());
        let shutdown = CancellationToken::new();

        info!(
            "embedding batcher started: batch_size={} batch_timeout={:?} gated={}",
            config.batch_size,
            config.batch_timeout,
            limiter.is_some()
        );

        let dispatcher = Dispatcher {
            rx,
            sink: BatchSink {
                computer,
                cache: cache.clone(),
                counters: Arc::clone(&counters),
                limiter,
            },
            config: config.clone(),
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(dispatcher.run());

        Self {
            tx,
            cache,
            config,
            counters,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Embedding for `text`, from cache or via the next batch.
    ///
    /// Blank text yields `None` without any downstream work, as does a failed
    /// or overloaded batch. Dropping the returned future only abandons this
    /// caller's slot.
    pub async fn get_embedding(&self, text: &str) -> Option<EmbeddingVector> {
        self.try_get_embedding(text).await.ok().flatten()
    }

    /// [`get_embedding`](Self::get_embedding) that tells overload apart from
    /// failure: `Err(KosError::Overloaded)` when the batch carrying `text`
    /// found no downstream slot.
    pub async fn try_get_embedding(&self, text: &str) -> Result<Option<EmbeddingVector>> {
        let Some(key) = self.cache.key_for(text) else {
            return Ok(None);
        };
        self.counters.requests_total.fetch_add(1, Ordering::Relaxed);

        if let Some(hit) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit));
        }

        let (tx, rx) = oneshot::channel();
        let request = BatchRequest {
            key,
            text: text.trim().to_string(),
            submitted_at: Instant::now(),
            tx,
        };
        if self.tx.send(request).await.is_err() {
            warn!("embedding batcher is shut down; request dropped");
            return Ok(None);
        }

        // A closed slot means the dispatcher went away before answering.
        match rx.await {
            Ok(BatchReply::Ready(vector)) => Ok(Some(vector)),
            Ok(BatchReply::Overloaded) => Err(KosError::Overloaded(
                "no downstream slot for embedding batch".into(),
            )),
            Ok(BatchReply::Failed) | Err(_) => Ok(None),
        }
    }

    /// Peek at the process cache without queueing anything.
    pub fn get_cached(&self, text: &str) -> Option<EmbeddingVector> {
        let key = self.cache.key_for(text)?;
        self.cache.peek(&key)
    }

    pub fn queue_size(&self) -> usize {
        let in_channel = self.tx.max_capacity() - self.tx.capacity();
        in_channel + self.counters.buffered.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BatchStats {
        let cache = self.cache.stats();
        BatchStats {
            queue_size: self.queue_size(),
            cache_size: cache.entries,
            batch_size: self.config.batch_size,
            batch_timeout_ms: self.config.batch_timeout.as_millis() as u64,
            batches_dispatched: self.counters.batches_dispatched.load(Ordering::Relaxed),
            requests_total: self.counters.requests_total.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            overloaded_batches: self.counters.overloaded_batches.load(Ordering::Relaxed),
            texts_computed: self.counters.texts_computed.load(Ordering::Relaxed),
            in_flight_batches: self.counters.in_flight_batches.load(Ordering::Acquire),
            cache,
        }
    }

    /// Empties the process cache. Returns the number of entries removed.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Stops accepting requests, flushes whatever is pending and waits for the
    /// dispatcher and every in-flight batch to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("embedding dispatcher ended abnormally: {}", e);
            }
            info!("embedding batcher stopped");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for EmbeddingBatchProcessor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Dispatcher {
    rx: mpsc::Receiver<BatchRequest>,
    sink: BatchSink,
    config: BatchConfig,
    counters: Arc<BatchCounters>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut buffer: Vec<BatchRequest> = Vec::with_capacity(self.config.batch_size);
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut deadline: Option<Instant> = None;
        let mut closing = false;

        loop {
            let window = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !closing => {
                    // Remaining queued requests are still delivered by recv()
                    self.rx.close();
                    closing = true;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!("embedding batch task ended abnormally: {}", e);
                    }
                }
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        Some(req) => {
                            if buffer.is_empty() {
                                deadline = Some(req.submitted_at + self.config.batch_timeout);
                            }
                            buffer.push(req);
                            self.counters.buffered.store(buffer.len(), Ordering::Release);
                            if buffer.len() >= self.config.batch_size {
                                self.flush(&mut buffer, &mut in_flight);
                                deadline = None;
                            }
                        }
                        None => {
                            self.flush(&mut buffer, &mut in_flight);
                            break;
                        }
                    }
                }
                _ = window => {
                    self.flush(&mut buffer, &mut in_flight);
                    deadline = None;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!("embedding batch task ended abnormally: {}", e);
            }
        }
        debug!("embedding dispatcher exited");
    }

    /// Moves the buffer into a batch task and returns immediately.
    fn flush(&self, buffer: &mut Vec<BatchRequest>, in_flight: &mut JoinSet<()>) {
        if buffer.is_empty() {
            return;
        }
        let requests = std::mem::take(buffer);
        self.counters.buffered.store(0, Ordering::Release);
        in_flight.spawn(self.sink.clone().dispatch(requests));
    }
}

/// Everything a batch task needs to call downstream and answer its waiters.
#[derive(Clone)]
struct BatchSink {
    computer: Arc<dyn EmbeddingComputer>,
    cache: EmbeddingCache,
    counters: Arc<BatchCounters>,
    limiter: Option<ConcurrencyLimiter>,
}

impl BatchSink {
    async fn dispatch(self, requests: Vec<BatchRequest>) {
        let oldest_wait = requests
            .first()
            .map(|r| r.submitted_at.elapsed())
            .unwrap_or_default();

        // Group waiters by key; keep first-seen order for the downstream call.
        let mut order: Vec<(CacheKey, String)> = Vec::new();
        let mut waiters: HashMap<CacheKey, Vec<oneshot::Sender<BatchReply>>> = HashMap::new();
        for req in requests {
            // Filled by an earlier batch while this request sat in the queue
            if let Some(hit) = self.cache.peek(&req.key) {
                let _ = req.tx.send(BatchReply::Ready(hit));
                continue;
            }
            let slot = waiters.entry(req.key.clone()).or_default();
            if slot.is_empty() {
                order.push((req.key, req.text));
            }
            slot.push(req.tx);
        }

        if order.is_empty() {
            return;
        }

        let _slot = match &self.limiter {
            Some(limiter) => match limiter.acquire_slot(limiter.default_timeout()).await {
                Some(slot) => Some(slot),
                None => {
                    self.counters
                        .overloaded_batches
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("embedding batch of {} shed: limiter saturated", order.len());
                    for tx in waiters.into_values().flatten() {
                        let _ = tx.send(BatchReply::Overloaded);
                    }
                    return;
                }
            },
            None => None,
        };

        let texts: Vec<String> = order.iter().map(|(_, text)| text.clone()).collect();
        self.counters
            .batches_dispatched
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .in_flight_batches
            .fetch_add(1, Ordering::AcqRel);
        debug!(
            "dispatching embedding batch of {} (oldest waited {:?})",
            texts.len(),
            oldest_wait
        );

        let outcome = match self.computer.compute_batch(&texts).await {
            Ok(vectors) if vectors.len() == texts.len() => Some(vectors),
            Ok(vectors) => {
                warn!(
                    "{} returned {} embeddings for a batch of {}",
                    self.computer.name(),
                    vectors.len(),
                    texts.len()
                );
                None
            }
            Err(e) => {
                warn!(
                    "embedding batch of {} failed via {}: {}",
                    texts.len(),
                    self.computer.name(),
                    e
                );
                None
            }
        };
        self.counters
            .in_flight_batches
            .fetch_sub(1, Ordering::AcqRel);

        match outcome {
            Some(vectors) => {
                self.counters
                    .texts_computed
                    .fetch_add(vectors.len() as u64, Ordering::Relaxed);
                for ((key, _), vector) in order.into_iter().zip(vectors) {
                    self.cache.insert_if_absent(key.clone(), vector.clone());
                    // Hand out the stored value so every caller shares one allocation
                    let value = self.cache.peek(&key).unwrap_or(vector);
                    for tx in waiters.remove(&key).unwrap_or_default() {
                        let _ = tx.send(BatchReply::Ready(value.clone()));
                    }
                }
            }
            None => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                for tx in waiters.into_values().flatten() {
                    let _ = tx.send(BatchReply::Failed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl EmbeddingComputer for Echo {
        async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
            Ok(texts
                .iter()
                .map(|t| EmbeddingVector::new(vec![t.len() as f32]))
                .collect())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct ShortBy1;

    #[async_trait]
    impl EmbeddingComputer for ShortBy1 {
        async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
            Ok(texts
                .iter()
                .skip(1)
                .map(|_| EmbeddingVector::new(vec![0.0]))
                .collect())
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    fn processor(computer: Arc<dyn EmbeddingComputer>) -> EmbeddingBatchProcessor {
        EmbeddingBatchProcessor::new(
            computer,
            EmbeddingCache::new(0, 500),
            BatchConfig {
                batch_size: 4,
                batch_timeout: Duration::from_millis(10),
                queue_capacity: 64,
            },
        )
    }

    #[tokio::test]
    async fn blank_text_is_none() {
        let p = processor(Arc::new(Echo));
        assert!(p.get_embedding("   ").await.is_none());
        assert_eq!(p.stats().requests_total, 0);
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let p = processor(Arc::new(Echo));
        let first = p.get_embedding("hello").await.unwrap();
        let second = p.get_embedding("HELLO ").await.unwrap();
        assert!(first.ptr_eq(&second));

        let stats = p.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.queue_size, 0);
    }

    #[tokio::test]
    async fn count_mismatch_fails_whole_batch() {
        let p = processor(Arc::new(ShortBy1));
        assert!(p.get_embedding("x").await.is_none());
        assert_eq!(p.stats().failed_batches, 1);
        assert_eq!(p.cache().len(), 0);
    }

    #[tokio::test]
    async fn requests_after_shutdown_get_none() {
        let p = processor(Arc::new(Echo));
        p.shutdown().await;
        p.shutdown().await;
        assert!(p.is_shut_down());
        assert!(p.get_embedding("late").await.is_none());
    }
}
