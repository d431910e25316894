use kos_concurrent::LimiterStats;
use kos_vector::{BatchStats, PrefetchStats};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kos_http_requests_total", "Management API requests by route"),
        &["route"]
    )
    .expect("metric can be created");

    pub static ref OVERLOAD_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "kos_overload_rejections_total",
        "Requests rejected because no concurrency slot became free"
    )
    .expect("metric can be created");

    pub static ref EMBEDDING_LOOKUPS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("kos_embedding_lookups", "Embedding lookups by outcome since start"),
        &["outcome"]
    )
    .expect("metric can be created");

    pub static ref BATCHES_DISPATCHED: IntGauge = IntGauge::new(
        "kos_embedding_batches_dispatched",
        "Downstream embedding batches sent since start"
    )
    .expect("metric can be created");

    pub static ref BATCH_QUEUE_SIZE: IntGauge = IntGauge::new(
        "kos_embedding_queue_size",
        "Embedding requests waiting for a batch"
    )
    .expect("metric can be created");

    pub static ref CACHE_ENTRIES: IntGauge = IntGauge::new(
        "kos_embedding_cache_entries",
        "Entries in the process embedding cache"
    )
    .expect("metric can be created");

    pub static ref LIMITER_IN_FLIGHT: IntGauge = IntGauge::new(
        "kos_limiter_in_flight",
        "Concurrency slots currently held"
    )
    .expect("metric can be created");

    pub static ref PREFETCHED_QUERIES: IntGauge = IntGauge::new(
        "kos_prefetched_queries",
        "Queries in the current prefetch set"
    )
    .expect("metric can be created");
}

static REGISTER: Once = Once::new();

pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(OVERLOAD_REJECTIONS_TOTAL.clone()),
            Box::new(EMBEDDING_LOOKUPS.clone()),
            Box::new(BATCHES_DISPATCHED.clone()),
            Box::new(BATCH_QUEUE_SIZE.clone()),
            Box::new(CACHE_ENTRIES.clone()),
            Box::new(LIMITER_IN_FLIGHT.clone()),
            Box::new(PREFETCHED_QUERIES.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!("failed to register metric: {}", e);
            }
        }
    });
}

pub fn record_request(route: &str) {
    HTTP_REQUESTS_TOTAL.with_label_values(&[route]).inc();
}

/// Copies component counters into the gauges right before a scrape.
pub fn update_component_metrics(batch: &BatchStats, limiter: &LimiterStats, prefetch: &PrefetchStats) {
    EMBEDDING_LOOKUPS
        .with_label_values(&["cache_hit"])
        .set(batch.cache_hits as i64);
    EMBEDDING_LOOKUPS
        .with_label_values(&["queued"])
        .set(batch.requests_total.saturating_sub(batch.cache_hits) as i64);
    EMBEDDING_LOOKUPS
        .with_label_values(&["failed_batches"])
        .set(batch.failed_batches as i64);
    BATCHES_DISPATCHED.set(batch.batches_dispatched as i64);
    BATCH_QUEUE_SIZE.set(batch.queue_size as i64);
    CACHE_ENTRIES.set(batch.cache_size as i64);
    LIMITER_IN_FLIGHT.set(limiter.in_flight as i64);
    PREFETCHED_QUERIES.set(prefetch.prefetched_queries_count as i64);
}

pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        warn!("metrics are not valid UTF-8: {}", e);
        String::new()
    })
}
