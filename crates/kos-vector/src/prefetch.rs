use chrono::{DateTime, Utc};
use futures::future::join_all;
use kos_core::{CacheKey, EmbeddingVector, KosError, PrefetchRecord, PrefetchSettings, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::EmbeddingBatchProcessor;

/// Queries warmed when no prefetch file is configured.
pub const DEFAULT_FREQUENT_QUERIES: &[&str] = &[
    "how do I get started",
    "project overview",
    "architecture overview",
    "how to configure the service",
    "list available commands",
    "api endpoints",
    "authentication setup",
    "deployment guide",
    "how to run tests",
    "troubleshooting common errors",
    "performance tuning",
    "logging and monitoring",
    "database migrations",
    "environment variables",
    "release notes",
    "contribution guidelines",
    "security best practices",
    "backup and restore",
];

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchReport {
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl PrefetchReport {
    /// Nothing loaded although there was something to load.
    pub fn is_failure(&self) -> bool {
        self.requested > 0 && self.loaded == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchStats {
    pub prefetched_queries_count: usize,
    pub total_prefetched: u64,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub source: String,
}

/// Warms the embedding cache with frequently asked queries.
pub struct RagPrefetch {
    batcher: Arc<EmbeddingBatchProcessor>,
    source_file: Option<PathBuf>,
    records: RwLock<HashMap<CacheKey, PrefetchRecord>>,
    total_prefetched: AtomicU64,
    last_loaded_at: RwLock<Option<DateTime<Utc>>>,
}

impl RagPrefetch {
    pub fn new(batcher: Arc<EmbeddingBatchProcessor>, source_file: Option<PathBuf>) -> Self {
        Self {
            batcher,
            source_file,
            records: RwLock::new(HashMap::new()),
            total_prefetched: AtomicU64::new(0),
            last_loaded_at: RwLock::new(None),
        }
    }

    pub fn from_settings(batcher: Arc<EmbeddingBatchProcessor>, settings: &PrefetchSettings) -> Self {
        Self::new(batcher, settings.file.clone())
    }

    /// Current query source. A missing or malformed file falls back to the
    /// built-in list.
    pub async fn frequent_queries(&self) -> Vec<String> {
        match &self.source_file {
            Some(path) => match read_query_file(path).await {
                Ok(queries) => queries,
                Err(e) => {
                    warn!(
                        "prefetch file {} unusable ({}); using built-in queries",
                        path.display(),
                        e
                    );
                    default_queries()
                }
            },
            None => default_queries(),
        }
    }

    /// Embeds the first `max_queries` distinct frequent queries through the
    /// batcher and replaces the prefetched set with whatever succeeded.
    ///
    /// Queries that normalize to the same cache key count once, so
    /// `loaded + failed == requested` always holds.
    pub async fn load_frequent_queries(&self, max_queries: usize) -> PrefetchReport {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let queries: Vec<(CacheKey, String)> = self
            .frequent_queries()
            .await
            .into_iter()
            .filter_map(|q| self.batcher.cache().key_for(&q).map(|key| (key, q)))
            .filter(|(key, _)| seen.insert(key.clone()))
            .take(max_queries)
            .collect();

        // Issued together so they land in the same batches
        let results = join_all(queries.iter().map(|(key, q)| async move {
            (key, q, self.batcher.get_embedding(q).await)
        }))
        .await;

        let loaded_at = Utc::now();
        let mut records = HashMap::with_capacity(results.len());
        let mut failed = 0;
        for (key, query, embedding) in results {
            match embedding {
                Some(embedding) => {
                    records.insert(
                        key.clone(),
                        PrefetchRecord {
                            query_text: query.clone(),
                            embedding,
                            loaded_at,
                        },
                    );
                }
                None => {
                    debug!("prefetch skipped '{}'", query);
                    failed += 1;
                }
            }
        }

        let loaded = records.len();
        *self.records.write() = records;
        self.total_prefetched
            .fetch_add(loaded as u64, Ordering::Relaxed);
        *self.last_loaded_at.write() = Some(loaded_at);

        let report = PrefetchReport {
            requested: queries.len(),
            loaded,
            failed,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if report.is_failure() {
            warn!("prefetch loaded none of {} queries", report.requested);
        } else {
            info!(
                "prefetched {}/{} frequent queries in {}ms",
                report.loaded, report.requested, report.duration_ms
            );
        }
        report
    }

    pub fn is_prefetched(&self, text: &str) -> bool {
        self.batcher
            .cache()
            .key_for(text)
            .map(|key| self.records.read().contains_key(&key))
            .unwrap_or(false)
    }

    pub fn get_prefetched(&self, text: &str) -> Option<EmbeddingVector> {
        let key = self.batcher.cache().key_for(text)?;
        self.records
            .read()
            .get(&key)
            .map(|record| record.embedding.clone())
    }

    pub fn records(&self) -> Vec<PrefetchRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn get_stats(&self) -> PrefetchStats {
        PrefetchStats {
            prefetched_queries_count: self.records.read().len(),
            total_prefetched: self.total_prefetched.load(Ordering::Relaxed),
            last_loaded_at: *self.last_loaded_at.read(),
            source: self
                .source_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "builtin".to_string()),
        }
    }
}

fn default_queries() -> Vec<String> {
    DEFAULT_FREQUENT_QUERIES
        .iter()
        .map(|q| q.to_string())
        .collect()
}

/// Reads a JSON array; non-string entries are ignored.
async fn read_query_file(path: &Path) -> Result<Vec<String>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let items = value.as_array().ok_or_else(|| {
        KosError::InvalidInput(format!("{} is not a JSON array", path.display()))
    })?;
    Ok(items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_queries: usize,
    pub max_backoff: Duration,
}

impl SchedulerConfig {
    /// `None` when periodic refresh is disabled.
    pub fn from_settings(settings: &PrefetchSettings) -> Option<Self> {
        if !settings.enabled || settings.refresh_interval_secs == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(settings.refresh_interval_secs),
            max_queries: settings.max_queries,
            max_backoff: Duration::from_secs(settings.max_backoff_secs.max(1)),
        })
    }
}

/// Delay before the next attempt after `failures` consecutive failures:
/// exponential from `base`, capped at `max`, plus up to 10% jitter.
pub fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return base;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    let capped = base.saturating_mul(factor).min(max);
    let jitter_ms = capped.as_millis() as u64 / 10;
    capped + Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Background task that reloads the prefetch set on an interval.
pub struct PrefetchScheduler;

impl PrefetchScheduler {
    pub fn spawn(
        prefetch: Arc<RagPrefetch>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("prefetch refresh every {:?}", config.interval);
            let mut failures: u32 = 0;
            loop {
                let delay = backoff_delay(config.interval, failures, config.max_backoff);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let report = tokio::select! {
                    _ = cancel.cancelled() => break,
                    report = prefetch.load_frequent_queries(config.max_queries) => report,
                };

                if report.is_failure() {
                    failures = failures.saturating_add(1);
                    warn!(
                        "prefetch refresh failed ({} in a row); next attempt in about {:?}",
                        failures,
                        backoff_delay(config.interval, failures, config.max_backoff)
                    );
                } else {
                    failures = 0;
                }
            }
            info!("prefetch scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 0, max), base);

        let one = backoff_delay(base, 1, max);
        assert!(one >= Duration::from_secs(20) && one <= Duration::from_secs(22));

        for failures in [3, 10, 100] {
            let d = backoff_delay(base, failures, max);
            assert!(d >= max && d <= max + Duration::from_secs(6));
        }
    }

    #[test]
    fn scheduler_disabled_by_zero_interval() {
        let settings = PrefetchSettings::default();
        assert!(SchedulerConfig::from_settings(&settings).is_none());

        let settings = PrefetchSettings {
            refresh_interval_secs: 600,
            ..Default::default()
        };
        let config = SchedulerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.interval, Duration::from_secs(600));
        assert_eq!(config.max_queries, 15);
    }

    #[tokio::test]
    async fn query_file_ignores_non_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequent_queries.json");
        std::fs::write(&path, r#"["alpha", 3, "beta", null]"#).unwrap();
        assert_eq!(read_query_file(&path).await.unwrap(), vec!["alpha", "beta"]);

        std::fs::write(&path, r#"{"not": "a list"}"#).unwrap();
        assert!(matches!(
            read_query_file(&path).await,
            Err(KosError::InvalidInput(_))
        ));
    }
}
