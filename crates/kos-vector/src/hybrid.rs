use async_trait::async_trait;
use kos_core::{EmbeddingVector, HybridResult, HybridSettings, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::unified::{RequestScope, UnifiedEmbeddingProvider};

const STOP_WORDS: &[&str] = &[
    "и", "или", "в", "на", "с", "для", "the", "a", "an", "and", "or", "in", "on", "at",
];

/// Blends two ranked lists into one.
///
/// Each content id scores `w * vector + (1 - w) * keyword`, a missing side
/// counting as 0. `w` is clamped to `[0, 1]`. Output is sorted by score,
/// descending; equal scores keep first-appearance order with the vector list
/// read before the keyword list. An id repeated within one list keeps its best
/// score from that list.
pub fn hybrid_search(
    query: &str,
    vector_results: &[(String, f32)],
    keyword_results: &[(String, f32)],
    vector_weight: f32,
) -> Vec<HybridResult> {
    let vw = if vector_weight.is_nan() {
        0.5
    } else {
        vector_weight.clamp(0.0, 1.0)
    };
    let kw = 1.0 - vw;

    // (content, best vector score, best keyword score), in first-seen order
    let mut merged: Vec<(String, Option<f32>, Option<f32>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for (content, score) in vector_results {
        match index.get(content.as_str()) {
            Some(&i) => {
                let best = &mut merged[i].1;
                *best = Some(best.map_or(*score, |b| b.max(*score)));
            }
            None => {
                index.insert(content.as_str(), merged.len());
                merged.push((content.clone(), Some(*score), None));
            }
        }
    }
    for (content, score) in keyword_results {
        match index.get(content.as_str()) {
            Some(&i) => {
                let best = &mut merged[i].2;
                *best = Some(best.map_or(*score, |b| b.max(*score)));
            }
            None => {
                index.insert(content.as_str(), merged.len());
                merged.push((content.clone(), None, Some(*score)));
            }
        }
    }

    let mut results: Vec<HybridResult> = merged
        .into_iter()
        .map(|(content, v, k)| {
            let score = vw * v.unwrap_or(0.0) + kw * k.unwrap_or(0.0);
            HybridResult::new(content, score)
        })
        .collect();

    // Stable sort keeps first-appearance order on ties
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    debug!(
        "hybrid merge for '{}': {} vector + {} keyword -> {} results",
        query,
        vector_results.len(),
        keyword_results.len(),
        results.len()
    );
    results
}

/// Lower-cased query words, minus stop words and words of two chars or fewer.
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Scores each document by the share of query keywords it contains.
/// Documents matching nothing are dropped; ties keep document order.
pub fn keyword_search(query: &str, documents: &[String], limit: usize) -> Vec<(String, f32)> {
    let keywords = extract_keywords(query);
    if keywords.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(String, f32)> = documents
        .iter()
        .filter_map(|doc| {
            let haystack = doc.to_lowercase();
            let matched = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
            (matched > 0).then(|| (doc.clone(), matched as f32 / keywords.len() as f32))
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

/// Primary retrieval path queried with the request embedding.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(&self, embedding: &EmbeddingVector, limit: usize) -> Result<Vec<(String, f32)>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    EmbeddingUnavailable,
    VectorSearchFailed,
    NoVectorResults,
    LowConfidence,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<HybridResult>,
    pub fallback: Option<FallbackReason>,
}

/// Vector search with keyword fallback when the vector path is degraded.
pub struct HybridSearcher {
    provider: UnifiedEmbeddingProvider,
    backend: Arc<dyn VectorSearch>,
    corpus: RwLock<Vec<String>>,
    settings: HybridSettings,
}

impl HybridSearcher {
    pub fn new(
        provider: UnifiedEmbeddingProvider,
        backend: Arc<dyn VectorSearch>,
        settings: HybridSettings,
    ) -> Self {
        Self {
            provider,
            backend,
            corpus: RwLock::new(Vec::new()),
            settings,
        }
    }

    /// Replaces the documents used for keyword matching.
    pub fn set_corpus(&self, documents: Vec<String>) {
        *self.corpus.write() = documents;
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.read().len()
    }

    pub async fn search(&self, query: &str, limit: usize) -> SearchOutcome {
        let embedding = self.provider.get_embedding(query).await;
        self.search_with(query, embedding, limit).await
    }

    /// Same as [`search`](Self::search) but reuses the request memo.
    pub async fn search_in_scope(
        &self,
        scope: &RequestScope,
        query: &str,
        limit: usize,
    ) -> SearchOutcome {
        let embedding = scope.get_embedding(query).await;
        self.search_with(query, embedding, limit).await
    }

    async fn search_with(
        &self,
        query: &str,
        embedding: Option<EmbeddingVector>,
        limit: usize,
    ) -> SearchOutcome {
        let (vector_results, fallback) = match embedding {
            None => (Vec::new(), Some(FallbackReason::EmbeddingUnavailable)),
            Some(embedding) => match self
                .backend
                .search(&embedding, limit.saturating_mul(2))
                .await
            {
                Err(e) => {
                    warn!("vector search failed, using keyword fallback: {}", e);
                    (Vec::new(), Some(FallbackReason::VectorSearchFailed))
                }
                Ok(results) if results.is_empty() => {
                    (results, Some(FallbackReason::NoVectorResults))
                }
                Ok(results) => {
                    let best = results
                        .iter()
                        .map(|(_, s)| *s)
                        .fold(f32::NEG_INFINITY, f32::max);
                    if best < self.settings.min_vector_score {
                        (results, Some(FallbackReason::LowConfidence))
                    } else {
                        (results, None)
                    }
                }
            },
        };

        let mut results = match fallback {
            None => vector_results
                .into_iter()
                .map(|(content, score)| HybridResult::new(content, score))
                .collect(),
            Some(reason) => {
                debug!("hybrid fallback for '{}': {:?}", query, reason);
                let keyword_results = {
                    let corpus = self.corpus.read();
                    keyword_search(query, &corpus, limit.saturating_mul(2))
                };
                hybrid_search(
                    query,
                    &vector_results,
                    &keyword_results,
                    self.settings.vector_weight,
                )
            }
        };
        results.truncate(limit);
        SearchOutcome { results, fallback }
    }
}
