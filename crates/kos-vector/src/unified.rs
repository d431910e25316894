use kos_cache::RequestScopeCache;
use kos_core::{EmbeddingVector, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

use crate::batch::EmbeddingBatchProcessor;

/// Single entry point for embeddings inside a request.
///
/// Lookups go request memo, then process cache, then the batcher. The memo
/// lives exactly as long as the surrounding [`scope`](Self::scope) call.
#[derive(Clone)]
pub struct UnifiedEmbeddingProvider {
    batcher: Arc<EmbeddingBatchProcessor>,
    scopes: RequestScopeCache,
}

impl UnifiedEmbeddingProvider {
    pub fn new(batcher: Arc<EmbeddingBatchProcessor>) -> Self {
        Self {
            batcher,
            scopes: RequestScopeCache::new(),
        }
    }

    pub fn batcher(&self) -> &Arc<EmbeddingBatchProcessor> {
        &self.batcher
    }

    /// Runs `f` with a handle bound to `request_id`.
    ///
    /// The request memo is discarded when `f` completes, errors, panics or is
    /// cancelled. Overlapping scopes with the same id share one memo.
    pub async fn scope<F, Fut, T>(&self, request_id: &str, f: F) -> T
    where
        F: FnOnce(RequestScope) -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = ScopeGuard::enter(self.scopes.clone(), request_id);
        let handle = RequestScope {
            request_id: Arc::from(request_id),
            scopes: self.scopes.clone(),
            batcher: Arc::clone(&self.batcher),
        };
        f(handle).await
    }

    /// Unscoped lookup: process cache, then the batcher.
    pub async fn get_embedding(&self, text: &str) -> Option<EmbeddingVector> {
        self.batcher.get_embedding(text).await
    }

    pub fn active_scopes(&self) -> usize {
        self.scopes.active_scopes()
    }
}

/// Request-bound view handed to the closure passed to
/// [`UnifiedEmbeddingProvider::scope`].
#[derive(Clone)]
pub struct RequestScope {
    request_id: Arc<str>,
    scopes: RequestScopeCache,
    batcher: Arc<EmbeddingBatchProcessor>,
}

impl RequestScope {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn get_embedding(&self, text: &str) -> Option<EmbeddingVector> {
        self.try_get_embedding(text).await.ok().flatten()
    }

    /// Same lookup order; a shed batch surfaces as `KosError::Overloaded`.
    pub async fn try_get_embedding(&self, text: &str) -> Result<Option<EmbeddingVector>> {
        let Some(key) = self.batcher.cache().key_for(text) else {
            return Ok(None);
        };
        if let Some(hit) = self.scopes.get(&self.request_id, &key) {
            trace!(request_id = %self.request_id, "request memo hit");
            return Ok(Some(hit));
        }

        let Some(vector) = self.batcher.try_get_embedding(text).await? else {
            return Ok(None);
        };
        self.scopes
            .insert(&self.request_id, key, vector.clone());
        Ok(Some(vector))
    }

    /// Request memo, then process cache. Never queues work.
    pub fn get_cached_only(&self, text: &str) -> Option<EmbeddingVector> {
        let key = self.batcher.cache().key_for(text)?;
        self.scopes
            .get(&self.request_id, &key)
            .or_else(|| self.batcher.cache().peek(&key))
    }

    pub fn memo_len(&self) -> usize {
        self.scopes.scope_len(&self.request_id)
    }
}

struct ScopeGuard {
    scopes: RequestScopeCache,
    request_id: String,
}

impl ScopeGuard {
    fn enter(scopes: RequestScopeCache, request_id: &str) -> Self {
        scopes.begin(request_id);
        Self {
            scopes,
            request_id: request_id.to_string(),
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scopes.end(&self.request_id);
    }
}
