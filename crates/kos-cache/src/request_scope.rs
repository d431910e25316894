use dashmap::DashMap;
use kos_core::{CacheKey, EmbeddingVector};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct Scope {
    /// Number of open `begin` calls for this request id.
    depth: usize,
    entries: HashMap<CacheKey, EmbeddingVector>,
}

/// Embeddings memoized for the lifetime of a single request.
///
/// Scopes are keyed by request id and reference counted, so two overlapping
/// scopes with the same id share entries and the data is dropped only when
/// the last one ends. Distinct ids never see each other's entries.
#[derive(Clone, Default)]
pub struct RequestScopeCache {
    scopes: Arc<DashMap<String, Scope>>,
}

impl RequestScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or re-enters) the scope for `request_id`.
    pub fn begin(&self, request_id: &str) {
        let mut scope = self.scopes.entry(request_id.to_string()).or_default();
        scope.depth += 1;
        debug!(request_id, depth = scope.depth, "request scope opened");
    }

    /// Closes one level of the scope. Returns the number of entries discarded,
    /// which is zero unless this was the outermost level.
    pub fn end(&self, request_id: &str) -> usize {
        let discarded = match self.scopes.get_mut(request_id) {
            Some(mut scope) => {
                scope.depth = scope.depth.saturating_sub(1);
                if scope.depth > 0 {
                    return 0;
                }
                scope.entries.len()
            }
            None => return 0,
        };
        // The shard guard above is released before removal.
        self.scopes
            .remove_if(request_id, |_, scope| scope.depth == 0);
        debug!(request_id, discarded, "request scope closed");
        discarded
    }

    pub fn get(&self, request_id: &str, key: &CacheKey) -> Option<EmbeddingVector> {
        self.scopes
            .get(request_id)
            .and_then(|scope| scope.entries.get(key).cloned())
    }

    /// Records `value` in an open scope. Writes to unknown ids are ignored.
    pub fn insert(&self, request_id: &str, key: CacheKey, value: EmbeddingVector) -> bool {
        match self.scopes.get_mut(request_id) {
            Some(mut scope) => {
                scope.entries.entry(key).or_insert(value);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        self.scopes.contains_key(request_id)
    }

    pub fn active_scopes(&self) -> usize {
        self.scopes.len()
    }

    pub fn scope_len(&self, request_id: &str) -> usize {
        self.scopes
            .get(request_id)
            .map(|scope| scope.entries.len())
            .unwrap_or(0)
    }
}
