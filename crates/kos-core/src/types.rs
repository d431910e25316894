use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Immutable embedding shared between every caller that asked for the same text.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct EmbeddingVector(Arc<[f32]>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values.into())
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.to_vec()
    }

    /// True when both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for EmbeddingVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl From<EmbeddingVector> for Vec<f32> {
    fn from(v: EmbeddingVector) -> Self {
        v.to_vec()
    }
}

impl fmt::Debug for EmbeddingVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full vectors are hundreds of floats; keep logs readable.
        let head: Vec<f32> = self.0.iter().take(4).copied().collect();
        f.debug_struct("EmbeddingVector")
            .field("dimension", &self.0.len())
            .field("head", &head)
            .finish()
    }
}

/// One ranked item coming out of a retrieval path or the hybrid merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub content: String,
    pub score: f32,
}

impl HybridResult {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchRecord {
    pub query_text: String,
    pub embedding: EmbeddingVector,
    pub loaded_at: DateTime<Utc>,
}
