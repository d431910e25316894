use async_trait::async_trait;
use kos_core::{EmbeddingVector, KosError, Result};

/// Downstream capability that turns texts into embeddings.
///
/// Implementations receive already non-empty texts and must return exactly one
/// vector per input, in input order. Any failure is reported for the whole
/// call; callers decide how to absorb it.
#[async_trait]
pub trait EmbeddingComputer: Send + Sync {
    async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>>;

    async fn compute(&self, text: &str) -> Result<EmbeddingVector> {
        let mut out = self.compute_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| {
            KosError::DownstreamUnavailable(format!("{} returned no embedding", self.name()))
        })
    }

    fn name(&self) -> &str;
}

/// Cuts `text` to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
