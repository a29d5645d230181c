//! Partitioned semantic retrieval.
//!
//! The retriever operates entirely through the [`CorpusStore`] trait. The
//! caller embeds the query and supplies the personality whose partition
//! should be searched.
//!
//! # Algorithm
//!
//! 1. Load the chunks of `personality_id` only (hard partition).
//! 2. Score each chunk by cosine similarity against the query vector.
//! 3. Keep chunks with `score >= similarity_threshold` (NaN never passes).
//! 4. Sort by score (desc), then ingestion sequence (asc).
//! 5. Truncate to `k`.
//!
//! An empty result is a normal outcome, not an error. The corpus is only
//! read, so concurrent calls need no coordination.

use std::cmp::Ordering;

use tracing::debug;

use crate::embedding::cosine_similarity;
use crate::error::RetrievalError;
use crate::models::{RetrievalResult, ScoredChunk};
use crate::store::CorpusStore;

/// Default number of chunks returned.
pub const DEFAULT_K: usize = 10;

/// Default minimum cosine similarity.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Bundles the inputs for a single retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub query_vector: &'a [f32],
    pub personality_id: &'a str,
    pub k: usize,
    pub similarity_threshold: f32,
}

/// Retrieve the top-`k` chunks of one personality's partition.
pub async fn retrieve<S: CorpusStore + ?Sized>(
    store: &S,
    req: &RetrievalRequest<'_>,
) -> Result<RetrievalResult, RetrievalError> {
    if req.k == 0 {
        return Ok(RetrievalResult::empty());
    }

    let partition = store
        .partition(req.personality_id)
        .await
        .map_err(|e| RetrievalError::Store(format!("{e:#}")))?;

    let mut scored: Vec<ScoredChunk> = Vec::new();
    for chunk in partition {
        // Defends the partition contract against a misbehaving store.
        if chunk.personality_id != req.personality_id {
            continue;
        }
        if chunk.embedding.len() != req.query_vector.len() {
            return Err(RetrievalError::DimensionMismatch {
                personality_id: req.personality_id.to_string(),
                query: req.query_vector.len(),
                corpus: chunk.embedding.len(),
            });
        }
        let score = cosine_similarity(req.query_vector, &chunk.embedding);
        if score >= req.similarity_threshold {
            scored.push(ScoredChunk { chunk, score });
        }
    }

    scored.sort_by(rank_order);
    scored.truncate(req.k);

    debug!(
        personality = req.personality_id,
        hits = scored.len(),
        threshold = req.similarity_threshold,
        "retrieval complete"
    );

    Ok(RetrievalResult { items: scored })
}

/// Score descending, then ingestion order ascending.
fn rank_order(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.chunk.seq.cmp(&b.chunk.seq))
}
