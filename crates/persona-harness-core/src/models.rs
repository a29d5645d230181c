//! Core data models used throughout Persona Harness.
//!
//! These types represent the chunks, citations, retrieval results, and
//! cached responses that flow through the ingestion and request pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An embedded unit of source text belonging to exactly one personality.
///
/// Chunks are immutable once stored. Re-embedding text produces a new
/// chunk with a new id; the store never rewrites an embedding in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub personality_id: String,
    /// Ingestion sequence number assigned by the store. Used as the
    /// deterministic tie-breaker for equal similarity scores.
    pub seq: u64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source: String,
    pub chapter: Option<String>,
    pub verse: Option<String>,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
}

/// A chunk awaiting insertion. The store assigns `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub id: String,
    pub personality_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source: String,
    pub chapter: Option<String>,
    pub verse: Option<String>,
    pub domain_tags: BTreeSet<String>,
}

impl NewChunk {
    pub fn into_chunk(self, seq: u64) -> Chunk {
        Chunk {
            id: self.id,
            personality_id: self.personality_id,
            seq,
            text: self.text,
            embedding: self.embedding,
            source: self.source,
            chapter: self.chapter,
            verse: self.verse,
            domain_tags: self.domain_tags,
        }
    }
}

/// A chunk paired with its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

/// Ordered retrieval output: length ≤ k, scores non-increasing.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub items: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredChunk> {
        self.items.iter()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.items.iter().map(|s| s.chunk.id.as_str()).collect()
    }

    /// Mean similarity of the retrieved chunks, clamped to `[0, 1]`.
    /// Returns `0.0` for an empty result.
    pub fn mean_score(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        let total: f64 = self.items.iter().map(|s| s.score as f64).sum();
        (total / self.items.len() as f64).clamp(0.0, 1.0)
    }
}

/// Provenance record for a passage used as grounding.
///
/// Always derived from a retrieved [`Chunk`]; `chunk_id` points back to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub source: String,
    /// Human-readable reference, formatted per personality domain
    /// (e.g. `"Bhagavad Gita 2:47"`).
    pub reference: String,
    pub text_snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verse: Option<String>,
}

/// A fully computed response stored by the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub personality_id: String,
    pub language: String,
    pub template_id: String,
    pub template_version_used: u64,
    pub rendered_response: String,
    pub citations: Vec<Citation>,
    pub confidence_score: f64,
    /// Unix timestamp (seconds) of computation.
    pub created_at: i64,
    pub ttl_secs: u64,
}

impl CacheEntry {
    /// True once `created_at + ttl` has passed.
    pub fn is_expired(&self, now: i64) -> bool {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        self.created_at.saturating_add(ttl) <= now
    }
}
