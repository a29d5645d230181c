//! Corpus storage abstraction.
//!
//! The [`CorpusStore`] trait defines the operations the retriever and the
//! ingestion pipeline need, enabling pluggable backends (SQLite in the app
//! crate, in-memory here).
//!
//! Chunks are grouped into personality partitions. A store must return a
//! partition's chunks in ingestion order (ascending `seq`) and must never
//! return a chunk from another partition.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, NewChunk};

/// Abstract append-only corpus backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_chunk`](CorpusStore::insert_chunk) | Append an immutable chunk, assigning its `seq` |
/// | [`partition`](CorpusStore::partition) | All chunks of one personality, in ingestion order |
/// | [`get_chunk`](CorpusStore::get_chunk) | Look up a chunk by id |
/// | [`partition_sizes`](CorpusStore::partition_sizes) | Chunk counts per personality |
#[async_trait]
pub trait CorpusStore: Send + Sync {
    /// Append a chunk. Fails if a chunk with the same id already exists.
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk>;

    /// Return every chunk of `personality_id`, ordered by ascending `seq`.
    async fn partition(&self, personality_id: &str) -> Result<Vec<Arc<Chunk>>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>>;

    /// `(personality_id, chunk_count)` pairs, sorted by personality id.
    async fn partition_sizes(&self) -> Result<Vec<(String, usize)>>;
}
