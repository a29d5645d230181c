//! In-memory [`CorpusStore`] implementation for tests and embedded use.
//!
//! Partitions live in a `HashMap` behind a single `std::sync::RwLock`.
//! Reads clone the partition's `Arc<Chunk>` handles and release the lock
//! before any similarity work happens.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Chunk, NewChunk};

use super::CorpusStore;

#[derive(Default)]
struct Partitions {
    by_personality: HashMap<String, Vec<Arc<Chunk>>>,
    by_id: HashMap<String, Arc<Chunk>>,
    next_seq: u64,
}

/// In-memory corpus store.
#[derive(Default)]
pub struct InMemoryCorpus {
    inner: RwLock<Partitions>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorpusStore for InMemoryCorpus {
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| anyhow!("corpus lock poisoned"))?;
        if inner.by_id.contains_key(&chunk.id) {
            bail!("chunk {} already exists; chunks are immutable", chunk.id);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let stored = Arc::new(chunk.into_chunk(seq));
        inner.by_id.insert(stored.id.clone(), stored.clone());
        inner
            .by_personality
            .entry(stored.personality_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored.as_ref().clone())
    }

    async fn partition(&self, personality_id: &str) -> Result<Vec<Arc<Chunk>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| anyhow!("corpus lock poisoned"))?;
        Ok(inner
            .by_personality
            .get(personality_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| anyhow!("corpus lock poisoned"))?;
        Ok(inner.by_id.get(id).cloned())
    }

    async fn partition_sizes(&self) -> Result<Vec<(String, usize)>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| anyhow!("corpus lock poisoned"))?;
        let mut sizes: Vec<(String, usize)> = inner
            .by_personality
            .iter()
            .map(|(p, chunks)| (p.clone(), chunks.len()))
            .collect();
        sizes.sort();
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn new_chunk(id: &str, personality: &str) -> NewChunk {
        NewChunk {
            id: id.to_string(),
            personality_id: personality.to_string(),
            text: format!("text of {id}"),
            embedding: vec![1.0, 0.0],
            source: "Source".to_string(),
            chapter: None,
            verse: None,
            domain_tags: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_seq() {
        let store = InMemoryCorpus::new();
        let a = store.insert_chunk(new_chunk("a", "krishna")).await.unwrap();
        let b = store.insert_chunk(new_chunk("b", "buddha")).await.unwrap();
        let c = store.insert_chunk(new_chunk("c", "krishna")).await.unwrap();
        assert!(a.seq < b.seq && b.seq < c.seq);

        let part = store.partition("krishna").await.unwrap();
        let ids: Vec<&str> = part.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryCorpus::new();
        store.insert_chunk(new_chunk("a", "krishna")).await.unwrap();
        let err = store
            .insert_chunk(new_chunk("a", "krishna"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));
    }

    #[tokio::test]
    async fn test_unknown_partition_is_empty() {
        let store = InMemoryCorpus::new();
        assert!(store.partition("nobody").await.unwrap().is_empty());
        assert!(store.get_chunk("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partition_sizes_sorted() {
        let store = InMemoryCorpus::new();
        store.insert_chunk(new_chunk("a", "socrates")).await.unwrap();
        store.insert_chunk(new_chunk("b", "krishna")).await.unwrap();
        store.insert_chunk(new_chunk("c", "krishna")).await.unwrap();
        let sizes = store.partition_sizes().await.unwrap();
        assert_eq!(
            sizes,
            vec![("krishna".to_string(), 2), ("socrates".to_string(), 1)]
        );
    }
}
