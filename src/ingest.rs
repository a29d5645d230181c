//! Corpus ingestion.
//!
//! Reads JSON Lines passages, one per line:
//!
//! ```json
//! {"personality_id": "krishna", "source": "Bhagavad Gita", "chapter": "2", "verse": "47",
//!  "text": "You have a right to perform your prescribed duty...", "domain_tags": ["karma"]}
//! ```
//!
//! Each passage is chunked with [`chunk_passage`] (a chunk never spans two
//! passages), each chunk is embedded, and the chunk is appended to the
//! personality's partition. A chunk already stored in the partition with
//! the same text and the same source, chapter, and verse is skipped, so
//! re-running an ingest is idempotent while a line repeated under another
//! reference keeps its own citation.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use uuid::Uuid;

use persona_harness_core::chunk::{chunk_passage, Passage};
use persona_harness_core::embedding::Embedder;
use persona_harness_core::models::NewChunk;
use persona_harness_core::personality::PersonalityRegistry;
use persona_harness_core::store::CorpusStore;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::sqlite_store::SqliteCorpus;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub passages: usize,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
}

/// Parse JSONL passages, rejecting personalities that are not configured.
pub fn parse_passages(content: &str, personalities: &PersonalityRegistry) -> Result<Vec<Passage>> {
    let mut passages = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let passage: Passage = serde_json::from_str(line)
            .with_context(|| format!("Invalid passage on line {}", i + 1))?;
        if !personalities.contains(&passage.personality_id) {
            bail!(
                "Unknown personality '{}' on line {}; add it to [[personalities]] first",
                passage.personality_id,
                i + 1
            );
        }
        passages.push(passage);
    }
    Ok(passages)
}

/// Chunk, embed, and store `passages`.
pub async fn ingest_passages(
    corpus: &SqliteCorpus,
    embedder: &dyn Embedder,
    passages: &[Passage],
    max_tokens: usize,
) -> Result<IngestStats> {
    let mut stats = IngestStats {
        passages: passages.len(),
        ..Default::default()
    };

    for passage in passages {
        for draft in chunk_passage(passage, max_tokens) {
            if corpus
                .contains_hash(&draft.personality_id, &draft.hash)
                .await?
            {
                debug!(personality = %draft.personality_id, hash = %draft.hash, "chunk unchanged; skipping");
                stats.chunks_skipped += 1;
                continue;
            }

            let embedding = embedder.embed(&draft.text).await.with_context(|| {
                format!(
                    "Failed to embed chunk {} of {} ({})",
                    draft.part, draft.source, draft.personality_id
                )
            })?;

            corpus
                .insert_chunk(NewChunk {
                    id: Uuid::new_v4().to_string(),
                    personality_id: draft.personality_id,
                    text: draft.text,
                    embedding,
                    source: draft.source,
                    chapter: draft.chapter,
                    verse: draft.verse,
                    domain_tags: draft.domain_tags,
                })
                .await?;
            stats.chunks_written += 1;
        }
    }

    Ok(stats)
}

pub async fn run_ingest(config: &Config, path: &Path, dry_run: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read passages file: {}", path.display()))?;
    let personalities = PersonalityRegistry::new(config.personalities.clone());
    let passages = parse_passages(&content, &personalities)?;

    if dry_run {
        let estimated: usize = passages
            .iter()
            .map(|p| chunk_passage(p, config.chunking.max_tokens).len())
            .sum();
        println!("ingest {} (dry-run)", path.display());
        println!("  passages found: {}", passages.len());
        println!("  estimated chunks: {}", estimated);
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        bail!("Ingestion needs embeddings; set [embedding].provider (e.g. \"hash\" or \"openai\")");
    }

    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let corpus = SqliteCorpus::new(pool.clone());
    let embedder = create_embedder(&config.embedding)?;

    let stats = ingest_passages(
        &corpus,
        embedder.as_ref(),
        &passages,
        config.chunking.max_tokens,
    )
    .await?;
    info!(
        passages = stats.passages,
        written = stats.chunks_written,
        skipped = stats.chunks_skipped,
        model = embedder.model_name(),
        "ingest complete"
    );

    println!("ingest {}", path.display());
    println!("  passages: {}", stats.passages);
    println!("  chunks written: {}", stats.chunks_written);
    println!("  chunks unchanged: {}", stats.chunks_skipped);
    println!("ok");

    pool.close().await;
    Ok(())
}
