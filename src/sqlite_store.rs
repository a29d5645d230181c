//! SQLite-backed corpus and template repository.
//!
//! [`SqliteCorpus`] implements [`CorpusStore`] over the `chunks` table, with
//! embeddings stored as little-endian f32 BLOBs. `seq` is the table's
//! autoincrement rowid, so ingestion order survives restarts.
//!
//! [`SqliteTemplateRepository`] implements [`TemplateRepository`] over the
//! append-only `templates` table. The `(template_id, personality_id,
//! version)` primary key rejects a second writer racing for the same version.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use persona_harness_core::chunk::chunk_hash;
use persona_harness_core::embedding::{blob_to_vec, vec_to_blob};
use persona_harness_core::error::TemplateError;
use persona_harness_core::models::{Chunk, NewChunk};
use persona_harness_core::store::CorpusStore;
use persona_harness_core::template::{
    PromptTemplate, TemplateKey, TemplateRepository, VersionSelector,
};

// ============ Corpus ============

/// SQLite implementation of [`CorpusStore`].
pub struct SqliteCorpus {
    pool: SqlitePool,
}

impl SqliteCorpus {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// True when the partition already holds a chunk with this
    /// [`chunk_hash`].
    pub async fn contains_hash(&self, personality_id: &str, hash: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM chunks WHERE personality_id = ? AND hash = ?",
        )
        .bind(personality_id)
        .bind(hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let seq: i64 = row.try_get("seq")?;
    let tags_json: String = row.try_get("domain_tags_json")?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        personality_id: row.try_get("personality_id")?,
        seq: seq as u64,
        text: row.try_get("text")?,
        embedding: blob_to_vec(&blob),
        source: row.try_get("source")?,
        chapter: row.try_get("chapter")?,
        verse: row.try_get("verse")?,
        domain_tags: serde_json::from_str::<BTreeSet<String>>(&tags_json).unwrap_or_default(),
    })
}

#[async_trait]
impl CorpusStore for SqliteCorpus {
    async fn insert_chunk(&self, chunk: NewChunk) -> Result<Chunk> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE id = ?")
            .bind(&chunk.id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            bail!("chunk {} already exists; chunks are immutable", chunk.id);
        }

        let tags_json = serde_json::to_string(&chunk.domain_tags)?;
        let result = sqlx::query(
            r#"
            INSERT INTO chunks (id, personality_id, source, chapter, verse, text,
                                domain_tags_json, hash, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.personality_id)
        .bind(&chunk.source)
        .bind(&chunk.chapter)
        .bind(&chunk.verse)
        .bind(&chunk.text)
        .bind(&tags_json)
        .bind(chunk_hash(
            &chunk.source,
            chunk.chapter.as_deref(),
            chunk.verse.as_deref(),
            &chunk.text,
        ))
        .bind(chunk.embedding.len() as i64)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let seq = result.last_insert_rowid() as u64;
        Ok(chunk.into_chunk(seq))
    }

    async fn partition(&self, personality_id: &str) -> Result<Vec<Arc<Chunk>>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE personality_id = ? ORDER BY seq ASC")
            .bind(personality_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| chunk_from_row(row).map(Arc::new))
            .collect()
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Arc<Chunk>>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| chunk_from_row(&r).map(Arc::new)).transpose()
    }

    async fn partition_sizes(&self) -> Result<Vec<(String, usize)>> {
        let rows = sqlx::query(
            "SELECT personality_id, COUNT(*) AS n FROM chunks GROUP BY personality_id ORDER BY personality_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut sizes = Vec::with_capacity(rows.len());
        for row in rows {
            let n: i64 = row.try_get("n")?;
            sizes.push((row.try_get("personality_id")?, n as usize));
        }
        Ok(sizes)
    }
}

// ============ Templates ============

/// SQLite implementation of [`TemplateRepository`].
pub struct SqliteTemplateRepository {
    pool: SqlitePool,
}

impl SqliteTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn repo_err(err: impl std::fmt::Display) -> TemplateError {
    TemplateError::Repository(err.to_string())
}

fn template_from_row(row: &SqliteRow) -> Result<PromptTemplate, TemplateError> {
    let version: i64 = row.try_get("version").map_err(repo_err)?;
    let schema_json: String = row.try_get("variables_schema_json").map_err(repo_err)?;
    Ok(PromptTemplate {
        template_id: row.try_get("template_id").map_err(repo_err)?,
        personality_id: row.try_get("personality_id").map_err(repo_err)?,
        version: version as u64,
        body: row.try_get("body").map_err(repo_err)?,
        variables_schema: serde_json::from_str(&schema_json).map_err(repo_err)?,
        author: row.try_get("created_by").map_err(repo_err)?,
        created_at: row.try_get("created_at").map_err(repo_err)?,
    })
}

#[async_trait]
impl TemplateRepository for SqliteTemplateRepository {
    async fn append(&self, template: &PromptTemplate) -> Result<(), TemplateError> {
        let key = template.key();
        let latest = self.latest_version(&key).await?.unwrap_or(0);
        if template.version != latest + 1 {
            return Err(TemplateError::Repository(format!(
                "version {} of {} does not follow latest version {}",
                template.version, key, latest
            )));
        }

        let schema_json = serde_json::to_string(&template.variables_schema).map_err(repo_err)?;
        sqlx::query(
            r#"
            INSERT INTO templates (template_id, personality_id, version, body,
                                   variables_schema_json, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.template_id)
        .bind(&template.personality_id)
        .bind(template.version as i64)
        .bind(&template.body)
        .bind(&schema_json)
        .bind(&template.author)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(repo_err)?;
        Ok(())
    }

    async fn latest_version(&self, key: &TemplateKey) -> Result<Option<u64>, TemplateError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM templates WHERE template_id = ? AND personality_id = ?",
        )
        .bind(&key.template_id)
        .bind(&key.personality_id)
        .fetch_one(&self.pool)
        .await
        .map_err(repo_err)?;
        Ok(max.map(|v| v as u64))
    }

    async fn load(
        &self,
        key: &TemplateKey,
        selector: VersionSelector,
    ) -> Result<Option<PromptTemplate>, TemplateError> {
        let row = match selector {
            VersionSelector::Latest => {
                sqlx::query(
                    r#"
                    SELECT * FROM templates
                    WHERE template_id = ? AND personality_id = ?
                    ORDER BY version DESC LIMIT 1
                    "#,
                )
                .bind(&key.template_id)
                .bind(&key.personality_id)
                .fetch_optional(&self.pool)
                .await
            }
            VersionSelector::Exact(version) => {
                sqlx::query(
                    "SELECT * FROM templates WHERE template_id = ? AND personality_id = ? AND version = ?",
                )
                .bind(&key.template_id)
                .bind(&key.personality_id)
                .bind(version as i64)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(repo_err)?;
        row.map(|r| template_from_row(&r)).transpose()
    }

    async fn history(&self, key: &TemplateKey) -> Result<Vec<PromptTemplate>, TemplateError> {
        let rows = sqlx::query(
            "SELECT * FROM templates WHERE template_id = ? AND personality_id = ? ORDER BY version ASC",
        )
        .bind(&key.template_id)
        .bind(&key.personality_id)
        .fetch_all(&self.pool)
        .await
        .map_err(repo_err)?;
        rows.iter().map(template_from_row).collect()
    }
}
