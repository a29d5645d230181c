//! SQLite-backed durable cache tier.
//!
//! Entries are stored as JSON in `cache_entries`, with `expires_at`
//! indexed so [`SqliteTier::purge_expired`] can sweep them.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::info;

use persona_harness_core::error::CacheError;
use persona_harness_core::models::CacheEntry;

use super::tier::CacheTier;
use crate::config::Config;
use crate::db;

pub struct SqliteTier {
    pool: SqlitePool,
}

impl SqliteTier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete entries that expired at or before `now`.
    pub async fn purge_expired(&self, now: i64) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, CacheError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)
    }
}

/// `persona cache purge`: drop expired durable entries.
pub async fn run_purge(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let tier = SqliteTier::new(pool);
    let removed = tier.purge_expired(chrono::Utc::now().timestamp()).await?;
    let remaining = tier.count().await?;
    info!(removed, remaining, "purged expired cache entries");
    println!("Removed {} expired entries ({} remaining).", removed, remaining);
    Ok(())
}

fn unavailable(err: impl std::fmt::Display) -> CacheError {
    CacheError::Unavailable {
        tier: "durable".to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl CacheTier for SqliteTier {
    fn name(&self) -> &str {
        "durable"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT entry_json FROM cache_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        json.map(|j| serde_json::from_str(&j).map_err(unavailable))
            .transpose()
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let json = serde_json::to_string(entry).map_err(unavailable)?;
        let ttl = i64::try_from(entry.ttl_secs).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, personality_id, template_id, template_version,
                                       entry_json, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                personality_id = excluded.personality_id,
                template_id = excluded.template_id,
                template_version = excluded.template_version,
                entry_json = excluded.entry_json,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.personality_id)
        .bind(&entry.template_id)
        .bind(entry.template_version_used as i64)
        .bind(&json)
        .bind(entry.created_at)
        .bind(entry.created_at.saturating_add(ttl))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use persona_harness_core::models::Citation;
    use tempfile::TempDir;

    async fn tier() -> (TempDir, SqliteTier) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("cache.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (dir, SqliteTier::new(pool))
    }

    fn entry(key: &str, created_at: i64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            personality_id: "krishna".into(),
            language: "en".into(),
            template_id: "default".into(),
            template_version_used: 2,
            rendered_response: "Dharma is one's duty.".into(),
            citations: vec![Citation {
                chunk_id: "c1".into(),
                source: "Bhagavad Gita".into(),
                reference: "Bhagavad Gita 2:47".into(),
                text_snippet: "You have a right to perform your prescribed duty".into(),
                chapter: Some("2".into()),
                verse: Some("47".into()),
            }],
            confidence_score: 0.82,
            created_at,
            ttl_secs: 100,
        }
    }

    #[tokio::test]
    async fn test_put_get_replace_remove() {
        let (_dir, tier) = tier().await;
        assert!(tier.get("k").await.unwrap().is_none());

        tier.put(&entry("k", 10)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some(entry("k", 10)));

        tier.put(&entry("k", 20)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap().unwrap().created_at, 20);
        assert_eq!(tier.count().await.unwrap(), 1);

        tier.remove("k").await.unwrap();
        assert!(tier.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, tier) = tier().await;
        tier.put(&entry("old", 0)).await.unwrap();
        tier.put(&entry("fresh", 500)).await.unwrap();
        assert_eq!(tier.purge_expired(200).await.unwrap(), 1);
        assert!(tier.get("fresh").await.unwrap().is_some());
    }
}
