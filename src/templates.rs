//! Versioned template store with a read-through LRU cache.
//!
//! [`TemplateStore`] fronts any [`TemplateRepository`] and adds:
//!
//! - **Snapshots.** Lookups return `Arc<PromptTemplate>`, so a render that
//!   resolved "latest" stays pinned to that version even if a new one is
//!   published mid-request.
//! - **Read-through caching.** Exact versions are cached until evicted by
//!   the LRU. A resolved "latest" is cached for `latest_ttl` and dropped
//!   immediately when this store publishes a new version.
//! - **Serialized publication.** Version creation for one
//!   `(template_id, personality_id)` runs under a per-key async lock, so
//!   concurrent publishers get consecutive versions.
//! - **Watermarks.** Every publish (and every "latest" resolution) advances
//!   the shared [`VersionWatermarks`], which the response cache consults to
//!   discard entries rendered with a superseded version.
//!
//! Also hosts the `persona template ...` CLI commands.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use lru::LruCache;
use tracing::{debug, info};

use persona_harness_core::error::TemplateError;
use persona_harness_core::template::{
    parse_placeholders, render, PromptTemplate, TemplateKey, TemplateRepository,
    VersionSelector, VersionWatermarks,
};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteTemplateRepository;

struct Cached {
    template: Arc<PromptTemplate>,
    loaded_at: Instant,
}

/// Template lookups, publication, and rollback.
pub struct TemplateStore {
    repo: Arc<dyn TemplateRepository>,
    cache: Mutex<LruCache<(TemplateKey, VersionSelector), Cached>>,
    write_locks: Mutex<HashMap<TemplateKey, Arc<tokio::sync::Mutex<()>>>>,
    watermarks: VersionWatermarks,
    latest_ttl: Duration,
}

impl TemplateStore {
    pub fn new(
        repo: Arc<dyn TemplateRepository>,
        capacity: usize,
        latest_ttl: Duration,
        watermarks: VersionWatermarks,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            repo,
            cache: Mutex::new(LruCache::new(capacity)),
            write_locks: Mutex::new(HashMap::new()),
            watermarks,
            latest_ttl,
        }
    }

    pub fn watermarks(&self) -> &VersionWatermarks {
        &self.watermarks
    }

    /// Resolve a template version. "Latest" resolves at call time.
    pub async fn get_template(
        &self,
        template_id: &str,
        personality_id: &str,
        selector: VersionSelector,
    ) -> Result<Arc<PromptTemplate>, TemplateError> {
        let key = TemplateKey::new(template_id, personality_id);
        if let Some(hit) = self.cached(&key, selector) {
            return Ok(hit);
        }

        let loaded = self
            .repo
            .load(&key, selector)
            .await?
            .ok_or_else(|| TemplateError::NotFound {
                template_id: template_id.to_string(),
                personality_id: personality_id.to_string(),
                version: selector.to_string(),
            })?;
        let template = Arc::new(loaded);
        debug!(template = %key, version = template.version, %selector, "template loaded");

        if selector == VersionSelector::Latest {
            self.watermarks.advance(&key, template.version);
            self.remember_latest(&key, &template);
        }
        self.remember(&key, VersionSelector::Exact(template.version), &template);
        Ok(template)
    }

    /// Resolve "latest" for its side effect on the watermarks, so versions
    /// published by another process supersede cached responses within
    /// `latest_ttl`. Returns the resolved version, if any.
    pub async fn refresh_latest(&self, template_id: &str, personality_id: &str) -> Option<u64> {
        match self
            .get_template(template_id, personality_id, VersionSelector::Latest)
            .await
        {
            Ok(template) => Some(template.version),
            Err(err) => {
                debug!(template = template_id, personality = personality_id, error = %err, "latest template unresolved");
                None
            }
        }
    }

    /// Render `template` with `variables`. Fails on any missing variable.
    pub fn render(
        &self,
        template: &PromptTemplate,
        variables: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        render(template, variables)
    }

    /// Append a new version with `body`. Returns the stored snapshot.
    pub async fn publish(
        &self,
        template_id: &str,
        personality_id: &str,
        body: &str,
        author: &str,
    ) -> Result<Arc<PromptTemplate>, TemplateError> {
        if body.trim().is_empty() {
            return Err(TemplateError::EmptyBody);
        }
        let key = TemplateKey::new(template_id, personality_id);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let version = self.repo.latest_version(&key).await?.unwrap_or(0) + 1;
        let template = PromptTemplate {
            template_id: template_id.to_string(),
            personality_id: personality_id.to_string(),
            version,
            body: body.to_string(),
            variables_schema: parse_placeholders(body),
            author: author.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.repo.append(&template).await?;

        let template = Arc::new(template);
        self.watermarks.advance(&key, version);
        self.forget(&key, VersionSelector::Latest);
        self.remember(&key, VersionSelector::Exact(version), &template);
        info!(template = %key, version, author, "template version published");
        Ok(template)
    }

    /// Publish a new version whose body is copied from `to_version`.
    ///
    /// History is never rewritten; the rollback is itself a new version.
    pub async fn rollback(
        &self,
        template_id: &str,
        personality_id: &str,
        to_version: u64,
        author: &str,
    ) -> Result<Arc<PromptTemplate>, TemplateError> {
        let source = self
            .get_template(template_id, personality_id, VersionSelector::Exact(to_version))
            .await?;
        let published = self
            .publish(template_id, personality_id, &source.body, author)
            .await?;
        info!(
            template = %published.key(),
            from = to_version,
            version = published.version,
            "template rolled back"
        );
        Ok(published)
    }

    /// All versions, ascending.
    pub async fn history(
        &self,
        template_id: &str,
        personality_id: &str,
    ) -> Result<Vec<PromptTemplate>, TemplateError> {
        self.repo
            .history(&TemplateKey::new(template_id, personality_id))
            .await
    }

    pub async fn latest_version(
        &self,
        template_id: &str,
        personality_id: &str,
    ) -> Result<Option<u64>, TemplateError> {
        let key = TemplateKey::new(template_id, personality_id);
        let latest = self.repo.latest_version(&key).await?;
        if let Some(v) = latest {
            self.watermarks.advance(&key, v);
        }
        Ok(latest)
    }

    fn cached(&self, key: &TemplateKey, selector: VersionSelector) -> Option<Arc<PromptTemplate>> {
        let mut cache = self.cache.lock().ok()?;
        let cache_key = (key.clone(), selector);
        let fresh = match cache.get(&cache_key) {
            Some(c) if selector != VersionSelector::Latest => return Some(c.template.clone()),
            Some(c) => c.loaded_at.elapsed() < self.latest_ttl,
            None => return None,
        };
        if fresh {
            cache.get(&cache_key).map(|c| c.template.clone())
        } else {
            cache.pop(&cache_key);
            None
        }
    }

    fn remember(&self, key: &TemplateKey, selector: VersionSelector, template: &Arc<PromptTemplate>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                (key.clone(), selector),
                Cached {
                    template: template.clone(),
                    loaded_at: Instant::now(),
                },
            );
        }
    }

    /// Cache a resolved "latest" unless a newer version was published
    /// since it was loaded. The watermark is read under the cache lock, and
    /// `publish` advances it before taking that lock to forget.
    fn remember_latest(&self, key: &TemplateKey, template: &Arc<PromptTemplate>) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if self
            .watermarks
            .current(key)
            .is_some_and(|latest| latest > template.version)
        {
            debug!(template = %key, version = template.version, "superseded while loading; not cached as latest");
            return;
        }
        cache.put(
            (key.clone(), VersionSelector::Latest),
            Cached {
                template: template.clone(),
                loaded_at: Instant::now(),
            },
        );
    }

    fn forget(&self, key: &TemplateKey, selector: VersionSelector) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(&(key.clone(), selector));
        }
    }

    fn write_lock(&self, key: &TemplateKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.write_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }
}

// ============ CLI commands ============

async fn open_store(config: &Config) -> Result<TemplateStore> {
    let pool = db::connect(config).await?;
    Ok(TemplateStore::new(
        Arc::new(SqliteTemplateRepository::new(pool)),
        config.templates.cache_capacity,
        Duration::from_secs(config.templates.latest_ttl_secs),
        VersionWatermarks::new(),
    ))
}

pub async fn run_publish(
    config: &Config,
    template_id: &str,
    personality_id: &str,
    body_path: &std::path::Path,
    author: &str,
) -> Result<()> {
    let body = std::fs::read_to_string(body_path)
        .with_context(|| format!("Failed to read template body: {}", body_path.display()))?;
    let store = open_store(config).await?;
    let template = store
        .publish(template_id, personality_id, &body, author)
        .await?;
    println!(
        "published {}@{} version {}",
        template.template_id, template.personality_id, template.version
    );
    println!("  variables: {}", template.variables_schema.join(", "));
    Ok(())
}

pub async fn run_show(
    config: &Config,
    template_id: &str,
    personality_id: &str,
    selector: VersionSelector,
) -> Result<()> {
    let store = open_store(config).await?;
    let template = store
        .get_template(template_id, personality_id, selector)
        .await?;
    println!(
        "{}@{} version {} (by {}, {})",
        template.template_id,
        template.personality_id,
        template.version,
        template.author,
        format_ts(template.created_at)
    );
    println!("variables: {}", template.variables_schema.join(", "));
    println!("---");
    println!("{}", template.body);
    Ok(())
}

pub async fn run_history(config: &Config, template_id: &str, personality_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let versions = store.history(template_id, personality_id).await?;
    if versions.is_empty() {
        println!("No versions.");
        return Ok(());
    }
    for t in &versions {
        println!(
            "  v{:<4} {}  {:<16} {} chars",
            t.version,
            format_ts(t.created_at),
            t.author,
            t.body.chars().count()
        );
    }
    Ok(())
}

pub async fn run_rollback(
    config: &Config,
    template_id: &str,
    personality_id: &str,
    to_version: u64,
    author: &str,
) -> Result<()> {
    let store = open_store(config).await?;
    let template = store
        .rollback(template_id, personality_id, to_version, author)
        .await?;
    println!(
        "rolled back {}@{} to version {} as version {}",
        template.template_id, template.personality_id, to_version, template.version
    );
    Ok(())
}

/// Publish the stock template as version 1 for every configured
/// personality that has no versions yet. Returns how many were seeded.
pub async fn seed_defaults(config: &Config) -> Result<usize> {
    let store = open_store(config).await?;
    let mut seeded = 0;
    for profile in &config.personalities {
        if store
            .latest_version(&profile.template_id, &profile.id)
            .await?
            .is_some()
        {
            continue;
        }
        store
            .publish(
                &profile.template_id,
                &profile.id,
                crate::orchestrator::DEFAULT_TEMPLATE_BODY,
                "persona init",
            )
            .await?;
        info!(personality = %profile.id, template = %profile.template_id, "seeded default template");
        seeded += 1;
    }
    Ok(seeded)
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
