//! Request orchestration.
//!
//! [`Orchestrator::ask`] drives one question through the pipeline:
//!
//! ```text
//! Received → RateCheck ─┬─ Rejected (RATE_LIMITED)
//!                       └─ CacheLookup ─┬─ HitCacheServed
//!                                       └─ Retrieve → Render → ExternalGenerate → CacheStore → Served
//! ```
//!
//! Only the rate limiter and configuration errors (unknown personality)
//! reach the caller. Every other failure degrades:
//!
//! | Failure | Degradation |
//! |---------|-------------|
//! | Embedding, corpus, or retrieval timeout | Render with the "no grounding material found" marker |
//! | Template missing or unrenderable | Render the built-in fallback template |
//! | Generation exhausted its retries | Serve [`FALLBACK_RESPONSE`], never cached |
//! | Cache tier down | Skip the tier |
//!
//! The orchestrator knows nothing about transport; the HTTP server and the
//! CLI both call [`Orchestrator::ask_traced`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{error, info, warn};

use persona_harness_core::citation::{assemble_citations, format_grounding};
use persona_harness_core::embedding::Embedder;
use persona_harness_core::error::{PersonaError, RetrievalError};
use persona_harness_core::models::{CacheEntry, Citation, RetrievalResult};
use persona_harness_core::personality::{PersonalityProfile, PersonalityRegistry};
use persona_harness_core::ratelimit::{RateLimiter, Tier};
use persona_harness_core::retrieval::{retrieve, RetrievalRequest};
use persona_harness_core::store::CorpusStore;
use persona_harness_core::template::{
    parse_placeholders, render, PromptTemplate, VersionSelector, VersionWatermarks,
};

use crate::cache::{
    cache_key, CacheManager, CacheOutcome, CacheSettings, CacheTier, MemoryTier, SharedTier,
    SqliteTier,
};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generation::{complete_with_retry, create_generator, Generator, RetryPolicy};
use crate::sqlite_store::{SqliteCorpus, SqliteTemplateRepository};
use crate::templates::TemplateStore;
use crate::{db, migrate};

/// Served when generation fails for good. Personality-agnostic and never
/// cached.
pub const FALLBACK_RESPONSE: &str =
    "I'm unable to answer right now. Please try again in a little while.";

/// Body of the built-in template used when a personality's template
/// cannot be loaded or rendered.
pub const FALLBACK_TEMPLATE_BODY: &str = "You are {{personality}}. Reply in {{language}}.\n\n\
{{context}}\n\n\
Question: {{query}}\n\
Answer:";

/// Template seeded by `persona init` for personalities that have none.
pub const DEFAULT_TEMPLATE_BODY: &str = "You are {{personality}}. Speak in the first person and \
reply in {{language}}. Ground every claim in the passages below and cite them as [n]. If the \
passages do not cover the question, say so plainly.\n\n\
{{context}}\n\n\
Question: {{query}}\n\
Answer:";

// ============ Request / response ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub query: String,
    pub personality_id: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub response_text: String,
    pub citations: Vec<Citation>,
    pub personality_id: String,
    pub language: String,
    /// Mean similarity of the grounding chunks; 0 without grounding.
    pub confidence_score: f64,
    pub cache_hit: bool,
}

impl AskResponse {
    fn from_entry(entry: CacheEntry, cache_hit: bool) -> Self {
        Self {
            response_text: entry.rendered_response,
            citations: entry.citations,
            personality_id: entry.personality_id,
            language: entry.language,
            confidence_score: entry.confidence_score,
            cache_hit,
        }
    }

    fn fallback(personality_id: &str, language: &str) -> Self {
        Self {
            response_text: FALLBACK_RESPONSE.to_string(),
            citations: Vec::new(),
            personality_id: personality_id.to_string(),
            language: language.to_string(),
            confidence_score: 0.0,
            cache_hit: false,
        }
    }
}

/// Who is asking. Rate limits apply per `(user_id, ip)`.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub ip: String,
    pub tier: Tier,
}

// ============ State trace ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    RateCheck,
    Rejected,
    CacheLookup,
    HitCacheServed,
    Retrieve,
    Render,
    ExternalGenerate,
    CacheStore,
    Served,
    FallbackServed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestState::Received => "Received",
            RequestState::RateCheck => "RateCheck",
            RequestState::Rejected => "Rejected",
            RequestState::CacheLookup => "CacheLookup",
            RequestState::HitCacheServed => "HitCacheServed",
            RequestState::Retrieve => "Retrieve",
            RequestState::Render => "Render",
            RequestState::ExternalGenerate => "ExternalGenerate",
            RequestState::CacheStore => "CacheStore",
            RequestState::Served => "Served",
            RequestState::FallbackServed => "FallbackServed",
        })
    }
}

pub fn format_states(states: &[RequestState]) -> String {
    states
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// States visited by one request. Shared with the producer, which may run
/// on a detached task.
#[derive(Clone, Default)]
struct Trace(Arc<Mutex<Vec<RequestState>>>);

impl Trace {
    fn push(&self, state: RequestState) {
        if let Ok(mut states) = self.0.lock() {
            states.push(state);
        }
    }

    fn snapshot(&self) -> Vec<RequestState> {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// A response plus the states the request went through.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub response: AskResponse,
    pub states: Vec<RequestState>,
}

// ============ Orchestrator ============

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub default_k: usize,
    pub default_threshold: f32,
    pub retrieval_timeout: Duration,
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_k: config.retrieval.k,
            default_threshold: config.retrieval.similarity_threshold,
            retrieval_timeout: Duration::from_millis(config.retrieval.timeout_ms),
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            retry: RetryPolicy::from_config(&config.generation),
        }
    }
}

/// Everything the orchestrator owns. No component is global.
pub struct Components {
    pub corpus: Arc<dyn CorpusStore>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub templates: Arc<TemplateStore>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<CacheManager>,
    pub personalities: PersonalityRegistry,
    pub settings: PipelineSettings,
}

/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Components>,
}

impl Orchestrator {
    pub fn new(components: Components) -> Self {
        Self {
            inner: Arc::new(components),
        }
    }

    /// Build the SQLite-backed pipeline described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let watermarks = VersionWatermarks::new();
        let templates = Arc::new(TemplateStore::new(
            Arc::new(SqliteTemplateRepository::new(pool.clone())),
            config.templates.cache_capacity,
            Duration::from_secs(config.templates.latest_ttl_secs),
            watermarks.clone(),
        ));
        // Seed watermarks so durable entries rendered with an older
        // version are recognized as stale from the first request.
        for profile in &config.personalities {
            templates
                .latest_version(&profile.template_id, &profile.id)
                .await?;
        }

        let mut tiers: Vec<Arc<dyn CacheTier>> =
            vec![Arc::new(MemoryTier::new(config.cache.memory_capacity))];
        if config.cache.shared {
            tiers.push(Arc::new(SharedTier::new(config.cache.shared_capacity)));
        }
        if config.cache.durable {
            tiers.push(Arc::new(SqliteTier::new(pool.clone())));
        }
        let cache = Arc::new(CacheManager::new(
            tiers,
            watermarks,
            CacheSettings::from_config(&config.cache),
        ));

        Ok(Self::new(Components {
            corpus: Arc::new(SqliteCorpus::new(pool)),
            embedder: create_embedder(&config.embedding)?,
            generator: create_generator(&config.generation)?,
            templates,
            limiter: Arc::new(RateLimiter::new(
                config.rate_limits.effective_tiers(),
                config.rate_limits.idle_timeout(),
            )),
            cache,
            personalities: PersonalityRegistry::new(config.personalities.clone()),
            settings: PipelineSettings::from_config(config),
        }))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.inner.templates
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub async fn ask(&self, request: AskRequest, caller: &Caller) -> Result<AskResponse, PersonaError> {
        self.ask_traced(request, caller).await.map(|o| o.response)
    }

    /// Like [`ask`](Self::ask), also returning the visited states.
    pub async fn ask_traced(
        &self,
        request: AskRequest,
        caller: &Caller,
    ) -> Result<AskOutcome, PersonaError> {
        let trace = Trace::default();
        trace.push(RequestState::Received);

        trace.push(RequestState::RateCheck);
        if let Err(err) = self
            .inner
            .limiter
            .check(&caller.user_id, &caller.ip, caller.tier)
        {
            trace.push(RequestState::Rejected);
            info!(
                user = %caller.user_id,
                ip = %caller.ip,
                tier = %caller.tier,
                states = %format_states(&trace.snapshot()),
                "request rejected"
            );
            return Err(err);
        }

        let profile = self.inner.personalities.get(&request.personality_id)?.clone();
        let language = normalize_language(&request.language);

        // Publications from other processes reach the watermarks here, so a
        // cached answer rendered with a superseded version reads as a miss.
        self.inner
            .templates
            .refresh_latest(&profile.template_id, &profile.id)
            .await;

        trace.push(RequestState::CacheLookup);
        let key = cache_key(&request.query, &profile.id, &language);
        let producer = {
            let this = self.clone();
            let request = Arc::new(request);
            let profile = Arc::new(profile.clone());
            let language = language.clone();
            let trace = trace.clone();
            move || {
                let this = this.clone();
                let request = request.clone();
                let profile = profile.clone();
                let language = language.clone();
                let trace = trace.clone();
                async move { this.produce(&request, &profile, &language, &trace).await }
            }
        };

        let response = match self
            .inner
            .cache
            .compute_once(&key, self.inner.settings.cache_ttl, producer)
            .await
        {
            Ok(resolved) => {
                let hit = matches!(resolved.outcome, CacheOutcome::Hit { .. });
                match resolved.outcome {
                    CacheOutcome::Hit { .. } => trace.push(RequestState::HitCacheServed),
                    CacheOutcome::Computed => {
                        trace.push(RequestState::CacheStore);
                        trace.push(RequestState::Served);
                    }
                    CacheOutcome::Joined | CacheOutcome::Direct => {
                        trace.push(RequestState::Served)
                    }
                }
                AskResponse::from_entry(resolved.entry, hit)
            }
            Err(err) => {
                error!(personality = %profile.id, error = %err, "serving fallback response");
                trace.push(RequestState::FallbackServed);
                AskResponse::fallback(&profile.id, &language)
            }
        };

        let states = trace.snapshot();
        info!(
            personality = %profile.id,
            key = &key[..12],
            cache_hit = response.cache_hit,
            citations = response.citations.len(),
            states = %format_states(&states),
            "request served"
        );
        Ok(AskOutcome { response, states })
    }

    /// Retrieve → Render → ExternalGenerate. Runs at most once per key at
    /// a time, under the cache manager's single flight.
    async fn produce(
        &self,
        request: &AskRequest,
        profile: &PersonalityProfile,
        language: &str,
        trace: &Trace,
    ) -> Result<CacheEntry, PersonaError> {
        trace.push(RequestState::Retrieve);
        let result = self.ground(request, profile).await;

        trace.push(RequestState::Render);
        let citations = assemble_citations(&result, &profile.id, profile.domain);
        let context = format_grounding(&result, &citations, profile.domain);
        let variables = HashMap::from([
            ("query".to_string(), request.query.clone()),
            ("personality".to_string(), profile.display_name.clone()),
            ("context".to_string(), context),
            ("language".to_string(), language.to_string()),
        ]);
        let (prompt, version) = self.render_prompt(profile, &variables).await?;

        trace.push(RequestState::ExternalGenerate);
        let text = complete_with_retry(
            self.inner.generator.as_ref(),
            &prompt,
            &self.inner.settings.retry,
        )
        .await?;

        let confidence_score = if citations.is_empty() {
            0.0
        } else {
            result.mean_score()
        };
        Ok(CacheEntry {
            key: String::new(),
            personality_id: profile.id.clone(),
            language: language.to_string(),
            template_id: profile.template_id.clone(),
            template_version_used: version,
            rendered_response: text,
            citations,
            confidence_score,
            created_at: chrono::Utc::now().timestamp(),
            ttl_secs: self.inner.settings.cache_ttl.as_secs(),
        })
    }

    /// Embed the query and search the personality's partition. Any
    /// failure yields an empty result.
    async fn ground(&self, request: &AskRequest, profile: &PersonalityProfile) -> RetrievalResult {
        let settings = &self.inner.settings;
        let search = async {
            let vector = self
                .inner
                .embedder
                .embed(&request.query)
                .await
                .map_err(|e| RetrievalError::Embedding(format!("{e:#}")))?;
            retrieve(
                self.inner.corpus.as_ref(),
                &RetrievalRequest {
                    query_vector: &vector,
                    personality_id: &profile.id,
                    k: request.k.unwrap_or(settings.default_k),
                    similarity_threshold: request
                        .similarity_threshold
                        .unwrap_or(settings.default_threshold),
                },
            )
            .await
        };

        let err = match timeout(settings.retrieval_timeout, search).await {
            Ok(Ok(result)) => return result,
            Ok(Err(err)) => err,
            Err(_) => RetrievalError::Timeout(settings.retrieval_timeout),
        };
        warn!(personality = %profile.id, error = %err, "retrieval failed; continuing without grounding");
        RetrievalResult::empty()
    }

    /// Render the personality's latest template, falling back to the
    /// built-in template. Returns the prompt and the template version used
    /// (0 for the fallback, so any published version supersedes it).
    async fn render_prompt(
        &self,
        profile: &PersonalityProfile,
        variables: &HashMap<String, String>,
    ) -> Result<(String, u64), PersonaError> {
        let templates = &self.inner.templates;
        match templates
            .get_template(&profile.template_id, &profile.id, VersionSelector::Latest)
            .await
        {
            Ok(template) => match templates.render(&template, variables) {
                Ok(prompt) => return Ok((prompt, template.version)),
                Err(err) => error!(
                    personality = %profile.id,
                    template = %template.key(),
                    version = template.version,
                    error = %err,
                    "template render failed; using fallback template"
                ),
            },
            Err(err) => error!(
                personality = %profile.id,
                template = %profile.template_id,
                error = %err,
                "template unavailable; using fallback template"
            ),
        }

        let prompt = render(&fallback_template(&profile.id), variables)?;
        Ok((prompt, 0))
    }
}

fn fallback_template(personality_id: &str) -> PromptTemplate {
    PromptTemplate {
        template_id: "fallback".to_string(),
        personality_id: personality_id.to_string(),
        version: 0,
        body: FALLBACK_TEMPLATE_BODY.to_string(),
        variables_schema: parse_placeholders(FALLBACK_TEMPLATE_BODY),
        author: "system".to_string(),
        created_at: 0,
    }
}

fn normalize_language(language: &str) -> String {
    let trimmed = language.trim().to_lowercase();
    if trimmed.is_empty() {
        default_language()
    } else {
        trimmed
    }
}

// ============ CLI command ============

pub struct AskArgs {
    pub query: String,
    pub personality_id: String,
    pub language: String,
    pub k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub tier: Tier,
    pub user_id: String,
    pub json: bool,
}

pub async fn run_ask(config: &Config, args: AskArgs) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config).await?;
    let caller = Caller {
        user_id: args.user_id,
        ip: "local".to_string(),
        tier: args.tier,
    };
    let request = AskRequest {
        query: args.query,
        personality_id: args.personality_id,
        language: args.language,
        k: args.k,
        similarity_threshold: args.similarity_threshold,
    };
    let outcome = orchestrator.ask_traced(request, &caller).await?;
    let response = outcome.response;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.response_text);
    println!();
    if response.citations.is_empty() {
        println!("No citations.");
    } else {
        println!("Citations:");
        for (i, citation) in response.citations.iter().enumerate() {
            println!("  [{}] {}", i + 1, citation.reference);
        }
    }
    println!();
    println!(
        "confidence: {:.2}  cache: {}",
        response.confidence_score,
        if response.cache_hit { "hit" } else { "miss" }
    );
    Ok(())
}
