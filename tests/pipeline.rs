//! End-to-end pipeline tests over SQLite storage with scripted embedder and
//! generator implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use persona_harness::cache::{
    CacheManager, CacheSettings, CacheTier, MemoryTier, SharedTier, SqliteTier,
};
use persona_harness::generation::{Generator, RetryPolicy};
use persona_harness::ingest::ingest_passages;
use persona_harness::orchestrator::{
    AskRequest, Caller, Components, Orchestrator, PipelineSettings, RequestState,
    FALLBACK_RESPONSE,
};
use persona_harness::sqlite_store::{SqliteCorpus, SqliteTemplateRepository};
use persona_harness::templates::TemplateStore;
use persona_harness::{db, migrate};
use persona_harness_core::chunk::Passage;
use persona_harness_core::citation::NO_GROUNDING_MARKER;
use persona_harness_core::embedding::Embedder;
use persona_harness_core::error::{CacheError, PersonaError};
use persona_harness_core::models::CacheEntry;
use persona_harness_core::personality::{Domain, PersonalityProfile, PersonalityRegistry};
use persona_harness_core::ratelimit::{default_tiers, RateLimiter, Tier};
use persona_harness_core::store::CorpusStore;
use persona_harness_core::template::VersionWatermarks;

// ============ Scripted collaborators ============

/// Puts each theme on its own axis so similarity is exact.
struct ThemeEmbedder;

#[async_trait]
impl Embedder for ThemeEmbedder {
    fn model_name(&self) -> &str {
        "theme"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let t = text.to_lowercase();
        Ok(if t.contains("dharma") || t.contains("duty") {
            vec![1.0, 0.0, 0.0, 0.0]
        } else if t.contains("soul") {
            vec![0.0, 1.0, 0.0, 0.0]
        } else if t.contains("suffering") {
            vec![0.0, 0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        })
    }
}

/// Echoes the prompt back after an optional delay, counting calls. Fails
/// the first `failures` calls.
struct ScriptedGenerator {
    calls: AtomicUsize,
    delay: Duration,
    failures: usize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failures: 0,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n < self.failures {
            anyhow::bail!("upstream unavailable ({n})");
        }
        Ok(format!("ANSWER: {prompt}"))
    }
}

/// A tier whose every call fails.
struct BrokenTier;

#[async_trait]
impl CacheTier for BrokenTier {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Err(CacheError::Unavailable {
            tier: "broken".into(),
            message: "connection refused".into(),
        })
    }

    async fn put(&self, _entry: &CacheEntry) -> Result<(), CacheError> {
        Err(CacheError::Unavailable {
            tier: "broken".into(),
            message: "connection refused".into(),
        })
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

// ============ Fixture ============

struct Harness {
    _tmp: TempDir,
    pool: SqlitePool,
    corpus: Arc<SqliteCorpus>,
    templates: Arc<TemplateStore>,
    watermarks: VersionWatermarks,
    durable: Arc<SqliteTier>,
}

fn passage(personality: &str, source: &str, chapter: &str, verse: &str, text: &str) -> Passage {
    Passage {
        personality_id: personality.into(),
        source: source.into(),
        chapter: Some(chapter.into()),
        verse: Some(verse.into()),
        text: text.into(),
        domain_tags: Default::default(),
    }
}

fn profiles() -> Vec<PersonalityProfile> {
    vec![
        PersonalityProfile {
            id: "krishna".into(),
            display_name: "Krishna".into(),
            domain: Domain::Spiritual,
            template_id: "default".into(),
        },
        PersonalityProfile {
            id: "buddha".into(),
            display_name: "The Buddha".into(),
            domain: Domain::Spiritual,
            template_id: "default".into(),
        },
    ]
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("persona.sqlite"))
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();

    let corpus = Arc::new(SqliteCorpus::new(pool.clone()));
    let passages = vec![
        passage(
            "krishna",
            "Bhagavad Gita",
            "2",
            "47",
            "You have a right to perform your prescribed duty, but not to the fruits of action.",
        ),
        passage(
            "krishna",
            "Bhagavad Gita",
            "3",
            "35",
            "It is better to perform one's own dharma imperfectly than another's perfectly.",
        ),
        passage(
            "krishna",
            "Bhagavad Gita",
            "2",
            "20",
            "The soul is never born nor dies at any time.",
        ),
        passage(
            "buddha",
            "Dhammapada",
            "1",
            "5",
            "Hatred is never appeased by hatred; suffering ends through understanding.",
        ),
    ];
    let stats = ingest_passages(&corpus, &ThemeEmbedder, &passages, 300)
        .await
        .unwrap();
    assert_eq!(stats.chunks_written, 4);

    let watermarks = VersionWatermarks::new();
    let templates = Arc::new(TemplateStore::new(
        Arc::new(SqliteTemplateRepository::new(pool.clone())),
        32,
        Duration::from_secs(30),
        watermarks.clone(),
    ));
    for id in ["krishna", "buddha"] {
        templates
            .publish(
                "default",
                id,
                "v1 {{personality}} ({{language}})\n{{context}}\nQ: {{query}}",
                "test",
            )
            .await
            .unwrap();
    }

    Harness {
        _tmp: tmp,
        corpus,
        templates,
        watermarks,
        durable: Arc::new(SqliteTier::new(pool.clone())),
        pool,
    }
}

fn cache_settings() -> CacheSettings {
    CacheSettings {
        tier_timeout: Duration::from_millis(200),
        wait_timeout: Duration::from_secs(10),
        producer_timeout: Duration::from_secs(10),
    }
}

fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        default_k: 10,
        default_threshold: 0.7,
        retrieval_timeout: Duration::from_secs(5),
        cache_ttl: Duration::from_secs(3600),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
        },
    }
}

fn build(
    h: &Harness,
    generator: Arc<ScriptedGenerator>,
    tiers: Vec<Arc<dyn CacheTier>>,
) -> Orchestrator {
    build_with_templates(h, generator, tiers, h.templates.clone())
}

fn build_with_templates(
    h: &Harness,
    generator: Arc<ScriptedGenerator>,
    tiers: Vec<Arc<dyn CacheTier>>,
    templates: Arc<TemplateStore>,
) -> Orchestrator {
    Orchestrator::new(Components {
        corpus: h.corpus.clone(),
        embedder: Arc::new(ThemeEmbedder),
        generator,
        templates,
        limiter: Arc::new(RateLimiter::new(default_tiers(), Duration::from_secs(900))),
        cache: Arc::new(CacheManager::new(
            tiers,
            h.watermarks.clone(),
            cache_settings(),
        )),
        personalities: PersonalityRegistry::new(profiles()),
        settings: pipeline_settings(),
    })
}

fn default_tiers_for(h: &Harness) -> Vec<Arc<dyn CacheTier>> {
    vec![Arc::new(MemoryTier::new(64)), h.durable.clone()]
}

fn ask(query: &str, personality: &str) -> AskRequest {
    AskRequest {
        query: query.into(),
        personality_id: personality.into(),
        language: "en".into(),
        k: None,
        similarity_threshold: None,
    }
}

fn premium(user: &str) -> Caller {
    Caller {
        user_id: user.into(),
        ip: "198.51.100.4".into(),
        tier: Tier::Premium,
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_dharma_end_to_end_with_cache_hit() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    let first = orch
        .ask_traced(ask("What is dharma?", "krishna"), &premium("arjuna"))
        .await
        .unwrap();
    let response = &first.response;
    assert!(!response.cache_hit);
    assert_eq!(response.personality_id, "krishna");
    assert_eq!(response.citations.len(), 2);
    let references: Vec<&str> = response
        .citations
        .iter()
        .map(|c| c.reference.as_str())
        .collect();
    assert!(references.contains(&"Bhagavad Gita 2:47"));
    assert!(references.contains(&"Bhagavad Gita 3:35"));
    assert!((response.confidence_score - 1.0).abs() < 1e-6);
    assert!(response.response_text.starts_with("ANSWER: v1 Krishna (en)"));
    assert!(response.response_text.contains("Q: What is dharma?"));
    assert_eq!(first.states.last(), Some(&RequestState::Served));

    // Casing and spacing differences map to the same cache key.
    let second = orch
        .ask_traced(ask("  what IS   dharma? ", "krishna"), &premium("arjuna"))
        .await
        .unwrap();
    assert!(second.response.cache_hit);
    assert_eq!(second.response.response_text, response.response_text);
    assert_eq!(second.response.citations, response.citations);
    assert_eq!(second.states.last(), Some(&RequestState::HitCacheServed));
    assert_eq!(generator.calls(), 1);

    // The durable tier holds the entry too.
    assert_eq!(h.durable.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_twenty_one_anonymous_calls_hit_the_limit() {
    let h = harness().await;
    let orch = build(&h, Arc::new(ScriptedGenerator::new()), default_tiers_for(&h));
    let caller = Caller {
        user_id: "anonymous".into(),
        ip: "203.0.113.50".into(),
        tier: Tier::Anonymous,
    };

    let mut admitted = 0;
    let mut last = None;
    for i in 0..21 {
        let result = orch
            .ask(ask(&format!("What is dharma? #{i}"), "krishna"), &caller)
            .await;
        if result.is_ok() {
            admitted += 1;
        }
        last = Some(result);
    }

    // Burst of 5; refill at 20/300s adds nothing within the test's runtime.
    assert_eq!(admitted, 5);
    match last.unwrap() {
        Err(PersonaError::RateLimited { retry_after }) => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("21st call should be rate limited, got {other:?}"),
    }

    // Other callers are unaffected.
    let other = Caller {
        ip: "203.0.113.51".into(),
        ..caller
    };
    assert!(orch.ask(ask("What is dharma?", "krishna"), &other).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_identical_requests_compute_once() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator {
        delay: Duration::from_millis(150),
        ..ScriptedGenerator::new()
    });
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    let mut handles = Vec::new();
    for i in 0..20 {
        let orch = orch.clone();
        handles.push(tokio::spawn(async move {
            orch.ask(ask("What is dharma?", "krishna"), &premium(&format!("user-{i}")))
                .await
        }));
    }

    let mut texts = Vec::new();
    for handle in handles {
        texts.push(handle.await.unwrap().unwrap().response_text);
    }
    assert_eq!(generator.calls(), 1);
    assert!(texts.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(orch.cache().in_flight(), 0);
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    // Only Krishna's partition has dharma passages.
    let response = orch
        .ask(ask("What is dharma?", "buddha"), &premium("u"))
        .await
        .unwrap();
    assert!(response.citations.is_empty());
    assert_eq!(response.confidence_score, 0.0);
    assert!(generator.last_prompt().contains(NO_GROUNDING_MARKER));

    let response = orch
        .ask(ask("Why is there suffering?", "buddha"), &premium("u"))
        .await
        .unwrap();
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].source, "Dhammapada");
}

#[tokio::test]
async fn test_citations_come_from_retrieved_partition() {
    let h = harness().await;
    let orch = build(&h, Arc::new(ScriptedGenerator::new()), default_tiers_for(&h));

    let response = orch
        .ask(ask("Tell me about the soul", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert_eq!(response.citations.len(), 1);

    let partition = h.corpus.partition("krishna").await.unwrap();
    for citation in &response.citations {
        let chunk = partition
            .iter()
            .find(|c| c.id == citation.chunk_id)
            .expect("citation must reference a retrieved chunk");
        assert!(chunk.text.starts_with(&citation.text_snippet));
        assert_eq!(chunk.personality_id, "krishna");
    }
}

#[tokio::test]
async fn test_publishing_new_version_invalidates_cached_answers() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    let first = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(first.response_text.contains("v1 Krishna"));

    h.templates
        .publish(
            "default",
            "krishna",
            "v2 Speak as {{personality}}.\n{{context}}\nQ: {{query}} ({{language}})",
            "editor",
        )
        .await
        .unwrap();

    let second = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(!second.cache_hit);
    assert!(second.response_text.contains("v2 Speak as Krishna."));
    assert_eq!(generator.calls(), 2);

    // The v2 answer is now the cached one.
    let third = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(third.cache_hit);
    assert_eq!(third.response_text, second.response_text);
}

#[tokio::test]
async fn test_publish_from_another_process_invalidates_cached_answers() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let templates = Arc::new(TemplateStore::new(
        Arc::new(SqliteTemplateRepository::new(h.pool.clone())),
        32,
        Duration::from_millis(50),
        h.watermarks.clone(),
    ));
    let orch = build_with_templates(&h, generator.clone(), default_tiers_for(&h), templates);

    let first = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(first.response_text.contains("v1 Krishna"));
    let second = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(second.cache_hit);

    // `persona template publish` opens its own store on the same database.
    let cli = TemplateStore::new(
        Arc::new(SqliteTemplateRepository::new(h.pool.clone())),
        32,
        Duration::from_secs(30),
        VersionWatermarks::new(),
    );
    cli.publish(
        "default",
        "krishna",
        "v2 Speak as {{personality}}.\n{{context}}\nQ: {{query}} ({{language}})",
        "editor",
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let third = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(!third.cache_hit);
    assert!(third.response_text.contains("v2 Speak as Krishna."));
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn test_rollback_appends_and_is_used() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    h.templates
        .publish("default", "krishna", "v2 {{query}} {{context}}", "editor")
        .await
        .unwrap();
    let rolled = h
        .templates
        .rollback("default", "krishna", 1, "editor")
        .await
        .unwrap();
    assert_eq!(rolled.version, 3);

    let history = h.templates.history("default", "krishna").await.unwrap();
    let versions: Vec<u64> = history.iter().map(|t| t.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(history[2].body, history[0].body);

    let response = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(response.response_text.contains("v1 Krishna (en)"));
}

#[tokio::test]
async fn test_failing_cache_tier_never_fails_a_request() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator::new());
    let orch = build(
        &h,
        generator.clone(),
        vec![Arc::new(BrokenTier), Arc::new(MemoryTier::new(16))],
    );

    let first = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.citations.len(), 2);

    let second = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_generation_retries_then_succeeds() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator {
        failures: 2,
        ..ScriptedGenerator::new()
    });
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    let response = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(response.response_text.starts_with("ANSWER:"));
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn test_exhausted_generation_serves_uncached_fallback() {
    let h = harness().await;
    let generator = Arc::new(ScriptedGenerator {
        failures: usize::MAX,
        ..ScriptedGenerator::new()
    });
    let orch = build(&h, generator.clone(), default_tiers_for(&h));

    let outcome = orch
        .ask_traced(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert_eq!(outcome.response.response_text, FALLBACK_RESPONSE);
    assert!(outcome.response.citations.is_empty());
    assert_eq!(outcome.states.last(), Some(&RequestState::FallbackServed));
    // One attempt plus two retries.
    assert_eq!(generator.calls(), 3);

    // Nothing was cached, so the next request tries again.
    let again = orch
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(!again.cache_hit);
    assert_eq!(generator.calls(), 6);
    assert_eq!(h.durable.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_shared_tier_serves_other_instances() {
    let h = harness().await;
    let shared = SharedTier::new(64);

    let gen_a = Arc::new(ScriptedGenerator::new());
    let gen_b = Arc::new(ScriptedGenerator::new());
    let a = build(
        &h,
        gen_a.clone(),
        vec![Arc::new(MemoryTier::new(16)), Arc::new(shared.clone())],
    );
    let b = build(
        &h,
        gen_b.clone(),
        vec![Arc::new(MemoryTier::new(16)), Arc::new(shared.clone())],
    );

    let from_a = a
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    let from_b = b
        .ask(ask("What is dharma?", "krishna"), &premium("u"))
        .await
        .unwrap();
    assert!(from_b.cache_hit);
    assert_eq!(from_b.response_text, from_a.response_text);
    assert_eq!(gen_a.calls(), 1);
    assert_eq!(gen_b.calls(), 0);
    assert_eq!(shared.len(), 1);
}

#[tokio::test]
async fn test_unknown_personality_is_reported() {
    let h = harness().await;
    let orch = build(&h, Arc::new(ScriptedGenerator::new()), default_tiers_for(&h));
    let err = orch
        .ask(ask("Who are you?", "zeus"), &premium("u"))
        .await
        .unwrap_err();
    assert!(matches!(err, PersonaError::UnknownPersonality(id) if id == "zeus"));
}
