//! Text generation providers and the retry policy around them.
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledGenerator`]: every call fails, so requests get the canned fallback |
//! | `"echo"` | [`EchoGenerator`]: returns the rendered prompt (offline runs, tests) |
//! | `"openai"` / `"ollama"` | [`OpenAIGenerator`] via `POST {url}/chat/completions` |
//!
//! # Retry policy
//!
//! [`complete_with_retry`] makes up to `1 + max_retries` attempts, each
//! bounded by `attempt_timeout`. Before retry `n` it sleeps
//! `min(base * 2^(n-1), max) + jitter`, with jitter uniform in
//! `[0, base]`. A [`ClientError`] (HTTP 4xx other than 429) stops
//! retrying at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use persona_harness_core::error::PersonaError;

use crate::config::GenerationConfig;
use crate::http::{self, ClientError};

/// Produces the response text for a rendered prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

// ============ Providers ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }
}

/// Chat-completions client for OpenAI-compatible APIs.
///
/// HTTP-level retries are left to [`complete_with_retry`], so the client
/// itself makes a single request per call.
pub struct OpenAIGenerator {
    provider: String,
    model: String,
    url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for {} provider", config.provider))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| http::default_base_url(&config.provider).to_string());
        Ok(Self {
            provider: config.provider.clone(),
            model,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key: http::api_key(&config.provider)?,
            temperature: config.temperature,
            client: http::client(Duration::from_secs(config.timeout_secs))?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        let json = http::post_json(
            &self.client,
            &self.provider,
            &self.url,
            self.api_key.as_deref(),
            &body,
            0,
        )
        .await?;
        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].message.content"))
}

/// Create the configured [`Generator`].
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "echo" => Ok(Arc::new(EchoGenerator)),
        "openai" | "ollama" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

// ============ Retry ============

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            attempt_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Backoff before retry `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms))
    }
}

/// Call `generator` under `policy`. Exhaustion yields
/// [`PersonaError::Generation`].
pub async fn complete_with_retry(
    generator: &dyn Generator,
    prompt: &str,
    policy: &RetryPolicy,
) -> Result<String, PersonaError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.attempt_timeout, generator.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("attempt timed out after {:?}", policy.attempt_timeout)),
        };

        let err = match outcome {
            Ok(text) => {
                debug!(model = generator.model_name(), attempt, "generation succeeded");
                return Ok(text);
            }
            Err(err) => err,
        };

        let permanent = err.downcast_ref::<ClientError>().is_some();
        if permanent || attempt > policy.max_retries {
            warn!(model = generator.model_name(), attempt, error = %err, "generation failed");
            return Err(PersonaError::Generation {
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let delay = policy.delay_for_attempt(attempt) + policy.jitter();
        warn!(
            model = generator.model_name(),
            attempt,
            ?delay,
            error = %err,
            "generation attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Generator for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                bail!("transient failure {n}");
            }
            Ok(format!("answer to {prompt}"))
        }
    }

    struct Refusing;

    #[async_trait]
    impl Generator for Refusing {
        fn model_name(&self) -> &str {
            "refusing"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(ClientError {
                provider: "openai".into(),
                status: 400,
                body: "bad request".into(),
            }
            .into())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_bounded_by_base() {
        let policy = fast_policy(1);
        for _ in 0..100 {
            assert!(policy.jitter() <= policy.base_delay);
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let generator = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let text = complete_with_retry(&generator, "dharma", &fast_policy(2)).await.unwrap();
        assert_eq!(text, "answer to dharma");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let generator = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retry(&generator, "x", &fast_policy(2)).await.unwrap_err();
        match err {
            PersonaError::Generation { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let err = complete_with_retry(&Refusing, "x", &fast_policy(5)).await.unwrap_err();
        assert!(matches!(err, PersonaError::Generation { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        struct Stalled;

        #[async_trait]
        impl Generator for Stalled {
            fn model_name(&self) -> &str {
                "stalled"
            }

            async fn complete(&self, _prompt: &str) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            }
        }

        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy(1)
        };
        let err = complete_with_retry(&Stalled, "x", &policy).await.unwrap_err();
        assert!(matches!(err, PersonaError::Generation { attempts: 2, .. }));
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Dharma is duty."}}]
        });
        assert_eq!(parse_completion(&json).unwrap(), "Dharma is duty.");
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }
}
