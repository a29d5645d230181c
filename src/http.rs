//! JSON-over-HTTP calls to OpenAI-compatible APIs.
//!
//! Retry strategy (shared by the embedding and generation providers):
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately with [`ClientError`]
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, Result};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A request the server refused for reasons retrying cannot fix.
#[derive(Debug, Error)]
#[error("{provider} API error {status}: {body}")]
pub struct ClientError {
    pub provider: String,
    pub status: u16,
    pub body: String,
}

/// Build a client with a per-request timeout.
pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Resolve the API key for a provider.
///
/// `openai` requires `OPENAI_API_KEY`; other OpenAI-compatible servers
/// (e.g. Ollama) accept unauthenticated requests.
pub fn api_key(provider: &str) -> Result<Option<String>> {
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) => Ok(Some(key)),
        Err(_) if provider == "openai" => Err(anyhow!("OPENAI_API_KEY environment variable not set")),
        Err(_) => Ok(None),
    }
}

/// Default base URL for a provider name.
pub fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "ollama" => "http://localhost:11434/v1",
        _ => "https://api.openai.com/v1",
    }
}

/// POST `body` to `url` and return the parsed JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(provider, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(provider, %status, attempt, "transient API error");
                    last_err = Some(anyhow!("{} API error {}: {}", provider, status, body_text));
                    continue;
                }

                return Err(ClientError {
                    provider: provider.to_string(),
                    status: status.as_u16(),
                    body: body_text,
                }
                .into());
            }
            Err(e) => {
                warn!(provider, attempt, error = %e, "request failed");
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", provider)))
}
