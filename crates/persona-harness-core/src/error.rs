//! Error taxonomy shared by every stage of the request pipeline.
//!
//! Only [`PersonaError::RateLimited`] and configuration errors
//! ([`PersonaError::UnknownPersonality`]) are meant to reach a caller
//! verbatim. The other variants are recovered inside the pipeline and
//! degrade to a reduced-quality response.

use std::time::Duration;

use thiserror::Error;

/// Top-level error returned across component boundaries.
#[derive(Debug, Error)]
pub enum PersonaError {
    /// Admission denied by the rate limiter. Never retried internally.
    #[error("rate limited; retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("generation failed after {attempts} attempt(s): {message}")]
    Generation { attempts: u32, message: String },

    #[error(transparent)]
    CacheUnavailable(#[from] CacheError),

    #[error("unknown personality: {0}")]
    UnknownPersonality(String),
}

impl PersonaError {
    /// True for errors that are surfaced to the caller as-is.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            PersonaError::RateLimited { .. } | PersonaError::UnknownPersonality(_)
        )
    }
}

/// Failures while searching the corpus.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("corpus store unavailable: {0}")]
    Store(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("query vector has {query} dimensions but partition '{personality_id}' uses {corpus}")]
    DimensionMismatch {
        personality_id: String,
        query: usize,
        corpus: usize,
    },

    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),
}

/// Template lookup, publication, and rendering failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template not found: {template_id} for personality {personality_id} (version {version})")]
    NotFound {
        template_id: String,
        personality_id: String,
        version: String,
    },

    #[error("missing template variable(s): {}", .names.join(", "))]
    MissingVariable { names: Vec<String> },

    #[error("template body must not be empty")]
    EmptyBody,

    #[error("template repository error: {0}")]
    Repository(String),
}

/// A cache tier could not serve a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache tier '{tier}' unavailable: {message}")]
    Unavailable { tier: String, message: String },

    #[error("cache tier '{tier}' timed out")]
    Timeout { tier: String },
}

pub type PersonaResult<T> = std::result::Result<T, PersonaError>;
