//! Versioned prompt templates.
//!
//! Templates are stored in an append-only log indexed by
//! `(template_id, personality_id) -> version -> body`. Publishing never
//! mutates an existing version; "latest" is derived from the index at read
//! time rather than kept as a mutable pointer.
//!
//! # Placeholder syntax
//!
//! `{{name}}`, where `name` is ASCII alphanumeric or `_`. Whitespace inside
//! the braces is ignored (`{{ query }}`). Anything else between `{{` and
//! `}}` is left as literal text.
//!
//! ```rust
//! use std::collections::HashMap;
//! use persona_harness_core::template::{parse_placeholders, render_body};
//!
//! let body = "Q: {{query}}\n{{ context }}";
//! assert_eq!(parse_placeholders(body), vec!["query", "context"]);
//!
//! let mut vars = HashMap::new();
//! vars.insert("query".to_string(), "What is dharma?".to_string());
//! vars.insert("context".to_string(), "[1] ...".to_string());
//! assert_eq!(render_body(body, &vars).unwrap(), "Q: What is dharma?\n[1] ...");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// One immutable version of a prompt template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template_id: String,
    pub personality_id: String,
    pub version: u64,
    pub body: String,
    /// Placeholder names the body requires, in order of first appearance.
    pub variables_schema: Vec<String>,
    #[serde(rename = "created_by")]
    pub author: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl PromptTemplate {
    pub fn key(&self) -> TemplateKey {
        TemplateKey::new(&self.template_id, &self.personality_id)
    }
}

/// Identifies a template lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey {
    pub template_id: String,
    pub personality_id: String,
}

impl TemplateKey {
    pub fn new(template_id: &str, personality_id: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            personality_id: personality_id.to_string(),
        }
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.template_id, self.personality_id)
    }
}

/// Which version of a template to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionSelector {
    Latest,
    Exact(u64),
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Exact(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for VersionSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(VersionSelector::Latest);
        }
        s.parse::<u64>()
            .map(VersionSelector::Exact)
            .map_err(|_| format!("invalid template version '{s}': expected 'latest' or a number"))
    }
}

// ============ Parsing & rendering ============

/// A `{{name}}` occurrence: byte range of the whole token and the name.
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn scan(body: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while let Some(open) = body[cursor..].find("{{") {
        let start = cursor + open;
        let inner_start = start + 2;
        let Some(close) = body[inner_start..].find("}}") else {
            break;
        };
        let inner_end = inner_start + close;
        let name = body[inner_start..inner_end].trim();
        if is_valid_name(name) {
            found.push(Placeholder {
                start,
                end: inner_end + 2,
                name,
            });
            cursor = inner_end + 2;
        } else {
            cursor = start + 1;
        }
    }
    found
}

/// Unique placeholder names in order of first appearance.
pub fn parse_placeholders(body: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for p in scan(body) {
        if !names.iter().any(|n| n == p.name) {
            names.push(p.name.to_string());
        }
    }
    names
}

/// Substitute every placeholder in `body`.
///
/// Fails with [`TemplateError::MissingVariable`] listing every placeholder
/// without a value; no partially rendered output is ever returned.
pub fn render_body(body: &str, variables: &HashMap<String, String>) -> Result<String, TemplateError> {
    let placeholders = scan(body);

    let mut missing: Vec<String> = placeholders
        .iter()
        .filter(|p| !variables.contains_key(p.name))
        .map(|p| p.name.to_string())
        .collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(TemplateError::MissingVariable { names: missing });
    }

    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;
    for p in &placeholders {
        out.push_str(&body[cursor..p.start]);
        out.push_str(&variables[p.name]);
        cursor = p.end;
    }
    out.push_str(&body[cursor..]);
    Ok(out)
}

/// Render a template, validating its `variables_schema` first.
pub fn render(
    template: &PromptTemplate,
    variables: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    let mut missing: Vec<String> = template
        .variables_schema
        .iter()
        .filter(|name| !variables.contains_key(name.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(TemplateError::MissingVariable { names: missing });
    }
    render_body(&template.body, variables)
}

// ============ Append-only log ============

/// Append-only arena of template versions.
///
/// `entries` is never reordered or truncated; `index` maps each key to the
/// positions of its versions in ascending version order.
#[derive(Debug, Default)]
pub struct TemplateLog {
    entries: Vec<Arc<PromptTemplate>>,
    index: HashMap<TemplateKey, Vec<usize>>,
}

impl TemplateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next version of a lineage.
    ///
    /// The version must be exactly one past the current latest (or `1` for
    /// a new lineage).
    pub fn append(&mut self, template: PromptTemplate) -> Result<Arc<PromptTemplate>, TemplateError> {
        let key = template.key();
        let expected = self.latest_version(&key).unwrap_or(0) + 1;
        if template.version != expected {
            return Err(TemplateError::Repository(format!(
                "version {} of {} is out of sequence (expected {})",
                template.version, key, expected
            )));
        }
        let stored = Arc::new(template);
        self.entries.push(stored.clone());
        self.index.entry(key).or_default().push(self.entries.len() - 1);
        Ok(stored)
    }

    pub fn latest_version(&self, key: &TemplateKey) -> Option<u64> {
        self.latest(key).map(|t| t.version)
    }

    pub fn latest(&self, key: &TemplateKey) -> Option<Arc<PromptTemplate>> {
        self.index
            .get(key)
            .and_then(|positions| positions.last())
            .map(|&i| self.entries[i].clone())
    }

    pub fn get(&self, key: &TemplateKey, selector: VersionSelector) -> Option<Arc<PromptTemplate>> {
        match selector {
            VersionSelector::Latest => self.latest(key),
            VersionSelector::Exact(v) => self.index.get(key).and_then(|positions| {
                positions
                    .iter()
                    .map(|&i| &self.entries[i])
                    .find(|t| t.version == v)
                    .cloned()
            }),
        }
    }

    pub fn history(&self, key: &TemplateKey) -> Vec<Arc<PromptTemplate>> {
        self.index
            .get(key)
            .map(|positions| positions.iter().map(|&i| self.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============ Repository ============

/// Persistence backend for template versions.
///
/// Implementations only append; callers serialize appends per key.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn append(&self, template: &PromptTemplate) -> Result<(), TemplateError>;

    async fn latest_version(&self, key: &TemplateKey) -> Result<Option<u64>, TemplateError>;

    async fn load(
        &self,
        key: &TemplateKey,
        selector: VersionSelector,
    ) -> Result<Option<PromptTemplate>, TemplateError>;

    /// All versions, ascending.
    async fn history(&self, key: &TemplateKey) -> Result<Vec<PromptTemplate>, TemplateError>;
}

/// [`TemplateRepository`] over an in-memory [`TemplateLog`].
#[derive(Default)]
pub struct InMemoryTemplateRepository {
    log: RwLock<TemplateLog>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> TemplateError {
    TemplateError::Repository("template log lock poisoned".to_string())
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn append(&self, template: &PromptTemplate) -> Result<(), TemplateError> {
        let mut log = self.log.write().map_err(|_| poisoned())?;
        log.append(template.clone())?;
        Ok(())
    }

    async fn latest_version(&self, key: &TemplateKey) -> Result<Option<u64>, TemplateError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log.latest_version(key))
    }

    async fn load(
        &self,
        key: &TemplateKey,
        selector: VersionSelector,
    ) -> Result<Option<PromptTemplate>, TemplateError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log.get(key, selector).map(|t| t.as_ref().clone()))
    }

    async fn history(&self, key: &TemplateKey) -> Result<Vec<PromptTemplate>, TemplateError> {
        let log = self.log.read().map_err(|_| poisoned())?;
        Ok(log.history(key).iter().map(|t| t.as_ref().clone()).collect())
    }
}

// ============ Version watermarks ============

/// Latest published version per template lineage, shared between the
/// template store (writer) and the response cache (reader).
///
/// A cached response computed with version `v` is stale once the
/// watermark for its lineage exceeds `v`.
#[derive(Debug, Clone, Default)]
pub struct VersionWatermarks {
    inner: Arc<RwLock<HashMap<TemplateKey, u64>>>,
}

impl VersionWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the watermark for `key` to `version`. Never lowers it.
    pub fn advance(&self, key: &TemplateKey, version: u64) {
        if let Ok(mut map) = self.inner.write() {
            let current = map.entry(key.clone()).or_insert(0);
            if version > *current {
                *current = version;
            }
        }
    }

    pub fn current(&self, key: &TemplateKey) -> Option<u64> {
        self.inner.read().ok().and_then(|map| map.get(key).copied())
    }

    /// True when a newer version than `version` has been published.
    pub fn is_superseded(&self, template_id: &str, personality_id: &str, version: u64) -> bool {
        self.current(&TemplateKey::new(template_id, personality_id))
            .map(|latest| latest > version)
            .unwrap_or(false)
    }
}
