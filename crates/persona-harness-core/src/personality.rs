//! Personalities and their knowledge domains.
//!
//! A personality is a curated knowledge domain with its own corpus
//! partition and prompt templates. Domain-specific behavior is selected by
//! matching on [`Domain`], never by looking strings up in a map.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PersonaError;

/// The kind of material a personality's corpus holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Spiritual,
    Scientific,
    Historical,
    Philosophical,
}

impl Domain {
    /// Format a citation reference in the convention of the domain.
    ///
    /// | Domain | Example |
    /// |--------|---------|
    /// | Spiritual | `Bhagavad Gita 2:47` |
    /// | Scientific | `Principia §3.2` |
    /// | Historical | `Meditations, ch. 4, para. 3` |
    /// | Philosophical | `Republic, book 7, 514a` |
    pub fn format_reference(
        &self,
        source: &str,
        chapter: Option<&str>,
        verse: Option<&str>,
    ) -> String {
        match (self, chapter, verse) {
            (_, None, None) => source.to_string(),
            (Domain::Spiritual, Some(c), Some(v)) => format!("{source} {c}:{v}"),
            (Domain::Spiritual, Some(c), None) => format!("{source} {c}"),
            (Domain::Spiritual, None, Some(v)) => format!("{source} :{v}"),
            (Domain::Scientific, Some(c), Some(v)) => format!("{source} §{c}.{v}"),
            (Domain::Scientific, Some(c), None) => format!("{source} §{c}"),
            (Domain::Scientific, None, Some(v)) => format!("{source} ¶{v}"),
            (Domain::Historical, Some(c), Some(v)) => format!("{source}, ch. {c}, para. {v}"),
            (Domain::Historical, Some(c), None) => format!("{source}, ch. {c}"),
            (Domain::Historical, None, Some(v)) => format!("{source}, para. {v}"),
            (Domain::Philosophical, Some(c), Some(v)) => format!("{source}, book {c}, {v}"),
            (Domain::Philosophical, Some(c), None) => format!("{source}, book {c}"),
            (Domain::Philosophical, None, Some(v)) => format!("{source}, {v}"),
        }
    }

    /// One-line framing placed above the grounding passages in prompts.
    pub fn grounding_preamble(&self) -> &'static str {
        match self {
            Domain::Spiritual => {
                "Answer in the voice of the teacher, drawing only on these scriptural passages:"
            }
            Domain::Scientific => {
                "Answer as the scientist would, relying only on these excerpts from their work:"
            }
            Domain::Historical => {
                "Answer as the historical figure, staying faithful to these recorded passages:"
            }
            Domain::Philosophical => {
                "Answer as the philosopher, reasoning from these passages of their writings:"
            }
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Domain::Spiritual => "spiritual",
            Domain::Scientific => "scientific",
            Domain::Historical => "historical",
            Domain::Philosophical => "philosophical",
        };
        f.write_str(s)
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spiritual" => Ok(Domain::Spiritual),
            "scientific" => Ok(Domain::Scientific),
            "historical" => Ok(Domain::Historical),
            "philosophical" => Ok(Domain::Philosophical),
            other => Err(format!(
                "unknown domain '{other}': expected spiritual, scientific, historical, or philosophical"
            )),
        }
    }
}

/// Configuration of a single personality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub id: String,
    pub display_name: String,
    pub domain: Domain,
    /// Template used to build prompts for this personality.
    #[serde(default = "default_template_id")]
    pub template_id: String,
}

fn default_template_id() -> String {
    "default".to_string()
}

/// Known personalities, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PersonalityRegistry {
    profiles: HashMap<String, PersonalityProfile>,
}

impl PersonalityRegistry {
    pub fn new(profiles: impl IntoIterator<Item = PersonalityProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Result<&PersonalityProfile, PersonaError> {
        self.profiles
            .get(id)
            .ok_or_else(|| PersonaError::UnknownPersonality(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
