//! Passage chunker with citation preservation.
//!
//! Ingestion feeds already-cleaned passages (one verse, paragraph, or
//! section of a source work) through [`chunk_passage`]. The chunker
//! guarantees that:
//!
//! - a chunk never spans two passages, so its source/chapter/verse
//!   metadata is exact;
//! - every piece of a split passage inherits the passage's citation
//!   metadata and domain tags;
//! - empty passages produce no chunks.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split the passage on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs until the next one would exceed `max_chars`.
//! 4. Hard-split an oversized paragraph at the last sentence end, newline,
//!    or space before the limit (in that preference order).
//!
//! ```rust
//! use persona_harness_core::chunk::{chunk_passage, Passage};
//!
//! let passage = Passage {
//!     personality_id: "krishna".into(),
//!     source: "Bhagavad Gita".into(),
//!     chapter: Some("2".into()),
//!     verse: Some("47".into()),
//!     text: "You have a right to perform your prescribed duty.".into(),
//!     domain_tags: Default::default(),
//! };
//! let drafts = chunk_passage(&passage, 700);
//! assert_eq!(drafts.len(), 1);
//! assert_eq!(drafts[0].verse.as_deref(), Some("47"));
//! ```

use std::collections::BTreeSet;

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A cleaned unit of source text with its citation metadata.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Passage {
    pub personality_id: String,
    pub source: String,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub verse: Option<String>,
    pub text: String,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
}

/// A chunk of a passage, ready to be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub personality_id: String,
    pub source: String,
    pub chapter: Option<String>,
    pub verse: Option<String>,
    pub domain_tags: BTreeSet<String>,
    /// Position of this piece within its passage, starting at 0.
    pub part: usize,
    pub text: String,
    /// [`chunk_hash`] of the citation and `text`. Ingestion skips a draft
    /// whose hash is already stored in the partition.
    pub hash: String,
}

/// Split one passage into citation-preserving chunk drafts.
pub fn chunk_passage(passage: &Passage, max_tokens: usize) -> Vec<ChunkDraft> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in passage.text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max_chars {
            pieces.extend(hard_split(trimmed, max_chars));
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(part, text)| ChunkDraft {
            personality_id: passage.personality_id.clone(),
            source: passage.source.clone(),
            chapter: passage.chapter.clone(),
            verse: passage.verse.clone(),
            domain_tags: passage.domain_tags.clone(),
            part,
            hash: chunk_hash(
                &passage.source,
                passage.chapter.as_deref(),
                passage.verse.as_deref(),
                &text,
            ),
            text,
        })
        .collect()
}

/// Split an oversized paragraph into pieces of at most `max_chars` bytes.
fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            out.push(remaining.trim().to_string());
            break;
        }
        let limit = snap_to_char_boundary(remaining, max_chars);
        let window = &remaining[..limit];
        let split = window
            .rfind(". ")
            .map(|pos| pos + 2)
            .or_else(|| window.rfind('\n').map(|pos| pos + 1))
            .or_else(|| window.rfind(' ').map(|pos| pos + 1))
            .unwrap_or(limit);
        let split = if split == 0 {
            next_char_boundary(remaining)
        } else {
            split
        };

        let piece = remaining[..split].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split..];
    }
    out.retain(|p| !p.is_empty());
    out
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

/// SHA-256 over a chunk's citation and text, hex encoded.
///
/// The same text under two references (a refrain repeated in another
/// chapter) hashes differently, so both citations survive ingestion.
pub fn chunk_hash(source: &str, chapter: Option<&str>, verse: Option<&str>, text: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [Some(source), chapter, verse] {
        match field {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update(value.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([0u8]);
    }
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(text: &str) -> Passage {
        Passage {
            personality_id: "krishna".into(),
            source: "Bhagavad Gita".into(),
            chapter: Some("2".into()),
            verse: Some("47".into()),
            text: text.into(),
            domain_tags: ["karma".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_short_passage_single_chunk() {
        let drafts = chunk_passage(&passage("Perform your duty."), 700);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].part, 0);
        assert_eq!(drafts[0].text, "Perform your duty.");
        assert_eq!(drafts[0].hash.len(), 64);
    }

    #[test]
    fn test_hash_covers_citation() {
        let text = "Whenever dharma declines, I manifest myself.";
        let gita = chunk_hash("Bhagavad Gita", Some("4"), Some("7"), text);
        assert_eq!(gita, chunk_hash("Bhagavad Gita", Some("4"), Some("7"), text));
        assert_ne!(gita, chunk_hash("Uddhava Gita", Some("11"), Some("3"), text));
        assert_ne!(gita, chunk_hash("Bhagavad Gita", Some("4"), Some("8"), text));
        assert_ne!(gita, chunk_hash("Bhagavad Gita", Some("4"), None, text));
        assert_ne!(
            chunk_hash("Gita", Some("4"), None, text),
            chunk_hash("Gita", None, Some("4"), text)
        );
    }

    #[test]
    fn test_empty_passage_yields_nothing() {
        assert!(chunk_passage(&passage(""), 700).is_empty());
        assert!(chunk_passage(&passage("  \n\n  "), 700).is_empty());
    }

    #[test]
    fn test_split_pieces_inherit_citation() {
        let text = (0..40)
            .map(|i| format!("Sentence number {i} about duty and action."))
            .collect::<Vec<_>>()
            .join(" ");
        let drafts = chunk_passage(&passage(&text), 20);
        assert!(drafts.len() > 1);
        for (i, d) in drafts.iter().enumerate() {
            assert_eq!(d.part, i);
            assert_eq!(d.source, "Bhagavad Gita");
            assert_eq!(d.chapter.as_deref(), Some("2"));
            assert_eq!(d.verse.as_deref(), Some("47"));
            assert!(d.domain_tags.contains("karma"));
            assert!(d.text.len() <= 80);
        }
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let text = "First sentence here. Second sentence follows. Third one ends it.";
        let drafts = chunk_passage(&passage(text), 6);
        assert_eq!(drafts[0].text, "First sentence here.");
    }

    #[test]
    fn test_paragraphs_accumulate_under_limit() {
        let drafts = chunk_passage(&passage("One.\n\nTwo.\n\nThree."), 700);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, "One.\n\nTwo.\n\nThree.");
    }

    #[test]
    fn test_multibyte_text() {
        let text = "कर्मण्येवाधिकारस्ते मा फलेषु कदाचन ".repeat(10);
        let drafts = chunk_passage(&passage(&text), 5);
        assert!(!drafts.is_empty());
        let rejoined: String = drafts.iter().map(|d| d.text.replace(' ', "")).collect();
        assert_eq!(rejoined, text.replace(' ', ""));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.";
        let a = chunk_passage(&passage(text), 2);
        let b = chunk_passage(&passage(text), 2);
        assert_eq!(a, b);
    }
}
