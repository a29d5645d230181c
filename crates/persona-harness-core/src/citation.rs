//! Citation assembly and grounding formatting.
//!
//! Every [`Citation`] is built from a chunk in the request's
//! [`RetrievalResult`]; nothing outside the retrieval result can become a
//! citation.

use tracing::warn;

use crate::models::{Citation, RetrievalResult};
use crate::personality::Domain;

/// Marker rendered into prompts when retrieval found nothing usable.
pub const NO_GROUNDING_MARKER: &str =
    "[NO GROUNDING MATERIAL FOUND] No passages from the corpus matched this question. \
     Acknowledge the gap instead of inventing sources.";

/// Maximum snippet length, in characters.
const SNIPPET_CHARS: usize = 240;

/// Map retrieved chunks 1:1 to citations, preserving rank order.
///
/// Chunks that do not belong to `personality_id` are dropped with a
/// warning, so citations stay inside the requested partition.
pub fn assemble_citations(
    result: &RetrievalResult,
    personality_id: &str,
    domain: Domain,
) -> Vec<Citation> {
    result
        .iter()
        .filter_map(|scored| {
            let chunk = &scored.chunk;
            if chunk.personality_id != personality_id {
                warn!(
                    chunk = %chunk.id,
                    expected = personality_id,
                    found = %chunk.personality_id,
                    "dropping cross-partition chunk from citations"
                );
                return None;
            }
            Some(Citation {
                chunk_id: chunk.id.clone(),
                source: chunk.source.clone(),
                reference: domain.format_reference(
                    &chunk.source,
                    chunk.chapter.as_deref(),
                    chunk.verse.as_deref(),
                ),
                text_snippet: snippet(&chunk.text),
                chapter: chunk.chapter.clone(),
                verse: chunk.verse.clone(),
            })
        })
        .collect()
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

/// Render the grounding block that fills a template's `context` variable.
///
/// Passages are numbered in rank order so the model can cite them as
/// `[n]`. An empty result yields [`NO_GROUNDING_MARKER`].
pub fn format_grounding(result: &RetrievalResult, citations: &[Citation], domain: Domain) -> String {
    if citations.is_empty() {
        return NO_GROUNDING_MARKER.to_string();
    }

    let mut out = String::from(domain.grounding_preamble());
    out.push('\n');
    for (n, citation) in citations.iter().enumerate() {
        let text = result
            .iter()
            .find(|s| s.chunk.id == citation.chunk_id)
            .map(|s| s.chunk.text.as_str())
            .unwrap_or(citation.text_snippet.as_str());
        out.push_str(&format!("\n[{}] {}\n{}\n", n + 1, citation.reference, text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ScoredChunk};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn scored(id: &str, personality: &str, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(Chunk {
                id: id.to_string(),
                personality_id: personality.to_string(),
                seq: 0,
                text: text.to_string(),
                embedding: vec![1.0],
                source: "Bhagavad Gita".to_string(),
                chapter: Some("2".to_string()),
                verse: Some("47".to_string()),
                domain_tags: BTreeSet::new(),
            }),
            score: 0.9,
        }
    }

    #[test]
    fn test_citations_map_one_to_one() {
        let result = RetrievalResult {
            items: vec![
                scored("a", "krishna", "You have a right to your actions."),
                scored("b", "krishna", "The soul is never born."),
            ],
        };
        let citations = assemble_citations(&result, "krishna", Domain::Spiritual);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].chunk_id, "a");
        assert_eq!(citations[0].reference, "Bhagavad Gita 2:47");
        assert_eq!(citations[1].text_snippet, "The soul is never born.");
    }

    #[test]
    fn test_foreign_chunks_dropped() {
        let result = RetrievalResult {
            items: vec![scored("a", "krishna", "x"), scored("b", "buddha", "y")],
        };
        let citations = assemble_citations(&result, "krishna", Domain::Spiritual);
        let ids: Vec<&str> = citations.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_snippet_truncated() {
        let long = "x".repeat(1000);
        let result = RetrievalResult {
            items: vec![scored("a", "krishna", &long)],
        };
        let citations = assemble_citations(&result, "krishna", Domain::Spiritual);
        assert_eq!(citations[0].text_snippet.chars().count(), 240);
    }

    #[test]
    fn test_grounding_block() {
        let result = RetrievalResult {
            items: vec![scored("a", "krishna", "Perform your duty.")],
        };
        let citations = assemble_citations(&result, "krishna", Domain::Spiritual);
        let block = format_grounding(&result, &citations, Domain::Spiritual);
        assert!(block.contains("[1] Bhagavad Gita 2:47"));
        assert!(block.contains("Perform your duty."));

        let empty = format_grounding(&RetrievalResult::empty(), &[], Domain::Spiritual);
        assert_eq!(empty, NO_GROUNDING_MARKER);
    }
}
