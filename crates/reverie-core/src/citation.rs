//! Citation Scanner
//!
//! The generator is asked to close its answer with a bracketed citation:
//! `[0, 2]` to credit the memories it used, or `[NO_CITE]` when none helped.
//! This module extracts the first such marker from free-form model text and
//! turns it into per-memory rewards.
//!
//! Parsing is deliberately forgiving about whitespace and multi-digit
//! indices, and deliberately strict about everything else: duplicates,
//! out-of-range indices, and syntactic junk all collapse to `Malformed`,
//! which the turn pipeline treats as "no learning signal this turn".

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

// ============================================================================
// TYPES
// ============================================================================

/// Parsed citation marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CitationOutcome {
    /// Explicit indices, e.g. `[0, 2]`
    Cited(Vec<usize>),
    /// Explicit `[NO_CITE]`
    NoCite,
    /// No marker found, or the marker failed validation
    Malformed,
}

/// Reward bookkeeping for one memory shown to the generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationRecord {
    /// Id of the memory this record refers to
    pub memory_id: String,
    /// Position of the memory in the injected slate
    pub turn_index: usize,
    /// Whether the generator cited it
    pub cited: bool,
    /// Reward: `+1.0` cited, `-1.0` uncited
    pub reward: f32,
}

// ============================================================================
// PARSER
// ============================================================================

/// First `[ digits/commas/spaces ]` or `[NO_CITE]` group in the text
static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*(NO_CITE|\d+(?:\s*,\s*\d+)*)\s*\]").expect("static regex"));

/// Extract the first citation marker from generator output
///
/// Returns `Malformed` when no marker is present or when the bracketed
/// indices fail validation against `slate_size` (duplicates, or any index
/// `>= slate_size`).
pub fn parse_citations(text: &str, slate_size: usize) -> CitationOutcome {
    let Some(caps) = CITATION_RE.captures(text) else {
        return CitationOutcome::Malformed;
    };
    let body = &caps[1];
    if body == "NO_CITE" {
        return CitationOutcome::NoCite;
    }

    let mut indices = Vec::new();
    for part in body.split(',') {
        match part.trim().parse::<usize>() {
            Ok(i) => indices.push(i),
            Err(_) => return CitationOutcome::Malformed,
        }
    }
    validate_citations(indices, slate_size)
}

/// Validate parsed indices against the slate: unique, each in `[0, slate_size)`
pub fn validate_citations(indices: Vec<usize>, slate_size: usize) -> CitationOutcome {
    if indices.is_empty() {
        return CitationOutcome::Malformed;
    }
    let mut seen = vec![false; slate_size];
    for &i in &indices {
        if i >= slate_size || seen[i] {
            return CitationOutcome::Malformed;
        }
        seen[i] = true;
    }
    CitationOutcome::Cited(indices)
}

/// Build per-memory reward records for the injected slate
///
/// `Cited` marks the listed slate positions `+1` and everything else `-1`;
/// `NoCite` marks the whole slate `-1`; `Malformed` yields no records, so
/// the turn contributes no gradient.
pub fn records_for_slate(outcome: &CitationOutcome, slate_ids: &[String]) -> Vec<CitationRecord> {
    match outcome {
        CitationOutcome::Cited(indices) => slate_ids
            .iter()
            .enumerate()
            .map(|(turn_index, id)| {
                let cited = indices.contains(&turn_index);
                CitationRecord {
                    memory_id: id.clone(),
                    turn_index,
                    cited,
                    reward: if cited { 1.0 } else { -1.0 },
                }
            })
            .collect(),
        CitationOutcome::NoCite => slate_ids
            .iter()
            .enumerate()
            .map(|(turn_index, id)| CitationRecord {
                memory_id: id.clone(),
                turn_index,
                cited: false,
                reward: -1.0,
            })
            .collect(),
        CitationOutcome::Malformed => Vec::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
