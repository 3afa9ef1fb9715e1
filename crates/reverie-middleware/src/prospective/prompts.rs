//! Extraction & Merge Prompts
//!
//! Prompt text and the tolerant parsers for what comes back. Generators
//! wrap JSON in code fences, return empty text with structured content,
//! or answer `NO_TRAIT` when a dialogue holds nothing worth keeping; all
//! of that is normal input here, and anything beyond it degrades to a
//! no-op rather than an error.

use serde_json::Value;

use reverie_core::state::{BufferedMessage, MessageBuffer};

// ============================================================================
// PROMPTS
// ============================================================================

/// System prompt for the extraction call
pub const EXTRACTION_PROMPT: &str = "\
You distill long-term memories from a dialogue between SPEAKER_1 (the user) \
and SPEAKER_2 (the assistant).

Extract personal facts, stable preferences, and life details about SPEAKER_1 \
that would still matter in a future conversation. Ignore chit-chat, one-off \
logistics, and anything about SPEAKER_2.

Respond with JSON of the form:
{\"extracted_memories\": [{\"summary\": \"<one self-contained sentence>\", \
\"reference\": [<turn numbers the fact came from>]}]}

If the dialogue contains nothing worth remembering, respond with NO_TRAIT.";

/// System prompt for the merge-or-add decision call
pub const MERGE_PROMPT: &str = "\
You maintain a deduplicated memory store. You are given a candidate memory \
and a numbered list of the most similar stored memories.

Decide what to do with the candidate:
- If it is genuinely new information, emit {\"action\": \"add\"}.
- If it restates or extends stored memory N, emit {\"action\": \"merge\", \
\"index\": N, \"merged_summary\": \"<one sentence combining both>\"}.

Respond with JSON of the form {\"actions\": [...]}. Emit several actions \
when the candidate touches several stored memories.";

// ============================================================================
// DIALOGUE FORMATTING
// ============================================================================

/// Render the buffered dialogue for the extraction prompt
///
/// One line per message: `Turn <n>: SPEAKER_1: ...` for the user,
/// `SPEAKER_2` for the assistant. System messages are not part of the
/// dialogue and are skipped.
pub fn format_dialogue(buffer: &MessageBuffer) -> String {
    let mut out = String::new();
    for message in &buffer.messages {
        if let Some(line) = format_message(message) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

fn format_message(message: &BufferedMessage) -> Option<String> {
    use reverie_core::provider::MessageRole;
    let speaker = match message.role {
        MessageRole::User => "SPEAKER_1",
        MessageRole::Assistant => "SPEAKER_2",
        MessageRole::System => return None,
    };
    Some(format!("Turn {}: {speaker}: {}", message.turn, message.content))
}

/// The buffered messages belonging to the given turns, re-rendered
///
/// Used as the provenance (`raw_dialogue`) of an extracted memory. Falls
/// back to the whole dialogue when the referenced turns match nothing.
pub fn dialogue_for_turns(buffer: &MessageBuffer, turns: &[usize]) -> String {
    let mut out = String::new();
    for message in &buffer.messages {
        if !turns.contains(&message.turn) {
            continue;
        }
        if let Some(line) = format_message(message) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    if out.is_empty() {
        return format_dialogue(buffer);
    }
    out
}

// ============================================================================
// EXTRACTION PARSING
// ============================================================================

/// One memory the extractor proposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMemory {
    /// Self-contained summary sentence
    pub summary: String,
    /// Turn ordinals the fact was stated in
    pub reference: Vec<usize>,
}

/// Parse the extraction response
///
/// `None` means the response was unusable (the pipeline no-ops);
/// `Some(empty)` means an explicit `NO_TRAIT`.
pub fn parse_extraction(text: &str) -> Option<Vec<ExtractedMemory>> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return None;
    }
    if body == "NO_TRAIT" {
        return Some(Vec::new());
    }

    let value: Value = serde_json::from_str(body).ok()?;
    if value.get("NO_TRAIT").is_some() {
        return Some(Vec::new());
    }
    let memories = value.get("extracted_memories")?;
    if memories.as_str() == Some("NO_TRAIT") {
        return Some(Vec::new());
    }

    let items = memories.as_array()?;
    let mut extracted = Vec::with_capacity(items.len());
    for item in items {
        let Some(summary) = item.get("summary").and_then(Value::as_str) else {
            continue;
        };
        if summary.trim().is_empty() {
            continue;
        }
        let reference = item
            .get("reference")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_u64)
                    .map(|t| t as usize)
                    .collect()
            })
            .unwrap_or_default();
        extracted.push(ExtractedMemory {
            summary: summary.trim().to_string(),
            reference,
        });
    }
    Some(extracted)
}

// ============================================================================
// MERGE PARSING
// ============================================================================

/// One decision from the merge call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Store the candidate as a new memory
    Add,
    /// Replace the similar memory at `index` with the merged summary
    Merge {
        /// Position in the similar-memories list shown to the model
        index: usize,
        /// Combined summary for the replacement entry
        merged_summary: String,
    },
}

/// Parse the merge response against the similar-list length
///
/// Unusable responses yield no actions; individual actions with an
/// out-of-bounds index or a missing merged summary are discarded with a
/// warning while the rest survive.
pub fn parse_merge_actions(text: &str, similar_count: usize) -> Vec<MergeAction> {
    let body = strip_code_fences(text);
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        tracing::warn!("merge decision was not JSON; skipping candidate");
        return Vec::new();
    };

    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("actions").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            // A single bare action object is accepted too
            None => std::slice::from_ref(&value),
        },
        _ => {
            tracing::warn!("merge decision had no actions; skipping candidate");
            return Vec::new();
        }
    };

    let mut actions = Vec::new();
    for item in items {
        let Some(kind) = item.get("action").and_then(Value::as_str) else {
            continue;
        };
        match kind.to_ascii_lowercase().as_str() {
            "add" => actions.push(MergeAction::Add),
            "merge" => {
                let index = item.get("index").and_then(Value::as_u64).map(|i| i as usize);
                let summary = item
                    .get("merged_summary")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                match (index, summary) {
                    (Some(index), Some(summary)) if index < similar_count => {
                        actions.push(MergeAction::Merge {
                            index,
                            merged_summary: summary.to_string(),
                        });
                    }
                    (Some(index), _) if index >= similar_count => {
                        tracing::warn!(index, similar_count, "discarding merge with out-of-bounds index");
                    }
                    _ => {
                        tracing::warn!("discarding incomplete merge action");
                    }
                }
            }
            other => {
                tracing::warn!(action = other, "discarding unknown merge action");
            }
        }
    }
    actions
}

// ============================================================================
// HELPERS
// ============================================================================

/// Strip a surrounding markdown code fence, if any
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", ...) up to the first newline
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

// ============================================================================
// TESTS
// ============================================================================
