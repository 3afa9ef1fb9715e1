//! Prospective Reflection
//!
//! The memory write pipeline, fired when a session ends with a non-empty
//! message buffer:
//!
//! 1. **Extract** - the dialogue goes to the generator with the extraction
//!    prompt; each returned item becomes a candidate memory with a fresh
//!    UUID and the turns it cites as provenance.
//! 2. **Lookup** - top-5 similarity search per candidate.
//! 3. **Decide** - with no similar memory the candidate is simply added;
//!    otherwise the generator chooses add-or-merge per candidate.
//! 4. **Apply** - adds journal a new entry; merges delete the old entry and
//!    re-insert under the merged summary, preserving the old entry's
//!    session, timestamp, and turn references.
//!
//! Every step degrades gracefully: a failed call or unparseable response
//! drops that candidate (or the whole batch) with a warning, and whatever
//! was already journaled stays.

mod prompts;

pub use prompts::{
    EXTRACTION_PROMPT, ExtractedMemory, MERGE_PROMPT, MergeAction, dialogue_for_turns,
    format_dialogue, parse_extraction, parse_merge_actions,
};

use std::sync::Arc;

use chrono::Utc;
use reverie_core::memory::{MemoryEntry, RetrievedMemory};
use reverie_core::provider::{ChatMessage, LanguageModel};
use reverie_core::state::MessageBuffer;
use reverie_core::store::VectorStore;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Similar memories consulted per candidate before the merge decision
pub const SIMILAR_LOOKUP_K: usize = 5;

// ============================================================================
// TYPES
// ============================================================================

/// What one pipeline run did, for logging and prebuild counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Candidates the extractor produced
    pub extracted: usize,
    /// New entries journaled
    pub added: usize,
    /// Delete-and-reinsert merges journaled
    pub merged: usize,
}

// ============================================================================
// WRITER
// ============================================================================

/// The memory write pipeline
pub struct ProspectiveWriter {
    model: Arc<dyn LanguageModel>,
    store: Arc<VectorStore>,
}

impl std::fmt::Debug for ProspectiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProspectiveWriter").finish_non_exhaustive()
    }
}

impl ProspectiveWriter {
    /// Build a writer over the generator and store
    pub fn new(model: Arc<dyn LanguageModel>, store: Arc<VectorStore>) -> Self {
        Self { model, store }
    }

    /// Run the full pipeline over a session's buffered dialogue
    ///
    /// Never fails: problems are logged and reflected in the report.
    pub async fn run(&self, session_id: &str, buffer: &MessageBuffer) -> WriteReport {
        let mut report = WriteReport::default();
        if buffer.messages.is_empty() {
            return report;
        }

        let Some(candidates) = self.extract(session_id, buffer).await else {
            return report;
        };
        report.extracted = candidates.len();
        if candidates.is_empty() {
            tracing::debug!(session = session_id, "extraction found nothing to keep");
            return report;
        }

        for candidate in candidates {
            self.place(candidate, &mut report).await;
        }
        tracing::info!(
            session = session_id,
            extracted = report.extracted,
            added = report.added,
            merged = report.merged,
            "memory write pipeline finished"
        );
        report
    }

    /// Extraction call; `None` when the response was unusable
    async fn extract(&self, session_id: &str, buffer: &MessageBuffer) -> Option<Vec<MemoryEntry>> {
        let dialogue = format_dialogue(buffer);
        let messages = [
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(dialogue),
        ];
        let output = match self.model.generate(&messages).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(session = session_id, %err, "extraction call failed");
                return None;
            }
        };

        let Some(extracted) = parse_extraction(output.as_text()) else {
            tracing::warn!(session = session_id, "extraction response unusable; skipping write");
            return None;
        };

        let now = Utc::now();
        Some(
            extracted
                .into_iter()
                .map(|item| {
                    let raw_dialogue = dialogue_for_turns(buffer, &item.reference);
                    MemoryEntry::extracted(
                        item.summary,
                        raw_dialogue.trim_end(),
                        session_id,
                        item.reference,
                        now,
                    )
                })
                .collect(),
        )
    }

    /// Lookup, decide, and apply for one candidate
    async fn place(&self, candidate: MemoryEntry, report: &mut WriteReport) {
        let similar = match self
            .store
            .similarity_search(&candidate.topic_summary, SIMILAR_LOOKUP_K)
            .await
        {
            Ok(similar) => similar,
            Err(err) => {
                tracing::warn!(%err, "similarity lookup failed; storing candidate as new");
                Vec::new()
            }
        };

        let actions = if similar.is_empty() {
            vec![MergeAction::Add]
        } else {
            self.decide(&candidate, &similar).await
        };

        for action in actions {
            match action {
                MergeAction::Add => {
                    match self.store.add(vec![candidate.to_document()]).await {
                        Ok(_) => report.added += 1,
                        Err(err) => tracing::warn!(%err, "failed to add extracted memory"),
                    }
                }
                MergeAction::Merge { index, merged_summary } => {
                    let Some(old) = similar.get(index) else {
                        continue;
                    };
                    if self.merge(old, merged_summary).await {
                        report.merged += 1;
                    }
                }
            }
        }
    }

    /// Merge decision call; unusable responses yield no actions
    async fn decide(&self, candidate: &MemoryEntry, similar: &[RetrievedMemory]) -> Vec<MergeAction> {
        let mut listing = String::new();
        for (index, memory) in similar.iter().enumerate() {
            listing.push_str(&format!(
                "[{index}] (similarity {:.3}) {}\n",
                memory.relevance_score, memory.entry.topic_summary
            ));
        }
        let prompt = format!(
            "Candidate memory:\n{}\n\nSimilar stored memories:\n{listing}",
            candidate.topic_summary
        );
        let messages = [ChatMessage::system(MERGE_PROMPT), ChatMessage::user(prompt)];

        match self.model.generate(&messages).await {
            Ok(output) => parse_merge_actions(output.as_text(), similar.len()),
            Err(err) => {
                tracing::warn!(%err, "merge decision call failed; skipping candidate");
                Vec::new()
            }
        }
    }

    /// Delete-then-reinsert under the merged summary
    ///
    /// The replacement keeps the old entry's session, timestamp, and turn
    /// references; only the summary (and therefore the embedding) changes.
    async fn merge(&self, old: &RetrievedMemory, merged_summary: String) -> bool {
        let replacement = MemoryEntry::extracted(
            merged_summary,
            old.entry.raw_dialogue.clone(),
            old.entry.session_id.clone(),
            old.entry.turn_references.clone(),
            old.entry.timestamp,
        );

        if let Err(err) = self.store.delete(std::slice::from_ref(&old.entry.id)).await {
            tracing::warn!(%err, id = %old.entry.id, "merge delete failed; keeping old entry");
            return false;
        }
        match self.store.add(vec![replacement.to_document()]).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%err, "merge re-insert failed after delete; memory dropped");
                false
            }
        }
    }
}
