//! Prebuild Ingestion
//!
//! Batch-ingests historical sessions into the vector store before the
//! middleware ever serves a live turn. The run is resumable: a progress
//! marker is checkpointed after every session, a completed run is never
//! repeated, and a crash resumes from the last checkpointed session.

use reverie_core::state::{BufferedMessage, MessageBuffer};
use reverie_core::store::{PrebuildMarker, StoreError};

use crate::prospective::ProspectiveWriter;

// ============================================================================
// PLAN
// ============================================================================

/// One historical session to ingest
#[derive(Debug, Clone)]
pub struct SessionDialogue {
    /// Session identifier recorded on extracted memories
    pub session_id: String,
    /// The session's dialogue, oldest first
    pub messages: Vec<BufferedMessage>,
}

/// A full ingestion plan
#[derive(Debug, Clone)]
pub struct PrebuildPlan {
    /// Ingestion method label written to the markers
    pub method: String,
    /// Dataset question id
    pub question_id: String,
    /// Dataset question category
    pub question_type: String,
    /// Sessions to ingest, in order
    pub sessions: Vec<SessionDialogue>,
}

// ============================================================================
// RUNNER
// ============================================================================

/// Drives a [`ProspectiveWriter`] over a plan, checkpointing as it goes
#[derive(Debug)]
pub struct PrebuildRunner<'a> {
    writer: &'a ProspectiveWriter,
    store: &'a reverie_core::store::VectorStore,
}

impl<'a> PrebuildRunner<'a> {
    /// Build a runner over a writer and its store
    pub fn new(writer: &'a ProspectiveWriter, store: &'a reverie_core::store::VectorStore) -> Self {
        Self { writer, store }
    }

    /// Execute the plan, resuming from any prior checkpoint
    ///
    /// Returns the final marker. A plan whose completion marker already
    /// exists (same question id) is skipped outright.
    pub async fn run(&self, plan: &PrebuildPlan) -> Result<PrebuildMarker, StoreError> {
        if let Some(complete) = self.store.prebuild_complete().await {
            if complete.question_id == plan.question_id {
                tracing::info!(question = %plan.question_id, "prebuild already complete; skipping");
                return Ok(complete);
            }
        }

        let mut marker = match self.store.prebuild_progress().await {
            Some(progress) if progress.question_id == plan.question_id => {
                tracing::info!(
                    question = %plan.question_id,
                    resumed_at = progress.sessions_processed,
                    "resuming prebuild from checkpoint"
                );
                progress
            }
            _ => PrebuildMarker::new(
                plan.method.clone(),
                plan.question_id.clone(),
                plan.question_type.clone(),
                plan.sessions.len(),
            ),
        };
        marker.total_sessions = plan.sessions.len();

        for session in plan.sessions.iter().skip(marker.sessions_processed) {
            let mut buffer = MessageBuffer::new();
            buffer.append(session.messages.iter().cloned());

            let report = self.writer.run(&session.session_id, &buffer).await;
            marker.sessions_processed += 1;
            marker.extracted_memories += report.extracted;
            marker.stored_memories += report.added + report.merged;
            marker.updated_at = Some(chrono::Utc::now());
            self.store.mark_prebuild_progress(&marker).await?;
        }

        marker.updated_at = None;
        marker.completed_at = Some(chrono::Utc::now());
        self.store.mark_prebuild_complete(&marker).await?;
        tracing::info!(
            question = %marker.question_id,
            sessions = marker.sessions_processed,
            stored = marker.stored_memories,
            "prebuild complete"
        );
        Ok(marker)
    }
}
