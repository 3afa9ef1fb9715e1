//! Prebuild Markers
//!
//! Offline ingestion of historical sessions can take a while and die
//! halfway. Two sidecar files record where it stands:
//!
//! - `<base>.progress.json` is the checkpoint, rewritten after every session
//! - `<base>.complete.json` is the terminal marker; its write removes the
//!   progress file
//!
//! Both are single JSON objects written atomically (temp file + rename), so
//! a crash mid-write can never leave a half-marker behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// MARKER
// ============================================================================

/// Prebuild checkpoint / completion document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuildMarker {
    /// On-disk schema version; always 1
    pub schema_version: u32,
    /// Ingestion method label (e.g. the memory pipeline variant)
    pub method: String,
    /// Dataset question id being prebuilt
    pub question_id: String,
    /// Dataset question category
    pub question_type: String,
    /// Total sessions in the ingestion plan
    pub total_sessions: usize,
    /// Sessions fully ingested so far
    pub sessions_processed: usize,
    /// Memories the extractor produced so far
    pub extracted_memories: usize,
    /// Memories actually written to the store so far
    pub stored_memories: usize,
    /// Set on the completion marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on progress checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PrebuildMarker {
    /// Start a fresh marker for an ingestion plan
    pub fn new(
        method: impl Into<String>,
        question_id: impl Into<String>,
        question_type: impl Into<String>,
        total_sessions: usize,
    ) -> Self {
        Self {
            schema_version: 1,
            method: method.into(),
            question_id: question_id.into(),
            question_type: question_type.into(),
            total_sessions,
            sessions_processed: 0,
            extracted_memories: 0,
            stored_memories: 0,
            completed_at: None,
            updated_at: None,
        }
    }
}

// ============================================================================
// FILE OPERATIONS
// ============================================================================

/// Atomically write a marker: temp file in the same directory, then rename
pub async fn write_marker(path: &Path, marker: &PrebuildMarker) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(marker)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Read a marker; `None` when the file is absent or unparseable
pub async fn read_marker(path: &Path) -> Option<PrebuildMarker> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Some(marker),
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "ignoring unreadable prebuild marker");
            None
        }
    }
}

/// Remove a marker; an absent file is fine
pub async fn remove_marker(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

// ============================================================================
// TESTS
// ============================================================================
