//! Journal Records
//!
//! The store's on-disk format: NDJSON, one record per line, UTF-8, LF
//! terminators. Two record shapes:
//!
//! ```text
//! {"op":"upsert","id":"doc-…","pageContent":"…","metadata":{…,"id":"doc-…"},"vector":[…]}
//! {"op":"delete","id":"doc-…"}
//! ```
//!
//! The in-memory index is always the left fold of the journal. Loading is
//! tolerant: a bad line (truncated tail after a crash, invalid JSON, a
//! missing or non-finite vector) is skipped with a warning and the fold
//! continues with the prefix that parsed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::io::AsyncBufReadExt;

// ============================================================================
// RECORD
// ============================================================================

/// One journal line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalRecord {
    /// Insert or overwrite a document by id
    #[serde(rename_all = "camelCase")]
    Upsert {
        /// Stable document id
        id: String,
        /// Indexed text
        page_content: String,
        /// Stored metadata (echoes `id`)
        #[serde(default)]
        metadata: Map<String, Value>,
        /// Embedding vector
        vector: Vec<f32>,
    },
    /// Remove a document by id
    Delete {
        /// Stable document id
        id: String,
    },
}

impl JournalRecord {
    /// The id the record applies to
    pub fn id(&self) -> &str {
        match self {
            JournalRecord::Upsert { id, .. } | JournalRecord::Delete { id } => id,
        }
    }

    /// Whether the record is structurally sound
    ///
    /// An upsert needs a non-empty vector of finite numbers; a delete only
    /// needs its id.
    pub fn is_valid(&self) -> bool {
        match self {
            JournalRecord::Upsert { vector, .. } => {
                !vector.is_empty() && vector.iter().all(|x| x.is_finite())
            }
            JournalRecord::Delete { .. } => true,
        }
    }

    /// Serialize to one journal line, LF included
    pub fn encode_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Read every parseable record from a journal file
///
/// Returns the records in journal order and the number of lines skipped.
/// A missing file is an empty journal.
pub async fn load_journal(path: &Path) -> std::io::Result<(Vec<JournalRecord>, usize)> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err),
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(trimmed) {
            Ok(record) if record.is_valid() => records.push(record),
            Ok(_) => {
                tracing::warn!(line = line_no, "skipping journal record with invalid vector");
                skipped += 1;
            }
            Err(err) => {
                tracing::warn!(line = line_no, %err, "skipping unparseable journal line");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

// ============================================================================
// TESTS
// ============================================================================
