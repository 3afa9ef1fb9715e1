//! Memory Types
//!
//! The durable unit of memory and its per-turn projections:
//!
//! - [`Document`] is what callers hand the store: page content plus a free
//!   metadata map, exactly mirroring the journal's on-disk record.
//! - [`MemoryEntry`] is the memory-shaped view of a document: topic summary,
//!   dialogue provenance, session and turn references.
//! - [`RetrievedMemory`] is a per-query projection enriched with the store's
//!   relevance score and, after reranking, the rerank score.
//!
//! Ids are stable: a supplied metadata id wins; otherwise the id is derived
//! from a SHA-256 over content, metadata, batch position, and a per-store
//! counter, truncated to 24 hex chars and prefixed `doc-`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// METADATA KEYS
// ============================================================================

/// Metadata key carrying the stable id
pub const META_ID: &str = "id";
/// Metadata key carrying the originating session
pub const META_SESSION_ID: &str = "sessionId";
/// Metadata key carrying the creation timestamp (RFC 3339)
pub const META_TIMESTAMP: &str = "timestamp";
/// Metadata key carrying turn ordinals within the session
pub const META_TURN_REFERENCES: &str = "turnReferences";
/// Metadata key carrying dialogue provenance
pub const META_RAW_DIALOGUE: &str = "rawDialogue";
/// Metadata key the store echoes the similarity score into
pub const META_SCORE: &str = "score";

// ============================================================================
// DOCUMENT
// ============================================================================

/// A unit of content handed to the vector store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The indexed text
    pub page_content: String,
    /// Free-form metadata; the store echoes the final `id` back into it
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    /// Create a document with empty metadata
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: Map::new(),
        }
    }

    /// Attach a metadata field
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach an explicit id
    #[must_use]
    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.with_metadata(META_ID, Value::String(id.into()))
    }

    /// The explicit id, when the metadata carries one
    pub fn explicit_id(&self) -> Option<&str> {
        self.metadata.get(META_ID).and_then(Value::as_str)
    }
}

/// Derive a stable content-addressed document id
///
/// `position` is the document's index within its `add` batch and `counter`
/// is the store's running document count, so identical content added twice
/// still gets distinct ids.
pub fn derive_document_id(
    page_content: &str,
    metadata: &Map<String, Value>,
    position: usize,
    counter: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(page_content.as_bytes());
    hasher.update(Value::Object(metadata.clone()).to_string().as_bytes());
    hasher.update(position.to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(24);
    for byte in digest.iter().take(12) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("doc-{hex}")
}

// ============================================================================
// MEMORY ENTRY
// ============================================================================

/// A durable memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// Stable identifier
    pub id: String,
    /// The indexed text: a short self-contained summary of the memory
    pub topic_summary: String,
    /// Dialogue excerpt the summary was extracted from
    #[serde(default)]
    pub raw_dialogue: String,
    /// Session the memory originated in
    #[serde(default)]
    pub session_id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Turn ordinals within the session that support this memory
    #[serde(default)]
    pub turn_references: Vec<usize>,
    /// Summary embedding; empty on store-returned projections (the store
    /// never hands vectors back)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl MemoryEntry {
    /// Create a freshly extracted memory with a generated UUID id
    pub fn extracted(
        topic_summary: impl Into<String>,
        raw_dialogue: impl Into<String>,
        session_id: impl Into<String>,
        turn_references: Vec<usize>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic_summary: topic_summary.into(),
            raw_dialogue: raw_dialogue.into(),
            session_id: session_id.into(),
            timestamp,
            turn_references,
            embedding: Vec::new(),
        }
    }

    /// Render the entry as a store document
    pub fn to_document(&self) -> Document {
        Document::new(self.topic_summary.clone())
            .with_id(self.id.clone())
            .with_metadata(META_SESSION_ID, Value::String(self.session_id.clone()))
            .with_metadata(META_TIMESTAMP, Value::String(self.timestamp.to_rfc3339()))
            .with_metadata(
                META_TURN_REFERENCES,
                Value::Array(
                    self.turn_references
                        .iter()
                        .map(|&t| Value::Number(t.into()))
                        .collect(),
                ),
            )
            .with_metadata(META_RAW_DIALOGUE, Value::String(self.raw_dialogue.clone()))
    }

    /// Reconstruct a memory view from stored parts
    ///
    /// Unknown or missing metadata fields fall back to neutral defaults; a
    /// store can hold documents that never came from the extraction
    /// pipeline.
    pub fn from_stored(id: &str, page_content: &str, metadata: &Map<String, Value>) -> Self {
        let timestamp = metadata
            .get(META_TIMESTAMP)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
        let turn_references = metadata
            .get(META_TURN_REFERENCES)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_u64)
                    .map(|t| t as usize)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: id.to_string(),
            topic_summary: page_content.to_string(),
            raw_dialogue: metadata
                .get(META_RAW_DIALOGUE)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            session_id: metadata
                .get(META_SESSION_ID)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp,
            turn_references,
            embedding: Vec::new(),
        }
    }
}

// ============================================================================
// RETRIEVED MEMORY
// ============================================================================

/// A memory as returned from a similarity search, per query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedMemory {
    /// The underlying memory (shallow copy; mutating it never touches the
    /// store's index)
    pub entry: MemoryEntry,
    /// Cosine similarity against the query
    pub relevance_score: f32,
    /// Score after the learned rerank transform, when reranking ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Full stored metadata with `score` echoed in
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// ============================================================================
// TESTS
// ============================================================================
