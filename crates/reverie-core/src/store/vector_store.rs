//! Journaled Vector Store
//!
//! A durable cosine-similarity store with an append-only NDJSON journal as
//! its single source of truth:
//!
//! - The in-memory index is exactly the fold of the journal from the first
//!   line; reopening at any prefix reproduces the fold of that prefix.
//! - All mutations funnel through one writer task fed by an mpsc channel,
//!   so records land in the journal in submission order no matter how many
//!   call sites race. Reads never block on the writer.
//! - A crash leaves at most one trailing partial line, which the loader
//!   skips.
//!
//! Search is exact: full-scan cosine over the index, descending score, ties
//! broken by insertion order. Query embeddings go through a small LRU so
//! re-embedding the same query string within a turn is free.

use lru::LruCache;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::memory::{Document, MemoryEntry, RetrievedMemory, META_ID, META_SCORE, derive_document_id};
use crate::provider::{Embedder, ProviderError};

use super::journal::{JournalRecord, load_journal};
use super::prebuild::{PrebuildMarker, read_marker, remove_marker, write_marker};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default capacity of the query-embedding LRU
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 128;

/// Depth of the writer queue before submitters back-pressure
const WRITE_QUEUE_DEPTH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Journal or marker I/O failed
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    /// The embedder returned a different number of vectors than documents
    #[error("embedding count mismatch: {expected} documents, {got} vectors")]
    EmbeddingCountMismatch {
        /// Documents submitted
        expected: usize,
        /// Vectors returned
        got: usize,
    },
    /// A new vector disagrees with the dimension already in the index
    #[error("vector dimension mismatch: index holds {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension of vectors already stored
        expected: usize,
        /// Dimension of the offending vector
        got: usize,
    },
    /// An embedder vector was empty or non-finite
    #[error("embedder produced an invalid vector for document {0}")]
    InvalidVector(String),
    /// The embedding backend failed
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// A record failed to serialize
    #[error("journal encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// The writer task has shut down after a write failure or close
    #[error("vector store is closed")]
    Closed,
}

/// Vector store result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for the store
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    /// Query-embedding LRU capacity
    pub query_cache_size: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            query_cache_size: DEFAULT_QUERY_CACHE_SIZE,
        }
    }
}

/// Cheap point-in-time counters for logging and tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Live entries in the index
    pub entries: usize,
    /// Records appended to the journal this process lifetime
    pub records_appended: usize,
    /// Dimension of stored vectors; `None` while empty
    pub dimension: Option<usize>,
}

// ============================================================================
// INDEX
// ============================================================================

#[derive(Debug, Clone)]
struct IndexEntry {
    page_content: String,
    metadata: Map<String, Value>,
    vector: Vec<f32>,
    /// Journal position of the upsert; the similarity tie-breaker
    seq: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    next_seq: u64,
    /// Documents ever added; feeds content-hash id derivation
    doc_counter: u64,
}

impl Index {
    fn apply(&mut self, record: &JournalRecord) {
        match record {
            JournalRecord::Upsert {
                id,
                page_content,
                metadata,
                vector,
            } => {
                let seq = self.next_seq;
                self.entries.insert(
                    id.clone(),
                    IndexEntry {
                        page_content: page_content.clone(),
                        metadata: metadata.clone(),
                        vector: vector.clone(),
                        seq,
                    },
                );
            }
            JournalRecord::Delete { id } => {
                self.entries.remove(id);
            }
        }
        self.next_seq += 1;
    }

    fn dimension(&self) -> Option<usize> {
        self.entries.values().next().map(|e| e.vector.len())
    }
}

// ============================================================================
// WRITER TASK
// ============================================================================

struct WriteJob {
    records: Vec<JournalRecord>,
    ack: oneshot::Sender<Result<()>>,
}

/// Owns the append handle; applies records to the index only after they are
/// durably on disk, then acknowledges the submitter. A write failure closes
/// the queue: the failing submitter sees the error, later submitters see
/// `Closed`, and the journal stays valid up to the last synced record.
async fn writer_loop(
    mut file: tokio::fs::File,
    index: Arc<RwLock<Index>>,
    mut rx: mpsc::Receiver<WriteJob>,
) {
    while let Some(job) = rx.recv().await {
        let mut batch = String::new();
        let mut encode_err = None;
        for record in &job.records {
            match record.encode_line() {
                Ok(line) => batch.push_str(&line),
                Err(err) => {
                    encode_err = Some(StoreError::Encode(err));
                    break;
                }
            }
        }
        if let Some(err) = encode_err {
            let _ = job.ack.send(Err(err));
            continue;
        }

        let write_result = async {
            file.write_all(batch.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        match write_result {
            Ok(()) => {
                {
                    let mut index = index.write().unwrap_or_else(|e| e.into_inner());
                    for record in &job.records {
                        index.apply(record);
                    }
                }
                let _ = job.ack.send(Ok(()));
            }
            Err(err) => {
                tracing::error!(%err, "journal append failed, closing store writer");
                let _ = job.ack.send(Err(StoreError::Io(err)));
                rx.close();
                break;
            }
        }
    }
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// Durable journaled vector store
pub struct VectorStore {
    base: PathBuf,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<Index>>,
    writer_tx: mpsc::Sender<WriteJob>,
    writer_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    records_appended: Mutex<usize>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("base", &self.base)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open (or create) a store rooted at `base`
    ///
    /// `base` is a path prefix: the journal lives at `<base>.journal.jsonl`
    /// and the prebuild markers alongside it. The journal is replayed into
    /// the in-memory index before the call returns.
    pub async fn open(base: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::open_with_config(base, embedder, VectorStoreConfig::default()).await
    }

    /// Open with explicit tuning
    pub async fn open_with_config(
        base: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        config: VectorStoreConfig,
    ) -> Result<Self> {
        let base: PathBuf = base.into();
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let journal_path = Self::journal_path_of(&base);
        let (records, skipped) = load_journal(&journal_path).await?;
        if skipped > 0 {
            tracing::warn!(
                journal = %journal_path.display(),
                skipped,
                "journal contained unreadable lines; continuing with the parseable prefix"
            );
        }

        let mut index = Index::default();
        for record in &records {
            index.apply(record);
        }
        index.doc_counter = records
            .iter()
            .filter(|r| matches!(r, JournalRecord::Upsert { .. }))
            .count() as u64;
        tracing::debug!(
            journal = %journal_path.display(),
            entries = index.entries.len(),
            "vector store opened"
        );

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .await?;

        let index = Arc::new(RwLock::new(index));
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer_handle = tokio::spawn(writer_loop(file, Arc::clone(&index), writer_rx));

        let cache_size = NonZeroUsize::new(config.query_cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            base,
            embedder,
            index,
            writer_tx,
            writer_handle: Mutex::new(Some(writer_handle)),
            query_cache: Mutex::new(LruCache::new(cache_size)),
            records_appended: Mutex::new(0),
        })
    }

    /// Identity string of the embedder this store embeds with
    pub fn embedder_identity(&self) -> String {
        self.embedder.identity().to_string()
    }

    /// Handle to the embedder this store embeds with
    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Path of the journal file
    pub fn journal_path(&self) -> PathBuf {
        Self::journal_path_of(&self.base)
    }

    fn journal_path_of(base: &Path) -> PathBuf {
        Self::sibling(base, "journal.jsonl")
    }

    fn progress_path(&self) -> PathBuf {
        Self::sibling(&self.base, "progress.json")
    }

    fn complete_path(&self) -> PathBuf {
        Self::sibling(&self.base, "complete.json")
    }

    fn sibling(base: &Path, suffix: &str) -> PathBuf {
        let mut name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push('.');
        name.push_str(suffix);
        base.with_file_name(name)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time counters
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        StoreStats {
            entries: index.entries.len(),
            records_appended: *self.records_appended.lock().unwrap_or_else(|e| e.into_inner()),
            dimension: index.dimension(),
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Embed and store a batch of documents; returns the final ids in order
    ///
    /// Ids come from document metadata when present, otherwise from the
    /// content hash. The final id is always echoed into the stored
    /// metadata.
    pub async fn add(&self, documents: Vec<Document>) -> Result<Vec<String>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.page_content.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        if vectors.len() != documents.len() {
            return Err(StoreError::EmbeddingCountMismatch {
                expected: documents.len(),
                got: vectors.len(),
            });
        }

        let (counter, existing_dim) = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            (index.doc_counter, index.dimension())
        };

        let mut ids = Vec::with_capacity(documents.len());
        let mut records = Vec::with_capacity(documents.len());
        for (position, (document, vector)) in documents.into_iter().zip(vectors).enumerate() {
            if vector.is_empty() || vector.iter().any(|x| !x.is_finite()) {
                return Err(StoreError::InvalidVector(
                    document.explicit_id().unwrap_or("<unnamed>").to_string(),
                ));
            }
            if let Some(expected) = existing_dim {
                if vector.len() != expected {
                    return Err(StoreError::DimensionMismatch {
                        expected,
                        got: vector.len(),
                    });
                }
            }

            let id = match document.explicit_id() {
                Some(id) => id.to_string(),
                None => derive_document_id(
                    &document.page_content,
                    &document.metadata,
                    position,
                    counter + position as u64,
                ),
            };
            let mut metadata = document.metadata;
            metadata.insert(META_ID.to_string(), Value::String(id.clone()));

            ids.push(id.clone());
            records.push(JournalRecord::Upsert {
                id,
                page_content: document.page_content,
                metadata,
                vector,
            });
        }

        let appended = records.len();
        self.submit(records).await?;
        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            index.doc_counter += appended as u64;
        }
        Ok(ids)
    }

    /// Journal a delete for every known id; unknown ids are skipped silently
    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        let records: Vec<JournalRecord> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            ids.iter()
                .filter(|id| index.entries.contains_key(id.as_str()))
                .map(|id| JournalRecord::Delete { id: id.clone() })
                .collect()
        };
        if records.is_empty() {
            return Ok(());
        }
        self.submit(records).await
    }

    async fn submit(&self, records: Vec<JournalRecord>) -> Result<()> {
        let count = records.len();
        let (ack, done) = oneshot::channel();
        self.writer_tx
            .send(WriteJob { records, ack })
            .await
            .map_err(|_| StoreError::Closed)?;
        let result = done.await.map_err(|_| StoreError::Closed)?;
        if result.is_ok() {
            *self.records_appended.lock().unwrap_or_else(|e| e.into_inner()) += count;
        }
        result
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Top-`k` entries by cosine similarity to `query`
    ///
    /// Ties break by insertion order; a zero-norm vector scores 0.0, never
    /// NaN. The similarity is echoed into each result's metadata under
    /// `score`. Returned entries are shallow copies and never expose the
    /// stored vectors.
    pub async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<RetrievedMemory>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embed_query_cached(query).await?;

        let mut scored: Vec<(f32, u64, String)> = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            index
                .entries
                .iter()
                .map(|(id, entry)| (cosine(&query_vector, &entry.vector), entry.seq, id.clone()))
                .collect()
        };
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let results = scored
            .into_iter()
            .filter_map(|(score, _, id)| {
                let entry = index.entries.get(&id)?;
                let mut metadata = entry.metadata.clone();
                metadata.insert(META_SCORE.to_string(), json_f32(score));
                Some(RetrievedMemory {
                    entry: MemoryEntry::from_stored(&id, &entry.page_content, &entry.metadata),
                    relevance_score: score,
                    rerank_score: None,
                    metadata,
                })
            })
            .collect();
        Ok(results)
    }

    async fn embed_query_cached(&self, query: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(vector) = cache.get(query) {
                return Ok(vector.clone());
            }
        }
        let vector = self.embedder.embed_query(query).await?;
        let mut cache = self.query_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(query.to_string(), vector.clone());
        Ok(vector)
    }

    // ------------------------------------------------------------------
    // Prebuild markers
    // ------------------------------------------------------------------

    /// Checkpoint prebuild progress (atomic write)
    pub async fn mark_prebuild_progress(&self, marker: &PrebuildMarker) -> Result<()> {
        write_marker(&self.progress_path(), marker).await?;
        Ok(())
    }

    /// Write the completion marker and drop the progress checkpoint
    pub async fn mark_prebuild_complete(&self, marker: &PrebuildMarker) -> Result<()> {
        write_marker(&self.complete_path(), marker).await?;
        remove_marker(&self.progress_path()).await?;
        Ok(())
    }

    /// Remove the progress checkpoint, if any
    pub async fn clear_prebuild_progress(&self) -> Result<()> {
        remove_marker(&self.progress_path()).await?;
        Ok(())
    }

    /// Read the progress checkpoint
    pub async fn prebuild_progress(&self) -> Option<PrebuildMarker> {
        read_marker(&self.progress_path()).await
    }

    /// Read the completion marker
    pub async fn prebuild_complete(&self) -> Option<PrebuildMarker> {
        read_marker(&self.complete_path()).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close the store, draining pending writes first
    ///
    /// Dropping the store is also safe: every acknowledged write is already
    /// synced, so close only matters when the caller wants to block until
    /// the writer task has fully exited.
    pub async fn close(self) -> Result<()> {
        drop(self.writer_tx);
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity; zero-norm or mismatched operands score 0.0
#[inline]
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

fn json_f32(value: f32) -> Value {
    serde_json::Number::from_f64(f64::from(value))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ============================================================================
// TESTS
// ============================================================================
