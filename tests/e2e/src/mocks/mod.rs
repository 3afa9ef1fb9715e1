//! Provider Mocks
//!
//! Deterministic stand-ins for the generator, embedder, and session store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use reverie_core::provider::{
    ChatMessage, Embedder, LanguageModel, ModelOutput, ProviderError, SessionStore,
};

// ============================================================================
// EMBEDDER
// ============================================================================

/// Token-bag embedder: each lowercase token hashes to a dimension bucket,
/// and the vector is L2-normalized. Texts sharing tokens share mass, so
/// cosine similarity tracks lexical overlap - enough structure for
/// retrieval assertions without a model.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
    identity: String,
}

impl MockEmbedder {
    /// An embedder producing vectors of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            identity: format!("mock-embedder-{dimension}"),
        }
    }

    /// Same embedder under a different identity string
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash = 0xcbf2_9ce4_8422_2325_u64;
            for byte in token.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_query(&self, text: &str) -> reverie_core::provider::Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> reverie_core::provider::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

/// Embedder that always returns zero vectors; for zero-norm edge cases
#[derive(Debug, Clone)]
pub struct ZeroEmbedder {
    dimension: usize,
}

impl ZeroEmbedder {
    /// A zero embedder of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for ZeroEmbedder {
    async fn embed_query(&self, _text: &str) -> reverie_core::provider::Result<Vec<f32>> {
        Ok(vec![0.0; self.dimension])
    }

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> reverie_core::provider::Result<Vec<Vec<f32>>> {
        Ok(vec![vec![0.0; self.dimension]; texts.len()])
    }

    fn identity(&self) -> &str {
        "zero-embedder"
    }
}

/// Embedder that drops the last vector of every batch; for count-mismatch
/// coverage
#[derive(Debug, Clone)]
pub struct ShortBatchEmbedder {
    inner: MockEmbedder,
}

impl ShortBatchEmbedder {
    /// Wrap a mock embedder of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: MockEmbedder::new(dimension),
        }
    }
}

#[async_trait]
impl Embedder for ShortBatchEmbedder {
    async fn embed_query(&self, text: &str) -> reverie_core::provider::Result<Vec<f32>> {
        self.inner.embed_query(text).await
    }

    async fn embed_documents(
        &self,
        texts: &[String],
    ) -> reverie_core::provider::Result<Vec<Vec<f32>>> {
        let mut vectors = self.inner.embed_documents(texts).await?;
        vectors.pop();
        Ok(vectors)
    }

    fn identity(&self) -> &str {
        "short-batch-embedder"
    }
}

// ============================================================================
// GENERATOR
// ============================================================================

/// Replays a script of responses in order, recording every prompt
///
/// Once the script runs out, the fallback response repeats forever.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ModelOutput>>,
    fallback: ModelOutput,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    /// A model that replays the given plain-text responses
    pub fn new<I, S>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|s| ModelOutput::Text(s.into()))
                    .collect(),
            ),
            fallback: ModelOutput::Text("[NO_CITE]".to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A model that replays structured outputs
    pub fn with_outputs<I>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = ModelOutput>,
    {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            fallback: ModelOutput::Text("[NO_CITE]".to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every message list the model was called with, in order
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of generate calls so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        messages: &[ChatMessage],
    ) -> reverie_core::provider::Result<ModelOutput> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// A model whose every call fails; for degradation coverage
pub struct FailingModel;

#[async_trait]
impl LanguageModel for FailingModel {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
    ) -> reverie_core::provider::Result<ModelOutput> {
        Err(ProviderError::Backend("scripted outage".into()))
    }
}

// ============================================================================
// SESSION STORE
// ============================================================================

/// In-memory namespaced key-value store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySessionStore {
    /// An empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn composite_key(namespace: &[String], key: &str) -> String {
        format!("{}/{key}", namespace.join("/"))
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct read for assertions
    pub fn peek(&self, namespace: &[String], key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap()
            .get(&Self::composite_key(namespace, key))
            .cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(
        &self,
        namespace: &[String],
        key: &str,
    ) -> reverie_core::provider::Result<Option<Value>> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&Self::composite_key(namespace, key))
            .cloned())
    }

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
    ) -> reverie_core::provider::Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(Self::composite_key(namespace, key), value);
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> reverie_core::provider::Result<()> {
        self.values
            .lock()
            .unwrap()
            .remove(&Self::composite_key(namespace, key));
        Ok(())
    }
}

/// Session store whose every call fails; loads must return `None` and
/// saves `false` without breaking the turn
#[derive(Debug, Default)]
pub struct FailingSessionStore;

#[async_trait]
impl SessionStore for FailingSessionStore {
    async fn get(
        &self,
        _namespace: &[String],
        _key: &str,
    ) -> reverie_core::provider::Result<Option<Value>> {
        Err(ProviderError::Backend("scripted outage".into()))
    }

    async fn put(
        &self,
        _namespace: &[String],
        _key: &str,
        _value: Value,
    ) -> reverie_core::provider::Result<()> {
        Err(ProviderError::Backend("scripted outage".into()))
    }

    async fn delete(&self, _namespace: &[String], _key: &str) -> reverie_core::provider::Result<()> {
        Err(ProviderError::Backend("scripted outage".into()))
    }
}
