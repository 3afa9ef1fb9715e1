//! Chat Generator Interface
//!
//! A minimal message-in, output-out surface. The engine needs no tool
//! calls and no streaming from the generator; it only reads text back
//! (answers, extraction JSON, merge decisions).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Result;

// ============================================================================
// MESSAGES
// ============================================================================

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction
    System,
    /// End-user turn
    User,
    /// Generator turn
    Assistant,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Speaker role
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Build a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Build a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// MODEL OUTPUT
// ============================================================================

/// One block of structured generator content
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    /// A text block
    Text {
        /// The block's text
        text: String,
    },
    /// Anything the engine does not consume (tool use, images, ...)
    #[serde(other)]
    Other,
}

/// Generator output: either plain text or structured content blocks
///
/// Providers that return both should prefer `Text` and fall back to
/// `Blocks` only when the plain text is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelOutput {
    /// Plain response text
    Text(String),
    /// Structured content blocks
    Blocks(Vec<Block>),
}

impl ModelOutput {
    /// The response text: the plain string, or the first text block
    pub fn as_text(&self) -> &str {
        match self {
            ModelOutput::Text(text) => text,
            ModelOutput::Blocks(blocks) => blocks
                .iter()
                .find_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    Block::Other => None,
                })
                .unwrap_or(""),
        }
    }

    /// Whether the output carries no extractable text
    pub fn is_empty(&self) -> bool {
        self.as_text().trim().is_empty()
    }
}

// ============================================================================
// TRAIT
// ============================================================================

/// A chat generator
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a response to the given messages
    async fn generate(&self, messages: &[ChatMessage]) -> Result<ModelOutput>;
}

// ============================================================================
// TESTS
// ============================================================================
