//! Core data types shared by the retrieval and negotiation pipeline.
//!
//! These types represent the documents, chunks, decisions, and chat messages
//! that flow from the document folder through the index and into the model
//! backend.

use serde::{Deserialize, Serialize};

/// A word-window chunk of a document together with its embedding vector.
///
/// Chunks of one document are kept in reading order; `chunk_index` is the
/// position of the chunk in that order.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub path: String,
    pub chunk_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// The structured decision the model returns for a user turn.
///
/// Produced once per turn by the negotiation loop and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationDecision {
    pub search_needed: bool,
    pub search_query: Option<String>,
    pub assistant_reply: Option<String>,
}

impl NegotiationDecision {
    /// The search query to run, if the decision carries a non-blank one.
    pub fn query(&self) -> Option<&str> {
        self.search_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// The model's direct answer, if it carries a non-blank one.
    pub fn reply(&self) -> Option<&str> {
        self.assistant_reply
            .as_deref()
            .filter(|r| !r.trim().is_empty())
    }
}

/// Message roles understood by the model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One `{role, content}` entry of a chat transcript.
///
/// Used both for requests to the model backend and for the turns kept in
/// the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A stored conversation: a title plus its ordered turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            title: "Untitled".to_string(),
            messages: Vec::new(),
        }
    }
}

impl Conversation {
    /// Whether `index` is a user message answered by the next message.
    pub fn is_editable(&self, index: usize) -> bool {
        matches!(
            (self.messages.get(index), self.messages.get(index + 1)),
            (Some(q), Some(a)) if q.role == Role::User && a.role == Role::Assistant
        )
    }

    /// The transcript up to and including message `index`, with that
    /// message's content replaced by `content`.
    pub fn history_with_edit(&self, index: usize, content: &str) -> Option<Vec<ChatMessage>> {
        if !self.is_editable(index) {
            return None;
        }
        let mut history = self.messages[..index].to_vec();
        history.push(ChatMessage::user(content));
        Some(history)
    }
}
