//! Conversation transcripts read by the learning pipeline.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who wrote a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The end user.
    User,
    /// The agent.
    Assistant,
    /// System/template text.
    System,
}

/// One message of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// Author.
    pub role: Role,
    /// Text.
    pub content: String,
    /// When it was sent.
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    /// A message stamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A whole conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// Conversation id (opaque).
    pub id: String,
    /// Agent that held the conversation.
    pub agent_id: AgentId,
    /// Messages in order.
    pub messages: Vec<TranscriptMessage>,
    /// Conversation-level satisfaction (0-5), when the user rated it.
    pub satisfaction: Option<f64>,
    /// When the conversation started.
    pub started_at: DateTime<Utc>,
}
