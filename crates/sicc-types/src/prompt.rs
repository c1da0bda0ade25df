//! Prompt enrichment requests, results and reply outcomes.

use crate::memory::{ChunkType, Layer, MemoryId};
use crate::pattern::{PatternId, PatternType, RuntimeContext};
use serde::{Deserialize, Serialize};

/// Approximate characters per token used for budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Conservative token estimate: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// An inbound message to enrich.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichRequest {
    /// The user's message.
    pub message: String,
    /// Runtime context used for pattern triggers and template placeholders.
    /// A `company_id` entry enables company-layer knowledge.
    #[serde(default)]
    pub context: RuntimeContext,
    /// The agent's base system prompt. Falls back to the configured default.
    #[serde(default)]
    pub base_prompt: Option<String>,
}

/// A memory that shaped the enriched prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedMemory {
    /// Chunk id.
    pub id: MemoryId,
    /// Content as rendered.
    pub content: String,
    /// Category.
    pub chunk_type: ChunkType,
    /// Layer the chunk came from.
    pub layer: Layer,
    /// Similarity to the message.
    pub similarity: f32,
}

/// A pattern applied to the enriched prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPattern {
    /// Pattern id.
    pub id: PatternId,
    /// Pattern name.
    pub pattern_name: String,
    /// Category.
    pub pattern_type: PatternType,
    /// Layer the pattern came from.
    pub layer: Layer,
    /// Rendered instruction.
    pub rendered: String,
}

/// The enriched prompt handed to the external LLM caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPrompt {
    /// Final prompt text.
    pub enriched_prompt: String,
    /// The message as received.
    pub original_message: String,
    /// Memories included, in prompt order.
    pub memories_used: Vec<UsedMemory>,
    /// Patterns included.
    pub patterns_applied: Vec<AppliedPattern>,
    /// Estimated tokens of `enriched_prompt`.
    pub token_count: usize,
    /// The runtime context, echoed back.
    pub context: RuntimeContext,
    /// Whether the user message had to be truncated to fit the budget.
    #[serde(default)]
    pub message_truncated: bool,
}

/// What happened after the LLM replied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Memories that were in the prompt.
    #[serde(default)]
    pub memories_used: Vec<MemoryId>,
    /// Patterns that were in the prompt.
    #[serde(default)]
    pub patterns_applied: Vec<PatternId>,
    /// Whether the reply was a success.
    pub succeeded: bool,
    /// Time to reply.
    #[serde(default)]
    pub response_time_ms: u64,
    /// Optional user satisfaction (0-5).
    #[serde(default)]
    pub satisfaction: Option<f64>,
}

/// Result of recording an outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    /// Memories whose usage count was incremented.
    pub memories_incremented: usize,
    /// Patterns whose application was recorded.
    pub patterns_recorded: usize,
    /// Ids that could not be updated, with the reason.
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // Counts characters, not bytes.
        assert_eq!(estimate_tokens("preço"), 2);
    }
}
