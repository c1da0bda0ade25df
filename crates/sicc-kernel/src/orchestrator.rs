//! Prompt enrichment and outcome recording.
//!
//! `enrich_prompt` is read-only and never fails the caller: a store or
//! embedding failure only costs the memories (or patterns) of that turn.
//! `record_outcome` applies the side effects once the caller knows whether
//! the reply worked.

use crate::blocking::run_blocking;
use crate::layers::LayerResolver;
use regex_lite::{Captures, Regex};
use serde_json::Value;
use sicc_memory::SiccSubstrate;
use sicc_runtime::embedding_service::EmbeddingService;
use sicc_runtime::text::truncate_chars;
use sicc_types::agent::AgentId;
use sicc_types::config::OrchestratorSettings;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::metrics::InteractionRecord;
use sicc_types::pattern::{BehaviorPattern, PatternType, RuntimeContext};
use sicc_types::prompt::{
    estimate_tokens, AppliedPattern, EnrichRequest, EnrichedPrompt, OutcomeRecord, OutcomeReport,
    UsedMemory, CHARS_PER_TOKEN,
};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, warn};

const MEMORIES_HEADER: &str = "## MEMORIES";
const PATTERNS_HEADER: &str = "## PATTERNS";
const SECTION_SEPARATOR: &str = "\n\n";

/// Builds enriched prompts for one substrate.
#[derive(Clone)]
pub struct Orchestrator {
    substrate: SiccSubstrate,
    embeddings: Arc<EmbeddingService>,
    resolver: LayerResolver,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        substrate: SiccSubstrate,
        embeddings: Arc<EmbeddingService>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            resolver: LayerResolver::new(substrate.clone()),
            substrate,
            embeddings,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Assemble the prompt for one inbound message.
    pub async fn enrich_prompt(&self, agent_id: AgentId, request: EnrichRequest) -> EnrichedPrompt {
        let started = Instant::now();
        let EnrichRequest {
            message,
            context,
            base_prompt,
        } = request;
        let base = base_prompt.unwrap_or_else(|| self.settings.default_base_prompt.clone());
        let company = self.resolver.company_for(agent_id, &context).await;

        let memories = match self.embeddings.embed(&message).await {
            Ok(query) => self
                .resolver
                .resolve_memories(
                    agent_id,
                    query,
                    self.settings.top_k,
                    self.settings.min_similarity,
                    company.as_deref(),
                )
                .await
                .unwrap_or_else(|e| {
                    warn!(agent_id = %agent_id, error = %e, "Memory lookup failed, enriching without memories");
                    Vec::new()
                }),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Embedding failed, enriching without memories");
                Vec::new()
            }
        };
        let patterns = self
            .resolver
            .resolve_patterns(agent_id, context.clone(), company.as_deref())
            .await
            .unwrap_or_else(|e| {
                warn!(agent_id = %agent_id, error = %e, "Pattern lookup failed, enriching without patterns");
                Vec::new()
            });

        let memories: Vec<UsedMemory> = memories
            .into_iter()
            .map(|hit| UsedMemory {
                layer: hit.chunk.layer(),
                id: hit.chunk.id,
                content: hit.chunk.content,
                chunk_type: hit.chunk.chunk_type,
                similarity: hit.similarity,
            })
            .collect();
        let patterns: Vec<AppliedPattern> = patterns
            .iter()
            .map(|p| AppliedPattern {
                id: p.id,
                pattern_name: p.pattern_name.clone(),
                pattern_type: p.pattern_type,
                layer: p.layer(),
                rendered: render_pattern(p, &context),
            })
            .collect();

        let fitted = fit_budget(&base, memories, &patterns, &message, self.settings.max_tokens);
        if fitted.message_truncated {
            warn!(
                agent_id = %agent_id,
                max_tokens = self.settings.max_tokens,
                "Prompt over budget, user message truncated"
            );
        }
        let token_count = estimate_tokens(&fitted.prompt);
        debug!(
            agent_id = %agent_id,
            memories = fitted.memories.len(),
            patterns = patterns.len(),
            token_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prompt enriched"
        );
        EnrichedPrompt {
            enriched_prompt: fitted.prompt,
            original_message: message,
            memories_used: fitted.memories,
            patterns_applied: patterns,
            token_count,
            context,
            message_truncated: fitted.message_truncated,
        }
    }

    /// Apply usage counters, pattern outcomes and metrics after a reply.
    ///
    /// Unknown ids, or ids owned by another agent, are reported in
    /// `failures` instead of aborting the rest.
    pub async fn record_outcome(
        &self,
        agent_id: AgentId,
        outcome: OutcomeRecord,
    ) -> SiccResult<OutcomeReport> {
        if let Some(score) = outcome.satisfaction {
            if !(0.0..=5.0).contains(&score) {
                return Err(SiccError::Validation(format!("satisfaction {score} outside [0, 5]")));
            }
        }
        let substrate = self.substrate.clone();
        run_blocking(move || {
            let mut report = OutcomeReport::default();
            for id in &outcome.memories_used {
                let applied = substrate.memory().get(*id).and_then(|chunk| {
                    if chunk.agent_id != agent_id {
                        return Err(SiccError::Validation(format!(
                            "memory chunk {id} belongs to another agent"
                        )));
                    }
                    substrate.memory().increment_usage(*id)
                });
                match applied {
                    Ok(()) => report.memories_incremented += 1,
                    Err(e) => report.failures.push(format!("memory {id}: {e}")),
                }
            }
            for id in &outcome.patterns_applied {
                let applied = substrate.behavior().get(*id).and_then(|pattern| {
                    if pattern.agent_id != agent_id {
                        return Err(SiccError::Validation(format!(
                            "behavior pattern {id} belongs to another agent"
                        )));
                    }
                    substrate.behavior().record_application(*id, outcome.succeeded)
                });
                match applied {
                    Ok(_) => report.patterns_recorded += 1,
                    Err(e) => report.failures.push(format!("pattern {id}: {e}")),
                }
            }

            let metrics = substrate.metrics();
            metrics.record_interaction(
                agent_id,
                &InteractionRecord {
                    succeeded: outcome.succeeded,
                    response_time_ms: outcome.response_time_ms,
                    satisfaction: outcome.satisfaction,
                },
            )?;
            if report.memories_incremented > 0 {
                metrics.increment_memory_usage(agent_id, report.memories_incremented as u64)?;
            }
            if report.patterns_recorded > 0 {
                metrics.increment_pattern_application(agent_id, report.patterns_recorded as u64)?;
            }
            if !report.failures.is_empty() {
                warn!(agent_id = %agent_id, failures = report.failures.len(), "Outcome recorded with failures");
            }
            Ok(report)
        })
        .await
    }
}

struct Fitted {
    prompt: String,
    memories: Vec<UsedMemory>,
    message_truncated: bool,
}

/// Lay the prompt out and enforce the token budget: memories go first,
/// from the tail, then the message is cut from its end.
fn fit_budget(
    base: &str,
    mut memories: Vec<UsedMemory>,
    patterns: &[AppliedPattern],
    message: &str,
    max_tokens: usize,
) -> Fitted {
    let budget = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    loop {
        let prompt = layout(base, &memories, patterns, message);
        if prompt.chars().count() <= budget {
            return Fitted {
                prompt,
                memories,
                message_truncated: false,
            };
        }
        if memories.pop().is_none() {
            break;
        }
    }

    let prefix = layout(base, &[], patterns, "");
    let prefix_chars = prefix.chars().count();
    let separator = if prefix.is_empty() { 0 } else { SECTION_SEPARATOR.len() };
    let room = budget.saturating_sub(prefix_chars + separator);
    Fitted {
        prompt: layout(base, &[], patterns, truncate_chars(message, room)),
        memories,
        message_truncated: true,
    }
}

/// Base prompt, memories, patterns and message, each section separated by a
/// blank line. Empty sections are left out.
fn layout(base: &str, memories: &[UsedMemory], patterns: &[AppliedPattern], message: &str) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(4);
    if !base.trim().is_empty() {
        sections.push(base.to_string());
    }
    if !memories.is_empty() {
        let mut block = MEMORIES_HEADER.to_string();
        for m in memories {
            block.push_str(&format!("\n- [{}] {}", m.chunk_type, m.content));
        }
        sections.push(block);
    }
    if !patterns.is_empty() {
        let mut block = PATTERNS_HEADER.to_string();
        for p in patterns {
            block.push_str(&format!("\n- {}: {}", p.pattern_name, p.rendered));
        }
        sections.push(block);
    }
    if !message.is_empty() {
        sections.push(message.to_string());
    }
    sections.join(SECTION_SEPARATOR)
}

/// Render a pattern's `action_config` for the PATTERNS block.
///
/// A `template` wins (with `{{key}}` filled from the runtime context);
/// otherwise the field conventional for the pattern type is used, and the
/// compact JSON of the config is the last resort.
pub fn render_pattern(pattern: &BehaviorPattern, context: &RuntimeContext) -> String {
    let config = &pattern.action_config;
    if let Some(template) = config.get("template").and_then(Value::as_str) {
        return fill_template(template, context);
    }
    let text = |key: &str| config.get(key).and_then(Value::as_str).map(str::to_string);
    let conventional = match pattern.pattern_type {
        PatternType::ResponseStrategy => text("strategy"),
        PatternType::ToneAdjustment => text("tone"),
        PatternType::ResponseOptimization => text("guideline"),
        PatternType::FlowOptimization => config.get("steps").and_then(Value::as_array).map(|steps| {
            steps.iter().map(value_text).collect::<Vec<_>>().join(" -> ")
        }),
    };
    match conventional.filter(|s| !s.is_empty()) {
        Some(rendered) => rendered,
        None if config.is_null() => String::new(),
        None => config.to_string(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").ok())
        .as_ref()
}

/// Replace `{{key}}` with the context value; unknown keys stay as written.
fn fill_template(template: &str, context: &RuntimeContext) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures<'_>| match context.get(&caps[1]) {
        Some(value) => value_text(value),
        None => caps[0].to_string(),
    })
    .into_owned()
}
