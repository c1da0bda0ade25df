//! Layer resolver: merges individual, company and niche-base knowledge.
//!
//! Every memory and pattern carries a layer tag. For one agent the resolver
//! keeps the eligible entries (base and individual always, company only for
//! the caller's company), orders them by layer priority and then by the
//! store's own score, and suppresses lower-priority entries that another
//! layer already covers: the same normalized content for memories, the same
//! `pattern_name` for patterns.

use crate::blocking::run_blocking;
use serde_json::Value;
use sicc_memory::SiccSubstrate;
use sicc_types::agent::AgentId;
use sicc_types::error::{SiccError, SiccResult};
use sicc_types::memory::{normalize_content, Layer, ScoredChunk};
use sicc_types::pattern::{BehaviorPattern, RuntimeContext};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Runtime context key naming the caller's company.
pub const COMPANY_CONTEXT_KEY: &str = "company_id";

/// Whether an entry of `layer` owned by `entry_company` may be used for a
/// caller of `company_id`.
pub fn is_eligible(layer: Layer, entry_company: Option<&str>, company_id: Option<&str>) -> bool {
    match layer {
        Layer::Individual | Layer::Base => true,
        Layer::Company => matches!((entry_company, company_id), (Some(a), Some(b)) if a == b),
    }
}

/// Filter, order and de-duplicate memory hits. `hits` must already be in
/// the store's similarity order; the sort below is stable.
pub fn layer_memories(
    hits: Vec<ScoredChunk>,
    company_id: Option<&str>,
    limit: usize,
) -> Vec<ScoredChunk> {
    let mut eligible: Vec<ScoredChunk> = hits
        .into_iter()
        .filter(|hit| is_eligible(hit.chunk.layer(), hit.chunk.company_id(), company_id))
        .collect();
    eligible.sort_by_key(|hit| std::cmp::Reverse(hit.chunk.layer().priority()));

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for hit in eligible {
        if !seen.insert(normalize_content(&hit.chunk.content)) {
            debug!(memory_id = %hit.chunk.id, layer = %hit.chunk.layer(), "Memory shadowed by a higher layer");
            continue;
        }
        resolved.push(hit);
        if resolved.len() >= limit {
            break;
        }
    }
    resolved
}

/// Filter, order and de-duplicate applicable patterns. `patterns` must
/// already be in the store's success-rate order.
pub fn layer_patterns(
    patterns: Vec<BehaviorPattern>,
    company_id: Option<&str>,
) -> Vec<BehaviorPattern> {
    let mut eligible: Vec<BehaviorPattern> = patterns
        .into_iter()
        .filter(|p| is_eligible(p.layer(), p.company_id(), company_id))
        .collect();
    eligible.sort_by_key(|p| std::cmp::Reverse(p.layer().priority()));

    let mut seen = HashSet::new();
    eligible
        .into_iter()
        .filter(|p| seen.insert(p.pattern_name.clone()))
        .collect()
}

/// Resolver over the substrate's memory and behavior stores.
#[derive(Clone)]
pub struct LayerResolver {
    substrate: SiccSubstrate,
}

impl LayerResolver {
    pub fn new(substrate: SiccSubstrate) -> Self {
        Self { substrate }
    }

    /// Top memories for a query embedding.
    ///
    /// The whole eligible set above `min_similarity` is ranked before
    /// truncation, so a strong individual entry is never crowded out by
    /// lower layers.
    pub async fn resolve_memories(
        &self,
        agent_id: AgentId,
        query: Vec<f32>,
        limit: usize,
        min_similarity: f32,
        company_id: Option<&str>,
    ) -> SiccResult<Vec<ScoredChunk>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let hits = self
            .substrate
            .search(agent_id, query, usize::MAX, min_similarity)
            .await?;
        Ok(layer_memories(hits, company_id, limit))
    }

    /// Patterns applicable to `context`.
    pub async fn resolve_patterns(
        &self,
        agent_id: AgentId,
        context: RuntimeContext,
        company_id: Option<&str>,
    ) -> SiccResult<Vec<BehaviorPattern>> {
        let patterns = self.substrate.get_applicable(agent_id, context).await?;
        Ok(layer_patterns(patterns, company_id))
    }

    /// The company whose layer applies: `company_id` from the runtime
    /// context, else the one the agent was registered with. Unregistered
    /// agents and registry failures resolve to no company.
    pub async fn company_for(&self, agent_id: AgentId, context: &RuntimeContext) -> Option<String> {
        let from_context = context
            .get(COMPANY_CONTEXT_KEY)
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty());
        if let Some(company) = from_context {
            return Some(company.to_string());
        }
        let agents = self.substrate.agents().clone();
        match run_blocking(move || agents.get(agent_id)).await {
            Ok(record) => record.company_id,
            Err(SiccError::NotFound { .. }) => None,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Agent lookup failed, resolving without company");
                None
            }
        }
    }
}
