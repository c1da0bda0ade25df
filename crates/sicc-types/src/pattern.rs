//! Behavioral pattern types: trigger contexts, action payloads, success tracking.

use crate::agent::AgentId;
use crate::memory::{layer_of, meta_keys, set_layer, Layer, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Flat map of key -> expected value that a runtime context must satisfy.
pub type TriggerContext = HashMap<String, serde_json::Value>;

/// Runtime context supplied with an inbound message.
pub type RuntimeContext = HashMap<String, serde_json::Value>;

/// Unique identifier for a behavior pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternId(pub Uuid);

impl PatternId {
    /// Create a new random PatternId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PatternId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Closed set of pattern categories. Rendering switches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// How to answer a kind of message.
    ResponseStrategy,
    /// Tone to adopt.
    ToneAdjustment,
    /// Conversation flow to follow.
    FlowOptimization,
    /// A guideline that improved replies.
    ResponseOptimization,
}

impl PatternType {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseStrategy => "response_strategy",
            Self::ToneAdjustment => "tone_adjustment",
            Self::FlowOptimization => "flow_optimization",
            Self::ResponseOptimization => "response_optimization",
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response_strategy" => Ok(Self::ResponseStrategy),
            "tone_adjustment" => Ok(Self::ToneAdjustment),
            "flow_optimization" => Ok(Self::FlowOptimization),
            "response_optimization" => Ok(Self::ResponseOptimization),
            other => Err(format!("unknown pattern type '{other}'")),
        }
    }
}

/// A learned behavioral pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    /// Unique ID.
    pub id: PatternId,
    /// Owning agent.
    pub agent_id: AgentId,
    /// Owning client.
    pub client_id: String,
    /// Name, unique within `(agent_id, layer)` among active patterns.
    pub pattern_name: String,
    /// Category.
    pub pattern_type: PatternType,
    /// Predicate over the runtime context.
    pub trigger_context: TriggerContext,
    /// Payload consumed by the agent template.
    pub action_config: serde_json::Value,
    /// Times the pattern was applied.
    pub total_applications: u64,
    /// Times an application led to a successful reply.
    pub successful_applications: u64,
    /// `successful / total`, 0 when never applied.
    pub success_rate: f64,
    /// Open metadata, including the reserved layer keys.
    pub metadata: Metadata,
    /// Inactive patterns are never applied.
    pub is_active: bool,
    /// When the pattern was created.
    pub created_at: DateTime<Utc>,
}

impl BehaviorPattern {
    /// The pattern's knowledge layer (defaults to individual).
    pub fn layer(&self) -> Layer {
        layer_of(&self.metadata)
    }

    /// Company scope, if any.
    pub fn company_id(&self) -> Option<&str> {
        self.metadata.get(meta_keys::COMPANY_ID).and_then(|v| v.as_str())
    }

    /// Niche version that installed this pattern, if any.
    pub fn version_id(&self) -> Option<&str> {
        self.metadata.get(meta_keys::VERSION_ID).and_then(|v| v.as_str())
    }

    /// Whether the runtime context satisfies this pattern's trigger.
    pub fn matches(&self, context: &RuntimeContext) -> bool {
        trigger_matches(&self.trigger_context, context)
    }
}

/// Input for creating a behavior pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBehaviorPattern {
    /// Owning agent.
    pub agent_id: AgentId,
    /// Owning client.
    pub client_id: String,
    /// Name, unique within `(agent_id, layer)`.
    pub pattern_name: String,
    /// Category.
    pub pattern_type: PatternType,
    /// Predicate over the runtime context.
    #[serde(default)]
    pub trigger_context: TriggerContext,
    /// Payload consumed by the agent template.
    #[serde(default)]
    pub action_config: serde_json::Value,
    /// Initial application count.
    #[serde(default)]
    pub total_applications: u64,
    /// Initial success count.
    #[serde(default)]
    pub successful_applications: u64,
    /// Open metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewBehaviorPattern {
    /// An individual-layer pattern with no history.
    pub fn new(
        agent_id: AgentId,
        client_id: impl Into<String>,
        pattern_name: impl Into<String>,
        pattern_type: PatternType,
        trigger_context: TriggerContext,
        action_config: serde_json::Value,
    ) -> Self {
        Self {
            agent_id,
            client_id: client_id.into(),
            pattern_name: pattern_name.into(),
            pattern_type,
            trigger_context,
            action_config,
            total_applications: 0,
            successful_applications: 0,
            metadata: Metadata::new(),
        }
    }

    /// Seed application counters.
    pub fn with_history(mut self, total: u64, successful: u64) -> Self {
        self.total_applications = total;
        self.successful_applications = successful;
        self
    }

    /// Set the knowledge layer.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        set_layer(&mut self.metadata, layer);
        self
    }

    /// Scope the pattern to a company (company layer).
    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        set_layer(&mut self.metadata, Layer::Company);
        self.metadata.insert(
            meta_keys::COMPANY_ID.to_string(),
            serde_json::Value::String(company_id.into()),
        );
        self
    }

    /// Tag the pattern as installed by a niche version (base layer).
    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        set_layer(&mut self.metadata, Layer::Base);
        self.metadata.insert(
            meta_keys::VERSION_ID.to_string(),
            serde_json::Value::String(version_id.into()),
        );
        self
    }
}

/// Filters for listing an agent's behavior patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFilter {
    /// Only active (true) or inactive (false) patterns.
    pub is_active: Option<bool>,
    /// Only this pattern type.
    pub pattern_type: Option<PatternType>,
    /// Only this layer.
    pub layer: Option<Layer>,
    /// Metadata equality filters.
    #[serde(default)]
    pub metadata: Metadata,
}

impl PatternFilter {
    /// Active patterns only.
    pub fn active() -> Self {
        Self {
            is_active: Some(true),
            ..Default::default()
        }
    }
}

/// `successful / total`, or 0 when `total == 0`.
pub fn success_rate(total: u64, successful: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

/// A runtime context satisfies a trigger iff every trigger key is present in
/// the context with an equal value. An empty trigger matches anything.
pub fn trigger_matches(trigger: &TriggerContext, context: &RuntimeContext) -> bool {
    trigger
        .iter()
        .all(|(key, expected)| context.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> RuntimeContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_trigger_exact_match() {
        let trigger = ctx(&[("message_type", json!("greeting"))]);
        assert!(trigger_matches(&trigger, &ctx(&[("message_type", json!("greeting"))])));
        assert!(!trigger_matches(&trigger, &ctx(&[("message_type", json!("question"))])));
    }

    #[test]
    fn test_trigger_missing_key_fails() {
        let trigger = ctx(&[("message_type", json!("greeting")), ("channel", json!("web"))]);
        assert!(!trigger_matches(&trigger, &ctx(&[("message_type", json!("greeting"))])));
    }

    #[test]
    fn test_empty_trigger_is_wildcard() {
        assert!(trigger_matches(&TriggerContext::new(), &RuntimeContext::new()));
        assert!(trigger_matches(&TriggerContext::new(), &ctx(&[("a", json!(1))])));
    }

    #[test]
    fn test_extra_context_keys_ignored() {
        let trigger = ctx(&[("a", json!(1))]);
        assert!(trigger_matches(&trigger, &ctx(&[("a", json!(1)), ("b", json!(2))])));
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert!((success_rate(10, 9) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_pattern_type_labels() {
        assert_eq!(
            "tone_adjustment".parse::<PatternType>().unwrap(),
            PatternType::ToneAdjustment
        );
        assert_eq!(PatternType::FlowOptimization.as_str(), "flow_optimization");
    }
}
