//! Deterministic transcript heuristics that propose candidate learnings.
//!
//! Three detectors run over an agent's recent transcripts:
//! - frequent business terms become `business_term` memories
//! - user questions asked again in other conversations become `faq` memories
//! - assistant phrasings that keep ending well-rated conversations become
//!   `response_strategy` patterns
//!
//! Confidence grows from zero with the evidence behind a proposal, so a
//! candidate seen only at the detection minimum scores under the review
//! threshold. Equal input always yields the same proposals in the same order.

use serde_json::json;
use sicc_runtime::text::{first_sentence, jaccard, token_set, tokenize, truncate_chars, words};
use sicc_types::agent::AgentId;
use sicc_types::config::LearningSettings;
use sicc_types::learning::{Analysis, Candidate, LearningType, NewLearning, SourceData};
use sicc_types::memory::{normalize_content, ChunkType};
use sicc_types::pattern::{PatternType, TriggerContext};
use sicc_types::transcript::{Role, Transcript};
use std::collections::{BTreeMap, BTreeSet, HashSet};

const MIN_UNIGRAM_CHARS: usize = 4;
const EXCERPT_CHARS: usize = 200;
const QUESTION_CHARS: usize = 300;
const ANSWER_CHARS: usize = 600;
const PATTERN_NAME_TOKENS: usize = 4;

const GREETINGS: &[&str] = &[
    "oi", "olá", "ola", "hello", "hi", "hey", "bom dia", "boa tarde", "boa noite", "good morning",
    "good afternoon", "good evening",
];

/// What the agent already knows, so known facts are not proposed again.
#[derive(Debug, Clone, Default)]
pub struct KnownKnowledge {
    /// Content tokens of every active memory, space-padded for phrase lookup.
    memory_phrases: Vec<String>,
    /// Normalized contents of every active memory.
    memory_texts: Vec<String>,
    /// Names of the agent's active patterns.
    pattern_names: HashSet<String>,
}

impl KnownKnowledge {
    pub fn new(
        memory_contents: impl IntoIterator<Item = String>,
        pattern_names: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut known = Self::default();
        for content in memory_contents {
            known.memory_phrases.push(format!(" {} ", tokenize(&content).join(" ")));
            known.memory_texts.push(normalize_content(&content));
        }
        known.pattern_names = pattern_names.into_iter().collect();
        known
    }

    fn knows_term(&self, term: &str) -> bool {
        let needle = format!(" {term} ");
        self.memory_phrases.iter().any(|p| p.contains(&needle))
    }

    fn knows_text(&self, text: &str) -> bool {
        let needle = normalize_content(text);
        self.memory_texts.iter().any(|t| t.contains(&needle))
    }
}

/// A candidate learning before it is recorded for an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub learning_type: LearningType,
    pub candidate: Candidate,
    pub excerpt: String,
    pub occurrences: u32,
    pub conversations: u32,
    pub confidence: f32,
    pub analysis: Analysis,
}

impl Proposal {
    pub fn into_learning(self, agent_id: AgentId) -> NewLearning {
        NewLearning {
            agent_id,
            learning_type: self.learning_type,
            source_data: SourceData {
                excerpt: self.excerpt,
                candidate: self.candidate,
                occurrences: self.occurrences,
                conversations: self.conversations,
            },
            analysis: self.analysis,
            confidence: self.confidence,
        }
    }
}

/// Run every detector.
pub fn propose(
    transcripts: &[Transcript],
    known: &KnownKnowledge,
    settings: &LearningSettings,
) -> Vec<Proposal> {
    let mut proposals = frequent_terms(transcripts, known, settings);
    proposals.extend(frequent_questions(transcripts, known, settings));
    proposals.extend(successful_responses(transcripts, known, settings));
    proposals
}

/// Confidences are kept to two decimals so threshold comparisons are exact.
fn round2(value: f64) -> f32 {
    ((value.clamp(0.0, 1.0) * 100.0).round() / 100.0) as f32
}

#[derive(Default)]
struct TermStats {
    count: u32,
    conversations: BTreeSet<usize>,
    excerpt: Option<String>,
}

/// Business terms: content unigrams (at least four characters) and bigrams
/// repeated across the window.
pub fn frequent_terms(
    transcripts: &[Transcript],
    known: &KnownKnowledge,
    settings: &LearningSettings,
) -> Vec<Proposal> {
    let mut stats: BTreeMap<String, TermStats> = BTreeMap::new();
    for (idx, transcript) in transcripts.iter().enumerate() {
        for message in &transcript.messages {
            let tokens: Vec<String> = tokenize(&message.content)
                .into_iter()
                .filter(|t| !t.chars().all(|c| c.is_numeric()))
                .collect();
            let unigrams = tokens
                .iter()
                .filter(|t| t.chars().count() >= MIN_UNIGRAM_CHARS)
                .cloned();
            let bigrams = tokens.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
            for term in unigrams.chain(bigrams) {
                let entry = stats.entry(term).or_default();
                entry.count += 1;
                entry.conversations.insert(idx);
                if entry.excerpt.is_none() {
                    entry.excerpt = Some(truncate_chars(message.content.trim(), EXCERPT_CHARS).to_string());
                }
            }
        }
    }

    let threshold = settings.min_term_frequency.max(1);
    let kept: BTreeMap<&String, &TermStats> = stats
        .iter()
        .filter(|(_, s)| {
            s.count >= threshold && (s.conversations.len() >= 2 || s.count >= threshold * 2)
        })
        .collect();
    let covered = |term: &str, count: u32| {
        kept.iter().any(|(other, s)| {
            other.contains(' ') && s.count >= count && other.split(' ').any(|w| w == term)
        })
    };

    kept.iter()
        .filter(|(term, s)| term.contains(' ') || !covered(term.as_str(), s.count))
        .filter(|(term, _)| !known.knows_term(term.as_str()))
        .map(|(term, s)| {
            let conversations = s.conversations.len() as u32;
            Proposal {
                learning_type: LearningType::MemoryAdded,
                candidate: Candidate::Memory {
                    content: (*term).clone(),
                    chunk_type: ChunkType::BusinessTerm,
                },
                excerpt: s.excerpt.clone().unwrap_or_default(),
                occurrences: s.count,
                conversations,
                confidence: round2(
                    0.05 * f64::from(s.count.min(8)) + 0.15 * f64::from(conversations.min(3)),
                ),
                analysis: Analysis {
                    detected_pattern: format!(
                        "term '{term}' mentioned {} times in {conversations} conversations",
                        s.count
                    ),
                    recommendation: format!("Add '{term}' to the agent's business vocabulary"),
                },
            }
        })
        .collect()
}

struct Question<'a> {
    conversation: usize,
    message: usize,
    text: &'a str,
    tokens: HashSet<String>,
}

/// FAQs: user questions whose paraphrases show up in at least two
/// conversations. The first assistant reply after a question answers it.
pub fn frequent_questions(
    transcripts: &[Transcript],
    known: &KnownKnowledge,
    settings: &LearningSettings,
) -> Vec<Proposal> {
    let mut clusters: Vec<Vec<Question<'_>>> = Vec::new();
    for (conversation, transcript) in transcripts.iter().enumerate() {
        for (message, m) in transcript.messages.iter().enumerate() {
            if m.role != Role::User || !m.content.contains('?') {
                continue;
            }
            let tokens = token_set(&m.content);
            if tokens.is_empty() {
                continue;
            }
            let question = Question {
                conversation,
                message,
                text: m.content.trim(),
                tokens,
            };
            let existing = clusters
                .iter()
                .position(|c| jaccard(&c[0].tokens, &question.tokens) >= settings.paraphrase_similarity);
            match existing {
                Some(idx) => clusters[idx].push(question),
                None => clusters.push(vec![question]),
            }
        }
    }

    let answer_to = |q: &Question<'_>| {
        transcripts[q.conversation].messages[q.message + 1..]
            .iter()
            .take_while(|m| m.role != Role::User)
            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.trim())
    };

    clusters
        .into_iter()
        .filter_map(|cluster| {
            let conversations: BTreeSet<usize> = cluster.iter().map(|q| q.conversation).collect();
            if conversations.len() < 2 {
                return None;
            }
            let question = truncate_chars(cluster[0].text, QUESTION_CHARS);
            if known.knows_text(question) {
                return None;
            }
            let answer = cluster.iter().find_map(answer_to);
            let content = match answer {
                Some(a) => format!("Q: {question} A: {}", truncate_chars(a, ANSWER_CHARS)),
                None => format!("Q: {question}"),
            };
            let size = cluster.len() as u32;
            let bonus = if answer.is_some() { 0.2 } else { 0.0 };
            Some(Proposal {
                learning_type: LearningType::MemoryAdded,
                candidate: Candidate::Memory {
                    content,
                    chunk_type: ChunkType::Faq,
                },
                excerpt: truncate_chars(question, EXCERPT_CHARS).to_string(),
                occurrences: size,
                conversations: conversations.len() as u32,
                confidence: round2(
                    0.1 * f64::from(size.min(4)) + 0.1 * f64::from(conversations.len().min(3) as u32) + bonus,
                ),
                analysis: Analysis {
                    detected_pattern: format!(
                        "question asked {size} times across {} conversations",
                        conversations.len()
                    ),
                    recommendation: if answer.is_some() {
                        "Store the question with its usual answer as an FAQ".to_string()
                    } else {
                        "Store the question as an FAQ and write an answer for it".to_string()
                    },
                },
            })
        })
        .collect()
}

/// Message type of a user message: greeting, question or statement.
pub fn classify_message(text: &str) -> &'static str {
    let words = words(text);
    let opening = words.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
    let greets = GREETINGS
        .iter()
        .any(|g| words.first().map(|w| w == g).unwrap_or(false) || opening == *g);
    if greets {
        "greeting"
    } else if text.contains('?') {
        "question"
    } else {
        "statement"
    }
}

struct Phrasing {
    text: String,
    trigger: &'static str,
    ratings: BTreeMap<usize, f64>,
}

/// Response strategies: an assistant phrasing (its first sentence) that
/// recurs in rated conversations whose mean satisfaction is high.
pub fn successful_responses(
    transcripts: &[Transcript],
    known: &KnownKnowledge,
    settings: &LearningSettings,
) -> Vec<Proposal> {
    let mut phrasings: BTreeMap<String, Phrasing> = BTreeMap::new();
    for (idx, transcript) in transcripts.iter().enumerate() {
        let Some(rating) = transcript.satisfaction else {
            continue;
        };
        let mut last_user: Option<&str> = None;
        for message in &transcript.messages {
            match message.role {
                Role::User => last_user = Some(message.content.as_str()),
                Role::Assistant => {
                    let sentence = first_sentence(&message.content);
                    let key = normalize_content(sentence);
                    if tokenize(&key).is_empty() {
                        continue;
                    }
                    let entry = phrasings.entry(key).or_insert_with(|| Phrasing {
                        text: sentence.to_string(),
                        trigger: classify_message(last_user.unwrap_or("")),
                        ratings: BTreeMap::new(),
                    });
                    entry.ratings.entry(idx).or_insert(rating);
                }
                Role::System => {}
            }
        }
    }

    phrasings
        .into_iter()
        .filter_map(|(key, phrasing)| {
            let support = phrasing.ratings.len() as u32;
            if support < 2 {
                return None;
            }
            let mean = phrasing.ratings.values().sum::<f64>() / f64::from(support);
            if mean < settings.min_satisfaction {
                return None;
            }
            let slug = tokenize(&key)
                .into_iter()
                .take(PATTERN_NAME_TOKENS)
                .collect::<Vec<_>>()
                .join("_");
            let pattern_name = format!("response_{slug}");
            if known.pattern_names.contains(&pattern_name) {
                return None;
            }
            let mut trigger = TriggerContext::new();
            trigger.insert("message_type".into(), json!(phrasing.trigger));
            Some(Proposal {
                learning_type: LearningType::PatternAdded,
                candidate: Candidate::Pattern {
                    pattern_name: pattern_name.clone(),
                    pattern_type: PatternType::ResponseStrategy,
                    trigger_context: trigger,
                    action_config: json!({
                        "strategy": phrasing.text,
                        "mean_satisfaction": mean,
                        "support": support,
                    }),
                },
                excerpt: truncate_chars(&phrasing.text, EXCERPT_CHARS).to_string(),
                occurrences: support,
                conversations: support,
                confidence: round2(0.2 * (mean - 3.0) + 0.1 * f64::from(support.min(4))),
                analysis: Analysis {
                    detected_pattern: format!(
                        "reply '{}' used in {support} conversations rated {mean:.1} on average",
                        truncate_chars(&phrasing.text, 80)
                    ),
                    recommendation: format!(
                        "Prefer this phrasing for {} messages ({pattern_name})",
                        phrasing.trigger
                    ),
                },
            })
        })
        .collect()
}
