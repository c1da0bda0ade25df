//! Text normalization and tokenization shared by the embedding models and
//! the transcript heuristics.

use std::collections::HashSet;
use std::sync::OnceLock;

/// English and Portuguese function words.
const STOPWORDS: &[&str] = &[
    // English
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "am", "do", "does",
    "did", "i", "you", "he", "she", "it", "we", "they", "me", "my", "your", "our", "their",
    "its", "this", "that", "these", "those", "what", "which", "who", "whom", "whose", "when",
    "where", "why", "how", "of", "in", "on", "at", "to", "for", "from", "by", "with", "about",
    "as", "into", "and", "or", "but", "if", "then", "so", "not", "no", "can", "could", "will",
    "would", "should", "may", "might", "must", "have", "has", "had", "there", "here", "some",
    "any", "all", "just", "also", "than", "too", "very", "please",
    // Portuguese
    "o", "os", "as", "um", "uma", "uns", "umas", "de", "do", "da", "dos", "das", "em", "no",
    "na", "nos", "nas", "por", "para", "pra", "com", "sem", "e", "ou", "mas", "que", "se", "é",
    "ser", "são", "foi", "como", "qual", "quais", "quando", "onde", "eu", "você", "voce", "vocês",
    "ele", "ela", "nós", "eles", "elas", "meu", "minha", "seu", "sua", "isso", "isto", "esse",
    "essa", "este", "esta", "aquele", "aquela", "ao", "aos", "à", "às", "pelo", "pela", "mais",
    "muito", "já", "não", "sim", "tem", "ter", "há", "te", "lhe", "favor",
];

/// Imperatives that frame a request rather than carry its topic.
///
/// Stored knowledge is declarative ("Consultas duram 30 minutos") while
/// inbound messages are often commands ("Descreva as consultas"). Left in,
/// these verbs take buckets in the query vector that no memory shares and
/// pull the cosine of a short command under the similarity floor. Only
/// verbs that ask for information belong here, never ones that name a
/// business action ("cancelar", "pagar", "agendar").
const INSTRUCTION_VERBS: &[&str] = &[
    "explain", "describe", "tell", "show", "list", "give", "define", "summarize", "summarise",
    "explique", "explica", "explicar", "descreva", "diga", "mostre", "liste", "defina", "resuma",
    "fale", "informe",
];

fn ignored() -> &'static HashSet<&'static str> {
    static IGNORED: OnceLock<HashSet<&'static str>> = OnceLock::new();
    IGNORED.get_or_init(|| STOPWORDS.iter().chain(INSTRUCTION_VERBS).copied().collect())
}

/// Whether the token is a stopword or an instruction verb.
pub fn is_ignored(token: &str) -> bool {
    ignored().contains(token)
}

/// Cache key form of a text: trimmed and lowercased.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Lowercased runs of Unicode alphanumerics, in order, including stopwords.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Content tokens: [`words`] without stopwords and instruction verbs.
pub fn tokenize(text: &str) -> Vec<String> {
    words(text).into_iter().filter(|w| !is_ignored(w)).collect()
}

/// Distinct content tokens.
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard similarity of two token sets; 0 when both are empty.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// The first sentence of a text (up to and including `.`, `!` or `?`), trimmed.
pub fn first_sentence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.find(['.', '!', '?']) {
        Some(end) => {
            // Terminators are ASCII, so `end + 1` is a char boundary.
            trimmed[..=end].trim()
        }
        None => trimmed,
    }
}

/// Truncate to at most `max_chars` characters, keeping the head.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_function_words_and_verbs() {
        assert_eq!(tokenize("Explain SICC"), vec!["sicc"]);
        assert_eq!(
            tokenize("What is SICC? It is a learning loop."),
            vec!["sicc", "learning", "loop"]
        );
        assert_eq!(tokenize("Qual o preço do plano premium?"), vec!["preço", "plano", "premium"]);
    }

    #[test]
    fn test_request_framing_matches_declarative_tokens() {
        assert_eq!(tokenize("Descreva o plano premium"), tokenize("Plano premium"));
        assert_eq!(tokenize("Tell me about refunds"), vec!["refunds"]);
        assert_eq!(tokenize("Quero cancelar o pedido"), vec!["quero", "cancelar", "pedido"]);
    }

    #[test]
    fn test_words_keep_unicode_runs() {
        assert_eq!(words("Olá, tudo bem?"), vec!["olá", "tudo", "bem"]);
        assert!(words("  ...  ").is_empty());
    }

    #[test]
    fn test_jaccard() {
        let a = token_set("qual o valor do plano premium");
        let b = token_set("quanto custa o plano premium");
        let sim = jaccard(&a, &b);
        assert!(sim > 0.3 && sim < 1.0, "got {sim}");
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn test_first_sentence() {
        assert_eq!(first_sentence("Olá! Como posso ajudar?"), "Olá!");
        assert_eq!(first_sentence("  sem pontuação "), "sem pontuação");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("preço", 4), "preç");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
