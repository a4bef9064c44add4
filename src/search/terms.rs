/// Text heuristics shared by lexical search, sparse search and stage 1 reranking.
///
/// All functions are pure. Tokens are lowercase runs of alphanumeric characters.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::config::TopKConfig;

/// Maximum key terms used for full-text queries and overlap scoring.
pub const MAX_KEY_TERMS: usize = 8;

/// Maximum words used by the substring fallback.
pub const MAX_FALLBACK_WORDS: usize = 5;

/// Maximum tokens considered by sparse retrieval.
pub const MAX_SPARSE_TOKENS: usize = 200;

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "either",
    "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "may",
    "me", "might", "more", "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "out", "over", "own", "same", "she", "so", "some",
    "such", "than", "that", "the", "their", "theirs", "them", "then", "there", "these", "they",
    "this", "those", "through", "to", "too", "under", "until", "up", "upon", "us", "very", "was",
    "we", "were", "what", "when", "where", "whether", "which", "while", "who", "whom", "why",
    "will", "with", "within", "without", "would", "you", "your", "yours",
];

fn stopwords() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOPWORDS.iter().copied().collect())
}

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?;]+(\s+|$)").expect("sentence boundary pattern is valid"))
}

pub fn is_stopword(token: &str) -> bool {
    stopwords().contains(token)
}

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Order distinct tokens by frequency (descending), then first occurrence.
fn by_frequency<'a>(tokens: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, token) in tokens.enumerate() {
        counts
            .entry(token.as_str())
            .and_modify(|(n, _)| *n += 1)
            .or_insert((1, pos));
    }
    let mut ranked: Vec<(&str, usize, usize)> =
        counts.into_iter().map(|(t, (n, first))| (t, n, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(t, _, _)| t.to_string()).collect()
}

/// Up to `max` high-frequency non-stopword terms longer than two characters.
pub fn extract_key_terms(text: &str, max: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let mut terms = by_frequency(
        tokens
            .iter()
            .filter(|t| t.chars().count() > 2 && !is_stopword(t)),
    );
    terms.truncate(max);
    terms
}

/// Up to `max` distinct words longer than three characters for substring matching.
///
/// Non-stopwords rank ahead of stopwords so the fallback stays useful when it runs
/// after an empty full-text result.
pub fn fallback_words(text: &str, max: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let ranked = by_frequency(tokens.iter().filter(|t| t.chars().count() > 3));
    let (content, stop): (Vec<String>, Vec<String>) =
        ranked.into_iter().partition(|t| !is_stopword(t));
    content.into_iter().chain(stop).take(max).collect()
}

/// Distinct tokens in first-occurrence order, from the first `cap` tokens of `text`.
pub fn sparse_tokens(text: &str, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .take(cap)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of `words` that occur (case-insensitively) in `content`.
pub fn substring_score(content: &str, words: &[String]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let haystack = content.to_lowercase();
    let hits = words.iter().filter(|w| haystack.contains(w.as_str())).count();
    hits as f64 / words.len() as f64
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn sentence_count(text: &str) -> usize {
    sentence_boundary()
        .split(text)
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count()
}

pub fn keyword_count(text: &str, keywords: &[String]) -> usize {
    tokenize(text)
        .iter()
        .filter(|t| keywords.iter().any(|k| k == *t))
        .count()
}

/// Result count for a query when the caller does not give one.
///
/// Grows from `base` for long, many-sentence, or obligation-heavy text, capped at `max`.
pub fn dynamic_top_k(text: &str, cfg: &TopKConfig) -> usize {
    let mut k = cfg.base;
    if word_count(text) > cfg.word_threshold {
        k += cfg.word_bonus;
    }
    if sentence_count(text) > cfg.sentence_threshold {
        k += cfg.sentence_bonus;
    }
    if keyword_count(text, &cfg.obligation_keywords) > cfg.keyword_threshold {
        k += cfg.keyword_bonus;
    }
    k.min(cfg.max)
}
