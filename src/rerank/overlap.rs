/// Stage 1 rerank: key-term overlap with synonym expansion.
///
/// Each key term of the query forms a group with its synonyms. A candidate's
/// overlap ratio is the fraction of groups with at least one member among the
/// candidate's terms, so adding a synonym can only widen a group.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::search::terms::{extract_key_terms, tokenize, MAX_KEY_TERMS};
use crate::store::ClauseChunk;

const DEFAULT_SYNONYMS: &[(&str, &[&str])] = &[
    ("breach", &["incident", "violation", "compromise", "leak"]),
    ("incident", &["breach", "event", "violation"]),
    ("notify", &["inform", "report", "notification", "notice", "tell"]),
    ("notification", &["notify", "inform", "report", "notice"]),
    ("report", &["notify", "inform", "disclose"]),
    ("consent", &["permission", "authorisation", "authorization", "agreement"]),
    ("delete", &["erase", "erasure", "remove", "destroy"]),
    ("erase", &["delete", "erasure", "remove"]),
    ("erasure", &["deletion", "delete", "erase", "removal"]),
    ("retain", &["retention", "store", "keep", "preserve"]),
    ("retention", &["retain", "storage", "keep"]),
    ("personal", &["individual", "identifiable"]),
    ("data", &["information", "records"]),
    ("information", &["data", "records"]),
    ("controller", &["organisation", "organization", "company", "business"]),
    ("processor", &["vendor", "supplier", "contractor", "provider"]),
    ("transfer", &["export", "share", "disclose", "disclosure"]),
    ("security", &["protection", "safeguard", "safeguards", "encryption"]),
    ("encrypt", &["encryption", "encrypted", "pseudonymise", "pseudonymisation"]),
    ("risk", &["threat", "vulnerability", "impact"]),
    ("assessment", &["evaluation", "review", "audit", "dpia"]),
    ("audit", &["review", "inspection", "assessment"]),
    ("policy", &["procedure", "standard", "guideline", "policies"]),
    ("employee", &["staff", "personnel", "worker", "workforce"]),
    ("staff", &["employee", "employees", "personnel"]),
    ("training", &["awareness", "education"]),
    ("access", &["request", "subject", "portability"]),
    ("ico", &["regulator", "authority", "supervisory", "commissioner"]),
    ("regulator", &["authority", "supervisory", "ico", "commissioner"]),
    ("hours", &["hour", "deadline", "delay"]),
    ("record", &["records", "log", "register", "documentation"]),
    ("records", &["record", "log", "register", "documentation"]),
];

/// Term → synonyms lookup used for expansion.
#[derive(Debug, Clone)]
pub struct SynonymTable {
    entries: HashMap<String, Vec<String>>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        let entries = DEFAULT_SYNONYMS
            .iter()
            .map(|(term, syns)| (term.to_string(), syns.iter().map(|s| s.to_string()).collect()))
            .collect();
        SynonymTable { entries }
    }
}

impl SynonymTable {
    pub fn empty() -> Self {
        SynonymTable { entries: HashMap::new() }
    }

    /// Add `synonym` to the group of `term`. Both are lowercased.
    pub fn with_synonym(mut self, term: &str, synonym: &str) -> Self {
        let group = self.entries.entry(term.to_lowercase()).or_default();
        let synonym = synonym.to_lowercase();
        if !group.contains(&synonym) {
            group.push(synonym);
        }
        self
    }

    pub fn synonyms(&self, term: &str) -> &[String] {
        self.entries.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// One group per key term: the term followed by its synonyms.
    pub fn expand(&self, key_terms: &[String]) -> Vec<Vec<String>> {
        key_terms
            .iter()
            .map(|term| {
                let mut group = vec![term.clone()];
                group.extend(self.synonyms(term).iter().cloned());
                group
            })
            .collect()
    }
}

/// Fraction of groups with at least one member in `candidate_terms`.
pub fn overlap_ratio(groups: &[Vec<String>], candidate_terms: &HashSet<String>) -> f64 {
    if groups.is_empty() {
        return 0.0;
    }
    let matched = groups
        .iter()
        .filter(|group| group.iter().any(|t| candidate_terms.contains(t)))
        .count();
    matched as f64 / groups.len() as f64
}

#[derive(Debug, Clone, Default)]
pub struct TermOverlapReranker {
    synonyms: SynonymTable,
}

impl TermOverlapReranker {
    pub fn new(synonyms: SynonymTable) -> Self {
        TermOverlapReranker { synonyms }
    }

    /// Score every candidate by overlap ratio, sort descending and keep the first
    /// `keep`. Equal ratios are ordered by the incoming merged score (dense,
    /// lexical and sparse boost), then by merge order.
    pub fn rerank(&self, query: &str, candidates: Vec<ClauseChunk>, keep: usize) -> Vec<ClauseChunk> {
        let key_terms = extract_key_terms(query, MAX_KEY_TERMS);
        let groups = self.synonyms.expand(&key_terms);

        let mut scored: Vec<(f64, ClauseChunk)> = candidates
            .into_iter()
            .map(|mut chunk| {
                let merged = chunk.score;
                let terms: HashSet<String> = tokenize(&chunk.content).into_iter().collect();
                let ratio = overlap_ratio(&groups, &terms);
                chunk.diagnostics.overlap_score = Some(ratio);
                chunk.score = ratio;
                (merged, chunk)
            })
            .collect();

        scored.sort_by(|(merged_a, a), (merged_b, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(merged_b.partial_cmp(merged_a).unwrap_or(Ordering::Equal))
        });
        scored.into_iter().take(keep).map(|(_, chunk)| chunk).collect()
    }
}
