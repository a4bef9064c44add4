/// Clause store abstraction layer
///
/// Defines the clause data model shared by every retrieval signal and the traits
/// each backend implements. PostgreSQL (pgvector + full-text + term weights)
/// implements all three; the remote managed index implements `DenseBackend` only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::RegmatchError;

pub mod postgres;
pub mod remote;

/// Longest accepted `Diagnostics::note`, in characters.
pub const MAX_NOTE_CHARS: usize = 256;

/// Which retrieval signal produced a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Dense,
    Lexical,
    Fallback,
    Sparse,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Dense => "dense",
            SourceTag::Lexical => "lexical",
            SourceTag::Fallback => "fallback",
            SourceTag::Sparse => "sparse",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-signal scores and provenance collected while a clause moves through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Cosine similarity from a dense backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f64>,
    /// Full-text rank or substring match fraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    /// Amount added by sparse blending (already weighted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_boost: Option<f64>,
    /// Stage 1 term-overlap ratio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_score: Option<f64>,
    /// Stage 2 late-interaction score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_interaction_score: Option<f64>,
    /// Backend that served the clause: "pgvector", "remote", "fulltext", "substring"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Free-form extension, capped at MAX_NOTE_CHARS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

impl Diagnostics {
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    /// Set the extension note, truncating to MAX_NOTE_CHARS.
    pub fn set_note(&mut self, note: &str) {
        self.note = Some(note.chars().take(MAX_NOTE_CHARS).collect());
    }
}

/// A retrieved regulatory clause.
///
/// `id` is the identity used for dedup and is stable across every signal source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseChunk {
    pub id: String,
    /// Regulation the clause belongs to, e.g. "UK-GDPR"
    pub regulation_id: String,
    /// Clause reference within the regulation, e.g. "Art.33(1)"
    pub clause_id: String,
    pub content: String,
    pub source: SourceTag,
    /// Current ranking score; its scale depends on the last stage that set it
    pub score: f64,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

/// One row of sparse retrieval output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseHit {
    /// References `ClauseChunk::id`
    pub clause_id: String,
    /// Sum of matched term weights
    pub score: f64,
}

/// Nearest-neighbour search over clause embeddings.
#[async_trait]
pub trait DenseBackend: Send + Sync {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Return at most `top_k` clauses ordered by descending similarity.
    async fn nearest(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError>;
}

/// Keyword search over clause text.
#[async_trait]
pub trait TextSearchBackend: Send + Sync {
    /// Conjunctive full-text search over `terms`, ranked by text relevance.
    async fn full_text(
        &self,
        terms: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError>;

    /// Disjunctive case-insensitive substring match over `words`.
    async fn substring(
        &self,
        words: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError>;
}

/// Precomputed per-clause term weights.
#[async_trait]
pub trait TermWeightIndex: Send + Sync {
    /// Sum matched weights per clause for `tokens`, best first.
    async fn term_weights(
        &self,
        tokens: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<SparseHit>, RegmatchError>;
}
