/// Two-stage reranking of merged candidates
///
/// Stage 1 (`overlap`) is a cheap key-term overlap score with synonym expansion
/// and always runs. Stage 2 (`late_interaction`) rescores the stage 1 survivors
/// with token-level embeddings when enabled.

pub mod late_interaction;
pub mod overlap;

pub use late_interaction::LateInteractionReranker;
pub use overlap::{SynonymTable, TermOverlapReranker};
