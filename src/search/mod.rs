/// Hybrid clause retrieval
///
/// `HybridSearcher` answers a query by running dense, lexical and (optionally)
/// sparse retrieval concurrently, merging the candidates, reranking them by
/// key-term overlap and, when enabled, token-level late interaction. Ranked
/// lists are cached per (text, top_k, scope) and concurrent identical queries
/// share one pipeline run.
///
/// A failing signal only removes its own contribution. The caller sees an error
/// only when every enabled signal failed.

pub mod dense;
pub mod lexical;
pub mod merge;
pub mod sparse;
pub mod terms;

pub use dense::DenseRetriever;
pub use lexical::LexicalRetriever;
pub use merge::merge_candidates;
pub use sparse::SparseRetriever;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cache::{cache_key, CacheStore, SingleFlight};
use crate::config::{CacheConfig, SearchConfig, TopKConfig};
use crate::embedding::EmbeddingProvider;
use crate::errors::RegmatchError;
use crate::metrics::MetricsRecorder;
use crate::rerank::{LateInteractionReranker, SynonymTable, TermOverlapReranker};
use crate::store::{ClauseChunk, DenseBackend, SourceTag, TermWeightIndex, TextSearchBackend};

/// Sparse hits fetched per requested result. Boosts only reach clauses that
/// dense or lexical search already returned, so the pool is wider than top_k.
const SPARSE_POOL_FACTOR: usize = 4;

/// A normalized search request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub raw_text: String,
    /// Restrict results to one regulation; None searches all.
    pub regulation_scope: Option<String>,
    pub requested_top_k: Option<usize>,
}

impl QueryContext {
    /// Blank scopes are treated as "no scope".
    pub fn new(raw_text: &str, requested_top_k: Option<usize>, regulation_scope: Option<&str>) -> Self {
        QueryContext {
            raw_text: raw_text.to_string(),
            regulation_scope: regulation_scope
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            requested_top_k,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.raw_text.trim().is_empty()
    }

    /// The caller's top_k, or the heuristic one derived from the text.
    pub fn effective_top_k(&self, cfg: &TopKConfig) -> usize {
        self.requested_top_k
            .unwrap_or_else(|| terms::dynamic_top_k(&self.raw_text, cfg))
    }

    fn cache_key(&self, prefix: &str, top_k: usize) -> String {
        let scope = match &self.regulation_scope {
            Some(s) => format!("scope={}", s),
            None => "all".to_string(),
        };
        cache_key(prefix, &[&self.raw_text, &top_k.to_string(), &scope])
    }
}

type SharedResults = Result<Arc<Vec<ClauseChunk>>, RegmatchError>;

/// Ranked results plus the signals that failed while producing them.
struct Ranked {
    results: Vec<ClauseChunk>,
    failed: Vec<&'static str>,
}

struct Inner {
    embedder: Arc<dyn EmbeddingProvider>,
    dense: DenseRetriever,
    lexical: Option<LexicalRetriever>,
    sparse: Option<SparseRetriever>,
    overlap: TermOverlapReranker,
    late_interaction: Option<LateInteractionReranker>,
    cache: Arc<dyn CacheStore>,
    flights: SingleFlight<SharedResults>,
    metrics: MetricsRecorder,
    config: SearchConfig,
}

/// Entry point for clause retrieval. Cheap to clone.
#[derive(Clone)]
pub struct HybridSearcher {
    inner: Arc<Inner>,
}

pub struct HybridSearcherBuilder {
    config: SearchConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn CacheStore>,
    dense_backends: Vec<Arc<dyn DenseBackend>>,
    text_backend: Option<Arc<dyn TextSearchBackend>>,
    term_index: Option<Arc<dyn TermWeightIndex>>,
    synonyms: SynonymTable,
    metrics: Option<MetricsRecorder>,
}

impl HybridSearcherBuilder {
    /// Append a dense backend. Backends are queried in the order added.
    pub fn dense_backend(mut self, backend: Arc<dyn DenseBackend>) -> Self {
        self.dense_backends.push(backend);
        self
    }

    pub fn text_backend(mut self, backend: Arc<dyn TextSearchBackend>) -> Self {
        self.text_backend = Some(backend);
        self
    }

    /// Term-weight index for sparse boosts; only used when sparse search is enabled.
    pub fn term_index(mut self, index: Arc<dyn TermWeightIndex>) -> Self {
        self.term_index = Some(index);
        self
    }

    pub fn synonyms(mut self, synonyms: SynonymTable) -> Self {
        self.synonyms = synonyms;
        self
    }

    pub fn metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<HybridSearcher, RegmatchError> {
        if self.dense_backends.is_empty() && self.text_backend.is_none() {
            return Err(RegmatchError::Config(
                "hybrid search needs at least one dense or text backend".to_string(),
            ));
        }

        let config = self.config;
        let sparse = match (config.sparse_enabled, self.term_index) {
            (true, Some(index)) => Some(SparseRetriever::new(index, config.sparse_timeout())),
            (true, None) => {
                tracing::warn!("Sparse search enabled without a term-weight index, disabling it");
                None
            }
            (false, _) => None,
        };
        let late_interaction = config
            .late_interaction_enabled
            .then(|| LateInteractionReranker::new(Arc::clone(&self.embedder)));
        let metrics = self.metrics.unwrap_or_else(|| {
            let defaults = CacheConfig::default();
            MetricsRecorder::new(
                Arc::clone(&self.cache),
                defaults.metrics_bucket_secs,
                Duration::from_secs(defaults.metrics_ttl_secs),
            )
        });

        tracing::debug!(
            dense_backends = self.dense_backends.len(),
            lexical = self.text_backend.is_some(),
            sparse = sparse.is_some(),
            late_interaction = late_interaction.is_some(),
            "Hybrid searcher configured"
        );

        Ok(HybridSearcher {
            inner: Arc::new(Inner {
                embedder: self.embedder,
                dense: DenseRetriever::new(self.dense_backends, config.dense_timeout()),
                lexical: self
                    .text_backend
                    .map(|backend| LexicalRetriever::new(backend, config.lexical_timeout())),
                sparse,
                overlap: TermOverlapReranker::new(self.synonyms),
                late_interaction,
                cache: self.cache,
                flights: SingleFlight::new(config.single_flight_lease()),
                metrics,
                config,
            }),
        })
    }
}

impl HybridSearcher {
    /// Start building a searcher. `embedder` should already be cached
    /// (see `embedding::CachedEmbedder`); query and token embeddings go through it.
    pub fn builder(
        config: SearchConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn CacheStore>,
    ) -> HybridSearcherBuilder {
        HybridSearcherBuilder {
            config,
            embedder,
            cache,
            dense_backends: Vec::new(),
            text_backend: None,
            term_index: None,
            synonyms: SynonymTable::default(),
            metrics: None,
        }
    }

    /// Ranked clauses for `query_text`, at most `top_k` (heuristic when None).
    ///
    /// Empty text or a top_k of zero yields an empty list. Errors only with
    /// `AllSignalsFailed` when no enabled signal could answer.
    pub async fn hybrid_search(
        &self,
        query_text: &str,
        top_k: Option<usize>,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let ctx = QueryContext::new(query_text, top_k, scope);
        if ctx.is_blank() || top_k == Some(0) {
            return Ok(Vec::new());
        }
        let k = ctx.effective_top_k(&self.inner.config.top_k);
        let key = ctx.cache_key("hybrid", k);

        if let Some(hit) = self.inner.cached_results(&key).await {
            tracing::debug!(top_k = k, "Hybrid search served from cache");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let write_key = key.clone();
        let shared = self
            .inner
            .flights
            .run(&key, move || async move {
                let ranked = Arc::clone(&inner).run_hybrid(&ctx, k).await?;
                if ranked.failed.is_empty() {
                    inner.store_results(&write_key, &ranked.results).await;
                } else {
                    tracing::debug!(failed = ?ranked.failed, "Partial results not cached");
                }
                Ok(Arc::new(ranked.results))
            })
            .await;

        shared.map(|results| results.as_ref().clone())
    }

    /// Nearest clauses to `clause_text` by embedding only, best first.
    ///
    /// Returns an empty list when embeddings or every dense backend are unavailable.
    pub async fn find_similar_clauses(
        &self,
        clause_text: &str,
        top_k: Option<usize>,
        scope: Option<&str>,
    ) -> Vec<ClauseChunk> {
        let ctx = QueryContext::new(clause_text, top_k, scope);
        if ctx.is_blank() || top_k == Some(0) || self.inner.dense.backend_count() == 0 {
            return Vec::new();
        }
        let k = ctx.effective_top_k(&self.inner.config.top_k);
        let key = ctx.cache_key("similar", k);

        if let Some(hit) = self.inner.cached_results(&key).await {
            tracing::debug!(top_k = k, "Similar-clause search served from cache");
            return hit;
        }

        let inner = Arc::clone(&self.inner);
        let write_key = key.clone();
        let shared = self
            .inner
            .flights
            .run(&key, move || async move {
                let results = inner
                    .dense_signal(&ctx.raw_text, k, ctx.regulation_scope.as_deref())
                    .await?;
                inner.metrics.record(SourceTag::Dense, results.len());
                inner.store_results(&write_key, &results).await;
                Ok(Arc::new(results))
            })
            .await;

        match shared {
            Ok(results) => results.as_ref().clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Similar-clause search unavailable");
                Vec::new()
            }
        }
    }
}

/// Await an optional signal task, folding a panicked task into an error.
async fn join_signal<T: Send + 'static>(
    task: Option<JoinHandle<Result<Vec<T>, RegmatchError>>>,
) -> Option<Result<Vec<T>, RegmatchError>> {
    let handle = task?;
    Some(
        handle
            .await
            .unwrap_or_else(|e| Err(RegmatchError::Internal(format!("retrieval task failed: {}", e)))),
    )
}

/// Unwrap one signal outcome, noting attempts and failures.
fn settle<T>(
    name: &'static str,
    outcome: Option<Result<Vec<T>, RegmatchError>>,
    attempted: &mut usize,
    failed: &mut Vec<(&'static str, RegmatchError)>,
) -> Vec<T> {
    match outcome {
        None => Vec::new(),
        Some(Ok(items)) => {
            *attempted += 1;
            items
        }
        Some(Err(e)) => {
            *attempted += 1;
            tracing::warn!(signal = name, error = %e, "Retrieval signal failed, continuing without it");
            failed.push((name, e));
            Vec::new()
        }
    }
}

impl Inner {
    async fn cached_results(&self, key: &str) -> Option<Vec<ClauseChunk>> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<ClauseChunk>>(&raw) {
                Ok(results) => Some(results),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cached results");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Result cache unavailable, treating as miss");
                None
            }
        }
    }

    async fn store_results(&self, key: &str, results: &[ClauseChunk]) {
        match serde_json::to_string(results) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(key, raw, self.config.result_cache_ttl()).await {
                    tracing::debug!(error = %e, "Failed to cache results");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode results for cache"),
        }
    }

    /// Embed the text, then walk the dense backend chain.
    async fn dense_signal(
        &self,
        text: &str,
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let vector = self.embedder.embed(text).await?;
        self.dense.try_search(&vector, top_k, scope).await
    }

    fn record_lexical(&self, chunks: &[ClauseChunk]) {
        let fallback = chunks.iter().filter(|c| c.source == SourceTag::Fallback).count();
        let full_text = chunks.len() - fallback;
        if full_text > 0 {
            self.metrics.record(SourceTag::Lexical, full_text);
        }
        if fallback > 0 {
            self.metrics.record(SourceTag::Fallback, fallback);
        }
    }

    async fn run_hybrid(self: Arc<Self>, ctx: &QueryContext, top_k: usize) -> Result<Ranked, RegmatchError> {
        let text = ctx.raw_text.clone();
        let scope = ctx.regulation_scope.clone();

        let dense_task = (self.dense.backend_count() > 0).then(|| {
            let inner = Arc::clone(&self);
            let (text, scope) = (text.clone(), scope.clone());
            tokio::spawn(async move { inner.dense_signal(&text, top_k, scope.as_deref()).await })
        });
        let lexical_task = self.lexical.is_some().then(|| {
            let inner = Arc::clone(&self);
            let (text, scope) = (text.clone(), scope.clone());
            tokio::spawn(async move {
                match &inner.lexical {
                    Some(lexical) => lexical.try_search(&text, top_k, scope.as_deref()).await,
                    None => Ok(Vec::new()),
                }
            })
        });
        let sparse_task = self.sparse.is_some().then(|| {
            let inner = Arc::clone(&self);
            let (text, scope) = (text.clone(), scope.clone());
            tokio::spawn(async move {
                match &inner.sparse {
                    Some(sparse) => {
                        sparse
                            .try_search(&text, top_k.saturating_mul(SPARSE_POOL_FACTOR), scope.as_deref())
                            .await
                    }
                    None => Ok(Vec::new()),
                }
            })
        });

        let (dense, lexical, sparse) = tokio::join!(
            join_signal(dense_task),
            join_signal(lexical_task),
            join_signal(sparse_task)
        );

        let mut attempted = 0usize;
        let mut failures: Vec<(&'static str, RegmatchError)> = Vec::new();
        let dense = settle("dense", dense, &mut attempted, &mut failures);
        let lexical = settle("lexical", lexical, &mut attempted, &mut failures);
        let sparse = settle("sparse", sparse, &mut attempted, &mut failures);

        if attempted > 0 && failures.len() == attempted {
            let detail = failures
                .iter()
                .map(|(name, e)| format!("{}: {}", name, e))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RegmatchError::AllSignalsFailed(detail));
        }

        if !dense.is_empty() {
            self.metrics.record(SourceTag::Dense, dense.len());
        }
        self.record_lexical(&lexical);
        if !sparse.is_empty() {
            self.metrics.record(SourceTag::Sparse, sparse.len());
        }

        let merged = merge_candidates(dense, lexical, &sparse, self.config.sparse_blend_weight);
        let candidates = merged.len();

        let pool = match self.late_interaction {
            Some(_) => top_k.saturating_mul(self.config.rerank_pool_multiplier.max(1)),
            None => top_k,
        };
        let mut results = self.overlap.rerank(&ctx.raw_text, merged, pool);
        if let Some(late_interaction) = &self.late_interaction {
            results = late_interaction.rerank(&ctx.raw_text, results, top_k).await;
        }
        results.truncate(top_k);

        let failed: Vec<&'static str> = failures.iter().map(|(name, _)| *name).collect();
        if !failed.is_empty() {
            let note = format!("partial results, unavailable: {}", failed.join(", "));
            for chunk in &mut results {
                chunk.diagnostics.set_note(&note);
            }
        }

        tracing::info!(
            top_k,
            candidates,
            returned = results.len(),
            scope = scope.as_deref().unwrap_or("all"),
            "Hybrid search complete"
        );

        Ok(Ranked { results, failed })
    }
}
