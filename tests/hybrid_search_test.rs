//! End-to-end tests for `HybridSearcher` over in-memory backends.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regmatch::cache::{CacheStore, InMemoryCache};
use regmatch::config::SearchConfig;
use regmatch::embedding::{CachedEmbedder, EmbeddingError, EmbeddingProvider};
use regmatch::errors::RegmatchError;
use regmatch::rerank::SynonymTable;
use regmatch::search::terms::{substring_score, tokenize};
use regmatch::search::HybridSearcher;
use regmatch::store::postgres::PostgresClauseStore;
use regmatch::store::{
    ClauseChunk, DenseBackend, Diagnostics, SourceTag, SparseHit, TermWeightIndex, TextSearchBackend,
};

const ICO_QUERY: &str = "We notify the ICO within 72 hours of a personal data breach";

fn clause(id: &str, content: &str) -> ClauseChunk {
    ClauseChunk {
        id: id.to_string(),
        regulation_id: "UK-GDPR".to_string(),
        clause_id: format!("Art.{}", id),
        content: content.to_string(),
        source: SourceTag::Dense,
        score: 0.0,
        diagnostics: Diagnostics::default(),
    }
}

fn corpus() -> Vec<ClauseChunk> {
    vec![
        clause("A", "Controllers must keep records of processing activities."),
        clause("B", "Notify the ICO of a personal data breach within 72 hours."),
        clause("C", "Data subjects have the right of access."),
        clause("D", "Report the incident to the supervisory authority."),
    ]
}

fn ids(chunks: &[ClauseChunk]) -> Vec<&str> {
    chunks.iter().map(|c| c.id.as_str()).collect()
}

fn assert_unique(chunks: &[ClauseChunk]) {
    let unique: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(unique.len(), chunks.len(), "duplicate ids in {:?}", ids(chunks));
}

// --- Mocks ---------------------------------------------------------------

struct CountingEmbedder {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingEmbedder {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(CountingEmbedder { calls: AtomicUsize::new(0), fail })
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EmbeddingError::Api { status: 503, message: "down".into() });
        }
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }

    fn model_name(&self) -> &str {
        "counting"
    }

    fn dimension(&self) -> usize {
        3
    }
}

/// Dense backend returning a fixed ranking of corpus ids.
struct FixedDense {
    ranking: Vec<&'static str>,
    fail: bool,
    delay: Duration,
    calls: AtomicUsize,
    scopes: Mutex<Vec<Option<String>>>,
}

impl FixedDense {
    fn new(ranking: Vec<&'static str>) -> Arc<Self> {
        Arc::new(FixedDense {
            ranking,
            fail: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            scopes: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(FixedDense {
            ranking: vec![],
            fail: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            scopes: Mutex::new(Vec::new()),
        })
    }

    fn slow(ranking: Vec<&'static str>, delay: Duration) -> Arc<Self> {
        Arc::new(FixedDense {
            ranking,
            fail: false,
            delay,
            calls: AtomicUsize::new(0),
            scopes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DenseBackend for FixedDense {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn nearest(
        &self,
        _vector: &[f32],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scopes.lock().unwrap().push(scope.map(str::to_string));
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(RegmatchError::Storage("connection refused".into()));
        }
        let corpus = corpus();
        Ok(self
            .ranking
            .iter()
            .take(top_k)
            .enumerate()
            .filter_map(|(rank, id)| corpus.iter().find(|c| c.id == *id).cloned().map(|mut c| {
                c.score = 0.9 - rank as f64 * 0.1;
                c.diagnostics.dense_score = Some(c.score);
                c
            }))
            .collect())
    }
}

/// Text backend: full-text returns a fixed list, substring scans the corpus.
struct CorpusText {
    full_text_hits: Vec<&'static str>,
    fail: bool,
    terms: Mutex<Vec<String>>,
}

impl CorpusText {
    fn new(full_text_hits: Vec<&'static str>) -> Arc<Self> {
        Arc::new(CorpusText { full_text_hits, fail: false, terms: Mutex::new(Vec::new()) })
    }

    fn failing() -> Arc<Self> {
        Arc::new(CorpusText { full_text_hits: vec![], fail: true, terms: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl TextSearchBackend for CorpusText {
    async fn full_text(
        &self,
        terms: &[String],
        _top_k: usize,
        _scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        if self.fail {
            return Err(RegmatchError::Storage("fts down".into()));
        }
        self.terms.lock().unwrap().extend(terms.iter().cloned());
        let corpus = corpus();
        Ok(self
            .full_text_hits
            .iter()
            .filter_map(|id| corpus.iter().find(|c| c.id == *id).cloned())
            .map(|mut c| {
                c.source = SourceTag::Lexical;
                c.score = 0.3;
                c.diagnostics.lexical_score = Some(0.3);
                c
            })
            .collect())
    }

    async fn substring(
        &self,
        words: &[String],
        top_k: usize,
        _scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        if self.fail {
            return Err(RegmatchError::Storage("db down".into()));
        }
        let mut hits: Vec<ClauseChunk> = corpus()
            .into_iter()
            .filter_map(|mut c| {
                let score = substring_score(&c.content, words);
                (score > 0.0).then(|| {
                    c.source = SourceTag::Fallback;
                    c.score = score;
                    c.diagnostics.lexical_score = Some(score);
                    c
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(top_k);
        Ok(hits)
    }
}

struct FixedWeights(Vec<SparseHit>);

#[async_trait]
impl TermWeightIndex for FixedWeights {
    async fn term_weights(
        &self,
        _tokens: &[String],
        _top_k: usize,
        _scope: Option<&str>,
    ) -> Result<Vec<SparseHit>, RegmatchError> {
        Ok(self.0.clone())
    }
}

fn cached(provider: Arc<CountingEmbedder>, cache: Arc<dyn CacheStore>) -> Arc<CachedEmbedder> {
    Arc::new(CachedEmbedder::new(
        provider,
        cache,
        Duration::from_secs(3600),
        Duration::from_secs(1),
        Duration::from_secs(30),
    ))
}

fn fast_config() -> SearchConfig {
    SearchConfig {
        dense_timeout_ms: 500,
        lexical_timeout_ms: 500,
        sparse_timeout_ms: 500,
        ..SearchConfig::default()
    }
}

// --- Scenarios -----------------------------------------------------------

#[tokio::test]
async fn test_ico_query_merges_and_promotes_synonym_match() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let dense = FixedDense::new(vec!["A", "B", "C"]);
    let text = CorpusText::new(vec!["B", "D"]);
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(dense.clone())
        .text_backend(text.clone())
        .build()
        .unwrap();

    let results = searcher.hybrid_search(ICO_QUERY, Some(5), Some("UK-GDPR")).await.unwrap();

    assert!(results.len() <= 5);
    assert_unique(&results);
    assert_eq!(ids(&results), vec!["B", "D", "A", "C"]);

    let b = &results[0];
    assert_eq!(b.source, SourceTag::Dense);
    assert!(b.diagnostics.dense_score.is_some());
    assert_eq!(b.diagnostics.lexical_score, Some(0.3));
    assert_eq!(b.diagnostics.overlap_score, Some(1.0));

    let searched_terms = text.terms.lock().unwrap().clone();
    assert!(searched_terms.contains(&"notify".to_string()));
    assert!(searched_terms.contains(&"breach".to_string()));
    assert_eq!(*dense.scopes.lock().unwrap(), vec![Some("UK-GDPR".to_string())]);
}

#[tokio::test]
async fn test_without_synonyms_incident_clause_is_not_promoted() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["A", "B", "C"]))
        .text_backend(CorpusText::new(vec!["B", "D"]))
        .synonyms(SynonymTable::empty())
        .build()
        .unwrap();

    let results = searcher.hybrid_search(ICO_QUERY, Some(5), Some("UK-GDPR")).await.unwrap();
    assert_eq!(results.last().map(|c| c.id.as_str()), Some("D"));
}

#[tokio::test]
async fn test_dense_outage_falls_back_to_lexical() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let embedder = CountingEmbedder::new(true);
    let searcher = HybridSearcher::builder(fast_config(), cached(embedder, cache.clone()), cache)
        .dense_backend(FixedDense::failing())
        .dense_backend(FixedDense::failing())
        .text_backend(CorpusText::new(vec![]))
        .build()
        .unwrap();

    let results = searcher.hybrid_search("personal data breach", Some(3), None).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 3);
    assert!(results.iter().all(|c| c.source == SourceTag::Fallback));
    assert!(results[0].diagnostics.note().unwrap_or_default().contains("dense"));

    let nothing = searcher.hybrid_search("cryptocurrency mining", Some(3), None).await.unwrap();
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn test_all_signals_failing_is_an_error() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(true), cache.clone()), cache)
        .dense_backend(FixedDense::failing())
        .text_backend(CorpusText::failing())
        .build()
        .unwrap();

    let err = searcher.hybrid_search(ICO_QUERY, Some(5), None).await.unwrap_err();
    assert!(matches!(err, RegmatchError::AllSignalsFailed(_)));
}

#[tokio::test]
async fn test_repeat_query_served_from_cache() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let embedder = CountingEmbedder::new(false);
    let dense = FixedDense::new(vec!["A", "B", "C"]);
    let searcher = HybridSearcher::builder(fast_config(), cached(embedder.clone(), cache.clone()), cache)
        .dense_backend(dense.clone())
        .text_backend(CorpusText::new(vec!["B", "D"]))
        .build()
        .unwrap();

    let first = searcher.hybrid_search(ICO_QUERY, Some(5), Some("UK-GDPR")).await.unwrap();
    let embeds = embedder.calls.load(Ordering::SeqCst);
    let dense_calls = dense.calls.load(Ordering::SeqCst);

    let second = searcher.hybrid_search(ICO_QUERY, Some(5), Some("UK-GDPR")).await.unwrap();
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), embeds);
    assert_eq!(dense.calls.load(Ordering::SeqCst), dense_calls);

    // A different scope is a different cache entry.
    searcher.hybrid_search(ICO_QUERY, Some(5), None).await.unwrap();
    assert_eq!(dense.calls.load(Ordering::SeqCst), dense_calls + 1);
}

#[tokio::test]
async fn test_partial_results_are_not_cached() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let dense = FixedDense::failing();
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(dense.clone())
        .text_backend(CorpusText::new(vec!["B"]))
        .build()
        .unwrap();

    searcher.hybrid_search(ICO_QUERY, Some(5), None).await.unwrap();
    searcher.hybrid_search(ICO_QUERY, Some(5), None).await.unwrap();
    assert_eq!(dense.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_identical_queries_share_one_run() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let dense = FixedDense::slow(vec!["A", "B"], Duration::from_millis(100));
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(dense.clone())
        .text_backend(CorpusText::new(vec!["D"]))
        .build()
        .unwrap();

    let calls = (0..5).map(|_| {
        let searcher = searcher.clone();
        tokio::spawn(async move { searcher.hybrid_search(ICO_QUERY, Some(4), None).await })
    });
    let outcomes = futures_util::future::join_all(calls).await;

    let first = outcomes[0].as_ref().unwrap().as_ref().unwrap().clone();
    for outcome in &outcomes {
        assert_eq!(ids(outcome.as_ref().unwrap().as_ref().unwrap()), ids(&first));
    }
    assert_eq!(dense.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_degenerate_requests_return_empty() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let embedder = CountingEmbedder::new(false);
    let searcher = HybridSearcher::builder(fast_config(), cached(embedder.clone(), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["A"]))
        .text_backend(CorpusText::new(vec!["A"]))
        .build()
        .unwrap();

    assert!(searcher.hybrid_search("   ", Some(5), None).await.unwrap().is_empty());
    assert!(searcher.hybrid_search(ICO_QUERY, Some(0), None).await.unwrap().is_empty());
    assert!(searcher.find_similar_clauses("", Some(5), None).await.is_empty());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sparse_boost_recorded_without_adding_clauses() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let config = SearchConfig { sparse_enabled: true, ..fast_config() };
    let weights = FixedWeights(vec![
        SparseHit { clause_id: "A".into(), score: 2.0 },
        SparseHit { clause_id: "Z".into(), score: 9.0 },
    ]);
    let searcher = HybridSearcher::builder(config, cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["A", "C"]))
        .text_backend(CorpusText::new(vec![]))
        .term_index(Arc::new(weights))
        .build()
        .unwrap();

    let results = searcher.hybrid_search(ICO_QUERY, Some(5), None).await.unwrap();
    assert!(!results.iter().any(|c| c.id == "Z"));
    let a = results.iter().find(|c| c.id == "A").unwrap();
    assert_eq!(a.diagnostics.sparse_boost, Some(1.0));
}

async fn ranked_with_sparse(sparse_enabled: bool) -> Vec<ClauseChunk> {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let config = SearchConfig { sparse_enabled, ..fast_config() };
    let weights = FixedWeights(vec![SparseHit { clause_id: "C".into(), score: 2.0 }]);
    let searcher = HybridSearcher::builder(config, cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["A", "C"]))
        .text_backend(CorpusText::new(vec![]))
        .term_index(Arc::new(weights))
        .build()
        .unwrap();
    searcher.hybrid_search("records access", Some(2), None).await.unwrap()
}

#[tokio::test]
async fn test_sparse_boost_reorders_equal_overlap() {
    // A matches "records", C matches "access": equal overlap, A ahead on dense score.
    let plain = ranked_with_sparse(false).await;
    assert_eq!(ids(&plain), vec!["A", "C"]);
    assert_eq!(plain[0].diagnostics.overlap_score, plain[1].diagnostics.overlap_score);

    let boosted = ranked_with_sparse(true).await;
    assert_eq!(ids(&boosted), vec!["C", "A"]);
    assert_eq!(boosted[0].diagnostics.sparse_boost, Some(1.0));
}

#[tokio::test]
async fn test_cancelled_search_still_fills_result_cache() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let dense = FixedDense::slow(vec!["A", "B"], Duration::from_millis(100));
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(dense.clone())
        .text_backend(CorpusText::new(vec!["B"]))
        .build()
        .unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        searcher.hybrid_search(ICO_QUERY, Some(3), None),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let results = searcher.hybrid_search(ICO_QUERY, Some(3), None).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(dense.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_late_interaction_stage_scores_are_non_negative() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let config = SearchConfig { late_interaction_enabled: true, ..fast_config() };
    let searcher = HybridSearcher::builder(config, cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["A", "B", "C", "D"]))
        .text_backend(CorpusText::new(vec![]))
        .build()
        .unwrap();

    let results = searcher.hybrid_search(ICO_QUERY, Some(2), None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_unique(&results);
    for chunk in &results {
        let score = chunk.diagnostics.late_interaction_score.unwrap();
        assert!(score >= 0.0);
        assert_eq!(chunk.score, score);
    }
}

#[tokio::test]
async fn test_find_similar_clauses_uses_dense_only() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let text = CorpusText::new(vec!["D"]);
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["C", "A"]))
        .text_backend(text.clone())
        .build()
        .unwrap();

    let results = searcher
        .find_similar_clauses("Data subjects may request access", Some(2), Some("UK-GDPR"))
        .await;
    assert_eq!(ids(&results), vec!["C", "A"]);
    assert!(text.terms.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_find_similar_clauses_empty_when_embedding_down() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(true), cache.clone()), cache)
        .dense_backend(FixedDense::new(vec!["C", "A"]))
        .build()
        .unwrap();

    assert!(searcher.find_similar_clauses("access requests", Some(2), None).await.is_empty());
}

#[tokio::test]
async fn test_unreachable_database_falls_through_to_next_dense_backend() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(1000));
    let postgres = PostgresClauseStore::connect_lazy("postgres://regmatch@127.0.0.1:1/regmatch").unwrap();
    let remote = FixedDense::new(vec!["C", "A"]);
    let searcher = HybridSearcher::builder(fast_config(), cached(CountingEmbedder::new(false), cache.clone()), cache)
        .dense_backend(Arc::new(postgres))
        .dense_backend(remote.clone())
        .build()
        .unwrap();

    let results = searcher.find_similar_clauses("access requests", Some(2), None).await;
    assert_eq!(ids(&results), vec!["C", "A"]);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_builder_requires_a_backend() {
    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(10));
    let result = HybridSearcher::builder(SearchConfig::default(), cached(CountingEmbedder::new(false), cache.clone()), cache).build();
    assert!(matches!(result, Err(RegmatchError::Config(_))));
}

#[test]
fn test_corpus_fixture_tokens() {
    // Guards the scenario fixtures: D must only match the ICO query through synonyms.
    let d = tokenize(&corpus()[3].content);
    assert!(!d.contains(&"breach".to_string()));
    assert!(d.contains(&"incident".to_string()));
}
