/// PostgreSQL-backed clause store
///
/// Uses sqlx with PgPool for connection pooling. One store serves three signals:
/// pgvector nearest-neighbour search, full-text/substring search, and the sparse
/// term-weight table. Supports optional migration execution on startup.

use async_trait::async_trait;
use sqlx::{
    postgres::{PgPool, PgPoolOptions, PgRow},
    Row,
};
use std::time::Duration;

use crate::errors::RegmatchError;
use crate::search::terms::substring_score;
use crate::store::{
    ClauseChunk, DenseBackend, Diagnostics, SourceTag, SparseHit, TermWeightIndex,
    TextSearchBackend,
};

/// PostgreSQL-backed clause store using sqlx connection pool.
pub struct PostgresClauseStore {
    pool: PgPool,
    /// Only embeddings produced by this model are searched; None searches all.
    model_name: Option<String>,
}

/// Postgres LIMIT for a caller-supplied count, saturating instead of wrapping.
fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(20)         // dense, lexical and sparse share the pool per query
        .acquire_timeout(Duration::from_secs(3))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
}

impl PostgresClauseStore {
    /// Connect to the PostgreSQL database at database_url.
    ///
    /// If run_migrations is true, automatically runs pending migrations on startup.
    pub async fn new(database_url: &str, run_migrations: bool) -> Result<Self, RegmatchError> {
        let pool = pool_options()
            .min_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| RegmatchError::Storage(format!("Failed to connect to database: {}", e)))?;

        let store = PostgresClauseStore { pool, model_name: None };
        if run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Build the store without connecting. Connections are opened per query, so
    /// an unreachable database fails the signals that use it instead of startup.
    ///
    /// Only a malformed `database_url` is an error here.
    pub fn connect_lazy(database_url: &str) -> Result<Self, RegmatchError> {
        let pool = pool_options()
            .connect_lazy(database_url)
            .map_err(|e| RegmatchError::Config(format!("Invalid database_url: {}", e)))?;
        Ok(PostgresClauseStore { pool, model_name: None })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<(), RegmatchError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RegmatchError::Storage(format!("Migration failed: {}", e)))
    }

    /// Restrict vector search to embeddings from `model_name`, so query vectors
    /// are never compared against another model's space.
    pub fn with_embedding_model(mut self, model_name: &str) -> Self {
        self.model_name = Some(model_name.to_string());
        self
    }
}

/// Map a clause row; rows with missing columns or empty content are rejected.
fn row_to_chunk(row: &PgRow, source: SourceTag) -> Result<ClauseChunk, RegmatchError> {
    let id: String = row.try_get("id").map_err(|e| RegmatchError::Storage(e.to_string()))?;
    let content: String = row.try_get("content").map_err(|e| RegmatchError::Storage(e.to_string()))?;
    if content.trim().is_empty() {
        return Err(RegmatchError::Storage(format!("clause {} has empty content", id)));
    }
    Ok(ClauseChunk {
        id,
        regulation_id: row.try_get("regulation_id").map_err(|e| RegmatchError::Storage(e.to_string()))?,
        clause_id: row.try_get("clause_id").map_err(|e| RegmatchError::Storage(e.to_string()))?,
        content,
        source,
        score: 0.0,
        diagnostics: Diagnostics::default(),
    })
}

/// Map every row, dropping (and logging) the malformed ones.
fn map_rows<F>(rows: &[PgRow], source: SourceTag, mut finish: F) -> Vec<ClauseChunk>
where
    F: FnMut(&PgRow, &mut ClauseChunk) -> Result<(), RegmatchError>,
{
    rows.iter()
        .filter_map(|row| {
            let mapped = row_to_chunk(row, source).and_then(|mut chunk| {
                finish(row, &mut chunk)?;
                Ok(chunk)
            });
            match mapped {
                Ok(chunk) => Some(chunk),
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Dropping malformed clause row");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl DenseBackend for PostgresClauseStore {
    fn name(&self) -> &str {
        "pgvector"
    }

    async fn nearest(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let embedding = pgvector::Vector::from(vector.to_vec());
        let rows = sqlx::query(
            "SELECT c.id, c.regulation_id, c.clause_id, c.content, \
                    (1 - (e.embedding <=> $1))::float8 AS similarity \
             FROM clause_embeddings e \
             JOIN regulatory_clauses c ON c.id = e.clause_pk \
             WHERE e.is_current = TRUE \
               AND ($2::text IS NULL OR c.regulation_id = $2) \
               AND ($4::text IS NULL OR e.model_name = $4) \
             ORDER BY e.embedding <=> $1 \
             LIMIT $3",
        )
        .bind(&embedding)
        .bind(scope)
        .bind(sql_limit(top_k))
        .bind(self.model_name.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegmatchError::Storage(format!("Vector search failed: {}", e)))?;

        Ok(map_rows(&rows, SourceTag::Dense, |row, chunk| {
            let similarity: f64 = row
                .try_get("similarity")
                .map_err(|e| RegmatchError::Storage(e.to_string()))?;
            let similarity = similarity.clamp(0.0, 1.0);
            chunk.score = similarity;
            chunk.diagnostics.dense_score = Some(similarity);
            chunk.diagnostics.backend = Some("pgvector".to_string());
            Ok(())
        }))
    }
}

#[async_trait]
impl TextSearchBackend for PostgresClauseStore {
    async fn full_text(
        &self,
        terms: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        // Terms are alphanumeric tokens, so joining them cannot inject tsquery syntax.
        let tsquery = terms.join(" & ");

        let rows = sqlx::query(
            "SELECT id, regulation_id, clause_id, content, \
                    ts_rank_cd(to_tsvector('english', content), q, 32)::float8 AS rank \
             FROM regulatory_clauses, to_tsquery('english', $1) AS q \
             WHERE to_tsvector('english', content) @@ q \
               AND ($2::text IS NULL OR regulation_id = $2) \
             ORDER BY rank DESC \
             LIMIT $3",
        )
        .bind(&tsquery)
        .bind(scope)
        .bind(sql_limit(top_k))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegmatchError::Storage(format!("Full-text search failed: {}", e)))?;

        Ok(map_rows(&rows, SourceTag::Lexical, |row, chunk| {
            let rank: f64 = row.try_get("rank").map_err(|e| RegmatchError::Storage(e.to_string()))?;
            chunk.score = rank;
            chunk.diagnostics.lexical_score = Some(rank);
            chunk.diagnostics.backend = Some("fulltext".to_string());
            Ok(())
        }))
    }

    async fn substring(
        &self,
        words: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let patterns: Vec<String> = words.iter().map(|w| format!("%{}%", w)).collect();

        // Over-fetch, then rank by how many words each clause contains.
        let rows = sqlx::query(
            "SELECT id, regulation_id, clause_id, content \
             FROM regulatory_clauses \
             WHERE content ILIKE ANY($1) \
               AND ($2::text IS NULL OR regulation_id = $2) \
             LIMIT $3",
        )
        .bind(&patterns)
        .bind(scope)
        .bind(sql_limit(top_k.saturating_mul(4)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegmatchError::Storage(format!("Substring search failed: {}", e)))?;

        let mut chunks = map_rows(&rows, SourceTag::Fallback, |_, chunk| {
            let score = substring_score(&chunk.content, words);
            chunk.score = score;
            chunk.diagnostics.lexical_score = Some(score);
            chunk.diagnostics.backend = Some("substring".to_string());
            Ok(())
        });
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);
        Ok(chunks)
    }
}

#[async_trait]
impl TermWeightIndex for PostgresClauseStore {
    async fn term_weights(
        &self,
        tokens: &[String],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<SparseHit>, RegmatchError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT w.clause_pk, SUM(w.weight)::float8 AS score \
             FROM clause_term_weights w \
             JOIN regulatory_clauses c ON c.id = w.clause_pk \
             WHERE w.term = ANY($1) \
               AND ($2::text IS NULL OR c.regulation_id = $2) \
             GROUP BY w.clause_pk \
             ORDER BY score DESC \
             LIMIT $3",
        )
        .bind(tokens)
        .bind(scope)
        .bind(sql_limit(top_k))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RegmatchError::Storage(format!("Term-weight search failed: {}", e)))?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let clause_id: Result<String, _> = row.try_get("clause_pk");
            let score: Result<f64, _> = row.try_get("score");
            match (clause_id, score) {
                (Ok(clause_id), Ok(score)) if score.is_finite() => hits.push(SparseHit { clause_id, score }),
                _ => tracing::warn!("Dropping malformed term-weight row"),
            }
        }
        Ok(hits)
    }
}
