/// Managed remote vector index (Pinecone-style REST `query` endpoint)
///
/// Secondary dense backend. Matches carry clause fields in their metadata; a match
/// without usable metadata is dropped rather than failing the batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::RegmatchError;
use crate::store::{ClauseChunk, DenseBackend, Diagnostics, SourceTag};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<Match>,
}

#[derive(Deserialize)]
struct Match {
    id: String,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// HTTP client for the managed index.
pub struct RemoteVectorIndex {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    namespace: Option<String>,
}

impl RemoteVectorIndex {
    /// `timeout` bounds each request, connection setup included.
    pub fn new(
        url: String,
        api_key: Option<String>,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RegmatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegmatchError::Config(format!("Failed to build remote index client: {}", e)))?;

        Ok(RemoteVectorIndex {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            namespace,
        })
    }
}

fn metadata_str(metadata: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Convert a match into the common clause shape; None if it lacks required fields.
fn match_to_chunk(m: Match) -> Option<ClauseChunk> {
    let content = metadata_str(&m.metadata, "content").filter(|c| !c.trim().is_empty())?;
    let regulation_id = metadata_str(&m.metadata, "regulation_id")?;
    let clause_id = metadata_str(&m.metadata, "clause_id").unwrap_or_default();
    let score = m.score.filter(|s| s.is_finite())?.clamp(0.0, 1.0);

    let mut diagnostics = Diagnostics::default();
    diagnostics.dense_score = Some(score);
    diagnostics.backend = Some("remote".to_string());

    Some(ClauseChunk {
        id: m.id,
        regulation_id,
        clause_id,
        content,
        source: SourceTag::Dense,
        score,
        diagnostics,
    })
}

#[async_trait]
impl DenseBackend for RemoteVectorIndex {
    fn name(&self) -> &str {
        "remote"
    }

    async fn nearest(
        &self,
        vector: &[f32],
        top_k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ClauseChunk>, RegmatchError> {
        let request = QueryRequest {
            vector,
            top_k,
            include_metadata: true,
            filter: scope.map(|s| serde_json::json!({ "regulation_id": { "$eq": s } })),
            namespace: self.namespace.as_deref(),
        };

        let mut builder = self.client.post(format!("{}/query", self.url)).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.header("Api-Key", key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RegmatchError::Storage(format!("Remote index request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(RegmatchError::Storage(format!(
                "Remote index returned status {}: {}",
                status, body
            )));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| RegmatchError::Storage(format!("Failed to parse remote index response: {}", e)))?;

        let total = parsed.matches.len();
        let mut chunks: Vec<ClauseChunk> = parsed.matches.into_iter().filter_map(match_to_chunk).collect();
        if chunks.len() < total {
            tracing::warn!(dropped = total - chunks.len(), "Dropped malformed remote index matches");
        }
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);
        Ok(chunks)
    }
}
