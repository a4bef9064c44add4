/// Remote embeddings over an OpenAI-compatible `/embeddings` endpoint
///
/// `base_url` may point at api.openai.com or any compatible gateway. Returned
/// vectors are checked against the model's known dimension, so a misconfigured
/// gateway fails loudly instead of filling the embedding cache with vectors the
/// clause store cannot compare against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EmbeddingError, EmbeddingProvider};

/// Output dimension of the OpenAI embedding models we accept.
pub fn model_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    input: [&'a str; 1],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dim: usize,
    timeout: Duration,
}

impl OpenAIEmbeddingProvider {
    /// Fails with `NotConfigured` for an empty key or a model of unknown dimension.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::NotConfigured(
                "OpenAI API key is required when using the openai embedding provider. \
                 Set REGMATCH_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in regmatch.toml"
                    .to_string(),
            ));
        }
        let dim = model_dimension(&model).ok_or_else(|| {
            EmbeddingError::NotConfigured(format!("Unknown OpenAI embedding model '{}'", model))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::ModelInit(format!("Failed to build HTTP client: {}", e)))?;

        Ok(OpenAIEmbeddingProvider {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
            dim,
            timeout,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> EmbeddingError {
        if e.is_timeout() {
            EmbeddingError::Timeout(self.timeout.as_millis() as u64)
        } else {
            EmbeddingError::Generation(format!("Embeddings request failed: {}", e))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingsRequest { input: [text], model: &self.model };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status: status.as_u16(), message });
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("Malformed embeddings response: {}", e)))?;

        let row = parsed
            .data
            .into_iter()
            .min_by_key(|row| row.index)
            .ok_or_else(|| EmbeddingError::Generation("Embeddings response had no data".to_string()))?;

        if row.embedding.len() != self.dim {
            return Err(EmbeddingError::Generation(format!(
                "{} returned {} dimensions, expected {}",
                self.model,
                row.embedding.len(),
                self.dim
            )));
        }
        Ok(row.embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "text-embedding-3-small";

    fn provider(server: &MockServer, timeout: Duration) -> OpenAIEmbeddingProvider {
        OpenAIEmbeddingProvider::new(server.uri(), "sk-test".into(), MODEL.into(), timeout).unwrap()
    }

    #[test]
    fn test_construction_checks_key_and_model() {
        let blank = OpenAIEmbeddingProvider::new(
            "https://api.openai.com/v1".into(),
            "  ".into(),
            MODEL.into(),
            Duration::from_secs(1),
        );
        assert!(matches!(blank, Err(EmbeddingError::NotConfigured(_))));

        let unknown = OpenAIEmbeddingProvider::new(
            "https://api.openai.com/v1".into(),
            "sk-test".into(),
            "mystery-embedder".into(),
            Duration::from_secs(1),
        );
        assert!(matches!(unknown, Err(EmbeddingError::NotConfigured(_))));
        assert_eq!(model_dimension("text-embedding-3-large"), Some(3072));
    }

    #[tokio::test]
    async fn test_embed_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({ "model": MODEL, "input": ["personal data breach"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": vec![0.25f32; 1536] }]
            })))
            .mount(&server)
            .await;

        let vector = provider(&server, Duration::from_secs(2)).embed("personal data breach").await.unwrap();
        assert_eq!(vector.len(), 1536);
        assert_eq!(vector[0], 0.25);
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": [0.1, 0.2, 0.3] }]
            })))
            .mount(&server)
            .await;

        let result = provider(&server, Duration::from_secs(2)).embed("x").await;
        assert!(matches!(result, Err(EmbeddingError::Generation(_))));
    }

    #[tokio::test]
    async fn test_http_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        match provider(&server, Duration::from_secs(2)).embed("x").await {
            Err(EmbeddingError::Api { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limited");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let result = provider(&server, Duration::from_millis(50)).embed("x").await;
        assert!(matches!(result, Err(EmbeddingError::Timeout(50))));
    }
}
