// src/embeddings.rs
// Embedding provider interface and the OpenAI-style HTTP client

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingsConfig;
use crate::error::{HivemindError, Result};

/// Max characters to embed (longer text is truncated)
const MAX_TEXT_CHARS: usize = 8000;

/// Retry attempts after the first try
const RETRY_ATTEMPTS: usize = 2;

/// Maps text to a fixed-length float vector.
///
/// Empty or whitespace-only input maps to the zero vector of the configured
/// dimension without touching the provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible embeddings API client
pub struct HttpEmbedder {
    api_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn from_config(config: &EmbeddingsConfig) -> Self {
        Self::new(
            "https://api.openai.com/v1/embeddings".to_string(),
            config.api_key(),
            config.model.clone(),
            config.dimensions,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_url,
            api_key,
            model,
            dimensions,
            timeout,
            http_client,
        }
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut req = self.http_client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let response = req
            .send()
            .await
            .map_err(|e| HivemindError::External(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HivemindError::External(format!(
                "embedding API error {status}: {body}"
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HivemindError::External(format!("embedding response malformed: {e}")))?;

        let embedding: Vec<f32> = json["data"][0]["embedding"]
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();

        if embedding.len() != self.dimensions {
            return Err(HivemindError::External(format!(
                "embedding has dimension {}, expected {}",
                embedding.len(),
                self.dimensions
            )));
        }

        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimensions]);
        }

        let text = if text.len() > MAX_TEXT_CHARS {
            debug!(
                "Truncating embedding input from {} to {} chars",
                text.len(),
                MAX_TEXT_CHARS
            );
            let mut end = MAX_TEXT_CHARS;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            text
        };

        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let wait = Duration::from_secs(1 << (attempt - 1));
                warn!(
                    "Embedding attempt {}/{} failed, retrying in {:?}",
                    attempt,
                    RETRY_ATTEMPTS + 1,
                    wait
                );
                tokio::time::sleep(wait).await;
            }

            match tokio::time::timeout(self.timeout, self.request_embedding(text)).await {
                Ok(Ok(embedding)) => return Ok(embedding),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(HivemindError::External(format!(
                        "embedding timed out after {:?}",
                        self.timeout
                    )))
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| HivemindError::External("embedding failed with no error".into())))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

pub mod mock {
    //! Deterministic embedder for tests

    use super::*;

    /// Embedder that hashes text into a small fixed vector. Deterministic
    /// per input, zero vector for empty input, never does I/O.
    pub struct MockEmbedder {
        dimensions: usize,
    }

    impl MockEmbedder {
        pub fn new(dimensions: usize) -> Self {
            Self { dimensions }
        }
    }

    #[async_trait]
    impl Embedder for MockEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.trim().is_empty() {
                return Ok(vec![0.0; self.dimensions]);
            }

            let mut v = vec![0.0_f32; self.dimensions];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dimensions] += b as f32 / 255.0;
            }
            Ok(crate::vector::normalize(&v))
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_input_is_zero_vector_without_provider() {
        // Point at an unreachable endpoint: empty input must not touch it
        let embedder = HttpEmbedder::new(
            "http://127.0.0.1:1/v1/embeddings".to_string(),
            None,
            "test-model".to_string(),
            8,
            Duration::from_secs(1),
        );

        let v = embedder.embed("   ").await.unwrap();
        assert_eq!(v, vec![0.0; 8]);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_external_error() {
        let embedder = HttpEmbedder::new(
            "http://127.0.0.1:1/v1/embeddings".to_string(),
            None,
            "test-model".to_string(),
            8,
            Duration::from_millis(200),
        );

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, HivemindError::External(_)));
    }

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = mock::MockEmbedder::new(4);
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        let c = embedder.embed("different").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 4);
        assert_eq!(embedder.embed("").await.unwrap(), vec![0.0; 4]);
    }
}
