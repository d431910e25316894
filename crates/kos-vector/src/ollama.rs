//! Embedding client for an Ollama-compatible `/api/embed` endpoint.
use async_trait::async_trait;
use kos_core::{EmbeddingServiceConfig, EmbeddingVector, KosError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::computer::{truncate_chars, EmbeddingComputer};

#[derive(Debug, Clone)]
pub struct OllamaEmbeddingConfig {
    pub model_name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_input_chars: usize,
}

impl Default for OllamaEmbeddingConfig {
    fn default() -> Self {
        Self::from(&EmbeddingServiceConfig::default())
    }
}

impl From<&EmbeddingServiceConfig> for OllamaEmbeddingConfig {
    fn from(config: &EmbeddingServiceConfig) -> Self {
        Self {
            model_name: config.model.clone(),
            base_url: config.base_url.clone(),
            timeout: config.timeout(),
            max_input_chars: config.max_input_chars.max(1),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct OllamaEmbeddingComputer {
    client: Client,
    config: OllamaEmbeddingConfig,
}

impl OllamaEmbeddingComputer {
    pub fn new(config: OllamaEmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| KosError::Config(format!("failed to build HTTP client: {}", e)))?;
        info!(
            "Ollama embedding client: model={} base_url={}",
            config.model_name, config.base_url
        );
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OllamaEmbeddingConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingComputer for OllamaEmbeddingComputer {
    async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OllamaEmbedRequest {
            model: &self.config.model_name,
            input: texts
                .iter()
                .map(|t| truncate_chars(t, self.config.max_input_chars))
                .collect(),
        };

        let start = Instant::now();
        let response = timeout(
            self.config.timeout,
            self.client.post(self.endpoint()).json(&request).send(),
        )
        .await
        .map_err(|_| {
            KosError::DownstreamUnavailable(format!(
                "Ollama embedding timeout after {:?}",
                self.config.timeout
            ))
        })?
        .map_err(|e| {
            KosError::DownstreamUnavailable(format!("Ollama embedding request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(KosError::DownstreamUnavailable(format!(
                "Ollama embedding API error {}: {}",
                status, body
            )));
        }

        let payload: OllamaEmbedResponse = response.json().await.map_err(|e| {
            KosError::DownstreamUnavailable(format!("malformed Ollama embedding payload: {}", e))
        })?;

        if payload.embeddings.len() != texts.len() {
            return Err(KosError::DownstreamUnavailable(format!(
                "Ollama returned {} embeddings for {} inputs",
                payload.embeddings.len(),
                texts.len()
            )));
        }

        debug!(
            "embedded {} texts with {} in {:?}",
            texts.len(),
            self.config.model_name,
            start.elapsed()
        );
        Ok(payload
            .embeddings
            .into_iter()
            .map(EmbeddingVector::new)
            .collect())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
