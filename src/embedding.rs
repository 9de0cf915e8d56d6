//! Embedding client.
//!
//! Defines the [`Embedder`] seam the uploader batches through, with the
//! OpenAI embeddings API as the production implementation. The client makes
//! exactly one HTTP call per invocation and maps the response onto the
//! shared remote-error taxonomy (429 is a quota error, 5xx and network
//! failures are transport, other 4xx are syntactic) so the shared retry
//! engine and rate limiter govern it exactly like a CLI call.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::bridge::RemoteError;
use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;
    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError>;
}

/// Instantiate the configured embedder.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "disabled" => bail!("embedding provider is disabled; enable [embedding] or use --dry-run"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// OpenAI `POST /v1/embeddings`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body_text));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Consistency(format!("embeddings response: {}", e)))?;
        parse_embeddings_response(&json, texts.len())
    }
}

/// Map a transport-level reqwest failure into the taxonomy.
pub fn classify_reqwest_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(Duration::from_secs(0))
    } else {
        RemoteError::Transport(e.to_string())
    }
}

/// Map an HTTP status into the taxonomy: 429 quota, 5xx transport, other
/// 4xx syntactic.
pub fn classify_http_status(status: u16, body: &str) -> RemoteError {
    let detail = format!("HTTP {}: {}", status, body.chars().take(300).collect::<String>());
    match status {
        429 => RemoteError::Quota(detail),
        500..=599 => RemoteError::Transport(detail),
        _ => RemoteError::Syntactic(detail),
    }
}

/// Extract `data[].embedding` ordered by `data[].index`.
fn parse_embeddings_response(
    json: &Value,
    expected: usize,
) -> Result<Vec<Vec<f32>>, RemoteError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RemoteError::Consistency("embeddings response missing data".into()))?;
    if data.len() != expected {
        return Err(RemoteError::Consistency(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(pos);
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                RemoteError::Consistency("embeddings response missing embedding".into())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}
