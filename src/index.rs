//! Vector index client.
//!
//! The [`VectorIndex`] seam covers the four operations the incremental
//! uploader needs: list ids by prefix, fetch metadata, upsert, delete.
//! The production implementation speaks the Pinecone serverless REST API;
//! [`MemoryIndex`] is an in-process implementation used by tests and the
//! incremental-soundness checks.
//!
//! Deleting ids that are not in the index is a success; the uploader leans
//! on that for idempotent cleanup.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::RemoteError;
use crate::config::IndexConfig;
use crate::embedding::{classify_http_status, classify_reqwest_error};

/// A vector ready for upsert: chunk id, embedding, chunk metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVector {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Value,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// All vector ids starting with `prefix`.
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;
    /// Metadata for the given ids; absent ids are simply missing from the map.
    async fn fetch_metadata(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, Value>, RemoteError>;
    async fn upsert(&self, vectors: &[IndexVector]) -> Result<(), RemoteError>;
    /// Idempotent: unknown ids are a no-op success.
    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError>;
}

/// Instantiate the configured index client.
pub fn create_index(config: &IndexConfig) -> Result<Box<dyn VectorIndex>> {
    match config.provider.as_str() {
        "pinecone" => Ok(Box::new(PineconeIndex::new(config)?)),
        "disabled" => bail!("index provider is disabled; enable [index] or use --dry-run"),
        other => bail!("Unknown index provider: {}", other),
    }
}

/// Pinecone serverless REST client. Host from `PINECONE_INDEX_HOST`, key
/// from `PINECONE_API_KEY`, namespace from config.
pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    namespace: String,
}

impl PineconeIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;
        let raw_host = std::env::var("PINECONE_INDEX_HOST")
            .map_err(|_| anyhow::anyhow!("PINECONE_INDEX_HOST environment variable not set"))?;
        let host = if raw_host.starts_with("http") {
            raw_host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", raw_host.trim_end_matches('/'))
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            host,
            api_key,
            namespace: config.namespace.clone(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        let response = self
            .client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body_text));
        }
        response
            .json()
            .await
            .map_err(|e| RemoteError::Consistency(format!("index response: {}", e)))
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, RemoteError> {
        let response = self
            .client
            .get(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body_text));
        }
        response
            .json()
            .await
            .map_err(|e| RemoteError::Consistency(format!("index response: {}", e)))
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut ids = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> =
                vec![("prefix", prefix), ("limit", "100")];
            if !self.namespace.is_empty() {
                query.push(("namespace", &self.namespace));
            }
            if let Some(t) = &token {
                query.push(("paginationToken", t));
            }
            let page = self.get("/vectors/list", &query).await?;
            let vectors = page
                .get("vectors")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    RemoteError::Consistency("list response missing vectors".into())
                })?;
            for v in vectors {
                if let Some(id) = v.get("id").and_then(|i| i.as_str()) {
                    ids.push(id.to_string());
                }
            }
            token = page
                .get("pagination")
                .and_then(|p| p.get("next"))
                .and_then(|n| n.as_str())
                .map(|s| s.to_string());
            if token.is_none() {
                break;
            }
        }
        Ok(ids)
    }

    async fn fetch_metadata(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, Value>, RemoteError> {
        let mut out = BTreeMap::new();
        // The fetch endpoint caps the id list; page through in batches.
        for batch in ids.chunks(100) {
            let mut query: Vec<(&str, &str)> =
                batch.iter().map(|id| ("ids", id.as_str())).collect();
            if !self.namespace.is_empty() {
                query.push(("namespace", &self.namespace));
            }
            let page = self.get("/vectors/fetch", &query).await?;
            let vectors = page
                .get("vectors")
                .and_then(|v| v.as_object())
                .ok_or_else(|| {
                    RemoteError::Consistency("fetch response missing vectors".into())
                })?;
            for (id, vector) in vectors {
                let metadata = vector.get("metadata").cloned().unwrap_or(Value::Null);
                out.insert(id.clone(), metadata);
            }
        }
        Ok(out)
    }

    async fn upsert(&self, vectors: &[IndexVector]) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "vectors": vectors,
            "namespace": self.namespace,
        });
        self.post("/vectors/upsert", &body).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({
            "ids": ids,
            "namespace": self.namespace,
        });
        self.post("/vectors/delete", &body).await?;
        Ok(())
    }
}

/// In-memory index used by tests.
#[derive(Default)]
pub struct MemoryIndex {
    vectors: Mutex<BTreeMap<String, IndexVector>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.vectors
            .lock()
            .expect("memory index poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<IndexVector> {
        self.vectors
            .lock()
            .expect("memory index poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.vectors.lock().expect("memory index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn list_ids(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .vectors
            .lock()
            .expect("memory index poisoned")
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn fetch_metadata(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, Value>, RemoteError> {
        let vectors = self.vectors.lock().expect("memory index poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| vectors.get(id).map(|v| (id.clone(), v.metadata.clone())))
            .collect())
    }

    async fn upsert(&self, batch: &[IndexVector]) -> Result<(), RemoteError> {
        let mut vectors = self.vectors.lock().expect("memory index poisoned");
        for v in batch {
            vectors.insert(v.id.clone(), v.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RemoteError> {
        let mut vectors = self.vectors.lock().expect("memory index poisoned");
        for id in ids {
            vectors.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vector(id: &str) -> IndexVector {
        IndexVector {
            id: id.to_string(),
            values: vec![0.1, 0.2],
            metadata: json!({"object_name": "Account"}),
        }
    }

    #[tokio::test]
    async fn memory_index_roundtrip() {
        let index = MemoryIndex::new();
        index
            .upsert(&[vector("salesforce_object_Account")])
            .await
            .unwrap();
        let ids = index.list_ids("salesforce_object_").await.unwrap();
        assert_eq!(ids, vec!["salesforce_object_Account"]);
        let meta = index
            .fetch_metadata(&["salesforce_object_Account".to_string()])
            .await
            .unwrap();
        assert_eq!(meta["salesforce_object_Account"]["object_name"], "Account");
    }

    #[tokio::test]
    async fn delete_absent_is_noop_success() {
        let index = MemoryIndex::new();
        index
            .delete(&["salesforce_object_Ghost".to_string()])
            .await
            .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn list_respects_prefix() {
        let index = MemoryIndex::new();
        index
            .upsert(&[vector("salesforce_object_Account"), vector("other_Contact")])
            .await
            .unwrap();
        let ids = index.list_ids("salesforce_object_").await.unwrap();
        assert_eq!(ids.len(), 1);
    }
}
