//! Remote vector-service [`Indexer`] backend.
//!
//! Talks to a hosted vector search service over JSON HTTP: dense + sparse
//! embedding on write and query (hybrid search), metadata-filtered
//! nearest-neighbor queries scoped by collection, a cross-encoder rerank
//! endpoint for second-pass scoring, and id/prefix deletes. Requests use
//! the same exponential backoff convention as the embedding providers.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{IndexerConfig, RetrievalConfig};
use crate::models::{IndexDocument, RankedPassage};

use super::{random_fetch_id, Indexer, RawMatch, SearchOptions};

const DENSE_MODEL: &str = "multilingual-e5-large";
const SPARSE_MODEL: &str = "sparse-english-v1";
const RERANK_MODEL: &str = "reranker-v2";

pub struct RemoteIndexer {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    top_n: usize,
    max_retries: u32,
}

impl RemoteIndexer {
    pub fn new(config: &IndexerConfig, retrieval: &RetrievalConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("indexer.url required for the remote backend"))?;

        let api_key_env = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| "VECTOR_API_KEY".to_string());
        let api_key = std::env::var(&api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            top_n: retrieval.top_n,
            max_retries: config.max_retries,
        })
    }

    /// POST a JSON body with retry/backoff. 429 and 5xx retry; other 4xx
    /// fail immediately.
    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .header("Api-Key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .context("Invalid JSON from vector service");
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Vector service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Vector service error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Vector service request failed after retries")))
    }

    async fn embed_dense(&self, text: &str, input_type: &str) -> Result<Vec<f64>> {
        let response = self
            .post(
                "/embed",
                &json!({
                    "model": DENSE_MODEL,
                    "parameters": { "input_type": input_type, "truncate": "END" },
                    "inputs": [{ "text": text }],
                }),
            )
            .await?;

        let values = response["data"][0]["values"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid dense embedding response"))?;
        Ok(values.iter().filter_map(|v| v.as_f64()).collect())
    }

    async fn embed_sparse(&self, text: &str, input_type: &str) -> Result<(Vec<u64>, Vec<f64>)> {
        let response = self
            .post(
                "/embed",
                &json!({
                    "model": SPARSE_MODEL,
                    "parameters": { "input_type": input_type },
                    "inputs": [{ "text": text }],
                }),
            )
            .await?;

        let indices = response["data"][0]["sparse_indices"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid sparse embedding response"))?
            .iter()
            .filter_map(|v| v.as_u64())
            .collect();
        let values = response["data"][0]["sparse_values"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid sparse embedding response"))?
            .iter()
            .filter_map(|v| v.as_f64())
            .collect();

        Ok((indices, values))
    }
}

#[async_trait]
impl Indexer for RemoteIndexer {
    fn key(&self) -> &str {
        "remote"
    }

    async fn upsert(&self, collection_id: &str, documents: &[IndexDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        // Embed all chunks of the document concurrently; the upsert
        // itself is one write.
        let records = futures::future::try_join_all(documents.iter().map(|document| async move {
            let dense = self.embed_dense(&document.text, "passage").await?;
            let (sparse_indices, sparse_values) =
                self.embed_sparse(&document.text, "passage").await?;

            anyhow::Ok(json!({
                "id": document.id,
                "values": dense,
                "sparse_values": {
                    "indices": sparse_indices,
                    "values": sparse_values,
                },
                "metadata": {
                    "content": document.text,
                    "url": document.url,
                    "collection_id": collection_id,
                    "id": document.id,
                },
            }))
        }))
        .await?;

        self.post("/records/upsert", &json!({ "records": records }))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawMatch>> {
        let dense = self.embed_dense(query, "query").await?;
        let (sparse_indices, sparse_values) = self.embed_sparse(query, "query").await?;

        let mut filter = json!({ "collection_id": collection_id });
        if !options.exclude_ids.is_empty() {
            filter["id"] = json!({ "$nin": options.exclude_ids });
        }

        let response = self
            .post(
                "/records/query",
                &json!({
                    "top_k": options.top_k,
                    "vector": dense,
                    "sparse_vector": {
                        "indices": sparse_indices,
                        "values": sparse_values,
                    },
                    "include_metadata": true,
                    "filter": filter,
                }),
            )
            .await?;

        let matches = response["matches"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid query response: missing matches"))?;

        Ok(matches
            .iter()
            .filter_map(|m| {
                Some(RawMatch {
                    id: m["id"].as_str()?.to_string(),
                    score: m["score"].as_f64().unwrap_or(0.0),
                    content: m["metadata"]["content"].as_str().unwrap_or("").to_string(),
                    url: m["metadata"]["url"].as_str().map(|s| s.to_string()),
                    item_id: m["metadata"]["item_id"].as_str().map(|s| s.to_string()),
                })
            })
            .collect())
    }

    async fn process(&self, query: &str, matches: Vec<RawMatch>) -> Result<Vec<RankedPassage>> {
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<Value> = matches
            .iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "text": m.content,
                    "url": m.url,
                    "item_id": m.item_id,
                })
            })
            .collect();

        let response = self
            .post(
                "/rerank",
                &json!({
                    "model": RERANK_MODEL,
                    "query": query,
                    "documents": documents,
                    "top_n": self.top_n,
                    "return_documents": true,
                    "parameters": { "truncate": "END" },
                }),
            )
            .await?;

        let data = response["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing data"))?;

        Ok(data
            .iter()
            .filter_map(|r| {
                let document = &r["document"];
                Some(RankedPassage {
                    id: document["id"].as_str()?.to_string(),
                    content: document["text"].as_str().unwrap_or("").to_string(),
                    url: document["url"].as_str().map(|s| s.to_string()),
                    score: r["score"].as_f64().unwrap_or(0.0),
                    item_id: document["item_id"].as_str().map(|s| s.to_string()),
                    fetch_id: random_fetch_id(),
                    query: query.to_string(),
                })
            })
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post("/records/delete", &json!({ "ids": ids })).await?;
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        // Record ids are collection-prefixed; the service deletes by
        // prefix page by page.
        let mut pagination_token: Option<String> = None;

        loop {
            let mut body = json!({ "prefix": format!("{}/", collection_id) });
            if let Some(token) = &pagination_token {
                body["pagination_token"] = json!(token);
            }

            let page = self.post("/records/list", &body).await?;
            let ids: Vec<String> = page["records"]
                .as_array()
                .map(|records| {
                    records
                        .iter()
                        .filter_map(|r| r["id"].as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            if ids.is_empty() {
                break;
            }

            self.post("/records/delete", &json!({ "ids": ids })).await?;

            pagination_token = page["pagination"]["next"].as_str().map(|s| s.to_string());
            if pagination_token.is_none() {
                break;
            }
        }

        Ok(())
    }

    fn min_best_score(&self) -> f64 {
        // Rerank scores from the hosted cross-encoder; anything below this
        // has not been a usable answer source in practice.
        0.1
    }
}
