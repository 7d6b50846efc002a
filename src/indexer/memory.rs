//! In-memory [`Indexer`] backend.
//!
//! Brute-force hybrid search over `RwLock`ed maps: a dense channel from
//! the configured embedding provider and a lexical channel from hashed
//! term vectors, blended per record. Reranking re-scores the candidate
//! set against the query's lexical vector. Used for tests and single
//! process deployments without a vector service.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding::{cosine_similarity, embed_texts, lexical_vector};
use crate::models::{IndexDocument, RankedPassage};

use super::{random_fetch_id, Indexer, RawMatch, SearchOptions};

struct StoredRecord {
    id: String,
    text: String,
    url: String,
    dense: Vec<f32>,
    lexical: Vec<f32>,
}

/// In-memory hybrid index. Collections are fully isolated maps.
pub struct InMemoryIndexer {
    embedding: EmbeddingConfig,
    retrieval: RetrievalConfig,
    collections: RwLock<HashMap<String, HashMap<String, StoredRecord>>>,
}

impl InMemoryIndexer {
    pub fn new(embedding: EmbeddingConfig, retrieval: RetrievalConfig) -> Self {
        Self {
            embedding,
            retrieval,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records currently held for a collection.
    pub fn record_count(&self, collection_id: &str) -> usize {
        self.collections
            .read()
            .unwrap()
            .get(collection_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Indexer for InMemoryIndexer {
    fn key(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, collection_id: &str, documents: &[IndexDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let dense = embed_texts(&self.embedding, &texts).await?;

        let mut collections = self.collections.write().unwrap();
        let collection = collections.entry(collection_id.to_string()).or_default();

        for (doc, vector) in documents.iter().zip(dense.into_iter()) {
            collection.insert(
                doc.id.clone(),
                StoredRecord {
                    id: doc.id.clone(),
                    text: doc.text.clone(),
                    url: doc.url.clone(),
                    dense: vector,
                    lexical: lexical_vector(&doc.text),
                },
            );
        }

        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawMatch>> {
        let query_dense = crate::embedding::embed_query(&self.embedding, query).await?;
        let query_lexical = lexical_vector(query);

        let collections = self.collections.read().unwrap();
        let collection = match collections.get(collection_id) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<RawMatch> = collection
            .values()
            .filter(|record| !options.exclude_ids.contains(&record.id))
            .map(|record| {
                let dense = cosine_similarity(&query_dense, &record.dense) as f64;
                let lexical = cosine_similarity(&query_lexical, &record.lexical) as f64;
                RawMatch {
                    id: record.id.clone(),
                    score: 0.5 * dense + 0.5 * lexical,
                    content: record.text.clone(),
                    url: Some(record.url.clone()),
                    item_id: None,
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let top_k = if options.top_k > 0 {
            options.top_k
        } else {
            self.retrieval.top_k
        };
        matches.truncate(top_k);

        Ok(matches)
    }

    async fn process(&self, query: &str, matches: Vec<RawMatch>) -> Result<Vec<RankedPassage>> {
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let query_lexical = lexical_vector(query);

        let mut ranked: Vec<RankedPassage> = matches
            .into_iter()
            .map(|m| {
                let rerank = cosine_similarity(&query_lexical, &lexical_vector(&m.content)) as f64;
                RankedPassage {
                    id: m.id,
                    content: m.content,
                    url: m.url,
                    // Blend the retrieval score with the second-pass score.
                    score: 0.5 * m.score + 0.5 * rerank,
                    item_id: m.item_id,
                    fetch_id: random_fetch_id(),
                    query: query.to_string(),
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked.truncate(self.retrieval.top_n);

        Ok(ranked)
    }

    async fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut collections = self.collections.write().unwrap();
        for collection in collections.values_mut() {
            collection.retain(|id, _| !ids.contains(id));
        }
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        self.collections.write().unwrap().remove(collection_id);
        Ok(())
    }

    fn min_best_score(&self) -> f64 {
        0.2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::make_record_id;

    fn indexer() -> InMemoryIndexer {
        InMemoryIndexer::new(EmbeddingConfig::default(), RetrievalConfig::default())
    }

    fn doc(collection: &str, id: &str, text: &str, url: &str) -> IndexDocument {
        IndexDocument {
            id: make_record_id(collection, id),
            text: text.to_string(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_id() {
        let index = indexer();
        index
            .upsert("c1", &[doc("c1", "a", "first version", "https://e.com/a")])
            .await
            .unwrap();
        index
            .upsert("c1", &[doc("c1", "a", "second version", "https://e.com/a")])
            .await
            .unwrap();
        assert_eq!(index.record_count("c1"), 1);

        let matches = index
            .search("c1", "second version", &SearchOptions::default())
            .await
            .unwrap();
        assert!(matches[0].content.contains("second"));
    }

    #[tokio::test]
    async fn test_search_is_collection_scoped() {
        let index = indexer();
        index
            .upsert(
                "tenant-a",
                &[doc("tenant-a", "1", "pricing plans for tenant a", "https://a.com/p")],
            )
            .await
            .unwrap();
        index
            .upsert(
                "tenant-b",
                &[doc("tenant-b", "1", "pricing plans for tenant b", "https://b.com/p")],
            )
            .await
            .unwrap();

        let matches = index
            .search("tenant-a", "pricing plans", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].id.starts_with("tenant-a/"));
    }

    #[tokio::test]
    async fn test_exclude_ids() {
        let index = indexer();
        index
            .upsert(
                "c1",
                &[
                    doc("c1", "1", "alpha topic", "https://e.com/1"),
                    doc("c1", "2", "alpha topic too", "https://e.com/2"),
                ],
            )
            .await
            .unwrap();

        let options = SearchOptions {
            top_k: 10,
            exclude_ids: vec![make_record_id("c1", "1")],
        };
        let matches = index.search("c1", "alpha topic", &options).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, make_record_id("c1", "2"));
    }

    #[tokio::test]
    async fn test_process_caps_at_top_n_and_mints_fetch_ids() {
        let index = InMemoryIndexer::new(
            EmbeddingConfig::default(),
            RetrievalConfig { top_k: 20, top_n: 2 },
        );
        let docs: Vec<IndexDocument> = (0..5)
            .map(|i| {
                doc(
                    "c1",
                    &i.to_string(),
                    &format!("database migration guide part {}", i),
                    "https://e.com/m",
                )
            })
            .collect();
        index.upsert("c1", &docs).await.unwrap();

        let raw = index
            .search("c1", "database migration", &SearchOptions::default())
            .await
            .unwrap();
        let ranked = index.process("database migration", raw).await.unwrap();

        assert_eq!(ranked.len(), 2);
        let mut fetch_ids: Vec<&str> = ranked.iter().map(|p| p.fetch_id.as_str()).collect();
        fetch_ids.dedup();
        assert_eq!(fetch_ids.len(), 2);
        assert!(ranked.iter().all(|p| p.query == "database migration"));
    }

    #[tokio::test]
    async fn test_delete_by_ids_and_collection() {
        let index = indexer();
        index
            .upsert(
                "c1",
                &[
                    doc("c1", "1", "keep me", "https://e.com/1"),
                    doc("c1", "2", "delete me", "https://e.com/2"),
                ],
            )
            .await
            .unwrap();

        index
            .delete_by_ids(&[make_record_id("c1", "2")])
            .await
            .unwrap();
        assert_eq!(index.record_count("c1"), 1);

        index.delete_collection("c1").await.unwrap();
        assert_eq!(index.record_count("c1"), 0);
    }

    #[tokio::test]
    async fn test_empty_collection_returns_no_matches() {
        let index = indexer();
        let matches = index
            .search("missing", "anything", &SearchOptions::default())
            .await
            .unwrap();
        assert!(matches.is_empty());
    }
}
