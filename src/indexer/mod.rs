//! Vector index abstraction.
//!
//! The [`Indexer`] trait is the one contract the ingestion and answering
//! paths have with vector search: embed-and-upsert, collection-scoped
//! nearest-neighbor search, rerank, and hard deletes. Backends are
//! interchangeable behind [`make_indexer`]; callers never change when the
//! backing service does.
//!
//! A *collection* is the logical namespace one knowledge base is embedded
//! under (one per tenant/group of sources). Searches must never leak
//! matches across collections.

pub mod memory;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{IndexDocument, RankedPassage};

/// Options for [`Indexer::search`].
#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    /// Raw candidates to return before reranking.
    pub top_k: usize,
    /// Record ids excluded from the match set.
    pub exclude_ids: Vec<String>,
}

/// A raw nearest-neighbor match, before reranking.
#[derive(Debug, Clone)]
pub struct RawMatch {
    pub id: String,
    pub score: f64,
    pub content: String,
    pub url: Option<String>,
    pub item_id: Option<String>,
}

/// Abstract vector index backend.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Stable backend key, recorded on items so deletes can be routed to
    /// the backend that holds their records.
    fn key(&self) -> &str;

    /// Embed and write records under the collection. Idempotent on record
    /// id: upserting the same id overwrites.
    async fn upsert(&self, collection_id: &str, documents: &[IndexDocument]) -> Result<()>;

    /// Nearest-neighbor search scoped to one collection.
    async fn search(
        &self,
        collection_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawMatch>>;

    /// Rerank raw matches and return at most the configured `top_n`
    /// passages, each with a fresh per-result correlation id.
    async fn process(&self, query: &str, matches: Vec<RawMatch>) -> Result<Vec<RankedPassage>>;

    /// Hard-delete records by id (superseded chunks on re-ingestion).
    async fn delete_by_ids(&self, ids: &[String]) -> Result<()>;

    /// Hard-delete every record in a collection (source removal).
    async fn delete_collection(&self, collection_id: &str) -> Result<()>;

    /// The backend's own floor for a usable relevance score. Callers use
    /// this to judge whether a result set is good enough without
    /// hardcoding vendor score scales.
    fn min_best_score(&self) -> f64;
}

/// Build a record id namespaced by collection, so collection-wide deletes
/// can match on the prefix.
pub fn make_record_id(collection_id: &str, id: &str) -> String {
    format!("{}/{}", collection_id, id)
}

/// Mint a short correlation id for one retrieved passage. Alphanumeric
/// only, per the inline citation marker format.
pub fn random_fetch_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

/// Construct the configured indexer backend.
///
/// `backend_override` lets a knowledge group pin a backend different from
/// the process default.
pub fn make_indexer(config: &Config, backend_override: Option<&str>) -> Result<Arc<dyn Indexer>> {
    let backend = backend_override.unwrap_or(config.indexer.backend.as_str());
    match backend {
        "memory" => Ok(Arc::new(memory::InMemoryIndexer::new(
            config.embedding.clone(),
            config.retrieval.clone(),
        ))),
        "remote" => Ok(Arc::new(remote::RemoteIndexer::new(
            &config.indexer,
            &config.retrieval,
        )?)),
        other => anyhow::bail!("Unknown indexer backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_is_collection_prefixed() {
        let id = make_record_id("tenant-1", "abc");
        assert_eq!(id, "tenant-1/abc");
        assert!(id.starts_with("tenant-1/"));
    }

    #[test]
    fn test_fetch_id_is_short_alphanumeric() {
        let id = random_fetch_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_fetch_ids_are_unique_enough() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(random_fetch_id()));
        }
    }
}
