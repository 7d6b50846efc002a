//! The `search_data` retrieval tool.
//!
//! Grounds the answer loop in the vector index: search, rerank, filter by
//! the relevance floor, and hand the surviving passages back both as the
//! model-visible tool result and as structured passages for citation
//! binding. Degenerate queries are pushed back to the model instead of
//! being searched: too-short queries, queries already searched this turn,
//! and queries past the per-turn search budget.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::flow::{FlowTool, ToolOutcome};
use crate::indexer::{Indexer, SearchOptions};

const MIN_QUERY_WORDS: usize = 3;
const MAX_SEARCHES: usize = 5;

/// Tool result sent when retrieval finds nothing usable. The wording
/// instructs the model not to fabricate an answer from thin air.
pub const NO_RESULTS_MESSAGE: &str =
    "No relevant information found. Don't answer the query. Inform that you don't know the answer.";

/// Per-turn search state shared with the answer orchestration.
#[derive(Default)]
pub struct SearchContext {
    queries: Mutex<Vec<String>>,
}

impl SearchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

type SearchCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct SearchTool {
    indexer: Arc<dyn Indexer>,
    collection_id: String,
    top_k: usize,
    /// Group-level floor; tightens (never loosens) the backend's own.
    min_score: Option<f64>,
    context: Arc<SearchContext>,
    /// Invoked with each accepted query before the index is hit.
    on_search: Option<SearchCallback>,
}

impl SearchTool {
    pub fn new(
        indexer: Arc<dyn Indexer>,
        collection_id: &str,
        top_k: usize,
        min_score: Option<f64>,
        context: Arc<SearchContext>,
        on_search: Option<SearchCallback>,
    ) -> Self {
        Self {
            indexer,
            collection_id: collection_id.to_string(),
            top_k,
            min_score,
            context,
            on_search,
        }
    }

    fn effective_min_score(&self) -> f64 {
        let floor = self.indexer.min_best_score();
        match self.min_score {
            Some(min) => min.max(floor),
            None => floor,
        }
    }
}

#[async_trait]
impl FlowTool for SearchTool {
    fn name(&self) -> &str {
        "search_data"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for the most relevant documents. \
         Minimum 3 words required to search."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The query to search the knowledge base with. Minimum 3 words required."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutcome> {
        let query = params["query"].as_str().unwrap_or("").trim().to_string();

        {
            let queries = self.context.queries.lock().unwrap();
            if queries.iter().any(|q| q == &query) {
                return Ok(ToolOutcome {
                    content: format!("The query \"{}\" is already searched.", query),
                    passages: Vec::new(),
                });
            }
            if queries.len() >= MAX_SEARCHES {
                return Ok(ToolOutcome {
                    content: "Maximum number of searches reached. Now frame your answer."
                        .to_string(),
                    passages: Vec::new(),
                });
            }
        }

        if query.split_whitespace().count() < MIN_QUERY_WORDS {
            return Ok(ToolOutcome {
                content: format!(
                    "The query \"{}\" is too short. Minimum {} words.",
                    query, MIN_QUERY_WORDS
                ),
                passages: Vec::new(),
            });
        }

        if let Some(on_search) = &self.on_search {
            on_search(&query);
        }

        tracing::debug!(collection = %self.collection_id, query = %query, "Searching knowledge base");

        let raw = self
            .indexer
            .search(
                &self.collection_id,
                &query,
                &SearchOptions {
                    top_k: self.top_k,
                    exclude_ids: Vec::new(),
                },
            )
            .await?;
        let processed = self.indexer.process(&query, raw).await?;

        let min_score = self.effective_min_score();
        let passages: Vec<_> = processed
            .into_iter()
            .filter(|p| p.score >= min_score)
            .collect();

        self.context.queries.lock().unwrap().push(query.clone());

        if passages.is_empty() {
            return Ok(ToolOutcome {
                content: NO_RESULTS_MESSAGE.to_string(),
                passages: Vec::new(),
            });
        }

        let context_json = serde_json::to_string(
            &passages
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "url": p.url,
                        "content": p.content,
                        "fetchUniqueId": p.fetch_id,
                    })
                })
                .collect::<Vec<_>>(),
        )?;

        Ok(ToolOutcome {
            content: format!("<context>\n{}\n</context>", context_json),
            passages,
        })
    }
}
