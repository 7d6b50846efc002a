//! Answer-turn orchestration.
//!
//! One question-answer turn: emit `init`, run the flow loop with the
//! `search_data` tool wired to the group's collection, stream deltas,
//! resolve the retrieved passages to source links, and emit
//! `answer-complete` with credit accounting. A turn where the model
//! produced no content yields `None` — the caller surfaces "I don't
//! know" instead of an empty success.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::search_tool::{SearchContext, SearchTool};
use crate::flow::{Flow, FlowMessage, FlowOptions, ToolRegistry};
use crate::indexer::Indexer;
use crate::llm::ChatModel;
use crate::models::SourceLink;
use crate::store::{AnswerRecord, MetaStore};

/// Events emitted while answering, in delivery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnswerEvent {
    Init {
        collection_id: String,
        query: String,
    },
    ToolCall {
        query: String,
    },
    StreamDelta {
        delta: String,
        role: String,
        content: String,
    },
    AnswerComplete {
        content: String,
        sources: Vec<SourceLink>,
        credits_used: u32,
    },
}

pub type AnswerListener = dyn Fn(AnswerEvent) + Send + Sync;

/// Per-group answering configuration.
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub group_id: String,
    pub collection_id: String,
    /// Extra system prompt configured on the group.
    pub chat_prompt: Option<String>,
    pub top_k: usize,
    pub min_score: Option<f64>,
    pub credits_per_message: u32,
    pub flow: FlowOptions,
}

pub struct Answerer {
    store: Arc<dyn MetaStore>,
    indexer: Arc<dyn Indexer>,
    model: Arc<dyn ChatModel>,
    options: AnswerOptions,
}

/// System prompt for the grounded answer loop. The citation instruction
/// binds the inline `!!<fetchUniqueId>!!` markers to the correlation ids
/// returned by the search tool.
fn system_prompt(query: &str, group_prompt: Option<&str>) -> String {
    let mut lines = vec![
        "You are a helpful assistant that answers questions about the provided context.",
        "Use the search_data tool to search the knowledge base for relevant information.",
        "You can run the search_data tool multiple times to gather more information.",
        "Don't hallucinate. Only answer from the retrieved context.",
        "Keep each search query short: only the most important words, at most a few.",
        "Break complex questions into smaller queries and search for each part.",
        "Don't repeat the same or similar queries.",
        "Don't mention the search tool in the answer. Just fetch and answer.",
        "Don't use headings in the answer. Keep the answer short.",
        "Don't use the search tool once you have the answer.",
    ];

    let question = format!("Given the retrieved context, answer the query \"{}\".", query);
    lines.push(&question);
    lines.push(
        "Cite the sources in the format !!<fetchUniqueId>!! at the end of the supported \
         sentence or paragraph. Example: !!a1b2c3d4!!",
    );
    lines.push("<fetchUniqueId> is the 'fetchUniqueId' field of the context entries.");
    lines.push("Cite only the sources actually used to answer the query.");

    if let Some(extra) = group_prompt {
        lines.push(extra);
    }

    lines.join("\n")
}

/// Resolve the turn's retrieved passages to persisted items and build the
/// answer's source links. Passages that match no known item are skipped.
pub async fn collect_source_links(
    store: &dyn MetaStore,
    group_id: &str,
    messages: &[FlowMessage],
) -> Result<Vec<SourceLink>> {
    let mut links = Vec::new();

    for message in messages {
        for passage in &message.passages {
            // Resolve by the embedded chunk record first, then by the
            // passage's source key.
            let item = match store.find_item_by_chunk_id(&passage.id).await? {
                Some(item) => item,
                None => match &passage.url {
                    Some(url) => match store.find_item(group_id, url).await? {
                        Some(item) => item,
                        None => continue,
                    },
                    None => continue,
                },
            };

            links.push(SourceLink {
                url: passage.url.clone().or(Some(item.key.clone())),
                title: item.title.clone(),
                score: passage.score,
                item_id: Some(item.id.clone()),
                fetch_id: Some(passage.fetch_id.clone()),
                group_id: Some(item.group_id.clone()),
                search_query: Some(passage.query.clone()),
            });
        }
    }

    Ok(links)
}

impl Answerer {
    pub fn new(
        store: Arc<dyn MetaStore>,
        indexer: Arc<dyn Indexer>,
        model: Arc<dyn ChatModel>,
        options: AnswerOptions,
    ) -> Self {
        Self {
            store,
            indexer,
            model,
            options,
        }
    }

    /// Answer one query, streaming events to `listen`. Returns the
    /// completed answer, or `None` when the model produced no content.
    pub async fn answer(
        &self,
        query: &str,
        history: Vec<FlowMessage>,
        listen: Option<Arc<AnswerListener>>,
    ) -> Result<Option<AnswerEvent>> {
        if let Some(listen) = &listen {
            listen(AnswerEvent::Init {
                collection_id: self.options.collection_id.clone(),
                query: query.to_string(),
            });
        }

        let context = Arc::new(SearchContext::new());
        let on_search = listen.clone().map(|listen| {
            Box::new(move |q: &str| {
                listen(AnswerEvent::ToolCall {
                    query: q.to_string(),
                })
            }) as Box<dyn Fn(&str) + Send + Sync>
        });

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(SearchTool::new(
            self.indexer.clone(),
            &self.options.collection_id,
            self.options.top_k,
            self.options.min_score,
            context,
            on_search,
        )));

        let flow = Flow::new(self.model.clone(), tools, self.options.flow.clone());
        let prompt = system_prompt(query, self.options.chat_prompt.as_deref());

        let delta_listen = listen.clone();
        let result = flow
            .run(&prompt, history, query, &move |delta| {
                if let Some(listen) = &delta_listen {
                    listen(AnswerEvent::StreamDelta {
                        delta: delta.delta,
                        role: delta.role,
                        content: delta.content,
                    });
                }
            })
            .await?;

        let Some(content) = result.content else {
            tracing::warn!(group = %self.options.group_id, "Turn produced no content");
            return Ok(None);
        };

        let sources =
            collect_source_links(self.store.as_ref(), &self.options.group_id, &result.messages)
                .await?;

        let complete = AnswerEvent::AnswerComplete {
            content: content.clone(),
            sources: sources.clone(),
            credits_used: self.options.credits_per_message,
        };

        self.store
            .save_answer(&AnswerRecord {
                id: Uuid::new_v4().to_string(),
                group_id: self.options.group_id.clone(),
                query: query.to_string(),
                content,
                credits_used: self.options.credits_per_message,
                sources,
                created_at: Utc::now(),
            })
            .await?;

        if let Some(listen) = &listen {
            listen(complete.clone());
        }

        Ok(Some(complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemStatus, KnowledgeItem, RankedPassage};
    use crate::store::memory::InMemoryStore;
    use crate::llm::ChatMessage;

    fn passage(id: &str, url: &str, fetch_id: &str) -> RankedPassage {
        RankedPassage {
            id: id.to_string(),
            content: "chunk text".to_string(),
            url: Some(url.to_string()),
            score: 0.8,
            item_id: None,
            fetch_id: fetch_id.to_string(),
            query: "some query".to_string(),
        }
    }

    fn item(group: &str, key: &str, chunk_ids: Vec<String>) -> KnowledgeItem {
        KnowledgeItem {
            id: String::new(),
            group_id: group.to_string(),
            key: key.to_string(),
            title: Some("Page title".to_string()),
            markdown: "body".to_string(),
            meta_tags: Vec::new(),
            chunk_ids,
            status: ItemStatus::Completed,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_collect_source_links_resolves_by_chunk_id() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("g1", "https://e.com/a", vec!["c1/ch-1".to_string()]))
            .await
            .unwrap();

        let messages = vec![FlowMessage {
            message: ChatMessage::tool_result("call-1", "ctx"),
            passages: vec![passage("c1/ch-1", "https://e.com/a", "fid1")],
        }];

        let links = collect_source_links(&store, "g1", &messages).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].title.as_deref(), Some("Page title"));
        assert_eq!(links[0].fetch_id.as_deref(), Some("fid1"));
        assert_eq!(links[0].search_query.as_deref(), Some("some query"));
    }

    #[tokio::test]
    async fn test_collect_source_links_falls_back_to_url() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("g1", "https://e.com/b", vec!["other-chunk".to_string()]))
            .await
            .unwrap();

        let messages = vec![FlowMessage {
            message: ChatMessage::tool_result("call-1", "ctx"),
            passages: vec![passage("unknown-chunk", "https://e.com/b", "fid2")],
        }];

        let links = collect_source_links(&store, "g1", &messages).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].url.as_deref(), Some("https://e.com/b"));
    }

    #[tokio::test]
    async fn test_collect_source_links_skips_unresolvable() {
        let store = InMemoryStore::new();
        let messages = vec![FlowMessage {
            message: ChatMessage::tool_result("call-1", "ctx"),
            passages: vec![passage("nowhere", "https://e.com/missing", "fid3")],
        }];

        let links = collect_source_links(&store, "g1", &messages).await.unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn test_system_prompt_embeds_query_and_citation_format() {
        let prompt = system_prompt("How do refunds work?", Some("Be formal."));
        assert!(prompt.contains("How do refunds work?"));
        assert!(prompt.contains("!!<fetchUniqueId>!!"));
        assert!(prompt.contains("Be formal."));
    }
}
