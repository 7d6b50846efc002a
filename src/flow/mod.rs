//! Tool-calling conversation loop.
//!
//! [`Flow::run`] drives one answer turn: the model either emits final
//! text or calls a registered tool; tool results are injected back into
//! the conversation and generation resumes. Two bounds guarantee cost
//! and termination: a per-turn tool-call budget and a total step budget
//! that holds even under pathological model behavior.
//!
//! Tools are a closed registry of typed implementations looked up by
//! name; each declares its own JSON-schema parameters for the model.
//! Content deltas stream to the caller in generation order, with tool
//! results interleaved before the tokens that depend on them.

pub mod search_tool;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ChatDelta, ChatMessage, ChatModel, ToolDefinition};
use crate::models::RankedPassage;

/// Result of one tool execution: the content injected into the
/// conversation plus any retrieved passages for citation binding.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    pub passages: Vec<RankedPassage>,
}

/// A tool the flow can dispatch to.
#[async_trait]
pub trait FlowTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value) -> Result<ToolOutcome>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Closed registry of tools, dispatched by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn FlowTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn FlowTool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn FlowTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// One conversation message plus the passages its tool result carried.
#[derive(Debug, Clone)]
pub struct FlowMessage {
    pub message: ChatMessage,
    pub passages: Vec<RankedPassage>,
}

impl FlowMessage {
    pub fn plain(message: ChatMessage) -> Self {
        Self {
            message,
            passages: Vec::new(),
        }
    }
}

/// Loop bounds for one answer turn.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Tool executions allowed per turn.
    pub max_tool_calls: usize,
    /// Model round-trips allowed per turn.
    pub max_steps: usize,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            max_tool_calls: 5,
            max_steps: 8,
        }
    }
}

/// Outcome of one turn.
#[derive(Debug, Clone)]
pub struct FlowResult {
    /// Final answer text; `None` when the model produced no content
    /// (upstream failure or exhausted step budget).
    pub content: Option<String>,
    /// Full message history of the turn, passages attached.
    pub messages: Vec<FlowMessage>,
    pub tool_calls_made: usize,
    pub steps: usize,
}

pub struct Flow {
    model: Arc<dyn ChatModel>,
    tools: ToolRegistry,
    options: FlowOptions,
}

impl Flow {
    pub fn new(model: Arc<dyn ChatModel>, tools: ToolRegistry, options: FlowOptions) -> Self {
        Self {
            model,
            tools,
            options,
        }
    }

    /// Run one turn to completion, streaming deltas through `on_delta`.
    pub async fn run(
        &self,
        system_prompt: &str,
        history: Vec<FlowMessage>,
        query: &str,
        on_delta: &(dyn Fn(ChatDelta) + Send + Sync),
    ) -> Result<FlowResult> {
        let mut messages: Vec<FlowMessage> = Vec::with_capacity(history.len() + 2);
        messages.push(FlowMessage::plain(ChatMessage::system(system_prompt)));
        messages.extend(history);
        messages.push(FlowMessage::plain(ChatMessage::user(query)));

        let tool_defs = self.tools.definitions();
        let mut tool_calls_made = 0usize;
        let mut steps = 0usize;

        loop {
            if steps >= self.options.max_steps {
                tracing::warn!(max_steps = self.options.max_steps, "Flow reached step budget");
                return Ok(FlowResult {
                    content: None,
                    messages,
                    tool_calls_made,
                    steps,
                });
            }
            steps += 1;

            let wire: Vec<ChatMessage> = messages.iter().map(|m| m.message.clone()).collect();
            let turn = self.model.stream_chat(&wire, &tool_defs, on_delta).await?;

            if turn.tool_calls.is_empty() {
                messages.push(FlowMessage::plain(ChatMessage::assistant(
                    turn.content.clone(),
                    Vec::new(),
                )));
                return Ok(FlowResult {
                    content: turn.content,
                    messages,
                    tool_calls_made,
                    steps,
                });
            }

            messages.push(FlowMessage::plain(ChatMessage::assistant(
                turn.content.clone(),
                turn.tool_calls.clone(),
            )));

            for call in &turn.tool_calls {
                let outcome = if tool_calls_made >= self.options.max_tool_calls {
                    tracing::warn!(tool = %call.name, "Tool budget exhausted");
                    ToolOutcome {
                        content: "Tool call limit reached. Answer with the information you already have."
                            .to_string(),
                        passages: Vec::new(),
                    }
                } else {
                    tool_calls_made += 1;
                    self.execute_tool(call).await
                };

                messages.push(FlowMessage {
                    message: ChatMessage::tool_result(&call.id, outcome.content),
                    passages: outcome.passages,
                });
            }
        }
    }

    async fn execute_tool(&self, call: &crate::llm::ToolCall) -> ToolOutcome {
        let Some(tool) = self.tools.find(&call.name) else {
            tracing::warn!(tool = %call.name, "Unknown tool requested");
            return ToolOutcome {
                content: format!("Error: Unknown tool '{}'", call.name),
                passages: Vec::new(),
            };
        };

        let params: Value = match serde_json::from_str(&call.arguments) {
            Ok(params) => params,
            Err(e) => {
                return ToolOutcome {
                    content: format!("Error: invalid tool arguments: {}", e),
                    passages: Vec::new(),
                }
            }
        };

        match tool.execute(params).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolOutcome {
                    content: format!("Error executing tool: {}", e),
                    passages: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatTurn, ToolCall};
    use std::sync::Mutex;

    /// Scripted model: plays back a fixed sequence of turns, streaming
    /// any content word by word.
    pub struct ScriptedModel {
        turns: Mutex<Vec<ChatTurn>>,
    }

    impl ScriptedModel {
        pub fn new(turns: Vec<ChatTurn>) -> Self {
            Self {
                turns: Mutex::new(turns),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            on_delta: &(dyn Fn(ChatDelta) + Send + Sync),
        ) -> Result<ChatTurn> {
            let turn = {
                let mut turns = self.turns.lock().unwrap();
                if turns.is_empty() {
                    anyhow::bail!("scripted model exhausted");
                }
                turns.remove(0)
            };

            if let Some(content) = &turn.content {
                let mut cumulative = String::new();
                for word in content.split_inclusive(' ') {
                    cumulative.push_str(word);
                    on_delta(ChatDelta {
                        delta: word.to_string(),
                        content: cumulative.clone(),
                        role: "assistant".to_string(),
                    });
                }
            }
            Ok(turn)
        }
    }

    struct EchoTool;

    #[async_trait]
    impl FlowTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value) -> Result<ToolOutcome> {
            Ok(ToolOutcome {
                content: format!("echoed: {}", params["text"].as_str().unwrap_or("")),
                passages: Vec::new(),
            })
        }
    }

    fn tool_call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: format!("call-{}", name),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[tokio::test]
    async fn test_direct_answer_without_tools() {
        let model = Arc::new(ScriptedModel::new(vec![ChatTurn {
            content: Some("Direct answer.".to_string()),
            tool_calls: Vec::new(),
        }]));
        let flow = Flow::new(model, registry(), FlowOptions::default());

        let deltas = Mutex::new(Vec::new());
        let result = flow
            .run("system", Vec::new(), "question", &|delta| {
                deltas.lock().unwrap().push(delta.delta);
            })
            .await
            .unwrap();

        assert_eq!(result.content.as_deref(), Some("Direct answer."));
        assert_eq!(result.tool_calls_made, 0);
        assert_eq!(deltas.lock().unwrap().join(""), "Direct answer.");
    }

    #[tokio::test]
    async fn test_tool_roundtrip_injects_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            ChatTurn {
                content: None,
                tool_calls: vec![tool_call("echo", r#"{"text":"ping"}"#)],
            },
            ChatTurn {
                content: Some("Used the tool.".to_string()),
                tool_calls: Vec::new(),
            },
        ]));
        let flow = Flow::new(model, registry(), FlowOptions::default());

        let result = flow
            .run("system", Vec::new(), "question", &|_| {})
            .await
            .unwrap();

        assert_eq!(result.content.as_deref(), Some("Used the tool."));
        assert_eq!(result.tool_calls_made, 1);

        // Conversation order: system, user, assistant(tool_calls), tool, assistant.
        let roles: Vec<&str> = result
            .messages
            .iter()
            .map(|m| m.message.role.as_str())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
        assert!(result.messages[3]
            .message
            .content
            .as_deref()
            .unwrap()
            .contains("echoed: ping"));
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_in_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            ChatTurn {
                content: None,
                tool_calls: vec![tool_call("teleport", "{}")],
            },
            ChatTurn {
                content: Some("ok".to_string()),
                tool_calls: Vec::new(),
            },
        ]));
        let flow = Flow::new(model, registry(), FlowOptions::default());

        let result = flow.run("system", Vec::new(), "q", &|_| {}).await.unwrap();
        assert!(result.messages[3]
            .message
            .content
            .as_deref()
            .unwrap()
            .contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_tool_budget_enforced() {
        // The model keeps asking for the tool; after the budget only the
        // limit notice is injected, and the step budget ends the turn.
        let mut turns = Vec::new();
        for _ in 0..10 {
            turns.push(ChatTurn {
                content: None,
                tool_calls: vec![tool_call("echo", r#"{"text":"again"}"#)],
            });
        }
        let model = Arc::new(ScriptedModel::new(turns));
        let flow = Flow::new(
            model,
            registry(),
            FlowOptions {
                max_tool_calls: 2,
                max_steps: 4,
            },
        );

        let result = flow.run("system", Vec::new(), "q", &|_| {}).await.unwrap();
        assert_eq!(result.tool_calls_made, 2);
        assert_eq!(result.steps, 4);
        assert!(result.content.is_none());

        let limit_notices = result
            .messages
            .iter()
            .filter(|m| {
                m.message
                    .content
                    .as_deref()
                    .map(|c| c.contains("Tool call limit reached"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(limit_notices, 2);
    }

    #[tokio::test]
    async fn test_no_content_yields_none() {
        let model = Arc::new(ScriptedModel::new(vec![ChatTurn {
            content: None,
            tool_calls: Vec::new(),
        }]));
        let flow = Flow::new(model, registry(), FlowOptions::default());

        let result = flow.run("system", Vec::new(), "q", &|_| {}).await.unwrap();
        assert!(result.content.is_none());
    }
}
