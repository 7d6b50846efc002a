//! Language-model access.
//!
//! A small registry maps model keys to their OpenAI-compatible endpoint,
//! retrieval depth, and per-message credit cost, and the [`ChatModel`]
//! trait abstracts streamed chat completions with tool calling. The flow
//! loop depends only on the trait, so tests drive it with a scripted
//! model and no network.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolved settings for one model key.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Wire model name sent to the API.
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    /// Passages kept after reranking when answering with this model.
    pub rag_top_n: usize,
    /// Credits charged per answered message.
    pub credits_per_message: u32,
}

/// Resolve a model key to its configuration. Unknown keys fall back to
/// the default small model.
pub fn get_model(key: &str) -> ModelConfig {
    match key {
        "o4-mini" => ModelConfig {
            model: "o4-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            rag_top_n: 4,
            credits_per_message: 2,
        },
        "sonnet" => ModelConfig {
            model: "claude-sonnet-4-5".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            rag_top_n: 2,
            credits_per_message: 4,
        },
        "gemini-flash" => ModelConfig {
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            rag_top_n: 2,
            credits_per_message: 2,
        },
        _ => ModelConfig {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            rag_top_n: 4,
            credits_per_message: 1,
        },
    }
}

/// A tool the model may call, in function-calling schema form.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn to_wire_format(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// One message of a conversation, in OpenAI chat shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }
}

/// A streamed token delta with the cumulative content so far.
#[derive(Debug, Clone)]
pub struct ChatDelta {
    pub delta: String,
    pub content: String,
    pub role: String,
}

/// The model's finished turn: final text and/or requested tool calls.
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Streamed chat completion with tool calling.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        on_delta: &(dyn Fn(ChatDelta) + Send + Sync),
    ) -> Result<ChatTurn>;
}

/// OpenAI-compatible streaming client.
pub struct OpenAiChatModel {
    config: ModelConfig,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { config, client })
    }
}

/// Tool-call fragment accumulator. Streamed tool calls arrive as indexed
/// fragments whose `arguments` string grows delta by delta.
#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        on_delta: &(dyn Fn(ChatDelta) + Send + Sync),
    ) -> Result<ChatTurn> {
        let api_key = std::env::var(&self.config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", self.config.api_key_env))?;

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(
                tools.iter().map(|t| t.to_wire_format()).collect(),
            );
            body["tool_choice"] = serde_json::json!("auto");
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, text);
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut role = "assistant".to_string();
        let mut tool_builders: Vec<ToolCallBuilder> = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.context("Stream read failed")?;
            buffer.push_str(std::str::from_utf8(&bytes).context("Invalid UTF-8 in stream")?);

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }

                let json: serde_json::Value = match serde_json::from_str(data) {
                    Ok(json) => json,
                    Err(e) => bail!(
                        "Failed to parse stream chunk: {} (data: {})",
                        e,
                        &data[..data.len().min(200)]
                    ),
                };
                let delta = &json["choices"][0]["delta"];

                if let Some(r) = delta["role"].as_str() {
                    role = r.to_string();
                }

                if let Some(text) = delta["content"].as_str() {
                    if !text.is_empty() {
                        content.push_str(text);
                        on_delta(ChatDelta {
                            delta: text.to_string(),
                            content: content.clone(),
                            role: role.clone(),
                        });
                    }
                }

                if let Some(fragments) = delta["tool_calls"].as_array() {
                    for fragment in fragments {
                        let index = fragment["index"].as_u64().unwrap_or(0) as usize;
                        while tool_builders.len() <= index {
                            tool_builders.push(ToolCallBuilder::default());
                        }
                        let builder = &mut tool_builders[index];
                        if let Some(id) = fragment["id"].as_str() {
                            builder.id = id.to_string();
                        }
                        if let Some(name) = fragment["function"]["name"].as_str() {
                            builder.name = name.to_string();
                        }
                        if let Some(arguments) = fragment["function"]["arguments"].as_str() {
                            builder.arguments.push_str(arguments);
                        }
                    }
                }
            }
        }

        let tool_calls: Vec<ToolCall> = tool_builders
            .into_iter()
            .filter(|b| !b.name.is_empty())
            .map(|b| ToolCall {
                id: b.id,
                name: b.name,
                arguments: b.arguments,
            })
            .collect();

        Ok(ChatTurn {
            content: if content.is_empty() { None } else { Some(content) },
            tool_calls,
        })
    }
}
