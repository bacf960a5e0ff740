//! Reference [`LlmClient`] implementation backed by OpenAI's Chat
//! Completions API via `openai-rust2`.
//!
//! OpenAI's JSON function-calling surface varies across proxy-compatible
//! providers; rather than depend on a specific wire shape, tool definitions
//! are described to the model as an instruction to emit a single JSON
//! fragment of the form `{"tool_call": {"name": ..., "input": ...}}`, and the
//! response is scanned for that fragment with the same brace-counting
//! technique the teacher's `Agent::parse_tool_call` uses. Any provider able
//! to produce the three `CompletionChunk` shapes can back this trait; this
//! client is one concrete way to get there over a text-only completions API.

use crate::client_wrapper::{
    CompletionBudget, CompletionChunk, CompletionStream, LlmClient, Message, Role, StopReason,
    TokenUsage, ToolUseRequest,
};
use crate::tool_protocol::ToolDefinition;
use async_trait::async_trait;
use futures_util::stream;
use openai_rust2 as openai_rust;
use std::error::Error;

/// Chat Completions client for a single configured model.
pub struct OpenAiClient {
    client: openai_rust::Client,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: impl Into<String>) -> Self {
        OpenAiClient {
            client: openai_rust::Client::new(api_key),
            model: model.into(),
        }
    }

    fn format_messages(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        system: Option<&str>,
    ) -> Vec<openai_rust::chat::Message> {
        let mut formatted = Vec::with_capacity(messages.len() + 1);

        let mut system_prompt = system.unwrap_or_default().to_string();
        if let Some(tools) = tools {
            if !tools.is_empty() {
                system_prompt.push_str("\n\nYou may call one of the following tools by replying with exactly one JSON fragment of the shape {\"tool_call\": {\"name\": \"<tool name>\", \"input\": {...}}} and nothing else:\n");
                for tool in tools {
                    system_prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
                }
            }
        }
        if !system_prompt.is_empty() {
            formatted.push(openai_rust::chat::Message {
                role: "system".to_string(),
                content: system_prompt,
            });
        }

        for message in messages {
            let role = match &message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool { .. } => "user",
            };
            let content = match &message.role {
                Role::Tool { call_id } => format!("Tool result for {}: {}", call_id, message.content),
                _ => message.content.to_string(),
            };
            formatted.push(openai_rust::chat::Message {
                role: role.to_string(),
                content,
            });
        }

        formatted
    }

    /// Scan `text` for an embedded `{"tool_call": {"name": ..., "input": ...}}`
    /// fragment using brace-counting rather than requiring the whole
    /// response to be valid JSON.
    fn parse_tool_call(text: &str) -> Option<ToolUseRequest> {
        let start_idx = text.find("{\"tool_call\"")?;
        let chars: Vec<char> = text.chars().collect();
        let mut brace_count = 0;
        let mut end_idx = start_idx;

        for (i, ch) in chars.iter().enumerate().skip(start_idx) {
            if *ch == '{' {
                brace_count += 1;
            } else if *ch == '}' {
                brace_count -= 1;
                if brace_count == 0 {
                    end_idx = i + 1;
                    break;
                }
            }
        }

        if end_idx <= start_idx {
            return None;
        }

        let fragment: String = chars[start_idx..end_idx].iter().collect();
        let parsed: serde_json::Value = serde_json::from_str(&fragment).ok()?;
        let call = parsed.get("tool_call")?;
        let name = call.get("name")?.as_str()?.to_string();
        let input = call.get("input").cloned().unwrap_or(serde_json::Value::Null);

        Some(ToolUseRequest {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: name,
            input,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        system: Option<&str>,
        budget: CompletionBudget,
    ) -> Result<CompletionStream, Box<dyn Error + Send + Sync>> {
        let formatted = self.format_messages(messages, tools, system);
        let mut args = openai_rust::chat::ChatArguments::new(&self.model, formatted);
        if let Some(max_tokens) = budget.max_tokens {
            args = args.with_max_tokens(max_tokens);
        }

        let response = self
            .client
            .create_chat(args, None)
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { format!("openai request failed: {}", e).into() })?;

        let content = response
            .choices
            .get(0)
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        let usage = TokenUsage {
            input_tokens: response.usage.prompt_tokens as usize,
            output_tokens: response.usage.completion_tokens as usize,
        };

        let mut chunks = Vec::with_capacity(2);
        let stop_reason = if let Some(tool_use) = Self::parse_tool_call(&content) {
            chunks.push(Ok(CompletionChunk::ToolUse(tool_use)));
            StopReason::ToolUse
        } else {
            chunks.push(Ok(CompletionChunk::TextDelta(content)));
            StopReason::EndTurn
        };
        chunks.push(Ok(CompletionChunk::Terminal { stop_reason, usage }));

        Ok(Box::pin(stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
