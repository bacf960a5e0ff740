//! A deterministic, scriptable [`LlmClient`] for tests.
//!
//! Mirrors the teacher's per-test `MockClient` (see `tests/agent_tests.rs`)
//! generalized to script a queue of full completions, since exercising a
//! specialist's tool-use loop requires returning a `ToolUse` chunk on one
//! call and a final answer on the next.

use crate::client_wrapper::{
    CompletionBudget, CompletionChunk, CompletionStream, LlmClient, Message, StopReason,
    TokenUsage, ToolUseRequest,
};
use crate::tool_protocol::ToolDefinition;
use async_trait::async_trait;
use futures_util::stream;
use std::error::Error;
use std::sync::Mutex;
use std::time::Duration;
use std::collections::VecDeque;

/// Scripts a fixed sequence of completions. Each call to
/// [`LlmClient::complete`] pops the next scripted turn; once the queue is
/// empty, subsequent calls return an empty `EndTurn` completion rather than
/// panicking, so tests that over-call don't need to script a tail of no-ops.
pub struct MockClient {
    model: String,
    turns: Mutex<VecDeque<(Option<Duration>, Vec<CompletionChunk>)>>,
    delay: Option<Duration>,
}

impl MockClient {
    pub fn new() -> Self {
        MockClient {
            model: "mock".to_string(),
            turns: Mutex::new(VecDeque::new()),
            delay: None,
        }
    }

    /// Queue a plain-text final answer.
    pub fn with_text_response(self, text: impl Into<String>) -> Self {
        self.with_turn(vec![
            CompletionChunk::TextDelta(text.into()),
            CompletionChunk::Terminal {
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            },
        ])
    }

    /// Queue a plain-text final answer that only becomes available after
    /// `delay` — used to simulate one stub specialist whose LLM call never
    /// returns inside the per-task timeout, alongside sibling calls on the
    /// same client that resolve immediately (seed scenario 4).
    pub fn with_delayed_text_response(self, delay: Duration, text: impl Into<String>) -> Self {
        self.with_delayed_turn(
            delay,
            vec![
                CompletionChunk::TextDelta(text.into()),
                CompletionChunk::Terminal {
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 10,
                    },
                },
            ],
        )
    }

    /// Queue a tool-use request for the given tool name and JSON input.
    pub fn with_tool_use(self, tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        let call_id = format!("call_{}", self.turns.lock().unwrap().len());
        self.with_turn(vec![
            CompletionChunk::ToolUse(ToolUseRequest {
                call_id,
                tool_name: tool_name.into(),
                input,
            }),
            CompletionChunk::Terminal {
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            },
        ])
    }

    /// Queue an arbitrary, fully custom turn.
    pub fn with_turn(self, chunks: Vec<CompletionChunk>) -> Self {
        self.with_delayed_turn(Duration::ZERO, chunks)
    }

    /// Queue an arbitrary turn that only resolves after `delay`.
    pub fn with_delayed_turn(self, delay: Duration, chunks: Vec<CompletionChunk>) -> Self {
        self.turns.lock().unwrap().push_back((
            if delay.is_zero() { None } else { Some(delay) },
            chunks,
        ));
        self
    }

    /// Delay every `complete` call by `delay`, including calls past the end
    /// of the scripted queue — used where every call on this client should
    /// be slow (e.g. exercising a query-wide deadline).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<&[ToolDefinition]>,
        _system: Option<&str>,
        _budget: CompletionBudget,
    ) -> Result<CompletionStream, Box<dyn Error + Send + Sync>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let (turn_delay, chunks) = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            (
                None,
                vec![CompletionChunk::Terminal {
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage::default(),
                }],
            )
        });

        if let Some(delay) = turn_delay {
            tokio::time::sleep(delay).await;
        }

        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
