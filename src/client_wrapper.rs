//! LLM Client abstraction (L2).
//!
//! Providers are modeled behind a single trait, [`LlmClient`], so the rest
//! of the engine never depends on a particular vendor's wire format. A
//! `complete` call returns a lazy [`CompletionStream`] of [`CompletionChunk`]s
//! — text deltas, tool-use requests, or a terminal chunk — mirroring the
//! teacher's `ClientWrapper::send_message_stream`, generalized to the native
//! tool-use shape the spec requires instead of the teacher's JSON-in-text
//! convention.

use crate::tool_protocol::ToolDefinition;
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

/// Message author. Tool-result messages carry the `call_id` they answer so
/// the provider can correlate them with the assistant's original request.
#[derive(Debug, Clone)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool { call_id: String },
}

/// One turn in the conversation sent to [`LlmClient::complete`].
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
}

impl Message {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Message {
            role: Role::Tool {
                call_id: call_id.into(),
            },
            content: content.into(),
        }
    }
}

/// Prompt/output token spend for one completion, accumulated by callers
/// across the multiple round-trips a tool-use loop may take.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A caller-supplied ceiling on a single completion's resource spend. Any
/// field left `None` is left to the provider's own default.
#[derive(Debug, Clone, Default)]
pub struct CompletionBudget {
    pub max_tokens: Option<u32>,
}

/// A request for the model to invoke a tool, keyed by an opaque `call_id`
/// the caller must echo back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone)]
pub struct ToolUseRequest {
    pub call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// One element of a [`CompletionStream`].
#[derive(Debug, Clone)]
pub enum CompletionChunk {
    /// An incremental piece of assistant text.
    TextDelta(String),
    /// The model wants to invoke a tool before continuing.
    ToolUse(ToolUseRequest),
    /// The completion has finished; no further chunks follow.
    Terminal {
        stop_reason: StopReason,
        usage: TokenUsage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Lazy, finite sequence of chunks backing one logical completion.
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Provider-agnostic chat-completion capability with tool-use and token
/// streaming (§4.L2). Implementations must be `Send + Sync` so a single
/// client can back every concurrently running specialist.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Begin a completion. `tools` is typically the full
    /// `ToolRegistry::list_definitions()` result; pass `None` to disable
    /// tool-use for this call (e.g. the Visualization Generator, which only
    /// wants text deltas).
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        system: Option<&str>,
        budget: CompletionBudget,
    ) -> Result<CompletionStream, Box<dyn Error + Send + Sync>>;

    /// Identifier of the backing model, surfaced in logs and trace attributes.
    fn model_name(&self) -> &str;
}
