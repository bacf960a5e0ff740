//! Closed error taxonomy for the orchestration engine.
//!
//! Every fallible public API in this crate returns [`CoreResult<T>`]. External
//! collaborators (an [`crate::tool_protocol::ToolProtocol`] impl, an
//! [`crate::client_wrapper::LlmClient`] impl) are still free to return
//! `Box<dyn std::error::Error + Send + Sync>` the way the teacher's
//! `ToolProtocol`/`ClientWrapper` traits do; call sites fold those into
//! [`CoreError`] with [`CoreError::tool_failure`] / [`CoreError::provider_error`].

use std::error::Error;
use std::fmt;

/// The closed set of failure categories a query can end in.
///
/// Kept deliberately small and stable: consumers (trace viewers, lifecycle
/// event readers) match on this enum, so new variants are additive and rare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The incoming query failed basic validation (empty, unparseable).
    InvalidQuery,
    /// A named prompt template has an unfilled substitution hole.
    PromptRenderError,
    /// The LLM provider asked the caller to back off.
    RateLimited,
    /// The LLM provider failed for a reason outside the taxonomy below
    /// (network error, malformed response, 5xx).
    ProviderError,
    /// The assembled prompt (system + history + tool results) exceeds the
    /// provider's context window.
    ContextOverflow,
    /// A model response could not be parsed into the structure the caller
    /// expected (CMO analysis/team JSON, specialist final answer).
    ResponseParseError,
    /// The requested tool name is not registered.
    UnknownTool,
    /// A registered tool ran but reported failure.
    ToolFailure,
    /// The CMO's assembled team violates the size/composition rules for its
    /// reported complexity, even after the one allotted repair reprompt.
    TeamAssemblyInvalid,
    /// Every dispatched specialist failed, timed out, or was cancelled.
    NoSpecialistSucceeded,
    /// A specialist or the whole query exceeded its configured deadline.
    Timeout,
    /// A specialist exhausted its tool-call budget before finishing.
    BudgetExhausted,
    /// A specialist or the whole query was cancelled cooperatively.
    Cancelled,
    /// Persisting the finalized trace document failed; the query itself is
    /// unaffected since this error is logged, never propagated to the caller.
    TracePersistFailed,
    /// Visualization generation failed; the query degrades to `final` with
    /// no visualization rather than failing outright.
    VizFailed,
    /// Generic internal invariant violation (duplicate id, empty team, etc).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidQuery => "invalid query",
            ErrorKind::PromptRenderError => "prompt render error",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ProviderError => "provider error",
            ErrorKind::ContextOverflow => "context overflow",
            ErrorKind::ResponseParseError => "response parse error",
            ErrorKind::UnknownTool => "unknown tool",
            ErrorKind::ToolFailure => "tool failure",
            ErrorKind::TeamAssemblyInvalid => "team assembly invalid",
            ErrorKind::NoSpecialistSucceeded => "no specialist succeeded",
            ErrorKind::Timeout => "timed out",
            ErrorKind::BudgetExhausted => "budget exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TracePersistFailed => "trace persist failed",
            ErrorKind::VizFailed => "visualization failed",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{}", s)
    }
}

/// The crate's single error type. Carries a closed [`ErrorKind`] plus a
/// human-readable message that deliberately excludes request-internal
/// identifiers or raw model tokens — those stay structured, in the
/// [`crate::domain`] types that accompany the error, not string-interpolated
/// here.
#[derive(Debug, Clone)]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CoreError {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_query(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::InvalidQuery, detail)
    }

    pub fn unknown_tool(name: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::UnknownTool, format!("unknown tool: {}", name.into()))
    }

    pub fn tool_failure(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::ToolFailure, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::RateLimited, detail)
    }

    pub fn context_overflow(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::ContextOverflow, detail)
    }

    pub fn response_parse_error(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::ResponseParseError, detail)
    }

    pub fn provider_error(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::ProviderError, detail)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::Cancelled, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::Timeout, detail)
    }

    pub fn budget_exhausted(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::BudgetExhausted, detail)
    }

    pub fn team_assembly_invalid(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::TeamAssemblyInvalid, detail)
    }

    pub fn no_specialist_succeeded(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::NoSpecialistSucceeded, detail)
    }

    pub fn prompt_render_error(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::PromptRenderError, detail)
    }

    pub fn trace_persist_failed(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::TracePersistFailed, detail)
    }

    pub fn viz_failed(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::VizFailed, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        CoreError::new(ErrorKind::Internal, detail)
    }

    /// True for errors the Scheduler should retry once with backoff before
    /// giving up on a task, per the M3 retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::RateLimited | ErrorKind::ProviderError)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for CoreError {}

impl From<Box<dyn Error + Send + Sync>> for CoreError {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        CoreError::provider_error(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
