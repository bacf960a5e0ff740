//! Tool Abstraction (L1).
//!
//! A name-addressed registry of side-effectful callables. Tools are pure
//! with respect to orchestration state — the registry itself is stateless
//! and thread-safe (`Arc<dyn ToolProtocol>` throughout), so the same
//! `ToolRegistry` can be shared read-only across every concurrently running
//! specialist.
//!
//! Adapted from the teacher's multi-protocol `ToolRegistry`, collapsed to
//! the single-protocol-per-tool shape the spec calls for: one name maps to
//! exactly one callable, there is no protocol-routing layer.

use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// Describes a tool's calling convention to the LLM: its name, a
/// human-readable description, and a JSON schema for its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// The outcome of one tool invocation, handed back to the model verbatim
/// (on success) or with an `error` field (on failure) so the model can
/// recover per §4.M1's edge-case rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub value: serde_json::Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(value: serde_json::Value) -> Self {
        ToolResult {
            success: true,
            value,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        ToolResult {
            success: false,
            value: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// A single named callable. Implementations are side-effectful (they may
/// hit a warehouse, a filesystem, a network service) but must not mutate
/// anything the orchestration engine itself owns.
#[async_trait]
pub trait ToolProtocol: Send + Sync {
    /// Static description used to build the tool list handed to the LLM.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool against the given JSON input.
    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;
}

/// Stateless, thread-safe collection of named tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProtocol>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool registered under the
    /// same name.
    pub fn register(&mut self, tool: Arc<dyn ToolProtocol>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }

    /// Definitions for every registered tool, in the shape an `LlmClient`
    /// expects for its `tools` parameter.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Invoke a tool by name. Unknown names fail with `UNKNOWN_TOOL`;
    /// downstream tool errors are folded into `TOOL_FAILURE` carrying the
    /// tool's own error message.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolResult, CoreError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| CoreError::unknown_tool(name))?;

        tool.invoke(input)
            .await
            .map_err(|e| CoreError::tool_failure(e.to_string()))
    }
}
