//! The one concrete tool this engine ships: a fixture-backed stand-in for
//! the real health-record warehouse, which the core treats as an opaque
//! external capability (§6.1). Production deployments are expected to
//! swap this for a [`crate::tool_protocol::ToolProtocol`] backed by their
//! own warehouse; this implementation exists so the engine is runnable and
//! testable without one.
//!
//! Grounded in the teacher's `tools::calculator::Calculator` shape: a small,
//! stateless-except-for-fixtures struct implementing `ToolProtocol`.

use crate::tool_protocol::{ToolDefinition, ToolProtocol, ToolResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::sync::RwLock;

/// A health-data lookup tool backed by an in-memory table of canned
/// records, keyed by a lowercase keyword found in the query text (e.g.
/// `"hba1c"`, `"cholesterol"`, `"metformin"`).
pub struct HealthDataTool {
    records: RwLock<HashMap<String, serde_json::Value>>,
}

impl HealthDataTool {
    pub fn new() -> Self {
        HealthDataTool {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Seed (or replace) the record returned when `query` contains `keyword`.
    pub fn with_record(self, keyword: impl Into<String>, record: serde_json::Value) -> Self {
        self.records
            .write()
            .expect("health data fixture lock poisoned")
            .insert(keyword.into(), record);
        self
    }

    /// A fixture set covering the seed end-to-end scenarios in §8: a recent
    /// HbA1c reading, a cholesterol series, and a metformin/weight pairing.
    pub fn with_seed_fixtures(self) -> Self {
        self.with_record(
            "hba1c",
            serde_json::json!({"hba1c": 6.1, "date": "2024-04-07"}),
        )
        .with_record(
            "cholesterol",
            serde_json::json!({
                "series": [
                    {"date": "2023-08-01", "ldl": 142},
                    {"date": "2024-02-01", "ldl": 128},
                    {"date": "2024-08-01", "ldl": 110}
                ],
                "trend": "decreasing"
            }),
        )
        .with_record(
            "metformin",
            serde_json::json!({
                "medication": "metformin",
                "started": "2023-11-15",
                "weight_series": [
                    {"date": "2023-11-15", "kg": 92.1},
                    {"date": "2024-05-15", "kg": 86.4}
                ]
            }),
        )
    }
}

impl Default for HealthDataTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for HealthDataTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "query_health_record",
            "Looks up a value from the patient's health record by a free-text query.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Free-text description of the data to retrieve."}
                },
                "required": ["query"]
            }),
        )
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let query = input
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or("missing required `query` string field")?
            .to_lowercase();

        let records = self.records.read().expect("health data fixture lock poisoned");
        for (keyword, record) in records.iter() {
            if query.contains(keyword.as_str()) {
                return Ok(ToolResult::success(record.clone()));
            }
        }
        Ok(ToolResult::failure(format!(
            "no health record matched query: {}",
            query
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matches_fixture_by_keyword() {
        let tool = HealthDataTool::new().with_seed_fixtures();
        let result = tool
            .invoke(serde_json::json!({"query": "what was my most recent HbA1c?"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.value["hba1c"], 6.1);
    }

    #[tokio::test]
    async fn unmatched_query_returns_failure_result_not_error() {
        let tool = HealthDataTool::new().with_seed_fixtures();
        let result = tool
            .invoke(serde_json::json!({"query": "unrelated nonsense"}))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn missing_query_field_is_a_protocol_error() {
        let tool = HealthDataTool::new();
        let err = tool.invoke(serde_json::json!({})).await;
        assert!(err.is_err());
    }
}
