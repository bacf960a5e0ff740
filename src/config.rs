//! Configuration for the orchestration engine.
//!
//! Mirrors the teacher's `CloudLLMConfig`: a plain struct users construct
//! however they like, with a hand-written [`Default`]. No TOML/YAML parsing
//! dependency is introduced.

use crate::domain::ComplexityClass;
use std::collections::HashMap;
use std::time::Duration;

/// Process/query-wide tunables recognized by the core.
///
/// # Example
///
/// ```
/// use health_insight_orchestrator::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_parallel_specialists, 5);
/// assert_eq!(config.specialist_tool_budget(health_insight_orchestrator::domain::ComplexityClass::Simple), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum specialist tasks the Scheduler runs concurrently.
    pub max_parallel_specialists: usize,
    /// Wall-clock deadline for a single specialist task.
    pub per_task_timeout: Duration,
    /// Wall-clock deadline for a single LLM call.
    pub per_llm_call_timeout: Duration,
    /// Wall-clock deadline for an entire query.
    pub global_query_timeout: Duration,
    /// Tool-call budget for the CMO's Analyze phase.
    pub cmo_tool_budget: u32,
    /// `max_tool_calls` assigned to each specialist task, keyed by the
    /// query's reported complexity (§4.M2).
    pub specialist_tool_budget_by_complexity: HashMap<ComplexityClass, u32>,
    /// Number of times a task failing with a transient LLM error is retried.
    pub llm_provider_retries: u32,
    /// Whether the Visualization Generator runs at all.
    pub visualization_enabled: bool,
    /// Whether the Trace Recorder persists a document on close-out.
    pub trace_enabled: bool,
}

impl Config {
    /// Look up the specialist tool-call budget for a complexity class,
    /// falling back to the §4.M2 default table if the map was built without
    /// an explicit entry for it.
    pub fn specialist_tool_budget(&self, complexity: ComplexityClass) -> u32 {
        self.specialist_tool_budget_by_complexity
            .get(&complexity)
            .copied()
            .unwrap_or_else(|| complexity.default_tool_budget())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut specialist_tool_budget_by_complexity = HashMap::new();
        for complexity in ComplexityClass::ALL {
            specialist_tool_budget_by_complexity.insert(complexity, complexity.default_tool_budget());
        }

        Config {
            max_parallel_specialists: 5,
            per_task_timeout: Duration::from_millis(120_000),
            per_llm_call_timeout: Duration::from_millis(60_000),
            global_query_timeout: Duration::from_millis(600_000),
            cmo_tool_budget: 3,
            specialist_tool_budget_by_complexity,
            llm_provider_retries: 1,
            visualization_enabled: true,
            trace_enabled: true,
        }
    }
}
