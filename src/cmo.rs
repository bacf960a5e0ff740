//! CMO Orchestrator Loop (M2).
//!
//! Three sequential, bounded LLM phases — Analyze, Assemble & Dispatch,
//! Synthesize — each mirroring one `Orchestration` phase in the teacher's
//! `orchestration.rs`, specialized to this engine's fixed three-phase shape
//! instead of the teacher's open-ended phase list, plus the deterministic
//! post-validator for team assembly that the teacher has no counterpart for.

use crate::client_wrapper::{CompletionBudget, CompletionChunk, LlmClient, Message};
use crate::config::Config;
use crate::domain::{
    ComplexityClass, EventId, InitialAnalysis, Priority, Query, SpecialistResult,
    SpecialistStatus, SpecialtyTag, Synthesis,
};
use crate::error::{CoreError, ErrorKind};
use crate::prompt_loader::PromptCatalog;
use crate::tool_protocol::ToolRegistry;
use crate::trace::TraceRecorder;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// CMO phase-machine state, mirroring the ASCII diagram in §4.M2 verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmoState {
    Idle,
    Analyzed,
    Dispatched,
    Synthesized,
    Done,
    Failed(ErrorKind),
}

impl fmt::Display for CmoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmoState::Idle => write!(f, "IDLE"),
            CmoState::Analyzed => write!(f, "ANALYZED"),
            CmoState::Dispatched => write!(f, "DISPATCHED"),
            CmoState::Synthesized => write!(f, "SYNTHESIZED"),
            CmoState::Done => write!(f, "DONE"),
            CmoState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

/// What the model must return from Phase A, before the engine wraps it in
/// the timestamped `InitialAnalysis` record.
#[derive(Debug, Clone, Default)]
pub struct AnalysisDraft {
    pub complexity: Option<ComplexityClass>,
    pub approach_summary: String,
    pub initial_data_points: Vec<String>,
    pub cmo_reasoning: String,
}

impl AnalysisDraft {
    /// Apply the Phase A tie-break rules (§4.M2): two classes named, pick
    /// the higher; no class named, default to `Standard`.
    pub fn into_analysis(self) -> InitialAnalysis {
        InitialAnalysis {
            complexity: self.complexity.unwrap_or_default(),
            approach_summary: self.approach_summary,
            initial_data_points: self.initial_data_points,
            cmo_reasoning: self.cmo_reasoning,
        }
    }
}

/// One candidate specialist task the model proposed in Phase B, before the
/// post-validator assigns `max_tool_calls` and a `TaskId`.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub specialty: SpecialtyTag,
    pub objective: String,
    pub context: String,
    pub expected_output: String,
    pub priority: Priority,
}

/// Validate a proposed team against the §4.M2 post-validator rules. Returns
/// the first violation found, if any, as a human-readable reason (used to
/// build the one-shot repair reprompt).
pub fn validate_team(drafts: &[TaskDraft], complexity: ComplexityClass) -> Result<(), String> {
    let (min, max) = complexity.team_size_bounds();
    if drafts.is_empty() {
        return Err("the team is empty".to_string());
    }
    if drafts.len() < min || drafts.len() > max {
        return Err(format!(
            "team size {} is outside the {}..={} bound for {}",
            drafts.len(),
            min,
            max,
            complexity
        ));
    }

    let other_specialties = drafts
        .iter()
        .filter(|d| d.specialty != SpecialtyTag::GeneralPractice)
        .count();
    let has_general_practice = drafts
        .iter()
        .any(|d| d.specialty == SpecialtyTag::GeneralPractice);
    if other_specialties < 3 && !has_general_practice {
        return Err(
            "general_practice must be included unless at least 3 other specialties are present"
                .to_string(),
        );
    }

    for draft in drafts {
        if draft.objective.trim().is_empty() {
            return Err(format!("{} has an empty objective", draft.specialty));
        }
        if draft.expected_output.trim().is_empty() {
            return Err(format!("{} has an empty expected_output", draft.specialty));
        }
    }

    Ok(())
}

/// Turn a validated set of drafts into dispatch-ready tasks, assigning
/// `max_tool_calls` from the complexity → budget table (§4.M2, overridable
/// via `Config::specialist_tool_budget_by_complexity`).
pub fn finalize_team(
    drafts: Vec<TaskDraft>,
    query: &Query,
    complexity: ComplexityClass,
    config: &Config,
) -> Vec<crate::domain::SpecialistTask> {
    let max_tool_calls = config.specialist_tool_budget(complexity);
    drafts
        .into_iter()
        .map(|draft| {
            crate::domain::SpecialistTask::new(
                query.query_id.clone(),
                draft.specialty,
                draft.objective,
                draft.expected_output,
                max_tool_calls,
            )
            .with_context(draft.context)
            .with_priority(draft.priority)
        })
        .collect()
}

/// Phase C. Requires at least one `Complete` result; otherwise the query
/// ends with `NO_SPECIALIST_SUCCEEDED` (§4.M2, §8 boundary behavior).
pub fn require_any_success(results: &[SpecialistResult]) -> Result<(), CoreError> {
    if results
        .iter()
        .any(|r| r.status == SpecialistStatus::Complete)
    {
        Ok(())
    } else {
        Err(CoreError::no_specialist_succeeded(
            "every specialist failed, timed out, or was cancelled",
        ))
    }
}

/// Build the narrative/key-points/unresolved-concerns synthesis from a
/// model's rendered narrative and the specialist results it was grounded on.
/// The model is expected to have produced `narrative` and `key_points`
/// already (via a Phase C completion); this just assembles the record and
/// carries forward every unresolved concern, including from specialists that
/// did not complete, per §4.M2's "failed ones included with error
/// summaries" instruction.
pub fn build_synthesis(
    query: &Query,
    narrative: String,
    key_points: Vec<String>,
    results: &[SpecialistResult],
) -> Synthesis {
    let mut unresolved_concerns: Vec<String> = results
        .iter()
        .flat_map(|r| r.concerns.iter().cloned())
        .collect();
    for result in results {
        if result.status != SpecialistStatus::Complete {
            unresolved_concerns.push(format!(
                "{} did not complete ({}){}",
                result.specialty,
                result.status,
                result
                    .error
                    .as_ref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ));
        }
    }

    Synthesis {
        query_id: query.query_id.clone(),
        narrative,
        key_points,
        unresolved_concerns,
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    complexity: Option<String>,
    #[serde(default)]
    approach_summary: String,
    #[serde(default)]
    initial_data_points: Vec<String>,
    #[serde(default)]
    cmo_reasoning: String,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    specialty: String,
    #[serde(default)]
    objective: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    expected_output: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssembleResponse {
    #[serde(default)]
    tasks: Vec<TaskResponse>,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    #[serde(default)]
    narrative: String,
    #[serde(default)]
    key_points: Vec<String>,
}

fn parse_priority(s: Option<&str>) -> Priority {
    match s.map(str::to_uppercase).as_deref() {
        Some("HIGH") => Priority::High,
        Some("LOW") => Priority::Low,
        _ => Priority::Medium,
    }
}

/// Extract the first balanced `{...}` object in `text` and parse it as `T`.
/// Mirrors the brace-counting extraction `SpecialistRunner` uses for final
/// answers, duplicated here rather than shared since each caller's
/// surrounding error context differs.
fn parse_json_object<T: for<'de> Deserialize<'de>>(text: &str) -> Option<T> {
    if let Ok(value) = serde_json::from_str::<T>(text.trim()) {
        return Some(value);
    }
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut end = None;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if b == b'{' {
            depth += 1;
        } else if b == b'}' {
            depth -= 1;
            if depth == 0 {
                end = Some(i + 1);
                break;
            }
        }
    }
    serde_json::from_str::<T>(&text[start..end?]).ok()
}

async fn collect_text(
    client: &dyn LlmClient,
    messages: &[Message],
    system: &str,
    call_timeout: Duration,
) -> Result<String, CoreError> {
    let mut stream = tokio::time::timeout(
        call_timeout,
        client.complete(messages, None, Some(system), CompletionBudget::default()),
    )
    .await
    .map_err(|_| CoreError::timeout("LLM call exceeded its per-call deadline"))?
    .map_err(|e| CoreError::provider_error(e.to_string()))?;

    let mut text = String::new();
    loop {
        match tokio::time::timeout(call_timeout, stream.next()).await {
            Ok(Some(chunk)) => match chunk.map_err(|e| CoreError::provider_error(e.to_string()))? {
                CompletionChunk::TextDelta(delta) => text.push_str(&delta),
                CompletionChunk::Terminal { .. } => break,
                CompletionChunk::ToolUse(_) => {}
            },
            Ok(None) => break,
            Err(_elapsed) => return Err(CoreError::timeout("LLM call exceeded its per-call deadline")),
        }
    }
    Ok(text)
}

/// Phase A. Samples the health record through at most `config.cmo_tool_budget`
/// tool calls, then asks the model for a final `InitialAnalysis`.
pub async fn analyze(
    query: &Query,
    client: &dyn LlmClient,
    tools: &ToolRegistry,
    prompts: &PromptCatalog,
    config: &Config,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
) -> Result<InitialAnalysis, CoreError> {
    let mut vars = HashMap::new();
    vars.insert("query_text", query.text.clone());
    let system_prompt = prompts.render("cmo", "system", &HashMap::new())?;
    let user_prompt = prompts.render("cmo", "analyze", &vars)?;

    let event = trace.start_event(
        "llm_call",
        "analyze",
        serde_json::json!({"query_id": query.query_id.0}),
        trace_parent,
        Some("cmo".to_string()),
    );

    let mut messages = vec![Message::user(user_prompt)];
    let tool_definitions = tools.list_definitions();
    let mut tool_calls_used = 0u32;
    let mut last_text = String::new();

    loop {
        let mut stream = tokio::time::timeout(
            config.per_llm_call_timeout,
            client.complete(
                &messages,
                Some(&tool_definitions),
                Some(&system_prompt),
                CompletionBudget::default(),
            ),
        )
        .await
        .map_err(|_| CoreError::timeout("LLM call exceeded its per-call deadline"))?
        .map_err(|e| CoreError::provider_error(e.to_string()))?;

        let mut pending_tool = None;
        let mut round_text = String::new();
        let mut saw_tool_use_terminal = false;

        loop {
            let next = tokio::time::timeout(config.per_llm_call_timeout, stream.next())
                .await
                .map_err(|_| CoreError::timeout("LLM call exceeded its per-call deadline"))?;
            let Some(chunk) = next else { break };
            match chunk.map_err(|e| CoreError::provider_error(e.to_string()))? {
                CompletionChunk::TextDelta(delta) => round_text.push_str(&delta),
                CompletionChunk::ToolUse(request) => pending_tool = Some(request),
                CompletionChunk::Terminal { stop_reason, .. } => {
                    last_text = round_text.clone();
                    saw_tool_use_terminal = stop_reason == crate::client_wrapper::StopReason::ToolUse;
                    break;
                }
            }
        }

        let Some(tool_call) = pending_tool else {
            break;
        };
        if !saw_tool_use_terminal || tool_calls_used >= config.cmo_tool_budget {
            break;
        }

        let outcome = tools.invoke(&tool_call.tool_name, tool_call.input.clone()).await;
        tool_calls_used += 1;
        let result_text = match outcome {
            Ok(result) if result.success => serde_json::to_string(&result.value).unwrap_or_default(),
            Ok(result) => serde_json::json!({"error": result.error}).to_string(),
            Err(err) => serde_json::json!({"error": err.message()}).to_string(),
        };

        messages.push(Message::assistant(format!(
            "{{\"tool_call\": {{\"name\": \"{}\", \"input\": {}}}}}",
            tool_call.tool_name, tool_call.input
        )));
        messages.push(Message::tool_result(tool_call.call_id.clone(), result_text));
    }

    let parsed: AnalysisResponse = parse_json_object(&last_text)
        .ok_or_else(|| CoreError::response_parse_error("could not parse CMO analysis response"))?;

    let complexity = parsed
        .complexity
        .as_deref()
        .and_then(|s| match s.to_uppercase().as_str() {
            "SIMPLE" => Some(ComplexityClass::Simple),
            "STANDARD" => Some(ComplexityClass::Standard),
            "COMPLEX" => Some(ComplexityClass::Complex),
            "COMPREHENSIVE" => Some(ComplexityClass::Comprehensive),
            _ => None,
        });

    let draft = AnalysisDraft {
        complexity,
        approach_summary: parsed.approach_summary,
        initial_data_points: parsed.initial_data_points,
        cmo_reasoning: parsed.cmo_reasoning,
    };

    trace.end_event(&event, Some(serde_json::json!({"tool_calls_used": tool_calls_used})), None);
    Ok(draft.into_analysis())
}

/// Phase B, including the one-shot repair reprompt on a post-validator
/// violation (§4.M2).
pub async fn assemble(
    query: &Query,
    analysis: &InitialAnalysis,
    client: &dyn LlmClient,
    prompts: &PromptCatalog,
    config: &Config,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
) -> Result<Vec<crate::domain::SpecialistTask>, CoreError> {
    let system_prompt = prompts.render("cmo", "system", &HashMap::new())?;
    let mut vars = HashMap::new();
    vars.insert("query_text", query.text.clone());
    vars.insert("complexity", analysis.complexity.to_string());
    vars.insert("approach_summary", analysis.approach_summary.clone());
    let user_prompt = prompts.render("cmo", "assemble", &vars)?;

    let event = trace.start_event(
        "llm_call",
        "assemble",
        serde_json::json!({"query_id": query.query_id.0}),
        trace_parent,
        Some("cmo".to_string()),
    );

    let mut attempt_messages = vec![Message::user(user_prompt)];

    for attempt in 0..2 {
        let text = collect_text(client, &attempt_messages, &system_prompt, config.per_llm_call_timeout).await?;
        let parsed: Option<AssembleResponse> = parse_json_object(&text);
        let drafts: Vec<TaskDraft> = parsed
            .map(|r| {
                r.tasks
                    .into_iter()
                    .filter_map(|t| {
                        SpecialtyTag::from_str(&t.specialty).map(|specialty| TaskDraft {
                            specialty,
                            objective: t.objective,
                            context: t.context,
                            expected_output: t.expected_output,
                            priority: parse_priority(t.priority.as_deref()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        match validate_team(&drafts, analysis.complexity) {
            Ok(()) => {
                trace.end_event(&event, Some(serde_json::json!({"attempts": attempt + 1})), None);
                return Ok(finalize_team(drafts, query, analysis.complexity, config));
            }
            Err(reason) if attempt == 0 => {
                let mut repair_vars = HashMap::new();
                repair_vars.insert("reason", reason);
                let repair_prompt = prompts
                    .render("cmo", "assemble_repair", &repair_vars)
                    .unwrap_or_else(|_| {
                        "Your team assembly violated the required constraints. Reply again with a corrected JSON team.".to_string()
                    });
                attempt_messages.push(Message::user(repair_prompt));
            }
            Err(reason) => {
                trace.end_event(&event, None, Some(reason.clone()));
                return Err(CoreError::team_assembly_invalid(reason));
            }
        }
    }

    trace.end_event(&event, None, Some("team assembly exhausted retries".to_string()));
    Err(CoreError::team_assembly_invalid(
        "team assembly invalid after the allotted repair reprompt",
    ))
}

/// Phase C. Requires `require_any_success` to have already passed.
#[allow(clippy::too_many_arguments)]
pub async fn synthesize(
    query: &Query,
    results: &[SpecialistResult],
    client: &dyn LlmClient,
    prompts: &PromptCatalog,
    config: &Config,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
) -> Result<Synthesis, CoreError> {
    require_any_success(results)?;

    let system_prompt = prompts.render("cmo", "system", &HashMap::new())?;
    let mut vars = HashMap::new();
    vars.insert("query_text", query.text.clone());
    vars.insert(
        "results_summary",
        serde_json::to_string(results).unwrap_or_default(),
    );
    let user_prompt = prompts.render("cmo", "synthesize", &vars)?;

    let event = trace.start_event(
        "llm_call",
        "synthesize",
        serde_json::json!({"query_id": query.query_id.0}),
        trace_parent,
        Some("cmo".to_string()),
    );

    let text = collect_text(
        client,
        &[Message::user(user_prompt)],
        &system_prompt,
        config.per_llm_call_timeout,
    )
    .await?;
    let parsed: SynthesisResponse = parse_json_object(&text)
        .ok_or_else(|| CoreError::response_parse_error("could not parse CMO synthesis response"))?;

    trace.end_event(&event, None, None);
    Ok(build_synthesis(query, parsed.narrative, parsed.key_points, results))
}
