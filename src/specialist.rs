//! Specialist Runner (M1).
//!
//! Executes one [`SpecialistTask`] to a [`SpecialistResult`] via a bounded
//! tool-use loop: render prompts, open a completion, invoke any requested
//! tools and feed results back, and parse the model's final answer into the
//! required findings/recommendations/concerns/confidence shape.
//!
//! Grounded in the teacher's `BasicPlanner::plan` (`planner.rs`) tool
//! iteration loop — detect a tool call, execute it, feed the result back,
//! repeat up to a cap — generalized from the teacher's single JSON-in-text
//! convention to the L2 `CompletionChunk` shapes, and with the cap enforced
//! per spec as a hard budget rather than a soft iteration count.

use crate::client_wrapper::{CompletionBudget, CompletionChunk, LlmClient, Message, StopReason};
use crate::config::Config;
use crate::domain::{SpecialistResult, SpecialistStatus, SpecialistTask};
use crate::error::ErrorKind;
use crate::event_bus::{EventBus, LifecycleEvent};
use crate::prompt_loader::PromptCatalog;
use crate::tool_protocol::ToolRegistry;
use crate::trace::TraceRecorder;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::watch;

/// The structured response a specialist's final assistant message must
/// parse into (§4.M1 step 5).
#[derive(Debug, Deserialize)]
struct SpecialistAnswer {
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    concerns: Vec<String>,
    #[serde(default)]
    confidence: f32,
}

/// Execute `task` to completion. `cancel` is a cooperative cancellation flag
/// shared with the owning Scheduler; observing it `true` at any suspension
/// point ends the run immediately with `SpecialistStatus::Cancelled`.
#[allow(clippy::too_many_arguments)]
pub async fn run_specialist(
    task: &SpecialistTask,
    client: &dyn LlmClient,
    tools: &ToolRegistry,
    prompts: &PromptCatalog,
    config: &Config,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    trace_parent: Option<crate::domain::EventId>,
    mut cancel: watch::Receiver<bool>,
) -> SpecialistResult {
    let started_at = Instant::now();
    let specialty_key = task.specialty.as_str();

    let mut vars = HashMap::new();
    vars.insert("specialty", task.specialty.to_string());
    let system_prompt = match prompts.render(specialty_key, "system", &vars) {
        Ok(text) => text,
        Err(err) => {
            return finish(
                task,
                SpecialistStatus::Failed,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                0.0,
                0,
                started_at,
                Some(err.message().to_string()),
                Some(ErrorKind::PromptRenderError),
                event_bus,
                trace,
                None,
            )
            .await;
        }
    };

    let mut task_vars = HashMap::new();
    task_vars.insert("objective", task.objective.clone());
    task_vars.insert("context", task.context.clone());
    task_vars.insert("expected_output", task.expected_output.clone());
    let task_prompt = match prompts.render(specialty_key, "task", &task_vars) {
        Ok(text) => text,
        Err(err) => {
            return finish(
                task,
                SpecialistStatus::Failed,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                0.0,
                0,
                started_at,
                Some(err.message().to_string()),
                Some(ErrorKind::PromptRenderError),
                event_bus,
                trace,
                None,
            )
            .await;
        }
    };

    let trace_event = trace.start_event(
        "specialist",
        "running",
        serde_json::json!({"task_id": task.task_id.0, "specialty": specialty_key}),
        trace_parent,
        Some(specialty_key.to_string()),
    );

    event_bus
        .publish(LifecycleEvent::SpecialistStarted {
            task_id: task.task_id.clone(),
            specialty: task.specialty,
        })
        .await;

    let mut messages = vec![Message::user(task_prompt)];
    let mut tool_calls_used: u32 = 0;
    let mut last_text = String::new();
    let mut budget_exhausted = false;

    'outer: loop {
        if *cancel.borrow() {
            return finish(
                task,
                SpecialistStatus::Cancelled,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                0.0,
                tool_calls_used,
                started_at,
                None,
                Some(ErrorKind::Cancelled),
                event_bus,
                trace,
                Some(trace_event.clone()),
            )
            .await;
        }

        let tool_definitions = tools.list_definitions();
        let completion = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel) => {
                return finish(
                    task,
                    SpecialistStatus::Cancelled,
                    Vec::new(), Vec::new(), Vec::new(), 0.0,
                    tool_calls_used, started_at, None, Some(ErrorKind::Cancelled), event_bus, trace, Some(trace_event.clone()),
                ).await;
            }
            result = tokio::time::timeout(
                config.per_llm_call_timeout,
                client.complete(
                    &messages,
                    Some(&tool_definitions),
                    Some(&system_prompt),
                    CompletionBudget::default(),
                ),
            ) => result,
        };

        let mut stream = match completion {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return finish(
                    task,
                    SpecialistStatus::Failed,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    0.0,
                    tool_calls_used,
                    started_at,
                    Some(err.to_string()),
                    Some(ErrorKind::ProviderError),
                    event_bus,
                    trace,
                    Some(trace_event.clone()),
                )
                .await;
            }
            Err(_elapsed) => {
                return finish(
                    task,
                    SpecialistStatus::Timeout,
                    Vec::new(),
                    Vec::new(),
                    Vec::new(),
                    0.0,
                    tool_calls_used,
                    started_at,
                    Some("LLM call exceeded its per-call deadline".to_string()),
                    Some(ErrorKind::Timeout),
                    event_bus,
                    trace,
                    Some(trace_event.clone()),
                )
                .await;
            }
        };

        let mut pending_tool: Option<crate::client_wrapper::ToolUseRequest> = None;
        let mut round_text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => {
                    return finish(
                        task,
                        SpecialistStatus::Cancelled,
                        Vec::new(), Vec::new(), Vec::new(), 0.0,
                        tool_calls_used, started_at, None, Some(ErrorKind::Cancelled), event_bus, trace, Some(trace_event.clone()),
                    ).await;
                }
                chunk = tokio::time::timeout(config.per_llm_call_timeout, stream.next()) => chunk,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(err))) => {
                    return finish(
                        task,
                        SpecialistStatus::Failed,
                        Vec::new(),
                        Vec::new(),
                        Vec::new(),
                        0.0,
                        tool_calls_used,
                        started_at,
                        Some(err.to_string()),
                        Some(ErrorKind::ProviderError),
                        event_bus,
                        trace,
                        Some(trace_event.clone()),
                    )
                    .await;
                }
                Ok(None) => break,
                Err(_elapsed) => {
                    return finish(
                        task,
                        SpecialistStatus::Timeout,
                        Vec::new(),
                        Vec::new(),
                        Vec::new(),
                        0.0,
                        tool_calls_used,
                        started_at,
                        Some("LLM call exceeded its per-call deadline".to_string()),
                        Some(ErrorKind::Timeout),
                        event_bus,
                        trace,
                        Some(trace_event.clone()),
                    )
                    .await;
                }
            };

            match chunk {
                CompletionChunk::TextDelta(delta) => round_text.push_str(&delta),
                CompletionChunk::ToolUse(request) => pending_tool = Some(request),
                CompletionChunk::Terminal { stop_reason, .. } => {
                    last_text = round_text.clone();
                    if stop_reason != StopReason::ToolUse {
                        break 'outer;
                    }
                    break;
                }
            }
        }

        let Some(tool_call) = pending_tool else {
            break 'outer;
        };

        if tool_calls_used >= task.max_tool_calls {
            budget_exhausted = true;
            break 'outer;
        }

        let tool_event = trace.start_event(
            "tool_call",
            "invoke",
            serde_json::json!({"tool_name": tool_call.tool_name, "call_id": tool_call.call_id}),
            Some(trace_event.clone()),
            Some(specialty_key.to_string()),
        );

        let tool_outcome = tools.invoke(&tool_call.tool_name, tool_call.input.clone()).await;
        tool_calls_used += 1;

        let tool_result_text = match &tool_outcome {
            Ok(result) if result.success => {
                trace.end_event(
                    &tool_event,
                    Some(serde_json::json!({"success": true})),
                    None,
                );
                serde_json::to_string(&result.value).unwrap_or_default()
            }
            Ok(result) => {
                let error_text = result.error.clone().unwrap_or_else(|| "tool failed".to_string());
                trace.end_event(
                    &tool_event,
                    Some(serde_json::json!({"success": false})),
                    Some(error_text.clone()),
                );
                serde_json::json!({"error": error_text}).to_string()
            }
            Err(err) => {
                let error_text = err.message().to_string();
                trace.end_event(
                    &tool_event,
                    Some(serde_json::json!({"success": false})),
                    Some(error_text.clone()),
                );
                serde_json::json!({"error": error_text}).to_string()
            }
        };

        messages.push(Message::assistant(format!(
            "{{\"tool_call\": {{\"name\": \"{}\", \"input\": {}}}}}",
            tool_call.tool_name, tool_call.input
        )));
        messages.push(Message::tool_result(tool_call.call_id.clone(), tool_result_text));
    }

    if budget_exhausted {
        let partial = parse_answer(&last_text).unwrap_or(SpecialistAnswer {
            findings: Vec::new(),
            recommendations: Vec::new(),
            concerns: Vec::new(),
            confidence: 0.0,
        });
        return finish(
            task,
            SpecialistStatus::BudgetExhausted,
            partial.findings,
            partial.recommendations,
            partial.concerns,
            partial.confidence,
            tool_calls_used,
            started_at,
            Some("tool-call budget exhausted while the model still requested tools".to_string()),
            Some(ErrorKind::BudgetExhausted),
            event_bus,
            trace,
            Some(trace_event.clone()),
        )
        .await;
    }

    match parse_answer(&last_text) {
        Some(answer) => {
            finish(
                task,
                SpecialistStatus::Complete,
                answer.findings,
                answer.recommendations,
                answer.concerns,
                answer.confidence,
                tool_calls_used,
                started_at,
                None,
                None,
                event_bus,
                trace,
                Some(trace_event.clone()),
            )
            .await
        }
        None => {
            // One best-effort re-ask per §4.M1 step 5.
            messages.push(Message::user(
                "Your previous reply did not match the required JSON shape. Reply with exactly one JSON object: {\"findings\": [...], \"recommendations\": [...], \"concerns\": [...], \"confidence\": <0..1>}",
            ));
            let retry = tokio::time::timeout(
                config.per_llm_call_timeout,
                client.complete(&messages, None, Some(&system_prompt), CompletionBudget::default()),
            )
            .await;

            let retried_text = match retry {
                Ok(Ok(mut stream)) => {
                    let mut text = String::new();
                    loop {
                        match tokio::time::timeout(config.per_llm_call_timeout, stream.next()).await {
                            Ok(Some(Ok(CompletionChunk::TextDelta(delta)))) => text.push_str(&delta),
                            Ok(Some(Ok(_))) => {}
                            Ok(Some(Err(_))) | Ok(None) => break,
                            Err(_elapsed) => break,
                        }
                    }
                    text
                }
                Ok(Err(_)) | Err(_) => String::new(),
            };

            match parse_answer(&retried_text) {
                Some(answer) => {
                    finish(
                        task,
                        SpecialistStatus::Complete,
                        answer.findings,
                        answer.recommendations,
                        answer.concerns,
                        answer.confidence,
                        tool_calls_used,
                        started_at,
                        None,
                        None,
                        event_bus,
                        trace,
                        Some(trace_event.clone()),
                    )
                    .await
                }
                None => {
                    finish(
                        task,
                        SpecialistStatus::Failed,
                        Vec::new(),
                        Vec::new(),
                        Vec::new(),
                        0.0,
                        tool_calls_used,
                        started_at,
                        Some("could not parse a findings/recommendations/concerns/confidence response".to_string()),
                        Some(ErrorKind::ResponseParseError),
                        event_bus,
                        trace,
                        Some(trace_event.clone()),
                    )
                    .await
                }
            }
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Parse the model's final text into the required answer shape. Accepts
/// either a bare JSON object or one embedded in surrounding prose.
fn parse_answer(text: &str) -> Option<SpecialistAnswer> {
    if let Ok(answer) = serde_json::from_str::<SpecialistAnswer>(text.trim()) {
        return Some(answer);
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
    let end = end?;
    serde_json::from_str::<SpecialistAnswer>(&text[start..end]).ok()
}

#[allow(clippy::too_many_arguments)]
async fn finish(
    task: &SpecialistTask,
    status: SpecialistStatus,
    findings: Vec<String>,
    recommendations: Vec<String>,
    concerns: Vec<String>,
    confidence: f32,
    tool_calls_used: u32,
    started_at: Instant,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    trace_event: Option<crate::domain::EventId>,
) -> SpecialistResult {
    let mut result = SpecialistResult {
        task_id: task.task_id.clone(),
        specialty: task.specialty,
        status,
        findings,
        recommendations,
        concerns,
        confidence,
        tool_calls_used,
        elapsed_ms: started_at.elapsed().as_millis() as u64,
        error: error.clone(),
        error_kind,
    };
    result.clamp_confidence();

    event_bus
        .publish(LifecycleEvent::SpecialistCompleted {
            task_id: result.task_id.clone(),
            status: result.status.to_string(),
            confidence: result.confidence,
            tool_calls_used: result.tool_calls_used,
        })
        .await;

    if let Some(event_id) = trace_event {
        trace.end_event(
            &event_id,
            Some(serde_json::json!({"status": result.status.to_string()})),
            error,
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::domain::{QueryId, SpecialtyTag};
    use crate::trace::NullTraceStore;

    fn catalog() -> PromptCatalog {
        PromptCatalog::new()
            .with_template("cardiology", "system", "You are a cardiology specialist.")
            .with_template(
                "cardiology",
                "task",
                "Objective: {objective}\nContext: {context}\nExpected output: {expected_output}",
            )
    }

    fn task() -> SpecialistTask {
        SpecialistTask::new(
            QueryId::new(),
            SpecialtyTag::Cardiology,
            "Summarize cholesterol trend",
            "A short narrative with a confidence score",
            3,
        )
    }

    #[tokio::test]
    async fn happy_path_parses_final_answer() {
        let client = MockClient::new().with_text_response(
            r#"{"findings": ["LDL down 20%"], "recommendations": ["keep diet"], "concerns": [], "confidence": 0.9}"#,
        );
        let tools = ToolRegistry::new();
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(crate::domain::TraceId::new());
        let (_tx, rx) = watch::channel(false);

        let config = Config::default();
        let result = run_specialist(&task(), &client, &tools, &prompts, &config, &bus, &trace, None, rx).await;
        assert_eq!(result.status, SpecialistStatus::Complete);
        assert_eq!(result.findings, vec!["LDL down 20%".to_string()]);
        assert!(result.confidence <= 1.0);
        let _ = trace.finalize(&NullTraceStore).await;
        let _ = rx.has_changed();
    }

    #[tokio::test]
    async fn cancellation_before_start_yields_cancelled_status() {
        let client = MockClient::new().with_text_response("{}");
        let tools = ToolRegistry::new();
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(crate::domain::TraceId::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let config = Config::default();
        let result = run_specialist(&task(), &client, &tools, &prompts, &config, &bus, &trace, None, rx).await;
        assert_eq!(result.status, SpecialistStatus::Cancelled);
    }

    #[tokio::test]
    async fn budget_exhausted_when_model_keeps_requesting_tools() {
        let client = MockClient::new()
            .with_tool_use("query_health_record", serde_json::json!({"query": "hba1c"}))
            .with_tool_use("query_health_record", serde_json::json!({"query": "hba1c"}));
        let mut tools = ToolRegistry::new();
        tools.register(std::sync::Arc::new(crate::tools::HealthDataTool::new().with_seed_fixtures()));
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(crate::domain::TraceId::new());
        let (_tx, rx) = watch::channel(false);

        let mut small_budget_task = task();
        small_budget_task.max_tool_calls = 1;

        let config = Config::default();
        let result = run_specialist(&small_budget_task, &client, &tools, &prompts, &config, &bus, &trace, None, rx).await;
        assert_eq!(result.status, SpecialistStatus::BudgetExhausted);
        assert!(result.confidence <= 0.3);
        assert!(result.tool_calls_used <= small_budget_task.max_tool_calls);
    }

    #[tokio::test]
    async fn a_hung_llm_call_resolves_as_timeout() {
        let client = MockClient::new()
            .with_delay(std::time::Duration::from_millis(50))
            .with_text_response(r#"{"findings": [], "recommendations": [], "concerns": [], "confidence": 0.5}"#);
        let tools = ToolRegistry::new();
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(crate::domain::TraceId::new());
        let (_tx, rx) = watch::channel(false);
        let mut config = Config::default();
        config.per_llm_call_timeout = std::time::Duration::from_millis(1);

        let result = run_specialist(&task(), &client, &tools, &prompts, &config, &bus, &trace, None, rx).await;
        assert_eq!(result.status, SpecialistStatus::Timeout);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }
}
