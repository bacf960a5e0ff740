//! Analyst Service (T1).
//!
//! Top-level orchestration entry point: accepts one [`Query`], drives it
//! through the CMO's three phases and the Scheduler, and emits a single
//! ordered stream of [`LifecycleEvent`]s that always ends in exactly one
//! terminal event.
//!
//! `execute()` implements the happy path described in §5 and never touches
//! `final`/`failed` itself. [`AnalystService::run`] wraps it in a race
//! against the query-wide deadline and is the one place that publishes a
//! terminal event, satisfying §8 invariant 1 ("exactly one terminal event
//! per run") by construction rather than by scattered checks.
//!
//! Grounded in the teacher's `Orchestration::run` — one async entry point
//! dispatching to phase methods and folding their outputs into a single
//! response — generalized to own a cancellation/deadline race and a
//! lifecycle event stream the teacher's text-returning `run` has no need
//! for.

use crate::client_wrapper::LlmClient;
use crate::cmo;
use crate::config::Config;
use crate::domain::{Query, TraceId};
use crate::error::CoreError;
use crate::event_bus::{EventBus, LifecycleEvent, TeamMember};
use crate::prompt_loader::PromptCatalog;
use crate::scheduler;
use crate::tool_protocol::ToolRegistry;
use crate::trace::{NullTraceStore, TraceRecorder, TraceStore};
use crate::visualization;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything one query's run needs, `Arc`-wrapped so a `tokio::spawn`ed
/// task can own a cheap clone of it without borrowing from the caller.
pub struct Dependencies {
    pub client: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub prompts: Arc<PromptCatalog>,
    pub config: Config,
    pub trace_store: Arc<dyn TraceStore>,
}

impl Dependencies {
    pub fn new(
        client: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        prompts: Arc<PromptCatalog>,
        config: Config,
    ) -> Self {
        Dependencies {
            client,
            tools,
            prompts,
            config,
            trace_store: Arc::new(NullTraceStore),
        }
    }

    pub fn with_trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = store;
        self
    }
}

impl Clone for Dependencies {
    fn clone(&self) -> Self {
        Dependencies {
            client: self.client.clone(),
            tools: self.tools.clone(),
            prompts: self.prompts.clone(),
            config: self.config.clone(),
            trace_store: self.trace_store.clone(),
        }
    }
}

/// Runs queries against a fixed set of `Dependencies`.
pub struct AnalystService {
    deps: Dependencies,
}

impl AnalystService {
    pub fn new(deps: Dependencies) -> Self {
        AnalystService { deps }
    }

    /// Start running `query` in the background. Returns immediately with the
    /// event bus the caller should drain via repeated `EventBus::recv` calls,
    /// and a cancellation handle the caller may trigger at any time; sending
    /// `true` cascades cooperative cancellation into whatever CMO phase or
    /// specialist is currently running.
    pub fn run(&self, query: Query) -> (Arc<EventBus>, watch::Sender<bool>) {
        let event_bus = Arc::new(EventBus::new(256));
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let deps = self.deps.clone();
        let bus = event_bus.clone();
        let cancel = cancel_tx.clone();

        tokio::spawn(async move {
            let trace = TraceRecorder::new(TraceId::new());
            let global_timeout = deps.config.global_query_timeout;

            let exec = execute(&query, &deps, &bus, &trace, &cancel);
            tokio::pin!(exec);
            let sleep = tokio::time::sleep(global_timeout);
            tokio::pin!(sleep);

            let outcome = tokio::select! {
                biased;
                _ = &mut sleep => {
                    let _ = cancel.send(true);
                    exec.await
                }
                result = &mut exec => result,
            };

            match outcome {
                Ok((digest, trace_id)) => {
                    bus.publish(LifecycleEvent::Final {
                        trace_id,
                        synthesis_digest: digest,
                    })
                    .await;
                }
                Err(err) => {
                    bus.publish(LifecycleEvent::Failed {
                        error_kind: err.kind(),
                        message: err.message().to_string(),
                    })
                    .await;
                }
            }

            if deps.config.trace_enabled {
                trace.finalize(deps.trace_store.as_ref()).await;
            }
            bus.close();
        });

        (event_bus, cancel_tx)
    }
}

/// The happy path, §5 steps 1-7. Returns the synthesis digest and trace id
/// on success; never publishes a terminal lifecycle event itself, since the
/// caller ([`AnalystService::run`]) owns that.
async fn execute(
    query: &Query,
    deps: &Dependencies,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    cancel: &watch::Sender<bool>,
) -> Result<(String, TraceId), CoreError> {
    let root = trace.start_event(
        "query",
        "received",
        serde_json::json!({"query_id": query.query_id.0}),
        None,
        None,
    );
    event_bus
        .publish(LifecycleEvent::QueryReceived {
            query_id: query.query_id.clone(),
            text: query.text.clone(),
        })
        .await;

    event_bus
        .publish(LifecycleEvent::CmoAnalysisStarted {
            agent_id: "cmo".to_string(),
        })
        .await;
    let analysis = run_cancellable(
        cmo::analyze(
            query,
            deps.client.as_ref(),
            deps.tools.as_ref(),
            deps.prompts.as_ref(),
            &deps.config,
            trace,
            Some(root.clone()),
        ),
        cancel,
    )
    .await?;
    event_bus
        .publish(LifecycleEvent::CmoAnalysisComplete {
            complexity: analysis.complexity,
            initial_data_points: analysis.initial_data_points.clone(),
        })
        .await;

    let tasks = run_cancellable(
        cmo::assemble(
            query,
            &analysis,
            deps.client.as_ref(),
            deps.prompts.as_ref(),
            &deps.config,
            trace,
            Some(root.clone()),
        ),
        cancel,
    )
    .await?;
    event_bus
        .publish(LifecycleEvent::TeamAssembled {
            specialists: tasks
                .iter()
                .map(|t| TeamMember {
                    task_id: t.task_id.clone(),
                    specialty: t.specialty,
                    priority: t.priority,
                    max_tool_calls: t.max_tool_calls,
                })
                .collect(),
        })
        .await;

    let results = scheduler::run_tasks(
        tasks,
        deps.client.as_ref(),
        deps.tools.as_ref(),
        deps.prompts.as_ref(),
        event_bus,
        trace,
        Some(root.clone()),
        &deps.config,
        cancel,
    )
    .await;

    // Checked here, ahead of publishing `synthesis_started`, so a query that
    // never gets a successful specialist (every one failed, timed out, or
    // was cancelled) never emits a `synthesis_*` event at all.
    cmo::require_any_success(&results)?;

    event_bus.publish(LifecycleEvent::SynthesisStarted).await;
    let synthesis = run_cancellable(
        cmo::synthesize(
            query,
            &results,
            deps.client.as_ref(),
            deps.prompts.as_ref(),
            &deps.config,
            trace,
            Some(root.clone()),
        ),
        cancel,
    )
    .await?;
    event_bus
        .publish(LifecycleEvent::SynthesisComplete {
            narrative: synthesis.narrative.clone(),
        })
        .await;

    // Visualization failure is never fatal to the query (§7); its own
    // module degrades to `viz_failed` and returns `None` on any error.
    let _artifact = visualization::generate(
        query,
        &synthesis,
        deps.client.as_ref(),
        deps.prompts.as_ref(),
        &deps.config,
        event_bus,
        trace,
        Some(root.clone()),
    )
    .await;

    trace.end_event(&root, None, None);
    Ok((synthesis.digest(), trace.trace_id().clone()))
}

/// Race a CMO phase against the shared cancellation flag. The phase
/// functions themselves have no suspension-point cancellation checks (each
/// is a single LLM call, not a long-running loop like the Scheduler's), so
/// this is where a flipped flag actually cuts one short.
async fn run_cancellable<T>(
    fut: impl Future<Output = Result<T, CoreError>>,
    cancel: &watch::Sender<bool>,
) -> Result<T, CoreError> {
    if *cancel.borrow() {
        return Err(CoreError::cancelled("query cancelled before this phase started"));
    }
    let mut cancel_rx = cancel.subscribe();
    tokio::select! {
        biased;
        _ = wait_for_cancel(&mut cancel_rx) => {
            Err(CoreError::cancelled("query cancelled or exceeded its global deadline"))
        }
        result = fut => result,
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
