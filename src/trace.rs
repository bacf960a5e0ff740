//! Trace Recorder (L4).
//!
//! An append-only hierarchical log of everything a query's CMO, specialists,
//! and visualization generator do, safe to call from many concurrently
//! running specialists at once. Grounded in the teacher's `ThoughtChain`
//! (`cloudllm::thought_chain`) — a single `Mutex`-guarded `Vec` mirrored out
//! on `finalize` — minus its SHA-256 hash chaining, which the spec has no use
//! for: causality here is carried by `parent_event_id`, not tamper evidence.

use crate::domain::{EventId, TraceId};
use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One node in a trace's causal forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_id: EventId,
    pub parent_event_id: Option<EventId>,
    pub trace_id: TraceId,
    /// Local sequence within the trace, assigned at `start_event` time.
    pub seq: u64,
    pub event_type: String,
    pub stage: String,
    pub agent_id: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub attributes: serde_json::Value,
    pub error: Option<String>,
}

/// Per-agent roll-up counted into a `TraceDocument`'s summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSummary {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub llm_calls: u64,
    pub tool_calls: u64,
    pub total_ms: u64,
    pub by_agent: HashMap<String, AgentSummary>,
}

/// The finalized, JSON-serializable artifact produced once per query (§6.3).
/// The forest is reconstructible from `events[].parent_event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDocument {
    pub trace_id: TraceId,
    pub root_event_id: Option<EventId>,
    pub events: Vec<TraceEvent>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub summary: TraceSummary,
}

impl TraceDocument {
    /// A standalone, human-viewable rendering of the trace. The core treats
    /// the return value as opaque text — no HTML escaping concerns beyond
    /// what this renders into a `<pre>` block.
    pub fn render_html(&self) -> String {
        let mut out = String::from("<!doctype html><html><body><pre>\n");
        for event in &self.events {
            out.push_str(&format!(
                "[{}] {} / {}{}\n",
                event.seq,
                event.event_type,
                event.stage,
                event
                    .agent_id
                    .as_ref()
                    .map(|a| format!(" ({})", a))
                    .unwrap_or_default()
            ));
        }
        out.push_str("</pre></body></html>\n");
        out
    }
}

/// External persistence capability for finalized traces (§6.1). Failures
/// here are logged, never propagated — the query's own outcome does not
/// depend on trace storage succeeding.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn persist(&self, document: &TraceDocument) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Discards every trace. Useful where persistence genuinely isn't wanted
/// (`trace_enabled = false`) without special-casing the caller.
pub struct NullTraceStore;

#[async_trait]
impl TraceStore for NullTraceStore {
    async fn persist(&self, _document: &TraceDocument) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// Keeps every finalized document in memory, for tests that assert on what
/// would have been persisted.
#[derive(Default)]
pub struct InMemoryTraceStore {
    documents: Mutex<Vec<TraceDocument>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        InMemoryTraceStore {
            documents: Mutex::new(Vec::new()),
        }
    }

    pub fn documents(&self) -> Vec<TraceDocument> {
        self.documents.lock().expect("trace store lock poisoned").clone()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn persist(&self, document: &TraceDocument) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.documents
            .lock()
            .expect("trace store lock poisoned")
            .push(document.clone());
        Ok(())
    }
}

/// A store that always fails, used to exercise the `TRACE_PERSIST_FAILED`
/// non-fatal path in tests.
pub struct FailingTraceStore;

#[async_trait]
impl TraceStore for FailingTraceStore {
    async fn persist(&self, _document: &TraceDocument) -> Result<(), Box<dyn Error + Send + Sync>> {
        Err("trace store unavailable".into())
    }
}

/// One query's append-only event log. Single internal lock, per §5's shared
/// mutable state rule — every `start_event`/`end_event`/`note` call is a
/// short critical section with no `.await` inside it.
pub struct TraceRecorder {
    trace_id: TraceId,
    created_at: DateTime<Utc>,
    events: Mutex<Vec<TraceEvent>>,
    next_seq: AtomicU64,
    root_event_id: Mutex<Option<EventId>>,
}

impl TraceRecorder {
    pub fn new(trace_id: TraceId) -> Self {
        TraceRecorder {
            trace_id,
            created_at: Utc::now(),
            events: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            root_event_id: Mutex::new(None),
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Open a new event, optionally as a child of `parent`. The first event
    /// opened for a trace (no `parent`) becomes its root.
    pub fn start_event(
        &self,
        event_type: impl Into<String>,
        stage: impl Into<String>,
        attributes: serde_json::Value,
        parent: Option<EventId>,
        agent_id: Option<String>,
    ) -> EventId {
        let event_id = EventId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let event = TraceEvent {
            event_id: event_id.clone(),
            parent_event_id: parent,
            trace_id: self.trace_id.clone(),
            seq,
            event_type: event_type.into(),
            stage: stage.into(),
            agent_id,
            start_ts: Utc::now(),
            end_ts: None,
            attributes,
            error: None,
        };

        self.events
            .lock()
            .expect("trace recorder lock poisoned")
            .push(event);

        let mut root = self.root_event_id.lock().expect("trace recorder lock poisoned");
        if root.is_none() {
            *root = Some(event_id.clone());
        }

        event_id
    }

    /// Close an event, optionally merging in additional attributes and an
    /// error message.
    pub fn end_event(
        &self,
        event_id: &EventId,
        attributes: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut events = self.events.lock().expect("trace recorder lock poisoned");
        if let Some(event) = events.iter_mut().find(|e| &e.event_id == event_id) {
            event.end_ts = Some(Utc::now());
            if let Some(extra) = attributes {
                merge_attributes(&mut event.attributes, extra);
            }
            if error.is_some() {
                event.error = error;
            }
        }
    }

    /// Annotate an in-flight (or already-closed) event with a single key/value.
    pub fn note(&self, event_id: &EventId, key: &str, value: serde_json::Value) {
        let mut events = self.events.lock().expect("trace recorder lock poisoned");
        if let Some(event) = events.iter_mut().find(|e| &e.event_id == event_id) {
            merge_attributes(&mut event.attributes, serde_json::json!({ key: value }));
        }
    }

    /// Flush to the persistent trace store and produce the JSON document.
    /// Persistence failures are logged as `TRACE_PERSIST_FAILED` and
    /// swallowed — this always returns a document.
    pub async fn finalize(&self, store: &dyn TraceStore) -> TraceDocument {
        let events = self.events.lock().expect("trace recorder lock poisoned").clone();
        let root_event_id = self.root_event_id.lock().expect("trace recorder lock poisoned").clone();

        let summary = summarize(&events);
        let document = TraceDocument {
            trace_id: self.trace_id.clone(),
            root_event_id,
            events,
            created_at: self.created_at,
            finalized_at: Utc::now(),
            summary,
        };

        if let Err(err) = store.persist(&document).await {
            let failure = CoreError::trace_persist_failed(err.to_string());
            log::error!(
                "trace {} failed to persist: {}",
                self.trace_id,
                failure.message()
            );
        }

        document
    }
}

fn merge_attributes(into: &mut serde_json::Value, extra: serde_json::Value) {
    if !into.is_object() {
        *into = serde_json::json!({});
    }
    if let (Some(into_map), serde_json::Value::Object(extra_map)) = (into.as_object_mut(), extra) {
        for (k, v) in extra_map {
            into_map.insert(k, v);
        }
    }
}

fn summarize(events: &[TraceEvent]) -> TraceSummary {
    let mut summary = TraceSummary::default();
    for event in events {
        let elapsed_ms = event
            .end_ts
            .map(|end| (end - event.start_ts).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        summary.total_ms += elapsed_ms;

        let is_llm_call = event.event_type == "llm_call";
        let is_tool_call = event.event_type == "tool_call";
        if is_llm_call {
            summary.llm_calls += 1;
        }
        if is_tool_call {
            summary.tool_calls += 1;
        }

        if let Some(agent_id) = &event.agent_id {
            let agent_summary = summary.by_agent.entry(agent_id.clone()).or_default();
            agent_summary.total_ms += elapsed_ms;
            if is_llm_call {
                agent_summary.llm_calls += 1;
            }
            if is_tool_call {
                agent_summary.tool_calls += 1;
            }
        }
    }
    summary
}
