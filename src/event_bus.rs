//! Event Bus (L5).
//!
//! A single-producer (the Analyst Service), single-consumer (the transport)
//! ordered channel of [`LifecycleEvent`]s with bounded capacity and a
//! producer-side coalescing rule: a pending `progress_update` for a given
//! `agent_id` is replaced in place by a newer one rather than queued
//! alongside it, so a slow consumer never falls arbitrarily far behind on
//! fine-grained progress. Every other event kind is delivered in full and in
//! order.
//!
//! Grounded in the teacher's `mpsc`-channel event plumbing (`event.rs`,
//! `orchestration.rs`'s streaming quick-start), generalized with a custom
//! bounded queue since `tokio::sync::mpsc` has no way to reach in and replace
//! a still-queued item.

use crate::domain::{ComplexityClass, Priority, QueryId, SpecialtyTag, TaskId, TraceId};
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// One entry of `team_assembled.specialists`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub task_id: TaskId,
    pub specialty: SpecialtyTag,
    pub priority: Priority,
    pub max_tool_calls: u32,
}

/// The closed set of lifecycle event kinds (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LifecycleEvent {
    QueryReceived {
        query_id: QueryId,
        text: String,
    },
    CmoAnalysisStarted {
        agent_id: String,
    },
    CmoAnalysisComplete {
        complexity: ComplexityClass,
        initial_data_points: Vec<String>,
    },
    TeamAssembled {
        specialists: Vec<TeamMember>,
    },
    SpecialistStarted {
        task_id: TaskId,
        specialty: SpecialtyTag,
    },
    ProgressUpdate {
        agent_id: String,
        progress: f32,
        overall: f32,
        status: String,
    },
    SpecialistCompleted {
        task_id: TaskId,
        status: String,
        confidence: f32,
        tool_calls_used: u32,
    },
    SynthesisStarted,
    SynthesisComplete {
        narrative: String,
    },
    VizChunk {
        delta: String,
    },
    VizDone {
        media_type: Option<String>,
    },
    VizFailed {
        error_kind: ErrorKind,
    },
    Final {
        trace_id: TraceId,
        synthesis_digest: String,
    },
    Failed {
        error_kind: ErrorKind,
        message: String,
    },
}

impl LifecycleEvent {
    /// True for the two event kinds that end a `run` (§8 invariant 1).
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::Final { .. } | LifecycleEvent::Failed { .. })
    }

    fn coalesce_key(&self) -> Option<&str> {
        match self {
            LifecycleEvent::ProgressUpdate { agent_id, .. } => Some(agent_id.as_str()),
            _ => None,
        }
    }
}

/// An event as delivered on the bus: its assigned sequence number, wall
/// clock timestamp, and payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEnvelope {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: LifecycleEvent,
}

struct EventBusState {
    queue: VecDeque<LifecycleEnvelope>,
    closed: bool,
}

/// Bounded, ordered, coalescing channel of [`LifecycleEvent`]s for one query.
pub struct EventBus {
    capacity: usize,
    state: Mutex<EventBusState>,
    item_ready: Notify,
    space_available: Notify,
    next_seq: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            capacity: capacity.max(1),
            state: Mutex::new(EventBusState {
                queue: VecDeque::new(),
                closed: false,
            }),
            item_ready: Notify::new(),
            space_available: Notify::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Publish an event, coalescing it with a still-pending `progress_update`
    /// for the same agent if one exists. Blocks while the bus is at capacity
    /// and the event does not coalesce. Returns the event's assigned `seq`.
    pub async fn publish(&self, event: LifecycleEvent) -> u64 {
        if let Some(key) = event.coalesce_key() {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            if let Some(pos) = state
                .queue
                .iter()
                .position(|e| e.event.coalesce_key() == Some(key))
            {
                state.queue.remove(pos);
            }
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            state.queue.push_back(LifecycleEnvelope {
                seq,
                ts: Utc::now(),
                event,
            });
            drop(state);
            self.item_ready.notify_one();
            return seq;
        }

        loop {
            {
                let mut state = self.state.lock().expect("event bus lock poisoned");
                if state.queue.len() < self.capacity || state.closed {
                    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                    state.queue.push_back(LifecycleEnvelope {
                        seq,
                        ts: Utc::now(),
                        event,
                    });
                    drop(state);
                    self.item_ready.notify_one();
                    return seq;
                }
            }
            self.space_available.notified().await;
        }
    }

    /// Receive the next event in order, or `None` once the bus is closed and
    /// drained.
    pub async fn recv(&self) -> Option<LifecycleEnvelope> {
        loop {
            {
                let mut state = self.state.lock().expect("event bus lock poisoned");
                if let Some(envelope) = state.queue.pop_front() {
                    drop(state);
                    self.space_available.notify_one();
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Mark the bus closed. Pending events already queued are still
    /// delivered by `recv`; once drained, `recv` returns `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.closed = true;
        drop(state);
        self.item_ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let bus = EventBus::new(8);
        bus.publish(LifecycleEvent::QueryReceived {
            query_id: QueryId::new(),
            text: "hi".into(),
        })
        .await;
        bus.publish(LifecycleEvent::SynthesisStarted).await;
        bus.close();

        let first = bus.recv().await.unwrap();
        let second = bus.recv().await.unwrap();
        assert!(second.seq > first.seq);
        assert!(bus.recv().await.is_none());
    }

    #[tokio::test]
    async fn successive_progress_updates_for_same_agent_coalesce() {
        let bus = EventBus::new(8);
        bus.publish(LifecycleEvent::ProgressUpdate {
            agent_id: "cardiology".into(),
            progress: 0.2,
            overall: 0.1,
            status: "running".into(),
        })
        .await;
        bus.publish(LifecycleEvent::ProgressUpdate {
            agent_id: "cardiology".into(),
            progress: 0.8,
            overall: 0.4,
            status: "running".into(),
        })
        .await;
        bus.close();

        let only = bus.recv().await.unwrap();
        match only.event {
            LifecycleEvent::ProgressUpdate { progress, .. } => assert_eq!(progress, 0.8),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bus.recv().await.is_none());
    }

    #[tokio::test]
    async fn progress_updates_for_different_agents_do_not_coalesce() {
        let bus = EventBus::new(8);
        bus.publish(LifecycleEvent::ProgressUpdate {
            agent_id: "cardiology".into(),
            progress: 0.2,
            overall: 0.1,
            status: "running".into(),
        })
        .await;
        bus.publish(LifecycleEvent::ProgressUpdate {
            agent_id: "pharmacy".into(),
            progress: 0.2,
            overall: 0.1,
            status: "running".into(),
        })
        .await;
        bus.close();

        assert!(bus.recv().await.is_some());
        assert!(bus.recv().await.is_some());
        assert!(bus.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_event_is_delivered_exactly_once() {
        let bus = EventBus::new(8);
        bus.publish(LifecycleEvent::Final {
            trace_id: TraceId::new(),
            synthesis_digest: "ok".into(),
        })
        .await;
        bus.close();

        let event = bus.recv().await.unwrap();
        assert!(event.event.is_terminal());
        assert!(bus.recv().await.is_none());
    }
}
