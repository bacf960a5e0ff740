//! Visualization Generator (M4).
//!
//! One LLM call, no tools, that turns a finished `Synthesis` into a
//! self-contained rendering artifact (a markdown report, an embedded SVG, or
//! a Mermaid diagram, identified by `media_type`). Streams its text deltas
//! out as `viz_chunk` events as they arrive and always ends with either
//! `viz_done` or `viz_failed` — never both, never neither. Failure here is
//! non-fatal to the query: the caller degrades to `final` with no
//! visualization rather than failing the whole run (§7).
//!
//! Grounded in the teacher's streaming quick-start
//! (`ClientWrapper::send_message_stream` consumed via `futures_util::StreamExt`)
//! — the same text-delta consumption loop `specialist.rs`'s single-shot
//! phases use, minus any tool-use branch since this call never offers tools.

use crate::client_wrapper::{CompletionBudget, CompletionChunk, LlmClient, Message};
use crate::config::Config;
use crate::domain::{EventId, Query, Synthesis, VisualizationArtifact};
use crate::error::ErrorKind;
use crate::event_bus::{EventBus, LifecycleEvent};
use crate::prompt_loader::PromptCatalog;
use crate::trace::TraceRecorder;
use futures_util::StreamExt;
use std::collections::HashMap;

/// Generate a visualization for `synthesis`, or `None` if
/// `config.visualization_enabled` is `false` or generation failed. Either
/// way the caller's overall query still reaches `final`.
pub async fn generate(
    query: &Query,
    synthesis: &Synthesis,
    client: &dyn LlmClient,
    prompts: &PromptCatalog,
    config: &Config,
    event_bus: &EventBus,
    trace: &TraceRecorder,
    trace_parent: Option<EventId>,
) -> Option<VisualizationArtifact> {
    if !config.visualization_enabled {
        return None;
    }

    let system_prompt = match prompts.render("visualization", "system", &HashMap::new()) {
        Ok(text) => text,
        Err(_) => {
            fail(event_bus, ErrorKind::PromptRenderError).await;
            return None;
        }
    };

    let mut vars = HashMap::new();
    vars.insert("query_text", query.text.clone());
    vars.insert("narrative", synthesis.narrative.clone());
    vars.insert("key_points", synthesis.key_points.join("; "));
    vars.insert("unresolved_concerns", synthesis.unresolved_concerns.join("; "));
    let task_prompt = match prompts.render("visualization", "generate", &vars) {
        Ok(text) => text,
        Err(_) => {
            fail(event_bus, ErrorKind::PromptRenderError).await;
            return None;
        }
    };

    let trace_event = trace.start_event(
        "visualization",
        "running",
        serde_json::json!({"query_id": query.query_id.0}),
        trace_parent,
        None,
    );

    let messages = vec![Message::user(task_prompt)];
    let completion = tokio::time::timeout(
        config.per_llm_call_timeout,
        client.complete(&messages, None, Some(&system_prompt), CompletionBudget::default()),
    )
    .await;

    let mut stream = match completion {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            trace.end_event(&trace_event, None, Some(err.to_string()));
            fail(event_bus, ErrorKind::ProviderError).await;
            return None;
        }
        Err(_elapsed) => {
            trace.end_event(&trace_event, None, Some("LLM call exceeded its per-call deadline".to_string()));
            fail(event_bus, ErrorKind::Timeout).await;
            return None;
        }
    };

    let mut body = String::new();
    loop {
        let next = tokio::time::timeout(config.per_llm_call_timeout, stream.next()).await;
        let next = match next {
            Ok(next) => next,
            Err(_elapsed) => {
                trace.end_event(&trace_event, None, Some("LLM call exceeded its per-call deadline".to_string()));
                fail(event_bus, ErrorKind::Timeout).await;
                return None;
            }
        };
        match next {
            Some(Ok(CompletionChunk::TextDelta(delta))) => {
                event_bus
                    .publish(LifecycleEvent::VizChunk { delta: delta.clone() })
                    .await;
                body.push_str(&delta);
            }
            Some(Ok(CompletionChunk::ToolUse(_))) => {
                // The visualization prompt never offers tools; a model that
                // asks anyway is ignored rather than treated as failure.
            }
            Some(Ok(CompletionChunk::Terminal { .. })) => break,
            Some(Err(err)) => {
                trace.end_event(&trace_event, None, Some(err.to_string()));
                fail(event_bus, ErrorKind::ProviderError).await;
                return None;
            }
            None => break,
        }
    }

    if body.trim().is_empty() {
        trace.end_event(
            &trace_event,
            None,
            Some("model produced an empty visualization body".to_string()),
        );
        fail(event_bus, ErrorKind::VizFailed).await;
        return None;
    }

    let media_type = detect_media_type(&body);
    trace.end_event(
        &trace_event,
        Some(serde_json::json!({"media_type": media_type})),
        None,
    );
    event_bus
        .publish(LifecycleEvent::VizDone {
            media_type: Some(media_type.clone()),
        })
        .await;

    Some(VisualizationArtifact::new(media_type, body))
}

async fn fail(event_bus: &EventBus, error_kind: ErrorKind) {
    event_bus
        .publish(LifecycleEvent::VizFailed { error_kind })
        .await;
}

/// Infer a media type from the shape of the model's output, defaulting to
/// markdown for free-form prose.
fn detect_media_type(body: &str) -> String {
    let trimmed = body.trim_start();
    if trimmed.starts_with("<svg") || trimmed.starts_with("<?xml") {
        "image/svg+xml".to_string()
    } else if trimmed.starts_with("```mermaid") || trimmed.starts_with("graph ") || trimmed.starts_with("flowchart ") {
        "text/vnd.mermaid".to_string()
    } else {
        "text/markdown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::domain::{QueryId, TraceId};

    fn catalog() -> PromptCatalog {
        PromptCatalog::new()
            .with_template("visualization", "system", "You generate a visualization.")
            .with_template(
                "visualization",
                "generate",
                "Narrative: {narrative}\nKey points: {key_points}\nConcerns: {unresolved_concerns}",
            )
    }

    fn synthesis() -> Synthesis {
        Synthesis {
            query_id: QueryId::new(),
            narrative: "Cholesterol trending down.".to_string(),
            key_points: vec!["LDL down 20%".to_string()],
            unresolved_concerns: vec![],
        }
    }

    #[tokio::test]
    async fn disabled_config_skips_generation_entirely() {
        let client = MockClient::new();
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(TraceId::new());
        let mut config = Config::default();
        config.visualization_enabled = false;

        let artifact = generate(
            &Query::new("q"),
            &synthesis(),
            &client,
            &prompts,
            &config,
            &bus,
            &trace,
            None,
        )
        .await;

        assert!(artifact.is_none());
        bus.close();
        assert!(bus.recv().await.is_none());
    }

    #[tokio::test]
    async fn successful_generation_streams_chunks_then_emits_done() {
        let client = MockClient::new().with_text_response("# Report\n\nLDL trending down.");
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(TraceId::new());
        let config = Config::default();

        let artifact = generate(
            &Query::new("q"),
            &synthesis(),
            &client,
            &prompts,
            &config,
            &bus,
            &trace,
            None,
        )
        .await;

        assert!(artifact.is_some());
        assert_eq!(artifact.unwrap().media_type, "text/markdown");
        bus.close();

        let mut saw_chunk = false;
        let mut saw_done = false;
        while let Some(envelope) = bus.recv().await {
            match envelope.event {
                LifecycleEvent::VizChunk { .. } => saw_chunk = true,
                LifecycleEvent::VizDone { .. } => saw_done = true,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(saw_chunk && saw_done);
    }

    #[tokio::test]
    async fn a_hung_generation_call_fails_without_panicking() {
        let client = MockClient::new()
            .with_delay(std::time::Duration::from_millis(50))
            .with_text_response("# Report\n\nLDL trending down.");
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(TraceId::new());
        let mut config = Config::default();
        config.per_llm_call_timeout = std::time::Duration::from_millis(1);

        let artifact = generate(
            &Query::new("q"),
            &synthesis(),
            &client,
            &prompts,
            &config,
            &bus,
            &trace,
            None,
        )
        .await;

        assert!(artifact.is_none());
        bus.close();
        let mut saw_failed = false;
        while let Some(envelope) = bus.recv().await {
            if matches!(envelope.event, LifecycleEvent::VizFailed { error_kind } if error_kind == ErrorKind::Timeout) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn empty_model_output_fails_without_panicking() {
        let client = MockClient::new().with_text_response("");
        let prompts = catalog();
        let bus = EventBus::new(8);
        let trace = TraceRecorder::new(TraceId::new());
        let config = Config::default();

        let artifact = generate(
            &Query::new("q"),
            &synthesis(),
            &client,
            &prompts,
            &config,
            &bus,
            &trace,
            None,
        )
        .await;

        assert!(artifact.is_none());
    }
}
