//! End-to-end coverage of the Analyst Service against a scripted `MockClient`:
//! the six seed scenarios and the boundary behaviors they're meant to exercise.

use health_insight_orchestrator::analyst_service::{AnalystService, Dependencies};
use health_insight_orchestrator::clients::MockClient;
use health_insight_orchestrator::config::Config;
use health_insight_orchestrator::domain::{ComplexityClass, Query, SpecialtyTag};
use health_insight_orchestrator::event_bus::{EventBus, LifecycleEnvelope, LifecycleEvent};
use health_insight_orchestrator::prompt_loader::PromptCatalog;
use health_insight_orchestrator::tool_protocol::ToolRegistry;
use health_insight_orchestrator::tools::HealthDataTool;
use std::sync::Arc;
use std::time::Duration;

fn catalog() -> PromptCatalog {
    let mut catalog = PromptCatalog::new()
        .with_template("cmo", "system", "You coordinate a specialist team.")
        .with_template("cmo", "analyze", "Query: {query_text}")
        .with_template(
            "cmo",
            "assemble",
            "Query: {query_text}\nComplexity: {complexity}\nApproach: {approach_summary}",
        )
        .with_template("cmo", "assemble_repair", "Fix this: {reason}")
        .with_template(
            "cmo",
            "synthesize",
            "Query: {query_text}\nResults: {results_summary}",
        )
        .with_template("visualization", "system", "You generate a visualization.")
        .with_template(
            "visualization",
            "generate",
            "Narrative: {narrative}\nKey points: {key_points}\nConcerns: {unresolved_concerns}",
        );
    for specialty in SpecialtyTag::ALL {
        catalog = catalog
            .with_template(specialty.as_str(), "system", "You are a specialist.")
            .with_template(
                specialty.as_str(),
                "task",
                "Objective: {objective}\nContext: {context}\nExpected output: {expected_output}",
            );
    }
    catalog
}

fn deps_with(client: MockClient, config: Config) -> Dependencies {
    Dependencies::new(
        Arc::new(client),
        Arc::new(ToolRegistry::new()),
        Arc::new(catalog()),
        config,
    )
}

fn deps_with_tools(client: MockClient, config: Config) -> Dependencies {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(HealthDataTool::new().with_seed_fixtures()));
    Dependencies::new(Arc::new(client), Arc::new(tools), Arc::new(catalog()), config)
}

async fn drain(bus: &EventBus) -> Vec<LifecycleEnvelope> {
    let mut events = Vec::new();
    while let Some(envelope) = bus.recv().await {
        events.push(envelope);
    }
    events
}

fn analyze_response(complexity: &str) -> String {
    format!(
        r#"{{"complexity": "{complexity}", "approach_summary": "review", "initial_data_points": [], "cmo_reasoning": "ok"}}"#
    )
}

fn specialist_ok(confidence: f32) -> String {
    format!(
        r#"{{"findings": ["stable"], "recommendations": ["keep it up"], "concerns": [], "confidence": {confidence}}}"#
    )
}

fn final_event(events: &[LifecycleEnvelope]) -> &LifecycleEvent {
    let finals: Vec<_> = events.iter().filter(|e| e.event.is_terminal()).collect();
    assert_eq!(finals.len(), 1, "expected exactly one terminal event, got {:?}", finals);
    &finals[0].event
}

// ---------------------------------------------------------------------
// Universal invariants (§8)
// ---------------------------------------------------------------------

#[tokio::test]
async fn seq_strictly_increases_and_nothing_follows_the_terminal_event() {
    let client = MockClient::new()
        .with_text_response(analyze_response("SIMPLE"))
        .with_text_response(
            r#"{"tasks": [{"specialty": "general_practice", "objective": "check", "context": "", "expected_output": "summary", "priority": "MEDIUM"}]}"#,
        )
        .with_text_response(specialist_ok(0.8))
        .with_text_response(r#"{"narrative": "All good.", "key_points": ["stable"]}"#)
        .with_text_response("# Report\n\nAll good.");

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
    let terminal_pos = events.iter().position(|e| e.event.is_terminal()).unwrap();
    assert_eq!(terminal_pos, events.len() - 1, "a terminal event must be last");
}

#[tokio::test]
async fn tool_calls_used_never_exceeds_the_assigned_budget() {
    let client = MockClient::new()
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "data_analysis", "objective": "check trend", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_tool_use("query_health_record", serde_json::json!({"query": "hba1c"}))
        .with_text_response(specialist_ok(0.7))
        .with_text_response(specialist_ok(0.6))
        .with_text_response(specialist_ok(0.9))
        .with_text_response(r#"{"narrative": "Looking stable.", "key_points": []}"#)
        .with_text_response("# Report");

    let service = AnalystService::new(deps_with_tools(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("how is my heart and trend?"));
    let events = drain(&bus).await;

    for event in &events {
        if let LifecycleEvent::SpecialistCompleted { tool_calls_used, .. } = &event.event {
            assert!(*tool_calls_used <= 3, "STANDARD complexity budget is 3 calls");
        }
    }
    assert!(matches!(final_event(&events), LifecycleEvent::Final { .. }));
}

#[tokio::test]
async fn assembled_team_size_stays_within_complexity_bounds() {
    let client = MockClient::new()
        .with_text_response(analyze_response("COMPLEX"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "endocrinology", "objective": "check glucose", "context": "", "expected_output": "summary", "priority": "HIGH"},
                {"specialty": "pharmacy", "objective": "review meds", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "laboratory_medicine", "objective": "check labs", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_text_response(specialist_ok(0.7))
        .with_text_response(specialist_ok(0.6))
        .with_text_response(specialist_ok(0.9))
        .with_text_response(r#"{"narrative": "Metabolic picture is mixed.", "key_points": []}"#)
        .with_text_response("# Report");

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("how is my metabolic health?"));
    let events = drain(&bus).await;

    let team = events.iter().find_map(|e| match &e.event {
        LifecycleEvent::TeamAssembled { specialists } => Some(specialists.clone()),
        _ => None,
    });
    let team = team.expect("team_assembled event must be present");
    let (min, max) = ComplexityClass::Complex.team_size_bounds();
    assert!(team.len() >= min && team.len() <= max);
}

#[tokio::test]
async fn specialist_started_precedes_its_own_cancelled_completion() {
    let client = MockClient::new()
        .with_delay(Duration::from_millis(30))
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        );

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, cancel) = service.run(Query::new("how am I doing?"));

    let mut events = Vec::new();
    loop {
        match bus.recv().await {
            Some(envelope) => {
                let is_team_assembled = matches!(envelope.event, LifecycleEvent::TeamAssembled { .. });
                events.push(envelope);
                if is_team_assembled {
                    let _ = cancel.send(true);
                }
            }
            None => break,
        }
    }

    for specialty in [SpecialtyTag::Cardiology, SpecialtyTag::GeneralPractice] {
        let started = events.iter().position(|e| {
            matches!(&e.event, LifecycleEvent::SpecialistStarted { specialty: s, .. } if *s == specialty)
        });
        let completed = events.iter().position(|e| matches!(&e.event, LifecycleEvent::SpecialistCompleted { status, .. } if status == "CANCELLED"));
        if let (Some(s), Some(c)) = (started, completed) {
            assert!(s < c, "specialist_started must precede specialist_completed{{CANCELLED}}");
        }
    }
    assert!(matches!(final_event(&events), LifecycleEvent::Failed { .. }));
}

#[tokio::test]
async fn synthesis_is_deterministic_across_identical_replays() {
    let build = || {
        MockClient::new()
            .with_text_response(analyze_response("SIMPLE"))
            .with_text_response(
                r#"{"tasks": [{"specialty": "general_practice", "objective": "check", "context": "", "expected_output": "summary", "priority": "MEDIUM"}]}"#,
            )
            .with_text_response(specialist_ok(0.8))
            .with_text_response(r#"{"narrative": "All good. Keep going.", "key_points": ["stable"]}"#)
            .with_text_response("# Report\n\nAll good.")
    };

    let mut digests = Vec::new();
    for _ in 0..2 {
        let service = AnalystService::new(deps_with(build(), Config::default()));
        let (bus, _cancel) = service.run(Query::new("how am I doing?"));
        let events = drain(&bus).await;
        if let LifecycleEvent::Final { synthesis_digest, .. } = final_event(&events) {
            digests.push(synthesis_digest.clone());
        } else {
            panic!("expected a final event");
        }
    }
    assert_eq!(digests[0], digests[1]);
}

// ---------------------------------------------------------------------
// Boundary behaviors (§8)
// ---------------------------------------------------------------------

#[tokio::test]
async fn zero_specialists_assembled_fails_team_assembly() {
    let client = MockClient::new()
        .with_text_response(analyze_response("SIMPLE"))
        .with_text_response(r#"{"tasks": []}"#)
        .with_text_response(r#"{"tasks": []}"#);

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    match final_event(&events) {
        LifecycleEvent::Failed { error_kind, .. } => {
            assert_eq!(*error_kind, health_insight_orchestrator::ErrorKind::TeamAssemblyInvalid);
        }
        other => panic!("expected a team-assembly failure, got {:?}", other),
    }
}

#[tokio::test]
async fn one_specialist_timing_out_does_not_block_synthesis() {
    let client = MockClient::new()
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_delayed_text_response(Duration::from_millis(200), specialist_ok(0.9))
        .with_text_response(specialist_ok(0.8))
        .with_text_response(r#"{"narrative": "Mostly good, one area unclear.", "key_points": []}"#)
        .with_text_response("# Report");

    let mut config = Config::default();
    config.per_task_timeout = Duration::from_millis(20);
    config.llm_provider_retries = 0;

    let service = AnalystService::new(deps_with(client, config));
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    let mut saw_timeout = false;
    let mut saw_complete = false;
    for event in &events {
        if let LifecycleEvent::SpecialistCompleted { status, confidence, .. } = &event.event {
            match status.as_str() {
                "TIMEOUT" => {
                    saw_timeout = true;
                    assert!(*confidence <= 0.3);
                }
                "COMPLETE" => saw_complete = true,
                _ => {}
            }
        }
    }
    assert!(saw_timeout && saw_complete);
    assert!(matches!(final_event(&events), LifecycleEvent::Final { .. }));
}

#[tokio::test]
async fn every_specialist_failing_fails_the_query_with_no_specialist_succeeded() {
    let client = MockClient::new()
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_text_response("not json at all")
        .with_text_response("still not json")
        .with_text_response("not json either")
        .with_text_response("nope still not json");

    let mut config = Config::default();
    config.llm_provider_retries = 0;
    let service = AnalystService::new(deps_with(client, config));
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    match final_event(&events) {
        LifecycleEvent::Failed { error_kind, .. } => {
            assert_eq!(*error_kind, health_insight_orchestrator::ErrorKind::NoSpecialistSucceeded);
        }
        other => panic!("expected no_specialist_succeeded, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e.event, LifecycleEvent::SynthesisStarted)));
}

#[tokio::test]
async fn disabled_visualization_skips_viz_events_but_still_populates_the_digest() {
    let client = MockClient::new()
        .with_text_response(analyze_response("SIMPLE"))
        .with_text_response(
            r#"{"tasks": [{"specialty": "general_practice", "objective": "check", "context": "", "expected_output": "summary", "priority": "MEDIUM"}]}"#,
        )
        .with_text_response(specialist_ok(0.8))
        .with_text_response(r#"{"narrative": "All good. Keep going.", "key_points": ["stable"]}"#);

    let mut config = Config::default();
    config.visualization_enabled = false;
    let service = AnalystService::new(deps_with(client, config));
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    assert!(!events.iter().any(|e| matches!(
        e.event,
        LifecycleEvent::VizChunk { .. } | LifecycleEvent::VizDone { .. } | LifecycleEvent::VizFailed { .. }
    )));
    match final_event(&events) {
        LifecycleEvent::Final { synthesis_digest, .. } => assert!(!synthesis_digest.is_empty()),
        other => panic!("expected final, got {:?}", other),
    }
}

// ---------------------------------------------------------------------
// Seed end-to-end scenarios (§8)
// ---------------------------------------------------------------------

#[tokio::test]
async fn scenario_simple_lookup_uses_a_two_person_team() {
    let client = MockClient::new()
        .with_text_response(analyze_response("SIMPLE"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "laboratory_medicine", "objective": "read hba1c", "context": "", "expected_output": "latest value", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "interpret result", "context": "", "expected_output": "plain summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_tool_use("query_health_record", serde_json::json!({"query": "hba1c"}))
        .with_text_response(specialist_ok(0.9))
        .with_text_response(specialist_ok(0.85))
        .with_text_response(r#"{"narrative": "Your HbA1c looks fine.", "key_points": ["6.1%"]}"#)
        .with_text_response("# Report\n\nHbA1c is 6.1%.");

    let service = AnalystService::new(deps_with_tools(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("what's my latest hba1c?"));
    let events = drain(&bus).await;

    let complexity = events.iter().find_map(|e| match &e.event {
        LifecycleEvent::CmoAnalysisComplete { complexity, .. } => Some(*complexity),
        _ => None,
    });
    assert_eq!(complexity, Some(ComplexityClass::Simple));
    assert!(matches!(final_event(&events), LifecycleEvent::Final { .. }));
}

#[tokio::test]
async fn scenario_standard_trend_emits_viz_chunks_before_viz_done() {
    let client = MockClient::new()
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "assess lipid trend", "context": "", "expected_output": "trend direction", "priority": "MEDIUM"},
                {"specialty": "data_analysis", "objective": "quantify change", "context": "", "expected_output": "percent change", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "LOW"}
            ]}"#,
        )
        .with_text_response(specialist_ok(0.8))
        .with_text_response(specialist_ok(0.75))
        .with_text_response(specialist_ok(0.9))
        .with_text_response(r#"{"narrative": "Cholesterol is trending down.", "key_points": ["LDL down 20%"]}"#)
        .with_text_response("# Trend\n\nLDL is trending down 20% over three readings.");

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("how has my cholesterol trended?"));
    let events = drain(&bus).await;

    let chunk_pos = events.iter().position(|e| matches!(e.event, LifecycleEvent::VizChunk { .. }));
    let done_pos = events.iter().position(|e| matches!(e.event, LifecycleEvent::VizDone { .. }));
    assert!(chunk_pos.is_some() && done_pos.is_some());
    assert!(chunk_pos.unwrap() < done_pos.unwrap());

    if let LifecycleEvent::Final { synthesis_digest, .. } = final_event(&events) {
        assert!(synthesis_digest.to_lowercase().contains("trend"));
    } else {
        panic!("expected final event");
    }
}

#[tokio::test]
async fn scenario_complex_correlation_runs_every_specialist_before_synthesis() {
    let client = MockClient::new()
        .with_text_response(analyze_response("COMPLEX"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "endocrinology", "objective": "assess glucose control", "context": "", "expected_output": "summary", "priority": "HIGH"},
                {"specialty": "pharmacy", "objective": "review medication interaction", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "laboratory_medicine", "objective": "correlate labs", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_text_response(specialist_ok(0.7))
        .with_text_response(specialist_ok(0.6))
        .with_text_response(specialist_ok(0.8))
        .with_text_response(r#"{"narrative": "Metformin dosage correlates with the observed glucose dip.", "key_points": []}"#)
        .with_text_response("# Report");

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, _cancel) = service.run(Query::new("does my medication explain my glucose trend?"));
    let events = drain(&bus).await;

    let synthesis_started = events
        .iter()
        .position(|e| matches!(e.event, LifecycleEvent::SynthesisStarted))
        .expect("synthesis_started must occur for a successful run");
    let completions_before = events[..synthesis_started]
        .iter()
        .filter(|e| matches!(&e.event, LifecycleEvent::SpecialistCompleted { status, .. } if status == "COMPLETE"))
        .count();
    assert!(completions_before >= 3);
}

#[tokio::test]
async fn scenario_all_specialists_fail_still_persists_a_trace() {
    use health_insight_orchestrator::trace::InMemoryTraceStore;

    let client = MockClient::new()
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_text_response("garbage")
        .with_text_response("garbage")
        .with_text_response("garbage")
        .with_text_response("garbage");

    let mut config = Config::default();
    config.llm_provider_retries = 0;
    let store = Arc::new(InMemoryTraceStore::new());
    let deps = deps_with(client, config).with_trace_store(store.clone());
    let service = AnalystService::new(deps);
    let (bus, _cancel) = service.run(Query::new("how am I doing?"));
    let events = drain(&bus).await;

    assert!(matches!(final_event(&events), LifecycleEvent::Failed { .. }));
    assert!(
        !store.documents().is_empty(),
        "a trace document must still be persisted on failure"
    );
}

#[tokio::test]
async fn scenario_cancellation_between_team_assembled_and_first_completion() {
    let client = MockClient::new()
        .with_delay(Duration::from_millis(30))
        .with_text_response(analyze_response("STANDARD"))
        .with_text_response(
            r#"{"tasks": [
                {"specialty": "cardiology", "objective": "check heart", "context": "", "expected_output": "summary", "priority": "MEDIUM"},
                {"specialty": "general_practice", "objective": "overview", "context": "", "expected_output": "summary", "priority": "MEDIUM"}
            ]}"#,
        )
        .with_text_response(specialist_ok(0.8))
        .with_text_response(specialist_ok(0.7));

    let service = AnalystService::new(deps_with(client, Config::default()));
    let (bus, cancel) = service.run(Query::new("how am I doing?"));

    let mut events = Vec::new();
    while let Some(envelope) = bus.recv().await {
        if matches!(envelope.event, LifecycleEvent::TeamAssembled { .. }) {
            let _ = cancel.send(true);
        }
        events.push(envelope);
    }

    let completed: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            LifecycleEvent::SpecialistCompleted { status, .. } => Some(status.clone()),
            _ => None,
        })
        .collect();
    assert!(!completed.is_empty());
    assert!(completed.iter().all(|status| status == "CANCELLED"));
    assert!(!events.iter().any(|e| matches!(e.event, LifecycleEvent::SynthesisStarted)));
    assert!(matches!(final_event(&events), LifecycleEvent::Failed { .. }));
}

