//! Core data model (§3): queries, tasks, results, and the synthesis they
//! produce. All opaque identifiers are UUID-backed newtypes rather than bare
//! `String`s so that a `TaskId` and a `QueryId` can never be swapped by
//! accident at a call site.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh, random identifier.
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

opaque_id!(QueryId);
opaque_id!(TaskId);
opaque_id!(EventId);
opaque_id!(TraceId);

/// Immutable record of the question asked, as received by the Analyst Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub query_id: QueryId,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            query_id: QueryId::new(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Coarse classification of a query's difficulty. Totally ordered:
/// `SIMPLE < STANDARD < COMPLEX < COMPREHENSIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplexityClass {
    Simple,
    Standard,
    Complex,
    Comprehensive,
}

impl ComplexityClass {
    pub const ALL: [ComplexityClass; 4] = [
        ComplexityClass::Simple,
        ComplexityClass::Standard,
        ComplexityClass::Complex,
        ComplexityClass::Comprehensive,
    ];

    /// Team-size bounds `(min, max)` from §4.M2's post-validator table.
    pub fn team_size_bounds(self) -> (usize, usize) {
        match self {
            ComplexityClass::Simple => (1, 2),
            ComplexityClass::Standard => (2, 3),
            ComplexityClass::Complex => (3, 5),
            ComplexityClass::Comprehensive => (4, 8),
        }
    }

    /// Default `max_tool_calls` assigned to every task of this complexity,
    /// per §4.M2 (overridable via `Config::specialist_tool_budget_by_complexity`).
    pub fn default_tool_budget(self) -> u32 {
        match self {
            ComplexityClass::Simple => 2,
            ComplexityClass::Standard => 3,
            ComplexityClass::Complex => 5,
            ComplexityClass::Comprehensive => 5,
        }
    }

    /// Tie-break rule from Phase A: when the model names two classes, pick
    /// the higher.
    pub fn higher(self, other: ComplexityClass) -> ComplexityClass {
        self.max(other)
    }
}

impl Default for ComplexityClass {
    /// §4.M2's tie-break default when the model omits a class.
    fn default() -> Self {
        ComplexityClass::Standard
    }
}

impl fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplexityClass::Simple => "SIMPLE",
            ComplexityClass::Standard => "STANDARD",
            ComplexityClass::Complex => "COMPLEX",
            ComplexityClass::Comprehensive => "COMPREHENSIVE",
        };
        write!(f, "{}", s)
    }
}

/// Closed set of specialist roles a task may be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialtyTag {
    GeneralPractice,
    Cardiology,
    Endocrinology,
    LaboratoryMedicine,
    Pharmacy,
    Nutrition,
    PreventiveMedicine,
    DataAnalysis,
}

impl SpecialtyTag {
    pub const ALL: [SpecialtyTag; 8] = [
        SpecialtyTag::GeneralPractice,
        SpecialtyTag::Cardiology,
        SpecialtyTag::Endocrinology,
        SpecialtyTag::LaboratoryMedicine,
        SpecialtyTag::Pharmacy,
        SpecialtyTag::Nutrition,
        SpecialtyTag::PreventiveMedicine,
        SpecialtyTag::DataAnalysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialtyTag::GeneralPractice => "general_practice",
            SpecialtyTag::Cardiology => "cardiology",
            SpecialtyTag::Endocrinology => "endocrinology",
            SpecialtyTag::LaboratoryMedicine => "laboratory_medicine",
            SpecialtyTag::Pharmacy => "pharmacy",
            SpecialtyTag::Nutrition => "nutrition",
            SpecialtyTag::PreventiveMedicine => "preventive_medicine",
            SpecialtyTag::DataAnalysis => "data_analysis",
        }
    }

    pub fn from_str(s: &str) -> Option<SpecialtyTag> {
        SpecialtyTag::ALL.into_iter().find(|tag| tag.as_str() == s)
    }
}

impl fmt::Display for SpecialtyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Produced once per query by the CMO's Analyze phase; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialAnalysis {
    pub complexity: ComplexityClass,
    pub approach_summary: String,
    pub initial_data_points: Vec<String>,
    pub cmo_reasoning: String,
}

/// Dispatch priority for a `SpecialistTask`. Ordered `High > Medium > Low`
/// for the Scheduler's priority queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A unit of work created by the CMO during Phase B. Immutable after
/// creation; built with the `with_*` convention so optional fields read
/// naturally at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistTask {
    pub task_id: TaskId,
    pub query_id: QueryId,
    pub specialty: SpecialtyTag,
    pub objective: String,
    pub context: String,
    pub expected_output: String,
    pub priority: Priority,
    pub max_tool_calls: u32,
}

impl SpecialistTask {
    pub fn new(
        query_id: QueryId,
        specialty: SpecialtyTag,
        objective: impl Into<String>,
        expected_output: impl Into<String>,
        max_tool_calls: u32,
    ) -> Self {
        SpecialistTask {
            task_id: TaskId::new(),
            query_id,
            specialty,
            objective: objective.into(),
            context: String::new(),
            expected_output: expected_output.into(),
            priority: Priority::Medium,
            max_tool_calls,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Terminal state of a dispatched `SpecialistTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecialistStatus {
    Complete,
    Failed,
    Timeout,
    BudgetExhausted,
    Cancelled,
}

impl fmt::Display for SpecialistStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpecialistStatus::Complete => "COMPLETE",
            SpecialistStatus::Failed => "FAILED",
            SpecialistStatus::Timeout => "TIMEOUT",
            SpecialistStatus::BudgetExhausted => "BUDGET_EXHAUSTED",
            SpecialistStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Exactly one per dispatched task (§3 invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistResult {
    pub task_id: TaskId,
    pub specialty: SpecialtyTag,
    pub status: SpecialistStatus,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub concerns: Vec<String>,
    pub confidence: f32,
    pub tool_calls_used: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    /// Classification of `error`, when present — lets the Scheduler decide
    /// whether a failed task is eligible for its one transient-error retry
    /// (§4.M3) without re-parsing `error`'s free-text message.
    pub error_kind: Option<ErrorKind>,
}

impl SpecialistResult {
    /// Clamp confidence to the crate's `[0,1]` invariant, additionally
    /// enforcing the `<= 0.3` ceiling §4.M1/§8 impose on timed-out and
    /// budget-exhausted results.
    pub fn clamp_confidence(&mut self) {
        let ceiling = match self.status {
            SpecialistStatus::Timeout | SpecialistStatus::BudgetExhausted => 0.3,
            _ => 1.0,
        };
        self.confidence = self.confidence.clamp(0.0, ceiling);
    }
}

/// Produced iff at least one `SpecialistResult` has status `Complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub query_id: QueryId,
    pub narrative: String,
    pub key_points: Vec<String>,
    pub unresolved_concerns: Vec<String>,
}

impl Synthesis {
    /// A short, stable digest suitable for the `final` lifecycle event's
    /// `synthesis_digest` field — the narrative's first sentence, or the
    /// whole narrative if it has none.
    pub fn digest(&self) -> String {
        self.narrative
            .split(['.', '\n'])
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or(&self.narrative)
            .to_string()
    }
}

/// Opaque, self-contained rendering artifact. The core never interprets the
/// body; it only carries a declared media type and a finished/failed flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationArtifact {
    pub media_type: String,
    pub body: String,
}

impl VisualizationArtifact {
    pub fn new(media_type: impl Into<String>, body: impl Into<String>) -> Self {
        VisualizationArtifact {
            media_type: media_type.into(),
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_is_totally_ordered() {
        assert!(ComplexityClass::Simple < ComplexityClass::Standard);
        assert!(ComplexityClass::Standard < ComplexityClass::Complex);
        assert!(ComplexityClass::Complex < ComplexityClass::Comprehensive);
    }

    #[test]
    fn higher_tie_break_picks_max() {
        assert_eq!(
            ComplexityClass::Simple.higher(ComplexityClass::Complex),
            ComplexityClass::Complex
        );
    }

    #[test]
    fn specialty_round_trips_through_str() {
        for tag in SpecialtyTag::ALL {
            assert_eq!(SpecialtyTag::from_str(tag.as_str()), Some(tag));
        }
    }

    #[test]
    fn confidence_clamped_for_timeout() {
        let mut result = SpecialistResult {
            task_id: TaskId::new(),
            specialty: SpecialtyTag::Cardiology,
            status: SpecialistStatus::Timeout,
            findings: vec![],
            recommendations: vec![],
            concerns: vec![],
            confidence: 0.9,
            tool_calls_used: 1,
            elapsed_ms: 100,
            error: None,
            error_kind: None,
        };
        result.clamp_confidence();
        assert!(result.confidence <= 0.3);
    }

    #[test]
    fn digest_takes_first_sentence() {
        let synthesis = Synthesis {
            query_id: QueryId::new(),
            narrative: "Cholesterol is trending down. Keep up the diet.".into(),
            key_points: vec![],
            unresolved_concerns: vec![],
        };
        assert_eq!(synthesis.digest(), "Cholesterol is trending down");
    }
}
