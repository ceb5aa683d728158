//! Streaming event protocol
//!
//! Everything the client sees is a [`ResearchEvent`], serialized as a JSON
//! object discriminated by its `type` field. Units talk to the supervisor in
//! the narrower [`UnitEvent`] vocabulary over their private channels.

use serde::{Deserialize, Serialize};

use super::types::{Reference, ResearchPhase, ResearchUnitResult, RunStats, SubQuestion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Started,
    Working,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    #[serde(rename = "research_phase")]
    Phase { phase: ResearchPhase, message: String },

    Thinking { content: String },

    #[serde(rename = "research_plan")]
    Plan {
        main_question: String,
        sub_questions: Vec<SubQuestion>,
        expected_sources: Vec<String>,
    },

    #[serde(rename = "research_progress")]
    Progress {
        unit_index: usize,
        completed: usize,
        total: usize,
        status: UnitStatus,
        sub_question: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "research_complete")]
    Complete { results: Vec<ResearchUnitResult> },

    Content { content: String },

    Done {
        references: Vec<Reference>,
        stats: RunStats,
    },

    Error { message: String },
}

impl ResearchEvent {
    pub fn phase(phase: ResearchPhase, message: impl Into<String>) -> Self {
        ResearchEvent::Phase {
            phase,
            message: message.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        ResearchEvent::Thinking {
            content: content.into(),
        }
    }

    /// Wire name of the event, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ResearchEvent::Phase { .. } => "research_phase",
            ResearchEvent::Thinking { .. } => "thinking",
            ResearchEvent::Plan { .. } => "research_plan",
            ResearchEvent::Progress { .. } => "research_progress",
            ResearchEvent::Complete { .. } => "research_complete",
            ResearchEvent::Content { .. } => "content",
            ResearchEvent::Done { .. } => "done",
            ResearchEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResearchEvent::Done { .. } | ResearchEvent::Error { .. })
    }
}

/// What a unit reports on its own queue. `Complete` is always the last
/// message a unit sends.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Started,
    Progress { message: String },
    Complete(ResearchUnitResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_by_type() {
        let event = ResearchEvent::phase(ResearchPhase::Researching, "Researching 3 sub-questions");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "research_phase");
        assert_eq!(json["phase"], "RESEARCHING");
        assert_eq!(json["type"], event.event_type());

        let progress = ResearchEvent::Progress {
            unit_index: 0,
            completed: 1,
            total: 3,
            status: UnitStatus::Completed,
            sub_question: "q".to_string(),
            message: None,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["type"], "research_progress");
        assert_eq!(json["status"], "completed");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_terminal_events() {
        assert!(ResearchEvent::Error {
            message: "x".to_string()
        }
        .is_terminal());
        assert!(!ResearchEvent::thinking("x").is_terminal());
    }
}
