use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One decomposed piece of the user's query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub question: String,
    #[serde(default)]
    pub search_queries: Vec<String>,
    /// Lower runs earlier
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub rationale: String,
}

impl SubQuestion {
    pub fn new(question: impl Into<String>, priority: u32) -> Self {
        Self {
            question: question.into(),
            search_queries: Vec::new(),
            priority,
            rationale: String::new(),
        }
    }
}

/// A fact or summary taken from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNote {
    pub source_url: String,
    pub source_title: String,
    pub source_type: String,
    pub content_summary: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchUnitResult {
    pub sub_question: SubQuestion,
    pub notes: Vec<SourceNote>,
    pub iterations: usize,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_calls_made: usize,
}

impl ResearchUnitResult {
    /// Terminal result for a unit that failed internally
    pub fn failed(sub_question: SubQuestion, error: impl Into<String>, tool_calls_made: usize) -> Self {
        Self {
            sub_question,
            notes: Vec::new(),
            iterations: 0,
            completed: false,
            error: Some(error.into()),
            tool_calls_made,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIndexEntry {
    /// 1-based, as a string
    pub index: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutline {
    pub main_question: String,
    pub sub_questions: Vec<SubQuestion>,
    #[serde(default)]
    pub research_strategy: String,
    #[serde(default)]
    pub expected_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressedFindings {
    pub main_question: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
    #[serde(default)]
    pub gaps_identified: Vec<String>,
    #[serde(default)]
    pub source_summary: Vec<String>,
    #[serde(default)]
    pub total_sources: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResearchPhase {
    Planning,
    Researching,
    Compressing,
    FollowUp,
    Writing,
    Done,
}

impl std::fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResearchPhase::Planning => "PLANNING",
            ResearchPhase::Researching => "RESEARCHING",
            ResearchPhase::Compressing => "COMPRESSING",
            ResearchPhase::FollowUp => "FOLLOW_UP",
            ResearchPhase::Writing => "WRITING",
            ResearchPhase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Citation entry as persisted and sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub reference_number: u32,
    #[serde(rename = "type")]
    pub source_type: String,
    pub title: String,
    pub url: String,
}

impl From<&SourceIndexEntry> for Reference {
    fn from(entry: &SourceIndexEntry) -> Self {
        Self {
            reference_number: entry.index.parse().unwrap_or_default(),
            source_type: entry.source_type.clone(),
            title: entry.title.clone(),
            url: entry.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_sources: usize,
    pub total_tool_calls: usize,
    pub sub_questions_researched: usize,
    pub key_findings: usize,
    pub duration_seconds: f64,
}

/// Run-scoped aggregate owned by the orchestrator
#[derive(Debug, Clone)]
pub struct ResearchState {
    pub conversation_id: Uuid,
    pub query: String,
    pub phase: ResearchPhase,
    pub outline: Option<ResearchOutline>,
    pub unit_results: Vec<ResearchUnitResult>,
    pub compressed_findings: Option<CompressedFindings>,
    pub all_references: Vec<SourceIndexEntry>,
    pub total_sources: usize,
    pub total_tool_calls: usize,
    pub final_report: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchState {
    pub fn new(conversation_id: Uuid, query: impl Into<String>) -> Self {
        Self {
            conversation_id,
            query: query.into(),
            phase: ResearchPhase::Planning,
            outline: None,
            unit_results: Vec::new(),
            compressed_findings: None,
            all_references: Vec::new(),
            total_sources: 0,
            total_tool_calls: 0,
            final_report: String::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn stats(&self) -> RunStats {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        RunStats {
            total_sources: self.total_sources,
            total_tool_calls: self.total_tool_calls,
            sub_questions_researched: self.unit_results.len(),
            key_findings: self
                .compressed_findings
                .as_ref()
                .map(|f| f.key_findings.len())
                .unwrap_or(0),
            duration_seconds: (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0,
        }
    }

    pub fn references(&self) -> Vec<Reference> {
        self.all_references.iter().map(Reference::from).collect()
    }
}
