//! Compression Agent
//!
//! Consolidates every unit's notes into key findings and information gaps,
//! citing sources by their number in the shared source index.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::LLMService;
use crate::research::{CompressedFindings, ResearchUnitResult, SourceIndex};
use crate::types::{AppError, AppResult, LLMRequest};

pub const COMPRESSION_FAILED_GAP: &str = "Compression failed - raw notes used";

const COMPRESSION_SYSTEM: &str = "You are a research editor. You consolidate analyst notes into precise, cited findings and state clearly what is still unknown.";

/// Notes included per source in the prompt
const MAX_FACTS_PER_NOTE: usize = 5;

#[derive(Debug, Deserialize)]
struct CompressionResponse {
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    supporting_evidence: Vec<String>,
    #[serde(default)]
    gaps_identified: Vec<String>,
    #[serde(default)]
    source_summary: Vec<String>,
}

pub struct CompressionAgent {
    llm: Arc<LLMService>,
    max_fallback_findings: usize,
}

impl CompressionAgent {
    pub fn new(llm: Arc<LLMService>, max_fallback_findings: usize) -> Self {
        Self {
            llm,
            max_fallback_findings,
        }
    }

    pub async fn compress(
        &self,
        query: &str,
        results: &[ResearchUnitResult],
        index: &SourceIndex,
    ) -> CompressedFindings {
        match self.request_findings(query, results, index).await {
            Ok(findings) => {
                info!(
                    findings = findings.key_findings.len(),
                    gaps = findings.gaps_identified.len(),
                    sources = findings.total_sources,
                    "Findings compressed"
                );
                findings
            }
            Err(e) => {
                warn!(error = %e, "Compression failed, using raw notes");
                fallback_findings(query, results, index, self.max_fallback_findings)
            }
        }
    }

    async fn request_findings(
        &self,
        query: &str,
        results: &[ResearchUnitResult],
        index: &SourceIndex,
    ) -> AppResult<CompressedFindings> {
        let request = LLMRequest::new(COMPRESSION_SYSTEM, compression_prompt(query, results, index))
            .with_max_tokens(3000)
            .with_temperature(0.2);
        let response: CompressionResponse = self.llm.complete_json(request).await?;

        let key_findings: Vec<String> = response
            .key_findings
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        if key_findings.is_empty() && has_facts(results) {
            return Err(AppError::Parse(
                "Compression returned no findings although notes contain facts".to_string(),
            ));
        }

        Ok(CompressedFindings {
            main_question: query.to_string(),
            key_findings,
            supporting_evidence: response.supporting_evidence,
            gaps_identified: response
                .gaps_identified
                .into_iter()
                .filter(|g| !g.trim().is_empty())
                .collect(),
            source_summary: response.source_summary,
            total_sources: index.len(),
        })
    }
}

fn has_facts(results: &[ResearchUnitResult]) -> bool {
    results
        .iter()
        .flat_map(|r| &r.notes)
        .any(|n| n.key_facts.iter().any(|f| !f.trim().is_empty()))
}

fn compression_prompt(query: &str, results: &[ResearchUnitResult], index: &SourceIndex) -> String {
    let mut notes = String::new();
    for result in results {
        notes.push_str(&format!("\n## {}\n", result.sub_question.question));
        if let Some(error) = &result.error {
            notes.push_str(&format!("(research failed: {})\n", error));
            continue;
        }
        for note in &result.notes {
            let citation = index
                .index_of(&note.source_url)
                .map(|n| format!("[{}]", n))
                .unwrap_or_default();
            notes.push_str(&format!("- {} {}: {}\n", citation, note.source_title, note.content_summary));
            for fact in note.key_facts.iter().take(MAX_FACTS_PER_NOTE) {
                notes.push_str(&format!("    * {}\n", fact));
            }
        }
    }

    let sources: String = index
        .entries()
        .iter()
        .map(|e| format!("[{}] {} ({}) {}\n", e.index, e.title, e.source_type, e.url))
        .collect();

    format!(
        r#"MAIN QUESTION:
{query}

SOURCES:
{sources}
RESEARCH NOTES:
{notes}

Consolidate the notes into the most important findings for the main question. Cite sources inline with their numbers, e.g. [2]. List the gaps that matter for answering the question and are not covered by the notes.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "key_findings": ["finding with citation [1]"],
  "supporting_evidence": ["evidence detail [2]"],
  "gaps_identified": ["missing information"],
  "source_summary": ["[1] what this source contributed"]
}}"#,
        query = query,
        sources = sources,
        notes = notes
    )
}

/// Deterministic findings from the raw notes: unique facts in note order,
/// capped, each cited by its source number.
pub fn fallback_findings(
    query: &str,
    results: &[ResearchUnitResult],
    index: &SourceIndex,
    max_findings: usize,
) -> CompressedFindings {
    let mut seen = HashSet::new();
    let mut key_findings = Vec::new();
    let mut supporting_evidence = Vec::new();

    'notes: for note in results.iter().flat_map(|r| &r.notes) {
        let citation = index
            .index_of(&note.source_url)
            .map(|n| format!(" [{}]", n))
            .unwrap_or_default();

        if !note.content_summary.trim().is_empty() && supporting_evidence.len() < max_findings {
            supporting_evidence.push(format!("{}{}", note.content_summary.trim(), citation));
        }

        for fact in &note.key_facts {
            let fact = fact.trim();
            if fact.is_empty() || !seen.insert(fact.to_lowercase()) {
                continue;
            }
            key_findings.push(format!("{}{}", fact, citation));
            if key_findings.len() >= max_findings.max(1) {
                break 'notes;
            }
        }
    }

    CompressedFindings {
        main_question: query.to_string(),
        key_findings,
        supporting_evidence,
        gaps_identified: vec![COMPRESSION_FAILED_GAP.to_string()],
        source_summary: index
            .entries()
            .iter()
            .map(|e| format!("[{}] {} ({})", e.index, e.title, e.source_type))
            .collect(),
        total_sources: index.len(),
    }
}
