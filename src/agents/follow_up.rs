//! Follow-up question generator: turns information gaps into a short list of
//! targeted sub-questions for a second, narrower research pass.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::LLMService;
use crate::research::{CompressedFindings, SubQuestion};
use crate::types::{AppResult, LLMRequest};

const FOLLOW_UP_SYSTEM: &str = "You are a research lead. You turn known information gaps into precise follow-up questions that a web search can answer.";

#[derive(Debug, Deserialize)]
struct FollowUpResponse {
    #[serde(default)]
    sub_questions: Vec<SubQuestion>,
}

pub struct FollowUpGenerator {
    llm: Arc<LLMService>,
    max_questions: usize,
}

impl FollowUpGenerator {
    pub fn new(llm: Arc<LLMService>, max_questions: usize) -> Self {
        Self { llm, max_questions }
    }

    /// At most `max_questions` sub-questions; empty on any failure
    pub async fn generate(&self, query: &str, findings: &CompressedFindings) -> Vec<SubQuestion> {
        if findings.gaps_identified.is_empty() || self.max_questions == 0 {
            return Vec::new();
        }

        match self.request_questions(query, findings).await {
            Ok(questions) => {
                info!(count = questions.len(), "Follow-up questions generated");
                questions
            }
            Err(e) => {
                warn!(error = %e, "Follow-up generation failed, skipping follow-up research");
                Vec::new()
            }
        }
    }

    async fn request_questions(
        &self,
        query: &str,
        findings: &CompressedFindings,
    ) -> AppResult<Vec<SubQuestion>> {
        let gaps: String = findings
            .gaps_identified
            .iter()
            .map(|g| format!("- {}\n", g))
            .collect();
        let known: String = findings
            .key_findings
            .iter()
            .map(|f| format!("- {}\n", f))
            .collect();

        let prompt = format!(
            r#"MAIN QUESTION:
{query}

WHAT IS ALREADY KNOWN:
{known}
INFORMATION GAPS:
{gaps}
Write at most {max} follow-up sub-questions that would close the most important gaps. Do not repeat what is already known.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "sub_questions": [
    {{
      "question": "follow-up question",
      "search_queries": ["search query"],
      "priority": 1,
      "rationale": "which gap this closes"
    }}
  ]
}}"#,
            query = query,
            known = known,
            gaps = gaps,
            max = self.max_questions
        );

        let request = LLMRequest::new(FOLLOW_UP_SYSTEM, prompt)
            .with_max_tokens(1200)
            .with_temperature(0.3);
        let response: FollowUpResponse = self.llm.complete_json(request).await?;

        let mut questions: Vec<SubQuestion> = response
            .sub_questions
            .into_iter()
            .filter(|sq| !sq.question.trim().is_empty())
            .collect();
        questions.sort_by_key(|sq| sq.priority);
        questions.truncate(self.max_questions);
        Ok(questions)
    }
}
