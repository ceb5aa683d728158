//! Planning Agent
//!
//! Decomposes the user's question into prioritized sub-questions. Any failure
//! (malformed JSON, context overflow, exhausted retries) yields a fixed
//! two-question outline built from the raw query, so research always starts.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::LLMService;
use crate::research::{ResearchOutline, SubQuestion};
use crate::types::{AppError, AppResult, LLMRequest};

const PLANNING_SYSTEM: &str = "You are a senior equity research strategist. You break broad investment questions into focused, searchable sub-questions.";

#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    main_question: String,
    #[serde(default)]
    sub_questions: Vec<SubQuestion>,
    #[serde(default)]
    research_strategy: String,
    #[serde(default)]
    expected_sources: Vec<String>,
}

pub struct PlanningAgent {
    llm: Arc<LLMService>,
    min_sub_questions: usize,
    max_sub_questions: usize,
}

impl PlanningAgent {
    pub fn new(llm: Arc<LLMService>, min_sub_questions: usize, max_sub_questions: usize) -> Self {
        Self {
            llm,
            min_sub_questions,
            max_sub_questions: max_sub_questions.max(min_sub_questions),
        }
    }

    pub async fn create_outline(&self, query: &str) -> ResearchOutline {
        info!(query_len = query.len(), "Planning research");

        match self.request_outline(query).await {
            Ok(outline) => {
                info!(sub_questions = outline.sub_questions.len(), "Research plan created");
                outline
            }
            Err(e) => {
                warn!(error = %e, "Planning failed, using fallback outline");
                fallback_outline(query)
            }
        }
    }

    async fn request_outline(&self, query: &str) -> AppResult<ResearchOutline> {
        let request = LLMRequest::new(PLANNING_SYSTEM, self.planning_prompt(query))
            .with_max_tokens(2000)
            .with_temperature(0.4);
        let plan: PlanResponse = self.llm.complete_json(request).await?;

        let mut sub_questions: Vec<SubQuestion> = plan
            .sub_questions
            .into_iter()
            .filter(|sq| !sq.question.trim().is_empty())
            .collect();
        sub_questions.sort_by_key(|sq| sq.priority);
        sub_questions.truncate(self.max_sub_questions);

        if sub_questions.len() < self.min_sub_questions {
            return Err(AppError::Parse(format!(
                "Plan has {} usable sub-questions, need at least {}",
                sub_questions.len(),
                self.min_sub_questions
            )));
        }

        Ok(ResearchOutline {
            main_question: if plan.main_question.trim().is_empty() {
                query.to_string()
            } else {
                plan.main_question
            },
            sub_questions,
            research_strategy: plan.research_strategy,
            expected_sources: plan.expected_sources,
        })
    }

    fn planning_prompt(&self, query: &str) -> String {
        format!(
            r#"Decompose the following research question into {min} to {max} focused sub-questions.

QUESTION:
{query}

For each sub-question give 1-3 concrete web search queries. Use priority 1 for the most fundamental sub-question; lower numbers are researched first.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "main_question": "restated question",
  "sub_questions": [
    {{
      "question": "focused sub-question",
      "search_queries": ["search query"],
      "priority": 1,
      "rationale": "why this matters"
    }}
  ],
  "research_strategy": "one paragraph",
  "expected_sources": ["news", "filings", "market data"]
}}"#,
            min = self.min_sub_questions,
            max = self.max_sub_questions,
            query = query
        )
    }
}

/// Outline used when planning fails: a direct search plus recent developments
pub fn fallback_outline(query: &str) -> ResearchOutline {
    ResearchOutline {
        main_question: query.to_string(),
        sub_questions: vec![
            SubQuestion {
                question: query.to_string(),
                search_queries: vec![query.to_string()],
                priority: 1,
                rationale: "Direct search for the original question".to_string(),
            },
            SubQuestion {
                question: format!("What are the recent developments regarding {}?", query),
                search_queries: vec![format!("{} latest news", query)],
                priority: 2,
                rationale: "Recent news and developments".to_string(),
            },
        ],
        research_strategy: "Direct search followed by recent developments".to_string(),
        expected_sources: vec!["web".to_string(), "news".to_string()],
    }
}
