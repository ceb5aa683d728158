//! Research Unit
//!
//! Answers one sub-question. Each iteration takes the next search query, runs
//! it through a tool, and asks the LLM to turn the hits into source notes and
//! decide whether the evidence is sufficient. The loop ends when the model
//! says so, when the tool-call budget is spent, or when there is nothing left
//! to search for.
//!
//! A unit never fails into its supervisor: every outcome, including internal
//! failure, ends with exactly one [`UnitEvent::Complete`].

use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::events::UnitEvent;
use super::types::{ResearchUnitResult, SourceNote, SubQuestion};
use crate::llm::LLMService;
use crate::tools::{tool_call_for_query, ToolCall, ToolExecutor, ToolItem, ToolResult};
use crate::types::{AppError, AppResult, LLMRequest};
use crate::utils::retry::{RetryExecutor, RetryPolicy};

/// New queries a single extraction may add to the queue
const MAX_QUERIES_PER_EXTRACTION: usize = 2;

const EXTRACTION_SYSTEM: &str = "You are a meticulous equity research analyst. You extract verifiable facts from search results and never invent sources.";

#[derive(Debug, Deserialize)]
struct Extraction {
    #[serde(default)]
    notes: Vec<ExtractedNote>,
    #[serde(default)]
    sufficient: bool,
    #[serde(default)]
    follow_up_queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractedNote {
    source_url: String,
    #[serde(default)]
    source_title: String,
    #[serde(default)]
    source_type: String,
    #[serde(default)]
    content_summary: String,
    #[serde(default)]
    key_facts: Vec<String>,
}

pub struct ResearchUnit {
    llm: Arc<LLMService>,
    tools: Arc<dyn ToolExecutor>,
    sub_question: SubQuestion,
    max_tool_calls: usize,
    retry: RetryExecutor,
    policy: RetryPolicy,
}

impl ResearchUnit {
    pub fn new(
        llm: Arc<LLMService>,
        tools: Arc<dyn ToolExecutor>,
        sub_question: SubQuestion,
        max_tool_calls: usize,
    ) -> Self {
        // Tool calls back off like provider calls; no key to report against
        let policy = llm.retry_policy().clone();
        Self {
            llm,
            tools,
            sub_question,
            max_tool_calls,
            retry: RetryExecutor::default(),
            policy,
        }
    }

    /// Run to completion, reporting on `events`
    pub async fn run(self, events: mpsc::UnboundedSender<UnitEvent>) {
        // A closed queue means the supervisor is gone; nothing left to tell.
        let _ = events.send(UnitEvent::Started);

        let result = self.research(&events).await;

        info!(
            question = %result.sub_question.question,
            notes = result.notes.len(),
            tool_calls = result.tool_calls_made,
            completed = result.completed,
            "Research unit finished"
        );
        let _ = events.send(UnitEvent::Complete(result));
    }

    async fn research(&self, events: &mpsc::UnboundedSender<UnitEvent>) -> ResearchUnitResult {
        let available = self.tools.available_tools();

        let mut queue: VecDeque<String> = self
            .sub_question
            .search_queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if queue.is_empty() {
            queue.push_back(self.sub_question.question.clone());
        }

        let mut searched = HashSet::new();
        let mut notes: Vec<SourceNote> = Vec::new();
        let mut tool_calls = 0;
        let mut iterations = 0;
        let mut successful_calls = 0;
        let mut last_error: Option<AppError> = None;

        while tool_calls < self.max_tool_calls {
            let Some(query) = queue.pop_front() else {
                break;
            };
            if !searched.insert(query.to_lowercase()) {
                continue;
            }

            iterations += 1;
            let call = tool_call_for_query(&query, &available);
            let _ = events.send(UnitEvent::Progress {
                message: format!("Searching ({}): {}", call.name, query),
            });

            tool_calls += 1;
            let hits = match self.search(call).await {
                Ok(result) => {
                    successful_calls += 1;
                    result.items
                }
                Err(e) => {
                    warn!(error = %e, query = %query, "Tool call failed");
                    last_error = Some(e);
                    continue;
                }
            };

            if hits.is_empty() {
                debug!(query = %query, "Search returned no hits");
                continue;
            }

            match self.extract(&query, &hits).await {
                Ok(extraction) => {
                    let extracted = extraction_notes(extraction.notes);
                    if extracted.is_empty() {
                        merge_notes(&mut notes, notes_from_hits(&hits));
                    } else {
                        merge_notes(&mut notes, extracted);
                    }

                    let _ = events.send(UnitEvent::Progress {
                        message: format!("{} sources noted", notes.len()),
                    });

                    if extraction.sufficient {
                        debug!(question = %self.sub_question.question, "Evidence judged sufficient");
                        break;
                    }
                    queue.extend(
                        extraction
                            .follow_up_queries
                            .into_iter()
                            .map(|q| q.trim().to_string())
                            .filter(|q| !q.is_empty())
                            .take(MAX_QUERIES_PER_EXTRACTION),
                    );
                }
                Err(e) => {
                    warn!(error = %e, query = %query, "Extraction failed, keeping raw search hits");
                    merge_notes(&mut notes, notes_from_hits(&hits));
                }
            }
        }

        if successful_calls == 0 {
            if let Some(e) = last_error {
                let mut result =
                    ResearchUnitResult::failed(self.sub_question.clone(), e.to_string(), tool_calls);
                result.iterations = iterations;
                return result;
            }
        }

        ResearchUnitResult {
            sub_question: self.sub_question.clone(),
            notes,
            iterations,
            completed: true,
            error: None,
            tool_calls_made: tool_calls,
        }
    }

    /// One budgeted tool call; rate-limited attempts are retried
    async fn search(&self, call: ToolCall) -> AppResult<ToolResult> {
        let tools = self.tools.clone();
        self.retry
            .execute(&self.policy, None, move || {
                let tools = tools.clone();
                let call = call.clone();
                async move { tools.execute(&call).await }
            })
            .await
    }

    async fn extract(&self, query: &str, hits: &[ToolItem]) -> Result<Extraction, AppError> {
        let request = LLMRequest::new(EXTRACTION_SYSTEM, extraction_prompt(&self.sub_question, query, hits))
            .with_max_tokens(1500)
            .with_temperature(0.2);
        self.llm.complete_json(request).await
    }
}

fn extraction_prompt(sub_question: &SubQuestion, query: &str, hits: &[ToolItem]) -> String {
    let mut listing = String::new();
    for (i, hit) in hits.iter().enumerate() {
        listing.push_str(&format!(
            "[{}] {}\nURL: {}\nType: {}\n{}\n\n",
            i + 1,
            hit.title,
            hit.url,
            hit.source_type,
            hit.snippet
        ));
    }

    format!(
        r#"RESEARCH QUESTION:
{question}

SEARCH QUERY:
{query}

SEARCH RESULTS:
{listing}
Extract the evidence relevant to the research question. Only cite URLs that appear above.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "notes": [
    {{
      "source_url": "URL from the results",
      "source_title": "title",
      "source_type": "news | filing | market_data | academic | web",
      "content_summary": "one or two sentences",
      "key_facts": ["specific fact with numbers and dates"]
    }}
  ],
  "sufficient": false,
  "follow_up_queries": ["a narrower search if evidence is missing"]
}}"#,
        question = sub_question.question,
        query = query,
        listing = listing
    )
}

fn extraction_notes(extracted: Vec<ExtractedNote>) -> Vec<SourceNote> {
    extracted
        .into_iter()
        .filter(|n| !n.source_url.trim().is_empty())
        .map(|n| SourceNote {
            source_url: n.source_url.trim().to_string(),
            source_title: n.source_title,
            source_type: if n.source_type.is_empty() {
                "web".to_string()
            } else {
                n.source_type
            },
            content_summary: n.content_summary,
            key_facts: n.key_facts,
        })
        .collect()
}

/// Notes straight from search hits, used when extraction is unavailable
fn notes_from_hits(hits: &[ToolItem]) -> Vec<SourceNote> {
    hits.iter()
        .map(|hit| SourceNote {
            source_url: hit.url.clone(),
            source_title: hit.title.clone(),
            source_type: hit.source_type.clone(),
            content_summary: hit.snippet.clone(),
            key_facts: if hit.snippet.trim().is_empty() {
                Vec::new()
            } else {
                vec![hit.snippet.clone()]
            },
        })
        .collect()
}

/// One note per URL; facts for a known URL are appended without duplicates
fn merge_notes(notes: &mut Vec<SourceNote>, incoming: Vec<SourceNote>) {
    for note in incoming {
        match notes.iter_mut().find(|n| n.source_url == note.source_url) {
            Some(existing) => {
                for fact in note.key_facts {
                    if !existing.key_facts.contains(&fact) {
                        existing.key_facts.push(fact);
                    }
                }
                if existing.content_summary.is_empty() {
                    existing.content_summary = note.content_summary;
                }
            }
            None => notes.push(note),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_llm, MockAdapter, MockTools};
    use crate::tools::{NEWS_SEARCH, STOCK_QUOTE, WEB_SEARCH};

    async fn run_unit(
        adapter: Arc<MockAdapter>,
        tools: Arc<MockTools>,
        sub_question: SubQuestion,
        budget: usize,
    ) -> (Vec<UnitEvent>, ResearchUnitResult) {
        let unit = ResearchUnit::new(mock_llm(adapter), tools, sub_question, budget);
        let (tx, mut rx) = mpsc::unbounded_channel();
        unit.run(tx).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let result = match events.last() {
            Some(UnitEvent::Complete(result)) => result.clone(),
            other => panic!("last event was not Complete: {:?}", other),
        };
        (events, result)
    }

    fn question_with_queries(queries: &[&str]) -> SubQuestion {
        SubQuestion {
            question: "How did NVDA data center revenue change?".to_string(),
            search_queries: queries.iter().map(|q| q.to_string()).collect(),
            priority: 1,
            rationale: String::new(),
        }
    }

    #[tokio::test]
    async fn test_stops_when_evidence_is_sufficient() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.route(
            "SEARCH RESULTS",
            r#"{"notes":[{"source_url":"https://example.com/nvda-revenue","source_title":"Q4","key_facts":["Data center revenue rose 409%"]}],"sufficient":true}"#,
        );
        let tools = Arc::new(MockTools::new());

        let (events, result) = run_unit(
            adapter,
            tools.clone(),
            question_with_queries(&["nvda revenue", "nvda guidance"]),
            6,
        )
        .await;

        assert!(matches!(events.first(), Some(UnitEvent::Started)));
        assert!(result.completed);
        assert_eq!(result.tool_calls_made, 1);
        assert_eq!(result.notes.len(), 1);
        assert_eq!(result.notes[0].key_facts, vec!["Data center revenue rose 409%"]);
        assert_eq!(tools.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_caps_tool_calls() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.route(
            "SEARCH RESULTS",
            r#"{"notes":[],"sufficient":false,"follow_up_queries":["more a","more b"]}"#,
        );
        let tools = Arc::new(MockTools::new());

        let (_, result) = run_unit(adapter, tools.clone(), question_with_queries(&["start"]), 3).await;

        assert_eq!(result.tool_calls_made, 3);
        assert_eq!(tools.calls().len(), 3);
        // Empty extractions fall back to raw hits
        assert!(!result.notes.is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_raw_hits() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.route("SEARCH RESULTS", "I cannot answer in JSON today");
        let tools = Arc::new(MockTools::new());

        let (_, result) = run_unit(adapter, tools, question_with_queries(&["nvda revenue"]), 2).await;

        assert!(result.completed);
        assert_eq!(result.notes.len(), 2);
        assert!(result.notes.iter().all(|n| !n.key_facts.is_empty()));
    }

    #[tokio::test]
    async fn test_all_tool_calls_failing_yields_error_result() {
        let adapter = Arc::new(MockAdapter::new());
        let tools = Arc::new(MockTools::new());
        tools.fail_all("SerpAPI error (500)");

        let (events, result) =
            run_unit(adapter, tools, question_with_queries(&["a", "b"]), 6).await;

        assert!(!result.completed);
        assert!(result.notes.is_empty());
        assert!(result.error.as_deref().unwrap_or("").contains("500"));
        assert_eq!(result.tool_calls_made, 2);
        let completes = events
            .iter()
            .filter(|e| matches!(e, UnitEvent::Complete(_)))
            .count();
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn test_news_queries_use_news_tool_and_question_is_default_query() {
        let adapter = Arc::new(MockAdapter::new());
        let tools = Arc::new(MockTools::new());

        run_unit(
            adapter.clone(),
            tools.clone(),
            question_with_queries(&["NVDA latest news"]),
            1,
        )
        .await;
        assert_eq!(tools.calls()[0].name, NEWS_SEARCH);

        let tools = Arc::new(MockTools::new());
        run_unit(adapter, tools.clone(), SubQuestion::new("What is NVDA's moat?", 1), 1).await;
        let call = &tools.calls()[0];
        assert_eq!(call.name, WEB_SEARCH);
        assert_eq!(call.arg("query"), Some("What is NVDA's moat?"));
    }

    #[tokio::test]
    async fn test_rate_limited_tool_call_is_retried() {
        let adapter = Arc::new(MockAdapter::new());
        let tools = Arc::new(MockTools::new());
        tools.fail_next("SerpAPI error (429 Too Many Requests): retry-after: 0");

        let (_, result) =
            run_unit(adapter, tools.clone(), question_with_queries(&["nvda revenue"]), 6).await;

        assert_eq!(tools.calls().len(), 2);
        assert!(result.completed);
        assert!(result.error.is_none());
        assert_eq!(result.tool_calls_made, 1);
        assert_eq!(result.notes.len(), 2);
    }

    #[tokio::test]
    async fn test_quote_queries_use_stock_quote_tool() {
        let adapter = Arc::new(MockAdapter::new());
        let tools = Arc::new(MockTools::new().with_stock_quote());

        run_unit(adapter, tools.clone(), question_with_queries(&["NVDA stock price"]), 1).await;

        let call = &tools.calls()[0];
        assert_eq!(call.name, STOCK_QUOTE);
        assert_eq!(call.arg("symbol"), Some("NVDA"));
    }

    #[test]
    fn test_merge_notes_combines_facts_per_url() {
        let mut notes = notes_from_hits(&[ToolItem {
            title: "A".into(),
            url: "https://a.com".into(),
            snippet: "fact 1".into(),
            source_type: "web".into(),
        }]);
        merge_notes(
            &mut notes,
            vec![SourceNote {
                source_url: "https://a.com".into(),
                source_title: "A".into(),
                source_type: "web".into(),
                content_summary: String::new(),
                key_facts: vec!["fact 1".into(), "fact 2".into()],
            }],
        );
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].key_facts, vec!["fact 1", "fact 2"]);
    }
}
