//! Report Writer
//!
//! Streams the final report from the LLM, strips any reasoning markup from the
//! complete text, then cuts it into fixed-size chunks for the event stream.
//! If the model cannot produce a report, a plain report is assembled from the
//! findings instead.

use futures::StreamExt;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use crate::llm::LLMService;
use crate::research::{CompressedFindings, SourceIndexEntry};
use crate::types::{AppError, AppResult, LLMRequest};
use crate::utils::retry::compile;

const REPORT_SYSTEM: &str = "You are a senior equity research writer. You write clear, well-structured markdown reports and cite every claim with the numbered sources provided.";

/// Closed blocks, then an unclosed trailing block, then stray tags
static THINKING: OnceLock<Vec<Regex>> = OnceLock::new();

/// Remove `<think>`/`<thinking>` blocks, including an unclosed trailing one
pub fn strip_thinking(text: &str) -> String {
    let patterns = THINKING.get_or_init(|| {
        compile(&[
            r"(?is)<think(?:ing)?>.*?</think(?:ing)?>",
            r"(?is)<think(?:ing)?>.*$",
            r"(?i)</?think(?:ing)?>",
        ])
    });

    let cleaned = patterns
        .iter()
        .fold(text.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());
    cleaned.trim().to_string()
}

/// Split on character boundaries into pieces of at most `size` characters
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

pub struct ReportWriter {
    llm: Arc<LLMService>,
    chunk_size: usize,
}

impl ReportWriter {
    pub fn new(llm: Arc<LLMService>, chunk_size: usize) -> Self {
        Self { llm, chunk_size }
    }

    /// The report as content chunks, in order
    pub async fn write(
        &self,
        query: &str,
        findings: &CompressedFindings,
        references: &[SourceIndexEntry],
    ) -> Vec<String> {
        let report = match self.stream_report(query, findings, references).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Report generation failed, using fallback report");
                fallback_report(query, findings, references)
            }
        };

        info!(report_len = report.len(), "Report written");
        chunk_text(&report, self.chunk_size)
    }

    async fn stream_report(
        &self,
        query: &str,
        findings: &CompressedFindings,
        references: &[SourceIndexEntry],
    ) -> AppResult<String> {
        let request = LLMRequest::new(REPORT_SYSTEM, report_prompt(query, findings, references))
            .with_max_tokens(4000)
            .with_temperature(0.5);

        let mut stream = self.llm.complete_stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(delta) => text.push_str(&delta),
                // A report cut short mid-stream is still worth keeping
                Err(e) if !text.is_empty() => {
                    warn!(error = %e, received = text.len(), "Report stream interrupted");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let cleaned = strip_thinking(&text);
        if cleaned.is_empty() {
            return Err(AppError::LLMApi("Model returned an empty report".to_string()));
        }
        Ok(cleaned)
    }
}

fn bullets(items: &[String]) -> String {
    items.iter().map(|i| format!("- {}\n", i)).collect()
}

fn report_prompt(query: &str, findings: &CompressedFindings, references: &[SourceIndexEntry]) -> String {
    let sources: String = references
        .iter()
        .map(|r| format!("[{}] {} - {}\n", r.index, r.title, r.url))
        .collect();

    format!(
        r#"Write a research report answering the question below.

QUESTION:
{query}

KEY FINDINGS:
{findings}
SUPPORTING EVIDENCE:
{evidence}
OPEN GAPS:
{gaps}
NUMBERED SOURCES:
{sources}
Structure the report with a short executive summary, analysis sections and a conclusion. Cite sources inline with their numbers, e.g. [3]. Mention the open gaps where they limit the conclusion. Do not include a source list; it is appended separately."#,
        query = query,
        findings = bullets(&findings.key_findings),
        evidence = bullets(&findings.supporting_evidence),
        gaps = bullets(&findings.gaps_identified),
        sources = sources
    )
}

/// Plain report from the findings: summary, numbered findings, gaps, sources
pub fn fallback_report(
    query: &str,
    findings: &CompressedFindings,
    references: &[SourceIndexEntry],
) -> String {
    let mut report = format!("# Research Report: {}\n\n## Summary\n\n", query);
    report.push_str(&format!(
        "Research on this question drew on {} sources. The consolidated findings are listed below.\n",
        findings.total_sources.max(references.len())
    ));

    report.push_str("\n## Key Findings\n\n");
    if findings.key_findings.is_empty() {
        report.push_str("No findings could be established from the available sources.\n");
    } else {
        for (i, finding) in findings.key_findings.iter().enumerate() {
            report.push_str(&format!("{}. {}\n", i + 1, finding));
        }
    }

    if !findings.gaps_identified.is_empty() {
        report.push_str("\n## Information Gaps\n\n");
        for gap in &findings.gaps_identified {
            report.push_str(&format!("- {}\n", gap));
        }
    }

    if !references.is_empty() {
        report.push_str("\n## Sources\n\n");
        for r in references {
            report.push_str(&format!("[{}] {} - {}\n", r.index, r.title, r.url));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_llm, MockAdapter};

    fn findings() -> CompressedFindings {
        CompressedFindings {
            main_question: "q".to_string(),
            key_findings: vec!["Revenue up [1]".to_string(), "Margins flat [2]".to_string()],
            gaps_identified: vec!["Guidance".to_string()],
            total_sources: 2,
            ..CompressedFindings::default()
        }
    }

    #[test]
    fn test_strip_thinking() {
        assert_eq!(strip_thinking("<think>plan</think>Report"), "Report");
        assert_eq!(strip_thinking("<THINKING>a\nb</THINKING>\n# Title"), "# Title");
        assert_eq!(strip_thinking("Body<think>never closed"), "Body");
        assert_eq!(strip_thinking("stray</think> text"), "stray text");
    }

    #[test]
    fn test_chunk_text_respects_char_boundaries() {
        let chunks = chunk_text("héllo wörld", 4);
        assert_eq!(chunks, vec!["héll", "o wö", "rld"]);
        assert_eq!(chunks.concat(), "héllo wörld");
        assert!(chunk_text("", 4).is_empty());
    }

    #[test]
    fn test_fallback_report_sections() {
        let report = fallback_report("NVDA outlook", &findings(), &[]);
        assert!(report.starts_with("# Research Report: NVDA outlook"));
        assert!(report.contains("1. Revenue up [1]\n2. Margins flat [2]"));
        assert!(report.contains("- Guidance"));
        assert!(!report.contains("## Sources"));
    }

    #[tokio::test]
    async fn test_streamed_report_is_cleaned_and_chunked() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.push_chunks(&["<think>outline", " first</think>", "ABCDEFG", "HIJ"]);

        let chunks = ReportWriter::new(mock_llm(adapter), 4)
            .write("q", &findings(), &[])
            .await;
        assert_eq!(chunks, vec!["ABCD", "EFGH", "IJ"]);
    }

    #[tokio::test]
    async fn test_failure_falls_back() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.push_error("invalid api key");

        let chunks = ReportWriter::new(mock_llm(adapter), 50)
            .write("q", &findings(), &[])
            .await;
        assert!(chunks.concat().contains("## Key Findings"));
    }

    #[tokio::test]
    async fn test_empty_report_falls_back() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.push_chunks(&["<think>only thoughts</think>"]);

        let chunks = ReportWriter::new(mock_llm(adapter), 50)
            .write("q", &findings(), &[])
            .await;
        assert!(chunks.concat().starts_with("# Research Report: q"));
    }
}
