//! Research Orchestrator
//!
//! Drives one research run through its phases and reports every step as a
//! [`ResearchEvent`]:
//!
//! ```text
//! PLANNING → RESEARCHING → COMPRESSING → [FOLLOW_UP] → WRITING → DONE
//! ```
//!
//! The whole run is bounded by the configured timeout. A run ends with
//! exactly one terminal event (`done` or `error`) unless the receiver is
//! dropped, in which case in-flight units are aborted and nothing is
//! persisted.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::ResearchEvent;
use super::source_index::{collect_all_notes, SourceIndex};
use super::supervisor::{emit, ResearchSupervisor};
use super::types::{ResearchPhase, ResearchState, ResearchUnitResult};
use crate::agents::{CompressionAgent, FollowUpGenerator, PlanningAgent, ReportWriter};
use crate::config::ResearchConfig;
use crate::db::{ConversationStore, ResearchTranscript};
use crate::llm::LLMService;
use crate::tools::ToolExecutor;
use crate::types::{AppError, AppResult};

/// Events buffered between a spawned run and its consumer
const EVENT_BUFFER: usize = 64;

pub struct ResearchOrchestrator {
    llm: Arc<LLMService>,
    tools: Arc<dyn ToolExecutor>,
    store: Arc<dyn ConversationStore>,
    config: ResearchConfig,
}

impl ResearchOrchestrator {
    pub fn new(
        llm: Arc<LLMService>,
        tools: Arc<dyn ToolExecutor>,
        store: Arc<dyn ConversationStore>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            store,
            config,
        }
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Run in a background task; the returned receiver yields the events.
    /// Dropping it cancels the run.
    pub fn spawn(self: Arc<Self>, conversation_id: Uuid, query: String) -> mpsc::Receiver<ResearchEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = self.run(conversation_id, &query, &tx).await {
                debug!(conversation_id = %conversation_id, error = %e, "Research run ended early");
            }
        });
        rx
    }

    /// Execute one research run, streaming events to `events`.
    ///
    /// Failures other than cancellation are reported as a single `error`
    /// event before being returned.
    pub async fn run(
        &self,
        conversation_id: Uuid,
        query: &str,
        events: &mpsc::Sender<ResearchEvent>,
    ) -> AppResult<ResearchState> {
        let limit = self.config.run_timeout();
        info!(conversation_id = %conversation_id, timeout_secs = limit.as_secs(), "Research run started");

        let outcome = match tokio::time::timeout(limit, self.execute(conversation_id, query, events)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::Timeout(limit)),
        };

        match outcome {
            Ok(state) => {
                info!(
                    conversation_id = %conversation_id,
                    sources = state.total_sources,
                    tool_calls = state.total_tool_calls,
                    "Research run finished"
                );
                Ok(state)
            }
            Err(AppError::Cancelled(reason)) => {
                warn!(conversation_id = %conversation_id, reason = %reason, "Research run cancelled");
                Err(AppError::Cancelled(reason))
            }
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Research run failed");
                let message = match &e {
                    AppError::Timeout(limit) => {
                        format!("Research timed out after {} seconds", limit.as_secs())
                    }
                    other => format!("Research failed: {}", other),
                };
                // The receiver may already be gone; nothing else to report to.
                let _ = events.send(ResearchEvent::Error { message }).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        conversation_id: Uuid,
        query: &str,
        events: &mpsc::Sender<ResearchEvent>,
    ) -> AppResult<ResearchState> {
        let mut state = ResearchState::new(conversation_id, query);
        let supervisor = ResearchSupervisor::new(self.llm.clone(), self.tools.clone(), &self.config);
        let compressor = CompressionAgent::new(self.llm.clone(), self.config.max_fallback_findings);

        // Planning
        self.enter(&mut state, ResearchPhase::Planning, "Planning research approach", events)
            .await?;
        let planner = PlanningAgent::new(
            self.llm.clone(),
            self.config.min_sub_questions,
            self.config.max_sub_questions,
        );
        let outline = planner.create_outline(query).await;
        emit(
            events,
            ResearchEvent::thinking(format!(
                "Research plan: {} sub-questions. {}",
                outline.sub_questions.len(),
                outline.research_strategy
            )),
        )
        .await?;
        emit(
            events,
            ResearchEvent::Plan {
                main_question: outline.main_question.clone(),
                sub_questions: outline.sub_questions.clone(),
                expected_sources: outline.expected_sources.clone(),
            },
        )
        .await?;
        let sub_questions = outline.sub_questions.clone();
        state.outline = Some(outline);

        // Researching
        self.enter(
            &mut state,
            ResearchPhase::Researching,
            format!("Researching {} sub-questions", sub_questions.len()),
            events,
        )
        .await?;
        let results = supervisor.run_units(&sub_questions, None, events).await?;
        let mut index = SourceIndex::from_notes(&collect_all_notes(&results));
        record_results(&mut state, results);
        state.total_sources = index.len();

        // Compressing
        self.enter(
            &mut state,
            ResearchPhase::Compressing,
            format!("Consolidating findings from {} sources", index.len()),
            events,
        )
        .await?;
        let mut findings = compressor.compress(query, &state.unit_results, &index).await;

        // Follow-up
        if self.config.follow_up_enabled && !findings.gaps_identified.is_empty() {
            self.enter(
                &mut state,
                ResearchPhase::FollowUp,
                format!("Investigating {} information gaps", findings.gaps_identified.len()),
                events,
            )
            .await?;

            let follow_ups = FollowUpGenerator::new(self.llm.clone(), self.config.max_follow_up_questions)
                .generate(query, &findings)
                .await;

            if follow_ups.is_empty() {
                emit(events, ResearchEvent::thinking("No follow-up research needed")).await?;
            } else {
                emit(
                    events,
                    ResearchEvent::thinking(format!("Following up on {} questions", follow_ups.len())),
                )
                .await?;

                let extra = supervisor
                    .run_units(
                        &follow_ups,
                        Some(self.config.follow_up_max_tool_calls_per_unit),
                        events,
                    )
                    .await?;
                let added = index.extend(&collect_all_notes(&extra));
                debug!(added, total = index.len(), "Follow-up sources merged");

                record_results(&mut state, extra);
                state.total_sources = index.len();
                findings = compressor.compress(query, &state.unit_results, &index).await;
            }
        }

        state.all_references = index.entries().to_vec();

        // Writing
        self.enter(&mut state, ResearchPhase::Writing, "Writing research report", events)
            .await?;
        let chunks = ReportWriter::new(self.llm.clone(), self.config.report_chunk_size)
            .write(query, &findings, index.entries())
            .await;
        state.compressed_findings = Some(findings);
        for chunk in chunks {
            state.final_report.push_str(&chunk);
            emit(events, ResearchEvent::Content { content: chunk }).await?;
        }

        // Done
        let completed_at = Utc::now();
        state.completed_at = Some(completed_at);

        let transcript = ResearchTranscript {
            conversation_id,
            query: query.to_string(),
            report: state.final_report.clone(),
            references: state.references(),
            stats: state.stats(),
            completed_at,
        };
        self.store.save_transcript(&transcript).await?;

        self.enter(&mut state, ResearchPhase::Done, "Research complete", events)
            .await?;
        emit(
            events,
            ResearchEvent::Done {
                references: transcript.references,
                stats: transcript.stats,
            },
        )
        .await?;

        Ok(state)
    }

    async fn enter(
        &self,
        state: &mut ResearchState,
        phase: ResearchPhase,
        message: impl Into<String>,
        events: &mpsc::Sender<ResearchEvent>,
    ) -> AppResult<()> {
        let message = message.into();
        info!(conversation_id = %state.conversation_id, phase = %phase, "{}", message);
        state.phase = phase;
        emit(events, ResearchEvent::phase(phase, message)).await
    }
}

fn record_results(state: &mut ResearchState, results: Vec<ResearchUnitResult>) {
    state.total_tool_calls += results.iter().map(|r| r.tool_calls_made).sum::<usize>();
    state.unit_results.extend(results);
}
