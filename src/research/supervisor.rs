//! Research Supervisor
//!
//! Fans sub-questions out to research units and fans their progress back in.
//!
//! ```text
//!   sub-questions (priority order)
//!        │
//!        ▼
//!   ┌──────────┐   permit   ┌────────┐  private queue
//!   │semaphore │──────────▶ │ unit i │ ──────────────┐
//!   └──────────┘            └────────┘               │
//!                                                    ▼
//!                        round-robin try_recv over all queues,
//!                        fixed sleep between rounds
//!                                                    │
//!                                                    ▼
//!                               research_progress ... research_complete
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{ResearchEvent, UnitEvent, UnitStatus};
use super::types::{ResearchUnitResult, SubQuestion};
use super::unit::ResearchUnit;
use crate::config::ResearchConfig;
use crate::llm::LLMService;
use crate::tools::ToolExecutor;
use crate::types::{AppError, AppResult};

/// Forward an event to the caller. A closed channel means the caller went away.
pub(crate) async fn emit(events: &mpsc::Sender<ResearchEvent>, event: ResearchEvent) -> AppResult<()> {
    events
        .send(event)
        .await
        .map_err(|_| AppError::Cancelled("event receiver dropped".to_string()))
}

/// Aborts every unit task still running when dropped
struct UnitTasks(Vec<JoinHandle<()>>);

impl Drop for UnitTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

struct UnitSlot {
    sub_question: SubQuestion,
    receiver: mpsc::UnboundedReceiver<UnitEvent>,
    result: Option<ResearchUnitResult>,
}

pub struct ResearchSupervisor {
    llm: Arc<LLMService>,
    tools: Arc<dyn ToolExecutor>,
    max_concurrent_units: usize,
    max_tool_calls_per_unit: usize,
    poll_interval: Duration,
}

impl ResearchSupervisor {
    pub fn new(llm: Arc<LLMService>, tools: Arc<dyn ToolExecutor>, config: &ResearchConfig) -> Self {
        Self {
            llm,
            tools,
            max_concurrent_units: config.max_concurrent_units.max(1),
            max_tool_calls_per_unit: config.max_tool_calls_per_unit,
            poll_interval: config.poll_interval(),
        }
    }

    /// Research every sub-question, at most `max_concurrent_units` at a time.
    ///
    /// Progress is forwarded to `events` as it arrives and a single
    /// `research_complete` event closes the pass. Results come back in
    /// priority order regardless of completion order.
    pub async fn run_units(
        &self,
        sub_questions: &[SubQuestion],
        max_tool_calls_override: Option<usize>,
        events: &mpsc::Sender<ResearchEvent>,
    ) -> AppResult<Vec<ResearchUnitResult>> {
        let mut ordered = sub_questions.to_vec();
        ordered.sort_by_key(|sq| sq.priority);

        let budget = max_tool_calls_override.unwrap_or(self.max_tool_calls_per_unit);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_units));

        info!(
            units = ordered.len(),
            max_concurrent = self.max_concurrent_units,
            tool_budget = budget,
            "Starting research units"
        );

        let mut slots = Vec::with_capacity(ordered.len());
        let mut tasks = UnitTasks(Vec::with_capacity(ordered.len()));

        for sub_question in ordered {
            let (tx, rx) = mpsc::unbounded_channel();
            let unit = ResearchUnit::new(self.llm.clone(), self.tools.clone(), sub_question.clone(), budget);
            let semaphore = semaphore.clone();

            tasks.0.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                unit.run(tx).await;
            }));

            slots.push(UnitSlot {
                sub_question,
                receiver: rx,
                result: None,
            });
        }

        // On early return (caller gone) `tasks` drops and aborts the units
        self.poll_units(&mut slots, events).await?;
        drop(tasks);

        let results: Vec<ResearchUnitResult> = slots
            .into_iter()
            .filter_map(|slot| slot.result)
            .collect();

        emit(
            events,
            ResearchEvent::Complete {
                results: results.clone(),
            },
        )
        .await?;

        Ok(results)
    }

    async fn poll_units(
        &self,
        slots: &mut [UnitSlot],
        events: &mpsc::Sender<ResearchEvent>,
    ) -> AppResult<()> {
        let total = slots.len();
        let mut completed = 0;

        while completed < total {
            for (unit_index, slot) in slots.iter_mut().enumerate() {
                if slot.result.is_some() {
                    continue;
                }

                loop {
                    let (status, message) = match slot.receiver.try_recv() {
                        Ok(UnitEvent::Started) => (UnitStatus::Started, None),
                        Ok(UnitEvent::Progress { message }) => (UnitStatus::Working, Some(message)),
                        Ok(UnitEvent::Complete(result)) => {
                            let status = if result.error.is_some() {
                                UnitStatus::Failed
                            } else {
                                UnitStatus::Completed
                            };
                            let message = result.error.clone();
                            slot.result = Some(result);
                            completed += 1;
                            (status, message)
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            // Sender dropped without a Complete: the task panicked
                            warn!(question = %slot.sub_question.question, "Research unit ended without a result");
                            let error = "Research unit terminated unexpectedly".to_string();
                            slot.result = Some(ResearchUnitResult::failed(
                                slot.sub_question.clone(),
                                error.clone(),
                                0,
                            ));
                            completed += 1;
                            (UnitStatus::Failed, Some(error))
                        }
                    };

                    emit(
                        events,
                        ResearchEvent::Progress {
                            unit_index,
                            completed,
                            total,
                            status,
                            sub_question: slot.sub_question.question.clone(),
                            message,
                        },
                    )
                    .await?;

                    if slot.result.is_some() {
                        break;
                    }
                }
            }

            if completed < total {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        debug!(total, "All research units reported");
        Ok(())
    }
}
