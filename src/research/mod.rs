//! Research pipeline: shared types, the event protocol, research units and
//! their supervisor, and the orchestrator that runs the phases.

pub mod events;
pub mod orchestrator;
pub mod source_index;
pub mod supervisor;
pub mod types;
pub mod unit;

pub use events::{ResearchEvent, UnitEvent, UnitStatus};
pub use orchestrator::ResearchOrchestrator;
pub use source_index::{collect_all_notes, SourceIndex};
pub use supervisor::ResearchSupervisor;
pub use types::{
    CompressedFindings, Reference, ResearchOutline, ResearchPhase, ResearchState, ResearchUnitResult,
    RunStats, SourceIndexEntry, SourceNote, SubQuestion,
};
pub use unit::ResearchUnit;
