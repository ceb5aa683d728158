//! Agent System
//!
//! Single-shot LLM steps of the research pipeline. Every agent catches its
//! own failures and returns a deterministic, non-empty fallback, so only
//! unexpected errors ever reach the orchestrator.
//!
//! - **Planning Agent**: decomposes the query into prioritized sub-questions
//! - **Compression Agent**: consolidates unit notes into cited findings and gaps
//! - **Follow-up Generator**: turns gaps into sub-questions for a second pass
//! - **Report Writer**: streams the cited report
//!
//! ## Pipeline Overview
//!
//! ```text
//! User Query
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Planning   │  → Sub-questions
//! │   Agent     │
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │ Supervisor  │  → Research units (concurrent)
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐      gaps?     ┌─────────────┐
//! │ Compression │ ─────────────▶ │  Follow-up  │ → second Supervisor pass,
//! │   Agent     │ ◀───────────── │  Generator  │   re-compress
//! └─────────────┘                └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Report    │  → Streamed, cited report
//! │   Writer    │
//! └─────────────┘
//! ```

pub mod compression;
pub mod follow_up;
pub mod planning;
pub mod report;

pub use compression::{fallback_findings, CompressionAgent, COMPRESSION_FAILED_GAP};
pub use follow_up::FollowUpGenerator;
pub use planning::{fallback_outline, PlanningAgent};
pub use report::{fallback_report, ReportWriter};
