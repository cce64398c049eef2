//! Pipeline stages, run records, and the orchestrator that sequences them.

pub mod orchestrator;
pub mod quality;
pub mod stages;
pub mod types;

pub use orchestrator::{
    AdvanceOutcome, ETL_STAGES, PipelineOrchestrator, PipelineStatus, REMAINING_STAGES,
    StageTicket,
};
pub use quality::{FindingSummary, Outcome, QualityFinding, RuleCategory};
pub use stages::{ConfiguredStages, StageJobFactory};
pub use types::{PipelineRun, RunPhase, RunStatus, Stage, StageRecord};
