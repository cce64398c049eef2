//! # OMOPSync Core
//!
//! Core library for OMOPSync, an orchestration layer for a clinical ETL
//! pipeline. Provides namespace storage, the schema manager, read-only query
//! execution, artifact rendering, background jobs, the pipeline orchestrator,
//! configuration, and the response types shared with the tool layer.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod storage;
pub mod types;

// Re-export commonly used types at the crate root.
pub use artifacts::{Artifact, ArtifactKind, ArtifactStore, ChartRequest, ChartType};
pub use config::{SyncConfig, load_config};
pub use context::PipelineContext;
pub use error::{ErrorKind, Result, SyncError, ToolError};
pub use executor::{BackgroundExecutor, Job, JobHandle, JobLog, JobRecord, JobStatus};
pub use pipeline::{
    AdvanceOutcome, PipelineOrchestrator, PipelineRun, PipelineStatus, RunStatus, Stage,
};
pub use query::{QueryEngine, QueryResult};
pub use schema::{EnsureReport, NamespaceState, SchemaManager};
pub use storage::{Database, Namespace};
pub use types::{ResponseBlock, ToolCall, ToolDefinition, ToolOutput, ToolResponse};
