//! Error types for the OMOPSync core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering configuration, storage, queries, artifacts, background jobs, the
//! pipeline, and tool execution. Every error maps onto a stable [`ErrorKind`]
//! so callers across the tool boundary can branch on it without parsing text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Machine-checkable error category carried by every error block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    ConnectionError,
    ValidationError,
    PreconditionError,
    AlreadyInProgress,
    PipelineStageError,
    QueryError,
    NotFound,
    Timeout,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::PreconditionError => "precondition_error",
            ErrorKind::AlreadyInProgress => "already_in_progress",
            ErrorKind::PipelineStageError => "pipeline_stage_error",
            ErrorKind::QueryError => "query_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the OMOPSync core library.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Config(_) => ErrorKind::ConfigurationError,
            SyncError::Storage(e) => e.kind(),
            SyncError::Query(e) => e.kind(),
            SyncError::Artifact(e) => e.kind(),
            SyncError::Job(_) => ErrorKind::PipelineStageError,
            SyncError::Pipeline(e) => e.kind(),
            SyncError::Io(_) | SyncError::Serialization(_) => ErrorKind::InternalError,
        }
    }
}

/// Errors from the configuration system. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot open storage at {path}: {message}")]
    Connection { path: PathBuf, message: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Connection { .. } => ErrorKind::ConnectionError,
            StorageError::Sqlite(_) => ErrorKind::QueryError,
            StorageError::Io(_) | StorageError::LockPoisoned => ErrorKind::InternalError,
        }
    }
}

/// Errors from free-form query execution.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query is empty")]
    Empty,

    #[error("only a single statement may be executed per query")]
    MultipleStatements,

    #[error("statement is not read-only: {reason}")]
    NotReadOnly { reason: String },

    #[error("{message}")]
    Driver { message: String },

    #[error("script not found: {path}")]
    ScriptNotFound { path: PathBuf },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::ScriptNotFound { .. } => ErrorKind::ValidationError,
            QueryError::Storage(e) => e.kind(),
            _ => ErrorKind::QueryError,
        }
    }
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        QueryError::Driver {
            message: err.to_string(),
        }
    }
}

/// Errors from artifact rendering and persistence.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("unsupported chart type '{chart_type}' (expected one of: {expected})")]
    UnsupportedChartType { chart_type: String, expected: String },

    #[error("chart type '{chart_type}' requires '{field}'")]
    MissingField { chart_type: String, field: String },

    #[error("field '{field}' is not a result column (columns: {columns})")]
    UnknownColumn { field: String, columns: String },

    #[error("column '{field}' holds a non-numeric value in row {row}")]
    NonNumeric { field: String, row: usize },

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::Write { .. } => ErrorKind::InternalError,
            _ => ErrorKind::ValidationError,
        }
    }
}

/// Errors from the background executor.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to start job '{name}': {message}")]
    Spawn { name: String, message: String },

    #[error("job '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("job '{name}' was abandoned before completion")]
    Abandoned { name: String },
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage '{stage}' requires '{required}' to have succeeded first")]
    Precondition { stage: String, required: String },

    #[error("stage '{stage}' is already in progress for run {run_id}")]
    InProgress { stage: String, run_id: uuid::Uuid },

    #[error("stage '{stage}' failed: {message}")]
    StageFailed {
        stage: String,
        message: String,
        log_excerpt: String,
    },

    #[error("pipeline run not found: {run_id}")]
    RunNotFound { run_id: uuid::Uuid },

    #[error("stage '{stage}' has no background job; it is reached through ensure_schemas")]
    NoStageJob { stage: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Precondition { .. } => ErrorKind::PreconditionError,
            PipelineError::InProgress { .. } => ErrorKind::AlreadyInProgress,
            PipelineError::StageFailed { .. } => ErrorKind::PipelineStageError,
            PipelineError::RunNotFound { .. } => ErrorKind::NotFound,
            PipelineError::NoStageJob { .. } => ErrorKind::ValidationError,
            PipelineError::Storage(e) => e.kind(),
        }
    }
}

/// Errors from tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Invalid schema for tool '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("Tool '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Tool '{name}' panicked")]
    Panicked { name: String },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::NotFound { .. } => ErrorKind::NotFound,
            ToolError::InvalidArguments { .. } => ErrorKind::ValidationError,
            ToolError::AlreadyRegistered { .. }
            | ToolError::InvalidSchema { .. }
            | ToolError::Panicked { .. } => ErrorKind::InternalError,
            ToolError::Timeout { .. } => ErrorKind::Timeout,
            ToolError::Sync(e) => e.kind(),
        }
    }
}

macro_rules! tool_error_from {
    ($($source:ty),*) => {
        $(impl From<$source> for ToolError {
            fn from(err: $source) -> Self {
                ToolError::Sync(err.into())
            }
        })*
    };
}

tool_error_from!(
    StorageError,
    QueryError,
    ArtifactError,
    JobError,
    PipelineError
);

/// A type alias for results using the top-level `SyncError`.
pub type Result<T> = std::result::Result<T, SyncError>;
