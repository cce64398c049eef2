//! Pipeline run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SchemasReady,
    Ingested,
    Mapped,
    Characterized,
    QualityChecked,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::SchemasReady,
        Stage::Ingested,
        Stage::Mapped,
        Stage::Characterized,
        Stage::QualityChecked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SchemasReady => "schemas_ready",
            Stage::Ingested => "ingested",
            Stage::Mapped => "mapped",
            Stage::Characterized => "characterized",
            Stage::QualityChecked => "quality_checked",
        }
    }

    /// The stage that must have succeeded before this one may start.
    ///
    /// Quality checks read only the mapped data, so they do not wait on
    /// characterization.
    pub fn requires(&self) -> Option<Stage> {
        match self {
            Stage::SchemasReady => None,
            Stage::Ingested => Some(Stage::SchemasReady),
            Stage::Mapped => Some(Stage::Ingested),
            Stage::Characterized => Some(Stage::Mapped),
            Stage::QualityChecked => Some(Stage::Mapped),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where a run stands as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    NotStarted,
    SchemasReady,
    Ingested,
    Mapped,
    Characterized,
    QualityChecked,
    Complete,
    Failed,
}

impl From<Stage> for RunPhase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::SchemasReady => RunPhase::SchemasReady,
            Stage::Ingested => RunPhase::Ingested,
            Stage::Mapped => RunPhase::Mapped,
            Stage::Characterized => RunPhase::Characterized,
            Stage::QualityChecked => RunPhase::QualityChecked,
        }
    }
}

/// The record of one stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    fn running() -> Self {
        Self {
            status: RunStatus::Running,
            job_id: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            output: None,
            log_excerpt: None,
            error: None,
        }
    }
}

/// State of one pipeline run. Owned by the orchestrator's run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub status: RunStatus,
    /// The furthest stage that has succeeded.
    pub current_stage: Option<Stage>,
    pub phase: RunPhase,
    pub stages: BTreeMap<Stage, StageRecord>,
    /// Stages claimed by the call currently driving this run.
    pub in_flight: Vec<Stage>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            current_stage: None,
            phase: RunPhase::NotStarted,
            stages: BTreeMap::new(),
            in_flight: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            log_excerpt: None,
            error: None,
        }
    }

    pub fn stage_status(&self, stage: Stage) -> Option<RunStatus> {
        self.stages.get(&stage).map(|record| record.status)
    }

    pub fn has_succeeded(&self, stage: Stage) -> bool {
        self.stage_status(stage) == Some(RunStatus::Succeeded)
    }

    /// Every stage has succeeded.
    pub fn is_complete(&self) -> bool {
        Stage::ALL.iter().all(|stage| self.has_succeeded(*stage))
    }

    pub fn is_busy(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn mark_running(&mut self, stage: Stage, job_id: Option<Uuid>) {
        let mut record = StageRecord::running();
        record.job_id = job_id;
        self.stages.insert(stage, record);
        self.refresh();
    }

    pub fn mark_succeeded(&mut self, stage: Stage, output: String, log_excerpt: Option<String>) {
        let record = self.stages.entry(stage).or_insert_with(StageRecord::running);
        record.status = RunStatus::Succeeded;
        record.completed_at = Some(Utc::now());
        record.output = Some(output);
        record.log_excerpt = log_excerpt;
        record.error = None;
        self.refresh();
    }

    pub fn mark_failed(&mut self, stage: Stage, error: String, log_excerpt: String) {
        let record = self.stages.entry(stage).or_insert_with(StageRecord::running);
        record.status = RunStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.error = Some(error.clone());
        record.log_excerpt = Some(log_excerpt.clone());
        self.error = Some(format!("stage '{stage}' failed: {error}"));
        self.log_excerpt = Some(log_excerpt);
        self.refresh();
    }

    /// Release the stages claimed by the driving call.
    pub fn release(&mut self) {
        self.in_flight.clear();
        self.refresh();
    }

    /// Recompute the derived fields from the stage records.
    pub fn refresh(&mut self) {
        self.current_stage = Stage::ALL
            .iter()
            .rev()
            .find(|stage| self.has_succeeded(**stage))
            .copied();

        let failed = self
            .stages
            .values()
            .any(|record| record.status == RunStatus::Failed);
        let running = self
            .stages
            .values()
            .any(|record| record.status == RunStatus::Running);

        self.status = if failed {
            RunStatus::Failed
        } else if running || self.is_busy() {
            RunStatus::Running
        } else if self.is_complete() {
            RunStatus::Succeeded
        } else {
            RunStatus::Pending
        };

        if !failed {
            self.error = None;
        }
        if self.status == RunStatus::Succeeded && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }

        self.phase = if failed {
            RunPhase::Failed
        } else if self.is_complete() {
            RunPhase::Complete
        } else {
            self.current_stage
                .map(RunPhase::from)
                .unwrap_or(RunPhase::NotStarted)
        };
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_prerequisites() {
        assert_eq!(Stage::SchemasReady.requires(), None);
        assert_eq!(Stage::Ingested.requires(), Some(Stage::SchemasReady));
        assert_eq!(Stage::QualityChecked.requires(), Some(Stage::Mapped));
        assert_eq!(Stage::QualityChecked.to_string(), "quality_checked");
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = PipelineRun::new();
        assert_eq!(run.phase, RunPhase::NotStarted);

        run.mark_succeeded(Stage::SchemasReady, "ok".into(), None);
        assert_eq!(run.current_stage, Some(Stage::SchemasReady));
        assert_eq!(run.status, RunStatus::Pending);

        run.in_flight = vec![Stage::Ingested];
        run.mark_running(Stage::Ingested, None);
        assert_eq!(run.status, RunStatus::Running);

        run.mark_failed(Stage::Ingested, "no csv".into(), "log tail".into());
        run.release();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(run.log_excerpt.as_deref(), Some("log tail"));
        assert!(run.error.as_deref().unwrap().contains("no csv"));

        // re-invocation claims the stages again and clears the failure
        run.in_flight = Stage::ALL[1..].to_vec();
        run.mark_running(Stage::Ingested, None);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.error.is_none());

        for stage in &Stage::ALL[1..] {
            run.mark_succeeded(*stage, "ok".into(), None);
        }
        assert_eq!(run.status, RunStatus::Running);
        run.release();
        assert!(run.is_complete());
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.phase, RunPhase::Complete);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_run_serializes_stage_keys() {
        let mut run = PipelineRun::new();
        run.mark_succeeded(Stage::SchemasReady, "ok".into(), None);
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["stages"]["schemas_ready"]["status"], "succeeded");
        assert_eq!(value["phase"], "schemas_ready");
    }
}
