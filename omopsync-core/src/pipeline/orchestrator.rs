//! Pipeline orchestrator: sequences stages, enforces preconditions, and owns run state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, StorageError};
use crate::executor::{BackgroundExecutor, JobStatus};
use crate::pipeline::stages::StageJobFactory;
use crate::pipeline::types::{PipelineRun, Stage};
use crate::schema::{EnsureReport, SchemaManager};
use crate::storage::WriterLock;

/// Stages advanced by `run_etl`.
pub const ETL_STAGES: &[Stage] = &[Stage::Ingested, Stage::Mapped];

/// Every stage after schema creation.
pub const REMAINING_STAGES: &[Stage] = &[
    Stage::Ingested,
    Stage::Mapped,
    Stage::Characterized,
    Stage::QualityChecked,
];

#[derive(Default)]
struct RunStore {
    runs: HashMap<Uuid, PipelineRun>,
    order: Vec<Uuid>,
    active: Option<Uuid>,
}

impl RunStore {
    fn insert(&mut self, run: PipelineRun) -> Uuid {
        let id = run.id;
        self.order.push(id);
        self.runs.insert(id, run);
        self.active = Some(id);
        id
    }

    fn active(&self) -> Option<&PipelineRun> {
        self.active.and_then(|id| self.runs.get(&id))
    }
}

/// Snapshot of every run known to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<PipelineRun>,
    pub runs: Vec<PipelineRun>,
}

/// Result of asking the orchestrator to advance a run.
pub enum AdvanceOutcome {
    /// Work was claimed and handed to a driver task.
    Started(StageTicket),
    /// Every requested stage had already succeeded, or the run is complete.
    Skipped(PipelineRun),
}

/// Completion signal for a claimed stage group.
pub struct StageTicket {
    pub run_id: Uuid,
    pub stages: Vec<Stage>,
    completion: oneshot::Receiver<Result<PipelineRun, PipelineError>>,
}

impl StageTicket {
    /// Wait for the driver to finish the claimed stages.
    pub async fn wait(self) -> Result<PipelineRun, PipelineError> {
        let stage = self.stages.last().copied().unwrap_or(Stage::SchemasReady);
        self.completion
            .await
            .unwrap_or_else(|_| {
                Err(PipelineError::StageFailed {
                    stage: stage.to_string(),
                    message: "pipeline driver stopped unexpectedly".into(),
                    log_excerpt: String::new(),
                })
            })
    }
}

/// Owns pipeline run lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    schemas: Arc<SchemaManager>,
    executor: BackgroundExecutor,
    jobs: Arc<dyn StageJobFactory>,
    writer: WriterLock,
    store: Arc<Mutex<RunStore>>,
    excerpt_bytes: usize,
}

impl PipelineOrchestrator {
    pub fn new(
        schemas: Arc<SchemaManager>,
        executor: BackgroundExecutor,
        jobs: Arc<dyn StageJobFactory>,
        writer: WriterLock,
        excerpt_bytes: usize,
    ) -> Self {
        Self {
            schemas,
            executor,
            jobs,
            writer,
            store: Arc::new(Mutex::new(RunStore::default())),
            excerpt_bytes,
        }
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    /// A fresh run, with `SchemasReady` pre-marked when every namespace exists.
    fn fresh_run(&self) -> Result<PipelineRun, StorageError> {
        let mut run = PipelineRun::new();
        if self.schemas.missing()?.is_empty() {
            run.mark_succeeded(
                Stage::SchemasReady,
                "namespaces already present".into(),
                None,
            );
        }
        Ok(run)
    }

    fn active_or_create<'a>(
        &self,
        store: &'a mut RunStore,
    ) -> Result<&'a mut PipelineRun, StorageError> {
        let id = match store.active {
            Some(id) if store.runs.contains_key(&id) => id,
            _ => store.insert(self.fresh_run()?),
        };
        store.runs.get_mut(&id).ok_or(StorageError::LockPoisoned)
    }

    /// Begin a new run; earlier runs stay queryable.
    pub async fn start_run(&self) -> Result<PipelineRun, PipelineError> {
        let mut store = self.store.lock().await;
        if let Some(active) = store.active() {
            if let Some(stage) = active.in_flight.first() {
                return Err(PipelineError::InProgress {
                    stage: stage.to_string(),
                    run_id: active.id,
                });
            }
        }
        let run = self.fresh_run()?;
        info!(run_id = %run.id, "Started pipeline run");
        store.insert(run.clone());
        Ok(run)
    }

    /// Create or verify every namespace and mark `SchemasReady` on the active run.
    pub async fn ensure_schemas(&self) -> Result<(EnsureReport, PipelineRun), PipelineError> {
        let schemas = self.schemas.clone();
        let report = tokio::task::spawn_blocking(move || schemas.ensure_namespaces())
            .await
            .map_err(|e| PipelineError::StageFailed {
                stage: Stage::SchemasReady.to_string(),
                message: format!("schema task failed: {e}"),
                log_excerpt: String::new(),
            })??;

        let mut store = self.store.lock().await;
        let run = self.active_or_create(&mut store)?;
        if !run.has_succeeded(Stage::SchemasReady) {
            run.mark_succeeded(Stage::SchemasReady, report.summary(), None);
        }
        info!(run_id = %run.id, created = report.created().len(), "Namespaces ensured");
        Ok((report, run.clone()))
    }

    /// Claim the not-yet-succeeded stages among `stages` and drive them in the background.
    ///
    /// Fails without side effects when another call is driving the run or a
    /// stage's prerequisite has not succeeded.
    pub async fn advance(&self, stages: &[Stage]) -> Result<AdvanceOutcome, PipelineError> {
        let mut store = self.store.lock().await;
        let run = self.active_or_create(&mut store)?;

        if let Some(stage) = run.in_flight.first() {
            return Err(PipelineError::InProgress {
                stage: stage.to_string(),
                run_id: run.id,
            });
        }
        if run.is_complete() {
            return Ok(AdvanceOutcome::Skipped(run.clone()));
        }

        let pending: Vec<Stage> = stages
            .iter()
            .copied()
            .filter(|stage| !run.has_succeeded(*stage))
            .collect();
        if pending.is_empty() {
            return Ok(AdvanceOutcome::Skipped(run.clone()));
        }

        for (idx, stage) in pending.iter().enumerate() {
            if let Some(required) = stage.requires() {
                if !run.has_succeeded(required) && !pending[..idx].contains(&required) {
                    return Err(PipelineError::Precondition {
                        stage: stage.to_string(),
                        required: required.to_string(),
                    });
                }
            }
        }

        run.in_flight = pending.clone();
        run.refresh();
        let run_id = run.id;
        drop(store);

        info!(%run_id, stages = ?pending, "Advancing pipeline run");
        let (tx, rx) = oneshot::channel();
        let driver = self.clone();
        let claimed = pending.clone();
        tokio::spawn(async move {
            let result = driver.drive(run_id, claimed).await;
            let _ = tx.send(result);
        });

        Ok(AdvanceOutcome::Started(StageTicket {
            run_id,
            stages: pending,
            completion: rx,
        }))
    }

    /// Ensure schemas, then advance every remaining stage.
    pub async fn run_all(&self) -> Result<AdvanceOutcome, PipelineError> {
        self.ensure_schemas().await?;
        self.advance(REMAINING_STAGES).await
    }

    async fn drive(&self, run_id: Uuid, stages: Vec<Stage>) -> Result<PipelineRun, PipelineError> {
        let _writer = self.writer.lock().await;

        for stage in stages {
            let job = match self.jobs.build(stage, run_id) {
                Ok(job) => job,
                Err(e) => {
                    self.finish_failed(run_id, stage, e.to_string(), String::new())
                        .await;
                    return Err(e);
                }
            };

            let mut handle = self.executor.submit(job);
            self.update(run_id, |run| run.mark_running(stage, Some(handle.id())))
                .await;

            let status = handle.wait().await;
            let excerpt = handle.log().excerpt(self.excerpt_bytes);
            match status {
                JobStatus::Succeeded { output } => {
                    info!(%run_id, %stage, "Stage succeeded");
                    let excerpt = (!excerpt.is_empty()).then_some(excerpt);
                    self.update(run_id, |run| run.mark_succeeded(stage, output, excerpt))
                        .await;
                }
                JobStatus::Failed { error } => {
                    warn!(%run_id, %stage, %error, "Stage failed");
                    self.finish_failed(run_id, stage, error.clone(), excerpt.clone())
                        .await;
                    return Err(PipelineError::StageFailed {
                        stage: stage.to_string(),
                        message: error,
                        log_excerpt: excerpt,
                    });
                }
                JobStatus::Pending | JobStatus::Running => {
                    let error = "job ended without a terminal status".to_string();
                    self.finish_failed(run_id, stage, error.clone(), excerpt.clone())
                        .await;
                    return Err(PipelineError::StageFailed {
                        stage: stage.to_string(),
                        message: error,
                        log_excerpt: excerpt,
                    });
                }
            }
        }

        let run = self.update(run_id, PipelineRun::release).await;
        run.ok_or(PipelineError::RunNotFound { run_id })
    }

    async fn finish_failed(&self, run_id: Uuid, stage: Stage, error: String, excerpt: String) {
        self.update(run_id, |run| {
            run.mark_failed(stage, error, excerpt);
            run.release();
        })
        .await;
    }

    async fn update<F>(&self, run_id: Uuid, f: F) -> Option<PipelineRun>
    where
        F: FnOnce(&mut PipelineRun),
    {
        let mut store = self.store.lock().await;
        let run = store.runs.get_mut(&run_id)?;
        f(run);
        Some(run.clone())
    }

    pub async fn run(&self, run_id: Uuid) -> Result<PipelineRun, PipelineError> {
        let store = self.store.lock().await;
        store
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(PipelineError::RunNotFound { run_id })
    }

    pub async fn active_run(&self) -> Option<PipelineRun> {
        self.store.lock().await.active().cloned()
    }

    /// The active run and every run, oldest first.
    pub async fn status(&self) -> PipelineStatus {
        let store = self.store.lock().await;
        PipelineStatus {
            active: store.active().cloned(),
            runs: store
                .order
                .iter()
                .filter_map(|id| store.runs.get(id).cloned())
                .collect(),
        }
    }
}
