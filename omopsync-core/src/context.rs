//! Wiring of the pipeline components from a loaded configuration.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::artifacts::ArtifactStore;
use crate::config::SyncConfig;
use crate::error::StorageError;
use crate::executor::BackgroundExecutor;
use crate::pipeline::{ConfiguredStages, PipelineOrchestrator, StageJobFactory};
use crate::query::QueryEngine;
use crate::schema::SchemaManager;
use crate::storage::{Database, WriterLock};

/// Every component a tool handler may reach, built once at startup.
pub struct PipelineContext {
    pub config: SyncConfig,
    pub db: Database,
    pub schemas: Arc<SchemaManager>,
    pub queries: QueryEngine,
    pub artifacts: ArtifactStore,
    pub executor: BackgroundExecutor,
    pub orchestrator: PipelineOrchestrator,
}

impl PipelineContext {
    /// Build the context with the configured stage jobs.
    pub fn from_config(config: SyncConfig) -> Result<Self, StorageError> {
        let db = Database::open(&config.storage)?;
        let stages = Arc::new(ConfiguredStages::new(db.clone(), config.pipeline.clone()));
        Self::assemble(config, db, stages)
    }

    /// Build the context with a custom stage job factory.
    pub fn with_stage_jobs(
        config: SyncConfig,
        stages: Arc<dyn StageJobFactory>,
    ) -> Result<Self, StorageError> {
        let db = Database::open(&config.storage)?;
        Self::assemble(config, db, stages)
    }

    fn assemble(
        config: SyncConfig,
        db: Database,
        stages: Arc<dyn StageJobFactory>,
    ) -> Result<Self, StorageError> {
        let writer: WriterLock = Arc::new(tokio::sync::Mutex::new(()));
        let schemas = Arc::new(SchemaManager::new(db.clone()));
        let executor = BackgroundExecutor::new();
        let orchestrator = PipelineOrchestrator::new(
            schemas.clone(),
            executor.clone(),
            stages,
            writer.clone(),
            config.pipeline.log_excerpt_bytes,
        );
        let queries = QueryEngine::new(db.clone(), writer, config.pipeline.sql_dir.clone());
        let artifacts = ArtifactStore::new(config.artifacts.output_dir.clone());

        info!(
            data_dir = %db.data_dir().display(),
            output_dir = %artifacts.output_dir().display(),
            "Pipeline context ready"
        );
        Ok(Self {
            config,
            db,
            schemas,
            queries,
            artifacts,
            executor,
            orchestrator,
        })
    }

    /// How long pipeline tools wait before answering that work continues.
    pub fn pipeline_wait(&self) -> Duration {
        Duration::from_secs(self.config.pipeline.wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_config_opens_storage() {
        let dir = TempDir::new().unwrap();
        let mut config = SyncConfig::default();
        config.resolve_paths(dir.path());
        config.pipeline.wait_secs = 3;

        let ctx = PipelineContext::from_config(config).unwrap();
        assert!(ctx.db.data_dir().starts_with(dir.path()));
        assert_eq!(ctx.artifacts.output_dir(), dir.path().join("analysis"));
        assert_eq!(ctx.pipeline_wait(), Duration::from_secs(3));
        assert_eq!(ctx.schemas.missing().unwrap().len(), 3);
    }
}
