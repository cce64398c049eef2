//! Pipeline tools: advance stages in the background and report run status.

use async_trait::async_trait;
use futures::FutureExt;
use omopsync_core::PipelineContext;
use omopsync_core::error::ToolError;
use omopsync_core::pipeline::{
    AdvanceOutcome, ETL_STAGES, PipelineRun, REMAINING_STAGES, Stage, StageTicket,
};
use omopsync_core::types::ToolOutput;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::registry::{PendingWork, Synchronicity, Tool, ToolReply};

/// Which stages a [`StageTool`] advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGroup {
    Etl,
    Characterization,
    QualityChecks,
    /// Ensure schemas first, then every remaining stage.
    All,
}

impl StageGroup {
    pub fn tool_name(&self) -> &'static str {
        match self {
            StageGroup::Etl => "run_etl",
            StageGroup::Characterization => "run_characterization",
            StageGroup::QualityChecks => "run_quality_checks",
            StageGroup::All => "run_all",
        }
    }

    pub fn stages(&self) -> &'static [Stage] {
        match self {
            StageGroup::Etl => ETL_STAGES,
            StageGroup::Characterization => &[Stage::Characterized],
            StageGroup::QualityChecks => &[Stage::QualityChecked],
            StageGroup::All => REMAINING_STAGES,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            StageGroup::Etl => {
                "Load the source files into the raw namespace and map them into the \
                 cdm namespace (stages Ingested and Mapped). Requires ensure_schemas. \
                 Runs in the background; poll pipeline_status if it outlasts the wait."
            }
            StageGroup::Characterization => {
                "Compute table and column statistics over the cdm namespace into \
                 results.characterization. Requires run_etl."
            }
            StageGroup::QualityChecks => {
                "Run the data-quality rule suite over the cdm namespace and store the \
                 findings in results.quality_findings. Requires run_etl."
            }
            StageGroup::All => {
                "Ensure the namespaces, then run every remaining pipeline stage in \
                 order. Stages that already succeeded in the active run are skipped."
            }
        }
    }
}

/// Advances one group of pipeline stages.
pub struct StageTool {
    ctx: Arc<PipelineContext>,
    group: StageGroup,
}

impl StageTool {
    pub fn new(ctx: Arc<PipelineContext>, group: StageGroup) -> Self {
        Self { ctx, group }
    }
}

#[async_trait]
impl Tool for StageTool {
    fn name(&self) -> &str {
        self.group.tool_name()
    }

    fn description(&self) -> &str {
        self.group.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let orchestrator = &self.ctx.orchestrator;
        let outcome = match self.group {
            StageGroup::All => orchestrator.run_all().await?,
            group => orchestrator.advance(group.stages()).await?,
        };

        match outcome {
            AdvanceOutcome::Skipped(run) => {
                info!(tool = self.name(), run_id = %run.id, "Nothing to advance");
                let text = if run.is_complete() {
                    format!("Run {} is already complete ({}).", run.id, run.status)
                } else {
                    format!(
                        "{} already succeeded in run {}.",
                        stage_list(self.group.stages()),
                        run.id
                    )
                };
                Ok(ToolOutput::text(text).with_data(run_json(&run)).into())
            }
            AdvanceOutcome::Started(ticket) => Ok(ToolReply::Pending(pending(ticket))),
        }
    }

    fn synchronicity(&self) -> Synchronicity {
        Synchronicity::Background {
            wait: self.ctx.pipeline_wait(),
        }
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}

fn pending(ticket: StageTicket) -> PendingWork {
    let stages = stage_list(&ticket.stages);
    let status = json!({
        "run_id": ticket.run_id,
        "stages": &ticket.stages,
        "status": "running",
    });
    let description = format!("Stages {stages} of run {}", ticket.run_id);
    let completion = async move {
        let run = ticket.wait().await?;
        let text = format!("Stages {stages} succeeded for run {}.", run.id);
        Ok::<_, ToolError>(ToolOutput::text(text).with_data(run_json(&run)))
    }
    .boxed();
    PendingWork {
        description,
        status,
        completion,
    }
}

fn stage_list(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn run_json(run: &PipelineRun) -> serde_json::Value {
    serde_json::to_value(run).unwrap_or_default()
}

/// Begins a fresh pipeline run.
pub struct StartRunTool {
    ctx: Arc<PipelineContext>,
}

impl StartRunTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for StartRunTool {
    fn name(&self) -> &str {
        "start_run"
    }

    fn description(&self) -> &str {
        "Begin a new pipeline run so every stage executes again. Earlier runs stay \
         visible in pipeline_status. Fails while a stage is in progress."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let run = self.ctx.orchestrator.start_run().await?;
        Ok(ToolOutput::text(format!("Started pipeline run {}", run.id))
            .with_data(run_json(&run))
            .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}

/// Reports every run and the background jobs behind them.
pub struct PipelineStatusTool {
    ctx: Arc<PipelineContext>,
}

impl PipelineStatusTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for PipelineStatusTool {
    fn name(&self) -> &str {
        "pipeline_status"
    }

    fn description(&self) -> &str {
        "Show the active pipeline run, its stages and log excerpts, every earlier \
         run, and the background jobs."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let status = self.ctx.orchestrator.status().await;
        let jobs = self.ctx.executor.list();

        let text = match &status.active {
            None => "No pipeline run has started yet.".to_string(),
            Some(run) => {
                let mut text = format!("Run {}: {}", run.id, run.status);
                if let Some(stage) = run.current_stage {
                    text.push_str(&format!(", last succeeded stage {stage}"));
                }
                if run.is_busy() {
                    text.push_str(&format!(", in progress: {}", stage_list(&run.in_flight)));
                }
                if let Some(error) = &run.error {
                    text.push_str(&format!("\n{error}"));
                }
                text
            }
        };

        Ok(ToolOutput::text(text)
            .with_data(json!({
                "active": status.active,
                "runs": status.runs,
                "jobs": jobs,
            }))
            .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}
