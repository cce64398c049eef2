//! Namespace tool: idempotent creation and check of raw, mapped, and results.

use async_trait::async_trait;
use omopsync_core::PipelineContext;
use omopsync_core::error::ToolError;
use omopsync_core::types::ToolOutput;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{Tool, ToolReply};

const TOOL_NAME: &str = "ensure_schemas";

pub struct EnsureSchemasTool {
    ctx: Arc<PipelineContext>,
}

impl EnsureSchemasTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for EnsureSchemasTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Create the raw, mapped (cdm), and results namespaces if they are missing. \
         Safe to call repeatedly; marks the active pipeline run as SchemasReady."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let (report, run) = self.ctx.orchestrator.ensure_schemas().await?;
        let text = format!("Namespaces ready for run {}: {}", run.id, report.summary());
        Ok(ToolOutput::text(text)
            .with_data(json!({
                "run_id": run.id,
                "namespaces": report.namespaces,
            }))
            .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}
