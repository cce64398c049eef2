//! Plot tool: query, validate the chart request, and write an HTML chart.

use async_trait::async_trait;
use omopsync_core::PipelineContext;
use omopsync_core::artifacts::{ChartRequest, ChartType};
use omopsync_core::error::ToolError;
use omopsync_core::types::ToolOutput;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{Tool, ToolReply};

const TOOL_NAME: &str = "plot_query";

pub struct PlotQueryTool {
    ctx: Arc<PipelineContext>,
}

impl PlotQueryTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for PlotQueryTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query and render the rows as a self-contained HTML chart. \
         line, bar, scatter, pie, and heatmap need xField and yField; histogram needs \
         only xField. Returns the path of the written file."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let types: Vec<&str> = ChartType::ALL.iter().map(ChartType::as_str).collect();
        json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "minLength": 1,
                    "description": "A single read-only statement producing the chart data"
                },
                "chartType": {
                    "type": "string",
                    "description": format!("One of: {}", types.join(", "))
                },
                "xField": {
                    "type": "string",
                    "description": "Column for the x axis (categories or values)"
                },
                "yField": {
                    "type": "string",
                    "description": "Numeric column for the y axis"
                }
            },
            "required": ["sql", "chartType"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let sql = args["sql"].as_str().unwrap_or_default().to_string();
        let request = ChartRequest::new(
            args["chartType"].as_str().unwrap_or_default(),
            args["xField"].as_str(),
            args["yField"].as_str(),
        )?;

        let result = self.ctx.queries.execute(&sql).await?;
        let rows = result.row_count();

        let ctx = self.ctx.clone();
        let render = request.clone();
        let artifact =
            tokio::task::spawn_blocking(move || ctx.artifacts.render_chart(&result, &render, &sql))
                .await
                .map_err(|_| ToolError::Panicked {
                    name: TOOL_NAME.to_string(),
                })??;

        Ok(ToolOutput::text(format!(
            "Rendered a {} chart of {rows} rows to {}",
            request.chart_type,
            artifact.file_name()
        ))
        .with_file(&artifact.path)
        .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}
