//! SQL tools: read-only queries, JSON exports, and script application.

use async_trait::async_trait;
use omopsync_core::PipelineContext;
use omopsync_core::error::ToolError;
use omopsync_core::query::QueryResult;
use omopsync_core::types::ToolOutput;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{Tool, ToolReply};

fn sql_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "minLength": 1,
                "description": "A single read-only statement (SELECT, WITH, VALUES, or EXPLAIN). \
                                Tables are addressed as raw.<table>, cdm.<table>, results.<table>."
            }
        },
        "required": ["sql"],
        "additionalProperties": false
    })
}

fn sql_arg(args: &serde_json::Value) -> &str {
    args["sql"].as_str().unwrap_or_default()
}

fn result_data(result: &QueryResult) -> serde_json::Value {
    json!({
        "columns": result.columns,
        "rows": result.rows,
        "row_count": result.row_count(),
    })
}

pub struct QueryDatabaseTool {
    ctx: Arc<PipelineContext>,
}

impl QueryDatabaseTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for QueryDatabaseTool {
    fn name(&self) -> &str {
        "query_database"
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query against the pipeline database and return the rows. \
         Statements that modify data or schema are rejected."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        sql_schema()
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let result = self.ctx.queries.execute(sql_arg(&args)).await?;
        let preview = result.preview(self.ctx.config.artifacts.preview_rows);
        Ok(ToolOutput::text(preview)
            .with_data(result_data(&result))
            .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}

/// Runs a read-only query and saves the rows as a JSON artifact.
pub struct ExportQueryTool {
    ctx: Arc<PipelineContext>,
}

impl ExportQueryTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ExportQueryTool {
    fn name(&self) -> &str {
        "export_query"
    }

    fn description(&self) -> &str {
        "Run a read-only SQL query and save the full result as a JSON file in the \
         analysis output directory. Returns the file path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        sql_schema()
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let sql = sql_arg(&args).to_string();
        let result = self.ctx.queries.execute(&sql).await?;

        let ctx = self.ctx.clone();
        let rows = result.row_count();
        let artifact =
            tokio::task::spawn_blocking(move || ctx.artifacts.write_result_export(&result, &sql))
                .await
                .map_err(|_| ToolError::Panicked {
                    name: self.name().to_string(),
                })??;

        Ok(ToolOutput::text(format!(
            "Exported {rows} rows to {}",
            artifact.file_name()
        ))
        .with_file(&artifact.path)
        .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}

/// Applies a DDL/DML script under the pipeline writer lock.
pub struct RunSqlFileTool {
    ctx: Arc<PipelineContext>,
}

impl RunSqlFileTool {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for RunSqlFileTool {
    fn name(&self) -> &str {
        "run_sql_file"
    }

    fn description(&self) -> &str {
        "Execute a SQL script from disk in one transaction. Relative paths resolve \
         against the configured SQL directory. A failing statement rolls back the \
         whole script. Waits for any running pipeline stage to finish first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "filepath": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Path of the .sql script"
                }
            },
            "required": ["filepath"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolReply, ToolError> {
        let filepath = args["filepath"].as_str().unwrap_or_default();
        let outcome = self.ctx.queries.apply_script(filepath).await?;
        Ok(ToolOutput::text(format!(
            "Applied {} ({} statements)",
            outcome.path.display(),
            outcome.statements
        ))
        .with_data(serde_json::to_value(&outcome).unwrap_or_default())
        .into())
    }

    fn timeout(&self) -> Duration {
        crate::tool_timeout(&self.ctx)
    }
}
