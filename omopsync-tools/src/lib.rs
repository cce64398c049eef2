//! # OMOPSync Tools
//!
//! The tool layer for OMOPSync: the `Tool` trait, the static registry with
//! compiled argument schemas, the dispatcher that normalizes every call into
//! response blocks, and the pipeline, SQL, and plot tools.

pub mod dispatcher;
pub mod pipeline;
pub mod plot;
pub mod registry;
pub mod schema;
pub mod sql;

use dispatcher::ToolDispatcher;
use omopsync_core::PipelineContext;
use pipeline::StageGroup;
use registry::{Tool, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Register every pipeline tool against the shared context.
pub fn register_pipeline_tools(registry: &mut ToolRegistry, ctx: Arc<PipelineContext>) {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(schema::EnsureSchemasTool::new(ctx.clone())),
        Arc::new(pipeline::StageTool::new(ctx.clone(), StageGroup::Etl)),
        Arc::new(pipeline::StageTool::new(
            ctx.clone(),
            StageGroup::Characterization,
        )),
        Arc::new(pipeline::StageTool::new(
            ctx.clone(),
            StageGroup::QualityChecks,
        )),
        Arc::new(pipeline::StageTool::new(ctx.clone(), StageGroup::All)),
        Arc::new(pipeline::StartRunTool::new(ctx.clone())),
        Arc::new(pipeline::PipelineStatusTool::new(ctx.clone())),
        Arc::new(sql::QueryDatabaseTool::new(ctx.clone())),
        Arc::new(sql::ExportQueryTool::new(ctx.clone())),
        Arc::new(sql::RunSqlFileTool::new(ctx.clone())),
        Arc::new(plot::PlotQueryTool::new(ctx)),
    ];

    for tool in tools {
        if let Err(e) = registry.register(tool) {
            tracing::warn!("Failed to register tool: {}", e);
        }
    }
}

/// Build the registry once and wrap it in a dispatcher.
pub fn build_dispatcher(ctx: Arc<PipelineContext>) -> ToolDispatcher {
    let mut registry = ToolRegistry::new();
    register_pipeline_tools(&mut registry, ctx);
    tracing::debug!(tools = registry.len(), "Tool registry built");
    ToolDispatcher::new(Arc::new(registry))
}

pub(crate) fn tool_timeout(ctx: &PipelineContext) -> Duration {
    Duration::from_secs(ctx.config.server.tool_timeout_secs)
}
