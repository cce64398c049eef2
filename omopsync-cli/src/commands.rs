//! CLI subcommand handlers.

use anyhow::Context;
use omopsync_core::PipelineContext;
use omopsync_core::config::{SyncConfig, WORKSPACE_CONFIG_FILE};
use omopsync_core::pipeline::{AdvanceOutcome, PipelineRun};
use omopsync_mcp::McpServer;
use omopsync_mcp::transport::StdioTransport;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn context(config: SyncConfig) -> anyhow::Result<Arc<PipelineContext>> {
    let ctx = PipelineContext::from_config(config).context("Failed to open storage")?;
    Ok(Arc::new(ctx))
}

/// Serve every tool over MCP until the client closes stdin.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let ctx = context(config)?;
    let dispatcher = omopsync_tools::build_dispatcher(ctx.clone());
    info!(
        tools = dispatcher.registry().len(),
        "Serving OMOPSync over MCP (stdio)"
    );
    let server = McpServer::new(ctx, dispatcher);
    let mut transport = StdioTransport::new();
    server.run(&mut transport).await?;
    Ok(())
}

/// Invoke one tool and print the response blocks as JSON on stdout.
///
/// Pipeline work that outlives the tool's wait is seen through before exit.
pub async fn call(config: SyncConfig, tool: &str, args: Option<&str>) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;
    let ctx = context(config)?;
    let dispatcher = omopsync_tools::build_dispatcher(ctx.clone());

    let response = dispatcher.dispatch(tool, arguments).await;
    println!("{}", serde_json::to_string_pretty(&response.blocks)?);

    while ctx
        .orchestrator
        .active_run()
        .await
        .is_some_and(|run| run.is_busy())
    {
        info!("Waiting for background pipeline work to finish");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    match response.error_kind() {
        Some(kind) => anyhow::bail!("{tool} failed: {kind}"),
        None => Ok(()),
    }
}

/// Create the namespaces, then run every remaining stage and wait for it.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    let ctx = context(config)?;
    let orchestrator = &ctx.orchestrator;

    let (report, _) = orchestrator.ensure_schemas().await?;
    info!(namespaces = %report.summary(), "Namespaces ready");

    let run = match orchestrator.run_all().await? {
        AdvanceOutcome::Started(ticket) => {
            info!(run_id = %ticket.run_id, stages = ticket.stages.len(), "Pipeline started");
            ticket.wait().await?
        }
        AdvanceOutcome::Skipped(run) => run,
    };
    println!("{}", render_run(&run));
    Ok(())
}

pub fn list_tools(config: SyncConfig) -> anyhow::Result<()> {
    let ctx = context(config)?;
    let dispatcher = omopsync_tools::build_dispatcher(ctx);
    for def in dispatcher.registry().list_definitions() {
        println!("{:<24} {}", def.name, def.description);
    }
    Ok(())
}

pub fn init_config(workspace: &Path) -> anyhow::Result<()> {
    let config_path = workspace.join(WORKSPACE_CONFIG_FILE);
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }

    let toml_str = toml::to_string_pretty(&SyncConfig::default())?;
    std::fs::write(&config_path, &toml_str)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

pub fn show_config(config: &SyncConfig) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// `--args` must be a JSON object; absent means no arguments.
fn parse_arguments(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(value)
}

fn render_run(run: &PipelineRun) -> String {
    let mut out = format!("Run {} {}\n", run.id, run.status);
    for (stage, record) in &run.stages {
        out.push_str(&format!("  {:<16} {}\n", stage.as_str(), record.status));
    }
    out
}
