//! Full MCP sessions over an in-process channel transport.

use omopsync_core::PipelineContext;
use omopsync_core::config::SyncConfig;
use omopsync_core::error::PipelineError;
use omopsync_core::executor::Job;
use omopsync_core::pipeline::{Stage, StageJobFactory};
use omopsync_mcp::McpServer;
use omopsync_mcp::protocol::{JsonRpcResponse, MCP_PROTOCOL_VERSION, RequestId};
use omopsync_mcp::transport::{ChannelTransport, Transport};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

struct SlowStages(Duration);

impl StageJobFactory for SlowStages {
    fn build(&self, stage: Stage, _run_id: Uuid) -> Result<Job, PipelineError> {
        let delay = self.0;
        Ok(Job::native(stage.as_str(), move |_log| {
            std::thread::sleep(delay);
            Ok(format!("{stage} done"))
        }))
    }
}

fn start(ctx: PipelineContext) -> (ChannelTransport, tokio::task::JoinHandle<()>) {
    let ctx = Arc::new(ctx);
    let dispatcher = omopsync_tools::build_dispatcher(ctx.clone());
    let server = McpServer::new(ctx, dispatcher);
    let (client, mut server_side) = ChannelTransport::pair(32);
    let handle = tokio::spawn(async move {
        server.run(&mut server_side).await.unwrap();
    });
    (client, handle)
}

fn config(dir: &TempDir) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.resolve_paths(dir.path());
    config
}

async fn request(client: &mut ChannelTransport, id: i64, method: &str, params: Value) {
    let msg = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    client.write_message(&msg.to_string()).await.unwrap();
}

async fn response(client: &mut ChannelTransport) -> JsonRpcResponse {
    let raw = client.read_message().await.unwrap().unwrap();
    serde_json::from_str(&raw).unwrap()
}

async fn initialize(client: &mut ChannelTransport) {
    request(
        client,
        1,
        "initialize",
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "session-test"}
        }),
    )
    .await;
    let resp = response(client).await;
    assert!(resp.result.is_some());
    client
        .write_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_call_and_read_artifact() {
    let dir = TempDir::new().unwrap();
    let (mut client, handle) = start(PipelineContext::from_config(config(&dir)).unwrap());
    initialize(&mut client).await;

    request(&mut client, 2, "tools/list", json!({})).await;
    let tools = response(&mut client).await.result.unwrap()["tools"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(tools.len(), 11);
    let plot = tools.iter().find(|t| t["name"] == "plot_query").unwrap();
    assert_eq!(plot["inputSchema"]["required"], json!(["sql", "chartType"]));

    request(
        &mut client,
        3,
        "tools/call",
        json!({
            "name": "plot_query",
            "arguments": {
                "sql": "SELECT 'a' AS k, 2 AS v UNION ALL SELECT 'b', 5",
                "chartType": "pie",
                "xField": "k",
                "yField": "v"
            }
        }),
    )
    .await;
    let result = response(&mut client).await.result.unwrap();
    assert!(result.get("isError").is_none(), "{result}");
    let path = result["structuredContent"]["blocks"][1]["path"]
        .as_str()
        .unwrap()
        .to_string();

    request(&mut client, 4, "resources/list", json!({})).await;
    let resources = response(&mut client).await.result.unwrap()["resources"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0]["mimeType"], "text/html");

    request(
        &mut client,
        5,
        "resources/read",
        json!({"uri": format!("file://{path}")}),
    )
    .await;
    let contents = response(&mut client).await.result.unwrap()["contents"].clone();
    assert!(contents[0]["text"].as_str().unwrap().contains("<html"));

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_query_answers_while_pipeline_call_waits() {
    let dir = TempDir::new().unwrap();
    let ctx = PipelineContext::with_stage_jobs(
        config(&dir),
        Arc::new(SlowStages(Duration::from_millis(400))),
    )
    .unwrap();
    let (mut client, handle) = start(ctx);
    initialize(&mut client).await;

    request(
        &mut client,
        2,
        "tools/call",
        json!({"name": "ensure_schemas"}),
    )
    .await;
    assert!(response(&mut client).await.result.is_some());

    request(&mut client, 3, "tools/call", json!({"name": "run_etl"})).await;
    request(
        &mut client,
        4,
        "tools/call",
        json!({"name": "query_database", "arguments": {"sql": "SELECT 42 AS answer"}}),
    )
    .await;

    let first = response(&mut client).await;
    assert_eq!(first.id, RequestId::Number(4));
    let second = response(&mut client).await;
    assert_eq!(second.id, RequestId::Number(3));
    let result = second.result.unwrap();
    assert!(result.get("isError").is_none(), "{result}");
    assert_eq!(
        result["structuredContent"]["blocks"][1]["data"]["stages"]["mapped"]["status"],
        "succeeded"
    );

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_eof_waits_for_in_flight_calls() {
    let dir = TempDir::new().unwrap();
    let ctx = PipelineContext::with_stage_jobs(
        config(&dir),
        Arc::new(SlowStages(Duration::from_millis(100))),
    )
    .unwrap();
    let ctx = Arc::new(ctx);
    let dispatcher = omopsync_tools::build_dispatcher(ctx.clone());
    let server = McpServer::new(ctx.clone(), dispatcher);
    let (mut client, mut server_side) = ChannelTransport::pair(32);
    let handle = tokio::spawn(async move { server.run(&mut server_side).await });

    initialize(&mut client).await;
    request(&mut client, 2, "tools/call", json!({"name": "run_all"})).await;

    // Close our write side only; the response must still arrive.
    let (mut reader, writer) = client.into_parts();
    drop(writer);
    let raw = reader.recv().await.unwrap();
    let resp: JsonRpcResponse = serde_json::from_str(&raw).unwrap();
    assert_eq!(resp.id, RequestId::Number(2));
    handle.await.unwrap().unwrap();

    let run = ctx.orchestrator.active_run().await.unwrap();
    assert!(run.is_complete());
}

