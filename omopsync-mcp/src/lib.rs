//! # OMOPSync MCP
//!
//! Model Context Protocol (MCP) server for OMOPSync.
//!
//! Exposes the pipeline tools and the artifacts they write via JSON-RPC 2.0
//! over stdio, so an MCP client can drive the pipeline conversationally.
//!
//! ## Architecture
//!
//! ```text
//! Client <-> Transport (stdio/channel) <-> McpServer <-> RequestHandler
//!                                                        |-- ToolDispatcher
//!                                                        +-- ResourceManager
//! ```
//!
//! Each `tools/call` runs on its own task and its response is written when it
//! finishes, so a quick query is answered while a pipeline call still waits.

pub mod error;
pub mod handlers;
pub mod protocol;
pub mod resources;
pub mod transport;

use error::McpError;
use handlers::RequestHandler;
use omopsync_core::PipelineContext;
use omopsync_tools::dispatcher::ToolDispatcher;
use protocol::{IncomingMessage, JsonRpcResponse, RequestId};
use resources::ResourceManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use transport::Transport;

/// The MCP server that processes JSON-RPC messages over a transport.
pub struct McpServer {
    handler: Arc<RequestHandler>,
}

impl McpServer {
    pub fn new(ctx: Arc<PipelineContext>, dispatcher: ToolDispatcher) -> Self {
        let name = ctx.config.server.name.clone();
        let resources = ResourceManager::new(ctx);
        Self {
            handler: Arc::new(RequestHandler::new(dispatcher, resources, &name)),
        }
    }

    /// Serve until the transport reaches EOF and every in-flight call has answered.
    pub async fn run<T: Transport>(&self, transport: &mut T) -> Result<(), McpError> {
        info!("MCP server starting");
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let mut tx = Some(tx);

        loop {
            tokio::select! {
                response = rx.recv() => match response {
                    Some(response) => write_response(transport, &response).await?,
                    // Reading stopped and every spawned call has answered.
                    None => break,
                },
                message = transport.read_message(), if tx.is_some() => {
                    let message = match message {
                        Ok(Some(message)) => message,
                        Ok(None) => {
                            info!("Transport closed (EOF), finishing in-flight calls");
                            tx = None;
                            continue;
                        }
                        // A malformed line is answered; the session goes on.
                        Err(e @ McpError::ParseError { .. }) => {
                            warn!(error = %e, "Unreadable MCP message");
                            let response = JsonRpcResponse::from_mcp_error(RequestId::Null, e);
                            write_response(transport, &response).await?;
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "Transport read error");
                            tx = None;
                            continue;
                        }
                    };
                    if message.trim().is_empty() {
                        continue;
                    }
                    debug!(message = %message, "Received MCP message");
                    if let Some(sender) = &tx {
                        if let Some(response) = self.accept(&message, sender).await {
                            write_response(transport, &response).await?;
                        }
                    }
                }
            }
        }

        transport.close().await?;
        info!("MCP server stopped");
        Ok(())
    }

    /// Handle one message. Tool calls are spawned and answer through `responses`;
    /// everything else answers inline.
    async fn accept(
        &self,
        raw: &str,
        responses: &mpsc::UnboundedSender<JsonRpcResponse>,
    ) -> Option<JsonRpcResponse> {
        let incoming: IncomingMessage = match serde_json::from_str(raw) {
            Ok(incoming) => incoming,
            Err(e) => {
                let err = McpError::ParseError {
                    message: format!("Invalid JSON-RPC message: {e}"),
                };
                return Some(JsonRpcResponse::from_mcp_error(RequestId::Null, err));
            }
        };

        if incoming.jsonrpc != "2.0" {
            let err = McpError::InvalidRequest {
                message: format!("Expected jsonrpc version 2.0, got: {}", incoming.jsonrpc),
            };
            return Some(JsonRpcResponse::from_mcp_error(
                incoming.id.unwrap_or(RequestId::Null),
                err,
            ));
        }

        let Some(id) = incoming.id.clone() else {
            debug!(method = %incoming.method, "Processing notification");
            if let Err(e) = self.handler.route(&incoming.method, incoming.params).await {
                warn!(method = %incoming.method, error = %e, "Notification handler error");
            }
            return None;
        };

        if incoming.method == "tools/call" {
            let handler = self.handler.clone();
            let responses = responses.clone();
            tokio::spawn(async move {
                let response = respond(&handler, id, &incoming).await;
                let _ = responses.send(response);
            });
            return None;
        }

        Some(respond(&self.handler, id, &incoming).await)
    }

    pub fn is_initialized(&self) -> bool {
        self.handler.is_initialized()
    }
}

async fn respond(
    handler: &RequestHandler,
    id: RequestId,
    incoming: &IncomingMessage,
) -> JsonRpcResponse {
    debug!(method = %incoming.method, "Processing request");
    match handler
        .route(&incoming.method, incoming.params.clone())
        .await
    {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse::from_mcp_error(id, e),
    }
}

async fn write_response<T: Transport>(
    transport: &mut T,
    response: &JsonRpcResponse,
) -> Result<(), McpError> {
    let json = serde_json::to_string(response).map_err(|e| McpError::InternalError {
        message: format!("Failed to serialize response: {e}"),
    })?;
    debug!(response = %json, "Sending MCP response");
    transport.write_message(&json).await
}
