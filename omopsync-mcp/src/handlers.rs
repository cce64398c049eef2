//! MCP request handlers: route JSON-RPC methods to the dispatcher and resources.

use omopsync_tools::dispatcher::ToolDispatcher;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListResourcesResult,
    ListToolsResult, MCP_PROTOCOL_VERSION, McpTool, ReadResourceParams, ReadResourceResult,
    ResourcesCapability, ServerCapabilities, ServerInfo, ToolsCapability,
};
use crate::resources::ResourceManager;

/// Shared by every in-flight request; `tools/call` runs concurrently.
pub struct RequestHandler {
    dispatcher: ToolDispatcher,
    resources: ResourceManager,
    initialized: AtomicBool,
    server_info: ServerInfo,
}

impl RequestHandler {
    pub fn new(dispatcher: ToolDispatcher, resources: ResourceManager, name: &str) -> Self {
        Self {
            dispatcher,
            resources,
            initialized: AtomicBool::new(false),
            server_info: ServerInfo {
                name: name.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn require_initialized(&self) -> Result<(), McpError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }

    pub fn handle_initialize(&self, params: InitializeParams) -> Result<Value, McpError> {
        info!(
            client = %params.client_info.name,
            client_version = ?params.client_info.version,
            protocol_version = %params.protocol_version,
            "MCP client connecting"
        );
        self.initialized.store(true, Ordering::Release);

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                resources: Some(ResourcesCapability {
                    subscribe: Some(false),
                    list_changed: Some(false),
                }),
            },
            server_info: self.server_info.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    pub fn handle_tools_list(&self) -> Result<Value, McpError> {
        self.require_initialized()?;
        let tools: Vec<McpTool> = self
            .dispatcher
            .registry()
            .list_definitions()
            .into_iter()
            .map(|def| McpTool {
                name: def.name,
                description: Some(def.description),
                input_schema: def.parameters,
            })
            .collect();
        debug!(count = tools.len(), "Listing tools");
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    /// Dispatch a tool call. Tool failures come back as `isError` results.
    pub async fn handle_tools_call(&self, params: CallToolParams) -> Result<Value, McpError> {
        self.require_initialized()?;
        let arguments = params.arguments.unwrap_or(Value::Null);
        info!(tool = %params.name, "Calling tool via MCP");
        debug!(tool = %params.name, args = %arguments, "Tool call arguments");

        let response = self.dispatcher.dispatch(&params.name, arguments).await;
        Ok(serde_json::to_value(CallToolResult::from(response))?)
    }

    pub fn handle_resources_list(&self) -> Result<Value, McpError> {
        self.require_initialized()?;
        let resources = self.resources.list_resources();
        debug!(count = resources.len(), "Listing resources");
        Ok(serde_json::to_value(ListResourcesResult { resources })?)
    }

    pub fn handle_resources_read(&self, params: ReadResourceParams) -> Result<Value, McpError> {
        self.require_initialized()?;
        info!(uri = %params.uri, "Reading resource via MCP");
        let contents = self.resources.read_resource(&params.uri)?;
        Ok(serde_json::to_value(ReadResourceResult { contents })?)
    }

    /// Route a JSON-RPC method to its handler.
    pub async fn route(&self, method: &str, params: Value) -> Result<Value, McpError> {
        match method {
            "initialize" => self.handle_initialize(parse_params(method, params)?),
            "notifications/initialized" => {
                info!("MCP client initialized");
                Ok(Value::Null)
            }
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_tools_list(),
            "tools/call" => self.handle_tools_call(parse_params(method, params)?).await,
            "resources/list" => self.handle_resources_list(),
            "resources/read" => self.handle_resources_read(parse_params(method, params)?),
            _ => Err(McpError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T, McpError> {
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams {
        message: format!("Invalid {method} params: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientInfo;
    use omopsync_core::PipelineContext;
    use omopsync_core::config::SyncConfig;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn handler(dir: &TempDir) -> RequestHandler {
        let mut config = SyncConfig::default();
        config.resolve_paths(dir.path());
        let ctx = Arc::new(PipelineContext::from_config(config).unwrap());
        let dispatcher = omopsync_tools::build_dispatcher(ctx.clone());
        RequestHandler::new(dispatcher, ResourceManager::new(ctx), "omopsync")
    }

    fn init_params() -> InitializeParams {
        InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "test-client".to_string(),
                version: Some("1.0".to_string()),
            },
        }
    }

    #[test]
    fn test_initialize() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        assert!(!handler.is_initialized());

        let result = handler.handle_initialize(init_params()).unwrap();
        assert_eq!(result["serverInfo"]["name"], "omopsync");
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert!(handler.is_initialized());
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_refused() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        assert!(matches!(
            handler.route("tools/list", Value::Null).await,
            Err(McpError::NotInitialized)
        ));
        assert!(matches!(
            handler
                .route("tools/call", json!({"name": "ensure_schemas"}))
                .await,
            Err(McpError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_tools_call_failures_are_results() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        handler.handle_initialize(init_params()).unwrap();

        let result = handler
            .route("tools/call", json!({"name": "no_such_tool"}))
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(
            result["structuredContent"]["blocks"][0]["kind"],
            "not_found"
        );

        let result = handler
            .route("tools/call", json!({"name": "ensure_schemas"}))
            .await
            .unwrap();
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn test_route_errors() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let err = handler.route("tools/execute", Value::Null).await.unwrap_err();
        assert_eq!(err.error_code(), -32601);

        let err = handler
            .route("initialize", json!({"protocolVersion": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), -32602);
    }
}
