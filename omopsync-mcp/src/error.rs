//! MCP-specific error types.

/// Errors that end a JSON-RPC request with an `error` object.
///
/// Tool failures are not among them: a failing tool still answers with a
/// result whose `isError` flag is set.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("JSON-RPC parse error: {message}")]
    ParseError { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid parameters: {message}")]
    InvalidParams { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("Transport error: {message}")]
    TransportError { message: String },

    #[error("Server not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Convert to a JSON-RPC error code.
    pub fn error_code(&self) -> i64 {
        match self {
            McpError::ParseError { .. } | McpError::Json(_) => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::InternalError { .. } | McpError::Io(_) => -32603,
            McpError::ResourceNotFound { .. } => -32001,
            McpError::TransportError { .. } => -32002,
            McpError::NotInitialized => -32003,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            McpError::MethodNotFound {
                method: "tools/execute".into()
            }
            .error_code(),
            -32601
        );
        assert_eq!(
            McpError::ResourceNotFound {
                uri: "file:///tmp/x".into()
            }
            .error_code(),
            -32001
        );
        assert_eq!(McpError::NotInitialized.error_code(), -32003);
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert_eq!(mcp_err.error_code(), -32700);
    }
}
