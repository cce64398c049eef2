//! Core types shared across the OMOPSync crates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ErrorKind;

/// A single typed entry in a tool response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResponseBlock {
    Text { text: String },
    StructuredData { data: serde_json::Value },
    FilePath { path: String },
    Error { kind: ErrorKind, message: String },
}

impl ResponseBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseBlock::Text { text: text.into() }
    }

    pub fn data(data: serde_json::Value) -> Self {
        ResponseBlock::StructuredData { data }
    }

    pub fn file(path: &Path) -> Self {
        ResponseBlock::FilePath {
            path: path.display().to_string(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ResponseBlock::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResponseBlock::Error { .. })
    }
}

/// A tool invocation as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A definition describing a tool for the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Successful output of a tool: an ordered list of non-error blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    pub blocks: Vec<ResponseBlock>,
}

impl ToolOutput {
    /// Create a simple text output.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            blocks: vec![ResponseBlock::text(content)],
        }
    }

    pub fn with_text(mut self, content: impl Into<String>) -> Self {
        self.blocks.push(ResponseBlock::text(content));
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.blocks.push(ResponseBlock::data(data));
        self
    }

    pub fn with_file(mut self, path: &Path) -> Self {
        self.blocks.push(ResponseBlock::file(path));
        self
    }

    /// Paths of every `filePath` block, in order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::FilePath { path } => Some(PathBuf::from(path)),
                _ => None,
            })
            .collect()
    }
}

/// What a tool dispatch hands back across the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub blocks: Vec<ResponseBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn success(output: ToolOutput) -> Self {
        Self {
            blocks: output.blocks,
            is_error: false,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            blocks: vec![ResponseBlock::error(kind, message)],
            is_error: true,
        }
    }

    /// The kind of the first error block, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.blocks.iter().find_map(|block| match block {
            ResponseBlock::Error { kind, .. } => Some(*kind),
            _ => None,
        })
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                ResponseBlock::Error { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_block_wire_tags() {
        let blocks = vec![
            ResponseBlock::text("ok"),
            ResponseBlock::data(json!({"rows": 1})),
            ResponseBlock::file(Path::new("analysis/plot_bar_1700000000.html")),
            ResponseBlock::error(ErrorKind::ValidationError, "missing yField"),
        ];
        let value = serde_json::to_value(&blocks).unwrap();
        assert_eq!(
            value,
            json!([
                {"type": "text", "text": "ok"},
                {"type": "structuredData", "data": {"rows": 1}},
                {"type": "filePath", "path": "analysis/plot_bar_1700000000.html"},
                {"type": "error", "kind": "validation_error", "message": "missing yField"}
            ])
        );
    }

    #[test]
    fn test_tool_call_defaults_arguments() {
        let call: ToolCall = serde_json::from_str(r#"{"tool": "ensure_schemas"}"#).unwrap();
        assert_eq!(call.tool, "ensure_schemas");
        assert!(call.arguments.is_null());
    }

    #[test]
    fn test_tool_output_builder() {
        let output = ToolOutput::text("chart written")
            .with_file(Path::new("/tmp/plot_bar_1.html"))
            .with_data(json!({"rows": 3}));
        assert_eq!(output.blocks.len(), 3);
        assert_eq!(
            output.file_paths(),
            vec![PathBuf::from("/tmp/plot_bar_1.html")]
        );

        let response = ToolResponse::success(output);
        assert!(!response.is_error);
        assert_eq!(response.error_kind(), None);
        assert_eq!(response.text(), "chart written");
    }

    #[test]
    fn test_tool_response_failure() {
        let response = ToolResponse::failure(ErrorKind::NotFound, "Tool not found: nope");
        assert!(response.is_error);
        assert_eq!(response.error_kind(), Some(ErrorKind::NotFound));
        assert!(response.blocks[0].is_error());
    }
}
