//! Tool Registry: static registration with compiled argument schemas.
//!
//! Tools are registered once at startup. The finished registry is shared
//! immutably behind an `Arc`; there is no unregister.

use async_trait::async_trait;
use futures::future::BoxFuture;
use omopsync_core::error::ToolError;
use omopsync_core::types::{ToolDefinition, ToolOutput};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a dispatcher treats the work a tool hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronicity {
    /// The tool finishes its work inside `execute`.
    Immediate,
    /// The tool may hand back pending work; the dispatcher waits at most
    /// `wait` for it before answering that it continues in the background.
    Background { wait: Duration },
}

/// Work still running when `execute` returned.
pub struct PendingWork {
    pub description: String,
    /// Structured status reported if the wait elapses.
    pub status: serde_json::Value,
    pub completion: BoxFuture<'static, Result<ToolOutput, ToolError>>,
}

pub enum ToolReply {
    Done(ToolOutput),
    Pending(PendingWork),
}

impl From<ToolOutput> for ToolReply {
    fn from(output: ToolOutput) -> Self {
        ToolReply::Done(output)
    }
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated arguments.
    async fn execute(&self, args: serde_json::Value) -> Result<ToolReply, ToolError>;

    fn synchronicity(&self) -> Synchronicity {
        Synchronicity::Immediate
    }

    /// Maximum time `execute` may take before timing out.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: jsonschema::Validator,
}

/// The tool registry holds all registered tools and their compiled schemas.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, compiling its argument schema.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered { name });
        }
        let validator = jsonschema::validator_for(&tool.parameters_schema()).map_err(|e| {
            ToolError::InvalidSchema {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, RegisteredTool { tool, validator });
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.tool.clone())
    }

    /// Check `args` against the tool's schema, naming every offending field.
    pub fn validate(&self, name: &str, args: &serde_json::Value) -> Result<(), ToolError> {
        let entry = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        let problems: Vec<String> = entry
            .validator
            .iter_errors(args)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {e}", path.trim_start_matches('/'))
                }
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidArguments {
                name: name.to_string(),
                reason: problems.join("; "),
            })
        }
    }

    /// All tool definitions, sorted by name.
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|entry| ToolDefinition {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters_schema(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
