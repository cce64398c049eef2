//! Tool dispatcher: validate, route, and normalize every tool call.
//!
//! Nothing crosses this boundary as a Rust error or panic. Every outcome,
//! including unknown tools, invalid arguments, handler failures, panics and
//! timeouts, becomes a [`ToolResponse`] of typed blocks.

use omopsync_core::error::{PipelineError, SyncError, ToolError};
use omopsync_core::types::{ResponseBlock, ToolCall, ToolResponse};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use crate::registry::{PendingWork, Synchronicity, ToolRegistry, ToolReply};

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn call(&self, call: ToolCall) -> ToolResponse {
        self.dispatch(&call.tool, call.arguments).await
    }

    /// Run one tool call to a normalized response.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> ToolResponse {
        let Some(tool) = self.registry.get(name) else {
            warn!(tool = %name, "Unknown tool requested");
            return error_response(&ToolError::NotFound {
                name: name.to_string(),
            });
        };

        let args = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        if let Err(e) = self.registry.validate(name, &args) {
            warn!(tool = %name, error = %e, "Rejected tool arguments");
            return error_response(&e);
        }

        let timeout = tool.timeout();
        let synchronicity = tool.synchronicity();
        info!(tool = %name, timeout_secs = timeout.as_secs(), "Executing tool");

        let executing = tool.clone();
        let mut task = tokio::spawn(async move { executing.execute(args).await });
        let reply = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(reply))) => reply,
            Ok(Ok(Err(e))) => return self.failed(name, e),
            Ok(Err(join)) => {
                let e = if join.is_panic() {
                    ToolError::Panicked {
                        name: name.to_string(),
                    }
                } else {
                    ToolError::Timeout {
                        name: name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                };
                return self.failed(name, e);
            }
            Err(_) => {
                task.abort();
                return self.failed(
                    name,
                    ToolError::Timeout {
                        name: name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    },
                );
            }
        };

        match reply {
            ToolReply::Done(output) => {
                info!(tool = %name, blocks = output.blocks.len(), "Tool completed");
                ToolResponse::success(output)
            }
            ToolReply::Pending(work) => self.await_pending(name, synchronicity, work).await,
        }
    }

    async fn await_pending(
        &self,
        name: &str,
        synchronicity: Synchronicity,
        work: PendingWork,
    ) -> ToolResponse {
        let PendingWork {
            description,
            status,
            completion,
        } = work;

        let outcome = match synchronicity {
            Synchronicity::Immediate => Some(completion.await),
            Synchronicity::Background { wait } => tokio::time::timeout(wait, completion).await.ok(),
        };

        match outcome {
            Some(Ok(output)) => {
                info!(tool = %name, "Background work completed within the wait");
                ToolResponse::success(output)
            }
            Some(Err(e)) => self.failed(name, e),
            None => {
                info!(tool = %name, "Background work still running, answering early");
                ToolResponse {
                    blocks: vec![
                        ResponseBlock::text(format!(
                            "{description} is still running in the background. \
                             Poll pipeline_status for progress."
                        )),
                        ResponseBlock::data(status),
                    ],
                    is_error: false,
                }
            }
        }
    }

    fn failed(&self, name: &str, error: ToolError) -> ToolResponse {
        warn!(tool = %name, kind = %error.kind(), error = %error, "Tool failed");
        error_response(&error)
    }
}

/// Map an error to a single error block. Stage failures carry their log excerpt.
pub fn error_response(error: &ToolError) -> ToolResponse {
    let mut message = error.to_string();
    if let ToolError::Sync(SyncError::Pipeline(PipelineError::StageFailed {
        log_excerpt, ..
    })) = error
    {
        if !log_excerpt.is_empty() {
            message.push_str("\n--- log excerpt ---\n");
            message.push_str(log_excerpt);
        }
    }
    ToolResponse::failure(error.kind(), message)
}
