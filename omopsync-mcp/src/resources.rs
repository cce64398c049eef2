//! Artifacts as MCP resources.
//!
//! Only files this process wrote through the artifact store are listed or
//! readable; any other `file://` URI is reported as not found.

use omopsync_core::PipelineContext;
use omopsync_core::artifacts::Artifact;
use std::fs;
use std::sync::Arc;

use crate::error::McpError;
use crate::protocol::{McpResource, ResourceContent};

pub struct ResourceManager {
    ctx: Arc<PipelineContext>,
}

impl ResourceManager {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Every artifact created so far, oldest first.
    pub fn list_resources(&self) -> Vec<McpResource> {
        self.ctx
            .artifacts
            .list()
            .iter()
            .map(|artifact| McpResource {
                uri: artifact_uri(artifact),
                name: artifact.file_name(),
                description: Some(format!(
                    "{} from: {}",
                    artifact.format, artifact.source_query
                )),
                mime_type: Some(artifact.kind.mime_type().to_string()),
            })
            .collect()
    }

    /// Read an artifact by its `file://` URI.
    pub fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContent>, McpError> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| McpError::InvalidParams {
                message: format!("URI must start with file://, got: {uri}"),
            })?;
        let artifact = self
            .ctx
            .artifacts
            .get(path)
            .ok_or_else(|| McpError::ResourceNotFound {
                uri: uri.to_string(),
            })?;

        let text = fs::read_to_string(&artifact.path).map_err(|e| McpError::InternalError {
            message: format!("Failed to read {}: {e}", artifact.path.display()),
        })?;
        Ok(vec![ResourceContent {
            uri: uri.to_string(),
            mime_type: Some(artifact.kind.mime_type().to_string()),
            text: Some(text),
        }])
    }
}

fn artifact_uri(artifact: &Artifact) -> String {
    format!("file://{}", artifact.path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopsync_core::config::SyncConfig;
    use omopsync_core::query::QueryResult;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (ResourceManager, Arc<PipelineContext>) {
        let mut config = SyncConfig::default();
        config.resolve_paths(dir.path());
        let ctx = Arc::new(PipelineContext::from_config(config).unwrap());
        (ResourceManager::new(ctx.clone()), ctx)
    }

    #[test]
    fn test_lists_and_reads_artifacts() {
        let dir = TempDir::new().unwrap();
        let (manager, ctx) = manager(&dir);
        assert!(manager.list_resources().is_empty());

        let artifact = ctx
            .artifacts
            .write_result_export(&QueryResult::default(), "SELECT 1")
            .unwrap();

        let resources = manager.list_resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, artifact.file_name());
        assert_eq!(resources[0].mime_type.as_deref(), Some("application/json"));

        let contents = manager.read_resource(&resources[0].uri).unwrap();
        assert!(contents[0].text.as_deref().unwrap().contains("SELECT 1"));
    }

    #[test]
    fn test_unknown_files_are_not_readable() {
        let dir = TempDir::new().unwrap();
        let (manager, _ctx) = manager(&dir);
        let secret = dir.path().join("secret.txt");
        std::fs::write(&secret, "hidden").unwrap();

        let err = manager
            .read_resource(&format!("file://{}", secret.display()))
            .unwrap_err();
        assert!(matches!(err, McpError::ResourceNotFound { .. }));

        let err = manager.read_resource("http://example.com").unwrap_err();
        assert!(matches!(err, McpError::InvalidParams { .. }));
    }
}
