//! Configuration system for OMOPSync.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from `~/.config/omopsync/config.toml` and/or
//! `omopsync.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "omopsync.toml";

/// Top-level configuration for OMOPSync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub artifacts: ArtifactConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    /// Environment variables that must be present before any tool is served,
    /// typically secrets consumed by external stage commands.
    #[serde(default)]
    pub required_env: Vec<String>,
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the catalog database and one file per namespace.
    pub data_dir: PathBuf,
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/omop"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// An external command standing in for one pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Per-stage command overrides. A stage without a command runs its built-in job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest: Option<StageCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<StageCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characterize: Option<StageCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<StageCommand>,
}

/// Thresholds for the built-in quality rule suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Null ratio above which a column check warns.
    pub null_warn_ratio: f64,
    /// Null ratio above which a column check fails.
    pub null_fail_ratio: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            null_warn_ratio: 0.05,
            null_fail_ratio: 0.5,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory of source CSV exports loaded by the built-in ingest job.
    pub source_dir: PathBuf,
    /// Directory of `*.sql` mapping scripts run by the built-in mapping job.
    pub mapping_dir: PathBuf,
    /// Base directory for relative `run_sql_file` paths.
    pub sql_dir: PathBuf,
    /// How long a pipeline tool call waits for its job before answering
    /// that the work continues in the background.
    pub wait_secs: u64,
    /// Maximum bytes of captured job output surfaced in errors and status.
    pub log_excerpt_bytes: usize,
    #[serde(default)]
    pub stages: StageCommands,
    #[serde(default)]
    pub quality: QualityConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("data/csv"),
            mapping_dir: PathBuf::from("mapping"),
            sql_dir: PathBuf::from("sql"),
            wait_secs: 10,
            log_excerpt_bytes: 4_096,
            stages: StageCommands::default(),
            quality: QualityConfig::default(),
        }
    }
}

/// Artifact output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Fixed output root for charts and exports.
    pub output_dir: PathBuf,
    /// Maximum number of rows rendered into the text block of a query result.
    pub preview_rows: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("analysis"),
            preview_rows: 20,
        }
    }
}

/// MCP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name advertised during `initialize`.
    pub name: String,
    /// Timeout for immediate tool execution in seconds.
    pub tool_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "omopsync".to_string(),
            tool_timeout_secs: 120,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for the JSON log file. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Filter directive for the stderr layer when no `-v` flag is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SyncConfig {
    /// Validate the configuration, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.storage.data_dir.as_os_str().is_empty() {
            problems.push("storage.data_dir must be set".to_string());
        }
        if self.artifacts.output_dir.as_os_str().is_empty() {
            problems.push("artifacts.output_dir must be set".to_string());
        }
        if self.pipeline.log_excerpt_bytes == 0 {
            problems.push("pipeline.log_excerpt_bytes must be greater than zero".to_string());
        }
        if self.server.tool_timeout_secs == 0 {
            problems.push("server.tool_timeout_secs must be greater than zero".to_string());
        }

        let quality = &self.pipeline.quality;
        for (name, ratio) in [
            ("null_warn_ratio", quality.null_warn_ratio),
            ("null_fail_ratio", quality.null_fail_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                problems.push(format!(
                    "pipeline.quality.{name} must be between 0 and 1, got {ratio}"
                ));
            }
        }
        if quality.null_warn_ratio > quality.null_fail_ratio {
            problems.push(
                "pipeline.quality.null_warn_ratio must not exceed null_fail_ratio".to_string(),
            );
        }

        let stages = &self.pipeline.stages;
        for (name, command) in [
            ("ingest", &stages.ingest),
            ("map", &stages.map),
            ("characterize", &stages.characterize),
            ("quality", &stages.quality),
        ] {
            if let Some(command) = command {
                if command.program.trim().is_empty() {
                    problems.push(format!("pipeline.stages.{name}.program must not be empty"));
                }
            }
        }

        problems
    }

    /// Fail with the first missing variable listed in `required_env`.
    pub fn check_required_env(&self) -> Result<(), ConfigError> {
        for var in &self.required_env {
            match std::env::var(var) {
                Ok(value) if !value.is_empty() => {}
                _ => return Err(ConfigError::EnvVarMissing { var: var.clone() }),
            }
        }
        Ok(())
    }

    /// Validate everything that must hold before the server starts.
    pub fn ensure_startable(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(ConfigError::Invalid {
                message: problems.join("; "),
            });
        }
        self.check_required_env()
    }

    /// Resolve every relative path against `workspace`.
    pub fn resolve_paths(&mut self, workspace: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = workspace.join(&*path);
            }
        };
        resolve(&mut self.storage.data_dir);
        resolve(&mut self.pipeline.source_dir);
        resolve(&mut self.pipeline.mapping_dir);
        resolve(&mut self.pipeline.sql_dir);
        resolve(&mut self.artifacts.output_dir);
        if let Some(dir) = self.logging.log_dir.as_mut() {
            resolve(dir);
        }
        let stages = &mut self.pipeline.stages;
        for command in [
            &mut stages.ingest,
            &mut stages.map,
            &mut stages.characterize,
            &mut stages.quality,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(dir) = command.working_dir.as_mut() {
                resolve(dir);
            }
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `OMOPSYNC_`)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`omopsync.toml`)
/// 4. User config (`~/.config/omopsync/config.toml`)
/// 5. Built-in defaults
///
/// Relative paths in the result are resolved against `workspace` when given.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<SyncConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SyncConfig::default()));

    // User-level config
    if let Some(dirs) = directories::ProjectDirs::from("dev", "omopsync", "omopsync") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (OMOPSYNC_STORAGE__DATA_DIR, OMOPSYNC_PIPELINE__WAIT_SECS, etc.)
    figment = figment.merge(Env::prefixed("OMOPSYNC_").split("__"));

    let mut config: SyncConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;

    if let Some(ws) = workspace {
        config.resolve_paths(ws);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.storage.data_dir, PathBuf::from("data/omop"));
        assert_eq!(config.artifacts.output_dir, PathBuf::from("analysis"));
        assert_eq!(config.pipeline.wait_secs, 10);
        assert_eq!(config.server.name, "omopsync");
        assert!(config.pipeline.stages.ingest.is_none());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.storage.data_dir, config.storage.data_dir);
        assert_eq!(
            deserialized.pipeline.log_excerpt_bytes,
            config.pipeline.log_excerpt_bytes
        );
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = SyncConfig::default();
        config.storage.data_dir = PathBuf::new();
        config.pipeline.quality.null_warn_ratio = 0.9;
        config.pipeline.quality.null_fail_ratio = 0.2;
        config.pipeline.stages.map = Some(StageCommand {
            program: "  ".into(),
            ..StageCommand::default()
        });

        let problems = config.validate();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems[0].contains("storage.data_dir"));

        let err = config.ensure_startable().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_required_env_missing() {
        let config = SyncConfig {
            required_env: vec!["OMOPSYNC_TEST_SURELY_UNSET_SECRET".into()],
            ..SyncConfig::default()
        };
        match config.check_required_env().unwrap_err() {
            ConfigError::EnvVarMissing { var } => {
                assert_eq!(var, "OMOPSYNC_TEST_SURELY_UNSET_SECRET")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            r#"
[storage]
data_dir = "warehouse"
busy_timeout_ms = 1000

[pipeline]
source_dir = "exports"
mapping_dir = "mapping"
sql_dir = "sql"
wait_secs = 2
log_excerpt_bytes = 512

[pipeline.stages.quality]
program = "Rscript"
args = ["dqd.R"]
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.storage.data_dir, dir.path().join("warehouse"));
        assert_eq!(config.pipeline.source_dir, dir.path().join("exports"));
        assert_eq!(config.pipeline.wait_secs, 2);
        let quality = config.pipeline.stages.quality.unwrap();
        assert_eq!(quality.program, "Rscript");
        assert_eq!(quality.args, vec!["dqd.R".to_string()]);
    }

    #[test]
    fn test_load_config_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(None, Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_resolve_paths_keeps_absolute() {
        let mut config = SyncConfig::default();
        config.artifacts.output_dir = PathBuf::from("/srv/charts");
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.artifacts.output_dir, PathBuf::from("/srv/charts"));
        assert_eq!(config.storage.data_dir, PathBuf::from("/work/data/omop"));
    }
}
