//! Artifact store: naming, atomic persistence, and lookup of generated files.

pub mod chart;

pub use chart::{ChartRequest, ChartType, resolve_field};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use crate::error::ArtifactError;
use crate::query::QueryResult;

/// Give up allocating a name after this many same-second collisions.
const MAX_COLLISIONS: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plot,
    Export,
}

impl ArtifactKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ArtifactKind::Plot => "text/html",
            ArtifactKind::Export => "application/json",
        }
    }
}

/// A file written by this process. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Chart type for plots, `json` for exports.
    pub format: String,
    pub source_query: String,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Owns the output directory and every artifact path allocated in it.
pub struct ArtifactStore {
    output_dir: PathBuf,
    index: RwLock<Vec<Artifact>>,
}

impl ArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            index: RwLock::new(Vec::new()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Render a chart over `result` and persist it as `plot_<chartType>_<ts>.html`.
    ///
    /// Every validation error is raised before the output directory is touched.
    pub fn render_chart(
        &self,
        result: &QueryResult,
        request: &ChartRequest,
        sql: &str,
    ) -> Result<Artifact, ArtifactError> {
        let title = format!("{} plot", capitalize(request.chart_type.as_str()));
        let html = chart::render_chart_html(result, request, &title)?;
        let stem = format!("plot_{}", request.chart_type);
        let path = self.persist(&stem, "html", html.as_bytes())?;

        let artifact = Artifact {
            path,
            kind: ArtifactKind::Plot,
            format: request.chart_type.to_string(),
            source_query: sql.to_string(),
            parameters: serde_json::to_value(request).unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.record(artifact.clone());
        Ok(artifact)
    }

    /// Persist a query result as `export_json_<ts>.json`.
    pub fn write_result_export(
        &self,
        result: &QueryResult,
        sql: &str,
    ) -> Result<Artifact, ArtifactError> {
        let created_at = Utc::now();
        let document = serde_json::json!({
            "query": sql,
            "created_at": created_at.to_rfc3339(),
            "row_count": result.row_count(),
            "columns": result.columns,
            "rows": result.rows,
        });
        let content = serde_json::to_vec_pretty(&document).unwrap_or_default();
        let path = self.persist("export_json", "json", &content)?;

        let artifact = Artifact {
            path,
            kind: ArtifactKind::Export,
            format: "json".into(),
            source_query: sql.to_string(),
            parameters: serde_json::json!({ "rows": result.row_count() }),
            created_at,
        };
        self.record(artifact.clone());
        Ok(artifact)
    }

    /// Artifacts created by this process, oldest first.
    pub fn list(&self) -> Vec<Artifact> {
        self.index
            .read()
            .map(|index| index.clone())
            .unwrap_or_default()
    }

    /// Look up an artifact by full path or file name.
    pub fn get(&self, path: &str) -> Option<Artifact> {
        let index = self.index.read().ok()?;
        index
            .iter()
            .find(|a| a.path == Path::new(path) || a.file_name() == path)
            .cloned()
    }

    fn record(&self, artifact: Artifact) {
        info!(
            path = %artifact.path.display(),
            kind = ?artifact.kind,
            format = %artifact.format,
            "Artifact written"
        );
        if let Ok(mut index) = self.index.write() {
            index.push(artifact);
        }
    }

    /// Write `content` under a fresh `<stem>_<unix ts>[_n].<ext>` name.
    ///
    /// The bytes land in a hidden temp file first and are hard-linked to the
    /// final name, which fails rather than overwrite an existing file.
    fn persist(&self, stem: &str, ext: &str, content: &[u8]) -> Result<PathBuf, ArtifactError> {
        let write_err = |path: &Path, source: std::io::Error| ArtifactError::Write {
            path: path.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(&self.output_dir).map_err(|e| write_err(&self.output_dir, e))?;
        let timestamp = Utc::now().timestamp();
        let temp = self
            .output_dir
            .join(format!(".{stem}_{timestamp}.{}.tmp", uuid::Uuid::new_v4().simple()));
        {
            let mut file = std::fs::File::create(&temp).map_err(|e| write_err(&temp, e))?;
            file.write_all(content).map_err(|e| write_err(&temp, e))?;
            file.sync_all().map_err(|e| write_err(&temp, e))?;
        }

        let mut outcome = Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no free artifact name",
        ));
        let mut final_path = self.output_dir.join(format!("{stem}_{timestamp}.{ext}"));
        for attempt in 0..MAX_COLLISIONS {
            if attempt > 0 {
                final_path = self
                    .output_dir
                    .join(format!("{stem}_{timestamp}_{attempt}.{ext}"));
            }
            match std::fs::hard_link(&temp, &final_path) {
                Ok(()) => {
                    outcome = Ok(());
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&temp);
        outcome.map_err(|e| write_err(&final_path, e))?;
        Ok(final_path)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Whether `name` looks like `<stem>_<digits>[_<digits>].<ext>`.
pub fn matches_artifact_name(name: &str, stem: &str, ext: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(ext))
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    let mut parts = rest.split('_');
    let timestamp_ok = parts
        .next()
        .is_some_and(|ts| !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit()));
    let suffix_ok = match parts.next() {
        None => true,
        Some(n) => !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) && parts.next().is_none(),
    };
    timestamp_ok && suffix_ok
}
