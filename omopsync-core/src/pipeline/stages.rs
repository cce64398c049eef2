//! Stage jobs: external commands when configured, built-in jobs otherwise.

use rusqlite::params_from_iter;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::config::{PipelineConfig, QualityConfig, StageCommand};
use crate::error::{PipelineError, StorageError};
use crate::executor::{CommandSpec, Job, JobLog};
use crate::pipeline::quality::{self, FindingSummary};
use crate::pipeline::types::Stage;
use crate::storage::{Access, Database, Namespace, quote_ident, table_columns};

/// Idempotent DDL for the characterization table.
pub const CREATE_CHARACTERIZATION: &str = r"
CREATE TABLE IF NOT EXISTS results.characterization (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    computed_at TEXT NOT NULL
);
";

/// Turns a stage of a run into a job for the background executor.
pub trait StageJobFactory: Send + Sync {
    fn build(&self, stage: Stage, run_id: Uuid) -> Result<Job, PipelineError>;
}

/// The production factory, driven by the pipeline configuration.
pub struct ConfiguredStages {
    db: Database,
    config: PipelineConfig,
}

impl ConfiguredStages {
    pub fn new(db: Database, config: PipelineConfig) -> Self {
        Self { db, config }
    }

    fn command_for(&self, stage: Stage) -> Option<&StageCommand> {
        let stages = &self.config.stages;
        match stage {
            Stage::SchemasReady => None,
            Stage::Ingested => stages.ingest.as_ref(),
            Stage::Mapped => stages.map.as_ref(),
            Stage::Characterized => stages.characterize.as_ref(),
            Stage::QualityChecked => stages.quality.as_ref(),
        }
    }

    fn external(&self, stage: Stage, run_id: Uuid, command: &StageCommand) -> Job {
        let mut env: Vec<(String, String)> = vec![
            (
                "OMOPSYNC_DATA_DIR".into(),
                self.db.data_dir().display().to_string(),
            ),
            ("OMOPSYNC_RUN_ID".into(), run_id.to_string()),
            ("OMOPSYNC_STAGE".into(), stage.to_string()),
        ];
        for namespace in Namespace::ALL {
            env.push((
                format!("OMOPSYNC_NS_{}", namespace.schema().to_uppercase()),
                self.db.namespace_path(namespace).display().to_string(),
            ));
        }
        env.extend(command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Job::command(
            stage.to_string(),
            CommandSpec {
                program: command.program.clone(),
                args: command.args.clone(),
                env,
                working_dir: command.working_dir.clone(),
            },
        )
    }
}

impl StageJobFactory for ConfiguredStages {
    fn build(&self, stage: Stage, run_id: Uuid) -> Result<Job, PipelineError> {
        if let Some(command) = self.command_for(stage) {
            return Ok(self.external(stage, run_id, command));
        }

        let db = self.db.clone();
        let job = match stage {
            Stage::SchemasReady => {
                return Err(PipelineError::NoStageJob {
                    stage: stage.to_string(),
                });
            }
            Stage::Ingested => {
                let source_dir = self.config.source_dir.clone();
                Job::native(stage.to_string(), move |log| {
                    ingest_csv_dir(&db, &source_dir, log)
                })
            }
            Stage::Mapped => {
                let mapping_dir = self.config.mapping_dir.clone();
                Job::native(stage.to_string(), move |log| {
                    apply_mapping_scripts(&db, &mapping_dir, log)
                })
            }
            Stage::Characterized => Job::native(stage.to_string(), move |log| {
                characterize(&db, run_id, log).map_err(|e| e.to_string())
            }),
            Stage::QualityChecked => {
                let thresholds = self.config.quality.clone();
                Job::native(stage.to_string(), move |log| {
                    run_quality_suite(&db, run_id, &thresholds, log).map_err(|e| e.to_string())
                })
            }
        };
        Ok(job)
    }
}

fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, String> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| format!("cannot read directory {}: {e}", dir.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|found| found.eq_ignore_ascii_case(ext))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Load every CSV in `source_dir` into `raw.<stem>`, replacing earlier loads.
pub fn ingest_csv_dir(db: &Database, source_dir: &Path, log: &JobLog) -> Result<String, String> {
    let files = files_with_extension(source_dir, "csv")?;
    if files.is_empty() {
        return Err(format!("no CSV files found in {}", source_dir.display()));
    }

    let mut conn = db.connect(Access::ReadWrite).map_err(|e| e.to_string())?;
    let tx = conn.transaction().map_err(|e| e.to_string())?;
    let mut total_rows = 0usize;

    for file in &files {
        let table = table_name_for(file);
        let text = std::fs::read_to_string(file)
            .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
        let mut records = parse_csv(&text).into_iter();
        let Some(header) = records.next() else {
            log.push(format!("skipped empty file {}", file.display()));
            continue;
        };
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let name = name.trim().trim_start_matches('\u{feff}');
                if name.is_empty() {
                    format!("column_{}", idx + 1)
                } else {
                    name.to_lowercase()
                }
            })
            .collect();

        let target = format!("raw.{}", quote_ident(&table));
        let column_defs = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {target}; CREATE TABLE {target} ({column_defs});"
        ))
        .map_err(|e| format!("cannot create {target}: {e}"))?;

        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut insert = tx
            .prepare(&format!("INSERT INTO {target} VALUES ({placeholders})"))
            .map_err(|e| e.to_string())?;
        let mut rows = 0usize;
        for (line, record) in records.enumerate() {
            if record.len() != columns.len() {
                return Err(format!(
                    "{} record {} has {} fields, expected {}",
                    file.display(),
                    line + 2,
                    record.len(),
                    columns.len()
                ));
            }
            let values = record
                .into_iter()
                .map(|value| if value.is_empty() { None } else { Some(value) });
            insert
                .execute(params_from_iter(values))
                .map_err(|e| format!("cannot insert into {target}: {e}"))?;
            rows += 1;
        }
        total_rows += rows;
        log.push(format!("loaded {rows} rows into raw.{table}"));
    }

    tx.commit().map_err(|e| e.to_string())?;
    Ok(format!(
        "loaded {} files ({total_rows} rows) into the raw namespace",
        files.len()
    ))
}

/// Run every `*.sql` in `mapping_dir`, in name order, in one transaction.
pub fn apply_mapping_scripts(
    db: &Database,
    mapping_dir: &Path,
    log: &JobLog,
) -> Result<String, String> {
    let scripts = files_with_extension(mapping_dir, "sql")?;
    if scripts.is_empty() {
        return Err(format!(
            "no mapping scripts found in {}",
            mapping_dir.display()
        ));
    }

    let mut conn = db.connect(Access::ReadWrite).map_err(|e| e.to_string())?;
    let tx = conn.transaction().map_err(|e| e.to_string())?;
    for script in &scripts {
        let sql = std::fs::read_to_string(script)
            .map_err(|e| format!("cannot read {}: {e}", script.display()))?;
        tx.execute_batch(&sql)
            .map_err(|e| format!("{} failed: {e}", script.display()))?;
        log.push(format!("applied {}", script.display()));
    }
    tx.commit().map_err(|e| e.to_string())?;
    Ok(format!("applied {} mapping scripts", scripts.len()))
}

/// Row, null and distinct counts for every mapped table.
pub fn characterize(db: &Database, run_id: Uuid, log: &JobLog) -> Result<String, StorageError> {
    let mut conn = db.connect(Access::ReadWrite)?;
    let tables = db.list_tables(&conn, Namespace::Mapped)?;
    let tx = conn.transaction()?;
    tx.execute_batch(CREATE_CHARACTERIZATION)?;

    let computed_at = chrono::Utc::now().to_rfc3339();
    let run = run_id.to_string();
    let mut metrics = 0usize;
    {
        let mut insert = tx.prepare(
            "INSERT INTO results.characterization
             (run_id, table_name, column_name, metric, value, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for table in &tables {
            let qualified = format!("cdm.{}", quote_ident(table));
            let rows: i64 =
                tx.query_row(&format!("SELECT count(*) FROM {qualified}"), [], |r| r.get(0))?;
            insert.execute(rusqlite::params![
                run,
                table,
                None::<String>,
                "row_count",
                rows as f64,
                computed_at
            ])?;
            metrics += 1;

            for column in table_columns(&tx, "cdm", table)? {
                let col = quote_ident(&column);
                let (nulls, distinct): (i64, i64) = tx.query_row(
                    &format!(
                        "SELECT sum(CASE WHEN {col} IS NULL THEN 1 ELSE 0 END), count(DISTINCT {col}) \
                         FROM {qualified}"
                    ),
                    [],
                    |r| Ok((r.get::<_, Option<i64>>(0)?.unwrap_or(0), r.get(1)?)),
                )?;
                for (metric, value) in [("null_count", nulls), ("distinct_count", distinct)] {
                    insert.execute(rusqlite::params![
                        run,
                        table,
                        column,
                        metric,
                        value as f64,
                        computed_at
                    ])?;
                    metrics += 1;
                }
            }
            log.push(format!("characterized cdm.{table}"));
        }
    }
    tx.commit()?;
    Ok(format!(
        "recorded {metrics} metrics for {} tables",
        tables.len()
    ))
}

/// Evaluate the rule suite and store the findings.
pub fn run_quality_suite(
    db: &Database,
    run_id: Uuid,
    thresholds: &QualityConfig,
    log: &JobLog,
) -> Result<String, StorageError> {
    let mut conn = db.connect(Access::ReadWrite)?;
    let findings = quality::evaluate(db, &conn, run_id, thresholds)?;
    let tx = conn.transaction()?;
    quality::store(&tx, &findings)?;
    tx.commit()?;

    let summary = FindingSummary::of(&findings);
    let message = format!(
        "{} findings: {} pass, {} warn, {} fail",
        findings.len(),
        summary.pass,
        summary.warn,
        summary.fail
    );
    log.push(message.clone());
    Ok(message)
}

fn table_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.is_empty() { "unnamed".into() } else { name }
}

/// Minimal RFC 4180 reader: quoted fields, doubled quotes, CRLF, embedded newlines.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                c => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                }
                record.clear();
            }
            c => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}
