//! Built-in data-quality rule suite over the mapped namespace.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::config::QualityConfig;
use crate::error::StorageError;
use crate::storage::{Database, Namespace, quote_ident, table_columns};

/// Idempotent DDL for the findings table.
pub const CREATE_FINDINGS: &str = r"
CREATE TABLE IF NOT EXISTS results.quality_findings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    category TEXT NOT NULL,
    check_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    column_name TEXT,
    outcome TEXT NOT NULL,
    detail TEXT NOT NULL,
    checked_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS results.idx_quality_findings_run ON quality_findings (run_id);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Completeness,
    Conformance,
    Plausibility,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::Completeness => "completeness",
            RuleCategory::Conformance => "conformance",
            RuleCategory::Plausibility => "plausibility",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::Warn => write!(f, "warn"),
            Outcome::Fail => write!(f, "fail"),
        }
    }
}

/// One rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityFinding {
    pub run_id: Uuid,
    pub category: RuleCategory,
    pub check_name: String,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    pub outcome: Outcome,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

/// Counts of findings by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

impl FindingSummary {
    pub fn of(findings: &[QualityFinding]) -> Self {
        let mut summary = Self::default();
        for finding in findings {
            match finding.outcome {
                Outcome::Pass => summary.pass += 1,
                Outcome::Warn => summary.warn += 1,
                Outcome::Fail => summary.fail += 1,
            }
        }
        summary
    }
}

struct Checker<'a> {
    conn: &'a Connection,
    run_id: Uuid,
    thresholds: &'a QualityConfig,
    checked_at: DateTime<Utc>,
    findings: Vec<QualityFinding>,
}

impl Checker<'_> {
    fn record(
        &mut self,
        category: RuleCategory,
        check_name: &str,
        table: &str,
        column: Option<&str>,
        outcome: Outcome,
        detail: String,
    ) {
        self.findings.push(QualityFinding {
            run_id: self.run_id,
            category,
            check_name: check_name.to_string(),
            table_name: table.to_string(),
            column_name: column.map(str::to_string),
            outcome,
            detail,
            checked_at: self.checked_at,
        });
    }

    fn count(&self, sql: &str) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }

    fn check_table(&mut self, table: &str) -> Result<(), StorageError> {
        let qualified = format!("cdm.{}", quote_ident(table));
        let rows = self.count(&format!("SELECT count(*) FROM {qualified}"))?;
        let outcome = if rows > 0 { Outcome::Pass } else { Outcome::Fail };
        self.record(
            RuleCategory::Completeness,
            "table_not_empty",
            table,
            None,
            outcome,
            format!("{rows} rows"),
        );
        if rows == 0 {
            return Ok(());
        }

        let primary_key = format!("{table}_id");
        for column in table_columns(self.conn, "cdm", table)? {
            let col = quote_ident(&column);
            let nulls = self.count(&format!(
                "SELECT count(*) FROM {qualified} WHERE {col} IS NULL OR {col} = ''"
            ))?;
            let ratio = nulls as f64 / rows as f64;
            let outcome = if ratio > self.thresholds.null_fail_ratio {
                Outcome::Fail
            } else if ratio > self.thresholds.null_warn_ratio {
                Outcome::Warn
            } else {
                Outcome::Pass
            };
            self.record(
                RuleCategory::Completeness,
                "column_null_ratio",
                table,
                Some(&column),
                outcome,
                format!("{nulls} of {rows} values missing ({:.1}%)", ratio * 100.0),
            );

            if column.eq_ignore_ascii_case(&primary_key) {
                let distinct = self.count(&format!(
                    "SELECT count(DISTINCT {col}) FROM {qualified} WHERE {col} IS NOT NULL AND {col} <> ''"
                ))?;
                let present = rows - nulls;
                let duplicates = present - distinct;
                self.record(
                    RuleCategory::Conformance,
                    "primary_key_unique",
                    table,
                    Some(&column),
                    if duplicates > 0 { Outcome::Fail } else { Outcome::Pass },
                    format!("{duplicates} duplicate values"),
                );
            }

            let lower = column.to_lowercase();
            let now = if lower.ends_with("_datetime") {
                Some("datetime('now')")
            } else if lower.ends_with("_date") {
                Some("date('now')")
            } else {
                None
            };
            if let Some(now) = now {
                let future = self.count(&format!(
                    "SELECT count(*) FROM {qualified} WHERE {col} IS NOT NULL AND {col} <> '' AND {col} > {now}"
                ))?;
                self.record(
                    RuleCategory::Plausibility,
                    "date_not_in_future",
                    table,
                    Some(&column),
                    if future > 0 { Outcome::Fail } else { Outcome::Pass },
                    format!("{future} values after today"),
                );
            }
        }
        Ok(())
    }
}

/// Evaluate every rule against the mapped namespace.
pub fn evaluate(
    db: &Database,
    conn: &Connection,
    run_id: Uuid,
    thresholds: &QualityConfig,
) -> Result<Vec<QualityFinding>, StorageError> {
    let mut checker = Checker {
        conn,
        run_id,
        thresholds,
        checked_at: Utc::now(),
        findings: Vec::new(),
    };

    let tables = db.list_tables(conn, Namespace::Mapped)?;
    if tables.is_empty() {
        checker.record(
            RuleCategory::Completeness,
            "cdm_tables_present",
            Namespace::Mapped.schema(),
            None,
            Outcome::Fail,
            "the mapped namespace holds no tables".into(),
        );
    }
    for table in &tables {
        checker.check_table(table)?;
    }
    Ok(checker.findings)
}

/// Append findings to `results.quality_findings`.
pub fn store(conn: &Connection, findings: &[QualityFinding]) -> Result<(), StorageError> {
    conn.execute_batch(CREATE_FINDINGS)?;
    let mut stmt = conn.prepare(
        "INSERT INTO results.quality_findings
         (run_id, category, check_name, table_name, column_name, outcome, detail, checked_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for finding in findings {
        stmt.execute(params![
            finding.run_id.to_string(),
            finding.category.as_str(),
            finding.check_name,
            finding.table_name,
            finding.column_name,
            finding.outcome.to_string(),
            finding.detail,
            finding.checked_at.to_rfc3339(),
        ])?;
    }
    Ok(())
}
