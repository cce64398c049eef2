//! Validated execution of read-only queries and of DDL/DML script files.

use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::QueryError;
use crate::storage::{Access, Database, WriterLock};

/// Keywords a read-only query may start with.
const LEADING_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "EXPLAIN"];

/// Keywords that never appear in a read-only query outside literals.
const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "ATTACH", "DETACH", "PRAGMA",
    "VACUUM", "REINDEX", "TRUNCATE", "ANALYZE", "SAVEPOINT", "RELEASE", "BEGIN", "COMMIT",
    "ROLLBACK",
];

/// Rows returned by a query, keyed by column name in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Render the first `max_rows` rows as a pipe-separated table.
    pub fn preview(&self, max_rows: usize) -> String {
        let mut lines = vec![self.columns.join(" | ")];
        lines.push("-".repeat(lines[0].len().max(3)));
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|col| match row.get(col) {
                    None | Some(Value::Null) => "NULL".to_string(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect();
            lines.push(cells.join(" | "));
        }
        if self.rows.len() > max_rows {
            lines.push(format!("... ({} more rows)", self.rows.len() - max_rows));
        }
        lines.push(format!("({} rows)", self.rows.len()));
        lines.join("\n")
    }
}

/// Outcome of applying a script file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub path: PathBuf,
    pub statements: usize,
}

/// Runs read-only queries without any pipeline lock and scripts under the writer lock.
#[derive(Clone)]
pub struct QueryEngine {
    db: Database,
    writer: WriterLock,
    sql_dir: PathBuf,
}

impl QueryEngine {
    pub fn new(db: Database, writer: WriterLock, sql_dir: PathBuf) -> Self {
        Self {
            db,
            writer,
            sql_dir,
        }
    }

    /// Validate and execute a single read-only statement.
    pub async fn execute(&self, sql: &str) -> Result<QueryResult, QueryError> {
        validate_read_only(sql)?;
        let db = self.db.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || run_query(&db, &sql))
            .await
            .map_err(|e| QueryError::Driver {
                message: format!("query task failed: {e}"),
            })?
    }

    /// Resolve a script path against the configured SQL directory.
    pub fn resolve_script(&self, filepath: &str) -> Result<PathBuf, QueryError> {
        let path = Path::new(filepath);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sql_dir.join(path)
        };
        if !path.is_file() {
            return Err(QueryError::ScriptNotFound { path });
        }
        Ok(path)
    }

    /// Apply a DDL/DML script in one transaction under the writer lock.
    pub async fn apply_script(&self, filepath: &str) -> Result<ScriptOutcome, QueryError> {
        let path = self.resolve_script(filepath)?;
        let script = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| QueryError::Driver {
                message: format!("cannot read {}: {e}", path.display()),
            })?;
        let statements = scan_statements(&script).len();
        if statements == 0 {
            return Err(QueryError::Empty);
        }

        let _writer = self.writer.lock().await;
        let db = self.db.clone();
        let script_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), QueryError> {
            let mut conn = db.connect(Access::ReadWrite)?;
            let tx = conn.transaction()?;
            tx.execute_batch(&script)?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| QueryError::Driver {
            message: format!("script task failed: {e}"),
        })??;

        info!(path = %script_path.display(), statements, "Applied SQL script");
        Ok(ScriptOutcome {
            path: script_path,
            statements,
        })
    }
}

fn run_query(db: &Database, sql: &str) -> Result<QueryResult, QueryError> {
    let conn = db.connect(Access::ReadOnly)?;
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(QueryError::NotReadOnly {
            reason: "the statement would modify the database".into(),
        });
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = Vec::new();
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        let mut record = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        rows.push(record);
    }

    debug!(rows = rows.len(), columns = columns.len(), "Query executed");
    Ok(QueryResult { columns, rows })
}

/// Convert a SQLite value into JSON.
pub fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

/// Reject anything but a single read-only statement.
pub fn validate_read_only(sql: &str) -> Result<(), QueryError> {
    let statements = scan_statements(sql);
    let words = match statements.as_slice() {
        [] => return Err(QueryError::Empty),
        [single] => single,
        _ => return Err(QueryError::MultipleStatements),
    };

    let leading = words.first().map(String::as_str).unwrap_or_default();
    if !LEADING_KEYWORDS.contains(&leading) {
        return Err(QueryError::NotReadOnly {
            reason: format!(
                "queries must start with {}, found '{leading}'",
                LEADING_KEYWORDS.join(", ")
            ),
        });
    }
    if let Some(word) = words
        .iter()
        .find(|word| MUTATING_KEYWORDS.contains(&word.as_str()))
    {
        return Err(QueryError::NotReadOnly {
            reason: format!("'{word}' is not allowed in a read-only query"),
        });
    }
    Ok(())
}

/// Split SQL into statements, keeping the upper-cased bare words of each.
///
/// Words inside string literals, quoted identifiers, and comments are
/// skipped. Statements with no content are dropped.
pub fn scan_statements(sql: &str) -> Vec<Vec<String>> {
    let mut statements = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut has_content = false;
    let mut chars = sql.chars().peekable();

    let flush_word = |word: &mut String, words: &mut Vec<String>| {
        if !word.is_empty() {
            words.push(word.to_ascii_uppercase());
            word.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' | '[' => {
                flush_word(&mut word, &mut words);
                has_content = true;
                let close = if c == '[' { ']' } else { c };
                while let Some(inner) = chars.next() {
                    if inner == close {
                        // doubled quote is an escape
                        if close != ']' && chars.peek() == Some(&close) {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                flush_word(&mut word, &mut words);
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                flush_word(&mut word, &mut words);
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            ';' => {
                flush_word(&mut word, &mut words);
                if has_content {
                    statements.push(std::mem::take(&mut words));
                }
                words.clear();
                has_content = false;
            }
            c if c.is_alphanumeric() || c == '_' => {
                has_content = true;
                word.push(c);
            }
            c => {
                flush_word(&mut word, &mut words);
                if !c.is_whitespace() {
                    has_content = true;
                }
            }
        }
    }
    flush_word(&mut word, &mut words);
    if has_content {
        statements.push(words);
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::Namespace;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> (QueryEngine, Database) {
        let db = Database::open(&StorageConfig {
            data_dir: dir.path().join("data"),
            busy_timeout_ms: 1_000,
        })
        .unwrap();
        db.open_namespace_file(Namespace::Mapped)
            .unwrap()
            .execute_batch(
                "CREATE TABLE person (person_id INTEGER, gender TEXT, weight REAL);
                 INSERT INTO person VALUES (1, 'F', 61.5), (2, 'M', NULL), (3, 'F', 70.0);",
            )
            .unwrap();
        let engine = QueryEngine::new(
            db.clone(),
            Arc::new(tokio::sync::Mutex::new(())),
            dir.path().join("sql"),
        );
        (engine, db)
    }

    #[test]
    fn test_scan_statements() {
        assert!(scan_statements("  -- nothing\n /* here */ ").is_empty());
        assert_eq!(scan_statements("SELECT 1;").len(), 1);
        assert_eq!(scan_statements("SELECT 1; SELECT 2").len(), 2);
        assert_eq!(
            scan_statements("select 'drop; table' as x -- delete\n"),
            vec![vec!["SELECT".to_string(), "AS".to_string(), "X".to_string()]]
        );
        assert_eq!(scan_statements("SELECT \"it\"\"s\" FROM t").len(), 1);
    }

    #[test]
    fn test_validate_read_only() {
        assert!(validate_read_only("SELECT count(*) FROM cdm.person").is_ok());
        assert!(validate_read_only("with x as (select 1) select * from x;").is_ok());
        assert!(validate_read_only("SELECT 'DELETE' AS word").is_ok());

        assert!(matches!(validate_read_only("   "), Err(QueryError::Empty)));
        assert!(matches!(
            validate_read_only("SELECT 1; DROP TABLE cdm.person"),
            Err(QueryError::MultipleStatements)
        ));
        assert!(matches!(
            validate_read_only("DROP TABLE cdm.person"),
            Err(QueryError::NotReadOnly { .. })
        ));
        assert!(matches!(
            validate_read_only("WITH gone AS (SELECT 1) DELETE FROM cdm.person"),
            Err(QueryError::NotReadOnly { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_returns_rows_in_column_order() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        let result = engine
            .execute("SELECT gender, count(*), avg(weight) AS w FROM cdm.person GROUP BY gender ORDER BY gender")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["gender", "count(*)", "w"]);
        assert_eq!(result.row_count(), 2);
        let first: Vec<&String> = result.rows[0].keys().collect();
        assert_eq!(first, vec!["gender", "count(*)", "w"]);
        assert_eq!(result.rows[0]["count(*)"], serde_json::json!(2));
        assert_eq!(result.rows[1]["w"], Value::Null);
        assert!(result.preview(1).contains("... (1 more rows)"));
    }

    #[tokio::test]
    async fn test_drop_table_rejected_and_table_intact() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        let err = engine.execute("DROP TABLE cdm.person").await.unwrap_err();
        assert!(matches!(err, QueryError::NotReadOnly { .. }));

        let result = engine.execute("SELECT count(*) AS n FROM cdm.person").await.unwrap();
        assert_eq!(result.rows[0]["n"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_driver_error_surfaces_message() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        match engine.execute("SELECT * FROM cdm.nope").await.unwrap_err() {
            QueryError::Driver { message } => assert!(message.contains("no such table")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_apply_script_is_atomic() {
        let dir = TempDir::new().unwrap();
        let (engine, db) = engine(&dir);
        std::fs::create_dir_all(dir.path().join("sql")).unwrap();
        std::fs::write(
            dir.path().join("sql/good.sql"),
            "INSERT INTO cdm.person VALUES (4, 'M', 80.0);\nDELETE FROM cdm.person WHERE person_id = 1;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sql/bad.sql"),
            "DELETE FROM cdm.person;\nINSERT INTO cdm.missing VALUES (1);",
        )
        .unwrap();

        let outcome = engine.apply_script("good.sql").await.unwrap();
        assert_eq!(outcome.statements, 2);

        assert!(engine.apply_script("bad.sql").await.is_err());
        let conn = db.connect(Access::ReadOnly).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM cdm.person", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);

        assert!(matches!(
            engine.apply_script("absent.sql").await.unwrap_err(),
            QueryError::ScriptNotFound { .. }
        ));
    }
}
