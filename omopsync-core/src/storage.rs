//! SQLite storage with one database file per namespace.
//!
//! The catalog database `omop.sqlite` is the connection's `main` schema. Each
//! namespace lives in its own file and is attached under a fixed schema name,
//! so SQL addresses tables as `raw.visits`, `cdm.person`, `results.quality_findings`.

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::StorageError;

/// File name of the catalog database.
pub const CATALOG_FILE: &str = "omop.sqlite";

/// Marker table written into every namespace on creation.
pub const MARKER_TABLE: &str = "_namespace";

/// Serializes every writer to the namespaces: pipeline stages and scripts.
pub type WriterLock = Arc<tokio::sync::Mutex<()>>;

/// One of the three fixed logical containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Raw,
    Mapped,
    Results,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Raw, Namespace::Mapped, Namespace::Results];

    /// The schema name the namespace is attached under.
    pub fn schema(&self) -> &'static str {
        match self {
            Namespace::Raw => "raw",
            Namespace::Mapped => "cdm",
            Namespace::Results => "results",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Namespace::Raw => "raw",
            Namespace::Mapped => "mapped",
            Namespace::Results => "results",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.sqlite", self.schema())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a connection may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Handle on the storage directory. Cheap to clone; connections are opened per use.
#[derive(Debug, Clone)]
pub struct Database {
    data_dir: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Create the data directory if needed and return a handle on it.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| StorageError::Connection {
            path: config.data_dir.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            data_dir: config.data_dir.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    pub fn namespace_path(&self, namespace: Namespace) -> PathBuf {
        self.data_dir.join(namespace.file_name())
    }

    /// Whether the namespace database exists and carries its marker table.
    pub fn namespace_exists(&self, namespace: Namespace) -> Result<bool, StorageError> {
        let path = self.namespace_path(namespace);
        if !path.exists() {
            return Ok(false);
        }
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| connection_error(&path, e))?;
        has_table(&conn, "main", MARKER_TABLE)
    }

    /// Open a connection to a single namespace file, creating it when absent.
    pub fn open_namespace_file(&self, namespace: Namespace) -> Result<Connection, StorageError> {
        let path = self.namespace_path(namespace);
        let conn = Connection::open(&path).map_err(|e| connection_error(&path, e))?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Open a catalog connection with every existing namespace attached.
    pub fn connect(&self, access: Access) -> Result<Connection, StorageError> {
        let path = self.catalog_path();
        let conn = Connection::open(&path).map_err(|e| connection_error(&path, e))?;
        conn.busy_timeout(self.busy_timeout)?;

        for namespace in Namespace::ALL {
            let ns_path = self.namespace_path(namespace);
            if !ns_path.exists() {
                continue;
            }
            let attach = format!(
                "ATTACH DATABASE '{}' AS {}",
                escape_literal(&ns_path.display().to_string()),
                namespace.schema()
            );
            conn.execute_batch(&attach)
                .map_err(|e| connection_error(&ns_path, e))?;
        }

        if access == Access::ReadOnly {
            conn.pragma_update(None, "query_only", true)?;
        }
        debug!(data_dir = %self.data_dir.display(), ?access, "Opened storage connection");
        Ok(conn)
    }

    /// Names of the user tables in a namespace, sorted.
    pub fn list_tables(
        &self,
        conn: &Connection,
        namespace: Namespace,
    ) -> Result<Vec<String>, StorageError> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1 \
             ORDER BY name",
            namespace.schema()
        );
        let mut stmt = conn.prepare(&sql)?;
        let names = stmt
            .query_map([MARKER_TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

/// Whether `table` exists in `schema` on this connection.
pub fn has_table(conn: &Connection, schema: &str, table: &str) -> Result<bool, StorageError> {
    let sql = format!("SELECT count(*) FROM {schema}.sqlite_master WHERE type = 'table' AND name = ?1");
    let count: i64 = conn.query_row(&sql, [table], |row| row.get(0))?;
    Ok(count > 0)
}

/// Column names of `schema.table`, in declaration order.
pub fn table_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> Result<Vec<String>, StorageError> {
    let sql = format!("PRAGMA {schema}.table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn connection_error(path: &Path, err: rusqlite::Error) -> StorageError {
    StorageError::Connection {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
