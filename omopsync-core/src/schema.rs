//! Idempotent creation and verification of the storage namespaces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

use crate::error::StorageError;
use crate::storage::{Database, MARKER_TABLE, Namespace};

/// What `ensure_namespaces` did for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceState {
    Created,
    AlreadyPresent,
}

/// Per-namespace outcome of an ensure pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureReport {
    pub namespaces: BTreeMap<Namespace, NamespaceState>,
}

impl EnsureReport {
    pub fn created(&self) -> Vec<Namespace> {
        self.namespaces
            .iter()
            .filter(|(_, state)| **state == NamespaceState::Created)
            .map(|(ns, _)| *ns)
            .collect()
    }

    pub fn summary(&self) -> String {
        self.namespaces
            .iter()
            .map(|(ns, state)| {
                let state = match state {
                    NamespaceState::Created => "created",
                    NamespaceState::AlreadyPresent => "already present",
                };
                format!("{ns} ({}): {state}", ns.schema())
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Creates the three namespaces on demand. Only structure is touched.
pub struct SchemaManager {
    db: Database,
    guard: Mutex<()>,
}

impl SchemaManager {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            guard: Mutex::new(()),
        }
    }

    /// Check every namespace and create the missing ones.
    pub fn ensure_namespaces(&self) -> Result<EnsureReport, StorageError> {
        let _guard = self.guard.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut namespaces = BTreeMap::new();

        for namespace in Namespace::ALL {
            let state = if self.db.namespace_exists(namespace)? {
                NamespaceState::AlreadyPresent
            } else {
                self.create(namespace)?;
                info!(namespace = %namespace, schema = namespace.schema(), "Created namespace");
                NamespaceState::Created
            };
            namespaces.insert(namespace, state);
        }

        Ok(EnsureReport { namespaces })
    }

    /// Namespaces that are currently missing.
    pub fn missing(&self) -> Result<Vec<Namespace>, StorageError> {
        let mut missing = Vec::new();
        for namespace in Namespace::ALL {
            if !self.db.namespace_exists(namespace)? {
                missing.push(namespace);
            }
        }
        Ok(missing)
    }

    fn create(&self, namespace: Namespace) -> Result<(), StorageError> {
        let conn = self.db.open_namespace_file(namespace)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {MARKER_TABLE} (
                name TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"
        ))?;
        conn.execute(
            &format!(
                "INSERT INTO {MARKER_TABLE} (name, schema_name, created_at)
                 SELECT ?1, ?2, ?3 WHERE NOT EXISTS (SELECT 1 FROM {MARKER_TABLE})"
            ),
            rusqlite::params![
                namespace.label(),
                namespace.schema(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (SchemaManager, Database) {
        let db = Database::open(&StorageConfig {
            data_dir: dir.path().to_path_buf(),
            busy_timeout_ms: 1_000,
        })
        .unwrap();
        (SchemaManager::new(db.clone()), db)
    }

    #[test]
    fn test_first_pass_creates_everything() {
        let dir = TempDir::new().unwrap();
        let (manager, db) = manager(&dir);
        assert_eq!(manager.missing().unwrap().len(), 3);

        let report = manager.ensure_namespaces().unwrap();
        assert_eq!(report.created(), Namespace::ALL.to_vec());
        for namespace in Namespace::ALL {
            assert!(db.namespace_exists(namespace).unwrap());
        }
        assert!(manager.missing().unwrap().is_empty());
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir);
        manager.ensure_namespaces().unwrap();
        let report = manager.ensure_namespaces().unwrap();
        assert!(report.created().is_empty());
        assert!(
            report
                .namespaces
                .values()
                .all(|state| *state == NamespaceState::AlreadyPresent)
        );
        assert!(report.summary().contains("mapped (cdm): already present"));
    }

    #[test]
    fn test_recreates_only_missing_namespace() {
        let dir = TempDir::new().unwrap();
        let (manager, db) = manager(&dir);
        manager.ensure_namespaces().unwrap();
        std::fs::remove_file(db.namespace_path(Namespace::Results)).unwrap();

        let report = manager.ensure_namespaces().unwrap();
        assert_eq!(report.created(), vec![Namespace::Results]);
    }

    #[test]
    fn test_existing_data_is_untouched() {
        let dir = TempDir::new().unwrap();
        let (manager, db) = manager(&dir);
        manager.ensure_namespaces().unwrap();
        db.open_namespace_file(Namespace::Mapped)
            .unwrap()
            .execute_batch("CREATE TABLE person (person_id INTEGER); INSERT INTO person VALUES (7);")
            .unwrap();

        manager.ensure_namespaces().unwrap();
        let conn = db.open_namespace_file(Namespace::Mapped).unwrap();
        let id: i64 = conn
            .query_row("SELECT person_id FROM person", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 7);
    }
}
