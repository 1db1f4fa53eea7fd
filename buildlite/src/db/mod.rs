//! Build history database.
//!
//! SQLite-backed. One row per build, inserted as `running` when the
//! pipeline starts and finalized when it ends. Opening a database created
//! by an older buildlite applies the pending migrations in one
//! transaction.

mod builds;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use buildlite_shared::errors::{BuildliteError, BuildliteResult};

pub use builds::{BuildRecord, BuildStatus, BuildStore, DeterminismMismatch};

/// Map a rusqlite result into `BuildliteError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| BuildliteError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// Shared handle to the history database, wrapped by `BuildStore`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> BuildliteResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = db_err!(Connection::open(db_path))?;

        // WAL lets `buildlite history` read while a build writes.
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA busy_timeout=100000;
            "
        ))?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> BuildliteResult<Self> {
        Self::with_schema(db_err!(Connection::open_in_memory())?)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn with_schema(mut conn: Connection) -> BuildliteResult<Self> {
        let tx = db_err!(conn.transaction())?;
        let version = init_schema(&tx)?;
        db_err!(tx.commit())?;
        tracing::debug!(version, "Build history schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Create or upgrade the schema, returning the resulting version.
fn init_schema(tx: &Transaction<'_>) -> BuildliteResult<i32> {
    db_err!(tx.execute_batch(schema::SCHEMA_VERSION_TABLE))?;
    let found: Option<i32> = db_err!(
        tx.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
    )?;

    let now = Utc::now().to_rfc3339();
    match found {
        None => {
            db_err!(tx.execute_batch(schema::CURRENT))?;
            db_err!(tx.execute(
                "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                params![schema::SCHEMA_VERSION, now],
            ))?;
            tracing::info!(version = schema::SCHEMA_VERSION, "Created build history database");
        }
        Some(v) if v > schema::SCHEMA_VERSION => {
            return Err(BuildliteError::Database(format!(
                "build history schema version {} is newer than supported {}; upgrade buildlite",
                v,
                schema::SCHEMA_VERSION
            )));
        }
        Some(v) if v < schema::SCHEMA_VERSION => {
            for (target, sql) in schema::MIGRATIONS.iter().filter(|(target, _)| *target > v) {
                tx.execute_batch(sql).map_err(|e| {
                    BuildliteError::Database(format!("migration to version {} failed: {}", target, e))
                })?;
            }
            db_err!(tx.execute(
                "UPDATE schema_version SET version = ?1, updated_at = ?2 WHERE id = 1",
                params![schema::SCHEMA_VERSION, now],
            ))?;
            tracing::info!(from = v, to = schema::SCHEMA_VERSION, "Migrated build history database");
        }
        Some(_) => {}
    }
    Ok(schema::SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// The builds table as the first release wrote it.
    const VERSION_1: &str = "
        CREATE TABLE schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        INSERT INTO schema_version VALUES (1, 1, '2024-01-01T00:00:00+00:00');
        CREATE TABLE builds (
            id TEXT PRIMARY KEY NOT NULL,
            project TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            finished_at TEXT,
            input_digest TEXT,
            environment_digest TEXT,
            image_digest TEXT,
            failed_stage TEXT,
            error TEXT
        );
        INSERT INTO builds (id, project, status, created_at, input_digest, environment_digest)
            VALUES ('old', 'demo', 'succeeded', '2024-01-01T00:00:00+00:00', 'i1', 'e1');
    ";

    fn version(db: &Database) -> i32 {
        db.conn()
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_db_open() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        assert_eq!(version(&db), schema::SCHEMA_VERSION);
        drop(db);
        let db = Database::open(&db_path).unwrap();
        assert_eq!(version(&db), schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_version_1_database_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        Connection::open(&db_path)
            .unwrap()
            .execute_batch(VERSION_1)
            .unwrap();

        let db = Database::open(&db_path).unwrap();
        assert_eq!(version(&db), schema::SCHEMA_VERSION);

        let store = BuildStore::new(db);
        let old = store.get("old").unwrap().unwrap();
        assert_eq!(old.environment_digest.as_deref(), Some("e1"));
        assert!(old.base_digest.is_none());

        store.record_started("new", "demo").unwrap();
        store
            .record_succeeded("new", "i1", "e1", "sha256:img", Some("sha256:base"))
            .unwrap();
        let new = store.get("new").unwrap().unwrap();
        assert_eq!(new.base_digest.as_deref(), Some("sha256:base"));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        db.conn()
            .execute("UPDATE schema_version SET version = 999 WHERE id = 1", [])
            .unwrap();
        drop(db);

        let err = Database::open(&db_path).err().unwrap();
        assert!(matches!(err, BuildliteError::Database(_)));
        assert!(err.to_string().contains("999"));
    }
}
