//! Build history store.

use super::{Database, db_err};
use buildlite_shared::errors::{BuildliteError, BuildliteResult};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = BuildliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BuildStatus::Running),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(BuildliteError::Database(format!(
                "unknown build status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub id: String,
    pub project: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_digest: Option<String>,
    pub environment_digest: Option<String>,
    pub image_digest: Option<String>,
    /// Manifest digest of the base image layout the image was built on.
    pub base_digest: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

/// Builds with the same inputs but different environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismMismatch {
    pub input_digest: String,
    /// `(build id, environment digest)` of every succeeded build.
    pub builds: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct BuildStore {
    db: Database,
}

const COLUMNS: &str = "id, project, status, created_at, finished_at, input_digest, \
                       environment_digest, image_digest, base_digest, failed_stage, error";

impl BuildStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record_started(&self, id: &str, project: &str) -> BuildliteResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO builds (id, project, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, project, BuildStatus::Running.as_str(), Utc::now().to_rfc3339()],
        ))?;
        Ok(())
    }

    pub fn record_succeeded(
        &self,
        id: &str,
        input_digest: &str,
        environment_digest: &str,
        image_digest: &str,
        base_digest: Option<&str>,
    ) -> BuildliteResult<()> {
        let conn = self.db.conn();
        let updated = db_err!(conn.execute(
            "UPDATE builds SET status = ?2, finished_at = ?3, input_digest = ?4,
                 environment_digest = ?5, image_digest = ?6, base_digest = ?7
             WHERE id = ?1",
            params![
                id,
                BuildStatus::Succeeded.as_str(),
                Utc::now().to_rfc3339(),
                input_digest,
                environment_digest,
                image_digest,
                base_digest
            ],
        ))?;
        expect_one(id, updated)
    }

    pub fn record_failed(
        &self,
        id: &str,
        input_digest: Option<&str>,
        failed_stage: Option<&str>,
        error: &str,
    ) -> BuildliteResult<()> {
        let conn = self.db.conn();
        let updated = db_err!(conn.execute(
            "UPDATE builds SET status = ?2, finished_at = ?3, input_digest = ?4,
                 failed_stage = ?5, error = ?6
             WHERE id = ?1",
            params![
                id,
                BuildStatus::Failed.as_str(),
                Utc::now().to_rfc3339(),
                input_digest,
                failed_stage,
                error
            ],
        ))?;
        expect_one(id, updated)
    }

    pub fn get(&self, id: &str) -> BuildliteResult<Option<BuildRecord>> {
        let conn = self.db.conn();
        let row = db_err!(
            conn.query_row(
                &format!("SELECT {} FROM builds WHERE id = ?1", COLUMNS),
                params![id],
                read_row,
            )
            .optional()
        )?;
        row.map(into_record).transpose()
    }

    /// Most recent builds first.
    pub fn list(&self, limit: usize) -> BuildliteResult<Vec<BuildRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(&format!(
            "SELECT {} FROM builds ORDER BY created_at DESC, id DESC LIMIT ?1",
            COLUMNS
        )))?;
        let rows = db_err!(stmt.query_map(params![limit as i64], read_row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(db_err!(row)?)?);
        }
        Ok(records)
    }

    /// Succeeded builds that share an input digest must share an
    /// environment digest.
    pub fn verify_determinism(&self) -> BuildliteResult<Vec<DeterminismMismatch>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT input_digest, id, environment_digest FROM builds
             WHERE status = ?1 AND input_digest IS NOT NULL AND environment_digest IS NOT NULL
             ORDER BY input_digest, created_at"
        ))?;
        let rows = db_err!(stmt.query_map(params![BuildStatus::Succeeded.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        }))?;

        let mut by_input: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for row in rows {
            let (input, id, env) = db_err!(row)?;
            by_input.entry(input).or_default().push((id, env));
        }

        Ok(by_input
            .into_iter()
            .filter(|(_, builds)| builds.iter().any(|(_, env)| *env != builds[0].1))
            .map(|(input_digest, builds)| DeterminismMismatch {
                input_digest,
                builds,
            })
            .collect())
    }
}

type RawRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn into_record(raw: RawRow) -> BuildliteResult<BuildRecord> {
    let (
        id,
        project,
        status,
        created_at,
        finished_at,
        input_digest,
        environment_digest,
        image_digest,
        base_digest,
        failed_stage,
        error,
    ) = raw;
    Ok(BuildRecord {
        id,
        project,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
        input_digest,
        environment_digest,
        image_digest,
        base_digest,
        failed_stage,
        error,
    })
}

fn parse_time(s: &str) -> BuildliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BuildliteError::Database(format!("invalid timestamp '{}': {}", s, e)))
}

fn expect_one(id: &str, updated: usize) -> BuildliteResult<()> {
    if updated == 1 {
        Ok(())
    } else {
        Err(BuildliteError::Database(format!("build {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BuildStore {
        BuildStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_build_lifecycle() {
        let store = store();
        store.record_started("b1", "demo").unwrap();
        assert_eq!(store.get("b1").unwrap().unwrap().status, BuildStatus::Running);

        store.record_succeeded("b1", "in", "env", "sha256:img", None).unwrap();
        let record = store.get("b1").unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Succeeded);
        assert_eq!(record.image_digest.as_deref(), Some("sha256:img"));
        assert!(record.finished_at.is_some());

        store.record_started("b2", "demo").unwrap();
        store
            .record_failed("b2", None, Some("builder"), "integrity check failed")
            .unwrap();
        let record = store.get("b2").unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
        assert_eq!(record.failed_stage.as_deref(), Some("builder"));

        assert_eq!(store.list(10).unwrap().len(), 2);
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.record_succeeded("missing", "a", "b", "c", None).is_err());
    }

    #[test]
    fn test_verify_determinism() {
        let store = store();
        for (id, input, env) in [("a", "i1", "e1"), ("b", "i1", "e1"), ("c", "i2", "e2")] {
            store.record_started(id, "demo").unwrap();
            store.record_succeeded(id, input, env, "img", None).unwrap();
        }
        assert!(store.verify_determinism().unwrap().is_empty());

        store.record_started("d", "demo").unwrap();
        store.record_succeeded("d", "i2", "e3", "img", None).unwrap();
        let mismatches = store.verify_determinism().unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].input_digest, "i2");
        assert_eq!(mismatches[0].builds.len(), 2);
    }
}
