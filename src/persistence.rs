//! Policy Persistence
//!
//! Optional durable storage for policy versions, acceptance, the active
//! pointer and evaluation records. The loop behaves identically without it;
//! persistence only adds durability across restarts.
//!
//! Rows are insert-only: re-saving an existing version id is an error, so a
//! reload sees exactly the immutable history that was written.

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{LoopError, Result};
use crate::evaluator::EvaluationRecord;
use crate::feedback_loop::{AuditEntry, EvaluationRole};
use crate::policy::{PolicyStore, PolicyVersion};

/// Durable storage for loop history
pub trait PolicyPersistence: Send + Sync {
    fn save_version(&self, version: &PolicyVersion) -> Result<()>;
    fn save_accepted(&self, version_id: u64) -> Result<()>;
    fn save_active(&self, version_id: u64) -> Result<()>;
    fn save_last_cycle(&self, cycle_id: u64) -> Result<()>;
    fn save_evaluation(&self, evaluation: &AuditEntry) -> Result<()>;

    /// All versions in id order
    fn load_versions(&self) -> Result<Vec<PolicyVersion>>;
    fn load_accepted(&self) -> Result<BTreeSet<u64>>;
    fn load_active(&self) -> Result<Option<u64>>;
    fn load_last_cycle(&self) -> Result<u64>;
    fn load_evaluations(&self) -> Result<Vec<AuditEntry>>;
}

/// Rebuild a policy store from persisted state
///
/// Returns None when nothing has been persisted yet.
pub fn restore_store(persistence: &dyn PolicyPersistence) -> Result<Option<PolicyStore>> {
    let versions = persistence.load_versions()?;
    if versions.is_empty() {
        return Ok(None);
    }
    let accepted = persistence.load_accepted()?;
    let active = persistence.load_active()?.unwrap_or(1);
    PolicyStore::restore(versions, accepted, active).map(Some)
}

fn db_err(e: impl std::fmt::Display) -> LoopError {
    LoopError::Persistence(e.to_string())
}

/// SQLite-backed persistence
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open or create a database file
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Policy persistence opened: {}", path.display());
        Ok(store)
    }

    /// In-memory database (tests and dry runs)
    pub fn in_memory() -> anyhow::Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS policy_versions (
                version_id INTEGER PRIMARY KEY,
                parent_version_id INTEGER REFERENCES policy_versions(version_id),
                digest TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS policy_parameters (
                version_id INTEGER NOT NULL REFERENCES policy_versions(version_id),
                name TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (version_id, name)
            );

            CREATE TABLE IF NOT EXISTS accepted_versions (
                version_id INTEGER PRIMARY KEY REFERENCES policy_versions(version_id)
            );

            CREATE TABLE IF NOT EXISTS loop_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('active', 'candidate')),
                version_id INTEGER NOT NULL,
                score REAL NOT NULL,
                verdict TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_evaluations_cycle ON evaluations(cycle_id);
            "#,
        )?;
        Ok(())
    }

    fn set_state(&self, key: &str, value: u64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO loop_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .lock()
            .query_row("SELECT value FROM loop_state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        Ok(value.map(|v| v as u64))
    }
}

impl PolicyPersistence for SqlitePersistence {
    fn save_version(&self, version: &PolicyVersion) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(
            "INSERT INTO policy_versions (version_id, parent_version_id, digest, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                version.version_id as i64,
                version.parent_version_id.map(|p| p as i64),
                version.digest,
                version.created_at
            ],
        )
        .map_err(db_err)?;

        for (name, value) in &version.parameters {
            tx.execute(
                "INSERT INTO policy_parameters (version_id, name, value) VALUES (?1, ?2, ?3)",
                params![version.version_id as i64, name, value],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        debug!("Persisted policy version {}", version.version_id);
        Ok(())
    }

    fn save_accepted(&self, version_id: u64) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO accepted_versions (version_id) VALUES (?1)",
                params![version_id as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn save_active(&self, version_id: u64) -> Result<()> {
        self.set_state("active_version_id", version_id)
    }

    fn save_last_cycle(&self, cycle_id: u64) -> Result<()> {
        self.set_state("last_cycle_id", cycle_id)
    }

    fn save_evaluation(&self, evaluation: &AuditEntry) -> Result<()> {
        let record = serde_json::to_string(&evaluation.record).map_err(db_err)?;

        self.conn
            .lock()
            .execute(
                "INSERT INTO evaluations (cycle_id, role, version_id, score, verdict, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    evaluation.cycle_id as i64,
                    evaluation.role.as_str(),
                    evaluation.record.version_id as i64,
                    evaluation.record.score,
                    evaluation.record.verdict.as_str(),
                    record
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn load_versions(&self) -> Result<Vec<PolicyVersion>> {
        let conn = self.conn.lock();

        let mut params_by_version: BTreeMap<u64, BTreeMap<String, f64>> = BTreeMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT version_id, name, value FROM policy_parameters")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
                })
                .map_err(db_err)?;
            for row in rows {
                let (version_id, name, value) = row.map_err(db_err)?;
                params_by_version
                    .entry(version_id as u64)
                    .or_default()
                    .insert(name, value);
            }
        }

        let mut stmt = conn
            .prepare(
                "SELECT version_id, parent_version_id, digest, created_at
                 FROM policy_versions ORDER BY version_id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(db_err)?;

        let mut versions = Vec::new();
        for row in rows {
            let (version_id, parent, digest, created_at) = row.map_err(db_err)?;
            let version_id = version_id as u64;
            versions.push(PolicyVersion {
                version_id,
                parameters: params_by_version.remove(&version_id).unwrap_or_default(),
                parent_version_id: parent.map(|p| p as u64),
                created_at,
                digest,
            });
        }
        Ok(versions)
    }

    fn load_accepted(&self) -> Result<BTreeSet<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT version_id FROM accepted_versions")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .map_err(db_err)?
            .map(|r| r.map(|id| id as u64).map_err(db_err))
            .collect::<Result<BTreeSet<u64>>>()?;
        Ok(ids)
    }

    fn load_active(&self) -> Result<Option<u64>> {
        self.get_state("active_version_id")
    }

    fn load_last_cycle(&self) -> Result<u64> {
        Ok(self.get_state("last_cycle_id")?.unwrap_or(0))
    }

    fn load_evaluations(&self) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT cycle_id, role, record FROM evaluations ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut evaluations = Vec::new();
        for row in rows {
            let (cycle_id, role, record) = row.map_err(db_err)?;
            let role = EvaluationRole::parse(&role)
                .ok_or_else(|| LoopError::Persistence(format!("unknown role '{}'", role)))?;
            let record: EvaluationRecord = serde_json::from_str(&record).map_err(db_err)?;
            evaluations.push(AuditEntry {
                cycle_id: cycle_id as u64,
                role,
                record,
            });
        }
        Ok(evaluations)
    }
}
