//! Deployment record persistence
//!
//! The orchestrator never touches storage itself; the service layer reads
//! and writes records through [`DeploymentStore`]. Two implementations ship:
//! SQLite for the CLI and an in-memory map for tests and embedding.

use crate::model::DeploymentRecord;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Document-store interface for deployment records
pub trait DeploymentStore: Send + Sync {
    fn get(&self, project_id: &str) -> Result<Option<DeploymentRecord>>;

    /// All records, ordered by project id
    fn list(&self) -> Result<Vec<DeploymentRecord>>;

    /// Insert or replace. Inconsistent records (process without port) are refused.
    fn save(&self, record: &DeploymentRecord) -> Result<()>;

    /// Returns whether a record existed
    fn delete(&self, project_id: &str) -> Result<bool>;

    /// Ports assigned to every project except `project_id`
    fn claimed_ports_excluding(&self, project_id: &str) -> Result<HashSet<u16>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.project_id != project_id)
            .filter_map(|r| r.port)
            .collect())
    }
}

fn ensure_consistent(record: &DeploymentRecord) -> Result<()> {
    if !record.is_consistent() {
        bail!(
            "refusing to save record for {}: process {:?} without a port",
            record.project_id,
            record.process_id
        );
    }
    Ok(())
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open deployment store")?;
        // CLI invocations may overlap (e.g. a recover sweep during a deploy)
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Deployment store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }
}

/// Migration v1: deployment records
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: deployment records");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            project_id TEXT PRIMARY KEY,
            port INTEGER,
            process_id INTEGER,
            last_deployed_at TEXT,
            routes TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            CHECK (process_id IS NULL OR port IS NOT NULL)
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Migration v2: one project per port
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: unique ports");

    conn.execute_batch(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_port
            ON deployments(port) WHERE port IS NOT NULL;

        INSERT INTO schema_migrations (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

const SELECT_RECORD: &str =
    "SELECT project_id, port, process_id, last_deployed_at, routes FROM deployments";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(DeploymentRecord, String)> {
    let last_deployed_at: Option<String> = row.get(3)?;
    let record = DeploymentRecord {
        project_id: row.get(0)?,
        port: row.get(1)?,
        process_id: row.get(2)?,
        last_deployed_at: last_deployed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        routes: Vec::new(),
    };
    Ok((record, row.get(4)?))
}

fn attach_routes((mut record, routes): (DeploymentRecord, String)) -> Result<DeploymentRecord> {
    record.routes = serde_json::from_str(&routes)
        .with_context(|| format!("Corrupt routes for project {}", record.project_id))?;
    Ok(record)
}

impl DeploymentStore for SqliteStore {
    fn get(&self, project_id: &str) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE project_id = ?1", SELECT_RECORD),
                params![project_id],
                record_from_row,
            )
            .optional()
            .context("Failed to get deployment record")?;
        row.map(attach_routes).transpose()
    }

    fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY project_id", SELECT_RECORD))?;
        let rows = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(attach_routes).collect()
    }

    fn save(&self, record: &DeploymentRecord) -> Result<()> {
        ensure_consistent(record)?;
        let routes = serde_json::to_string(&record.routes)?;
        let last_deployed_at = record.last_deployed_at.map(|t| t.to_rfc3339());

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deployments (project_id, port, process_id, last_deployed_at, routes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
             ON CONFLICT(project_id) DO UPDATE SET
                port = excluded.port,
                process_id = excluded.process_id,
                last_deployed_at = excluded.last_deployed_at,
                routes = excluded.routes,
                updated_at = datetime('now')",
            params![
                record.project_id,
                record.port,
                record.process_id,
                last_deployed_at,
                routes
            ],
        )
        .with_context(|| format!("Failed to save deployment record {}", record.project_id))?;
        Ok(())
    }

    fn delete(&self, project_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM deployments WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(rows > 0)
    }

    fn claimed_ports_excluding(&self, project_id: &str) -> Result<HashSet<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT port FROM deployments WHERE port IS NOT NULL AND project_id != ?1",
        )?;
        let ports = stmt
            .query_map(params![project_id], |row| row.get::<_, u16>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ports)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeploymentStore for MemoryStore {
    fn get(&self, project_id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.records.read().get(project_id).cloned())
    }

    fn list(&self) -> Result<Vec<DeploymentRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn save(&self, record: &DeploymentRecord) -> Result<()> {
        ensure_consistent(record)?;
        let mut records = self.records.write();
        if let Some(port) = record.port {
            if let Some(other) = records
                .values()
                .find(|r| r.project_id != record.project_id && r.port == Some(port))
            {
                bail!("port {} is already assigned to {}", port, other.project_id);
            }
        }
        records.insert(record.project_id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, project_id: &str) -> Result<bool> {
        Ok(self.records.write().remove(project_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComponentInstance, Route};
    use serde_json::json;

    fn sample(project_id: &str, port: Option<u16>, pid: Option<u32>) -> DeploymentRecord {
        let mut record = DeploymentRecord::new(project_id).with_routes(vec![Route::new("/")
            .with_component(
                ComponentInstance::new("navbar/SimpleNavbar", 0).with_prop("logoText", json!("X")),
            )]);
        record.port = port;
        record.process_id = pid;
        record
    }

    fn stores() -> Vec<Box<dyn DeploymentStore>> {
        vec![
            Box::new(SqliteStore::open_in_memory().unwrap()),
            Box::new(MemoryStore::new()),
        ]
    }

    #[test]
    fn test_save_get_roundtrip() {
        for store in stores() {
            let mut record = sample("p1", None, None);
            record.mark_running(55550, 4242, Utc::now());
            store.save(&record).unwrap();

            let loaded = store.get("p1").unwrap().unwrap();
            assert_eq!(loaded.port, Some(55550));
            assert_eq!(loaded.process_id, Some(4242));
            assert_eq!(loaded.routes, record.routes);
            assert_eq!(
                loaded.last_deployed_at.map(|t| t.timestamp()),
                record.last_deployed_at.map(|t| t.timestamp())
            );
            assert!(store.get("missing").unwrap().is_none());
        }
    }

    #[test]
    fn test_save_upserts() {
        for store in stores() {
            store.save(&sample("p1", Some(55550), Some(1))).unwrap();
            store.save(&sample("p1", Some(55550), None)).unwrap();

            let records = store.list().unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].process_id, None);
        }
    }

    #[test]
    fn test_inconsistent_record_refused() {
        for store in stores() {
            assert!(store.save(&sample("p1", None, Some(7))).is_err());
            assert!(store.get("p1").unwrap().is_none());
        }
    }

    #[test]
    fn test_port_cannot_be_shared() {
        for store in stores() {
            store.save(&sample("a", Some(55550), None)).unwrap();
            assert!(store.save(&sample("b", Some(55550), None)).is_err());
        }
    }

    #[test]
    fn test_claimed_ports_excluding() {
        for store in stores() {
            store.save(&sample("a", Some(55550), Some(1))).unwrap();
            store.save(&sample("b", Some(55551), None)).unwrap();
            store.save(&sample("c", None, None)).unwrap();

            assert_eq!(
                store.claimed_ports_excluding("a").unwrap(),
                HashSet::from([55551])
            );
            assert_eq!(
                store.claimed_ports_excluding("c").unwrap(),
                HashSet::from([55550, 55551])
            );
        }
    }

    #[test]
    fn test_delete_and_list_order() {
        for store in stores() {
            store.save(&sample("b", None, None)).unwrap();
            store.save(&sample("a", None, None)).unwrap();
            let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.project_id).collect();
            assert_eq!(ids, vec!["a", "b"]);

            assert!(store.delete("a").unwrap());
            assert!(!store.delete("a").unwrap());
            assert_eq!(store.list().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_sqlite_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/sitedeploy.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save(&sample("p1", Some(55550), Some(9))).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("p1").unwrap().unwrap().process_id, Some(9));
    }
}
