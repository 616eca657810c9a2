//! SQLite-backed record store for templates, instances and the activity log.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error, info};

use crate::catalog::Catalog;
use crate::error::LedgerError;
use crate::model::{ActivityEntry, Instance, LiveInstance};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS templates (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        template_id      TEXT    NOT NULL UNIQUE,
        tag              TEXT    NOT NULL,
        challenge_id     INTEGER NOT NULL,
        challenge_name   TEXT    NOT NULL,
        lifetime_seconds INTEGER NOT NULL CHECK (lifetime_seconds > 0)
    );

    CREATE TABLE IF NOT EXISTS instances (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id   TEXT    NOT NULL UNIQUE,
        template_id   TEXT    NOT NULL REFERENCES templates (template_id),
        port          INTEGER NOT NULL,
        start_time_ms INTEGER NOT NULL,
        owner         TEXT    NOT NULL,
        terminated    INTEGER NOT NULL DEFAULT 0
    );

    CREATE UNIQUE INDEX IF NOT EXISTS instances_live_key
        ON instances (owner, template_id) WHERE terminated = 0;
    CREATE UNIQUE INDEX IF NOT EXISTS instances_live_port
        ON instances (port) WHERE terminated = 0;
    CREATE INDEX IF NOT EXISTS instances_by_start
        ON instances (terminated, start_time_ms);

    CREATE TABLE IF NOT EXISTS activity_log (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_ms INTEGER NOT NULL,
        message   TEXT    NOT NULL
    );
";

const INSTANCE_COLUMNS: &str = "instance_id, template_id, port, start_time_ms, owner, terminated";

/// Handle to the ledger database. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened ledger");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(f(&conn)?)
    }

    /// Mirror the catalog into the templates table.
    pub fn seed_templates(&self, catalog: &Catalog) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let tx = conn.transaction()?;
        for t in catalog.iter() {
            tx.execute(
                "INSERT INTO templates (template_id, tag, challenge_id, challenge_name, lifetime_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (template_id) DO UPDATE SET
                     tag = excluded.tag,
                     challenge_id = excluded.challenge_id,
                     challenge_name = excluded.challenge_name,
                     lifetime_seconds = excluded.lifetime_seconds",
                params![
                    t.template_id,
                    t.tag,
                    t.challenge_id,
                    t.challenge_name,
                    t.lifetime_seconds as i64
                ],
            )?;
        }
        tx.commit()?;
        debug!(templates = catalog.len(), "seeded templates");
        Ok(())
    }

    pub fn insert_instance(&self, instance: &Instance) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (instance_id, template_id, port, start_time_ms, owner, terminated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    instance.instance_id,
                    instance.template_id,
                    instance.port,
                    instance.start_time.timestamp_millis(),
                    instance.owner,
                    instance.terminated
                ],
            )
            .map(|_| ())
        })
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<Instance>, LedgerError> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?1"),
                params![instance_id],
                raw_instance,
            )
            .optional()
        })?;
        row.map(RawInstance::into_instance).transpose()
    }

    /// The non-terminated instance for `(owner, template_id)`, if any.
    pub fn find_live(&self, owner: &str, template_id: &str) -> Result<Option<Instance>, LedgerError> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM instances
                     WHERE owner = ?1 AND template_id = ?2 AND terminated = 0"
                ),
                params![owner, template_id],
                raw_instance,
            )
            .optional()
        })?;
        row.map(RawInstance::into_instance).transpose()
    }

    /// Ports held by non-terminated instances.
    pub fn live_ports(&self) -> Result<HashSet<u16>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT port FROM instances WHERE terminated = 0")?;
            let ports = stmt
                .query_map([], |row| row.get::<_, u16>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(ports)
        })
    }

    /// Non-terminated instances with their template lifetime, oldest first.
    pub fn live_instances(&self) -> Result<Vec<LiveInstance>, LedgerError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i.instance_id, i.template_id, i.port, i.start_time_ms, i.owner, i.terminated,
                        t.lifetime_seconds
                 FROM instances i
                 LEFT JOIN templates t ON t.template_id = i.template_id
                 WHERE i.terminated = 0
                 ORDER BY i.start_time_ms ASC, i.id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((raw_instance(row)?, row.get::<_, Option<i64>>(6)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(raw, lifetime)| {
                Ok(LiveInstance {
                    instance: raw.into_instance()?,
                    lifetime_seconds: lifetime.map(|l| l.max(0) as u64),
                })
            })
            .collect()
    }

    /// Every instance ever recorded, in insertion order.
    pub fn instances(&self) -> Result<Vec<Instance>, LedgerError> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY id"))?;
            let rows = stmt
                .query_map([], raw_instance)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RawInstance::into_instance).collect()
    }

    /// Flip `terminated` on. Returns `false` when the row was already
    /// terminated or does not exist.
    pub fn mark_terminated(&self, instance_id: &str) -> Result<bool, LedgerError> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE instances SET terminated = 1 WHERE instance_id = ?1 AND terminated = 0",
                params![instance_id],
            )
        })?;
        Ok(updated > 0)
    }

    pub fn append_log(&self, message: &str) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO activity_log (logged_ms, message) VALUES (?1, ?2)",
                params![Utc::now().timestamp_millis(), message],
            )
            .map(|_| ())
        })
    }

    /// Append to the activity log, reporting (not returning) failures.
    pub fn record(&self, message: &str) {
        if let Err(e) = self.append_log(message) {
            error!(error = %e, message, "failed to append activity log");
        }
    }

    pub fn activity(&self) -> Result<Vec<ActivityEntry>, LedgerError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT logged_ms, message FROM activity_log ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(ms, message)| {
                Ok(ActivityEntry {
                    timestamp: ms_to_dt(ms)?,
                    message,
                })
            })
            .collect()
    }
}

struct RawInstance {
    instance_id: String,
    template_id: String,
    port: u16,
    start_time_ms: i64,
    owner: String,
    terminated: bool,
}

impl RawInstance {
    fn into_instance(self) -> Result<Instance, LedgerError> {
        Ok(Instance {
            instance_id: self.instance_id,
            template_id: self.template_id,
            port: self.port,
            start_time: ms_to_dt(self.start_time_ms)?,
            owner: self.owner,
            terminated: self.terminated,
        })
    }
}

fn raw_instance(row: &Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        instance_id: row.get(0)?,
        template_id: row.get(1)?,
        port: row.get(2)?,
        start_time_ms: row.get(3)?,
        owner: row.get(4)?,
        terminated: row.get(5)?,
    })
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(LedgerError::Timestamp(ms))
}
