use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ProvisionError, Result};
use crate::models::{
    CacheMethod, Host, HostOutcome, HostStatus, HostUpsertPayload, Phase, RunResult, RunSummary,
};

fn storage(message: String) -> ProvisionError {
    ProvisionError::Storage(message)
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|error| storage(format!("Failed to open SQLite database: {error}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|error| storage(format!("Failed to open in-memory database: {error}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|error| storage(format!("Failed to enable SQLite foreign keys: {error}")))?;
        let database = Self { conn };
        database.init_schema()?;
        Ok(database)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS hosts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    hostname TEXT NOT NULL UNIQUE,
                    ip TEXT,
                    ssh_user TEXT NOT NULL,
                    os_label TEXT,
                    redis_ready INTEGER NOT NULL DEFAULT 0,
                    stunnel_ready INTEGER NOT NULL DEFAULT 0,
                    is_primary INTEGER NOT NULL DEFAULT 0,
                    containerized INTEGER NOT NULL DEFAULT 0,
                    remember_password INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS host_keys (
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    fingerprint TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY(host, port)
                );

                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    method TEXT,
                    total INTEGER NOT NULL,
                    success INTEGER NOT NULL,
                    failed INTEGER NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS run_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    host_id INTEGER NOT NULL,
                    hostname TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error_code TEXT,
                    error_message TEXT,
                    FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
                );
                "#,
            )
            .map_err(|error| storage(format!("Failed to initialize schema: {error}")))
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>> {
        let mut statement = self
            .conn
            .prepare(
                r#"
                SELECT id, hostname, ip, ssh_user, os_label, redis_ready, stunnel_ready,
                       is_primary, containerized, remember_password
                FROM hosts
                ORDER BY id ASC
                "#,
            )
            .map_err(|error| storage(format!("Failed to prepare hosts query: {error}")))?;
        let rows = statement
            .query_map([], Self::host_from_row)
            .map_err(|error| storage(format!("Failed to query hosts: {error}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|error| storage(format!("Failed to read host row: {error}")))
    }

    pub fn get_host(&self, host_id: u32) -> Result<Option<Host>> {
        self.conn
            .query_row(
                r#"
                SELECT id, hostname, ip, ssh_user, os_label, redis_ready, stunnel_ready,
                       is_primary, containerized, remember_password
                FROM hosts
                WHERE id = ?1
                "#,
                params![host_id],
                Self::host_from_row,
            )
            .optional()
            .map_err(|error| storage(format!("Failed to load host `{host_id}`: {error}")))
    }

    pub fn find_host(&self, hostname: &str) -> Result<Option<Host>> {
        self.conn
            .query_row(
                r#"
                SELECT id, hostname, ip, ssh_user, os_label, redis_ready, stunnel_ready,
                       is_primary, containerized, remember_password
                FROM hosts
                WHERE hostname = ?1
                "#,
                params![hostname.trim()],
                Self::host_from_row,
            )
            .optional()
            .map_err(|error| storage(format!("Failed to load host `{hostname}`: {error}")))
    }

    pub fn insert_host(&self, payload: &HostUpsertPayload, now: DateTime<Utc>) -> Result<Host> {
        let now = now.to_rfc3339();
        self.conn
            .execute(
                r#"
                INSERT INTO hosts (hostname, ip, ssh_user, is_primary, containerized,
                                   remember_password, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    payload.hostname.trim(),
                    payload.ip.as_deref().map(str::trim),
                    payload.ssh_user.trim(),
                    payload.is_primary as i64,
                    payload.containerized as i64,
                    payload.remember_password as i64,
                    now,
                    now
                ],
            )
            .map_err(|error| {
                storage(format!("Failed to insert host `{}`: {error}", payload.hostname))
            })?;

        let host_id = self.conn.last_insert_rowid() as u32;
        self.get_host(host_id)?
            .ok_or_else(|| storage(format!("Inserted host `{host_id}` not found")))
    }

    /// Persist everything a run may change: detected OS, readiness flags and
    /// the role flags.
    pub fn save_host(&self, host: &Host) -> Result<()> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE hosts SET
                    ip = ?2,
                    ssh_user = ?3,
                    os_label = ?4,
                    redis_ready = ?5,
                    stunnel_ready = ?6,
                    is_primary = ?7,
                    containerized = ?8,
                    remember_password = ?9,
                    updated_at = ?10
                WHERE id = ?1
                "#,
                params![
                    host.id,
                    host.ip,
                    host.ssh_user,
                    host.os_label,
                    host.redis_ready as i64,
                    host.stunnel_ready as i64,
                    host.is_primary as i64,
                    host.containerized as i64,
                    host.remember_password as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|error| storage(format!("Failed to update host `{}`: {error}", host.id)))?;

        if changed == 0 {
            return Err(storage(format!("Host `{}` not found", host.id)));
        }
        Ok(())
    }

    pub fn delete_host(&self, host_id: u32) -> Result<()> {
        self.conn
            .execute("DELETE FROM hosts WHERE id = ?1", params![host_id])
            .map_err(|error| storage(format!("Failed to delete host `{host_id}`: {error}")))?;
        Ok(())
    }

    pub fn get_host_key(&self, host: &str, port: u16) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT fingerprint FROM host_keys WHERE host = ?1 AND port = ?2",
                params![host.trim(), i64::from(port)],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|error| storage(format!("Failed to read host key for {host}:{port}: {error}")))
    }

    pub fn upsert_host_key(&self, host: &str, port: u16, fingerprint: &str) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO host_keys (host, port, fingerprint, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(host, port)
                DO UPDATE SET fingerprint = excluded.fingerprint, created_at = excluded.created_at
                "#,
                params![
                    host.trim(),
                    i64::from(port),
                    fingerprint,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|error| {
                storage(format!("Failed to upsert host key for {host}:{port}: {error}"))
            })?;
        Ok(())
    }

    pub fn save_run_result(&self, result: &RunResult) -> Result<()> {
        let summary = &result.summary;
        self.conn
            .execute(
                r#"
                INSERT INTO runs (run_id, method, total, success, failed, started_at, finished_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(run_id)
                DO UPDATE SET
                    method = excluded.method,
                    total = excluded.total,
                    success = excluded.success,
                    failed = excluded.failed,
                    started_at = excluded.started_at,
                    finished_at = excluded.finished_at
                "#,
                params![
                    summary.run_id,
                    summary.method.map(|method| method.as_str()),
                    summary.total as i64,
                    summary.success as i64,
                    summary.failed as i64,
                    summary.started_at.to_rfc3339(),
                    summary.finished_at.map(|value| value.to_rfc3339())
                ],
            )
            .map_err(|error| storage(format!("Failed to save run summary: {error}")))?;

        self.conn
            .execute(
                "DELETE FROM run_items WHERE run_id = ?1",
                params![summary.run_id],
            )
            .map_err(|error| storage(format!("Failed to clear old run items: {error}")))?;

        for item in &result.items {
            self.conn
                .execute(
                    r#"
                    INSERT INTO run_items (
                        run_id, host_id, hostname, phase, status, error_code, error_message
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        summary.run_id,
                        item.host_id,
                        item.hostname,
                        item.phase.as_str(),
                        status_to_db(&item.status),
                        item.error_code,
                        item.error_message,
                    ],
                )
                .map_err(|error| storage(format!("Failed to save run item: {error}")))?;
        }

        Ok(())
    }

    pub fn get_run_result(&self, run_id: &str) -> Result<Option<RunResult>> {
        type SummaryRow = (String, Option<String>, i64, i64, i64, String, Option<String>);
        let summary_row: Option<SummaryRow> = self
            .conn
            .query_row(
                r#"
                SELECT run_id, method, total, success, failed, started_at, finished_at
                FROM runs
                WHERE run_id = ?1
                "#,
                params![run_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|error| storage(format!("Failed to load run summary for `{run_id}`: {error}")))?;

        let Some((run_id, method, total, success, failed, started_at, finished_at)) = summary_row
        else {
            return Ok(None);
        };

        let summary = RunSummary {
            run_id,
            method: method
                .map(|value| value.parse::<CacheMethod>().map_err(storage))
                .transpose()?,
            total: total as usize,
            success: success as usize,
            failed: failed as usize,
            started_at: parse_rfc3339_to_utc(&started_at)?,
            finished_at: finished_at
                .map(|value| parse_rfc3339_to_utc(&value))
                .transpose()?,
        };

        let mut statement = self
            .conn
            .prepare(
                r#"
                SELECT host_id, hostname, phase, status, error_code, error_message
                FROM run_items
                WHERE run_id = ?1
                ORDER BY id ASC
                "#,
            )
            .map_err(|error| storage(format!("Failed to prepare run items query: {error}")))?;

        let mut rows = statement
            .query(params![summary.run_id.clone()])
            .map_err(|error| storage(format!("Failed to query run items: {error}")))?;
        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|error| storage(format!("Failed to iterate run items: {error}")))?
        {
            let read = |error: rusqlite::Error| storage(format!("Failed to read run item: {error}"));
            items.push(HostOutcome {
                host_id: row.get(0).map_err(read)?,
                hostname: row.get(1).map_err(read)?,
                phase: phase_from_db(&row.get::<_, String>(2).map_err(read)?)?,
                status: status_from_db(&row.get::<_, String>(3).map_err(read)?)?,
                error_code: row.get(4).map_err(read)?,
                error_message: row.get(5).map_err(read)?,
            });
        }

        Ok(Some(RunResult { summary, items }))
    }

    fn host_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<Host, rusqlite::Error> {
        Ok(Host {
            id: row.get(0)?,
            hostname: row.get(1)?,
            ip: row.get(2)?,
            ssh_user: row.get(3)?,
            os_label: row.get(4)?,
            redis_ready: row.get::<_, i64>(5)? != 0,
            stunnel_ready: row.get::<_, i64>(6)? != 0,
            is_primary: row.get::<_, i64>(7)? != 0,
            containerized: row.get::<_, i64>(8)? != 0,
            remember_password: row.get::<_, i64>(9)? != 0,
            directory_password: None,
        })
    }
}

/// Host persistence as the provisioning pipeline sees it.
pub trait HostStore: Send + Sync {
    fn list_hosts(&self) -> Result<Vec<Host>>;
    fn save_host(&self, host: &Host) -> Result<()>;
    fn save_run_result(&self, result: &RunResult) -> Result<()>;
}

/// Known host-key fingerprints, keyed by address and port.
pub trait HostKeyStore: Send + Sync {
    fn get_host_key(&self, host: &str, port: u16) -> Result<Option<String>>;
    fn upsert_host_key(&self, host: &str, port: u16, fingerprint: &str) -> Result<()>;
}

pub fn lock_database(database: &Mutex<Database>) -> Result<MutexGuard<'_, Database>> {
    database
        .lock()
        .map_err(|_| storage("Database lock poisoned".to_string()))
}

impl HostStore for Mutex<Database> {
    fn list_hosts(&self) -> Result<Vec<Host>> {
        lock_database(self)?.list_hosts()
    }

    fn save_host(&self, host: &Host) -> Result<()> {
        lock_database(self)?.save_host(host)
    }

    fn save_run_result(&self, result: &RunResult) -> Result<()> {
        lock_database(self)?.save_run_result(result)
    }
}

impl HostKeyStore for Mutex<Database> {
    fn get_host_key(&self, host: &str, port: u16) -> Result<Option<String>> {
        lock_database(self)?.get_host_key(host, port)
    }

    fn upsert_host_key(&self, host: &str, port: u16, fingerprint: &str) -> Result<()> {
        lock_database(self)?.upsert_host_key(host, port, fingerprint)
    }
}

fn status_to_db(status: &HostStatus) -> &'static str {
    match status {
        HostStatus::Success => "success",
        HostStatus::Failed => "failed",
        HostStatus::Skipped => "skipped",
    }
}

fn status_from_db(value: &str) -> Result<HostStatus> {
    match value {
        "success" => Ok(HostStatus::Success),
        "failed" => Ok(HostStatus::Failed),
        "skipped" => Ok(HostStatus::Skipped),
        _ => Err(storage(format!("Unsupported run item status: {value}"))),
    }
}

fn phase_from_db(value: &str) -> Result<Phase> {
    match value {
        "install" => Ok(Phase::Install),
        "configure" => Ok(Phase::Configure),
        "restart" => Ok(Phase::Restart),
        _ => Err(storage(format!("Unsupported run item phase: {value}"))),
    }
}

fn parse_rfc3339_to_utc(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| storage(format!("Invalid datetime `{value}`: {error}")))
}
