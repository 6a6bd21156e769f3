//! Database module for the certsync cloud report store

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{DeleteReportRequest, RemoteReport, ReportType, StoreWrite, WriteReportRequest};
use crate::payload::Payload;

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

/// Current row of a report, deleted or not
struct StoredReport {
    report_type: String,
    payload: String,
    version: i64,
    updated_at: String,
    deleted: bool,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        Self::from_connection(conn)
    }

    /// In-memory database (tests and embedded use)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Current state of every report
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                report_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            -- Ledger of accepted operations, for idempotent replays
            CREATE TABLE IF NOT EXISTS applied_ops (
                op_id TEXT PRIMARY KEY,
                report_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applied_ops_report ON applied_ops(report_id);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database lock poisoned"))
    }

    /// Current copy of a live report
    pub fn get_report(&self, id: &str) -> Result<Option<RemoteReport>> {
        let conn = self.lock()?;
        match fetch_row(&conn, id)? {
            Some(row) if !row.deleted => Ok(Some(row.into_remote(id)?)),
            _ => Ok(None),
        }
    }

    /// Create or update a report under optimistic locking
    pub fn write_report(&self, id: &str, request: &WriteReportRequest) -> Result<StoreWrite> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let fingerprint = write_fingerprint(request);

        if let Some(replay) = replayed(&tx, &request.op_id, id, &fingerprint)? {
            tracing::info!(report_id = %id, op_id = %request.op_id, "Replayed write");
            return Ok(replay);
        }

        let current = fetch_row(&tx, id)?;
        let version = match (request.base_version, &current) {
            (None, None) => request.revision.max(1),
            (None, Some(row)) if row.deleted => (row.version + 1).max(request.revision),
            (None, Some(row)) => return row.conflict(),
            (Some(_), None) => return Ok(StoreWrite::NotFound),
            (Some(_), Some(row)) if row.deleted => return Ok(StoreWrite::NotFound),
            (Some(base), Some(row)) if base != row.version => return row.conflict(),
            (Some(base), Some(_)) => (base + 1).max(request.revision),
        };

        let updated_at = Utc::now();
        tx.execute(
            r#"INSERT INTO reports (id, report_type, payload, version, updated_at, deleted)
               VALUES (?1, ?2, ?3, ?4, ?5, 0)
               ON CONFLICT(id) DO UPDATE SET
                 report_type = excluded.report_type,
                 payload = excluded.payload,
                 version = excluded.version,
                 updated_at = excluded.updated_at,
                 deleted = 0"#,
            params![
                id,
                request.report_type.as_str(),
                request.payload.canonical_string(),
                version,
                updated_at.to_rfc3339(),
            ],
        )?;
        record_applied(&tx, &request.op_id, id, &fingerprint, version, updated_at)?;
        tx.commit()?;

        tracing::info!(report_id = %id, op_id = %request.op_id, version, "Report written");
        Ok(StoreWrite::Accepted {
            version,
            updated_at,
        })
    }

    /// Mark a report deleted under optimistic locking
    pub fn delete_report(&self, id: &str, request: &DeleteReportRequest) -> Result<StoreWrite> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(replay) = replayed(&tx, &request.op_id, id, DELETE_FINGERPRINT)? {
            tracing::info!(report_id = %id, op_id = %request.op_id, "Replayed delete");
            return Ok(replay);
        }

        let row = match fetch_row(&tx, id)? {
            Some(row) if !row.deleted => row,
            _ => return Ok(StoreWrite::NotFound),
        };
        if request.base_version != Some(row.version) {
            return row.conflict();
        }

        let version = row.version + 1;
        let updated_at = Utc::now();
        tx.execute(
            "UPDATE reports SET deleted = 1, version = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, version, updated_at.to_rfc3339()],
        )?;
        record_applied(&tx, &request.op_id, id, DELETE_FINGERPRINT, version, updated_at)?;
        tx.commit()?;

        tracing::info!(report_id = %id, op_id = %request.op_id, version, "Report deleted");
        Ok(StoreWrite::Accepted {
            version,
            updated_at,
        })
    }
}

impl StoredReport {
    fn conflict(&self) -> Result<StoreWrite> {
        Ok(StoreWrite::Conflict {
            current_version: self.version,
            current_payload: Payload::from_json(&self.payload)?,
        })
    }

    fn into_remote(self, id: &str) -> Result<RemoteReport> {
        Ok(RemoteReport {
            id: id.to_string(),
            report_type: self.report_type.parse::<ReportType>()?,
            version: self.version,
            payload: Payload::from_json(&self.payload)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn fetch_row(conn: &Connection, id: &str) -> Result<Option<StoredReport>> {
    let row = conn
        .query_row(
            "SELECT report_type, payload, version, updated_at, deleted FROM reports WHERE id = ?1",
            params![id],
            |row| {
                Ok(StoredReport {
                    report_type: row.get(0)?,
                    payload: row.get(1)?,
                    version: row.get(2)?,
                    updated_at: row.get(3)?,
                    deleted: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

const DELETE_FINGERPRINT: &str = "delete";

/// What a write carries; a replay must carry exactly the same
///
/// The base version is left out: a reclaimed op may be rebased before it
/// is sent again.
fn write_fingerprint(request: &WriteReportRequest) -> String {
    format!(
        "write:{}:{}:{}",
        request.revision,
        request.report_type.as_str(),
        request.payload.canonical_string()
    )
}

/// Recorded result of an op_id seen before
fn replayed(
    tx: &Transaction<'_>,
    op_id: &str,
    report_id: &str,
    fingerprint: &str,
) -> Result<Option<StoreWrite>> {
    let row: Option<(String, String, i64, String)> = tx
        .query_row(
            "SELECT report_id, fingerprint, version, updated_at FROM applied_ops WHERE op_id = ?1",
            params![op_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let Some((recorded_report, recorded_fingerprint, version, updated_at)) = row else {
        return Ok(None);
    };
    if recorded_report != report_id || recorded_fingerprint != fingerprint {
        tracing::warn!(
            op_id,
            report_id,
            recorded_report = %recorded_report,
            "Operation id reused for a different write"
        );
        return Ok(Some(StoreWrite::ReplayMismatch));
    }

    Ok(Some(StoreWrite::Accepted {
        version,
        updated_at: parse_timestamp(&updated_at)?,
    }))
}

fn record_applied(
    tx: &Transaction<'_>,
    op_id: &str,
    report_id: &str,
    fingerprint: &str,
    version: i64,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO applied_ops (op_id, report_id, fingerprint, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![op_id, report_id, fingerprint, version, updated_at.to_rfc3339()],
    )?;
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{value}'"))?
        .with_timezone(&Utc))
}
