//! Durable local draft store for report documents
//!
//! Each document lives in one row of the `documents` table. The full document
//! is stored as a JSON body next to a few indexed columns, and every write is a
//! single upsert statement, so a crash can never leave a document half-written.
//! The same SQLite file also hosts the sync queue's `operations` table.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::ReportDocument;

/// Thread-safe local store wrapper
pub struct DraftStore {
    conn: Mutex<Connection>,
}

impl DraftStore {
    /// Open or create the store
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::InvalidInput(format!(
                    "cannot create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::with_connection_inner(conn)
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection_inner(Connection::open_in_memory()?)
    }

    fn with_connection_inner(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    id TEXT PRIMARY KEY,
                    report_type TEXT NOT NULL,
                    dirty INTEGER NOT NULL DEFAULT 0,
                    conflicted INTEGER NOT NULL DEFAULT 0,
                    local_revision INTEGER NOT NULL,
                    server_version INTEGER,
                    updated_at TEXT NOT NULL,
                    body TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_documents_dirty ON documents(dirty);
                "#,
            )?;
            Ok(())
        })
    }

    /// Run `f` with exclusive access to the connection
    ///
    /// This mutex is also the queue-level bookkeeping lock.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        f(&mut conn)
    }

    pub fn get(&self, report_id: &str) -> Result<Option<ReportDocument>> {
        let body: Option<String> = self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM documents WHERE id = ?1",
                    params![report_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        body.map(|body| serde_json::from_str(&body).map_err(Error::from))
            .transpose()
    }

    pub fn put(&self, doc: &ReportDocument) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        self.with_connection(|conn| {
            conn.execute(
                r#"INSERT INTO documents (id, report_type, dirty, conflicted, local_revision,
                   server_version, updated_at, body)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                   ON CONFLICT(id) DO UPDATE SET
                     report_type = excluded.report_type,
                     dirty = excluded.dirty,
                     conflicted = excluded.conflicted,
                     local_revision = excluded.local_revision,
                     server_version = excluded.server_version,
                     updated_at = excluded.updated_at,
                     body = excluded.body"#,
                params![
                    &doc.id,
                    doc.report_type.as_str(),
                    doc.dirty,
                    doc.conflicted,
                    doc.local_revision,
                    doc.server_version,
                    doc.updated_at.to_rfc3339(),
                    body,
                ],
            )?;
            Ok(())
        })
    }

    /// Physically remove a document
    pub fn delete(&self, report_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM documents WHERE id = ?1", params![report_id])?;
            Ok(())
        })
    }

    /// Snapshot of every dirty document, decoded lazily
    pub fn list_dirty(&self) -> Result<DirtyDocuments> {
        let rows = self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM documents WHERE dirty = 1 ORDER BY updated_at")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(DirtyDocuments { rows })
    }

    /// All documents, most recently edited first
    pub fn list(&self) -> Result<Vec<ReportDocument>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM documents ORDER BY updated_at DESC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.iter()
            .map(|body| serde_json::from_str(body).map_err(Error::from))
            .collect()
    }
}

/// Dirty documents as they were when `list_dirty` was called
///
/// Iterating decodes one document at a time; the sequence can be walked again
/// from the start as often as needed.
#[derive(Debug, Clone)]
pub struct DirtyDocuments {
    rows: Vec<String>,
}

impl DirtyDocuments {
    pub fn iter(&self) -> impl Iterator<Item = Result<ReportDocument>> + '_ {
        self.rows
            .iter()
            .map(|body| serde_json::from_str(body).map_err(Error::from))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
