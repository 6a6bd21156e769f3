//! Durable, ordered queue of pending report mutations
//!
//! Operations are persisted in the draft store's SQLite file (`operations`
//! table) and drained per report in strict enqueue order. The oldest live
//! operation of a report is its *lane head*; nothing behind the head is ever
//! dispatched.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    FailureKind, OpKind, OpStatus, RemoteSnapshot, ReportType, SyncOperation, VersionConflict,
};
use crate::payload::Payload;
use crate::store::DraftStore;

const COLUMNS: &str = "op_id, seq, report_id, report_type, kind, payload, local_revision, \
     base_version, attempts, next_retry_at, status, enqueued_at, dispatched_at, last_error, \
     failure, remote, resolved";

/// Operations that still occupy their report's lane
const LIVE: &str = "(status IN ('pending', 'in_flight', 'abandoned') \
     OR (status = 'conflicted' AND resolved = 0))";

/// Exponential backoff with full jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Attempts after which an operation is abandoned
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(300),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay after the given number of failed attempts
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Random delay in `[1ms, ceiling]`
    pub fn delay(&self, attempts: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempts).as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        Duration::from_millis(rand::rng().random_range(1..=ceiling_ms))
    }
}

/// What happened to an operation after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    Abandoned {
        attempts: u32,
    },
}

/// Sync queue persisted through the draft store
pub struct SyncQueue {
    store: Arc<DraftStore>,
    policy: RetryPolicy,
}

impl SyncQueue {
    pub fn new(store: Arc<DraftStore>, policy: RetryPolicy) -> Result<Self> {
        store.with_connection(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS operations (
                    op_id TEXT PRIMARY KEY,
                    seq INTEGER NOT NULL UNIQUE,
                    report_id TEXT NOT NULL,
                    report_type TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    local_revision INTEGER NOT NULL,
                    base_version INTEGER,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    next_retry_at INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    dispatched_at INTEGER,
                    last_error TEXT,
                    failure TEXT,
                    remote TEXT,
                    resolved INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_operations_lane ON operations(report_id, seq);
                CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
                "#,
            )?;
            Ok(())
        })?;

        Ok(Self { store, policy })
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append an operation, coalescing it into the lane tail when possible
    ///
    /// Only a pending update that was never dispatched absorbs a newer update:
    /// once an op_id has been sent, the cloud may already have applied it.
    /// `dispatched_at` is never cleared, so reclaimed and re-armed ops count
    /// as sent too.
    pub fn enqueue(&self, mut op: SyncOperation) -> Result<SyncOperation> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;

            if let Some(mut tail) = lane_tail(&tx, &op.report_id)?
                && op.kind == OpKind::Update
                && tail.kind == OpKind::Update
                && tail.status == OpStatus::Pending
                && tail.dispatched_at.is_none()
            {
                tx.execute(
                    "UPDATE operations SET payload = ?2, local_revision = ?3, report_type = ?4
                     WHERE op_id = ?1",
                    params![
                        &tail.op_id,
                        op.payload.canonical_string(),
                        op.local_revision,
                        op.report_type.as_str(),
                    ],
                )?;
                tx.commit()?;

                tracing::debug!(
                    report_id = %tail.report_id,
                    op_id = %tail.op_id,
                    revision = op.local_revision,
                    "Coalesced update into pending operation"
                );

                tail.payload = op.payload;
                tail.local_revision = op.local_revision;
                tail.report_type = op.report_type;
                return Ok(tail);
            }

            op.seq = tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM operations", [], |row| {
                row.get(0)
            })?;
            op.status = OpStatus::Pending;
            insert_operation(&tx, &op)?;
            tx.commit()?;

            tracing::debug!(
                report_id = %op.report_id,
                op_id = %op.op_id,
                kind = op.kind.as_str(),
                seq = op.seq,
                "Enqueued operation"
            );
            Ok(op)
        })
    }

    /// Claim the lane head if it is pending and due
    pub fn dequeue_next(
        &self,
        report_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SyncOperation>> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let Some(mut head) = lane_head(&tx, report_id)? else {
                return Ok(None);
            };
            if head.status != OpStatus::Pending || head.next_retry_at > now {
                return Ok(None);
            }

            tx.execute(
                "UPDATE operations SET status = 'in_flight', dispatched_at = ?2 WHERE op_id = ?1",
                params![&head.op_id, to_millis(now)],
            )?;
            tx.commit()?;

            head.status = OpStatus::InFlight;
            head.dispatched_at = Some(from_millis(to_millis(now)));
            Ok(Some(head))
        })
    }

    /// Record acceptance and carry the new base version to later pending ops
    pub fn mark_succeeded(&self, op_id: &str, new_version: Option<i64>) -> Result<()> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let op = require_in_flight(&tx, op_id)?;

            tx.execute(
                "UPDATE operations SET status = 'succeeded',
                 last_error = NULL, failure = NULL WHERE op_id = ?1",
                params![op_id],
            )?;
            if let Some(version) = new_version {
                tx.execute(
                    "UPDATE operations SET base_version = ?1
                     WHERE report_id = ?2 AND seq > ?3 AND status = 'pending'",
                    params![version, &op.report_id, op.seq],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Park an op behind an unresolved conflict; its lane stays blocked
    pub fn mark_conflicted(&self, op_id: &str, remote: &RemoteSnapshot) -> Result<()> {
        self.record_conflict(op_id, remote, false)
    }

    /// Record a conflict that was resolved automatically
    pub fn mark_auto_resolved(&self, op_id: &str, remote: &RemoteSnapshot) -> Result<()> {
        self.record_conflict(op_id, remote, true)
    }

    fn record_conflict(&self, op_id: &str, remote: &RemoteSnapshot, resolved: bool) -> Result<()> {
        let remote = serde_json::to_string(remote)?;
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            require_in_flight(&tx, op_id)?;
            tx.execute(
                "UPDATE operations SET status = 'conflicted',
                 remote = ?2, resolved = ?3 WHERE op_id = ?1",
                params![op_id, remote, resolved],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Count a failed attempt and schedule the retry, abandoning at the ceiling
    pub fn mark_failed(
        &self,
        op_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let op = require_in_flight(&tx, op_id)?;
            let attempts = op.attempts + 1;

            if attempts >= self.policy.max_attempts {
                tx.execute(
                    "UPDATE operations SET attempts = ?2 WHERE op_id = ?1",
                    params![op_id, attempts],
                )?;
                abandon_in(&tx, op_id, FailureKind::Transient, error)?;
                tx.commit()?;
                return Ok(FailureOutcome::Abandoned { attempts });
            }

            let next_retry_at = from_millis(to_millis(after(now, self.policy.delay(attempts))));
            tx.execute(
                "UPDATE operations SET status = 'pending', attempts = ?2, next_retry_at = ?3,
                 last_error = ?4, failure = 'transient' WHERE op_id = ?1",
                params![op_id, attempts, to_millis(next_retry_at), error],
            )?;
            tx.commit()?;

            Ok(FailureOutcome::Retry {
                attempts,
                next_retry_at,
            })
        })
    }

    /// Stop retrying an operation; it is kept until the user acts on it
    pub fn abandon(&self, op_id: &str, failure: FailureKind, error: &str) -> Result<()> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            if get_operation(&tx, op_id)?.is_none() {
                return Err(Error::NotFound(format!("operation {op_id}")));
            }
            abandon_in(&tx, op_id, failure, error)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Unblock a lane after the user resolved its conflict
    pub fn mark_resolved(&self, op_id: &str) -> Result<()> {
        self.store.with_connection(|conn| {
            conn.execute(
                "UPDATE operations SET resolved = 1 WHERE op_id = ?1 AND status = 'conflicted'",
                params![op_id],
            )?;
            Ok(())
        })
    }

    /// Point every pending op of a report at a new base version
    pub fn rebase_pending(&self, report_id: &str, version: i64) -> Result<usize> {
        self.store.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE operations SET base_version = ?2 WHERE report_id = ?1 AND status = 'pending'",
                params![report_id, version],
            )?)
        })
    }

    /// Re-arm abandoned operations of a report
    ///
    /// An op abandoned because the cloud lost the report becomes a create.
    pub fn retry_abandoned(&self, report_id: &str, now: DateTime<Utc>) -> Result<usize> {
        self.store.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE operations SET
                   status = 'pending',
                   attempts = 0,
                   next_retry_at = ?2,
                   last_error = NULL,
                   kind = CASE WHEN failure = 'not_found' AND kind != 'delete' THEN 'create' ELSE kind END,
                   base_version = CASE WHEN failure = 'not_found' THEN NULL ELSE base_version END,
                   failure = NULL
                 WHERE report_id = ?1 AND status = 'abandoned'",
                params![report_id, to_millis(now)],
            )?)
        })
    }

    /// Return in-flight ops dispatched before `now - threshold` to pending
    pub fn reclaim_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Result<usize> {
        let cutoff = to_millis(now) - i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let reclaimed = self.store.with_connection(|conn| {
            Ok(conn.execute(
                "UPDATE operations SET status = 'pending'
                 WHERE status = 'in_flight' AND dispatched_at <= ?1",
                params![cutoff],
            )?)
        })?;

        if reclaimed > 0 {
            tracing::info!(reclaimed, "Reclaimed stale in-flight operations");
        }
        Ok(reclaimed)
    }

    pub fn get(&self, op_id: &str) -> Result<Option<SyncOperation>> {
        self.store.with_connection(|conn| get_operation(conn, op_id))
    }

    /// Ops still occupying a report's lane, oldest first
    pub fn live_ops(&self, report_id: &str) -> Result<Vec<SyncOperation>> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM operations WHERE report_id = ?1 AND {LIVE} ORDER BY seq"
            ))?;
            let rows = stmt
                .query_map(params![report_id], OperationRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(OperationRow::into_operation).collect()
        })
    }

    /// Unresolved conflict blocking a report, if any
    pub fn open_conflict(&self, report_id: &str) -> Result<Option<VersionConflict>> {
        let op = self.store.with_connection(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM operations
                         WHERE report_id = ?1 AND status = 'conflicted' AND resolved = 0
                         ORDER BY seq LIMIT 1"
                    ),
                    params![report_id],
                    OperationRow::read,
                )
                .optional()?;
            row.map(OperationRow::into_operation).transpose()
        })?;

        Ok(op.and_then(|op| {
            let remote = op.remote.clone()?;
            Some(VersionConflict {
                local_operation: op,
                remote_current_payload: remote.payload,
                remote_current_version: remote.version,
            })
        }))
    }

    /// Reports with pending or in-flight operations, oldest work first
    pub fn reports_with_work(&self) -> Result<Vec<String>> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT report_id FROM operations WHERE status IN ('pending', 'in_flight')
                 GROUP BY report_id ORDER BY MIN(seq)",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// Drop every operation of a report (user-confirmed discard)
    pub fn remove_for_report(&self, report_id: &str) -> Result<usize> {
        self.store.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM operations WHERE report_id = ?1",
                params![report_id],
            )?)
        })
    }
}

fn lane_head(conn: &Connection, report_id: &str) -> Result<Option<SyncOperation>> {
    lane_edge(conn, report_id, "ASC")
}

fn lane_tail(conn: &Connection, report_id: &str) -> Result<Option<SyncOperation>> {
    lane_edge(conn, report_id, "DESC")
}

fn lane_edge(conn: &Connection, report_id: &str, order: &str) -> Result<Option<SyncOperation>> {
    conn.query_row(
        &format!(
            "SELECT {COLUMNS} FROM operations WHERE report_id = ?1 AND {LIVE}
             ORDER BY seq {order} LIMIT 1"
        ),
        params![report_id],
        OperationRow::read,
    )
    .optional()?
    .map(OperationRow::into_operation)
    .transpose()
}

fn get_operation(conn: &Connection, op_id: &str) -> Result<Option<SyncOperation>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM operations WHERE op_id = ?1"),
        params![op_id],
        OperationRow::read,
    )
    .optional()?
    .map(OperationRow::into_operation)
    .transpose()
}

fn require_in_flight(conn: &Connection, op_id: &str) -> Result<SyncOperation> {
    let op = get_operation(conn, op_id)?
        .ok_or_else(|| Error::NotFound(format!("operation {op_id}")))?;
    if op.status != OpStatus::InFlight {
        return Err(Error::InvalidInput(format!(
            "operation {op_id} is {}, not in flight",
            op.status.as_str()
        )));
    }
    Ok(op)
}

fn abandon_in(conn: &Connection, op_id: &str, failure: FailureKind, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE operations SET status = 'abandoned',
         failure = ?2, last_error = ?3 WHERE op_id = ?1",
        params![op_id, failure.as_str(), error],
    )?;
    tracing::warn!(op_id, error, "Operation abandoned");
    Ok(())
}

fn insert_operation(conn: &Connection, op: &SyncOperation) -> Result<()> {
    let remote = op.remote.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO operations ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            &op.op_id,
            op.seq,
            &op.report_id,
            op.report_type.as_str(),
            op.kind.as_str(),
            op.payload.canonical_string(),
            op.local_revision,
            op.base_server_version,
            op.attempts,
            to_millis(op.next_retry_at),
            op.status.as_str(),
            to_millis(op.enqueued_at),
            op.dispatched_at.map(to_millis),
            &op.last_error,
            op.failure.map(FailureKind::as_str),
            remote,
            op.resolved,
        ],
    )?;
    Ok(())
}

/// Raw `operations` row before decoding
struct OperationRow {
    op_id: String,
    seq: i64,
    report_id: String,
    report_type: String,
    kind: String,
    payload: String,
    local_revision: i64,
    base_version: Option<i64>,
    attempts: u32,
    next_retry_at: i64,
    status: String,
    enqueued_at: i64,
    dispatched_at: Option<i64>,
    last_error: Option<String>,
    failure: Option<String>,
    remote: Option<String>,
    resolved: bool,
}

impl OperationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            op_id: row.get(0)?,
            seq: row.get(1)?,
            report_id: row.get(2)?,
            report_type: row.get(3)?,
            kind: row.get(4)?,
            payload: row.get(5)?,
            local_revision: row.get(6)?,
            base_version: row.get(7)?,
            attempts: row.get(8)?,
            next_retry_at: row.get(9)?,
            status: row.get(10)?,
            enqueued_at: row.get(11)?,
            dispatched_at: row.get(12)?,
            last_error: row.get(13)?,
            failure: row.get(14)?,
            remote: row.get(15)?,
            resolved: row.get(16)?,
        })
    }

    fn into_operation(self) -> Result<SyncOperation> {
        Ok(SyncOperation {
            op_id: self.op_id,
            report_id: self.report_id,
            report_type: self.report_type.parse::<ReportType>()?,
            kind: self.kind.parse::<OpKind>()?,
            payload: Payload::from_json(&self.payload)?,
            local_revision: self.local_revision,
            base_server_version: self.base_version,
            attempts: self.attempts,
            next_retry_at: from_millis(self.next_retry_at),
            status: self.status.parse::<OpStatus>()?,
            seq: self.seq,
            enqueued_at: from_millis(self.enqueued_at),
            dispatched_at: self.dispatched_at.map(from_millis),
            last_error: self.last_error,
            failure: self
                .failure
                .as_deref()
                .map(str::parse::<FailureKind>)
                .transpose()?,
            remote: self
                .remote
                .as_deref()
                .map(serde_json::from_str::<RemoteSnapshot>)
                .transpose()?,
            resolved: self.resolved,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportDocument, ReportType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup(policy: RetryPolicy) -> SyncQueue {
        let store = Arc::new(DraftStore::open_in_memory().unwrap());
        SyncQueue::new(store, policy).unwrap()
    }

    fn t(ms: i64) -> DateTime<Utc> {
        from_millis(1_700_000_000_000 + ms)
    }

    fn op(report_id: &str, kind: OpKind, revision: i64, value: i64) -> SyncOperation {
        let mut doc = ReportDocument::new(report_id, ReportType::Eicr);
        doc.payload = [("readings", json!(value))].into_iter().collect();
        doc.local_revision = revision;
        doc.server_version = Some(1);
        let mut op = SyncOperation::from_document(&doc, kind);
        op.next_retry_at = t(0);
        op
    }

    #[test]
    fn pending_updates_coalesce_and_keep_earliest_op_id() {
        let queue = setup(RetryPolicy::default());

        let first = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        let second = queue.enqueue(op("r1", OpKind::Update, 3, 2)).unwrap();

        assert_eq!(second.op_id, first.op_id);
        assert_eq!(second.local_revision, 3);

        let live = queue.live_ops("r1").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].payload.get("readings"), Some(&json!(2)));
        assert_eq!(live[0].op_id, first.op_id);
    }

    #[test]
    fn dispatched_updates_never_absorb_new_content() {
        let queue = setup(RetryPolicy::default());
        let first = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();
        queue.mark_failed(&first.op_id, "timeout", t(0)).unwrap();

        let second = queue.enqueue(op("r1", OpKind::Update, 3, 2)).unwrap();

        assert_ne!(second.op_id, first.op_id);
        assert_eq!(queue.live_ops("r1").unwrap().len(), 2);
        let retried = queue.get(&first.op_id).unwrap().unwrap();
        assert_eq!(retried.payload.get("readings"), Some(&json!(1)));
    }

    #[test]
    fn create_and_delete_markers_are_not_coalesced() {
        let queue = setup(RetryPolicy::default());
        queue.enqueue(op("r1", OpKind::Create, 1, 1)).unwrap();
        queue.enqueue(op("r1", OpKind::Update, 2, 2)).unwrap();
        queue.enqueue(op("r1", OpKind::Delete, 3, 2)).unwrap();
        queue.enqueue(op("r1", OpKind::Update, 4, 3)).unwrap();

        let kinds: Vec<OpKind> = queue
            .live_ops("r1")
            .unwrap()
            .into_iter()
            .map(|op| op.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![OpKind::Create, OpKind::Update, OpKind::Delete, OpKind::Update]
        );
    }

    #[test]
    fn lane_is_fifo_and_blocks_while_head_in_flight() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Create, 1, 1)).unwrap();
        let b = queue.enqueue(op("r1", OpKind::Update, 2, 2)).unwrap();
        let other = queue.enqueue(op("r2", OpKind::Update, 2, 9)).unwrap();

        let head = queue.dequeue_next("r1", t(0)).unwrap().unwrap();
        assert_eq!(head.op_id, a.op_id);
        assert_eq!(head.status, OpStatus::InFlight);

        // B waits for A's outcome; other reports are unaffected
        assert!(queue.dequeue_next("r1", t(0)).unwrap().is_none());
        assert_eq!(
            queue.dequeue_next("r2", t(0)).unwrap().unwrap().op_id,
            other.op_id
        );

        queue.mark_succeeded(&a.op_id, Some(5)).unwrap();
        let next = queue.dequeue_next("r1", t(0)).unwrap().unwrap();
        assert_eq!(next.op_id, b.op_id);
        assert_eq!(next.base_server_version, Some(5));
    }

    #[test]
    fn succeeded_requires_in_flight() {
        let queue = setup(RetryPolicy::default());
        queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        let b = queue.enqueue(op("r1", OpKind::Delete, 3, 1)).unwrap();

        assert!(matches!(
            queue.mark_succeeded(&b.op_id, Some(3)),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(queue.get(&b.op_id).unwrap().unwrap().status, OpStatus::Pending);
    }

    #[test]
    fn dequeue_respects_next_retry_at() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();

        let FailureOutcome::Retry { next_retry_at, .. } =
            queue.mark_failed(&a.op_id, "503", t(0)).unwrap()
        else {
            panic!("expected a retry");
        };

        let just_before = next_retry_at - TimeDelta::milliseconds(1);
        assert!(queue.dequeue_next("r1", just_before).unwrap().is_none());
        assert!(queue.dequeue_next("r1", next_retry_at).unwrap().is_some());
    }

    #[test]
    fn retries_exactly_max_attempts_with_increasing_schedule() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let queue = setup(policy);
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();

        let mut now = t(0);
        let mut schedule = Vec::new();
        let mut dispatches = 0;
        loop {
            let claimed = queue.dequeue_next("r1", now).unwrap().unwrap();
            assert_eq!(claimed.op_id, a.op_id);
            dispatches += 1;

            match queue.mark_failed(&a.op_id, "503", now).unwrap() {
                FailureOutcome::Retry {
                    attempts,
                    next_retry_at,
                } => {
                    assert_eq!(attempts, dispatches);
                    assert!(next_retry_at > now);
                    schedule.push(next_retry_at);
                    now = next_retry_at;
                }
                FailureOutcome::Abandoned { attempts } => {
                    assert_eq!(attempts, 4);
                    break;
                }
            }
        }

        assert_eq!(dispatches, 4);
        assert!(schedule.windows(2).all(|w| w[0] < w[1]));

        let stored = queue.get(&a.op_id).unwrap().unwrap();
        assert_eq!(stored.status, OpStatus::Abandoned);
        assert_eq!(stored.failure, Some(FailureKind::Transient));
        // Abandoned ops keep blocking the lane until the user acts
        assert!(queue.dequeue_next("r1", t(10_000_000)).unwrap().is_none());
        assert_eq!(queue.live_ops("r1").unwrap().len(), 1);
    }

    #[test]
    fn backoff_ceiling_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(1), Duration::from_secs(2));
        assert_eq!(policy.ceiling(2), Duration::from_secs(4));
        assert_eq!(policy.ceiling(5), Duration::from_secs(32));
        assert_eq!(policy.ceiling(9), Duration::from_secs(300));
        assert_eq!(policy.ceiling(40), Duration::from_secs(300));

        for attempts in 1..12 {
            let delay = policy.delay(attempts);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= policy.ceiling(attempts));
        }
    }

    #[test]
    fn conflicted_head_blocks_until_resolved() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        let b = queue.enqueue(op("r1", OpKind::Delete, 3, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();

        let remote = RemoteSnapshot {
            version: 4,
            payload: [("readings", json!(7))].into_iter().collect(),
        };
        queue.mark_conflicted(&a.op_id, &remote).unwrap();

        assert!(queue.dequeue_next("r1", t(0)).unwrap().is_none());
        let conflict = queue.open_conflict("r1").unwrap().unwrap();
        assert_eq!(conflict.remote_current_version, 4);
        assert_eq!(conflict.local_operation.op_id, a.op_id);

        queue.mark_resolved(&a.op_id).unwrap();
        assert!(queue.open_conflict("r1").unwrap().is_none());
        assert_eq!(
            queue.dequeue_next("r1", t(0)).unwrap().unwrap().op_id,
            b.op_id
        );
    }

    #[test]
    fn stale_in_flight_ops_are_reclaimed() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();

        assert_eq!(
            queue.reclaim_stale(t(30_000), Duration::from_secs(60)).unwrap(),
            0
        );
        assert_eq!(
            queue.reclaim_stale(t(60_000), Duration::from_secs(60)).unwrap(),
            1
        );

        let reclaimed = queue.dequeue_next("r1", t(60_000)).unwrap().unwrap();
        assert_eq!(reclaimed.op_id, a.op_id);
        assert_eq!(reclaimed.attempts, 0);
    }

    #[test]
    fn reclaimed_and_rearmed_ops_never_absorb_new_content() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();
        queue.reclaim_stale(t(60_000), Duration::from_secs(60)).unwrap();

        let reclaimed = queue.get(&a.op_id).unwrap().unwrap();
        assert_eq!(reclaimed.status, OpStatus::Pending);
        assert_eq!(reclaimed.attempts, 0);

        let b = queue.enqueue(op("r1", OpKind::Update, 3, 2)).unwrap();
        assert_ne!(b.op_id, a.op_id);
        assert_eq!(
            queue.get(&a.op_id).unwrap().unwrap().payload.get("readings"),
            Some(&json!(1))
        );

        // Re-armed after abandonment: attempts reset, still sent
        let other = queue.enqueue(op("r2", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r2", t(0)).unwrap().unwrap();
        queue
            .abandon(&other.op_id, FailureKind::Transient, "503")
            .unwrap();
        queue.retry_abandoned("r2", t(5)).unwrap();
        let later = queue.enqueue(op("r2", OpKind::Update, 3, 2)).unwrap();
        assert_ne!(later.op_id, other.op_id);
        assert_eq!(queue.live_ops("r2").unwrap().len(), 2);
    }

    #[test]
    fn retry_abandoned_turns_not_found_into_create() {
        let queue = setup(RetryPolicy::default());
        let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("r1", t(0)).unwrap().unwrap();
        queue
            .abandon(&a.op_id, FailureKind::NotFound, "remote report not found")
            .unwrap();

        assert_eq!(queue.retry_abandoned("r1", t(5)).unwrap(), 1);

        let rearmed = queue.dequeue_next("r1", t(5)).unwrap().unwrap();
        assert_eq!(rearmed.kind, OpKind::Create);
        assert_eq!(rearmed.base_server_version, None);
        assert_eq!(rearmed.attempts, 0);
    }

    #[test]
    fn reports_with_work_lists_pending_lanes_in_order() {
        let queue = setup(RetryPolicy::default());
        queue.enqueue(op("b", OpKind::Update, 2, 1)).unwrap();
        queue.enqueue(op("a", OpKind::Update, 2, 1)).unwrap();
        let c = queue.enqueue(op("c", OpKind::Update, 2, 1)).unwrap();
        queue.dequeue_next("c", t(0)).unwrap();
        queue.mark_succeeded(&c.op_id, Some(2)).unwrap();

        assert_eq!(queue.reports_with_work().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn operations_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("drafts.sqlite");
        let a = {
            let store = Arc::new(DraftStore::open(&path).unwrap());
            let queue = SyncQueue::new(store, RetryPolicy::default()).unwrap();
            let a = queue.enqueue(op("r1", OpKind::Update, 2, 1)).unwrap();
            queue.dequeue_next("r1", t(0)).unwrap();
            a
        };

        let store = Arc::new(DraftStore::open(&path).unwrap());
        let queue = SyncQueue::new(store, RetryPolicy::default()).unwrap();
        let stored = queue.get(&a.op_id).unwrap().unwrap();
        assert_eq!(stored.status, OpStatus::InFlight);
        assert_eq!(stored.payload, a.payload);
    }
}
