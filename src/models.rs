//! Report and sync data models (shared types between client and server)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::payload::Payload;

/// Kind of electrical certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// Electrical Installation Condition Report
    #[default]
    Eicr,
    /// Electrical Installation Certificate
    Eic,
    /// Minor Electrical Installation Works Certificate
    MinorWorks,
}

impl ReportType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eicr => "eicr",
            Self::Eic => "eic",
            Self::MinorWorks => "minor_works",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "eicr" => Ok(Self::Eicr),
            "eic" => Ok(Self::Eic),
            "minor_works" | "mw" => Ok(Self::MinorWorks),
            other => Err(Error::InvalidInput(format!("unknown report type '{other}'"))),
        }
    }
}

/// A report as held in the local draft store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub id: String,
    pub report_type: ReportType,
    pub payload: Payload,
    /// Bumped on every local mutation
    pub local_revision: i64,
    /// Last version acknowledged by the cloud (optimistic-lock token)
    pub server_version: Option<i64>,
    pub dirty: bool,
    #[serde(default)]
    pub conflicted: bool,
    #[serde(default)]
    pub pending_delete: bool,
    /// Last payload the cloud confirmed; merge base for section-level merges
    #[serde(default)]
    pub confirmed_payload: Option<Payload>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub server_updated_at: Option<DateTime<Utc>>,
}

impl ReportDocument {
    pub fn new(id: impl Into<String>, report_type: ReportType) -> Self {
        Self {
            id: id.into(),
            report_type,
            payload: Payload::new(),
            local_revision: 0,
            server_version: None,
            dirty: false,
            conflicted: false,
            pending_delete: false,
            confirmed_payload: None,
            updated_at: Utc::now(),
            server_updated_at: None,
        }
    }

    /// Apply a local edit: shallow merge, bump the revision, mark dirty
    pub fn apply_delta(&mut self, delta: &Payload) {
        self.payload.apply_delta(delta);
        self.touch();
    }

    /// Record a local mutation that does not change the payload itself
    pub fn touch(&mut self) {
        self.local_revision += 1;
        self.dirty = true;
        self.updated_at = Utc::now();
    }

    /// Adopt a cloud copy as the clean local state
    pub fn adopt_remote(&mut self, remote: &RemoteReport) {
        self.report_type = remote.report_type;
        self.payload = remote.payload.clone();
        self.confirmed_payload = Some(remote.payload.clone());
        self.server_version = Some(remote.version);
        self.server_updated_at = Some(remote.updated_at);
        self.local_revision = self.local_revision.max(remote.version);
        self.dirty = self.local_revision != remote.version;
        self.conflicted = false;
        self.pending_delete = false;
    }
}

/// Mutation kind carried by a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    InFlight,
    Succeeded,
    Conflicted,
    Abandoned,
}

/// Why an operation stopped retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    NotFound,
}

macro_rules! sql_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} '{other}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

sql_enum!(OpKind {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

sql_enum!(OpStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Succeeded => "succeeded",
    Conflicted => "conflicted",
    Abandoned => "abandoned",
});

sql_enum!(FailureKind {
    Transient => "transient",
    NotFound => "not_found",
});

/// Remote state observed when a versioned write was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub version: i64,
    pub payload: Payload,
}

/// A queued mutation for one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Idempotency key, stable across retries
    pub op_id: String,
    pub report_id: String,
    pub report_type: ReportType,
    pub kind: OpKind,
    /// Payload snapshot at enqueue time
    pub payload: Payload,
    /// Local revision of the snapshot
    pub local_revision: i64,
    pub base_server_version: Option<i64>,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status: OpStatus,
    /// Global enqueue order (assigned by the queue)
    pub seq: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Last dispatch; once set it stays set, marking the op_id as sent
    pub dispatched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub remote: Option<RemoteSnapshot>,
    pub resolved: bool,
}

impl SyncOperation {
    /// Snapshot a document into a fresh pending operation
    pub fn from_document(doc: &ReportDocument, kind: OpKind) -> Self {
        let now = Utc::now();
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            report_id: doc.id.clone(),
            report_type: doc.report_type,
            kind,
            payload: doc.payload.clone(),
            local_revision: doc.local_revision,
            base_server_version: doc.server_version,
            attempts: 0,
            next_retry_at: now,
            status: OpStatus::Pending,
            seq: 0,
            enqueued_at: now,
            dispatched_at: None,
            last_error: None,
            failure: None,
            remote: None,
            resolved: false,
        }
    }

    pub fn write_request(&self) -> WriteReportRequest {
        WriteReportRequest {
            op_id: self.op_id.clone(),
            base_version: self.base_server_version,
            revision: self.local_revision,
            report_type: self.report_type,
            payload: self.payload.clone(),
        }
    }

    pub fn delete_request(&self) -> DeleteReportRequest {
        DeleteReportRequest {
            op_id: self.op_id.clone(),
            base_version: self.base_server_version,
        }
    }
}

/// Two editors diverged from a common version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionConflict {
    pub local_operation: SyncOperation,
    pub remote_current_payload: Payload,
    pub remote_current_version: i64,
}

impl VersionConflict {
    pub fn report_id(&self) -> &str {
        &self.local_operation.report_id
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Versioned write of a full report payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReportRequest {
    pub op_id: String,
    /// Version the write builds on; `None` creates the report
    pub base_version: Option<i64>,
    /// Writer's local revision; the new version is at least this
    pub revision: i64,
    #[serde(default)]
    pub report_type: ReportType,
    pub payload: Payload,
}

/// Versioned delete of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteReportRequest {
    pub op_id: String,
    pub base_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub current_version: i64,
    pub current_payload: Payload,
}

/// A report as stored in the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReport {
    pub id: String,
    pub report_type: ReportType,
    pub version: i64,
    pub payload: Payload,
    pub updated_at: DateTime<Utc>,
}

/// Result of a versioned write against the cloud report table
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Accepted {
        version: i64,
        updated_at: DateTime<Utc>,
    },
    Conflict {
        current_version: i64,
        current_payload: Payload,
    },
    NotFound,
    /// The op_id was already applied with different content or to another report
    ReplayMismatch,
}
