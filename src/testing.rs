//! In-process cloud for engine tests
//!
//! Wraps the server's report store with fault injection, a call log and
//! optional latency or gating.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cloud::{CloudClient, WriteOutcome};
use crate::config::SyncSettings;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{DeleteReportRequest, RemoteReport, ReportType, WriteReportRequest};
use crate::payload::Payload;

/// One-shot failure applied to the next versioned call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Fail before touching the store
    Transient,
    /// Apply the write, then drop the response
    LostResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Write,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CloudCall {
    pub report_id: String,
    pub op_id: String,
    pub kind: CallKind,
    pub base_version: Option<i64>,
}

pub(crate) struct EmbeddedCloud {
    db: Database,
    faults: Mutex<VecDeque<Fault>>,
    always_transient: AtomicBool,
    calls: Mutex<Vec<CloudCall>>,
    latency: Mutex<Duration>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fast timings so retries and debouncing finish within a test
pub(crate) fn test_settings() -> SyncSettings {
    SyncSettings {
        debounce_ms: 20,
        max_concurrency: 4,
        request_timeout_secs: 2,
        max_attempts: 4,
        backoff_base_ms: 1,
        backoff_cap_ms: 8,
        stale_in_flight_secs: 60,
        poll_interval_secs: 1,
    }
}

impl EmbeddedCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            db: Database::open_in_memory().unwrap(),
            faults: Mutex::new(VecDeque::new()),
            always_transient: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            gate: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Store a report directly at `version`
    pub fn seed(&self, report_id: &str, payload: Payload, version: i64) {
        let request = WriteReportRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            base_version: None,
            revision: version,
            report_type: ReportType::Eicr,
            payload,
        };
        self.db.write_report(report_id, &request).unwrap();
    }

    /// Edit made by some other client; returns the new version
    pub fn remote_edit(&self, report_id: &str, delta: Payload) -> i64 {
        let current = self.db.get_report(report_id).unwrap().unwrap();
        let mut payload = current.payload;
        payload.apply_delta(&delta);
        let request = WriteReportRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            base_version: Some(current.version),
            revision: current.version + 1,
            report_type: current.report_type,
            payload,
        };
        match self.db.write_report(report_id, &request).unwrap() {
            crate::models::StoreWrite::Accepted { version, .. } => version,
            other => panic!("remote edit rejected: {other:?}"),
        }
    }

    pub fn remote(&self, report_id: &str) -> Option<RemoteReport> {
        self.db.get_report(report_id).unwrap()
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn fail_always(&self, on: bool) {
        self.always_transient.store(on, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Hold every call until permits are added to the returned semaphore
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: CloudCall) -> (InFlight<'_>, Option<Fault>) {
        self.calls.lock().unwrap().push(call);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fault = if self.always_transient.load(Ordering::SeqCst) {
            Some(Fault::Transient)
        } else {
            self.faults.lock().unwrap().pop_front()
        };
        (guard, fault)
    }
}

fn finish(result: anyhow::Result<crate::models::StoreWrite>, fault: Option<Fault>) -> WriteOutcome {
    match (fault, result) {
        (Some(Fault::LostResponse), _) => WriteOutcome::TransientError("connection reset".into()),
        (_, Ok(write)) => write.into(),
        (_, Err(e)) => WriteOutcome::TransientError(e.to_string()),
    }
}

#[async_trait]
impl CloudClient for EmbeddedCloud {
    async fn write_versioned(
        &self,
        report_id: &str,
        request: &WriteReportRequest,
    ) -> WriteOutcome {
        let (_guard, fault) = self
            .enter(CloudCall {
                report_id: report_id.to_string(),
                op_id: request.op_id.clone(),
                kind: CallKind::Write,
                base_version: request.base_version,
            })
            .await;
        if fault == Some(Fault::Transient) {
            return WriteOutcome::TransientError("503 Service Unavailable".into());
        }
        finish(self.db.write_report(report_id, request), fault)
    }

    async fn delete_versioned(
        &self,
        report_id: &str,
        request: &DeleteReportRequest,
    ) -> WriteOutcome {
        let (_guard, fault) = self
            .enter(CloudCall {
                report_id: report_id.to_string(),
                op_id: request.op_id.clone(),
                kind: CallKind::Delete,
                base_version: request.base_version,
            })
            .await;
        if fault == Some(Fault::Transient) {
            return WriteOutcome::TransientError("503 Service Unavailable".into());
        }
        finish(self.db.delete_report(report_id, request), fault)
    }

    async fn fetch(&self, report_id: &str) -> Result<Option<RemoteReport>> {
        self.db
            .get_report(report_id)
            .map_err(|e| Error::Transient(e.to_string()))
    }
}
