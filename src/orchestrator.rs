//! Sync orchestrator
//!
//! Owns the edit path and the drain loop. Edits land in the draft store right
//! away and are turned into queued operations after a debounce window. Each
//! report is drained by at most one task at a time, in queue order, while a
//! semaphore bounds the number of cloud calls in flight across reports.
//!
//! Both the edit path and outcome recording take the report's state lock, so
//! a keystroke can never race an outcome that rewrites the same document. The
//! state lock is never held across a cloud call.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::cloud::{CloudClient, WriteOutcome};
use crate::config::SyncSettings;
use crate::error::{Error, Result, SyncFailure};
use crate::models::{
    FailureKind, OpKind, OpStatus, RemoteSnapshot, ReportDocument, ReportType, SyncOperation,
    VersionConflict,
};
use crate::payload::Payload;
use crate::queue::{FailureOutcome, SyncQueue};
use crate::resolver::{self, ConflictInput, Resolution, ResolutionChoice};
use crate::store::DraftStore;

/// Sync state of one report, as pushed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    Clean,
    /// Local edits not yet confirmed by the cloud
    Dirty,
    Syncing,
    /// Last attempt failed transiently; another is scheduled
    Retrying {
        attempts: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Waiting for the user to pick a resolution
    Conflicted(VersionConflict),
    /// Needs user action (remote report gone, or retries exhausted)
    Failed(SyncFailure),
    Deleted,
}

impl ReportStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Syncing => "syncing",
            Self::Retrying { .. } => "retrying",
            Self::Conflicted(_) => "conflicted",
            Self::Failed(_) => "failed",
            Self::Deleted => "deleted",
        }
    }
}

/// What `recover` found on startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// In-flight operations returned to pending
    pub reclaimed: usize,
    /// Dirty documents whose latest revision had to be queued again
    pub requeued: usize,
}

/// Per-report locks
#[derive(Default)]
struct Lane {
    /// Serializes document mutations: the edit path and outcome recording
    state: AsyncMutex<()>,
    /// Held by the one task draining the report, across its cloud calls
    drain: AsyncMutex<()>,
}

pub struct SyncOrchestrator {
    store: Arc<DraftStore>,
    queue: SyncQueue,
    cloud: Arc<dyn CloudClient>,
    settings: SyncSettings,
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
    /// Reports with a running drain task, and whether it must run again
    active: Mutex<HashMap<String, bool>>,
    permits: Arc<Semaphore>,
    /// Debounce deadlines of reports with unqueued edits
    debounce: Mutex<HashMap<String, Instant>>,
    watchers: Mutex<HashMap<String, watch::Sender<ReportStatus>>>,
    online: AtomicBool,
    closed: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<DraftStore>,
        cloud: Arc<dyn CloudClient>,
        settings: SyncSettings,
    ) -> Result<Arc<Self>> {
        let queue = SyncQueue::new(Arc::clone(&store), settings.retry_policy())?;
        let permits = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));

        Ok(Arc::new(Self {
            store,
            queue,
            cloud,
            settings,
            lanes: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            permits,
            debounce: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn store(&self) -> &DraftStore {
        &self.store
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn document(&self, report_id: &str) -> Result<Option<ReportDocument>> {
        self.store.get(report_id)
    }

    // -----------------------------------------------------------------------
    // Edit path
    // -----------------------------------------------------------------------

    /// Start a new report with a fresh id
    pub fn create_report(
        self: &Arc<Self>,
        report_type: ReportType,
        payload: Payload,
    ) -> Result<ReportDocument> {
        self.ensure_open()?;

        let mut doc = ReportDocument::new(uuid::Uuid::new_v4().to_string(), report_type);
        doc.payload = payload;
        doc.touch();
        self.store.put(&doc)?;

        tracing::info!(report_id = %doc.id, %report_type, "Report created");
        self.publish(&doc.id, ReportStatus::Dirty);
        self.schedule_flush(&doc.id)?;
        Ok(doc)
    }

    /// Apply a section delta to a report, creating it on first edit
    ///
    /// The draft store is updated before this returns; a failed local write
    /// rejects the edit.
    pub async fn edit_report(
        self: &Arc<Self>,
        report_id: &str,
        delta: &Payload,
    ) -> Result<ReportDocument> {
        self.ensure_open()?;

        let doc = {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;

            let mut doc = self
                .store
                .get(report_id)?
                .unwrap_or_else(|| ReportDocument::new(report_id, ReportType::default()));
            if doc.pending_delete {
                return Err(Error::InvalidInput(format!(
                    "report {report_id} is being deleted"
                )));
            }
            doc.apply_delta(delta);
            self.store.put(&doc)?;
            doc
        };

        tracing::debug!(report_id, revision = doc.local_revision, "Report edited");
        self.publish_current(report_id)?;
        self.schedule_flush(report_id)?;
        Ok(doc)
    }

    /// Delete a report locally and in the cloud
    ///
    /// A report that never reached the cloud is dropped on the spot. Otherwise
    /// the document stays in the draft store until the cloud confirms.
    pub async fn delete_report(self: &Arc<Self>, report_id: &str) -> Result<()> {
        self.ensure_open()?;

        {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;

            let mut doc = self
                .store
                .get(report_id)?
                .ok_or_else(|| Error::NotFound(format!("report {report_id}")))?;
            if doc.pending_delete {
                return Ok(());
            }
            if doc.conflicted || self.queue.open_conflict(report_id)?.is_some() {
                return Err(Error::Conflicted(report_id.to_string()));
            }
            self.cancel_flush(report_id)?;

            let live = self.queue.live_ops(report_id)?;
            let never_sent = live
                .iter()
                .all(|op| op.status == OpStatus::Pending && op.dispatched_at.is_none());
            if doc.server_version.is_none() && never_sent {
                self.forget_report(report_id)?;
                tracing::info!(report_id, "Dropped report that never reached the cloud");
                self.publish(report_id, ReportStatus::Deleted);
                return Ok(());
            }

            doc.pending_delete = true;
            doc.touch();
            self.store.put(&doc)?;
            self.queue
                .enqueue(SyncOperation::from_document(&doc, OpKind::Delete))?;
        }

        tracing::info!(report_id, "Report delete queued");
        self.publish_current(report_id)?;
        self.kick(report_id);
        Ok(())
    }

    /// Watch a report's sync state
    pub fn subscribe(&self, report_id: &str) -> Result<watch::Receiver<ReportStatus>> {
        let status = self.compute_status(report_id)?;
        let mut watchers = locked(&self.watchers)?;
        let sender = watchers
            .entry(report_id.to_string())
            .or_insert_with(|| watch::channel(status).0);
        Ok(sender.subscribe())
    }

    /// Current sync state, derived from the store and the queue
    ///
    /// Reports absent from the draft store read as `Deleted`.
    pub fn status(&self, report_id: &str) -> Result<ReportStatus> {
        self.compute_status(report_id)
    }

    /// Apply the user's answer to a manual conflict
    ///
    /// Every choice queues a fresh operation built on the remote version, so
    /// the outcome is confirmed by the cloud like any other edit.
    pub async fn resolve_conflict(
        self: &Arc<Self>,
        report_id: &str,
        choice: ResolutionChoice,
    ) -> Result<()> {
        {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;

            let conflict = self.queue.open_conflict(report_id)?.ok_or_else(|| {
                Error::InvalidInput(format!("report {report_id} has no open conflict"))
            })?;
            let mut doc = self
                .store
                .get(report_id)?
                .ok_or_else(|| Error::NotFound(format!("report {report_id}")))?;

            let remote_version = conflict.remote_current_version;
            let payload = resolver::chosen_payload(&choice, &doc, &conflict);
            let kind = if conflict.local_operation.kind == OpKind::Delete
                && choice == ResolutionChoice::KeepMine
            {
                OpKind::Delete
            } else {
                doc.pending_delete = false;
                doc.payload = payload;
                OpKind::Update
            };

            doc.server_version = Some(remote_version);
            doc.confirmed_payload = Some(conflict.remote_current_payload.clone());
            doc.conflicted = false;
            doc.local_revision = doc.local_revision.max(remote_version);
            doc.touch();

            self.queue.mark_resolved(&conflict.local_operation.op_id)?;
            self.store.put(&doc)?;
            self.queue
                .enqueue(SyncOperation::from_document(&doc, kind))?;
            self.queue.rebase_pending(report_id, remote_version)?;

            tracing::info!(
                report_id,
                op_id = %conflict.local_operation.op_id,
                remote_version,
                choice = choice_label(&choice),
                "Conflict resolved by user"
            );
        }

        self.publish_current(report_id)?;
        self.kick(report_id);
        Ok(())
    }

    /// Re-arm operations that stopped retrying
    pub async fn retry_abandoned(self: &Arc<Self>, report_id: &str) -> Result<usize> {
        let rearmed = {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;
            self.queue.retry_abandoned(report_id, Utc::now())?
        };

        if rearmed > 0 {
            tracing::info!(report_id, rearmed, "Abandoned operations re-armed");
            self.publish_current(report_id)?;
            self.kick(report_id);
        }
        Ok(rearmed)
    }

    /// Drop the local copy and every queued operation (user confirmed)
    pub async fn discard_local(self: &Arc<Self>, report_id: &str) -> Result<()> {
        {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;
            self.cancel_flush(report_id)?;
            self.forget_report(report_id)?;
        }

        tracing::warn!(report_id, "Local copy discarded");
        self.publish(report_id, ReportStatus::Deleted);
        Ok(())
    }

    /// Open a report, pulling the cloud copy unless local work is pending
    ///
    /// Without connectivity the local copy is returned as is.
    pub async fn load_report(self: &Arc<Self>, report_id: &str) -> Result<ReportDocument> {
        if let Some(doc) = self.store.get(report_id)?
            && self.has_local_work(&doc)?
        {
            return Ok(doc);
        }

        let fetched = self.cloud.fetch(report_id).await;

        let doc = {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;

            let local = self.store.get(report_id)?;
            if let Some(doc) = &local
                && self.has_local_work(doc)?
            {
                return Ok(doc.clone());
            }

            let remote = match fetched {
                Ok(remote) => remote,
                Err(e) => match local {
                    Some(doc) => {
                        tracing::warn!(report_id, error = %e, "Cloud unreachable, using local copy");
                        return Ok(doc);
                    }
                    None => return Err(e),
                },
            };

            let Some(remote) = remote else {
                return local.ok_or_else(|| Error::NotFound(format!("report {report_id}")));
            };
            if let Some(doc) = &local
                && doc.server_version.is_some_and(|version| version > remote.version)
            {
                return Ok(doc.clone());
            }

            let mut doc =
                local.unwrap_or_else(|| ReportDocument::new(report_id, remote.report_type));
            doc.adopt_remote(&remote);
            self.store.put(&doc)?;
            tracing::debug!(report_id, version = remote.version, "Pulled cloud copy");
            doc
        };

        self.publish_current(report_id)?;
        Ok(doc)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the queue back in line with the draft store after a restart
    pub async fn recover(self: &Arc<Self>) -> Result<Recovery> {
        let reclaimed = self
            .queue
            .reclaim_stale(Utc::now(), self.settings.stale_in_flight())?;

        let mut requeued = 0;
        let dirty = self.store.list_dirty()?;
        for doc in dirty.iter() {
            let doc = doc?;
            let lane = self.lane(&doc.id)?;
            let _guard = lane.state.lock().await;
            if self.enqueue_unqueued(&doc.id)? {
                requeued += 1;
            }
        }

        for doc in self.store.list()? {
            self.publish_current(&doc.id)?;
        }
        for report_id in self.queue.reports_with_work()? {
            self.kick(&report_id);
        }

        tracing::info!(reclaimed, requeued, "Sync state recovered");
        Ok(Recovery {
            reclaimed,
            requeued,
        })
    }

    /// Queue every debounced edit now
    pub async fn flush_edits(self: &Arc<Self>) -> Result<()> {
        let pending: Vec<String> = locked(&self.debounce)?
            .drain()
            .map(|(report_id, _)| report_id)
            .collect();

        for report_id in pending {
            self.flush_report(&report_id).await?;
        }
        Ok(())
    }

    /// Flush pending edits and refuse further mutations
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.flush_edits().await?;
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("Sync engine closed");
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record connectivity; coming back online drains every lane
    pub fn set_online(self: &Arc<Self>, online: bool) -> Result<()> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online == was_online {
            return Ok(());
        }

        if online {
            tracing::info!("Connectivity restored");
            for report_id in self.queue.reports_with_work()? {
                self.kick(&report_id);
            }
        } else {
            tracing::info!("Offline, edits stay local");
        }
        Ok(())
    }

    /// Drain every report with queued work and wait for the lanes
    ///
    /// Lanes already being drained in the background are waited for. Returns
    /// the number of operations this call dispatched.
    pub async fn sync_now(self: &Arc<Self>) -> Result<usize> {
        let mut lanes = JoinSet::new();
        for report_id in self.queue.reports_with_work()? {
            let this = Arc::clone(self);
            lanes.spawn(async move { this.process_lane(&report_id).await });
        }

        let mut dispatched = 0;
        let mut first_error = None;
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(Ok(count)) => dispatched += count,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Lane drain failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "Lane task panicked"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    /// Periodic sweep: reclaim stale in-flight operations and kick due lanes
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.sweep() {
                    tracing::error!(error = %e, "Background sync sweep failed");
                }
            }
        })
    }

    fn sweep(self: &Arc<Self>) -> Result<()> {
        self.queue
            .reclaim_stale(Utc::now(), self.settings.stale_in_flight())?;
        if self.is_online() {
            for report_id in self.queue.reports_with_work()? {
                self.kick(&report_id);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Debounce
    // -----------------------------------------------------------------------

    fn schedule_flush(self: &Arc<Self>, report_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.settings.debounce();
        let first = locked(&self.debounce)?
            .insert(report_id.to_string(), deadline)
            .is_none();

        if first {
            let this = Arc::clone(self);
            let report_id = report_id.to_string();
            tokio::spawn(async move { this.debounce_slot(report_id).await });
        }
        Ok(())
    }

    fn cancel_flush(&self, report_id: &str) -> Result<()> {
        locked(&self.debounce)?.remove(report_id);
        Ok(())
    }

    /// Wait out a report's debounce window, pushed back by every new edit
    async fn debounce_slot(self: Arc<Self>, report_id: String) {
        loop {
            // Missing slot: flushed or cancelled elsewhere
            let Ok(Some(deadline)) = self.debounce_deadline(&report_id) else {
                return;
            };

            if Instant::now() < deadline {
                tokio::time::sleep_until(deadline).await;
                continue;
            }

            match self.take_due_slot(&report_id, deadline) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => return,
            }

            if let Err(e) = self.flush_report(&report_id).await {
                tracing::error!(report_id, error = %e, "Failed to queue edits");
            }
            return;
        }
    }

    fn debounce_deadline(&self, report_id: &str) -> Result<Option<Instant>> {
        Ok(locked(&self.debounce)?.get(report_id).copied())
    }

    /// Remove the slot if its deadline is still `deadline`
    fn take_due_slot(&self, report_id: &str, deadline: Instant) -> Result<bool> {
        let mut slots = locked(&self.debounce)?;
        if slots.get(report_id) != Some(&deadline) {
            return Ok(false);
        }
        slots.remove(report_id);
        Ok(true)
    }

    async fn flush_report(self: &Arc<Self>, report_id: &str) -> Result<()> {
        let queued = {
            let lane = self.lane(report_id)?;
            let _guard = lane.state.lock().await;
            self.enqueue_unqueued(report_id)?
        };

        if queued {
            self.kick(report_id);
        }
        Ok(())
    }

    /// Queue the document's latest revision unless the lane already carries it
    ///
    /// Caller holds the report's state lock.
    fn enqueue_unqueued(&self, report_id: &str) -> Result<bool> {
        let Some(doc) = self.store.get(report_id)? else {
            return Ok(false);
        };
        if !doc.dirty || doc.conflicted {
            return Ok(false);
        }

        let live = self.queue.live_ops(report_id)?;
        if live
            .last()
            .is_some_and(|op| op.local_revision == doc.local_revision)
        {
            return Ok(false);
        }

        let kind = if doc.server_version.is_none() && live.is_empty() {
            OpKind::Create
        } else {
            OpKind::Update
        };
        self.queue.enqueue(SyncOperation::from_document(&doc, kind))?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Make sure a drain task is working on the report
    fn kick(self: &Arc<Self>, report_id: &str) {
        if !self.is_online() {
            return;
        }
        let Ok(mut active) = locked(&self.active) else {
            return;
        };
        if let Some(rerun) = active.get_mut(report_id) {
            *rerun = true;
            return;
        }
        active.insert(report_id.to_string(), false);
        drop(active);

        let this = Arc::clone(self);
        let report_id = report_id.to_string();
        tokio::spawn(async move { this.drain_lane(report_id).await });
    }

    async fn drain_lane(self: Arc<Self>, report_id: String) {
        loop {
            if let Err(e) = self.process_lane(&report_id).await {
                tracing::error!(report_id, error = %e, "Lane drain failed");
            }

            match self.rerun_requested(&report_id) {
                Ok(true) => continue,
                _ => return,
            }
        }
    }

    /// Clear the rerun flag, or release the lane when nobody asked for one
    fn rerun_requested(&self, report_id: &str) -> Result<bool> {
        let mut active = locked(&self.active)?;
        if active.get(report_id).copied().unwrap_or(false) {
            active.insert(report_id.to_string(), false);
            return Ok(true);
        }
        active.remove(report_id);
        Ok(false)
    }

    /// Dispatch due lane heads one after another until none is left
    async fn process_lane(self: &Arc<Self>, report_id: &str) -> Result<usize> {
        let lane = self.lane(report_id)?;
        let _draining = lane.drain.lock().await;
        let mut dispatched = 0;

        while self.is_online() {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::Shutdown)?;

            let op = {
                let _guard = lane.state.lock().await;
                self.queue.dequeue_next(report_id, Utc::now())?
            };
            let Some(op) = op else {
                break;
            };

            self.publish(report_id, ReportStatus::Syncing);
            tracing::debug!(
                report_id,
                op_id = %op.op_id,
                kind = op.kind.as_str(),
                base_version = ?op.base_server_version,
                "Dispatching operation"
            );
            let outcome = self.dispatch(&op).await;
            drop(permit);
            dispatched += 1;

            let _guard = lane.state.lock().await;
            self.record_outcome(&op, outcome)?;
        }

        Ok(dispatched)
    }

    async fn dispatch(&self, op: &SyncOperation) -> WriteOutcome {
        let timeout = self.settings.request_timeout();
        let call = async {
            match op.kind {
                OpKind::Create | OpKind::Update => {
                    self.cloud
                        .write_versioned(&op.report_id, &op.write_request())
                        .await
                }
                OpKind::Delete => {
                    self.cloud
                        .delete_versioned(&op.report_id, &op.delete_request())
                        .await
                }
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => WriteOutcome::TransientError(format!(
                "request timed out after {}s",
                timeout.as_secs_f32()
            )),
        }
    }

    /// Apply a cloud outcome to the queue and the document
    ///
    /// Caller holds the report's state lock.
    fn record_outcome(self: &Arc<Self>, op: &SyncOperation, outcome: WriteOutcome) -> Result<()> {
        let report_id = op.report_id.as_str();
        match self.queue.get(&op.op_id)? {
            Some(stored) if stored.status == OpStatus::InFlight => {}
            _ => {
                // Reclaimed or discarded while the call was out
                tracing::debug!(report_id, op_id = %op.op_id, "Ignoring outcome of released operation");
                return Ok(());
            }
        }

        match outcome {
            WriteOutcome::Accepted {
                version,
                updated_at,
            } => self.on_accepted(op, version, updated_at)?,
            WriteOutcome::Conflict {
                current_version,
                current_payload,
            } => self.on_conflict(op, current_version, current_payload)?,
            WriteOutcome::NotFound => self.on_not_found(op)?,
            WriteOutcome::TransientError(error) => self.on_transient(op, &error)?,
        }

        self.publish_current(report_id)
    }

    fn on_accepted(
        &self,
        op: &SyncOperation,
        version: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let report_id = op.report_id.as_str();
        self.queue.mark_succeeded(&op.op_id, Some(version))?;

        if op.kind == OpKind::Delete {
            self.forget_report(report_id)?;
            tracing::info!(report_id, op_id = %op.op_id, version, "Report deleted in the cloud");
            return Ok(());
        }

        let Some(mut doc) = self.store.get(report_id)? else {
            return Ok(());
        };
        doc.server_version = Some(version);
        doc.server_updated_at = Some(updated_at);
        doc.confirmed_payload = Some(op.payload.clone());
        if doc.local_revision == op.local_revision {
            doc.local_revision = version;
            doc.dirty = false;
        }
        self.store.put(&doc)?;

        tracing::info!(
            report_id,
            op_id = %op.op_id,
            version,
            clean = !doc.dirty,
            "Sync accepted"
        );
        Ok(())
    }

    fn on_conflict(
        &self,
        op: &SyncOperation,
        remote_version: i64,
        remote_payload: Payload,
    ) -> Result<()> {
        let report_id = op.report_id.as_str();
        let snapshot = RemoteSnapshot {
            version: remote_version,
            payload: remote_payload.clone(),
        };

        let Some(mut doc) = self.store.get(report_id)? else {
            return self.queue.mark_auto_resolved(&op.op_id, &snapshot);
        };

        let resolution = resolver::resolve(&ConflictInput {
            snapshot: op,
            current: &doc,
            remote_payload: &remote_payload,
            remote_version,
        });

        match resolution {
            Resolution::AlreadyInSync { remote_version } => {
                self.queue.mark_auto_resolved(&op.op_id, &snapshot)?;
                doc.server_version = Some(remote_version);
                doc.confirmed_payload = Some(remote_payload);

                let behind = self.queue.rebase_pending(report_id, remote_version)?;
                if behind == 0 {
                    if remote_version >= doc.local_revision {
                        doc.local_revision = remote_version;
                        doc.dirty = false;
                    } else {
                        // Same content, but the cloud version trails our revision
                        self.queue
                            .enqueue(SyncOperation::from_document(&doc, OpKind::Update))?;
                    }
                }
                self.store.put(&doc)?;

                tracing::info!(
                    report_id,
                    op_id = %op.op_id,
                    remote_version,
                    "Conflict resolved: content already matches"
                );
            }
            Resolution::Merged {
                payload,
                remote_version,
                sections,
            } => {
                self.queue.mark_auto_resolved(&op.op_id, &snapshot)?;
                doc.payload = payload;
                doc.server_version = Some(remote_version);
                doc.confirmed_payload = Some(remote_payload);
                doc.local_revision = doc.local_revision.max(remote_version);
                doc.touch();
                self.store.put(&doc)?;
                self.queue
                    .enqueue(SyncOperation::from_document(&doc, OpKind::Update))?;
                self.queue.rebase_pending(report_id, remote_version)?;

                tracing::info!(
                    report_id,
                    op_id = %op.op_id,
                    remote_version,
                    sections = ?sections,
                    "Conflict resolved: merged independent sections"
                );
            }
            Resolution::Manual(conflict) => {
                self.queue.mark_conflicted(&op.op_id, &snapshot)?;
                doc.conflicted = true;
                self.store.put(&doc)?;

                tracing::warn!(
                    report_id,
                    op_id = %conflict.local_operation.op_id,
                    remote_version,
                    "Version conflict needs manual resolution"
                );
            }
        }
        Ok(())
    }

    fn on_not_found(&self, op: &SyncOperation) -> Result<()> {
        let report_id = op.report_id.as_str();

        if op.kind == OpKind::Delete {
            self.queue.mark_succeeded(&op.op_id, None)?;
            self.forget_report(report_id)?;
            tracing::info!(report_id, "Report was already gone from the cloud");
            return Ok(());
        }

        self.queue.abandon(
            &op.op_id,
            FailureKind::NotFound,
            "report no longer exists in the cloud",
        )?;
        tracing::warn!(report_id, op_id = %op.op_id, "Cloud report missing, local copy kept");
        Ok(())
    }

    fn on_transient(self: &Arc<Self>, op: &SyncOperation, error: &str) -> Result<()> {
        let report_id = op.report_id.as_str();

        match self.queue.mark_failed(&op.op_id, error, Utc::now())? {
            FailureOutcome::Retry {
                attempts,
                next_retry_at,
            } => {
                tracing::warn!(
                    report_id,
                    op_id = %op.op_id,
                    attempts,
                    %next_retry_at,
                    error,
                    "Sync failed, will retry"
                );
                self.schedule_retry(report_id, next_retry_at);
            }
            FailureOutcome::Abandoned { attempts } => {
                tracing::error!(
                    report_id,
                    op_id = %op.op_id,
                    attempts,
                    error,
                    "Sync abandoned after retry limit"
                );
            }
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, report_id: &str, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let this = Arc::clone(self);
        let report_id = report_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.kick(&report_id);
        });
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn compute_status(&self, report_id: &str) -> Result<ReportStatus> {
        let Some(doc) = self.store.get(report_id)? else {
            return Ok(ReportStatus::Deleted);
        };
        if let Some(conflict) = self.queue.open_conflict(report_id)? {
            return Ok(ReportStatus::Conflicted(conflict));
        }

        let live = self.queue.live_ops(report_id)?;
        if let Some(head) = live.first() {
            match head.status {
                OpStatus::Abandoned => {
                    let failure = match head.failure {
                        Some(FailureKind::NotFound) => SyncFailure::RemoteNotFound {
                            report_id: report_id.to_string(),
                        },
                        _ => SyncFailure::Abandoned {
                            op_id: head.op_id.clone(),
                            attempts: head.attempts,
                            last_error: head.last_error.clone().unwrap_or_default(),
                        },
                    };
                    return Ok(ReportStatus::Failed(failure));
                }
                OpStatus::InFlight => return Ok(ReportStatus::Syncing),
                OpStatus::Pending if head.attempts > 0 => {
                    return Ok(ReportStatus::Retrying {
                        attempts: head.attempts,
                        next_retry_at: head.next_retry_at,
                    });
                }
                _ => {}
            }
        }

        if doc.dirty || doc.conflicted || !live.is_empty() {
            Ok(ReportStatus::Dirty)
        } else {
            Ok(ReportStatus::Clean)
        }
    }

    fn publish_current(&self, report_id: &str) -> Result<()> {
        let status = self.compute_status(report_id)?;
        self.publish(report_id, status);
        Ok(())
    }

    fn publish(&self, report_id: &str, status: ReportStatus) {
        let Ok(mut watchers) = locked(&self.watchers) else {
            return;
        };
        tracing::trace!(report_id, status = status.label(), "Status published");
        match watchers.get(report_id) {
            Some(sender) => {
                sender.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    *current = status;
                    true
                });
            }
            None => {
                watchers.insert(report_id.to_string(), watch::channel(status).0);
            }
        }
    }

    fn has_local_work(&self, doc: &ReportDocument) -> Result<bool> {
        Ok(doc.dirty || doc.conflicted || !self.queue.live_ops(&doc.id)?.is_empty())
    }

    fn forget_report(&self, report_id: &str) -> Result<()> {
        self.store.delete(report_id)?;
        self.queue.remove_for_report(report_id)?;
        Ok(())
    }

    fn lane(&self, report_id: &str) -> Result<Arc<Lane>> {
        let mut lanes = locked(&self.lanes)?;
        Ok(Arc::clone(lanes.entry(report_id.to_string()).or_default()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::LockPoisoned)
}

fn choice_label(choice: &ResolutionChoice) -> &'static str {
    match choice {
        ResolutionChoice::KeepMine => "keep_mine",
        ResolutionChoice::KeepTheirs => "keep_theirs",
        ResolutionChoice::Manual(_) => "manual",
    }
}
