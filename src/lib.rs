//! certsync - local-first sync for electrical inspection certificates
//!
//! Inspectors edit EICR, EIC and Minor Works reports against a local draft
//! store that works offline. Edits are queued and pushed to the certsync
//! server with optimistic versioning; conflicting writes are merged per
//! section when possible and otherwise surfaced for a manual decision.

pub mod api;
pub mod cloud;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod payload;
pub mod queue;
pub mod resolver;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use cloud::{CloudClient, HttpCloudClient, WriteOutcome};
pub use config::{Config, SyncSettings};
pub use error::{Error, Result, SyncFailure};
pub use models::{ReportDocument, ReportType};
pub use orchestrator::{ReportStatus, SyncOrchestrator};
pub use payload::Payload;
pub use resolver::ResolutionChoice;
pub use store::DraftStore;
