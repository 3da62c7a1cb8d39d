//! # bountysync
//!
//! Synchronization engine between a bug bounty platform and external issue
//! trackers (GitHub, GitLab, Jira, ServiceNow).
//!
//! The engine keeps a durable bidirectional link between a vulnerability
//! report and its mirrored tracker issue:
//!
//! - **First synchronization** creates the issue from the formatted report
//!   and records the mapping on the platform as a tracking-status log.
//! - **Subsequent rounds** replay only the report activity the tracker has
//!   not seen, using the state token embedded in the last tracker-update
//!   log as a cursor, and mirror tracker-side comments back to the report.
//! - **State tokens** are tamper-evident markers written back to the
//!   platform after every round that changed something; they carry the
//!   issue's closed flag and the set of tracker comments already accounted
//!   for.
//!
//! The platform is authoritative for report content; the tracker is
//! authoritative for issue lifecycle state and tracker-side comments.
//! Synchronization is batch-triggered and guarantees at most one logical
//! issue per (report, tracker) pair and convergent comment state.
//!
//! ## Pipeline
//!
//! 1. [`orchestrator::Synchronizer::synchronize`] iterates configured
//!    platforms × programs, fetching candidate reports (`AFI`, plus `T`
//!    when some option keeps tracked reports moving).
//! 2. [`synchronizer::ReportSynchronizer::synchronize_report`] reconciles
//!    each (report, tracker) pair.
//! 3. [`tester::Tester::test`] probes every configured endpoint without
//!    mutating anything.
//!
//! ## Modules
//!
//! - [`report`] — Domain model: reports, typed logs, lazy attachments
//! - [`platform`] — Platform API client and the [`platform::PlatformApi`] seam
//! - [`mapping`] — Raw platform JSON → domain model
//! - [`tracker`] — The uniform tracker adapter contract
//! - [`trackers`] — GitHub, GitLab, Jira and ServiceNow adapters
//! - [`formatter`] — Dialect-specific rendering of reports and logs
//! - [`synchronizer`] — The per-pair reconciliation state machine
//! - [`orchestrator`] — Run-level iteration and client caching
//! - [`tester`] — Dry connectivity checks
//! - [`events`] — Progress events and the listener seam
//! - [`error`] — Error taxonomy and chain rendering

/// Error taxonomy and chain rendering.
pub mod error;

/// Progress events and the listener seam.
pub mod events;

/// Dialect-specific rendering of reports and logs.
pub mod formatter;

/// Raw platform JSON to domain model mapping.
pub mod mapping;

/// Run-level iteration over platforms, programs, reports and trackers.
pub mod orchestrator;

/// Platform API client.
pub mod platform;

/// Domain model: reports, typed logs, lazy attachments.
pub mod report;

/// The per-pair reconciliation state machine.
pub mod synchronizer;

/// Dry connectivity checks.
pub mod tester;

/// The uniform tracker adapter contract.
pub mod tracker;

/// Tracker adapters.
pub mod trackers;

pub use error::{ApiError, error_chain};
pub use events::{Event, Listener, NoOpListener};
pub use orchestrator::{DefaultClientFactory, Synchronizer};
pub use synchronizer::{ReportSynchronizer, SynchronizerError};
pub use tester::{Tester, TesterError};
