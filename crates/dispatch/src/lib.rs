//! Session-scoped dispatch engine.
//!
//! [`coordinator::DispatchCoordinator`] owns the session registry and drives
//! every session through allocation, dispatch, completion, termination and
//! aggregation. Workers are reached through [`client::WorkerClient`];
//! finished artifacts leave through the storage crate's `ArtifactStore`.
//!
//! Lost units are recovered by [`watchdog::LostUnitWatchdog`], a background
//! loop started by the binary alongside the HTTP server.

pub mod aggregation;
pub mod client;
pub mod coordinator;
pub mod events;
pub mod registry;
pub mod retry;
pub mod session;
pub mod watchdog;

pub use aggregation::{AggregationReport, AggregationTrigger};
pub use client::{DispatchError, HttpWorkerClient, WorkerClient};
pub use coordinator::{
    CompletionReceipt, CoordinatorConfig, DispatchCoordinator, NextAction, ReportOutcome,
    ReportTicket, SweepSummary,
};
pub use events::{CoordinatorEvent, LossReason};
pub use registry::SessionRegistry;
pub use retry::RetryPolicy;
pub use session::{Session, SessionSnapshot};
pub use watchdog::LostUnitWatchdog;
