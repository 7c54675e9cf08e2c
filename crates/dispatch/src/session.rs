//! Per-session state.
//!
//! Immutable session facts live directly on [`Session`]; everything that
//! changes after creation sits in [`Progress`] behind one async mutex. The
//! mutex is never held across network I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use renderhub_core::ledger::UnitLedger;
use renderhub_core::lifecycle::SessionStatus;
use renderhub_core::types::{ArtifactRef, SessionId, Timestamp, WorkerId};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::aggregation::AggregationReport;

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub variant: String,
    pub source: ArtifactRef,
    pub unit_count: u32,
    pub created_at: Timestamp,
    progress: Mutex<Progress>,
    /// Set once when the session reaches a terminal status. Read without
    /// the progress lock by the registry.
    settled_at: OnceLock<Instant>,
    /// Set when the registry drops the session. Reports and re-offers that
    /// still hold the `Arc` check it under the progress lock.
    retired: AtomicBool,
}

/// Mutable session state, guarded by the session mutex.
#[derive(Debug)]
pub struct Progress {
    pub status: SessionStatus,
    pub ledger: UnitLedger,
    pub aggregation: Option<AggregationReport>,
    pub failure: Option<String>,
}

impl Progress {
    /// Move to `to` if the state machine allows it. Returns whether the
    /// status changed; disallowed moves leave it untouched.
    pub fn transition(&mut self, to: SessionStatus) -> bool {
        if self.status.can_transition(to) {
            self.status = to;
            true
        } else {
            false
        }
    }
}

impl Session {
    pub fn new(id: SessionId, variant: String, source: ArtifactRef, ledger: UnitLedger) -> Self {
        Self {
            id,
            variant,
            source,
            unit_count: ledger.unit_count(),
            created_at: chrono::Utc::now(),
            progress: Mutex::new(Progress {
                status: SessionStatus::Initiated,
                ledger,
                aggregation: None,
                failure: None,
            }),
            settled_at: OnceLock::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().await
    }

    pub async fn status(&self) -> SessionStatus {
        self.progress.lock().await.status
    }

    /// Record that the session reached a terminal status.
    pub(crate) fn mark_settled(&self) {
        let _ = self.settled_at.set(Instant::now());
    }

    /// Finalized or failed; safe to replace or retire.
    pub fn is_settled(&self) -> bool {
        self.settled_at.get().is_some()
    }

    pub fn settled_at(&self) -> Option<Instant> {
        self.settled_at.get().copied()
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// No longer in the registry; nothing may change it any more.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Point-in-time view for the HTTP API and logs.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let progress = self.progress.lock().await;
        let ledger = &progress.ledger;

        SessionSnapshot {
            session_id: self.id.clone(),
            variant: self.variant.clone(),
            source_file: self.source.file_name.clone(),
            status: progress.status,
            unit_count: self.unit_count,
            next_index: ledger.next_index(),
            completed: ledger.completed_count(),
            in_flight: ledger
                .in_flight()
                .map(|(index, unit)| InFlightSnapshot {
                    index,
                    worker_id: unit.worker.clone(),
                    attempt: unit.attempt,
                })
                .collect(),
            reclaimed: ledger.reclaimed_count(),
            terminated_workers: ledger.terminated_workers().cloned().collect(),
            failure: progress.failure.clone(),
            aggregation: progress.aggregation.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightSnapshot {
    pub index: u32,
    pub worker_id: WorkerId,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub variant: String,
    pub source_file: String,
    pub status: SessionStatus,
    pub unit_count: u32,
    pub next_index: u32,
    pub completed: u32,
    pub in_flight: Vec<InFlightSnapshot>,
    pub reclaimed: usize,
    pub terminated_workers: Vec<WorkerId>,
    pub failure: Option<String>,
    pub aggregation: Option<AggregationReport>,
    pub created_at: Timestamp,
}
