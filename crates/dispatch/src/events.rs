//! Lifecycle events published by the coordinator.
//!
//! Events are broadcast via a [`tokio::sync::broadcast`] channel. Call
//! [`DispatchCoordinator::subscribe`](crate::coordinator::DispatchCoordinator::subscribe)
//! to receive them. Slow subscribers miss events rather than block dispatch.

use renderhub_core::types::{SessionId, WorkerId};
use serde::Serialize;

use crate::aggregation::AggregationReport;

/// Why a dispatched unit went back to the reclaimed queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// No report before the unit's deadline.
    Timeout,
    /// The dispatch itself could not be delivered.
    Transport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    SessionCreated {
        session_id: SessionId,
        unit_count: u32,
        workers: usize,
    },

    /// A worker accepted a unit.
    UnitDispatched {
        session_id: SessionId,
        worker_id: WorkerId,
        index: u32,
        attempt: u32,
    },

    UnitLost {
        session_id: SessionId,
        worker_id: WorkerId,
        index: u32,
        reason: LossReason,
    },

    /// A worker was sent its termination signal.
    WorkerTerminated {
        session_id: SessionId,
        worker_id: WorkerId,
    },

    UnitCompleted {
        session_id: SessionId,
        worker_id: WorkerId,
        index: u32,
        completed: u32,
    },

    /// Every worker of the session has been terminated.
    SessionExhausted { session_id: SessionId },

    /// Every index has been reported; aggregation starts.
    SessionCompleted { session_id: SessionId },

    SessionFinalized {
        session_id: SessionId,
        report: AggregationReport,
    },

    SessionFailed {
        session_id: SessionId,
        reason: String,
    },

    SessionRetired { session_id: SessionId },
}

impl CoordinatorEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            CoordinatorEvent::SessionCreated { session_id, .. }
            | CoordinatorEvent::UnitDispatched { session_id, .. }
            | CoordinatorEvent::UnitLost { session_id, .. }
            | CoordinatorEvent::WorkerTerminated { session_id, .. }
            | CoordinatorEvent::UnitCompleted { session_id, .. }
            | CoordinatorEvent::SessionExhausted { session_id }
            | CoordinatorEvent::SessionCompleted { session_id }
            | CoordinatorEvent::SessionFinalized { session_id, .. }
            | CoordinatorEvent::SessionFailed { session_id, .. }
            | CoordinatorEvent::SessionRetired { session_id } => session_id,
        }
    }

    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::SessionCreated { .. } => "session_created",
            CoordinatorEvent::UnitDispatched { .. } => "unit_dispatched",
            CoordinatorEvent::UnitLost { .. } => "unit_lost",
            CoordinatorEvent::WorkerTerminated { .. } => "worker_terminated",
            CoordinatorEvent::UnitCompleted { .. } => "unit_completed",
            CoordinatorEvent::SessionExhausted { .. } => "session_exhausted",
            CoordinatorEvent::SessionCompleted { .. } => "session_completed",
            CoordinatorEvent::SessionFinalized { .. } => "session_finalized",
            CoordinatorEvent::SessionFailed { .. } => "session_failed",
            CoordinatorEvent::SessionRetired { .. } => "session_retired",
        }
    }
}
