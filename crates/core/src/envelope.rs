//! The payload sent to a worker for every dispatch.

use serde::Serialize;

use crate::types::{ArtifactRef, SessionId};

/// Sentinel index carried by a termination signal.
pub const TERMINATION_INDEX: i64 = -1;

/// One outbound message to a worker: either a work unit or a termination
/// signal. Both travel over the same channel; termination is distinguished
/// only by [`TERMINATION_INDEX`].
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEnvelope {
    pub session_id: SessionId,
    pub index: i64,
    pub variant: String,
    pub source: ArtifactRef,
}

impl DispatchEnvelope {
    pub fn unit(session_id: SessionId, index: u32, variant: String, source: ArtifactRef) -> Self {
        Self {
            session_id,
            index: i64::from(index),
            variant,
            source,
        }
    }

    pub fn termination(session_id: SessionId, variant: String, source: ArtifactRef) -> Self {
        Self {
            session_id,
            index: TERMINATION_INDEX,
            variant,
            source,
        }
    }

    pub fn is_termination(&self) -> bool {
        self.index == TERMINATION_INDEX
    }
}
