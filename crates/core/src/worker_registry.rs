//! Static worker table and completion-report attribution.
//!
//! Workers are configured once at startup. A completion report is
//! attributed to a worker by its explicit identifier when the report carries
//! one; the request's origin address is only a fallback, and it is ignored
//! when several workers share it (e.g. behind NAT).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::Serialize;

use crate::error::CoreError;
use crate::types::WorkerId;

/// One configured worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerEndpoint {
    pub id: WorkerId,
    /// URL the worker accepts dispatches on, e.g. `http://10.0.0.5:8001/run_ai/`.
    pub url: String,
    /// Address reports from this worker are expected to come from, when the
    /// URL host is a literal IP.
    pub origin: Option<IpAddr>,
}

/// What an inbound report says about who sent it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerClaim {
    /// Identifier carried in the report payload, if any.
    pub worker_id: Option<String>,
    /// Network origin of the request, if known.
    pub origin: Option<IpAddr>,
}

impl WorkerClaim {
    pub fn explicit(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            origin: None,
        }
    }

    pub fn from_origin(origin: IpAddr) -> Self {
        Self {
            worker_id: None,
            origin: Some(origin),
        }
    }
}

/// Immutable table of the worker pool.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Vec<WorkerEndpoint>,
    by_origin: HashMap<IpAddr, Vec<usize>>,
}

impl WorkerRegistry {
    /// Build the registry, rejecting an empty table and duplicate ids.
    pub fn new(workers: Vec<WorkerEndpoint>) -> Result<Self, CoreError> {
        if workers.is_empty() {
            return Err(CoreError::Validation(
                "Worker table must contain at least one worker".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(workers.len());
        for worker in &workers {
            if !seen.insert(&worker.id) {
                return Err(CoreError::Validation(format!(
                    "Duplicate worker id: \"{}\"",
                    worker.id
                )));
            }
        }

        let mut by_origin: HashMap<IpAddr, Vec<usize>> = HashMap::new();
        for (position, worker) in workers.iter().enumerate() {
            if let Some(origin) = worker.origin {
                by_origin.entry(origin).or_default().push(position);
            }
        }

        Ok(Self { workers, by_origin })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn endpoints(&self) -> &[WorkerEndpoint] {
        &self.workers
    }

    pub fn ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.iter().map(|w| &w.id)
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerEndpoint> {
        self.workers.iter().find(|w| &w.id == id)
    }

    /// Attribute a report to a worker.
    ///
    /// Returns `None` when the explicit id is unknown, or when there is no
    /// explicit id and the origin matches zero or several workers.
    pub fn resolve(&self, claim: &WorkerClaim) -> Option<WorkerId> {
        if let Some(raw) = claim.worker_id.as_deref() {
            return self
                .workers
                .iter()
                .find(|w| w.id.as_str() == raw)
                .map(|w| w.id.clone());
        }

        let origin = claim.origin?;
        match self.by_origin.get(&origin).map(Vec::as_slice) {
            Some([position]) => Some(self.workers[*position].id.clone()),
            _ => None,
        }
    }

    /// Whether `origin` is consistent with the configured origin of `id`.
    ///
    /// Workers without a configured origin accept any origin.
    pub fn origin_matches(&self, id: &WorkerId, origin: IpAddr) -> bool {
        self.get(id)
            .and_then(|w| w.origin)
            .map_or(true, |expected| expected == origin)
    }
}
