//! Per-session unit ledger: index allocation, in-flight tracking, and the
//! completion set.
//!
//! A [`UnitLedger`] owns every piece of session state that concurrent tasks
//! mutate: the next-index counter, the reclaimed queue, the in-flight table,
//! the completed set, the termination set, and the one-shot completion flag.
//! The ledger itself is synchronous and lock-free; the dispatch engine keeps
//! exactly one ledger behind each session's mutex, which is what makes
//! allocation linearizable per session without a cross-session lock.
//!
//! Lost units (timeout or transport failure) go back to a reclaimed queue
//! and are re-offered before any fresh index. A unit that would need more
//! than `max_attempts` dispatches is abandoned.
//!
//! A worker that loses a unit is marked unresponsive until it reports
//! again. Reclaimed units skip unresponsive workers while any responsive
//! worker remains in the session, and never go to a worker that has been
//! sent its termination signal.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tokio::time::Instant;

use crate::error::CoreError;
use crate::types::{ArtifactRef, WorkerId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on units per batch. Keeps per-session state small.
pub const MAX_UNITS_PER_BATCH: u32 = 1024;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A unit handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub index: u32,
    /// 1 for the first dispatch of this index, 2 after one re-offer, ...
    pub attempt: u32,
}

/// Result of asking the ledger for the next piece of work for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Dispatch this unit.
    Unit(WorkUnit),
    /// Nothing left; send this worker its termination signal.
    Terminate,
    /// Nothing left and the worker was already told so.
    AlreadyTerminated,
}

/// Result of recording a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A new index was completed.
    Accepted {
        index: u32,
        /// Completed count after this report.
        completed: u32,
        /// True for exactly one report per session: the one that made the
        /// completed count reach the unit count.
        batch_complete: bool,
    },
    /// The index had already been completed; the artifact is redundant.
    Duplicate { index: u32 },
    /// No index given and the worker holds no unit of this session.
    Unattributed,
}

/// Bookkeeping for one dispatched, not yet completed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightUnit {
    pub worker: WorkerId,
    pub attempt: u32,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// An index was about to be handed out while already in flight or
    /// completed. Unreachable under correct locking; fatal for the session.
    #[error("Index {index} would be allocated twice")]
    DuplicateAllocation { index: u32 },

    /// A lost unit has used up its dispatch attempts.
    #[error("Unit {index} abandoned after {attempts} attempts")]
    UnitAbandoned { index: u32, attempts: u32 },

    #[error("Index {index} is outside 0..{unit_count}")]
    IndexOutOfRange { index: u32, unit_count: u32 },

    /// A report named an index that was never dispatched.
    #[error("Index {index} has not been dispatched")]
    NotDispatched { index: u32 },
}

// ---------------------------------------------------------------------------
// UnitLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct UnitLedger {
    unit_count: u32,
    worker_count: usize,
    max_attempts: u32,
    next_index: u32,
    /// Dispatch count per index.
    attempts: Vec<u32>,
    reclaimed: VecDeque<u32>,
    in_flight: BTreeMap<u32, InFlightUnit>,
    completed: BTreeMap<u32, ArtifactRef>,
    terminated: BTreeSet<WorkerId>,
    /// Workers whose last unit was lost and who have not reported since.
    unresponsive: BTreeSet<WorkerId>,
    completion_fired: bool,
}

impl UnitLedger {
    /// Create a ledger for `unit_count` indices spread over `worker_count`
    /// workers, allowing each index at most `max_attempts` dispatches.
    pub fn new(unit_count: u32, worker_count: usize, max_attempts: u32) -> Result<Self, CoreError> {
        if unit_count == 0 || unit_count > MAX_UNITS_PER_BATCH {
            return Err(CoreError::Validation(format!(
                "Unit count must be between 1 and {MAX_UNITS_PER_BATCH}"
            )));
        }
        if worker_count == 0 {
            return Err(CoreError::Validation(
                "A session needs at least one worker".into(),
            ));
        }
        if max_attempts == 0 {
            return Err(CoreError::Validation(
                "Max unit attempts must be at least 1".into(),
            ));
        }
        Ok(Self {
            unit_count,
            worker_count,
            max_attempts,
            next_index: 0,
            attempts: vec![0; unit_count as usize],
            reclaimed: VecDeque::new(),
            in_flight: BTreeMap::new(),
            completed: BTreeMap::new(),
            terminated: BTreeSet::new(),
            unresponsive: BTreeSet::new(),
            completion_fired: false,
        })
    }

    // ---- allocation ----

    /// Hand `worker` its next unit, or decide that it must be terminated.
    ///
    /// Reclaimed indices are re-offered first, then fresh ones. When neither
    /// is left the worker is recorded as terminated; only the first such call
    /// per worker returns [`Assignment::Terminate`]. A terminated worker is
    /// never handed a unit again.
    ///
    /// The caller must not assign to a worker that still holds a unit of
    /// this session (see [`holds_unit`](Self::holds_unit)).
    pub fn assign(
        &mut self,
        worker: &WorkerId,
        deadline: Instant,
    ) -> Result<Assignment, LedgerError> {
        if self.terminated.contains(worker) {
            return Ok(Assignment::AlreadyTerminated);
        }
        if let Some(unit) = self.allocate(worker, deadline, false)? {
            return Ok(Assignment::Unit(unit));
        }
        if self.terminated.insert(worker.clone()) {
            Ok(Assignment::Terminate)
        } else {
            Ok(Assignment::AlreadyTerminated)
        }
    }

    /// Re-offer a reclaimed index to `worker`, never a fresh one.
    ///
    /// Pick `worker` from [`reoffer_candidates`](Self::reoffer_candidates).
    pub fn assign_reclaimed(
        &mut self,
        worker: &WorkerId,
        deadline: Instant,
    ) -> Result<Option<WorkUnit>, LedgerError> {
        self.allocate(worker, deadline, true)
    }

    fn allocate(
        &mut self,
        worker: &WorkerId,
        deadline: Instant,
        reclaimed_only: bool,
    ) -> Result<Option<WorkUnit>, LedgerError> {
        let index = match self.reclaimed.pop_front() {
            Some(index) => index,
            None if !reclaimed_only && self.next_index < self.unit_count => {
                let index = self.next_index;
                self.next_index += 1;
                index
            }
            None => return Ok(None),
        };

        if self.in_flight.contains_key(&index) || self.completed.contains_key(&index) {
            return Err(LedgerError::DuplicateAllocation { index });
        }

        let attempts = &mut self.attempts[index as usize];
        *attempts += 1;
        let attempt = *attempts;

        self.in_flight.insert(
            index,
            InFlightUnit {
                worker: worker.clone(),
                attempt,
                deadline,
            },
        );
        Ok(Some(WorkUnit { index, attempt }))
    }

    // ---- completion ----

    /// Record a completion report from `worker`.
    ///
    /// With `index_hint` the report is attributed to that index; without it,
    /// to whatever unit the worker currently holds. The first report for an
    /// index wins; later ones are [`Completion::Duplicate`]. If a re-offered
    /// copy of the index is still running elsewhere, that worker keeps its
    /// in-flight entry until it reports or its deadline passes.
    pub fn complete(
        &mut self,
        worker: &WorkerId,
        index_hint: Option<u32>,
        artifact: ArtifactRef,
    ) -> Result<Completion, LedgerError> {
        let index = match index_hint {
            Some(index) if index >= self.unit_count => {
                return Err(LedgerError::IndexOutOfRange {
                    index,
                    unit_count: self.unit_count,
                });
            }
            Some(index) => Some(index),
            None => self.unit_held_by(worker),
        };

        // Any report shows the worker is reachable again.
        self.unresponsive.remove(worker);
        let Some(index) = index else {
            return Ok(Completion::Unattributed);
        };

        if self.in_flight.get(&index).is_some_and(|u| &u.worker == worker) {
            self.in_flight.remove(&index);
        }

        if self.completed.contains_key(&index) {
            return Ok(Completion::Duplicate { index });
        }

        if self.attempts[index as usize] == 0 {
            return Err(LedgerError::NotDispatched { index });
        }

        self.reclaimed.retain(|&i| i != index);
        self.completed.insert(index, artifact);

        let completed = self.completed.len() as u32;
        let batch_complete = completed == self.unit_count && !self.completion_fired;
        if batch_complete {
            self.completion_fired = true;
        }

        Ok(Completion::Accepted {
            index,
            completed,
            batch_complete,
        })
    }

    // ---- loss recovery ----

    /// Return a unit to the reclaimed queue after its dispatch to `worker`
    /// failed. Returns `false` if the worker no longer holds that unit.
    pub fn release(&mut self, worker: &WorkerId, index: u32) -> Result<bool, LedgerError> {
        if !self.in_flight.get(&index).is_some_and(|u| &u.worker == worker) {
            return Ok(false);
        }
        self.in_flight.remove(&index);
        self.unresponsive.insert(worker.clone());
        if self.completed.contains_key(&index) {
            return Ok(false);
        }
        self.requeue(index)?;
        Ok(true)
    }

    /// Move every in-flight unit whose deadline is at or before `now` back
    /// to the reclaimed queue. Returns the reclaimed indices; entries for
    /// indices that were completed meanwhile are dropped silently.
    pub fn reclaim_expired(&mut self, now: Instant) -> Result<Vec<u32>, LedgerError> {
        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, unit)| unit.deadline <= now)
            .map(|(&index, _)| index)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for index in expired {
            if let Some(unit) = self.in_flight.remove(&index) {
                self.unresponsive.insert(unit.worker);
            }
            if self.completed.contains_key(&index) {
                continue;
            }
            self.requeue(index)?;
            reclaimed.push(index);
        }
        Ok(reclaimed)
    }

    /// Workers, out of `workers`, that may take a reclaimed unit now.
    ///
    /// Only idle workers that have not been terminated qualify. Unresponsive
    /// ones are left out while some other non-terminated worker is still
    /// responsive, busy or not: that worker picks the unit up on its next
    /// report. With nobody responsive left they are retried.
    pub fn reoffer_candidates<'a>(
        &self,
        workers: impl IntoIterator<Item = &'a WorkerId>,
    ) -> Vec<&'a WorkerId> {
        let active: Vec<&WorkerId> = workers
            .into_iter()
            .filter(|w| !self.terminated.contains(*w))
            .collect();
        let any_responsive = active.iter().any(|w| !self.unresponsive.contains(*w));

        active
            .into_iter()
            .filter(|w| !self.holds_unit(w))
            .filter(|w| !any_responsive || !self.unresponsive.contains(*w))
            .collect()
    }

    fn requeue(&mut self, index: u32) -> Result<(), LedgerError> {
        let attempts = self.attempts[index as usize];
        if attempts >= self.max_attempts {
            return Err(LedgerError::UnitAbandoned { index, attempts });
        }
        self.reclaimed.push_back(index);
        Ok(())
    }

    // ---- queries ----

    pub fn unit_count(&self) -> u32 {
        self.unit_count
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn completed_count(&self) -> u32 {
        self.completed.len() as u32
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn has_reclaimed(&self) -> bool {
        !self.reclaimed.is_empty()
    }

    /// The index `worker` is currently working on, if any.
    pub fn unit_held_by(&self, worker: &WorkerId) -> Option<u32> {
        self.in_flight
            .iter()
            .find(|(_, unit)| &unit.worker == worker)
            .map(|(&index, _)| index)
    }

    pub fn holds_unit(&self, worker: &WorkerId) -> bool {
        self.unit_held_by(worker).is_some()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = (u32, &InFlightUnit)> {
        self.in_flight.iter().map(|(&index, unit)| (index, unit))
    }

    pub fn is_terminated(&self, worker: &WorkerId) -> bool {
        self.terminated.contains(worker)
    }

    pub fn is_unresponsive(&self, worker: &WorkerId) -> bool {
        self.unresponsive.contains(worker)
    }

    pub fn terminated_workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.terminated.iter()
    }

    /// Every worker of the session has been sent its termination signal.
    pub fn is_exhausted(&self) -> bool {
        self.terminated.len() >= self.worker_count
    }

    pub fn completion_fired(&self) -> bool {
        self.completion_fired
    }

    /// Completed artifacts in index order.
    pub fn artifacts(&self) -> impl Iterator<Item = (u32, &ArtifactRef)> {
        self.completed.iter().map(|(&index, artifact)| (index, artifact))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
