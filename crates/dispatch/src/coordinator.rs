//! Session dispatch coordinator.
//!
//! Drives every session through its lifecycle:
//!
//! 1. [`submit_batch`](DispatchCoordinator::submit_batch) registers the
//!    session and fans one unit out to every worker concurrently.
//! 2. Each completion report records its index and immediately hands the
//!    reporting worker its next unit, or its one termination signal when
//!    nothing is left.
//! 3. The report that completes the last index fires aggregation; the
//!    session is finalized once every artifact has been stored or failed.
//!
//! Lost units (transport failure, or no report before the deadline) are
//! re-offered to idle workers. All session state changes happen under the
//! session's mutex; network calls happen in tasks spawned on the
//! coordinator's [`TaskTracker`] after the mutex is released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use renderhub_core::envelope::DispatchEnvelope;
use renderhub_core::error::CoreError;
use renderhub_core::ledger::{Assignment, Completion, LedgerError, UnitLedger, WorkUnit};
use renderhub_core::lifecycle::SessionStatus;
use renderhub_core::types::{ArtifactRef, SessionId, WorkerId};
use renderhub_core::validation::validate_variant;
use renderhub_core::worker_registry::{WorkerClaim, WorkerEndpoint, WorkerRegistry};
use renderhub_storage::key::DEFAULT_KEY_PREFIX;
use renderhub_storage::ArtifactStore;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::aggregation::AggregationTrigger;
use crate::client::WorkerClient;
use crate::events::{CoordinatorEvent, LossReason};
use crate::registry::SessionRegistry;
use crate::retry::{send_with_retry, RetryPolicy};
use crate::session::{Progress, Session, SessionSnapshot};

/// Broadcast channel capacity for coordinator events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Units per batch (N).
    pub unit_count: u32,
    /// How long a worker may hold a unit before it is reclaimed.
    pub unit_timeout: Duration,
    /// Dispatches allowed per index before the session fails.
    pub max_unit_attempts: u32,
    pub retry: RetryPolicy,
    /// Watchdog period.
    pub sweep_interval: Duration,
    /// How long a settled session stays queryable.
    pub session_retention: Duration,
    /// Object key prefix for aggregated results.
    pub key_prefix: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            unit_count: 8,
            unit_timeout: Duration::from_secs(600),
            max_unit_attempts: 3,
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(5),
            session_retention: Duration::from_secs(3600),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// An admitted completion report: the session exists and the worker is
/// known. Obtained from [`DispatchCoordinator::admit_report`].
pub struct ReportTicket {
    session: Arc<Session>,
    worker: WorkerId,
}

impl ReportTicket {
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker
    }
}

impl fmt::Debug for ReportTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportTicket")
            .field("session_id", &self.session.id)
            .field("worker_id", &self.worker)
            .finish()
    }
}

/// What a report did to the completion set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Accepted { index: u32, completed: u32 },
    /// The index was already completed; the artifact is discarded.
    Duplicate { index: u32 },
    /// No index given and the worker held no unit; the artifact is
    /// discarded but the worker is still treated as idle.
    Unattributed,
}

/// What the reporting worker is sent next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    Dispatch { index: u32, attempt: u32 },
    Terminate,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionReceipt {
    pub session_id: SessionId,
    pub worker_id: WorkerId,
    pub outcome: ReportOutcome,
    pub next: NextAction,
    pub status: SessionStatus,
}

impl CompletionReceipt {
    /// Whether the reported artifact was kept.
    pub fn artifact_kept(&self) -> bool {
        matches!(self.outcome, ReportOutcome::Accepted { .. })
    }
}

/// Result of one watchdog pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub reclaimed: usize,
    pub retired: usize,
}

// ---------------------------------------------------------------------------
// DispatchCoordinator
// ---------------------------------------------------------------------------

/// Created once at startup; the returned `Arc` is shared with request
/// handlers and the watchdog.
pub struct DispatchCoordinator {
    config: CoordinatorConfig,
    workers: Arc<WorkerRegistry>,
    sessions: SessionRegistry,
    client: Arc<dyn WorkerClient>,
    aggregator: AggregationTrigger,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    tasks: TaskTracker,
}

impl DispatchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        workers: Arc<WorkerRegistry>,
        client: Arc<dyn WorkerClient>,
        store: Arc<dyn ArtifactStore>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let aggregator = AggregationTrigger::new(store, config.key_prefix.clone());

        Arc::new(Self {
            config,
            workers,
            sessions: SessionRegistry::new(),
            client,
            aggregator,
            event_tx,
            tasks: TaskTracker::new(),
        })
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Wait for in-flight dispatch and aggregation tasks to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        tracing::info!(pending = self.tasks.len(), "Waiting for dispatch tasks");
        self.tasks.wait().await;
    }

    // ---- sessions ----

    /// Register a batch for `source` and start dispatching it.
    ///
    /// Without `session_id` a fresh id is generated. Returns once the session
    /// is registered; the initial fan-out runs in the background.
    pub async fn submit_batch(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
        source: ArtifactRef,
        variant: String,
    ) -> Result<Arc<Session>, CoreError> {
        validate_variant(&variant)?;

        let id = session_id.unwrap_or_else(SessionId::generate);
        let ledger = UnitLedger::new(
            self.config.unit_count,
            self.workers.len(),
            self.config.max_unit_attempts,
        )?;

        let (session, replaced) = self
            .sessions
            .create_or_replace(Session::new(id, variant, source, ledger))
            .await?;

        if replaced.is_some() {
            tracing::info!(session_id = %session.id, "Replaced settled session");
        }
        tracing::info!(
            session_id = %session.id,
            unit_count = session.unit_count,
            workers = self.workers.len(),
            variant = %session.variant,
            "Session created",
        );
        self.emit(CoordinatorEvent::SessionCreated {
            session_id: session.id.clone(),
            unit_count: session.unit_count,
            workers: self.workers.len(),
        });

        let this = Arc::clone(self);
        let fan_out = Arc::clone(&session);
        self.tasks.spawn(async move { this.fan_out(fan_out).await });

        Ok(session)
    }

    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, CoreError> {
        let session = self
            .sessions
            .get(id)
            .await
            .ok_or_else(|| CoreError::not_found("Session", id))?;
        Ok(session.snapshot().await)
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.list().await;
        let mut snapshots = Vec::with_capacity(sessions.len());
        for session in sessions {
            snapshots.push(session.snapshot().await);
        }
        snapshots
    }

    /// Drop a session from the registry. Reports for it are rejected
    /// afterwards; dispatches already sent are not recalled.
    pub async fn retire(&self, id: &SessionId) -> Result<(), CoreError> {
        self.sessions
            .retire(id)
            .await
            .ok_or_else(|| CoreError::not_found("Session", id))?;

        tracing::info!(session_id = %id, "Session retired");
        self.emit(CoordinatorEvent::SessionRetired {
            session_id: id.clone(),
        });
        Ok(())
    }

    // ---- completion reports ----

    /// Check that a report names a live session and a known worker.
    ///
    /// Nothing is mutated; a rejected report has no effect no matter how
    /// often it is resubmitted.
    pub async fn admit_report(
        &self,
        session_id: &SessionId,
        claim: &WorkerClaim,
    ) -> Result<ReportTicket, CoreError> {
        let Some(session) = self.sessions.get(session_id).await else {
            tracing::warn!(session_id = %session_id, "Report for unknown session dropped");
            return Err(CoreError::not_found("Session", session_id));
        };

        let Some(worker) = self.workers.resolve(claim) else {
            let described = claim
                .worker_id
                .clone()
                .or_else(|| claim.origin.map(|o| o.to_string()))
                .unwrap_or_else(|| "<anonymous>".to_string());
            tracing::warn!(
                session_id = %session_id,
                claim = %described,
                "Report from unresolvable worker dropped",
            );
            return Err(CoreError::not_found("Worker", described));
        };

        if let (Some(_), Some(origin)) = (&claim.worker_id, claim.origin) {
            if !self.workers.origin_matches(&worker, origin) {
                tracing::warn!(
                    session_id = %session_id,
                    worker_id = %worker,
                    origin = %origin,
                    "Report origin does not match worker, trusting explicit id",
                );
            }
        }

        Ok(ReportTicket { session, worker })
    }

    /// Record an admitted report and hand the worker its next assignment.
    ///
    /// `index_hint` attributes the artifact to a specific unit; without it
    /// the unit the worker currently holds is assumed.
    pub async fn report_completion(
        self: &Arc<Self>,
        ticket: ReportTicket,
        index_hint: Option<u32>,
        artifact: ArtifactRef,
    ) -> Result<CompletionReceipt, CoreError> {
        let ReportTicket { session, worker } = ticket;

        let (outcome, next, status, batch_complete) = {
            let mut progress = session.lock().await;
            if session.is_retired() {
                return Err(CoreError::not_found("Session", &session.id));
            }
            if progress.status == SessionStatus::Failed {
                return Err(CoreError::Conflict(format!(
                    "Session {} has failed",
                    session.id
                )));
            }

            let completion = match progress.ledger.complete(&worker, index_hint, artifact) {
                Ok(completion) => completion,
                Err(
                    e @ (LedgerError::IndexOutOfRange { .. }
                    | LedgerError::NotDispatched { .. }),
                ) => {
                    return Err(CoreError::Validation(e.to_string()));
                }
                Err(e) => {
                    self.fail_locked(&session, &mut progress, e.to_string());
                    return Err(CoreError::Internal(e.to_string()));
                }
            };

            let (outcome, fired) = match completion {
                Completion::Accepted {
                    index,
                    completed,
                    batch_complete,
                } => (ReportOutcome::Accepted { index, completed }, batch_complete),
                Completion::Duplicate { index } => (ReportOutcome::Duplicate { index }, false),
                Completion::Unattributed => (ReportOutcome::Unattributed, false),
            };
            let batch_complete = fired && progress.transition(SessionStatus::Complete);

            // A worker still holding a unit (a re-offered copy) gets nothing
            // new; before the fan-out nobody does.
            let next = if progress.status == SessionStatus::Initiated
                || progress.ledger.holds_unit(&worker)
            {
                None
            } else {
                match progress.ledger.assign(&worker, self.deadline()) {
                    Ok(assignment) => Some(assignment),
                    Err(e) => {
                        self.fail_locked(&session, &mut progress, e.to_string());
                        None
                    }
                }
            };

            (outcome, next, progress.status, batch_complete)
        };

        match outcome {
            ReportOutcome::Accepted { index, completed } => {
                tracing::info!(
                    session_id = %session.id,
                    worker_id = %worker,
                    index,
                    completed,
                    unit_count = session.unit_count,
                    "Unit completed",
                );
                self.emit(CoordinatorEvent::UnitCompleted {
                    session_id: session.id.clone(),
                    worker_id: worker.clone(),
                    index,
                    completed,
                });
            }
            ReportOutcome::Duplicate { index } => {
                tracing::info!(
                    session_id = %session.id,
                    worker_id = %worker,
                    index,
                    "Duplicate report, artifact discarded",
                );
            }
            ReportOutcome::Unattributed => {
                tracing::warn!(
                    session_id = %session.id,
                    worker_id = %worker,
                    "Report without index from a worker holding no unit",
                );
            }
        }

        if batch_complete {
            tracing::info!(session_id = %session.id, "Batch complete, starting aggregation");
            self.emit(CoordinatorEvent::SessionCompleted {
                session_id: session.id.clone(),
            });
            self.spawn_aggregation(&session);
        }

        let next_action = match next {
            Some(Assignment::Unit(unit)) => NextAction::Dispatch {
                index: unit.index,
                attempt: unit.attempt,
            },
            Some(Assignment::Terminate) => NextAction::Terminate,
            Some(Assignment::AlreadyTerminated) | None => NextAction::Idle,
        };
        if let Some(assignment) = next {
            self.spawn_delivery(&session, worker.clone(), assignment);
        }

        Ok(CompletionReceipt {
            session_id: session.id.clone(),
            worker_id: worker,
            outcome,
            next: next_action,
            status,
        })
    }

    // ---- loss recovery ----

    /// One watchdog pass: reclaim units past their deadline, re-offer
    /// reclaimed units to idle workers, and retire sessions that settled
    /// longer than the retention period ago.
    pub async fn sweep(self: &Arc<Self>) -> SweepSummary {
        let now = Instant::now();
        let mut summary = SweepSummary::default();

        for session in self.sessions.list().await {
            let lost: Vec<(u32, WorkerId)> = {
                let mut progress = session.lock().await;
                if progress.status.is_terminal() {
                    continue;
                }

                let owners: Vec<(u32, WorkerId)> = progress
                    .ledger
                    .in_flight()
                    .filter(|(_, unit)| unit.deadline <= now)
                    .map(|(index, unit)| (index, unit.worker.clone()))
                    .collect();

                if owners.is_empty() {
                    Vec::new()
                } else {
                    match progress.ledger.reclaim_expired(now) {
                        Ok(reclaimed) => owners
                            .into_iter()
                            .filter(|(index, _)| reclaimed.contains(index))
                            .collect(),
                        Err(e) => {
                            self.fail_locked(&session, &mut progress, e.to_string());
                            continue;
                        }
                    }
                }
            };

            for (index, worker) in &lost {
                tracing::warn!(
                    session_id = %session.id,
                    worker_id = %worker,
                    index,
                    "Unit timed out, reclaiming",
                );
                self.emit(CoordinatorEvent::UnitLost {
                    session_id: session.id.clone(),
                    worker_id: worker.clone(),
                    index: *index,
                    reason: LossReason::Timeout,
                });
            }
            summary.reclaimed += lost.len();

            self.reoffer(&session).await;
        }

        for session_id in self
            .sessions
            .retire_settled(self.config.session_retention)
            .await
        {
            tracing::debug!(session_id = %session_id, "Settled session retired");
            self.emit(CoordinatorEvent::SessionRetired { session_id });
            summary.retired += 1;
        }

        summary
    }

    /// Hand reclaimed units of `session` to the workers the ledger allows.
    ///
    /// Units nobody may take yet stay queued; the next completion-driven
    /// assignment or sweep picks them up.
    async fn reoffer(self: &Arc<Self>, session: &Arc<Session>) {
        let assignments = {
            let mut progress = session.lock().await;
            if session.is_retired()
                || !progress.status.accepts_dispatch()
                || !progress.ledger.has_reclaimed()
            {
                return;
            }

            let candidates = progress.ledger.reoffer_candidates(self.workers.ids());
            if candidates.is_empty() {
                tracing::debug!(
                    session_id = %session.id,
                    reclaimed = progress.ledger.reclaimed_count(),
                    "Lost units queued until a worker reports",
                );
                return;
            }

            let deadline = self.deadline();
            let mut assignments = Vec::new();
            for worker in candidates {
                match progress.ledger.assign_reclaimed(worker, deadline) {
                    Ok(Some(unit)) => assignments.push((worker.clone(), unit)),
                    Ok(None) => break,
                    Err(e) => {
                        self.fail_locked(session, &mut progress, e.to_string());
                        return;
                    }
                }
            }
            assignments
        };

        for (worker, unit) in assignments {
            tracing::info!(
                session_id = %session.id,
                worker_id = %worker,
                index = unit.index,
                attempt = unit.attempt,
                "Re-offering lost unit",
            );
            self.spawn_delivery(session, worker, Assignment::Unit(unit));
        }
    }

    // ---- dispatch ----

    async fn fan_out(self: Arc<Self>, session: Arc<Session>) {
        let assignments = {
            let mut progress = session.lock().await;
            if !progress.transition(SessionStatus::Dispatching) {
                return;
            }

            let deadline = self.deadline();
            let mut assignments = Vec::with_capacity(self.workers.len());
            for endpoint in self.workers.endpoints() {
                match progress.ledger.assign(&endpoint.id, deadline) {
                    Ok(assignment) => assignments.push((endpoint.id.clone(), assignment)),
                    Err(e) => {
                        self.fail_locked(&session, &mut progress, e.to_string());
                        return;
                    }
                }
            }
            assignments
        };

        join_all(
            assignments
                .into_iter()
                .map(|(worker, assignment)| {
                    Arc::clone(&self).deliver(Arc::clone(&session), worker, assignment)
                }),
        )
        .await;

        let mut progress = session.lock().await;
        if progress.transition(SessionStatus::InProgress) {
            tracing::debug!(session_id = %session.id, "Initial dispatch finished");
        }
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        session: &Arc<Session>,
        worker: WorkerId,
        assignment: Assignment,
    ) {
        if assignment == Assignment::AlreadyTerminated {
            return;
        }
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        self.tasks
            .spawn(async move { this.deliver(session, worker, assignment).await });
    }

    async fn deliver(
        self: Arc<Self>,
        session: Arc<Session>,
        worker: WorkerId,
        assignment: Assignment,
    ) {
        let Some(endpoint) = self.workers.get(&worker) else {
            tracing::error!(worker_id = %worker, "Assignment for unregistered worker");
            return;
        };

        match assignment {
            Assignment::Unit(unit) => self.deliver_unit(&session, endpoint, unit).await,
            Assignment::Terminate => self.deliver_termination(&session, endpoint).await,
            Assignment::AlreadyTerminated => {}
        }
    }

    async fn deliver_unit(
        self: &Arc<Self>,
        session: &Arc<Session>,
        endpoint: &WorkerEndpoint,
        unit: WorkUnit,
    ) {
        let envelope = DispatchEnvelope::unit(
            session.id.clone(),
            unit.index,
            session.variant.clone(),
            session.source.clone(),
        );

        let sent =
            send_with_retry(self.client.as_ref(), endpoint, &envelope, &self.config.retry).await;
        let err = match sent {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.id,
                    worker_id = %endpoint.id,
                    index = unit.index,
                    attempt = unit.attempt,
                    "Unit dispatched",
                );
                self.emit(CoordinatorEvent::UnitDispatched {
                    session_id: session.id.clone(),
                    worker_id: endpoint.id.clone(),
                    index: unit.index,
                    attempt: unit.attempt,
                });
                return;
            }
            Err(e) => e,
        };

        let released = {
            let mut progress = session.lock().await;
            match progress.ledger.release(&endpoint.id, unit.index) {
                Ok(released) => released,
                Err(e) => {
                    self.fail_locked(session, &mut progress, e.to_string());
                    false
                }
            }
        };

        if released {
            tracing::warn!(
                session_id = %session.id,
                worker_id = %endpoint.id,
                index = unit.index,
                error = %err,
                "Unit lost in transport",
            );
            self.emit(CoordinatorEvent::UnitLost {
                session_id: session.id.clone(),
                worker_id: endpoint.id.clone(),
                index: unit.index,
                reason: LossReason::Transport,
            });
            self.reoffer(session).await;
        }
    }

    async fn deliver_termination(&self, session: &Session, endpoint: &WorkerEndpoint) {
        let envelope = DispatchEnvelope::termination(
            session.id.clone(),
            session.variant.clone(),
            session.source.clone(),
        );

        match send_with_retry(self.client.as_ref(), endpoint, &envelope, &self.config.retry).await {
            Ok(()) => tracing::info!(
                session_id = %session.id,
                worker_id = %endpoint.id,
                "Termination signal sent",
            ),
            Err(e) => tracing::warn!(
                session_id = %session.id,
                worker_id = %endpoint.id,
                error = %e,
                "Termination signal not delivered",
            ),
        }
        self.emit(CoordinatorEvent::WorkerTerminated {
            session_id: session.id.clone(),
            worker_id: endpoint.id.clone(),
        });

        let exhausted = {
            let mut progress = session.lock().await;
            progress.ledger.is_exhausted() && progress.transition(SessionStatus::Exhausted)
        };
        if exhausted {
            tracing::info!(session_id = %session.id, "All workers terminated");
            self.emit(CoordinatorEvent::SessionExhausted {
                session_id: session.id.clone(),
            });
        }
    }

    // ---- aggregation ----

    fn spawn_aggregation(self: &Arc<Self>, session: &Arc<Session>) {
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        self.tasks.spawn(async move { this.finalize(session).await });
    }

    async fn finalize(&self, session: Arc<Session>) {
        let report = self.aggregator.on_complete(&session).await;

        let finalized = {
            let mut progress = session.lock().await;
            progress.aggregation = Some(report.clone());
            let finalized = progress.transition(SessionStatus::Finalized);
            if finalized {
                session.mark_settled();
            }
            finalized
        };

        if finalized {
            tracing::info!(
                session_id = %session.id,
                stored = report.stored.len(),
                failed = report.failed.len(),
                backend = self.aggregator.backend(),
                "Session finalized",
            );
            self.emit(CoordinatorEvent::SessionFinalized {
                session_id: session.id.clone(),
                report,
            });
        }
    }

    // ---- helpers ----

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.unit_timeout
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Fail `session`. The caller holds its progress lock.
    fn fail_locked(&self, session: &Session, progress: &mut Progress, reason: String) {
        if !progress.transition(SessionStatus::Failed) {
            return;
        }
        tracing::error!(session_id = %session.id, reason = %reason, "Session failed");
        progress.failure = Some(reason.clone());
        session.mark_settled();
        self.emit(CoordinatorEvent::SessionFailed {
            session_id: session.id.clone(),
            reason,
        });
    }
}
