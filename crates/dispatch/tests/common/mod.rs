#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use renderhub_core::envelope::DispatchEnvelope;
use renderhub_core::types::{ArtifactRef, SessionId, WorkerId};
use renderhub_core::worker_registry::{WorkerClaim, WorkerEndpoint, WorkerRegistry};
use renderhub_dispatch::{
    CompletionReceipt, CoordinatorConfig, CoordinatorEvent, DispatchCoordinator, DispatchError,
    RetryPolicy, WorkerClient,
};
use renderhub_storage::{ArtifactStore, StorageError};
use tokio::sync::{broadcast, mpsc};

/// How long a test waits for a background dispatch or event.
const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Recording worker client
// ---------------------------------------------------------------------------

/// One attempted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub worker: String,
    pub session: String,
    pub index: i64,
    pub delivered: bool,
}

/// Records every send; fails every send to workers in `unreachable`.
pub struct RecordingClient {
    tx: mpsc::UnboundedSender<Sent>,
    unreachable: HashSet<String>,
}

#[async_trait]
impl WorkerClient for RecordingClient {
    async fn send(
        &self,
        endpoint: &WorkerEndpoint,
        envelope: &DispatchEnvelope,
    ) -> Result<(), DispatchError> {
        let delivered = !self.unreachable.contains(endpoint.id.as_str());
        let _ = self.tx.send(Sent {
            worker: endpoint.id.to_string(),
            session: envelope.session_id.to_string(),
            index: envelope.index,
            delivered,
        });
        if delivered {
            Ok(())
        } else {
            Err(DispatchError::Status {
                status: 503,
                body: "worker offline".into(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory artifact store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    pub keys: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn calls(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn store(&self, _local: &Path, key: &str) -> Result<String, StorageError> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("mem://{key}"))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: Arc<DispatchCoordinator>,
    pub sent: mpsc::UnboundedReceiver<Sent>,
    pub events: broadcast::Receiver<CoordinatorEvent>,
    pub store: Arc<MemoryStore>,
}

/// Config for tests: no retry delays, generous timeouts.
pub fn test_config(unit_count: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        unit_count,
        retry: RetryPolicy {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn endpoint(id: &str, origin: Option<&str>) -> WorkerEndpoint {
    WorkerEndpoint {
        id: WorkerId::parse(id).unwrap(),
        url: format!("http://{}:8001/run_ai/", origin.unwrap_or("localhost")),
        origin: origin.map(|o| o.parse().unwrap()),
    }
}

pub fn harness(config: CoordinatorConfig, workers: Vec<WorkerEndpoint>) -> Harness {
    harness_with_unreachable(config, workers, &[])
}

pub fn harness_with_unreachable(
    config: CoordinatorConfig,
    workers: Vec<WorkerEndpoint>,
    unreachable: &[&str],
) -> Harness {
    let (tx, sent) = mpsc::unbounded_channel();
    let client = Arc::new(RecordingClient {
        tx,
        unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
    });
    let store = Arc::new(MemoryStore::default());
    let registry = Arc::new(WorkerRegistry::new(workers).unwrap());

    let coordinator = DispatchCoordinator::new(config, registry, client, store.clone());
    let events = coordinator.subscribe();

    Harness {
        coordinator,
        sent,
        events,
        store,
    }
}

pub fn source() -> ArtifactRef {
    ArtifactRef::new("uploads/abc_portrait.png", "portrait.png")
}

pub fn result(name: &str) -> ArtifactRef {
    ArtifactRef::new(format!("uploads/{name}"), name)
}

impl Harness {
    pub async fn submit(&self, id: &str) -> SessionId {
        let session_id = SessionId::parse(id).unwrap();
        self.coordinator
            .submit_batch(Some(session_id.clone()), source(), "female".into())
            .await
            .unwrap();
        session_id
    }

    /// Next send attempt made by the coordinator.
    pub async fn next_sent(&mut self) -> Sent {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a dispatch")
            .expect("client dropped")
    }

    /// Collect the next `n` send attempts.
    pub async fn next_sent_n(&mut self, n: usize) -> Vec<Sent> {
        let mut sent = Vec::with_capacity(n);
        for _ in 0..n {
            sent.push(self.next_sent().await);
        }
        sent
    }

    /// Report a completion from `worker` through admission and recording.
    pub async fn report(
        &self,
        session: &SessionId,
        worker: &str,
        index: Option<u32>,
        file: &str,
    ) -> CompletionReceipt {
        let ticket = self
            .coordinator
            .admit_report(session, &WorkerClaim::explicit(worker))
            .await
            .unwrap();
        self.coordinator
            .report_completion(ticket, index, result(file))
            .await
            .unwrap()
    }

    /// Wait for the first event matching `pred`, returning every event
    /// received up to and including it.
    pub async fn events_until(
        &mut self,
        pred: impl Fn(&CoordinatorEvent) -> bool,
    ) -> Vec<CoordinatorEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
}
