//! Structured log of coordinator events.
//!
//! Subscribes to the coordinator's broadcast channel and writes one log line
//! per event, with the event serialized as JSON in the `payload` field.

use renderhub_dispatch::CoordinatorEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Run the event log loop until `cancel` fires or the channel closes.
pub async fn run(mut receiver: broadcast::Receiver<CoordinatorEvent>, cancel: CancellationToken) {
    tracing::info!("Event log started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Event log stopping");
                break;
            }
            received = receiver.recv() => match received {
                Ok(event) => record(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event log lagged, some events were not logged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event channel closed, event log shutting down");
                    break;
                }
            },
        }
    }
}

fn record(event: &CoordinatorEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, event = event.name(), "Failed to serialize event");
            return;
        }
    };

    match event {
        CoordinatorEvent::SessionFailed { .. } | CoordinatorEvent::UnitLost { .. } => {
            tracing::warn!(
                event = event.name(),
                session_id = %event.session_id(),
                payload = %payload,
                "Coordinator event",
            );
        }
        _ => {
            tracing::info!(
                event = event.name(),
                session_id = %event.session_id(),
                payload = %payload,
                "Coordinator event",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use renderhub_core::types::SessionId;

    use super::*;

    #[tokio::test]
    async fn stops_on_cancel_and_on_close() {
        let (tx, rx) = broadcast::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(rx, cancel.clone()));

        tx.send(CoordinatorEvent::SessionCreated {
            session_id: SessionId::parse("s1").unwrap(),
            unit_count: 2,
            workers: 1,
        })
        .unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = broadcast::channel::<CoordinatorEvent>(4);
        let task = tokio::spawn(run(rx, CancellationToken::new()));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
