//! Waiting-queue visibility: while the participant queues for a circuit,
//! report position and estimated wait, and hand control back once the
//! participant reaches the front.

use crate::{
    coordination::CoordinationClient,
    status::{StatusSink, StatusUpdate},
    utils::format_countdown,
};
use anyhow::Result;
use phase2_shared::structures::{AvgTimings, Circuit};
use tracing::warn;

/// Estimated wait in milliseconds for a given 1-based queue position.
/// Unknown timings estimate to zero.
pub fn estimated_wait_millis(timings: &AvgTimings, position: usize) -> u64 {
    if timings.full_contribution > 0 && timings.verify_cloud_function > 0 {
        (timings.full_contribution + timings.verify_cloud_function) * (position as u64 - 1)
    } else {
        0
    }
}

enum QueueObservation {
    Front(StatusUpdate),
    Moved(StatusUpdate),
    Unchanged,
}

pub struct QueueObserver<'a> {
    coordinator: &'a dyn CoordinationClient,
    sink: &'a dyn StatusSink,
    participant_id: String,
    last_reported_position: Option<usize>,
}

impl<'a> QueueObserver<'a> {
    pub fn new(coordinator: &'a dyn CoordinationClient, sink: &'a dyn StatusSink, participant_id: &str) -> Self {
        Self {
            coordinator,
            sink,
            participant_id: participant_id.to_string(),
            last_reported_position: None,
        }
    }

    /// Watches the circuit document until the participant is first in
    /// the queue, then unsubscribes. The participant document will flip
    /// to CONTRIBUTING shortly after, which re-drives the dispatcher.
    pub async fn watch(mut self, ceremony_id: &str, circuit_id: &str) -> Result<()> {
        let mut subscription = self.coordinator.subscribe_circuit(ceremony_id, circuit_id).await?;
        while let Some(snapshot) = subscription.next().await {
            let circuit: Circuit = match snapshot.decode("circuits") {
                Ok(circuit) => circuit,
                Err(error) => {
                    warn!("Skipping undecodable circuit snapshot: {}", error);
                    continue;
                }
            };
            match self.classify(&circuit) {
                QueueObservation::Front(update) => {
                    self.sink.report(update);
                    return Ok(());
                }
                QueueObservation::Moved(update) => self.sink.report(update),
                QueueObservation::Unchanged => {}
            }
        }
        Ok(())
    }

    /// Pure per-snapshot step: position, dedup against the cached last
    /// report, ETA rendering.
    fn classify(&mut self, circuit: &Circuit) -> QueueObservation {
        let position = match circuit
            .waiting_queue
            .contributors
            .iter()
            .position(|contributor| contributor == &self.participant_id)
        {
            Some(index) => index + 1,
            // Not queued on this snapshot; nothing worth reporting.
            None => return QueueObservation::Unchanged,
        };
        if position == 1 {
            return QueueObservation::Front(StatusUpdate::busy(format!(
                "You are first in the queue for circuit # {} ({}), your contribution will begin shortly",
                circuit.sequence_position, circuit.prefix
            )));
        }
        if self.last_reported_position == Some(position) {
            return QueueObservation::Unchanged;
        }
        self.last_reported_position = Some(position);
        let eta = estimated_wait_millis(&circuit.avg_timings, position);
        QueueObservation::Moved(StatusUpdate::busy(format!(
            "Position {} in the queue for circuit # {} ({}), estimated wait {}",
            position,
            circuit.sequence_position,
            circuit.prefix,
            format_countdown(eta as i64)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_circuit, FakeCoordinator, RecordingSink};

    #[test]
    fn eta_is_zero_when_any_timing_is_unknown() {
        let known = AvgTimings {
            full_contribution: 10_000,
            verify_cloud_function: 2_000,
        };
        assert_eq!(estimated_wait_millis(&known, 3), 24_000);
        assert_eq!(estimated_wait_millis(&known, 1), 0);

        let unknown = AvgTimings {
            full_contribution: 10_000,
            verify_cloud_function: 0,
        };
        assert_eq!(estimated_wait_millis(&unknown, 3), 0);
    }

    #[tokio::test]
    async fn reports_positions_until_first_in_queue() {
        let coordinator = FakeCoordinator::new();
        coordinator.push_circuit_snapshot(test_circuit(1, &["p1", "p2", "p-self"], 0));
        // Redelivery of an equivalent queue state must stay silent.
        coordinator.push_circuit_snapshot(test_circuit(1, &["p1", "p2", "p-self"], 0));
        coordinator.push_circuit_snapshot(test_circuit(1, &["p2", "p-self"], 0));
        coordinator.push_circuit_snapshot(test_circuit(1, &["p-self"], 0));
        let sink = RecordingSink::new();

        let observer = QueueObserver::new(&coordinator, &sink, "p-self");
        observer.watch("ceremony-1", "circuit-1").await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("Position 3"));
        assert!(messages[0].contains("00:00:00:24"));
        assert!(messages[1].contains("Position 2"));
        assert!(messages[1].contains("00:00:00:12"));
        assert!(messages[2].contains("first in the queue"));
    }

    #[tokio::test]
    async fn ignores_snapshots_where_the_participant_is_not_queued() {
        let coordinator = FakeCoordinator::new();
        coordinator.push_circuit_snapshot(test_circuit(1, &["p1", "p2"], 0));
        coordinator.push_circuit_snapshot(test_circuit(1, &["p-self"], 0));
        let sink = RecordingSink::new();

        let observer = QueueObserver::new(&coordinator, &sink, "p-self");
        observer.watch("ceremony-1", "circuit-1").await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("first in the queue"));
    }
}
