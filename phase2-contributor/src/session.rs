//! The participant state machine: classifies each observed change of the
//! participant document and dispatches the matching action.
//!
//! The dispatcher is pure over (previous snapshot, current snapshot,
//! circuit list); every side effect goes through idempotent server
//! callables, so redelivered snapshots are harmless.

use crate::{
    attestation::{self, AttestationPublisher},
    coordination::CoordinationClient,
    errors::ContributeError,
    pipeline::{clean_circuit_scratch, verification_result_message, ContributionPipeline},
    queue::QueueObserver,
    settings::Settings,
    snark::ZkeyEngine,
    status::{StatusSink, StatusUpdate},
    storage::StorageOps,
    utils::format_countdown,
};
use anyhow::Result;
use chrono::{Duration, Utc};
use phase2_shared::structures::{
    Ceremony, Circuit, ContributionStep, Participant, ParticipantStatus, TimeoutRecord,
};
use std::path::PathBuf;
use tokio::time::sleep;
use tracing::{debug, info};

/// Delay after asking the server to open the next circuit, so its write
/// settles before the next snapshot arrives.
const DELAY_AFTER_PROGRESS_SECS: i64 = 1;

/// Everything the dispatcher needs to know about one participant
/// snapshot, in normal form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotPredicates {
    pub is_waiting: bool,
    pub is_current_contributor: bool,
    pub progress_to_next: bool,
    pub completed_contribution: bool,
    pub timeout_triggered_while_contributing: bool,
    pub timeout_expired: bool,
    pub already_contributed_to_every_circuit: bool,
    pub has_resumable_step: bool,
    pub starting_or_resuming_contribution: bool,
    pub status_unchanged: bool,
    pub step_unchanged: bool,
}

/// Finds the circuit a 1-based contribution progress points at.
pub fn circuit_for_progress(circuits: &[Circuit], progress: u64) -> Option<&Circuit> {
    if progress == 0 {
        return None;
    }
    circuits.iter().find(|circuit| circuit.sequence_position == progress)
}

fn same_temp_contribution_data(left: &Participant, right: &Participant) -> bool {
    match (&left.temp_contribution_data, &right.temp_contribution_data) {
        (Some(a), Some(b)) => {
            if a.upload_id != b.upload_id || a.chunks.len() != b.chunks.len() {
                return false;
            }
            let mut left_chunks = a.chunks.clone();
            let mut right_chunks = b.chunks.clone();
            left_chunks.sort_by(|x, y| (x.part_number, &x.etag).cmp(&(y.part_number, &y.etag)));
            right_chunks.sort_by(|x, y| (x.part_number, &x.etag).cmp(&(y.part_number, &y.etag)));
            left_chunks == right_chunks
        }
        _ => false,
    }
}

/// Computes the predicate set for one snapshot. With no previous
/// snapshot the comparison is made against the current one itself, so a
/// fresh attach classifies as "unchanged" and resume paths fire.
pub fn compute_predicates(
    previous: Option<&Participant>,
    current: &Participant,
    circuits: &[Circuit],
    participant_id: &str,
) -> SnapshotPredicates {
    let previous = previous.unwrap_or(current);
    let total_circuits = circuits.len() as u64;
    let status_unchanged = previous.status == current.status;
    let step_unchanged = previous.contribution_step == current.contribution_step;
    let no_change = status_unchanged && step_unchanged;

    let step = current.contribution_step;
    let current_circuit = circuit_for_progress(circuits, current.contribution_progress);
    let is_current_contributor = current.status == ParticipantStatus::Contributing
        && current_circuit
            .map(|circuit| circuit.waiting_queue.current_contributor == participant_id)
            .unwrap_or(false);
    let has_resumable_step = step.map(|step| step.is_resumable()).unwrap_or(false);

    let downloading_branch = step == Some(ContributionStep::Downloading)
        && (no_change
            || previous.contribution_step != current.contribution_step
            || previous.status == ParticipantStatus::Exhumed
            || previous.contribution_step.is_none());
    let computing_branch = step == Some(ContributionStep::Computing)
        && no_change
        && previous.contributions.len() == current.contributions.len();
    let uploading_branch = step == Some(ContributionStep::Uploading)
        && no_change
        && previous.temp_contribution_data.is_none()
        && current.temp_contribution_data.is_none();
    let resuming_upload_branch = same_temp_contribution_data(previous, current);

    let progress_to_next = step == Some(ContributionStep::Completed);

    SnapshotPredicates {
        is_waiting: current.status == ParticipantStatus::Waiting,
        is_current_contributor,
        progress_to_next,
        completed_contribution: progress_to_next && current.status == ParticipantStatus::Contributed,
        timeout_triggered_while_contributing: current.status == ParticipantStatus::Timedout
            && step != Some(ContributionStep::Completed),
        timeout_expired: current.status == ParticipantStatus::Exhumed,
        already_contributed_to_every_circuit: current.status == ParticipantStatus::Done
            && step == Some(ContributionStep::Completed)
            && current.contribution_progress == total_circuits
            && current.contributions.len() as u64 == total_circuits,
        has_resumable_step,
        starting_or_resuming_contribution: downloading_branch
            || computing_branch
            || uploading_branch
            || resuming_upload_branch,
        status_unchanged,
        step_unchanged,
    }
}

enum Dispatch {
    Continue,
    Terminate,
}

/// One participant's contribution session. Lives for as long as the
/// participant subscription does.
pub struct ContributionSession<'a> {
    coordinator: &'a dyn CoordinationClient,
    storage: &'a dyn StorageOps,
    engine: &'a dyn ZkeyEngine,
    sink: &'a dyn StatusSink,
    publisher: &'a dyn AttestationPublisher,
    settings: &'a Settings,
    ceremony: Ceremony,
    participant_id: String,
    contributor_handle: String,
    scratch_dir: PathBuf,
    previous: Option<Participant>,
}

impl<'a> ContributionSession<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: &'a dyn CoordinationClient,
        storage: &'a dyn StorageOps,
        engine: &'a dyn ZkeyEngine,
        sink: &'a dyn StatusSink,
        publisher: &'a dyn AttestationPublisher,
        settings: &'a Settings,
        ceremony: Ceremony,
        participant_id: String,
        contributor_handle: String,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            coordinator,
            storage,
            engine,
            sink,
            publisher,
            settings,
            ceremony,
            participant_id,
            contributor_handle,
            scratch_dir,
            previous: None,
        }
    }

    /// Consumes participant snapshots until the session reaches a
    /// terminal state. Dispatch failures are surfaced through the sink
    /// and the session keeps going; the next snapshot re-drives it.
    pub async fn run(mut self) -> Result<()> {
        let mut subscription = self
            .coordinator
            .subscribe_participant(&self.ceremony.id, &self.participant_id)
            .await?;
        while let Some(snapshot) = subscription.next().await {
            let participant: Participant = match snapshot.decode("participants") {
                Ok(participant) => participant,
                Err(error) => {
                    self.sink
                        .report(StatusUpdate::message(format!("Error reading participant data: {}", error)));
                    continue;
                }
            };
            match self.dispatch(&participant).await {
                Ok(Dispatch::Continue) => {}
                Ok(Dispatch::Terminate) => return Ok(()),
                Err(error) => {
                    self.sink
                        .report(StatusUpdate::message(format!("Error: {}", error)));
                }
            }
            self.previous = Some(participant);
        }
        Err(ContributeError::SubscriptionClosedError.into())
    }

    async fn dispatch(&mut self, current: &Participant) -> Result<Dispatch> {
        let circuits = self.coordinator.get_circuits(&self.ceremony.id).await?;
        let predicates = compute_predicates(self.previous.as_ref(), current, &circuits, &self.participant_id);
        debug!(?predicates, "Dispatching participant snapshot");

        // A participant that has never contributed asks for its first circuit.
        if current.status == ParticipantStatus::Waiting
            && current.contribution_step.is_none()
            && current.contributions.is_empty()
            && current.contribution_progress == 0
        {
            info!("Joining the ceremony, asking for the first circuit");
            self.coordinator
                .progress_to_next_circuit_for_contribution(&self.ceremony.id)
                .await?;
            sleep(Duration::seconds(DELAY_AFTER_PROGRESS_SECS).to_std()?).await;
            return Ok(Dispatch::Continue);
        }

        let circuit = circuit_for_progress(&circuits, current.contribution_progress);

        if predicates.is_current_contributor
            && predicates.has_resumable_step
            && predicates.starting_or_resuming_contribution
        {
            let circuit =
                circuit.ok_or(ContributeError::MissingCircuitError(current.contribution_progress))?;
            self.sink.report(StatusUpdate::busy(format!(
                "Contributing to circuit # {} ({})",
                circuit.sequence_position, circuit.prefix
            )));
            let pipeline = ContributionPipeline::new(
                self.coordinator,
                self.storage,
                self.engine,
                self.sink,
                self.settings,
                self.scratch_dir.clone(),
            );
            if let Err(error) = pipeline
                .run_or_resume(&self.ceremony, circuit, current, &self.participant_id, &self.contributor_handle)
                .await
            {
                self.sink
                    .report(StatusUpdate::message(format!("Error during the contribution: {}", error)));
            }
        } else if predicates.is_waiting {
            if let Some(circuit) = circuit {
                let observer = QueueObserver::new(self.coordinator, self.sink, &self.participant_id);
                observer.watch(&self.ceremony.id, &circuit.id).await?;
            }
        }

        if predicates.is_current_contributor
            && current.contribution_step == Some(ContributionStep::Verifying)
            && predicates.status_unchanged
            && predicates.step_unchanged
        {
            if let Some(circuit) = circuit {
                self.sink.report(StatusUpdate::busy(format!(
                    "Resuming verification of circuit # {}",
                    circuit.sequence_position
                )));
            }
        }

        if predicates.progress_to_next
            && predicates.status_unchanged
            && matches!(
                current.status,
                ParticipantStatus::Done | ParticipantStatus::Contributed
            )
        {
            self.emit_last_verification_result(&circuits, current).await?;
        }

        if predicates.timeout_triggered_while_contributing {
            let active = self.active_timeouts().await?;
            if active.len() != 1 {
                self.sink.report(StatusUpdate::message(format!(
                    "Error: {}",
                    ContributeError::UnexpectedTimeoutCountError(active.len())
                )));
                return Ok(Dispatch::Terminate);
            }
            let remaining = active[0].end_date - Utc::now().timestamp_millis();
            self.sink.report(StatusUpdate::message(format!(
                "Timed out while contributing. You can resume in {}",
                format_countdown(remaining)
            )));
        }

        if predicates.completed_contribution || predicates.timeout_expired {
            if predicates.completed_contribution {
                self.emit_last_verification_result(&circuits, current).await?;
                if let Some(circuit) = circuit {
                    clean_circuit_scratch(&self.scratch_dir, circuit)?;
                }
                match circuit_for_progress(&circuits, current.contribution_progress + 1) {
                    Some(next) => {
                        self.sink.report(StatusUpdate::busy(format!(
                            "Moving on to circuit # {} ({})",
                            next.sequence_position, next.prefix
                        )));
                        self.coordinator
                            .progress_to_next_circuit_for_contribution(&self.ceremony.id)
                            .await?;
                    }
                    // The last circuit ends with a DONE transition instead.
                    None => {}
                }
            } else {
                if let Some(circuit) = circuit {
                    self.sink.report(StatusUpdate::busy(format!(
                        "Cool-down expired, resuming contribution to circuit # {}",
                        circuit.sequence_position
                    )));
                }
                self.coordinator
                    .resume_contribution_after_timeout_expiration(&self.ceremony.id)
                    .await?;
            }
        }

        if predicates.already_contributed_to_every_circuit {
            match self.finalize(&circuits).await {
                Ok(share_ref) => {
                    self.sink.report(StatusUpdate::attestation(
                        format!(
                            "You have contributed to every circuit of {}. Thank you for participating!",
                            self.ceremony.title
                        ),
                        share_ref,
                    ));
                    return Ok(Dispatch::Terminate);
                }
                Err(error) => {
                    // Stay subscribed; a redelivered snapshot retries this.
                    self.sink
                        .report(StatusUpdate::message(format!("Error publishing the attestation: {}", error)));
                }
            }
        }

        Ok(Dispatch::Continue)
    }

    async fn emit_last_verification_result(&self, circuits: &[Circuit], current: &Participant) -> Result<()> {
        let circuit = circuit_for_progress(circuits, current.contribution_progress)
            .ok_or(ContributeError::MissingCircuitError(current.contribution_progress))?;
        match self
            .coordinator
            .get_contribution_by_participant(&self.ceremony.id, &circuit.id, &self.participant_id)
            .await?
        {
            Some(contribution) => self
                .sink
                .report(StatusUpdate::message(verification_result_message(circuit, contribution.valid))),
            None => self.sink.report(StatusUpdate::busy(format!(
                "Verification of circuit # {} is still running",
                circuit.sequence_position
            ))),
        }
        Ok(())
    }

    async fn active_timeouts(&self) -> Result<Vec<TimeoutRecord>> {
        let now = Utc::now().timestamp_millis();
        let timeouts = self
            .coordinator
            .get_timeouts(&self.ceremony.id, &self.participant_id)
            .await?;
        Ok(timeouts.into_iter().filter(|timeout| timeout.end_date > now).collect())
    }

    async fn finalize(&self, circuits: &[Circuit]) -> Result<String> {
        attestation::handle_public_attestation(
            self.coordinator,
            self.publisher,
            circuits,
            &self.ceremony,
            &self.participant_id,
            &self.contributor_handle,
        )
        .await
    }
}
