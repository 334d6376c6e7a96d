//! The per-circuit contribution pipeline: DOWNLOAD, COMPUTE, UPLOAD,
//! VERIFY, entered at whatever step the participant document says.
//!
//! The client holds no lock over the participant record. Every step ends
//! with a server-side advance and a re-read of the document, so a crash
//! at any point leaves the next legitimate step to whatever the server
//! says it is. The refreshed snapshot may be several steps ahead.

use crate::{
    coordination::CoordinationClient,
    errors::ContributeError,
    settings::Settings,
    snark::ZkeyEngine,
    status::{StatusSink, StatusUpdate},
    storage::StorageOps,
    utils::{
        bucket_name, contribution_hash, format_hash, generate_entropy, last_zkey_filename,
        next_zkey_filename, read_from_file, remove_file_if_exists, write_to_file, zkey_storage_path,
    },
};
use anyhow::Result;
use chrono::Duration;
use phase2_shared::structures::{Ceremony, Circuit, ContributionStep, Participant};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Delay before re-reading the participant document after a server-side
/// step advance. Tolerable overhead, not a correctness gate.
const DELAY_STEP_SETTLE_SECS: i64 = 3;

pub struct ContributionPipeline<'a> {
    coordinator: &'a dyn CoordinationClient,
    storage: &'a dyn StorageOps,
    engine: &'a dyn ZkeyEngine,
    sink: &'a dyn StatusSink,
    settings: &'a Settings,
    scratch_dir: PathBuf,
}

impl<'a> ContributionPipeline<'a> {
    pub fn new(
        coordinator: &'a dyn CoordinationClient,
        storage: &'a dyn StorageOps,
        engine: &'a dyn ZkeyEngine,
        sink: &'a dyn StatusSink,
        settings: &'a Settings,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            coordinator,
            storage,
            engine,
            sink,
            settings,
            scratch_dir,
        }
    }

    /// Executes the contribution for one circuit, beginning at whatever
    /// step the participant is currently in.
    pub async fn run_or_resume(
        &self,
        ceremony: &Ceremony,
        circuit: &Circuit,
        participant: &Participant,
        participant_id: &str,
        contributor_id: &str,
    ) -> Result<()> {
        let mut current = participant.clone();
        loop {
            match current.contribution_step {
                Some(ContributionStep::Downloading) => {
                    self.download_step(ceremony, circuit).await?;
                }
                Some(ContributionStep::Computing) => {
                    self.compute_step(ceremony, circuit, contributor_id).await?;
                }
                Some(ContributionStep::Uploading) => {
                    self.upload_step(ceremony, circuit, &current).await?;
                }
                Some(ContributionStep::Verifying) => {
                    self.verify_step(ceremony, circuit, participant_id, contributor_id).await?;
                    return Ok(());
                }
                Some(ContributionStep::Completed) | None => return Ok(()),
            }
            current = self.refresh_participant(ceremony, participant_id).await?;
        }
    }

    fn scratch_path(&self, filename: &str) -> PathBuf {
        self.scratch_dir.join(filename)
    }

    fn bucket(&self, ceremony: &Ceremony) -> String {
        bucket_name(&ceremony.prefix, &self.settings.bucket_postfix)
    }

    async fn download_step(&self, ceremony: &Ceremony, circuit: &Circuit) -> Result<()> {
        let filename = last_zkey_filename(&circuit.prefix, circuit.waiting_queue.completed_contributions);
        self.sink
            .report(StatusUpdate::busy(format!("Downloading {}", filename)));
        self.fetch_last_zkey(ceremony, circuit, &filename).await?;
        self.advance_step(ceremony).await
    }

    /// Downloads the newest verified zkey into the scratch directory
    /// without touching the participant's step.
    async fn fetch_last_zkey(&self, ceremony: &Ceremony, circuit: &Circuit, filename: &str) -> Result<()> {
        let key = zkey_storage_path(&circuit.prefix, filename);
        let bytes = self
            .storage
            .download_artifact(&self.bucket(ceremony), &key, self.sink)
            .await?;
        write_to_file(&self.scratch_path(filename), &bytes)
    }

    async fn compute_step(&self, ceremony: &Ceremony, circuit: &Circuit, contributor_id: &str) -> Result<()> {
        let completed = circuit.waiting_queue.completed_contributions;
        let last_filename = last_zkey_filename(&circuit.prefix, completed);
        let last_path = self.scratch_path(&last_filename);
        if !last_path.exists() {
            // Relaunched mid-COMPUTING with a clean scratch directory.
            debug!("Scratch zkey {} is gone, fetching it again", last_filename);
            self.fetch_last_zkey(ceremony, circuit, &last_filename).await?;
        }
        let next_filename = next_zkey_filename(&circuit.prefix, completed);
        let next_path = self.scratch_path(&next_filename);
        remove_file_if_exists(&next_path)?;

        self.sink.report(StatusUpdate::busy(format!(
            "Computing contribution for circuit # {} ({})",
            circuit.sequence_position, circuit.prefix
        )));
        let entropy = generate_entropy();
        let start = Instant::now();
        self.engine
            .contribute(&last_path, &next_path, contributor_id, &entropy)
            .await?;
        let time_ms = start.elapsed().as_millis() as u64;

        let output = read_from_file(&next_path)?;
        let hash = format_hash(&contribution_hash(&output), "Contribution Hash: ");
        self.coordinator
            .permanently_store_current_contribution_time_and_hash(&ceremony.id, time_ms, &hash)
            .await?;
        info!(
            "Computed contribution # {} for circuit # {} in {} ms",
            completed + 1,
            circuit.sequence_position,
            time_ms
        );
        self.advance_step(ceremony).await
    }

    async fn upload_step(&self, ceremony: &Ceremony, circuit: &Circuit, participant: &Participant) -> Result<()> {
        let filename = next_zkey_filename(&circuit.prefix, circuit.waiting_queue.completed_contributions);
        let path = self.scratch_path(&filename);
        let bytes = read_from_file(&path)
            .map_err(|_| ContributeError::MissingScratchFileError(filename.clone()))?;
        self.sink
            .report(StatusUpdate::busy(format!("Uploading {}", filename)));
        let key = zkey_storage_path(&circuit.prefix, &filename);
        self.storage
            .multipart_upload(
                &ceremony.id,
                &self.bucket(ceremony),
                &key,
                &bytes,
                self.sink,
                participant.temp_contribution_data.as_ref(),
            )
            .await?;
        self.advance_step(ceremony).await
    }

    async fn verify_step(
        &self,
        ceremony: &Ceremony,
        circuit: &Circuit,
        participant_id: &str,
        contributor_id: &str,
    ) -> Result<()> {
        self.sink.report(StatusUpdate::busy(format!(
            "Verifying contribution to circuit # {}",
            circuit.sequence_position
        )));
        self.coordinator
            .verify_contribution(
                &ceremony.id,
                &circuit.id,
                &self.bucket(ceremony),
                contributor_id,
                &self.settings.verify_contribution_url,
            )
            .await?;
        match self
            .coordinator
            .get_contribution_by_participant(&ceremony.id, &circuit.id, participant_id)
            .await?
        {
            Some(contribution) => self.sink.report(StatusUpdate::message(verification_result_message(
                circuit,
                contribution.valid,
            ))),
            None => self.sink.report(StatusUpdate::busy(format!(
                "Verification of circuit # {} is still running",
                circuit.sequence_position
            ))),
        }
        Ok(())
    }

    async fn advance_step(&self, ceremony: &Ceremony) -> Result<()> {
        self.coordinator
            .progress_to_next_contribution_step(&ceremony.id)
            .await?;
        sleep(Duration::seconds(DELAY_STEP_SETTLE_SECS).to_std()?).await;
        Ok(())
    }

    async fn refresh_participant(&self, ceremony: &Ceremony, participant_id: &str) -> Result<Participant> {
        let snapshot = self.coordinator.get_participant(&ceremony.id, participant_id).await?;
        snapshot.decode("participants")
    }
}

pub fn verification_result_message(circuit: &Circuit, valid: bool) -> String {
    if valid {
        format!(
            "Your contribution to circuit # {} ({}) was verified as valid",
            circuit.sequence_position, circuit.prefix
        )
    } else {
        format!(
            "Your contribution to circuit # {} ({}) was found invalid and will be discarded",
            circuit.sequence_position, circuit.prefix
        )
    }
}

/// Scratch files are only meaningful within one circuit; a new circuit
/// starts from a clean buffer.
pub fn clean_circuit_scratch(scratch_dir: &Path, circuit: &Circuit) -> Result<()> {
    let completed = circuit.waiting_queue.completed_contributions;
    remove_file_if_exists(&scratch_dir.join(last_zkey_filename(&circuit.prefix, completed)))?;
    remove_file_if_exists(&scratch_dir.join(next_zkey_filename(&circuit.prefix, completed)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        scratch_dir, test_ceremony, test_circuit, test_participant, FakeCoordinator, FakeEngine,
        FakeStorage, RecordingSink,
    };
    use phase2_shared::structures::{ParticipantStatus, TempContributionData};

    fn participant_at(step: ContributionStep) -> Participant {
        let mut participant = test_participant(ParticipantStatus::Contributing, 1);
        participant.contribution_step = Some(step);
        participant
    }

    /// Runs the pipeline from `start` against scripted refresh states.
    async fn run_pipeline(
        coordinator: &FakeCoordinator,
        storage: &FakeStorage,
        start: ContributionStep,
        dir: &Path,
    ) -> Result<()> {
        let engine = FakeEngine;
        let sink = RecordingSink::new();
        let settings = Settings::default();
        let pipeline = ContributionPipeline::new(
            coordinator,
            storage,
            &engine,
            &sink,
            &settings,
            dir.to_path_buf(),
        );
        pipeline
            .run_or_resume(
                &test_ceremony(),
                &test_circuit(1, &[], 0),
                &participant_at(start),
                "p-self",
                "octocat",
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_visits_every_step_in_order() {
        let dir = scratch_dir("pipeline-full");
        let coordinator = FakeCoordinator::new();
        coordinator.push_refresh(participant_at(ContributionStep::Computing));
        coordinator.push_refresh(participant_at(ContributionStep::Uploading));
        coordinator.push_refresh(participant_at(ContributionStep::Verifying));
        let storage = FakeStorage::with_artifact(b"zkey-00000".to_vec());

        run_pipeline(&coordinator, &storage, ContributionStep::Downloading, &dir)
            .await
            .unwrap();

        assert_eq!(
            coordinator.calls(),
            vec![
                "progress_to_next_contribution_step",
                "permanently_store_current_contribution_time_and_hash",
                "progress_to_next_contribution_step",
                "progress_to_next_contribution_step",
                "verify_contribution",
                "get_contribution_by_participant",
            ]
        );
        assert_eq!(storage.downloads(), 1);
        assert_eq!(storage.uploads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verifying_only_invokes_the_verify_branch() {
        let dir = scratch_dir("pipeline-verify");
        let coordinator = FakeCoordinator::new();
        let storage = FakeStorage::with_artifact(vec![]);

        run_pipeline(&coordinator, &storage, ContributionStep::Verifying, &dir)
            .await
            .unwrap();

        assert_eq!(
            coordinator.calls(),
            vec!["verify_contribution", "get_contribution_by_participant"]
        );
        assert_eq!(storage.downloads(), 0);
        assert_eq!(storage.uploads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_step_is_a_no_op() {
        let dir = scratch_dir("pipeline-completed");
        let coordinator = FakeCoordinator::new();
        let storage = FakeStorage::with_artifact(vec![]);

        run_pipeline(&coordinator, &storage, ContributionStep::Completed, &dir)
            .await
            .unwrap();

        assert!(coordinator.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_at_computing_refetches_a_missing_source_zkey() {
        let dir = scratch_dir("pipeline-refetch");
        let coordinator = FakeCoordinator::new();
        coordinator.push_refresh(participant_at(ContributionStep::Verifying));
        let storage = FakeStorage::with_artifact(b"zkey-00000".to_vec());

        run_pipeline(&coordinator, &storage, ContributionStep::Computing, &dir)
            .await
            .unwrap();

        // The source artifact was re-downloaded, but the step was only
        // advanced once (after the compute).
        assert_eq!(storage.downloads(), 1);
        assert_eq!(
            coordinator.calls(),
            vec![
                "permanently_store_current_contribution_time_and_hash",
                "progress_to_next_contribution_step",
                "verify_contribution",
                "get_contribution_by_participant",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resume_at_uploading_without_scratch_file_surfaces_an_error() {
        let dir = scratch_dir("pipeline-missing-scratch");
        let coordinator = FakeCoordinator::new();
        let storage = FakeStorage::with_artifact(vec![]);

        let error = run_pipeline(&coordinator, &storage, ContributionStep::Uploading, &dir)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("missing"));
        assert!(coordinator.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_passes_temp_contribution_data_through() {
        let dir = scratch_dir("pipeline-temp-data");
        let coordinator = FakeCoordinator::new();
        coordinator.push_refresh(participant_at(ContributionStep::Verifying));
        let storage = FakeStorage::with_artifact(vec![]);

        // Scratch file for the pending upload already exists.
        write_to_file(&dir.join("multiplier2_00001.zkey"), b"next-zkey").unwrap();

        let engine = FakeEngine;
        let sink = RecordingSink::new();
        let settings = Settings::default();
        let pipeline = ContributionPipeline::new(
            &coordinator,
            &storage,
            &engine,
            &sink,
            &settings,
            dir.clone(),
        );
        let mut participant = participant_at(ContributionStep::Uploading);
        participant.temp_contribution_data = Some(TempContributionData {
            upload_id: "upl-1".to_string(),
            chunks: vec![],
        });
        pipeline
            .run_or_resume(
                &test_ceremony(),
                &test_circuit(1, &[], 0),
                &participant,
                "p-self",
                "octocat",
            )
            .await
            .unwrap();

        let recorded = storage.last_temp_data();
        assert_eq!(recorded.unwrap().upload_id, "upl-1");
    }

    #[test]
    fn verification_messages_name_the_circuit() {
        let circuit = test_circuit(2, &[], 0);
        assert!(verification_result_message(&circuit, true).contains("circuit # 2"));
        assert!(verification_result_message(&circuit, false).contains("invalid"));
    }
}
