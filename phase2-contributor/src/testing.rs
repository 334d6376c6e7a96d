//! In-memory fakes and fixtures shared by the unit tests.

use crate::{
    coordination::{CoordinationClient, DocumentSnapshot, Subscription},
    snark::ZkeyEngine,
    status::{StatusSink, StatusUpdate},
    storage::StorageOps,
    utils::{read_from_file, write_to_file},
};
use anyhow::Result;
use async_trait::async_trait;
use phase2_shared::structures::{
    AvgTimings, Ceremony, Circuit, Contribution, EtagWithPartNumber, Participant,
    ParticipantStatus, TempContributionData, TimeoutRecord, WaitingQueue,
};
use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 64;

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("phase2-test-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_ceremony() -> Ceremony {
    Ceremony {
        id: "ceremony-1".to_string(),
        title: "Grand Ceremony".to_string(),
        prefix: "grand-ceremony".to_string(),
    }
}

pub fn test_circuit(sequence_position: u64, contributors: &[&str], completed_contributions: u64) -> Circuit {
    Circuit {
        id: format!("circuit-{}", sequence_position),
        sequence_position,
        prefix: "multiplier2".to_string(),
        avg_timings: AvgTimings {
            full_contribution: 10_000,
            verify_cloud_function: 2_000,
        },
        waiting_queue: WaitingQueue {
            current_contributor: contributors.first().map(|c| c.to_string()).unwrap_or_default(),
            contributors: contributors.iter().map(|c| c.to_string()).collect(),
            completed_contributions,
        },
    }
}

pub fn test_participant(status: ParticipantStatus, contribution_progress: u64) -> Participant {
    Participant {
        status,
        contribution_progress,
        contribution_step: None,
        contributions: vec![],
        temp_contribution_data: None,
    }
}

fn to_snapshot(id: &str, participant: &Participant) -> DocumentSnapshot {
    DocumentSnapshot {
        id: id.to_string(),
        data: Some(serde_json::to_value(participant).unwrap()),
    }
}

/// Collects every reported update for later assertions.
pub struct RecordingSink {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(vec![]),
        }
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.updates().into_iter().map(|update| update.message).collect()
    }
}

impl StatusSink for RecordingSink {
    fn report(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// Deterministic stand-in for the zkey transform: appends a marker to
/// the previous artifact.
pub struct FakeEngine;

#[async_trait]
impl ZkeyEngine for FakeEngine {
    async fn contribute(
        &self,
        last_zkey: &Path,
        next_zkey: &Path,
        _contributor_id: &str,
        _entropy: &str,
    ) -> Result<()> {
        let mut bytes = read_from_file(last_zkey)?;
        bytes.extend_from_slice(b"+contribution");
        write_to_file(next_zkey, &bytes)
    }
}

/// Records download and upload traffic instead of talking to object
/// storage.
pub struct FakeStorage {
    artifact: Vec<u8>,
    downloads: Mutex<usize>,
    uploads: Mutex<usize>,
    last_uploaded: Mutex<Option<Vec<u8>>>,
    last_temp_data: Mutex<Option<TempContributionData>>,
}

impl FakeStorage {
    pub fn with_artifact(artifact: Vec<u8>) -> Self {
        Self {
            artifact,
            downloads: Mutex::new(0),
            uploads: Mutex::new(0),
            last_uploaded: Mutex::new(None),
            last_temp_data: Mutex::new(None),
        }
    }

    pub fn downloads(&self) -> usize {
        *self.downloads.lock().unwrap()
    }

    pub fn uploads(&self) -> usize {
        *self.uploads.lock().unwrap()
    }

    pub fn last_uploaded(&self) -> Option<Vec<u8>> {
        self.last_uploaded.lock().unwrap().clone()
    }

    pub fn last_temp_data(&self) -> Option<TempContributionData> {
        self.last_temp_data.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageOps for FakeStorage {
    async fn download_artifact(&self, _bucket: &str, _key: &str, _sink: &dyn StatusSink) -> Result<Vec<u8>> {
        *self.downloads.lock().unwrap() += 1;
        Ok(self.artifact.clone())
    }

    async fn multipart_upload(
        &self,
        _ceremony_id: &str,
        _bucket: &str,
        _key: &str,
        bytes: &[u8],
        _sink: &dyn StatusSink,
        temp: Option<&TempContributionData>,
    ) -> Result<()> {
        *self.uploads.lock().unwrap() += 1;
        *self.last_uploaded.lock().unwrap() = Some(bytes.to_vec());
        *self.last_temp_data.lock().unwrap() = temp.cloned();
        Ok(())
    }
}

/// Scriptable in-memory coordination store.
pub struct FakeCoordinator {
    calls: Mutex<Vec<&'static str>>,
    circuits: Mutex<Vec<Circuit>>,
    timeouts: Mutex<Vec<TimeoutRecord>>,
    contributions: Mutex<HashMap<String, Contribution>>,
    refreshes: Mutex<VecDeque<Participant>>,
    participant_sender: Mutex<Option<mpsc::Sender<DocumentSnapshot>>>,
    participant_receiver: Mutex<Option<mpsc::Receiver<DocumentSnapshot>>>,
    circuit_sender: Mutex<Option<mpsc::Sender<DocumentSnapshot>>>,
    circuit_receiver: Mutex<Option<mpsc::Receiver<DocumentSnapshot>>>,
}

impl FakeCoordinator {
    pub fn new() -> Self {
        let (participant_sender, participant_receiver) = mpsc::channel(FEED_CAPACITY);
        let (circuit_sender, circuit_receiver) = mpsc::channel(FEED_CAPACITY);
        Self {
            calls: Mutex::new(vec![]),
            circuits: Mutex::new(vec![]),
            timeouts: Mutex::new(vec![]),
            contributions: Mutex::new(HashMap::new()),
            refreshes: Mutex::new(VecDeque::new()),
            participant_sender: Mutex::new(Some(participant_sender)),
            participant_receiver: Mutex::new(Some(participant_receiver)),
            circuit_sender: Mutex::new(Some(circuit_sender)),
            circuit_receiver: Mutex::new(Some(circuit_receiver)),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }

    pub fn set_circuits(&self, circuits: Vec<Circuit>) {
        *self.circuits.lock().unwrap() = circuits;
    }

    pub fn set_timeouts(&self, timeouts: Vec<TimeoutRecord>) {
        *self.timeouts.lock().unwrap() = timeouts;
    }

    pub fn set_contribution(&self, circuit_id: &str, valid: bool, zkey_index: &str) {
        self.contributions.lock().unwrap().insert(
            circuit_id.to_string(),
            Contribution {
                participant_id: "p-self".to_string(),
                zkey_index: zkey_index.to_string(),
                hash: "Contribution Hash: \n\t\tdeadbeef".to_string(),
                time_ms: 1_234,
                valid,
            },
        );
    }

    /// Queues a snapshot on the participant change feed.
    pub fn push_participant_snapshot(&self, participant: Participant) {
        let sender = self.participant_sender.lock().unwrap();
        sender
            .as_ref()
            .expect("participant feed already closed")
            .try_send(to_snapshot("p-self", &participant))
            .unwrap();
    }

    /// Queues a state for the next participant document re-read.
    pub fn push_refresh(&self, participant: Participant) {
        self.refreshes.lock().unwrap().push_back(participant);
    }

    pub fn push_circuit_snapshot(&self, circuit: Circuit) {
        let sender = self.circuit_sender.lock().unwrap();
        sender
            .as_ref()
            .expect("circuit feed already closed")
            .try_send(DocumentSnapshot {
                id: circuit.id.clone(),
                data: Some(serde_json::to_value(&circuit).unwrap()),
            })
            .unwrap();
    }

    /// Ends the participant feed after the queued snapshots drain.
    pub fn close_participant_feed(&self) {
        self.participant_sender.lock().unwrap().take();
    }
}

#[async_trait]
impl CoordinationClient for FakeCoordinator {
    async fn get_ceremony(&self, _ceremony_id: &str) -> Result<Ceremony> {
        Ok(test_ceremony())
    }

    async fn get_participant(&self, _ceremony_id: &str, participant_id: &str) -> Result<DocumentSnapshot> {
        let next = self.refreshes.lock().unwrap().pop_front();
        Ok(match next {
            Some(participant) => to_snapshot(participant_id, &participant),
            None => DocumentSnapshot {
                id: participant_id.to_string(),
                data: None,
            },
        })
    }

    async fn get_circuits(&self, _ceremony_id: &str) -> Result<Vec<Circuit>> {
        Ok(self.circuits.lock().unwrap().clone())
    }

    async fn get_timeouts(&self, _ceremony_id: &str, _participant_id: &str) -> Result<Vec<TimeoutRecord>> {
        Ok(self.timeouts.lock().unwrap().clone())
    }

    async fn get_contribution_by_participant(
        &self,
        _ceremony_id: &str,
        circuit_id: &str,
        participant_id: &str,
    ) -> Result<Option<Contribution>> {
        self.record("get_contribution_by_participant");
        Ok(self
            .contributions
            .lock()
            .unwrap()
            .get(circuit_id)
            .filter(|contribution| contribution.participant_id == participant_id)
            .cloned())
    }

    async fn subscribe_participant(&self, _ceremony_id: &str, _participant_id: &str) -> Result<Subscription> {
        let receiver = self
            .participant_receiver
            .lock()
            .unwrap()
            .take()
            .expect("participant feed already subscribed");
        Ok(Subscription::new(receiver, None))
    }

    async fn subscribe_circuit(&self, _ceremony_id: &str, _circuit_id: &str) -> Result<Subscription> {
        let receiver = self
            .circuit_receiver
            .lock()
            .unwrap()
            .take()
            .expect("circuit feed already subscribed");
        Ok(Subscription::new(receiver, None))
    }

    async fn check_participant_for_ceremony(&self, _ceremony_id: &str) -> Result<bool> {
        self.record("check_participant_for_ceremony");
        Ok(true)
    }

    async fn progress_to_next_circuit_for_contribution(&self, _ceremony_id: &str) -> Result<()> {
        self.record("progress_to_next_circuit_for_contribution");
        Ok(())
    }

    async fn progress_to_next_contribution_step(&self, _ceremony_id: &str) -> Result<()> {
        self.record("progress_to_next_contribution_step");
        Ok(())
    }

    async fn permanently_store_current_contribution_time_and_hash(
        &self,
        _ceremony_id: &str,
        _time_ms: u64,
        _hash: &str,
    ) -> Result<()> {
        self.record("permanently_store_current_contribution_time_and_hash");
        Ok(())
    }

    async fn verify_contribution(
        &self,
        _ceremony_id: &str,
        _circuit_id: &str,
        _bucket: &str,
        _contributor_id: &str,
        _verify_url: &str,
    ) -> Result<()> {
        self.record("verify_contribution");
        Ok(())
    }

    async fn resume_contribution_after_timeout_expiration(&self, _ceremony_id: &str) -> Result<()> {
        self.record("resume_contribution_after_timeout_expiration");
        Ok(())
    }

    async fn open_multipart_upload(&self, _ceremony_id: &str, _bucket: &str, _key: &str) -> Result<String> {
        self.record("open_multipart_upload");
        Ok("upload-1".to_string())
    }

    async fn generate_pre_signed_urls_parts(
        &self,
        _ceremony_id: &str,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        parts: usize,
    ) -> Result<Vec<String>> {
        self.record("generate_pre_signed_urls_parts");
        Ok((1..=parts)
            .map(|part| format!("https://storage.example/part/{}", part))
            .collect())
    }

    async fn temporarily_store_uploaded_chunk(
        &self,
        _ceremony_id: &str,
        _chunk: EtagWithPartNumber,
    ) -> Result<()> {
        self.record("temporarily_store_uploaded_chunk");
        Ok(())
    }

    async fn complete_multipart_upload(
        &self,
        _ceremony_id: &str,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        _parts: &[EtagWithPartNumber],
    ) -> Result<()> {
        self.record("complete_multipart_upload");
        Ok(())
    }

    async fn generate_get_object_pre_signed_url(&self, _bucket: &str, _key: &str) -> Result<String> {
        self.record("generate_get_object_pre_signed_url");
        Ok("https://storage.example/download".to_string())
    }
}

/// Returns a fixed reference instead of publishing a gist.
pub struct FakePublisher {
    reference: String,
}

impl FakePublisher {
    pub fn new(reference: &str) -> Self {
        Self {
            reference: reference.to_string(),
        }
    }
}

#[async_trait]
impl crate::attestation::AttestationPublisher for FakePublisher {
    async fn publish(&self, _ceremony_prefix: &str, _ceremony_title: &str, _content: &str) -> Result<String> {
        Ok(self.reference.clone())
    }
}
