//! Wire structures for the documents kept in the coordination store.
//!
//! The store persists JSON documents with camelCase attribute names;
//! every struct here mirrors that naming on the wire.

use serde::{Deserialize, Serialize};

/// Lifecycle of a ceremony participant, as written by the coordinator.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParticipantStatus {
    Waiting,
    Contributing,
    Contributed,
    Done,
    Timedout,
    Exhumed,
}

/// The step a contributing participant is currently in.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContributionStep {
    Downloading,
    Computing,
    Uploading,
    Verifying,
    Completed,
}

impl ContributionStep {
    /// Returns `true` if a contributor can pick the pipeline back up
    /// from this step after a disconnect.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            ContributionStep::Downloading | ContributionStep::Computing | ContributionStep::Uploading
        )
    }
}

/// Top-level ceremony document.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ceremony {
    pub id: String,
    pub title: String,
    /// Storage-path namespace shared by every artifact of the ceremony.
    pub prefix: String,
}

/// Average timings observed by the coordinator, in milliseconds.
/// Zero means "unknown".
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvgTimings {
    #[serde(default)]
    pub full_contribution: u64,
    #[serde(default)]
    pub verify_cloud_function: u64,
}

/// The per-circuit queue of contributors managed by the coordinator.
///
/// The current contributor, when set, is always the head of
/// `contributors`, and `completed_contributions` never decreases.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WaitingQueue {
    #[serde(default)]
    pub current_contributor: String,
    #[serde(default)]
    pub contributors: Vec<String>,
    #[serde(default)]
    pub completed_contributions: u64,
}

/// One circuit of a ceremony.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Circuit {
    pub id: String,
    /// 1-based position in the ceremony's contribution order.
    pub sequence_position: u64,
    pub prefix: String,
    #[serde(default)]
    pub avg_timings: AvgTimings,
    #[serde(default)]
    pub waiting_queue: WaitingQueue,
}

/// One uploaded part of a multipart upload, acknowledged by object storage.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EtagWithPartNumber {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
}

/// Per-step scratch state kept on the participant document so that an
/// interrupted upload can resume from the last acknowledged part.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TempContributionData {
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub chunks: Vec<EtagWithPartNumber>,
}

/// Reference kept on the participant document for each completed circuit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContributionReference {
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub computation_time: u64,
}

/// A participant document. Owned and mutated by the coordinator; the
/// contributor only ever reads it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub status: ParticipantStatus,
    /// Index of the circuit currently being contributed to, 1-based.
    /// Zero means the participant has not started yet.
    #[serde(default)]
    pub contribution_progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contribution_step: Option<ContributionStep>,
    #[serde(default)]
    pub contributions: Vec<ContributionReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_contribution_data: Option<TempContributionData>,
}

impl Participant {
    /// Encodes self as a JSON message to a vector of bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a JSON message from a slice of bytes into Self
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Verifier-written record kept under a circuit's contributions collection.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub participant_id: String,
    /// Completed-contribution count at submission time, zero-padded to
    /// width five.
    pub zkey_index: String,
    pub hash: String,
    #[serde(default)]
    pub time_ms: u64,
    pub valid: bool,
}

/// Cool-down record created by the coordinator when a participant times
/// out mid-contribution.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutRecord {
    /// Absolute wall-clock end of the cool-down, in milliseconds.
    pub end_date: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_participant_document() {
        let raw = r#"{
            "status": "CONTRIBUTING",
            "contributionProgress": 2,
            "contributionStep": "UPLOADING",
            "contributions": [{"doc": "abc123", "hash": "0xdead", "computationTime": 91200}],
            "tempContributionData": {
                "uploadId": "upl-1",
                "chunks": [{"ETag": "\"a\"", "PartNumber": 1}, {"ETag": "\"b\"", "PartNumber": 2}]
            }
        }"#;
        let participant = Participant::decode(raw.as_bytes()).unwrap();
        assert_eq!(participant.status, ParticipantStatus::Contributing);
        assert_eq!(participant.contribution_progress, 2);
        assert_eq!(participant.contribution_step, Some(ContributionStep::Uploading));
        assert_eq!(participant.contributions.len(), 1);
        let temp = participant.temp_contribution_data.unwrap();
        assert_eq!(temp.upload_id, "upl-1");
        assert_eq!(temp.chunks[1].part_number, 2);
        assert_eq!(temp.chunks[1].etag, "\"b\"");
    }

    #[test]
    fn decode_participant_with_missing_optionals() {
        let raw = r#"{"status": "WAITING"}"#;
        let participant = Participant::decode(raw.as_bytes()).unwrap();
        assert_eq!(participant.status, ParticipantStatus::Waiting);
        assert_eq!(participant.contribution_progress, 0);
        assert!(participant.contribution_step.is_none());
        assert!(participant.contributions.is_empty());
        assert!(participant.temp_contribution_data.is_none());
    }

    #[test]
    fn participant_encode_round_trip() {
        let participant = Participant {
            status: ParticipantStatus::Done,
            contribution_progress: 3,
            contribution_step: Some(ContributionStep::Completed),
            contributions: vec![ContributionReference::default(); 3],
            temp_contribution_data: None,
        };
        let decoded = Participant::decode(&participant.encode().unwrap()).unwrap();
        assert_eq!(participant, decoded);
    }

    #[test]
    fn decode_circuit_document() {
        let raw = r#"{
            "id": "c1",
            "sequencePosition": 1,
            "prefix": "multiplier2",
            "avgTimings": {"fullContribution": 10000, "verifyCloudFunction": 2000},
            "waitingQueue": {
                "currentContributor": "p1",
                "contributors": ["p1", "p2"],
                "completedContributions": 4
            }
        }"#;
        let circuit: Circuit = serde_json::from_str(raw).unwrap();
        assert_eq!(circuit.sequence_position, 1);
        assert_eq!(circuit.avg_timings.full_contribution, 10_000);
        assert_eq!(circuit.waiting_queue.contributors, vec!["p1", "p2"]);
        assert_eq!(circuit.waiting_queue.completed_contributions, 4);
    }

    #[test]
    fn resumable_steps() {
        assert!(ContributionStep::Downloading.is_resumable());
        assert!(ContributionStep::Computing.is_resumable());
        assert!(ContributionStep::Uploading.is_resumable());
        assert!(!ContributionStep::Verifying.is_resumable());
        assert!(!ContributionStep::Completed.is_resumable());
    }

    #[test]
    fn statuses_use_uppercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&ParticipantStatus::Exhumed).unwrap(),
            "\"EXHUMED\""
        );
        assert_eq!(
            serde_json::from_str::<ParticipantStatus>("\"TIMEDOUT\"").unwrap(),
            ParticipantStatus::Timedout
        );
    }
}
