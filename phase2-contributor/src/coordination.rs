//! Adapter over the coordination store: document reads, per-document
//! change feeds and the server-side callables.

use crate::{errors::ContributeError, settings::Terms};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use phase2_shared::structures::{
    Ceremony, Circuit, Contribution, EtagWithPartNumber, TimeoutRecord,
};
use reqwest::{header::AUTHORIZATION, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;
use url::Url;

const DELAY_POLL_DOCUMENT_SECS: i64 = 3;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// A point-in-time copy of one coordination store document. An absent
/// `data` payload is a soft error the caller interprets.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Option<Value>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| ContributeError::MissingDocumentDataError(collection.to_string(), self.id.clone()))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Change feed for one document, delivered in commit order with
/// at-least-once semantics. Dropping the subscription unsubscribes.
pub struct Subscription {
    receiver: mpsc::Receiver<DocumentSnapshot>,
    poller: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<DocumentSnapshot>, poller: Option<JoinHandle<()>>) -> Self {
        Self { receiver, poller }
    }

    /// Waits for the next snapshot. `None` means the feed closed.
    pub async fn next(&mut self) -> Option<DocumentSnapshot> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Everything the contributor needs from the coordination store. The
/// server-side callables are idempotent by contract, so redelivered
/// snapshots may safely re-issue them.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn get_ceremony(&self, ceremony_id: &str) -> Result<Ceremony>;
    async fn get_participant(&self, ceremony_id: &str, participant_id: &str) -> Result<DocumentSnapshot>;
    async fn get_circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>>;
    async fn get_timeouts(&self, ceremony_id: &str, participant_id: &str) -> Result<Vec<TimeoutRecord>>;
    async fn get_contribution_by_participant(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
        participant_id: &str,
    ) -> Result<Option<Contribution>>;

    async fn subscribe_participant(&self, ceremony_id: &str, participant_id: &str) -> Result<Subscription>;
    async fn subscribe_circuit(&self, ceremony_id: &str, circuit_id: &str) -> Result<Subscription>;

    async fn check_participant_for_ceremony(&self, ceremony_id: &str) -> Result<bool>;
    async fn progress_to_next_circuit_for_contribution(&self, ceremony_id: &str) -> Result<()>;
    async fn progress_to_next_contribution_step(&self, ceremony_id: &str) -> Result<()>;
    async fn permanently_store_current_contribution_time_and_hash(
        &self,
        ceremony_id: &str,
        time_ms: u64,
        hash: &str,
    ) -> Result<()>;
    async fn verify_contribution(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
        bucket: &str,
        contributor_id: &str,
        verify_url: &str,
    ) -> Result<()>;
    async fn resume_contribution_after_timeout_expiration(&self, ceremony_id: &str) -> Result<()>;

    async fn open_multipart_upload(&self, ceremony_id: &str, bucket: &str, key: &str) -> Result<String>;
    async fn generate_pre_signed_urls_parts(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: usize,
    ) -> Result<Vec<String>>;
    async fn temporarily_store_uploaded_chunk(&self, ceremony_id: &str, chunk: EtagWithPartNumber) -> Result<()>;
    async fn complete_multipart_upload(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[EtagWithPartNumber],
    ) -> Result<()>;
    async fn generate_get_object_pre_signed_url(&self, bucket: &str, key: &str) -> Result<String>;
}

/// REST implementation talking to the ceremony coordinator API.
#[derive(Clone)]
pub struct HttpCoordinator {
    base_url: Url,
    client: reqwest::Client,
    token: SecretString,
    terms: Terms,
}

impl HttpCoordinator {
    pub fn new(base_url: Url, token: SecretString, terms: Terms) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            token,
            terms,
        }
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    /// Invokes a named server callable; empty responses decode to null.
    async fn call(&self, name: &str, body: Value) -> Result<Value> {
        let url = self.base_url.join(&format!("/v1/callables/{}", name))?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.authorization())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_slice(&bytes)?)
        }
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<DocumentSnapshot> {
        let url = self.base_url.join(&format!("/v1/documents/{}/{}", collection, id))?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DocumentSnapshot {
                id: id.to_string(),
                data: None,
            });
        }
        let value: Value = response.error_for_status()?.json().await?;
        let data = if value.is_null() { None } else { Some(value) };
        Ok(DocumentSnapshot {
            id: id.to_string(),
            data,
        })
    }

    async fn get_collection(&self, collection: &str) -> Result<Vec<Value>> {
        let url = self.base_url.join(&format!("/v1/collections/{}", collection))?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Polls one document and forwards each changed state, in commit
    /// order. The first observed state is always delivered, so a
    /// reattached subscriber may see a snapshot equal to one it already
    /// processed.
    fn subscribe(&self, collection: String, id: String) -> Result<Subscription> {
        let poll_interval = Duration::seconds(DELAY_POLL_DOCUMENT_SECS).to_std()?;
        let (sender, receiver) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let coordinator = self.clone();
        let poller = tokio::spawn(async move {
            let mut last_delivered: Option<Option<Value>> = None;
            loop {
                match coordinator.get_document(&collection, &id).await {
                    Ok(snapshot) => {
                        if last_delivered.as_ref() != Some(&snapshot.data) {
                            let data = snapshot.data.clone();
                            if sender.send(snapshot).await.is_err() {
                                return;
                            }
                            last_delivered = Some(data);
                        }
                    }
                    Err(error) => {
                        warn!("Snapshot poll failed for {}/{}: {}", collection, id, error);
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        Ok(Subscription::new(receiver, Some(poller)))
    }
}

#[async_trait]
impl CoordinationClient for HttpCoordinator {
    async fn get_ceremony(&self, ceremony_id: &str) -> Result<Ceremony> {
        let snapshot = self.get_document(&self.terms.ceremonies, ceremony_id).await?;
        snapshot.decode(&self.terms.ceremonies)
    }

    async fn get_participant(&self, ceremony_id: &str, participant_id: &str) -> Result<DocumentSnapshot> {
        self.get_document(&self.terms.participants_collection(ceremony_id), participant_id)
            .await
    }

    async fn get_circuits(&self, ceremony_id: &str) -> Result<Vec<Circuit>> {
        let documents = self
            .get_collection(&self.terms.circuits_collection(ceremony_id))
            .await?;
        let mut circuits = documents
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Circuit>, _>>()?;
        circuits.sort_by_key(|circuit| circuit.sequence_position);
        Ok(circuits)
    }

    async fn get_timeouts(&self, ceremony_id: &str, participant_id: &str) -> Result<Vec<TimeoutRecord>> {
        let documents = self
            .get_collection(&self.terms.timeouts_collection(ceremony_id, participant_id))
            .await?;
        Ok(documents
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<TimeoutRecord>, _>>()?)
    }

    async fn get_contribution_by_participant(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
        participant_id: &str,
    ) -> Result<Option<Contribution>> {
        let documents = self
            .get_collection(&self.terms.contributions_collection(ceremony_id, circuit_id))
            .await?;
        let contributions = documents
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Contribution>, _>>()?;
        Ok(contributions
            .into_iter()
            .find(|contribution| contribution.participant_id == participant_id))
    }

    async fn subscribe_participant(&self, ceremony_id: &str, participant_id: &str) -> Result<Subscription> {
        self.subscribe(
            self.terms.participants_collection(ceremony_id),
            participant_id.to_string(),
        )
    }

    async fn subscribe_circuit(&self, ceremony_id: &str, circuit_id: &str) -> Result<Subscription> {
        self.subscribe(self.terms.circuits_collection(ceremony_id), circuit_id.to_string())
    }

    async fn check_participant_for_ceremony(&self, ceremony_id: &str) -> Result<bool> {
        let response = self
            .call("check-participant-for-ceremony", json!({ "ceremonyId": ceremony_id }))
            .await?;
        Ok(response.as_bool().unwrap_or(false))
    }

    async fn progress_to_next_circuit_for_contribution(&self, ceremony_id: &str) -> Result<()> {
        self.call(
            "progress-to-next-circuit-for-contribution",
            json!({ "ceremonyId": ceremony_id }),
        )
        .await?;
        Ok(())
    }

    async fn progress_to_next_contribution_step(&self, ceremony_id: &str) -> Result<()> {
        self.call(
            "progress-to-next-contribution-step",
            json!({ "ceremonyId": ceremony_id }),
        )
        .await?;
        Ok(())
    }

    async fn permanently_store_current_contribution_time_and_hash(
        &self,
        ceremony_id: &str,
        time_ms: u64,
        hash: &str,
    ) -> Result<()> {
        self.call(
            "permanently-store-current-contribution-time-and-hash",
            json!({
                "ceremonyId": ceremony_id,
                "contributionComputationTime": time_ms,
                "contributionHash": hash,
            }),
        )
        .await?;
        Ok(())
    }

    async fn verify_contribution(
        &self,
        ceremony_id: &str,
        circuit_id: &str,
        bucket: &str,
        contributor_id: &str,
        verify_url: &str,
    ) -> Result<()> {
        self.call(
            "verify-contribution",
            json!({
                "ceremonyId": ceremony_id,
                "circuitId": circuit_id,
                "bucketName": bucket,
                "contributorId": contributor_id,
                "verifyContributionUrl": verify_url,
            }),
        )
        .await?;
        Ok(())
    }

    async fn resume_contribution_after_timeout_expiration(&self, ceremony_id: &str) -> Result<()> {
        self.call(
            "resume-contribution-after-timeout-expiration",
            json!({ "ceremonyId": ceremony_id }),
        )
        .await?;
        Ok(())
    }

    async fn open_multipart_upload(&self, ceremony_id: &str, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .call(
                "open-multipart-upload",
                json!({ "ceremonyId": ceremony_id, "bucketName": bucket, "objectKey": key }),
            )
            .await?;
        response
            .get("uploadId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("open-multipart-upload returned no uploadId"))
    }

    async fn generate_pre_signed_urls_parts(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: usize,
    ) -> Result<Vec<String>> {
        let response = self
            .call(
                "generate-pre-signed-urls-parts",
                json!({
                    "ceremonyId": ceremony_id,
                    "bucketName": bucket,
                    "objectKey": key,
                    "uploadId": upload_id,
                    "numberOfParts": parts,
                }),
            )
            .await?;
        let urls = response
            .get("urls")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("generate-pre-signed-urls-parts returned no urls"))?;
        Ok(serde_json::from_value(urls)?)
    }

    async fn temporarily_store_uploaded_chunk(&self, ceremony_id: &str, chunk: EtagWithPartNumber) -> Result<()> {
        self.call(
            "temporarily-store-uploaded-chunk",
            json!({ "ceremonyId": ceremony_id, "chunk": chunk }),
        )
        .await?;
        Ok(())
    }

    async fn complete_multipart_upload(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[EtagWithPartNumber],
    ) -> Result<()> {
        self.call(
            "complete-multipart-upload",
            json!({
                "ceremonyId": ceremony_id,
                "bucketName": bucket,
                "objectKey": key,
                "uploadId": upload_id,
                "parts": parts,
            }),
        )
        .await?;
        Ok(())
    }

    async fn generate_get_object_pre_signed_url(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .call(
                "generate-get-object-pre-signed-url",
                json!({ "bucketName": bucket, "objectKey": key }),
            )
            .await?;
        response
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("generate-get-object-pre-signed-url returned no url"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phase2_shared::structures::Participant;

    #[test]
    fn empty_snapshot_is_a_soft_error() {
        let snapshot = DocumentSnapshot {
            id: "p-1".to_string(),
            data: None,
        };
        assert!(!snapshot.exists());
        let error = snapshot.decode::<Participant>("participants").unwrap_err();
        assert!(error.to_string().contains("has no data"));
    }

    #[test]
    fn snapshot_decodes_into_wire_structures() {
        let snapshot = DocumentSnapshot {
            id: "p-1".to_string(),
            data: Some(serde_json::json!({ "status": "WAITING" })),
        };
        let participant: Participant = snapshot.decode("participants").unwrap();
        assert_eq!(participant.contribution_progress, 0);
    }
}
