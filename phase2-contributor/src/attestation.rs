//! Attestation generation and publication once every circuit has been
//! contributed to.

use crate::{coordination::CoordinationClient, errors::ContributeError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use phase2_shared::structures::{Ceremony, Circuit};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::info;

const GITHUB_GISTS_URL: &str = "https://api.github.com/gists";
const TWEET_INTENT_URL: &str = "https://twitter.com/intent/tweet";
const CLIENT_USER_AGENT: &str = "phase2-contributor";

/// One line item of the attestation: a contribution to one circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationEntry {
    pub sequence_position: u64,
    pub circuit_prefix: String,
    pub zkey_index: String,
    pub hash: String,
}

/// Publishes an attestation text blob and returns a reference to it.
#[async_trait]
pub trait AttestationPublisher: Send + Sync {
    async fn publish(&self, ceremony_prefix: &str, ceremony_title: &str, content: &str) -> Result<String>;
}

/// Publishes the attestation as a public gist on the participant's
/// identity-provider account.
pub struct GithubGistPublisher {
    token: SecretString,
}

impl GithubGistPublisher {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AttestationPublisher for GithubGistPublisher {
    async fn publish(&self, ceremony_prefix: &str, ceremony_title: &str, content: &str) -> Result<String> {
        let client = reqwest::Client::new();
        let body = json!({
            "description": format!("Attestation for the {} trusted setup ceremony", ceremony_title),
            "public": true,
            "files": {
                format!("{}_attestation.txt", ceremony_prefix): { "content": content }
            }
        });
        let response = client
            .post(GITHUB_GISTS_URL)
            .header(AUTHORIZATION, format!("token {}", self.token.expose_secret()))
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let value: Value = response.json().await?;
        value
            .get("html_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Gist response did not contain an html_url"))
    }
}

/// Builds the human-readable attestation enumerating every contribution.
pub fn build_attestation(ceremony_title: &str, contributor_handle: &str, entries: &[AttestationEntry]) -> String {
    let mut text = format!(
        "Hey, I'm {} and I have contributed to the {} trusted setup ceremony.\n\
         The following are my contribution signatures:",
        contributor_handle, ceremony_title
    );
    for entry in entries {
        text.push_str(&format!(
            "\n\nCircuit # {} ({})\nContributor # {}\n{}",
            entry.sequence_position, entry.circuit_prefix, entry.zkey_index, entry.hash
        ));
    }
    text
}

/// Tweet-intent link referencing the published attestation.
pub fn share_url(ceremony_title: &str, attestation_ref: &str) -> String {
    let text = format!(
        "I contributed to the {} trusted setup ceremony! My attestation: {}",
        ceremony_title, attestation_ref
    );
    let encoded: String = url::form_urlencoded::byte_serialize(text.as_bytes()).collect();
    format!("{}?text={}", TWEET_INTENT_URL, encoded)
}

/// Collects the verified contribution of every circuit, publishes the
/// attestation and returns the shareable reference.
pub async fn handle_public_attestation(
    coordinator: &dyn CoordinationClient,
    publisher: &dyn AttestationPublisher,
    circuits: &[Circuit],
    ceremony: &Ceremony,
    participant_id: &str,
    contributor_handle: &str,
) -> Result<String> {
    let mut entries = Vec::with_capacity(circuits.len());
    for circuit in circuits {
        let contribution = coordinator
            .get_contribution_by_participant(&ceremony.id, &circuit.id, participant_id)
            .await?
            .ok_or(ContributeError::MissingContributionError(circuit.sequence_position))?;
        entries.push(AttestationEntry {
            sequence_position: circuit.sequence_position,
            circuit_prefix: circuit.prefix.clone(),
            zkey_index: contribution.zkey_index,
            hash: contribution.hash,
        });
    }
    let text = build_attestation(&ceremony.title, contributor_handle, &entries);
    let attestation_ref = publisher.publish(&ceremony.prefix, &ceremony.title, &text).await?;
    info!("Attestation published at {}", attestation_ref);
    Ok(share_url(&ceremony.title, &attestation_ref))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence_position: u64, zkey_index: &str) -> AttestationEntry {
        AttestationEntry {
            sequence_position,
            circuit_prefix: format!("circuit{}", sequence_position),
            zkey_index: zkey_index.to_string(),
            hash: format!("Contribution Hash: \n\t\thash{}", sequence_position),
        }
    }

    #[test]
    fn attestation_enumerates_every_circuit() {
        let text = build_attestation("Grand Ceremony", "octocat", &[entry(1, "00004"), entry(2, "00017")]);
        assert!(text.starts_with("Hey, I'm octocat"));
        assert!(text.contains("Circuit # 1 (circuit1)\nContributor # 00004"));
        assert!(text.contains("Circuit # 2 (circuit2)\nContributor # 00017"));
        assert!(text.contains("hash2"));
    }

    #[test]
    fn share_url_is_percent_encoded() {
        let url = share_url("Grand Ceremony", "https://gist.example/abc");
        assert!(url.starts_with("https://twitter.com/intent/tweet?text="));
        assert!(url.contains("Grand+Ceremony"));
        assert!(url.contains("https%3A%2F%2Fgist.example%2Fabc"));
        assert!(!url.contains("gist.example/abc"));
    }
}
