//! Identity-provider reputation gate checked before a session starts.

use crate::settings::ReputationThresholds;
use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

const GITHUB_API_URL: &str = "https://api.github.com";
const CLIENT_USER_AGENT: &str = "phase2-contributor";

/// Subset of the provider's user record the gate relies on.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderUser {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub public_repos: u64,
    #[serde(default)]
    pub followers: u64,
    #[serde(default)]
    pub following: u64,
}

/// Resolves the user behind an OAuth token.
pub async fn fetch_authenticated_user(token: &SecretString) -> Result<ProviderUser> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/user", GITHUB_API_URL))
        .header(AUTHORIZATION, format!("token {}", token.expose_secret()))
        .header(USER_AGENT, CLIENT_USER_AGENT)
        .send()
        .await?
        .error_for_status()?;
    response
        .json()
        .await
        .context("Unexpected response to the authenticated user lookup")
}

/// Returns `true` when the user clears every configured threshold.
pub fn check_github_reputation(user: &ProviderUser, thresholds: &ReputationThresholds) -> bool {
    user.public_repos >= thresholds.repos
        && user.followers >= thresholds.followers
        && user.following >= thresholds.following
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(public_repos: u64, followers: u64, following: u64) -> ProviderUser {
        ProviderUser {
            id: 42,
            login: "octocat".to_string(),
            public_repos,
            followers,
            following,
        }
    }

    const THRESHOLDS: ReputationThresholds = ReputationThresholds {
        repos: 1,
        followers: 5,
        following: 5,
    };

    #[test]
    fn passes_at_and_above_thresholds() {
        assert!(check_github_reputation(&user(1, 5, 5), &THRESHOLDS));
        assert!(check_github_reputation(&user(10, 50, 50), &THRESHOLDS));
    }

    #[test]
    fn fails_when_any_threshold_is_missed() {
        assert!(!check_github_reputation(&user(0, 5, 5), &THRESHOLDS));
        assert!(!check_github_reputation(&user(1, 4, 5), &THRESHOLDS));
        assert!(!check_github_reputation(&user(1, 5, 4), &THRESHOLDS));
    }

    #[test]
    fn gate_failure_status_names_the_thresholds() {
        let message = crate::errors::ContributeError::ReputationTooLowError {
            repos: 1,
            followers: 5,
            following: 5,
        }
        .to_string();
        assert!(message.contains("1 public"));
        assert!(message.contains("5 followers"));
        assert!(message.contains("5 followed accounts"));
    }
}
