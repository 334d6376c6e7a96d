use anyhow::{Context, Result};
use std::env;

const DEFAULT_GITHUB_REPOS: u64 = 1;
const DEFAULT_GITHUB_FOLLOWERS: u64 = 5;
const DEFAULT_GITHUB_FOLLOWING: u64 = 5;
const DEFAULT_BUCKET_POSTFIX: &str = "-ph2-ceremony";

/// Minimum GitHub account standing required before a session starts.
#[derive(Clone, Copy, Debug)]
pub struct ReputationThresholds {
    pub repos: u64,
    pub followers: u64,
    pub following: u64,
}

/// Logical collection names mapped to coordination store path segments.
#[derive(Clone, Debug)]
pub struct Terms {
    pub ceremonies: String,
    pub circuits: String,
    pub participants: String,
    pub contributions: String,
    pub timeouts: String,
}

impl Default for Terms {
    fn default() -> Self {
        Self {
            ceremonies: "ceremonies".to_string(),
            circuits: "circuits".to_string(),
            participants: "participants".to_string(),
            contributions: "contributions".to_string(),
            timeouts: "timeouts".to_string(),
        }
    }
}

impl Terms {
    pub fn circuits_collection(&self, ceremony_id: &str) -> String {
        format!("{}/{}/{}", self.ceremonies, ceremony_id, self.circuits)
    }

    pub fn participants_collection(&self, ceremony_id: &str) -> String {
        format!("{}/{}/{}", self.ceremonies, ceremony_id, self.participants)
    }

    pub fn timeouts_collection(&self, ceremony_id: &str, participant_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.participants_collection(ceremony_id),
            participant_id,
            self.timeouts
        )
    }

    pub fn contributions_collection(&self, ceremony_id: &str, circuit_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.circuits_collection(ceremony_id),
            circuit_id,
            self.contributions
        )
    }
}

/// Runtime configuration assembled from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub reputation: ReputationThresholds,
    pub verify_contribution_url: String,
    pub bucket_postfix: String,
    pub terms: Terms,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            reputation: ReputationThresholds {
                repos: env_u64("GITHUB_REPOS", DEFAULT_GITHUB_REPOS)?,
                followers: env_u64("GITHUB_FOLLOWERS", DEFAULT_GITHUB_FOLLOWERS)?,
                following: env_u64("GITHUB_FOLLOWING", DEFAULT_GITHUB_FOLLOWING)?,
            },
            verify_contribution_url: env::var("VERIFY_CONTRIBUTION_URL").unwrap_or_default(),
            bucket_postfix: env::var("BUCKET_POSTFIX")
                .unwrap_or_else(|_| DEFAULT_BUCKET_POSTFIX.to_string()),
            terms: Terms::default(),
        })
    }
}

#[cfg(test)]
impl Default for Settings {
    fn default() -> Self {
        Self {
            reputation: ReputationThresholds {
                repos: DEFAULT_GITHUB_REPOS,
                followers: DEFAULT_GITHUB_FOLLOWERS,
                following: DEFAULT_GITHUB_FOLLOWING,
            },
            verify_contribution_url: "https://verifier.example/verify".to_string(),
            bucket_postfix: DEFAULT_BUCKET_POSTFIX.to_string(),
            terms: Terms::default(),
        }
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be an integer, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_build_nested_collection_paths() {
        let terms = Terms::default();
        assert_eq!(terms.circuits_collection("c-1"), "ceremonies/c-1/circuits");
        assert_eq!(
            terms.timeouts_collection("c-1", "p-9"),
            "ceremonies/c-1/participants/p-9/timeouts"
        );
        assert_eq!(
            terms.contributions_collection("c-1", "circ-2"),
            "ceremonies/c-1/circuits/circ-2/contributions"
        );
    }

    #[test]
    fn env_u64_rejects_garbage() {
        env::set_var("PHASE2_TEST_THRESHOLD", "not-a-number");
        assert!(env_u64("PHASE2_TEST_THRESHOLD", 3).is_err());
        env::set_var("PHASE2_TEST_THRESHOLD", "12");
        assert_eq!(env_u64("PHASE2_TEST_THRESHOLD", 3).unwrap(), 12);
        env::remove_var("PHASE2_TEST_THRESHOLD");
        assert_eq!(env_u64("PHASE2_TEST_THRESHOLD", 3).unwrap(), 3);
    }
}
