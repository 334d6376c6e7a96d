use crate::errors::ContributeError;
use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// On-disk key-value entries persisted between login and logout.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct StoredKeys {
    token: String,
    username: String,
}

/// Local storage for the OAuth token and display name.
pub struct Keystore {
    path: PathBuf,
}

impl Keystore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn save(&self, token: &SecretString, username: &str) -> Result<()> {
        let keys = StoredKeys {
            token: token.expose_secret().clone(),
            username: username.to_string(),
        };
        crate::utils::write_to_file(&self.path, &serde_json::to_vec_pretty(&keys)?)
    }

    pub fn token(&self) -> Result<SecretString> {
        let keys = self.load()?;
        Ok(SecretString::new(keys.token))
    }

    pub fn username(&self) -> Result<String> {
        Ok(self.load()?.username)
    }

    /// Removes the stored entries. Logging out twice is not an error.
    pub fn clear(&self) -> Result<()> {
        crate::utils::remove_file_if_exists(&self.path)
    }

    fn load(&self) -> Result<StoredKeys> {
        if !self.path.exists() {
            return Err(ContributeError::MissingTokenError.into());
        }
        let contents = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("phase2-keystore-{}-{}", std::process::id(), name))
    }

    #[test]
    fn save_load_clear_round_trip() {
        let keystore = Keystore::new(scratch_path("round-trip"));
        keystore
            .save(&SecretString::new("gho_secret".to_string()), "octocat")
            .unwrap();
        assert_eq!(keystore.token().unwrap().expose_secret(), "gho_secret");
        assert_eq!(keystore.username().unwrap(), "octocat");

        keystore.clear().unwrap();
        assert!(keystore.token().is_err());
        // A second logout is a no-op.
        keystore.clear().unwrap();
    }

    #[test]
    fn missing_keystore_reports_missing_token() {
        let keystore = Keystore::new(scratch_path("missing"));
        let error = keystore.token().unwrap_err();
        assert!(error.to_string().contains("login"));
    }
}
