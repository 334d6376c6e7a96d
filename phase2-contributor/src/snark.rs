//! Seam around the zkey contribution primitive. The transform itself is
//! external; the client only feeds it entropy and files.

use crate::errors::ContributeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::info;

/// Applies one contribution to a zkey artifact.
#[async_trait]
pub trait ZkeyEngine: Send + Sync {
    /// Reads `last_zkey`, applies `entropy`, writes `next_zkey`.
    async fn contribute(
        &self,
        last_zkey: &Path,
        next_zkey: &Path,
        contributor_id: &str,
        entropy: &str,
    ) -> Result<()>;
}

/// Shells out to a snarkjs-compatible tool for the actual transform.
pub struct SnarkjsEngine {
    command: String,
}

impl SnarkjsEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ZkeyEngine for SnarkjsEngine {
    async fn contribute(
        &self,
        last_zkey: &Path,
        next_zkey: &Path,
        contributor_id: &str,
        entropy: &str,
    ) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("zkey")
            .arg("contribute")
            .arg(last_zkey)
            .arg(next_zkey)
            .arg(format!("--name={}", contributor_id))
            .arg(format!("--entropy={}", entropy))
            .output()
            .await
            .with_context(|| format!("Failed to launch the zkey tool {:?}", self.command))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ContributeError::ComputeError(stderr).into());
        }
        info!("zkey contribution written to {}", next_zkey.display());
        Ok(())
    }
}
