//! Ephemeral SSH key material.
//!
//! One key pair is generated on first use and shared by provisioning (which
//! publishes the public half in instance metadata) and the SSH transport.
//! The private key lives in a private temporary directory and is removed by
//! [`SshKeyStore::release`].

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct SshKey {
    pub user: String,
    pub private_key: PathBuf,
    pub public_key: String,
    dir: TempDir,
}

impl SshKey {
    /// Entry for the `ssh-keys` instance metadata key.
    pub fn metadata_entry(&self) -> String {
        format!("{}:{}", self.user, self.public_key)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    fn wipe(&self) {
        for path in [self.private_key.clone(), self.private_key.with_extension("pub")] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed key file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove key file"),
            }
        }
    }
}

pub struct SshKeyStore {
    user: String,
    slot: Mutex<Option<Arc<SshKey>>>,
    init: tokio::sync::Mutex<()>,
}

impl SshKeyStore {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            slot: Mutex::new(None),
            init: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<SshKey>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    /// Return the key pair, generating it on first call.
    pub async fn get(&self) -> Result<Arc<SshKey>> {
        if let Some(key) = self.current() {
            return Ok(key);
        }

        let _guard = self.init.lock().await;
        if let Some(key) = self.current() {
            return Ok(key);
        }

        let key = Arc::new(generate(&self.user).await?);
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("SSH key store lock poisoned"))?;
        *slot = Some(key.clone());
        info!(user = %self.user, "Generated ephemeral SSH key");
        Ok(key)
    }

    pub fn is_generated(&self) -> bool {
        self.current().is_some()
    }

    /// Delete the key pair. Returns whether a key existed.
    pub fn release(&self) -> bool {
        let taken = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match taken {
            Some(key) => {
                key.wipe();
                info!(dir = %key.dir().display(), "Released ephemeral SSH key");
                true
            }
            None => {
                debug!("No SSH key was generated; nothing to release");
                false
            }
        }
    }
}

async fn generate(user: &str) -> Result<SshKey> {
    let dir = tempfile::Builder::new()
        .prefix("soakctl-key-")
        .tempdir()
        .context("Failed to create key directory")?;
    let private_key = dir.path().join("id_ed25519");

    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", user, "-f"])
        .arg(&private_key)
        .output()
        .await
        .context("Failed to run ssh-keygen")?;
    if !output.status.success() {
        bail!(
            "ssh-keygen failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let public_key = tokio::fs::read_to_string(private_key.with_extension("pub"))
        .await
        .context("Failed to read generated public key")?
        .trim()
        .to_string();

    Ok(SshKey {
        user: user.to_string(),
        private_key,
        public_key,
        dir,
    })
}
