//! The OpenPGP seam.
//!
//! The daemon never implements the encryption primitive itself; it
//! consumes `encrypt_to_keys(plaintext, audience) -> ciphertext` through
//! the [`Encrypt`] trait.  The production implementation drives gpg(1)
//! with the key fingerprints from the configuration; setups without keys
//! fall back to a pass-through that is only acceptable for testing.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context};
use tracing::warn;

/// Which keys a ciphertext must be readable by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Audience {
    pub database: bool,
    pub backoffice: bool,
}

impl Audience {
    pub const DATABASE: Audience = Audience { database: true, backoffice: false };
    pub const BOTH: Audience = Audience { database: true, backoffice: true };
}

pub trait Encrypt: Send + Sync {
    fn encrypt_to_keys(&self, plaintext: &str, audience: Audience) -> anyhow::Result<String>;
}

/// Encrypt by piping through gpg(1).
pub struct GpgEncryptor {
    database_fpr: String,
    backoffice_fpr: Option<String>,
}

impl GpgEncryptor {
    pub fn new(database_fpr: String, backoffice_fpr: Option<String>) -> Self {
        Self { database_fpr, backoffice_fpr }
    }
}

impl Encrypt for GpgEncryptor {
    fn encrypt_to_keys(&self, plaintext: &str, audience: Audience) -> anyhow::Result<String> {
        let mut cmd = Command::new("gpg");
        cmd.args(["--batch", "--yes", "--armor", "--trust-model", "always", "--encrypt"]);
        if audience.database {
            cmd.args(["-r", &self.database_fpr]);
        }
        if audience.backoffice {
            let fpr = self
                .backoffice_fpr
                .as_deref()
                .context("no backoffice key configured")?;
            cmd.args(["-r", fpr]);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to run gpg")?;
        child
            .stdin
            .take()
            .context("gpg stdin unavailable")?
            .write_all(plaintext.as_bytes())
            .context("error feeding gpg")?;
        let output = child.wait_with_output().context("error reading gpg output")?;
        if !output.status.success() {
            bail!("gpg failed with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Pass-through used when no keys are configured.  Logs a warning once at
/// construction; data ends up unencrypted in the database.
pub struct PlainEncryptor;

impl PlainEncryptor {
    pub fn new() -> Self {
        warn!("no database key configured - account data will not be encrypted");
        Self
    }
}

impl Default for PlainEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encrypt for PlainEncryptor {
    fn encrypt_to_keys(&self, plaintext: &str, _audience: Audience) -> anyhow::Result<String> {
        Ok(plaintext.to_string())
    }
}
