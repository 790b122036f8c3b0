//! Password verifier persisted alongside the encrypted data it guards.
//!
//! On first setup there is no verifier file: whatever password the operator
//! enters becomes the password, a random salt is drawn, and the derived
//! key's fingerprint is written out as the verifier. On every later startup
//! the same salt is read back, the entered password is put through the same
//! derivation, and the resulting fingerprint must match what's on disk,
//! otherwise the tool refuses to come up (`ErrorKind::CryptNotReady`).

use std::path::Path;

use async_trait::async_trait;
use jstorage_core::ErrorKind;
use serde::{Deserialize, Serialize};

const VERIFIER_FILE: &str = "js2crypt";
const SALT_LEN: usize = 16;

/// Supplies a password on demand, e.g. by reading a TTY, an environment
/// variable, or a secret store. Kept as a trait so tests can hand in a
/// canned password instead of prompting anyone.
#[async_trait]
pub trait PasswordSource: Send + Sync {
    async fn prompt(&self) -> String;
}

/// A `PasswordSource` that always returns the same fixed password, for
/// tests and non-interactive deployments that inject the password via
/// environment instead of a terminal prompt.
pub struct FixedPassword(pub String);

#[async_trait]
impl PasswordSource for FixedPassword {
    async fn prompt(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VerifierFile {
    pub salt_hex: String,
    pub verifier_hex: String,
}

pub(crate) fn verifier_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join(VERIFIER_FILE)
}

pub(crate) async fn read_verifier(config_dir: &Path) -> jstorage_core::Result<Option<VerifierFile>> {
    let path = verifier_path(config_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => {
            let parsed: VerifierFile = serde_json::from_str(&raw)?;
            Ok(Some(parsed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn write_verifier(
    config_dir: &Path,
    verifier: &VerifierFile,
) -> jstorage_core::Result<()> {
    tokio::fs::create_dir_all(config_dir).await?;
    let raw = serde_json::to_string_pretty(verifier)
        .map_err(|e| ErrorKind::CryptFailed { what: e.to_string() })?;
    tokio::fs::write(verifier_path(config_dir), raw).await?;
    Ok(())
}

pub(crate) fn fresh_salt(random: &dyn jstorage_core::Random) -> Vec<u8> {
    random.bytes(SALT_LEN)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub(crate) fn hex_decode(s: &str) -> jstorage_core::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(ErrorKind::CryptFailed {
            what: "odd-length hex string".into(),
        });
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| ErrorKind::CryptFailed {
                what: e.to_string(),
            })
        })
        .collect()
}

/// Fingerprint of a derived key, stored as the verifier. Truncated to 16
/// bytes, plenty to detect a wrong password but nowhere near enough to help
/// anyone recover the key from it.
pub(crate) fn fingerprint(key: &[u8; 32]) -> String {
    let hash = blake3::hash(key);
    hex_encode(&hash.as_bytes()[..16])
}
