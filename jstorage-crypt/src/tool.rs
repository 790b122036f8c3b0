use std::path::Path;
use std::sync::RwLock;

use jstorage_core::{ErrorKind, Random, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use tracing::{info, warn};

use crate::verifier::{
    fingerprint, fresh_salt, hex_decode, hex_encode, read_verifier, write_verifier, PasswordSource,
    VerifierFile,
};

/// Fixed 4-byte prefix on every blob `CryptTool` produces. Lets the shard
/// reader tell an encrypted line from a plain JSON line at a glance
/// (spec.md §4.9, `"JS2\0"`).
pub const MAGIC: &[u8; 4] = b"JS2\0";

enum CryptState {
    Uninitialized,
    Ready { key: [u8; 32] },
}

/// Password-bound AEAD codec for JStorage's persisted records.
///
/// Starts `Uninitialized`; every `encode`/`decode` call before
/// [`CryptTool::init_interactive`] succeeds returns
/// [`ErrorKind::CryptNotReady`].
pub struct CryptTool {
    state: RwLock<CryptState>,
}

impl Default for CryptTool {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptTool {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CryptState::Uninitialized),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read().expect("crypt state poisoned"), CryptState::Ready { .. })
    }

    /// Bring the tool to `Ready`, prompting for a password via `source`.
    ///
    /// If `config_dir` holds no verifier yet, the entered password sets one
    /// up: a random salt is drawn, a key derived, and the key's fingerprint
    /// written alongside the salt. If a verifier already exists, the
    /// entered password must derive the same fingerprint or this call
    /// fails with `CryptNotReady` and the tool stays uninitialized.
    pub async fn init_interactive(
        &self,
        config_dir: &Path,
        random: &dyn Random,
        source: &dyn PasswordSource,
    ) -> Result<()> {
        let password = source.prompt().await;
        let existing = read_verifier(config_dir).await?;

        let key = match existing {
            None => {
                let salt = fresh_salt(random);
                let key = derive_key(&password, &salt)?;
                let record = VerifierFile {
                    salt_hex: hex_encode(&salt),
                    verifier_hex: fingerprint(&key),
                };
                write_verifier(config_dir, &record).await?;
                info!("crypt tool initialised with a new password verifier");
                key
            }
            Some(record) => {
                let salt = hex_decode(&record.salt_hex)?;
                let key = derive_key(&password, &salt)?;
                if fingerprint(&key) != record.verifier_hex {
                    warn!("crypt tool password verification failed");
                    return Err(ErrorKind::CryptNotReady {
                        what: "entered password does not match the stored verifier".into(),
                    });
                }
                key
            }
        };

        *self.state.write().expect("crypt state poisoned") = CryptState::Ready { key };
        Ok(())
    }

    /// Encode `plaintext` into `MAGIC || nonce(12) || ciphertext || tag`.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.ready_key()?;
        let unbound = UnboundKey::new(&AES_256_GCM, &key).map_err(|_| ErrorKind::CryptFailed {
            what: "invalid AEAD key length".into(),
        })?;
        let sealing = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&{
            // A fresh random nonce per call; encode() never reuses one
            // because CryptTool holds no persistent counter state.
            let r = ring::rand::SystemRandom::new();
            let mut buf = [0u8; NONCE_LEN];
            <ring::rand::SystemRandom as ring::rand::SecureRandom>::fill(&r, &mut buf).map_err(
                |_| ErrorKind::CryptFailed {
                    what: "failed to draw AEAD nonce".into(),
                },
            )?;
            buf
        });
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| ErrorKind::CryptFailed {
                what: "AEAD seal failed".into(),
            })?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + in_out.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decode a blob previously produced by [`CryptTool::encode`]. Returns
    /// `CryptFailed` if `data` doesn't start with [`MAGIC`] or if the AEAD
    /// tag doesn't verify (wrong key, or corrupted data).
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.ready_key()?;

        if data.len() < MAGIC.len() + NONCE_LEN || &data[..MAGIC.len()] != MAGIC {
            return Err(ErrorKind::CryptFailed {
                what: "input is missing the JS2 magic prefix".into(),
            });
        }

        let nonce_start = MAGIC.len();
        let body_start = nonce_start + NONCE_LEN;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&data[nonce_start..body_start]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let unbound = UnboundKey::new(&AES_256_GCM, &key).map_err(|_| ErrorKind::CryptFailed {
            what: "invalid AEAD key length".into(),
        })?;
        let opening = LessSafeKey::new(unbound);

        let mut in_out = data[body_start..].to_vec();
        let plaintext = opening
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| ErrorKind::CryptFailed {
                what: "AEAD open failed".into(),
            })?;
        Ok(plaintext.to_vec())
    }

    /// Returns true for bytes that `decode` would accept as ciphertext,
    /// without attempting to decrypt them. Used by the shard reader to
    /// decide, line by line, whether to route through `decode` at all.
    pub fn looks_encrypted(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() + NONCE_LEN && &data[..MAGIC.len()] == MAGIC
    }

    fn ready_key(&self) -> Result<[u8; 32]> {
        match *self.state.read().expect("crypt state poisoned") {
            CryptState::Ready { key } => Ok(key),
            CryptState::Uninitialized => Err(ErrorKind::CryptNotReady {
                what: "crypt tool has not been initialised with a password".into(),
            }),
        }
    }
}

/// Derive a 32-byte AEAD key from `password` and `salt` using a
/// memory-hard KDF (dryoc's `pwhash`, the same Argon2id-family primitive
/// libsodium exposes), so that brute-forcing the stored verifier costs an
/// attacker real wall-clock time per guess.
fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    use dryoc::pwhash::{Config, PwHash, Salt};

    let salt: Salt = salt.to_vec().into();
    let hash: PwHash<Vec<u8>, Vec<u8>> =
        PwHash::hash_with_salt(password.as_bytes(), salt, Config::sensitive()).map_err(|e| {
            ErrorKind::CryptFailed {
                what: format!("key derivation failed: {e}"),
            }
        })?;

    let mut key = [0u8; 32];
    let derived = hash.into_parts().0;
    let n = derived.len().min(32);
    key[..n].copy_from_slice(&derived[..n]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::FixedPassword;
    use jstorage_core::ports::SecureRandom;

    fn tool_with_password(password: &str) -> (CryptTool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let tool = CryptTool::new();
        let random = SecureRandom::default();
        let source = FixedPassword(password.to_string());
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(tool.init_interactive(dir.path(), &random, &source))
            .unwrap();
        (tool, dir)
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let (tool, _dir) = tool_with_password("correct horse battery staple");
        let plaintext = b"{\"hello\":\"world\"}".to_vec();
        let encoded = tool.encode(&plaintext).unwrap();
        assert!(CryptTool::looks_encrypted(&encoded));
        let decoded = tool.decode(&encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn encode_before_init_is_not_ready() {
        let tool = CryptTool::new();
        assert!(!tool.is_ready());
        let err = tool.encode(b"x").unwrap_err();
        assert!(matches!(err, ErrorKind::CryptNotReady { .. }));
    }

    #[tokio::test]
    async fn reload_with_wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let random = SecureRandom::default();

        let first = CryptTool::new();
        first
            .init_interactive(dir.path(), &random, &FixedPassword("right-password".into()))
            .await
            .unwrap();
        assert!(first.is_ready());

        let second = CryptTool::new();
        let err = second
            .init_interactive(dir.path(), &random, &FixedPassword("wrong-password".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorKind::CryptNotReady { .. }));
        assert!(!second.is_ready());
    }

    #[tokio::test]
    async fn reload_with_right_password_decodes_prior_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let random = SecureRandom::default();

        let first = CryptTool::new();
        first
            .init_interactive(dir.path(), &random, &FixedPassword("shared-secret".into()))
            .await
            .unwrap();
        let encoded = first.encode(b"persisted record").unwrap();

        let second = CryptTool::new();
        second
            .init_interactive(dir.path(), &random, &FixedPassword("shared-secret".into()))
            .await
            .unwrap();
        let decoded = second.decode(&encoded).unwrap();
        assert_eq!(decoded, b"persisted record");
    }

    #[test]
    fn non_magic_input_is_not_decoded() {
        let (tool, _dir) = tool_with_password("p");
        let err = tool.decode(b"plain json, not encrypted at all").unwrap_err();
        assert!(matches!(err, ErrorKind::CryptFailed { .. }));
    }

    proptest::proptest! {
        /// spec.md §8: "CryptTool.decode(CryptTool.encode(x)) == x for all
        /// byte sequences x".
        #[test]
        fn encode_decode_round_trips_for_arbitrary_bytes(plaintext in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096)) {
            let (tool, _dir) = tool_with_password("property-test-password");
            let encoded = tool.encode(&plaintext).unwrap();
            let decoded = tool.decode(&encoded).unwrap();
            proptest::prop_assert_eq!(decoded, plaintext);
        }
    }
}
