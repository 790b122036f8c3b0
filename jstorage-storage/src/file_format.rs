//! On-disk line format for shard files (spec.md §6): one JSON object per
//! line, each line either plain JSON or `base64(JS2\0 || nonce || ct || tag)`.
//!
//! Mixed-mode files are a first-class case during the lazy encryption
//! migration (spec.md §4.2, §8 scenario 6): a single file can have some
//! plaintext lines and some encrypted lines, and the reader must handle
//! both without being told in advance which is which.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use jstorage_core::{ErrorKind, Result};
use jstorage_crypt::CryptTool;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize `value` as one line. When `encrypted` is true the JSON bytes
/// are routed through `crypt.encode` and the resulting blob base64-encoded;
/// `crypt` must be ready or this fails with `CryptNotReady`.
pub fn write_line<T: Serialize>(value: &T, crypt: Option<&CryptTool>, encrypted: bool) -> Result<String> {
    let json_bytes = serde_json::to_vec(value)?;
    if !encrypted {
        return Ok(String::from_utf8(json_bytes).expect("serde_json output is valid utf8"));
    }
    let crypt = crypt.ok_or_else(|| ErrorKind::CryptNotReady {
        what: "no crypt tool configured for an encrypted database".into(),
    })?;
    let blob = crypt.encode(&json_bytes)?;
    Ok(STANDARD.encode(blob))
}

/// Parse one line back into `T`. Lines beginning with `{` are treated as
/// plain JSON verbatim; everything else is assumed base64-encoded
/// ciphertext and routed through `crypt.decode` (which itself validates the
/// JS2 magic prefix).
pub fn read_line<T: DeserializeOwned>(line: &str, crypt: Option<&CryptTool>) -> Result<T> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    let blob = STANDARD
        .decode(trimmed)
        .map_err(|e| ErrorKind::LoadFailed { what: format!("malformed shard line: {e}") })?;

    if !CryptTool::looks_encrypted(&blob) {
        return Err(ErrorKind::LoadFailed {
            what: "shard line is neither plain JSON nor JS2-encoded".into(),
        });
    }

    let crypt = crypt.ok_or_else(|| ErrorKind::CryptNotReady {
        what: "encountered an encrypted line with no crypt tool configured".into(),
    })?;
    let plaintext = crypt.decode(&blob)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::SecureRandom;
    use jstorage_crypt::FixedPassword;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i32,
        b: String,
    }

    async fn ready_crypt() -> (CryptTool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let crypt = CryptTool::new();
        let random = SecureRandom::default();
        crypt
            .init_interactive(dir.path(), &random, &FixedPassword("pw".into()))
            .await
            .unwrap();
        (crypt, dir)
    }

    #[test]
    fn plain_line_round_trips() {
        let sample = Sample { a: 1, b: "x".into() };
        let line = write_line(&sample, None, false).unwrap();
        assert!(line.starts_with('{'));
        let back: Sample = read_line(&line, None).unwrap();
        assert_eq!(back, sample);
    }

    #[tokio::test]
    async fn encrypted_line_round_trips() {
        let (crypt, _dir) = ready_crypt().await;
        let sample = Sample { a: 2, b: "y".into() };
        let line = write_line(&sample, Some(&crypt), true).unwrap();
        assert!(!line.starts_with('{'));
        let back: Sample = read_line(&line, Some(&crypt)).unwrap();
        assert_eq!(back, sample);
    }

    #[tokio::test]
    async fn mixed_mode_file_reads_both_kinds_of_line() {
        let (crypt, _dir) = ready_crypt().await;
        let plain = Sample { a: 1, b: "plain".into() };
        let encrypted = Sample { a: 2, b: "encrypted".into() };

        let plain_line = write_line(&plain, None, false).unwrap();
        let encrypted_line = write_line(&encrypted, Some(&crypt), true).unwrap();

        let back_plain: Sample = read_line(&plain_line, Some(&crypt)).unwrap();
        let back_encrypted: Sample = read_line(&encrypted_line, Some(&crypt)).unwrap();
        assert_eq!(back_plain, plain);
        assert_eq!(back_encrypted, encrypted);
    }
}
