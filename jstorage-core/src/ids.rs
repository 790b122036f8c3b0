//! Identifier and token generation helpers shared by storage and cache.

use crate::ports::Random;

/// A fresh 16-byte shard identifier, rendered as lowercase hex (spec.md §3:
/// "opaque 16-byte identifier").
pub fn new_shard_id(random: &dyn Random) -> String {
    hex_encode(&random.bytes(16))
}

/// A fresh update token: 18 random bytes, base64 (URL-safe, unpadded)
/// encoded, handed out by `DataSet::get(.., request_token = true)`.
pub fn new_update_token(random: &dyn Random) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(random.bytes(18))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
