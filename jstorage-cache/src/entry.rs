use serde::{Deserialize, Serialize};

/// One cached blob: `(cacheId, id, data, validUntil)` (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    #[serde(rename = "cacheIdentifier")]
    pub cache_identifier: String,
    pub identifier: String,
    #[serde(rename = "validUntil")]
    pub valid_until: i64,
    pub data: serde_json::Value,
}

impl CachedEntry {
    /// `validUntil < 0` never expires; `validUntil >= now` is still valid.
    /// `validUntil == 0` is therefore expired the instant it's observed;
    /// this exact boundary is deliberate (spec.md §9, open question).
    pub fn is_valid(&self, now_millis: i64) -> bool {
        self.valid_until < 0 || self.valid_until >= now_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(valid_until: i64) -> CachedEntry {
        CachedEntry {
            cache_identifier: "sessions".into(),
            identifier: "s1".into(),
            valid_until,
            data: serde_json::json!({"k": "v"}),
        }
    }

    #[test]
    fn negative_valid_until_never_expires() {
        assert!(entry(-1).is_valid(i64::MAX));
    }

    #[test]
    fn zero_valid_until_is_expired_immediately() {
        assert!(!entry(0).is_valid(1));
    }

    #[test]
    fn valid_until_equal_to_now_is_still_valid() {
        assert!(entry(1_000).is_valid(1_000));
        assert!(!entry(1_000).is_valid(1_001));
    }
}
