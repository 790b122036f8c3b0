//! Collaborator ports consumed by the storage core.
//!
//! The HTTP/TLS listener, command dispatcher, and user/permission database
//! are external to this crate (spec.md §1, §6). Rather than reach for a
//! process-wide singleton the way the original `getInstance(true)` pattern
//! did, every component that needs one of these collaborators receives it
//! as an `Arc<dyn Trait>` at construction time.

use std::sync::Arc;

/// Wall-clock access, injected so shard/cache TTL logic is deterministic in tests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
    fn now_nanos(&self) -> u64;
}

/// System clock backed by `std::time::SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as i64
    }

    fn now_nanos(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos() as u64
    }
}

/// Source of cryptographically secure random bytes, used for shard
/// identifiers and update tokens.
pub trait Random: Send + Sync {
    fn bytes(&self, n: usize) -> Vec<u8>;
}

/// `Random` backed by `ring`'s `SystemRandom`.
#[derive(Debug, Default)]
pub struct SecureRandom(ring::rand::SystemRandom);

impl Random for SecureRandom {
    fn bytes(&self, n: usize) -> Vec<u8> {
        use ring::rand::SecureRandom as _;
        let mut buf = vec![0u8; n];
        self.0.fill(&mut buf).expect("system RNG failure");
        buf
    }
}

/// Reference to an authenticated caller, threaded through mutation calls so
/// the notification bus can suppress self-notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UserRef(pub String);

/// Authentication/authorization collaborator. Implemented outside this
/// crate; a permissive test double lives in `jstorage-core::ports::testing`
/// for use by the rest of the workspace's test suites.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn by_id(&self, id: &str) -> Option<UserRef>;
    async fn by_token(&self, token: &str) -> Option<UserRef>;
    async fn verify_password(&self, id: &str, password: &str) -> bool;
    async fn has_permission(&self, user: &UserRef, permission: &str) -> bool;
}

/// Bundle of collaborators threaded through the storage core's constructors.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn Random>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(SecureRandom::default()),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock whose value advances only when told to; used to deterministically
    /// exercise idle-shard unload and cache TTL sweeping in tests.
    pub struct FakeClock(AtomicI64);

    impl FakeClock {
        pub fn new(start_millis: i64) -> Self {
            Self(AtomicI64::new(start_millis))
        }

        pub fn advance_millis(&self, delta: i64) {
            self.0.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }

        fn now_nanos(&self) -> u64 {
            (self.0.load(Ordering::SeqCst) as u64) * 1_000_000
        }
    }

    /// Directory that authenticates everyone and grants every permission;
    /// used by storage-core tests that don't exercise authorization.
    pub struct PermissiveDirectory;

    #[async_trait::async_trait]
    impl UserDirectory for PermissiveDirectory {
        async fn by_id(&self, id: &str) -> Option<UserRef> {
            Some(UserRef(id.to_string()))
        }

        async fn by_token(&self, token: &str) -> Option<UserRef> {
            Some(UserRef(token.to_string()))
        }

        async fn verify_password(&self, _id: &str, _password: &str) -> bool {
            true
        }

        async fn has_permission(&self, _user: &UserRef, _permission: &str) -> bool {
            true
        }
    }
}
