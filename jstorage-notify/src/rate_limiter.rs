//! Token-bucket `RateLimiter` with ns-resolution refill (spec.md §4.8).
//!
//! Backs the authenticated request path (one limiter per user); storage-
//! internal calls bypass it entirely. This crate only provides the
//! primitive, wiring a limiter per caller is an external-layer concern.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jstorage_core::Clock;

/// `new(window, buckets)` sets a refill rate of one bucket per
/// `window/buckets`. `take()` is a compare-and-swap retry loop so
/// concurrent callers never double-spend the same token.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    capacity: u64,
    refill_interval_nanos: u64,
    tokens: AtomicU64,
    last_refill_nanos: AtomicI64,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, window: Duration, buckets: u64) -> Self {
        let refill_interval_nanos = (window.as_nanos() / (buckets.max(1) as u128)).max(1) as u64;
        let now = clock.now_nanos() as i64;
        Self {
            clock,
            capacity: buckets.max(1),
            refill_interval_nanos,
            tokens: AtomicU64::new(buckets.max(1)),
            last_refill_nanos: AtomicI64::new(now),
        }
    }

    /// Attempts to consume one token. Returns `false` (no mutation) when
    /// the bucket is empty, `true` otherwise.
    pub fn take(&self) -> bool {
        self.refill();
        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn refill(&self) {
        let now = self.clock.now_nanos() as i64;
        let last = self.last_refill_nanos.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);
        if elapsed < self.refill_interval_nanos as i64 {
            return;
        }
        let earned = (elapsed as u64) / self.refill_interval_nanos;
        if earned == 0 {
            return;
        }
        // Advance the refill clock by exactly the whole intervals consumed,
        // so unconsumed remainder nanoseconds aren't lost on the next tick.
        let consumed_nanos = earned * self.refill_interval_nanos;
        if self
            .last_refill_nanos
            .compare_exchange(last, last + consumed_nanos as i64, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut current = self.tokens.load(Ordering::SeqCst);
        loop {
            let next = (current + earned).min(self.capacity);
            match self
                .tokens
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Epoch-millis at which the bucket will next be full, assuming no
    /// further `take()` calls in the meantime.
    pub fn refill_time_millis(&self) -> i64 {
        self.refill();
        let missing = self.capacity.saturating_sub(self.tokens.load(Ordering::SeqCst));
        let now_nanos = self.clock.now_nanos() as i64;
        let wait_nanos = missing * self.refill_interval_nanos;
        (now_nanos + wait_nanos as i64) / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::testing::FakeClock;

    #[test]
    fn bucket_size_takes_succeed_then_reject() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(clock, Duration::from_secs(60), 3);
        assert!(limiter.take());
        assert!(limiter.take());
        assert!(limiter.take());
        assert!(!limiter.take());
    }

    #[test]
    fn full_window_of_idleness_refills_the_bucket() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(clock.clone(), Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(limiter.take());
        }
        assert!(!limiter.take());

        clock.advance_millis(60_000);
        for _ in 0..3 {
            assert!(limiter.take());
        }
        assert!(!limiter.take());
    }

    #[test]
    fn partial_refill_grants_proportional_tokens() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(clock.clone(), Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(limiter.take());
        }

        clock.advance_millis(20_000); // one third of the window -> one bucket
        assert!(limiter.take());
        assert!(!limiter.take());
    }

    #[test]
    fn refill_time_reports_when_the_bucket_will_be_full() {
        let clock = Arc::new(FakeClock::new(1_000_000_000)); // 1s in nanos
        let limiter = RateLimiter::new(clock, Duration::from_secs(60), 3);
        assert!(limiter.take());
        let refill_at = limiter.refill_time_millis();
        assert!(refill_at > 1_000);
    }
}
