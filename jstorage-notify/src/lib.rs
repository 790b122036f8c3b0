//! Notification fan-out and the two per-caller counters that gate it from
//! the outside: `RateLimiter` (spec.md §4.8) and `UsageTracker` (spec.md
//! §2's "rolling 10-minute per-operation counters", consumed by
//! `Table::optimize`).

mod bus;
mod rate_limiter;
mod usage_tracker;

pub use bus::{ListenerHandle, NotificationBus, SubscriptionFilter};
pub use rate_limiter::RateLimiter;
pub use usage_tracker::UsageTracker;
