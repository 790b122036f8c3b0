//! Process-level configuration.
//!
//! This is distinct from the `./jstorage/config/*` and `./jstorage/data/**`
//! files the storage core itself reads and writes (spec.md §6); those are
//! JStorage's own persisted state and are read directly via `serde_json`.
//! `Settings` instead covers the ambient knobs an operator tunes per
//! deployment: worker pool sizing, maintenance cadence, rate-limiter
//! defaults. It is loaded with the `config` crate, layering environment
//! variables over an optional `jstorage.toml` file over built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root directory under which the `jstorage/` tree is rooted.
fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_shard_cap() -> usize {
    500
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_idle_unload() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cache_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_notification_queue_bound() -> usize {
    1024
}

fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit_buckets() -> u64 {
    120
}

fn default_assumed_available_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

/// Ambient process settings for a single JStorage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory containing the `jstorage/` tree (config/ and data/ subtrees).
    pub root_dir: PathBuf,

    /// Default per-shard record capacity (spec.md §3, "default cap: 500").
    pub shard_cap: usize,

    /// Size of the fixed worker pool bounding request concurrency
    /// (spec.md §5). The storage core itself does not spawn this pool;
    /// it is sized here for the external request layer to consume.
    pub worker_pool_size: usize,

    /// Idle duration after which an adaptive table's shard becomes eligible
    /// for unload (scenario 3 in spec.md §8 uses 15 minutes).
    pub idle_unload_after: Duration,

    /// Interval between periodic snapshot sweeps of loaded shards.
    pub snapshot_interval: Duration,

    /// Interval between cache-bucket TTL sweeps.
    pub cache_sweep_interval: Duration,

    /// Interval between notification-bus heartbeats (spec.md §4.7: 2s, fixed).
    pub heartbeat_interval: Duration,

    /// Bound on each listener's notification queue before publication blocks.
    pub notification_queue_bound: usize,

    /// Token-bucket refill window for the default rate limiter.
    pub rate_limit_window: Duration,

    /// Number of buckets refilled per `rate_limit_window`.
    pub rate_limit_buckets: u64,

    /// Budget used by the shard/bucket load-size check (spec.md §4.4: "if
    /// the file would consume more than 80% of free memory, set
    /// `status = oom`"). Stands in for "free memory" as a configured
    /// ceiling rather than a live OS query.
    pub assumed_available_memory_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_dir: default_root(),
            shard_cap: default_shard_cap(),
            worker_pool_size: default_worker_pool_size(),
            idle_unload_after: default_idle_unload(),
            snapshot_interval: default_snapshot_interval(),
            cache_sweep_interval: default_cache_sweep_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            notification_queue_bound: default_notification_queue_bound(),
            rate_limit_window: default_rate_limit_window(),
            rate_limit_buckets: default_rate_limit_buckets(),
            assumed_available_memory_bytes: default_assumed_available_memory_bytes(),
        }
    }
}

impl Settings {
    /// The load-size ceiling a shard or cache-bucket file must stay under
    /// (spec.md §4.4's "80% of free memory" check).
    pub fn oom_threshold_bytes(&self) -> u64 {
        (self.assumed_available_memory_bytes as f64 * 0.8) as u64
    }
}

impl Settings {
    /// Load settings from (in ascending precedence) built-in defaults, an
    /// optional `jstorage.toml` in the current directory, and `JSTORAGE_*`
    /// environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::with_name("jstorage").required(false))
            .add_source(config::Environment::with_prefix("JSTORAGE").separator("__"));

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn jstorage_root(&self) -> PathBuf {
        self.root_dir.join("jstorage")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.jstorage_root().join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.jstorage_root().join("data")
    }

    pub fn db_data_dir(&self) -> PathBuf {
        self.data_dir().join("db")
    }

    pub fn cache_data_dir(&self) -> PathBuf {
        self.data_dir().join("cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let s = Settings::default();
        assert_eq!(s.shard_cap, 500);
        assert_eq!(s.config_dir(), PathBuf::from("./jstorage/config"));
        assert_eq!(s.db_data_dir(), PathBuf::from("./jstorage/data/db"));
    }
}
