//! `CacheBucket`: the cache's analogue of a storage `Shard` (spec.md §4.6),
//! stripped of the update-token machinery and at-rest encryption a record
//! shard carries; a bucket is "same shape as `Shard` but simpler".

use std::collections::HashMap;
use std::path::PathBuf;

use jstorage_core::{ErrorKind, Result, Settings};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::entry::CachedEntry;

/// Mirrors the shard state machine (spec.md §4.4) one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum BucketStatus {
    Error = -1,
    Oom = -2,
    Unloaded = 0,
    Unloading = 1,
    Loading = 2,
    Ready = 3,
}

struct BucketState {
    status: BucketStatus,
    entries: HashMap<String, CachedEntry>,
    last_access: i64,
}

pub struct CacheBucket {
    identifier: String,
    path: PathBuf,
    state: RwLock<BucketState>,
}

impl CacheBucket {
    pub fn new(identifier: impl Into<String>, path: PathBuf) -> Self {
        Self {
            identifier: identifier.into(),
            path,
            state: RwLock::new(BucketState {
                status: BucketStatus::Unloaded,
                entries: HashMap::new(),
                last_access: 0,
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn status(&self) -> BucketStatus {
        self.state.read().await.status
    }

    /// Load contract: transition out of `{unloaded, error, oom}` into
    /// `ready`, checking the load-size budget before reading the backing
    /// file one JSON object per line.
    pub async fn load_data(&self, settings: &Settings) -> Result<()> {
        let mut guard = self.state.write().await;
        if guard.status as i8 > 0 {
            return Ok(());
        }
        guard.status = BucketStatus::Loading;
        drop(guard);

        let load_result = self.try_load(settings).await;

        let mut guard = self.state.write().await;
        match load_result {
            Ok(entries) => {
                guard.entries = entries;
                guard.status = BucketStatus::Ready;
                Ok(())
            }
            Err(LoadOutcome::Oom) => {
                guard.status = BucketStatus::Oom;
                Err(ErrorKind::LoadFailed {
                    what: format!("cache bucket {} exceeds memory budget", self.identifier),
                })
            }
            Err(LoadOutcome::Failed(what)) => {
                guard.status = BucketStatus::Error;
                Err(ErrorKind::LoadFailed { what })
            }
        }
    }

    async fn try_load(&self, settings: &Settings) -> std::result::Result<HashMap<String, CachedEntry>, LoadOutcome> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(e) => return Err(LoadOutcome::Failed(e.to_string())),
        };

        if meta.len() > settings.oom_threshold_bytes() {
            return Err(LoadOutcome::Oom);
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| LoadOutcome::Failed(e.to_string()))?;

        let mut entries = HashMap::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: CachedEntry = serde_json::from_str(line)
                .map_err(|e| LoadOutcome::Failed(format!("malformed cache line: {e}")))?;
            if entry.cache_identifier != self.identifier {
                continue;
            }
            entries.insert(entry.identifier.clone(), entry);
        }
        Ok(entries)
    }

    /// `unload_data(unload, save, delete)`: same three orthogonal flags as
    /// `Shard::unload_data` (spec.md §4.4).
    pub async fn unload_data(&self, unload: bool, save: bool, delete: bool) -> Result<()> {
        let mut guard = self.state.write().await;

        if delete {
            guard.entries.clear();
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(bucket = %self.identifier, error = %e, "failed to remove cache bucket file");
                }
            }
            guard.status = BucketStatus::Unloaded;
            return Ok(());
        }

        if save {
            guard.status = BucketStatus::Unloading;
            let snapshot: Vec<CachedEntry> = guard.entries.values().cloned().collect();
            drop(guard);

            if let Err(e) = write_snapshot(&self.path, &snapshot).await {
                let mut guard = self.state.write().await;
                guard.status = BucketStatus::Error;
                return Err(ErrorKind::UnloadFailed { what: e });
            }
            guard = self.state.write().await;
        }

        if unload {
            guard.entries.clear();
            guard.status = BucketStatus::Unloaded;
        } else if guard.status != BucketStatus::Unloaded {
            guard.status = BucketStatus::Ready;
        }
        Ok(())
    }

    /// `get` is read-only and never auto-loads; callers drive loading
    /// explicitly via [`CacheBucket::load_data`] (the `CacheManager` does
    /// this on the single bounded retry spec.md §4.4 describes for shards).
    pub async fn get(&self, id: &str, now_millis: i64) -> Result<Option<CachedEntry>> {
        let mut guard = self.state.write().await;
        if guard.status != BucketStatus::Ready {
            return Err(ErrorKind::not_ready(format!(
                "cache bucket {} is not ready",
                self.identifier
            )));
        }
        guard.last_access = now_millis;
        let found = guard.entries.get(id).cloned();
        Ok(found.filter(|e| e.is_valid(now_millis)))
    }

    /// Insertion rejects only when an entry exists **and** is still valid;
    /// otherwise it overwrites (spec.md §4.6).
    pub async fn insert(&self, entry: CachedEntry, now_millis: i64) -> Result<()> {
        let mut guard = self.state.write().await;
        if guard.status != BucketStatus::Ready {
            return Err(ErrorKind::not_ready(format!(
                "cache bucket {} is not ready",
                self.identifier
            )));
        }
        if let Some(existing) = guard.entries.get(&entry.identifier) {
            if existing.is_valid(now_millis) {
                return Err(ErrorKind::already_exists(format!(
                    "cache entry {} in bucket {} is still valid",
                    entry.identifier, self.identifier
                )));
            }
        }
        guard.last_access = now_millis;
        guard.entries.insert(entry.identifier.clone(), entry);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.state.write().await;
        if guard.status != BucketStatus::Ready {
            return Err(ErrorKind::not_ready(format!(
                "cache bucket {} is not ready",
                self.identifier
            )));
        }
        if guard.entries.remove(id).is_none() {
            return Err(ErrorKind::not_found(format!(
                "cache entry {id} in bucket {}",
                self.identifier
            )));
        }
        Ok(())
    }

    /// Periodic sweep: drop every entry that has expired by `now_millis`.
    /// Returns the number of entries removed. Run by the
    /// `MaintenanceScheduler`'s cache-sweep task (spec.md §4.10 / §5).
    pub async fn sweep_expired(&self, now_millis: i64) -> usize {
        let mut guard = self.state.write().await;
        if guard.status != BucketStatus::Ready {
            return 0;
        }
        let before = guard.entries.len();
        guard.entries.retain(|_, e| e.is_valid(now_millis));
        before - guard.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

enum LoadOutcome {
    Oom,
    Failed(String),
}

async fn write_snapshot(path: &std::path::Path, entries: &[CachedEntry]) -> std::result::Result<(), String> {
    let dir = path.parent().ok_or_else(|| "cache bucket path has no parent directory".to_string())?;
    tokio::fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("cache")
    ));

    {
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| e.to_string())?;
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(|e| e.to_string())?;
            file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
            file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;
    }

    tokio::fs::rename(&tmp_path, path).await.map_err(|e| e.to_string())?;
    debug!(path = %path.display(), count = entries.len(), "cache bucket snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn insert_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = CacheBucket::new("sessions", dir.path().join("sessions_cache"));
        bucket.load_data(&settings()).await.unwrap();

        let entry = CachedEntry {
            cache_identifier: "sessions".into(),
            identifier: "s1".into(),
            valid_until: -1,
            data: serde_json::json!({"user": "a"}),
        };
        bucket.insert(entry, 1_000).await.unwrap();

        let found = bucket.get("s1", 2_000).await.unwrap().unwrap();
        assert_eq!(found.data["user"], "a");

        bucket.delete("s1").await.unwrap();
        assert!(bucket.get("s1", 3_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_when_existing_entry_still_valid() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = CacheBucket::new("sessions", dir.path().join("sessions_cache"));
        bucket.load_data(&settings()).await.unwrap();

        let entry = CachedEntry {
            cache_identifier: "sessions".into(),
            identifier: "s1".into(),
            valid_until: 5_000,
            data: serde_json::json!({"v": 1}),
        };
        bucket.insert(entry.clone(), 1_000).await.unwrap();

        let err = bucket.insert(entry, 1_000).await.unwrap_err();
        assert!(matches!(err, ErrorKind::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn insert_overwrites_when_existing_entry_expired() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = CacheBucket::new("sessions", dir.path().join("sessions_cache"));
        bucket.load_data(&settings()).await.unwrap();

        let stale = CachedEntry {
            cache_identifier: "sessions".into(),
            identifier: "s1".into(),
            valid_until: 500,
            data: serde_json::json!({"v": 1}),
        };
        bucket.insert(stale, 100).await.unwrap();

        let fresh = CachedEntry {
            cache_identifier: "sessions".into(),
            identifier: "s1".into(),
            valid_until: 9_999,
            data: serde_json::json!({"v": 2}),
        };
        bucket.insert(fresh, 1_000).await.unwrap();

        let found = bucket.get("s1", 1_000).await.unwrap().unwrap();
        assert_eq!(found.data["v"], 2);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions_cache");
        let bucket = CacheBucket::new("sessions", path.clone());
        bucket.load_data(&settings()).await.unwrap();
        bucket
            .insert(
                CachedEntry {
                    cache_identifier: "sessions".into(),
                    identifier: "s1".into(),
                    valid_until: -1,
                    data: serde_json::json!({"v": 1}),
                },
                0,
            )
            .await
            .unwrap();
        bucket.unload_data(true, true, false).await.unwrap();
        assert_eq!(bucket.status().await, BucketStatus::Unloaded);

        let reloaded = CacheBucket::new("sessions", path);
        reloaded.load_data(&settings()).await.unwrap();
        let found = reloaded.get("s1", 0).await.unwrap().unwrap();
        assert_eq!(found.data["v"], 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = CacheBucket::new("sessions", dir.path().join("sessions_cache"));
        bucket.load_data(&settings()).await.unwrap();
        bucket
            .insert(
                CachedEntry {
                    cache_identifier: "sessions".into(),
                    identifier: "expired".into(),
                    valid_until: 10,
                    data: serde_json::json!({}),
                },
                0,
            )
            .await
            .unwrap();
        bucket
            .insert(
                CachedEntry {
                    cache_identifier: "sessions".into(),
                    identifier: "forever".into(),
                    valid_until: -1,
                    data: serde_json::json!({}),
                },
                0,
            )
            .await
            .unwrap();

        let removed = bucket.sweep_expired(1_000).await;
        assert_eq!(removed, 1);
        assert_eq!(bucket.len().await, 1);
    }
}
