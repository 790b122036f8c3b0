//! `Shard`: a bounded, file-backed group of `DataSet`s sharing one on-disk
//! file, with the load/unload state machine from spec.md §4.4.

use std::collections::HashMap;
use std::path::PathBuf;

use jstorage_core::{ErrorKind, Result, Settings};
use jstorage_crypt::CryptTool;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::dataset::DataSet;
use crate::file_format::{read_line, write_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum ShardStatus {
    Error = -1,
    Oom = -2,
    Unloaded = 0,
    Unloading = 1,
    Loading = 2,
    Ready = 3,
}

struct ShardState {
    status: ShardStatus,
    members: HashMap<String, DataSet>,
    last_access: i64,
}

/// Owned exclusively by one `Table` (spec.md §3).
pub struct Shard {
    id: String,
    path: PathBuf,
    cap: usize,
    database: String,
    table: String,
    state: RwLock<ShardState>,
}

impl Shard {
    pub fn new(id: impl Into<String>, path: PathBuf, cap: usize, database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path,
            cap,
            database: database.into(),
            table: table.into(),
            state: RwLock::new(ShardState {
                status: ShardStatus::Unloaded,
                members: HashMap::new(),
                last_access: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> ShardStatus {
        self.state.read().await.status
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.members.len()
    }

    /// Snapshot of every record currently held in memory, used by the
    /// inconsistency rebuild and `optimize()` paths that need to enumerate
    /// a shard's contents directly rather than go through the table index.
    pub async fn all_records(&self) -> Vec<DataSet> {
        self.state.read().await.members.values().cloned().collect()
    }

    pub async fn is_ready(&self) -> bool {
        self.status().await == ShardStatus::Ready
    }

    /// Millisecond timestamp of the last `get`/mutation this shard served,
    /// consulted by the maintenance scheduler's idle-unload sweep.
    pub async fn last_access(&self) -> i64 {
        self.state.read().await.last_access
    }

    /// Load contract (spec.md §4.4): transition out of `{unloaded, error,
    /// oom}`, check the load-size budget, then read the file one JSON
    /// object per line, routing encrypted lines through `crypt`.
    pub async fn load_data(&self, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        let mut guard = self.state.write().await;
        if guard.status as i8 > 0 {
            return Ok(());
        }
        guard.status = ShardStatus::Loading;
        drop(guard);

        let outcome = self.try_load(settings, crypt).await;

        let mut guard = self.state.write().await;
        match outcome {
            Ok(members) => {
                guard.members = members;
                guard.status = ShardStatus::Ready;
                Ok(())
            }
            Err(LoadOutcome::Oom) => {
                guard.status = ShardStatus::Oom;
                Err(ErrorKind::LoadFailed {
                    what: format!("shard {} exceeds memory budget", self.id),
                })
            }
            Err(LoadOutcome::Failed(what)) => {
                guard.status = ShardStatus::Error;
                Err(ErrorKind::LoadFailed { what })
            }
        }
    }

    async fn try_load(&self, settings: &Settings, crypt: Option<&CryptTool>) -> std::result::Result<HashMap<String, DataSet>, LoadOutcome> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(LoadOutcome::Failed(e.to_string())),
        };
        if meta.len() > settings.oom_threshold_bytes() {
            return Err(LoadOutcome::Oom);
        }

        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| LoadOutcome::Failed(e.to_string()))?;

        let mut members = HashMap::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DataSet =
                read_line(line, crypt).map_err(|e| LoadOutcome::Failed(e.to_string()))?;
            if record.database != self.database || record.table != self.table {
                return Err(LoadOutcome::Failed(format!(
                    "record {} in shard {} carries mismatched (database, table)",
                    record.identifier, self.id
                )));
            }
            members.insert(record.identifier.clone(), record);
        }
        Ok(members)
    }

    /// `unload_data(unload, save, delete)`, the same three orthogonal flags
    /// as `CacheBucket::unload_data`.
    pub async fn unload_data(&self, unload: bool, save: bool, delete: bool, crypt: Option<&CryptTool>, encrypted: bool) -> Result<()> {
        let mut guard = self.state.write().await;

        if delete {
            guard.members.clear();
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(shard = %self.id, error = %e, "failed to remove shard file");
                }
            }
            guard.status = ShardStatus::Unloaded;
            return Ok(());
        }

        if save {
            guard.status = ShardStatus::Unloading;
            let snapshot: Vec<DataSet> = guard.members.values().cloned().collect();
            drop(guard);

            if let Err(e) = self.write_snapshot(&snapshot, crypt, encrypted).await {
                let mut guard = self.state.write().await;
                guard.status = ShardStatus::Error;
                return Err(ErrorKind::UnloadFailed { what: e });
            }
            guard = self.state.write().await;
        }

        if unload {
            guard.members.clear();
            guard.status = ShardStatus::Unloaded;
        } else if guard.status != ShardStatus::Unloaded {
            guard.status = ShardStatus::Ready;
        }
        Ok(())
    }

    async fn write_snapshot(&self, records: &[DataSet], crypt: Option<&CryptTool>, encrypted: bool) -> std::result::Result<(), String> {
        let dir = self.path.parent().ok_or("shard path has no parent directory")?;
        tokio::fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;
        let tmp_path = dir.join(format!(".{}.tmp", self.id));

        {
            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| e.to_string())?;
            for record in records {
                let line = write_line(record, crypt, encrypted).map_err(|e| e.to_string())?;
                file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
                file.write_all(b"\n").await.map_err(|e| e.to_string())?;
            }
            file.flush().await.map_err(|e| e.to_string())?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| e.to_string())?;
        debug!(shard = %self.id, count = records.len(), "shard snapshot written");
        Ok(())
    }

    pub async fn get_data_set(&self, id: &str, now_millis: i64) -> Result<Option<DataSet>> {
        self.require_ready().await?;
        let mut guard = self.state.write().await;
        guard.last_access = now_millis;
        Ok(guard.members.get(id).cloned())
    }

    /// Runs `f` against the stored `DataSet` in place, so the
    /// update-token protocol can mutate it without a clone/replace round
    /// trip.
    pub async fn with_data_set_mut<R>(&self, id: &str, now_millis: i64, f: impl FnOnce(&mut DataSet) -> Result<R>) -> Result<R> {
        self.require_ready().await?;
        let mut guard = self.state.write().await;
        guard.last_access = now_millis;
        let record = guard
            .members
            .get_mut(id)
            .ok_or_else(|| ErrorKind::not_found(format!("record {id}")))?;
        f(record)
    }

    pub async fn insert_data_set(&self, record: DataSet) -> Result<()> {
        self.require_ready().await?;
        let mut guard = self.state.write().await;
        if record.database != self.database || record.table != self.table {
            return Err(ErrorKind::DoesNotFit {
                hint: 220,
                what: format!("record {} targets a different (database, table) than shard {}", record.identifier, self.id),
            });
        }
        if guard.members.contains_key(&record.identifier) {
            return Err(ErrorKind::already_exists(format!("record {}", record.identifier)));
        }
        if guard.members.len() >= self.cap {
            return Err(ErrorKind::DoesNotFit {
                hint: 220,
                what: format!("shard {} is at capacity ({})", self.id, self.cap),
            });
        }
        guard.members.insert(record.identifier.clone(), record);
        Ok(())
    }

    pub async fn delete_data_set(&self, id: &str) -> Result<()> {
        self.require_ready().await?;
        let mut guard = self.state.write().await;
        if guard.members.remove(id).is_none() {
            return Err(ErrorKind::not_found(format!("record {id}")));
        }
        Ok(())
    }

    async fn require_ready(&self) -> Result<()> {
        if self.status().await == ShardStatus::Ready {
            Ok(())
        } else {
            Err(ErrorKind::not_ready(format!("shard {} is not ready", self.id)))
        }
    }
}

enum LoadOutcome {
    Oom,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::testing::FakeClock;
    use jstorage_core::Clock;

    fn settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn insert_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new("s1", dir.path().join("s1"), 10, "blog", "posts");
        shard.load_data(&settings(), None).await.unwrap();

        let clock = FakeClock::new(1_000);
        let record = DataSet::new("blog", "posts", "post1", clock.now_millis());
        shard.insert_data_set(record).await.unwrap();

        let fetched = shard.get_data_set("post1", clock.now_millis()).await.unwrap();
        assert!(fetched.is_some());

        shard.delete_data_set("post1").await.unwrap();
        assert!(shard.get_data_set("post1", clock.now_millis()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_mismatched_parent() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new("s1", dir.path().join("s1"), 10, "blog", "posts");
        shard.load_data(&settings(), None).await.unwrap();

        let record = DataSet::new("other-db", "posts", "post1", 0);
        let err = shard.insert_data_set(record).await.unwrap_err();
        assert!(matches!(err, ErrorKind::DoesNotFit { .. }));
    }

    #[tokio::test]
    async fn insert_rejects_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new("s1", dir.path().join("s1"), 1, "blog", "posts");
        shard.load_data(&settings(), None).await.unwrap();
        shard.insert_data_set(DataSet::new("blog", "posts", "r1", 0)).await.unwrap();

        let err = shard.insert_data_set(DataSet::new("blog", "posts", "r2", 0)).await.unwrap_err();
        assert!(matches!(err, ErrorKind::DoesNotFit { .. }));
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1");
        let shard = Shard::new("s1", path.clone(), 10, "blog", "posts");
        shard.load_data(&settings(), None).await.unwrap();
        shard.insert_data_set(DataSet::new("blog", "posts", "post1", 0)).await.unwrap();
        shard.unload_data(true, true, false, None, false).await.unwrap();
        assert_eq!(shard.status().await, ShardStatus::Unloaded);

        let reloaded = Shard::new("s1", path, 10, "blog", "posts");
        reloaded.load_data(&settings(), None).await.unwrap();
        assert!(reloaded.get_data_set("post1", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn operations_on_an_unloaded_shard_are_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::new("s1", dir.path().join("s1"), 10, "blog", "posts");
        let err = shard.get_data_set("post1", 0).await.unwrap_err();
        assert!(matches!(err, ErrorKind::NotReady { .. }));
    }
}
