//! `Table`: owns the identifier→shard index and the shard pool, and routes
//! record operations between them (spec.md §4.3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jstorage_core::{new_shard_id, Collaborators, ErrorKind, Result, Settings, UserRef};
use jstorage_crypt::CryptTool;
use jstorage_notify::{NotificationBus, UsageTracker};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::dataset::DataSet;
use crate::shard::{Shard, ShardStatus};
use crate::structure::matches_structure;

struct TableState {
    /// record identifier -> shard identifier.
    index: HashMap<String, String>,
    shard_pool: HashMap<String, Arc<Shard>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableManifest {
    pub database: String,
    pub table: String,
    #[serde(rename = "adaptiveLoad")]
    pub adaptive_load: bool,
    pub shards: Vec<ShardManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardManifestEntry {
    #[serde(rename = "shardId")]
    pub shard_id: String,
    #[serde(rename = "dataSets")]
    pub data_sets: Vec<String>,
}

/// Inconsistency-resolver modes (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Clear the flag without modification (operator attests correctness).
    AttestCorrect,
    /// Drop index entries whose shard is missing from the pool.
    DropOrphanedShardRefs,
    /// Mode 1 plus drop entries for loaded shards that don't contain the record.
    DropOrphanedRecordRefs,
    /// Full rebuild from on-disk shard files plus loaded DataSets.
    FullRebuild,
}

impl ResolveMode {
    pub fn from_u8(mode: u8) -> Result<Self> {
        match mode {
            0 => Ok(Self::AttestCorrect),
            1 => Ok(Self::DropOrphanedShardRefs),
            2 => Ok(Self::DropOrphanedRecordRefs),
            3 => Ok(Self::FullRebuild),
            other => Err(ErrorKind::not_found(format!("inconsistency resolver mode {other}"))),
        }
    }
}

pub struct Table {
    database: String,
    name: String,
    dir: PathBuf,
    cap: usize,
    adaptive_load: AtomicBool,
    default_structure: RwLock<Option<serde_json::Value>>,
    inconsistent: AtomicBool,
    state: RwLock<TableState>,
    collaborators: Collaborators,
    notify: Arc<NotificationBus>,
    /// Backs `optimize()`'s "recent access count" sort key (spec.md §4.3).
    /// Every `get_data_set`/`with_data_set_mut` call records one hit here,
    /// so `optimize()` always has a live picture of which records are hot
    /// without a caller having to thread usage data in separately.
    usage: UsageTracker,
    /// Shared with the owning `Database`'s `encrypted` flag, so operator-
    /// invoked rebuild paths (`optimize`, mode-3 `resolve_inconsistency`)
    /// write shard snapshots through the same encryption setting as the
    /// regular shutdown/unload path (spec.md §4.4/§4.2).
    encrypted: Arc<AtomicBool>,
}

impl Table {
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        dir: PathBuf,
        settings: &Settings,
        collaborators: Collaborators,
        notify: Arc<NotificationBus>,
        encrypted: Arc<AtomicBool>,
    ) -> Self {
        let usage = UsageTracker::new(collaborators.clock.clone());
        Self {
            database: database.into(),
            name: name.into(),
            dir,
            cap: settings.shard_cap,
            adaptive_load: AtomicBool::new(true),
            default_structure: RwLock::new(None),
            inconsistent: AtomicBool::new(false),
            state: RwLock::new(TableState {
                index: HashMap::new(),
                shard_pool: HashMap::new(),
            }),
            collaborators,
            notify,
            usage,
            encrypted,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive_load.load(Ordering::SeqCst)
    }

    pub fn set_adaptive_load(&self, adaptive: bool) {
        self.adaptive_load.store(adaptive, Ordering::SeqCst);
    }

    pub async fn set_default_structure(&self, template: Option<serde_json::Value>) {
        *self.default_structure.write().await = template;
    }

    pub async fn contains_data_set(&self, id: &str) -> bool {
        self.state.read().await.index.contains_key(id)
    }

    /// Restores this table's shards from a previously written
    /// `TableManifest` (the `<table>_index` file); shards themselves are
    /// not loaded eagerly unless `adaptive_load` is false.
    pub async fn restore(&self, manifest: &TableManifest, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        self.adaptive_load.store(manifest.adaptive_load, Ordering::SeqCst);
        let mut state = self.state.write().await;
        for entry in &manifest.shards {
            let shard = Arc::new(Shard::new(
                entry.shard_id.clone(),
                self.dir.join(&entry.shard_id),
                self.cap,
                self.database.clone(),
                self.name.clone(),
            ));
            if !manifest.adaptive_load {
                shard.load_data(settings, crypt).await?;
            }
            for id in &entry.data_sets {
                state.index.insert(id.clone(), entry.shard_id.clone());
            }
            state.shard_pool.insert(entry.shard_id.clone(), shard);
        }
        Ok(())
    }

    /// Serializes this table's current index/shard layout for persistence.
    pub async fn manifest(&self) -> TableManifest {
        let state = self.state.read().await;
        let mut by_shard: HashMap<String, Vec<String>> = HashMap::new();
        for (id, shard_id) in &state.index {
            by_shard.entry(shard_id.clone()).or_default().push(id.clone());
        }
        let shards = state
            .shard_pool
            .keys()
            .map(|shard_id| ShardManifestEntry {
                shard_id: shard_id.clone(),
                data_sets: by_shard.remove(shard_id).unwrap_or_default(),
            })
            .collect();
        TableManifest {
            database: self.database.clone(),
            table: self.name.clone(),
            adaptive_load: self.is_adaptive(),
            shards,
        }
    }

    pub async fn get_data_set(&self, id: &str, settings: &Settings, crypt: Option<&CryptTool>) -> Result<DataSet> {
        let shard_id = {
            let state = self.state.read().await;
            state.index.get(id).cloned()
        };
        let Some(shard_id) = shard_id else {
            return Err(ErrorKind::not_found(format!("record {id} in table {}", self.name)));
        };

        let shard = {
            let state = self.state.read().await;
            state.shard_pool.get(&shard_id).cloned()
        };
        let Some(shard) = shard else {
            self.inconsistent.store(true, Ordering::SeqCst);
            return Err(ErrorKind::IndexDivergence {
                what: format!("index points record {id} at missing shard {shard_id}"),
            });
        };

        self.ensure_ready_with_retry(&shard, settings, crypt).await?;

        self.usage.record(id);
        let now = self.collaborators.clock.now_millis();
        match shard.get_data_set(id, now).await? {
            Some(ds) => Ok(ds),
            None => {
                self.inconsistent.store(true, Ordering::SeqCst);
                Err(ErrorKind::IndexDivergence {
                    what: format!("shard {shard_id} does not contain indexed record {id}"),
                })
            }
        }
    }

    /// Runs `f` against the live `DataSet`, for the update-token mutation
    /// paths (`insert`/`update`/`delete` on a `dataType`).
    pub async fn with_data_set_mut<R>(
        &self,
        id: &str,
        settings: &Settings,
        crypt: Option<&CryptTool>,
        f: impl FnOnce(&mut DataSet) -> Result<R>,
    ) -> Result<R> {
        let shard_id = {
            let state = self.state.read().await;
            state.index.get(id).cloned()
        };
        let Some(shard_id) = shard_id else {
            return Err(ErrorKind::not_found(format!("record {id} in table {}", self.name)));
        };
        let shard = {
            let state = self.state.read().await;
            state.shard_pool.get(&shard_id).cloned()
        };
        let Some(shard) = shard else {
            self.inconsistent.store(true, Ordering::SeqCst);
            return Err(ErrorKind::IndexDivergence {
                what: format!("index points record {id} at missing shard {shard_id}"),
            });
        };
        self.ensure_ready_with_retry(&shard, settings, crypt).await?;
        self.usage.record(id);
        let now = self.collaborators.clock.now_millis();
        shard.with_data_set_mut(id, now, f).await
    }

    /// `dataType`-level read (spec.md §4.5's `DataSet.get`, reached through
    /// the table so callers never need to touch a shard directly). Goes
    /// through `with_data_set_mut`, not `get_data_set`, because issuing a
    /// token records it on the live `DataSet`; reading a cloned copy would
    /// lose it before the paired `update` could see it.
    pub async fn get_data_type(
        &self,
        id: &str,
        data_type: &str,
        request_token: bool,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<serde_json::Value> {
        let random = self.collaborators.random.clone();
        self.with_data_set_mut(id, settings, crypt, move |ds| Ok(ds.get(data_type, request_token, random.as_ref())))
            .await
    }

    /// `dataType`-level insert. On success, emits a `MutationEvent` on the
    /// table's `NotificationBus` (spec.md §2).
    pub async fn insert_data_type(
        &self,
        id: &str,
        data_type: &str,
        value: Option<serde_json::Value>,
        origin: Option<UserRef>,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        let clock = self.collaborators.clock.clone();
        let event = self
            .with_data_set_mut(id, settings, crypt, |ds| ds.insert(data_type, value, origin, clock.as_ref()))
            .await?;
        self.notify.publish(event).await;
        Ok(())
    }

    /// `dataType`-level update. `secure` selects the token-gated path
    /// (`DataSet::update`) versus the unconditional one (`update_unchecked`),
    /// mirroring the owning database's `secureModifications` flag
    /// (spec.md §4.2/§4.5).
    pub async fn update_data_type(
        &self,
        id: &str,
        data_type: &str,
        payload: serde_json::Value,
        origin: Option<UserRef>,
        secure: bool,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        let clock = self.collaborators.clock.clone();
        let event = self
            .with_data_set_mut(id, settings, crypt, move |ds| {
                if secure {
                    ds.update(data_type, &payload, origin, clock.as_ref())
                } else {
                    let value = payload.get(data_type).cloned().unwrap_or(payload);
                    Ok(ds.update_unchecked(data_type, value, origin, clock.as_ref()))
                }
            })
            .await?;
        self.notify.publish(event).await;
        Ok(())
    }

    /// `dataType`-level delete.
    pub async fn delete_data_type(
        &self,
        id: &str,
        data_type: &str,
        origin: Option<UserRef>,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        let clock = self.collaborators.clock.clone();
        let event = self
            .with_data_set_mut(id, settings, crypt, |ds| ds.delete(data_type, origin, clock.as_ref()))
            .await?;
        self.notify.publish(event).await;
        Ok(())
    }

    /// Insertion policy (spec.md §4.3), taken under the table's write lock.
    pub async fn insert_data_set(&self, record: DataSet, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        if self.is_inconsistent() {
            return Err(ErrorKind::IndexDivergence {
                what: format!("table {} is inconsistent; call resolve_inconsistency first", self.name),
            });
        }
        if let Some(template) = self.default_structure.read().await.as_ref() {
            let payload = serde_json::to_value(&record.data_types).unwrap_or(serde_json::json!({}));
            if !matches_structure(template, &payload) {
                return Err(ErrorKind::StructureMismatch {
                    what: format!("record {} does not match table {}'s default structure", record.identifier, self.name),
                });
            }
        }

        let mut state = self.state.write().await;
        if state.index.contains_key(&record.identifier) {
            return Err(ErrorKind::already_exists(format!("record {}", record.identifier)));
        }

        let shard = self.choose_target_shard(&mut state, settings).await?;
        if !shard.is_ready().await {
            shard.load_data(settings, crypt).await?;
        }

        let id = record.identifier.clone();
        shard.insert_data_set(record).await?;
        state.index.insert(id, shard.id().to_string());
        Ok(())
    }

    /// Selection order: a loaded shard with room, then any shard with room
    /// (loaded or not), then a freshly created shard. Ties broken by
    /// first-encountered, consistent with a `HashMap`'s (unspecified but
    /// stable-for-a-given-run) iteration order.
    async fn choose_target_shard(&self, state: &mut TableState, settings: &Settings) -> Result<Arc<Shard>> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for shard_id in state.index.values() {
            *counts.entry(shard_id.clone()).or_insert(0) += 1;
        }

        let mut loaded_with_room = None;
        let mut any_with_room = None;
        for (shard_id, shard) in state.shard_pool.iter() {
            let count = counts.get(shard_id).copied().unwrap_or(0);
            if count >= self.cap {
                continue;
            }
            if any_with_room.is_none() {
                any_with_room = Some(shard.clone());
            }
            if shard.status().await == ShardStatus::Ready && loaded_with_room.is_none() {
                loaded_with_room = Some(shard.clone());
            }
        }

        if let Some(shard) = loaded_with_room {
            return Ok(shard);
        }
        if let Some(shard) = any_with_room {
            return Ok(shard);
        }

        let shard_id = new_shard_id(self.collaborators.random.as_ref());
        let shard = Arc::new(Shard::new(
            shard_id.clone(),
            self.dir.join(&shard_id),
            self.cap,
            self.database.clone(),
            self.name.clone(),
        ));
        shard.load_data(settings, None).await?;
        state.shard_pool.insert(shard_id, shard.clone());
        Ok(shard)
    }

    pub async fn delete_data_set(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(shard_id) = state.index.remove(id) else {
            return Err(ErrorKind::not_found(format!("record {id} in table {}", self.name)));
        };
        let still_referenced = state.index.values().any(|s| s == &shard_id);
        if let Some(shard) = state.shard_pool.get(&shard_id).cloned() {
            let _ = shard.delete_data_set(id).await;
            if !still_referenced {
                shard.unload_data(false, false, false, None, false).await?;
                state.shard_pool.remove(&shard_id);
            }
        }
        Ok(())
    }

    /// `resolveInconsistency(mode)` (spec.md §4.3).
    pub async fn resolve_inconsistency(&self, mode: ResolveMode, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        let mut state = self.state.write().await;
        match mode {
            ResolveMode::AttestCorrect => {}
            ResolveMode::DropOrphanedShardRefs => {
                let live_shards: std::collections::HashSet<String> = state.shard_pool.keys().cloned().collect();
                state.index.retain(|_, shard_id| live_shards.contains(shard_id));
            }
            ResolveMode::DropOrphanedRecordRefs => {
                let live_shards: std::collections::HashSet<String> = state.shard_pool.keys().cloned().collect();
                state.index.retain(|_, shard_id| live_shards.contains(shard_id));

                let mut to_drop = Vec::new();
                for (id, shard_id) in state.index.iter() {
                    if let Some(shard) = state.shard_pool.get(shard_id) {
                        if shard.status().await == ShardStatus::Ready && shard.get_data_set(id, 0).await.ok().flatten().is_none() {
                            to_drop.push(id.clone());
                        }
                    }
                }
                for id in to_drop {
                    state.index.remove(&id);
                }
            }
            ResolveMode::FullRebuild => {
                self.full_rebuild(&mut state, settings, crypt).await?;
            }
        }
        self.inconsistent.store(false, Ordering::SeqCst);
        info!(table = %self.name, mode = ?mode, "inconsistency resolved");
        Ok(())
    }

    async fn full_rebuild(&self, state: &mut TableState, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        let mut merged: HashMap<String, DataSet> = HashMap::new();

        // On-disk shard files first...
        let mut dir_entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.dir).await?;
                tokio::fs::read_dir(&self.dir).await?
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir_entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            let scratch = Shard::new(name, entry.path(), self.cap, self.database.clone(), self.name.clone());
            if scratch.load_data(settings, crypt).await.is_err() {
                warn!(shard = %name, "skipping unreadable shard file during full rebuild");
                continue;
            }
            for ds in scratch.all_records().await {
                merged.insert(ds.identifier.clone(), ds);
            }
        }

        // ...then currently loaded in-memory DataSets take precedence.
        for shard in state.shard_pool.values() {
            if shard.status().await != ShardStatus::Ready {
                continue;
            }
            for ds in shard.all_records().await {
                merged.insert(ds.identifier.clone(), ds);
            }
        }

        // Delete all current shard files and the index.
        for shard in state.shard_pool.values() {
            shard.unload_data(true, false, true, None, false).await.ok();
        }
        state.shard_pool.clear();
        state.index.clear();

        // Re-pack into fresh shards of size `cap`.
        let mut records: Vec<DataSet> = merged.into_values().collect();
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        for chunk in records.chunks(self.cap.max(1)) {
            let shard_id = new_shard_id(self.collaborators.random.as_ref());
            let shard = Arc::new(Shard::new(shard_id.clone(), self.dir.join(&shard_id), self.cap, self.database.clone(), self.name.clone()));
            shard.load_data(settings, crypt).await?;
            for record in chunk {
                state.index.insert(record.identifier.clone(), shard_id.clone());
                shard.insert_data_set(record.clone()).await?;
            }
            shard.unload_data(false, true, false, crypt, self.is_encrypted()).await?;
            state.shard_pool.insert(shard_id, shard);
        }

        Ok(())
    }

    /// `optimize()` (spec.md §4.3): reorder records across shards so
    /// records with correlated access cohabit the same shard. Deterministic
    /// reference algorithm: sort by recent access count descending,
    /// ties by identifier ascending, refill shards up to `cap` in order.
    pub async fn optimize(&self, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        let mut state = self.state.write().await;

        let mut records: Vec<DataSet> = Vec::new();
        for shard in state.shard_pool.values() {
            if shard.status().await != ShardStatus::Ready {
                shard.load_data(settings, crypt).await?;
            }
            records.extend(shard.all_records().await);
        }

        records.sort_by(|a, b| {
            let count_a = self.usage.count_for(&a.identifier);
            let count_b = self.usage.count_for(&b.identifier);
            count_b.cmp(&count_a).then_with(|| a.identifier.cmp(&b.identifier))
        });

        for shard in state.shard_pool.values() {
            shard.unload_data(true, false, true, None, false).await.ok();
        }
        state.shard_pool.clear();
        state.index.clear();

        for chunk in records.chunks(self.cap.max(1)) {
            let shard_id = new_shard_id(self.collaborators.random.as_ref());
            let shard = Arc::new(Shard::new(shard_id.clone(), self.dir.join(&shard_id), self.cap, self.database.clone(), self.name.clone()));
            shard.load_data(settings, crypt).await?;
            for record in chunk {
                state.index.insert(record.identifier.clone(), shard_id.clone());
                shard.insert_data_set(record.clone()).await?;
            }
            shard.unload_data(false, true, false, crypt, self.is_encrypted()).await?;
            state.shard_pool.insert(shard_id, shard);
        }
        Ok(())
    }

    async fn ensure_ready_with_retry(&self, shard: &Arc<Shard>, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        if shard.is_ready().await {
            return Ok(());
        }
        shard.load_data(settings, crypt).await?;
        if shard.is_ready().await {
            Ok(())
        } else {
            Err(ErrorKind::not_ready(format!("shard {} did not become ready after one load attempt", shard.id())))
        }
    }

    /// All shards currently in this table's pool, for the maintenance
    /// scheduler's idle-unload and snapshot sweeps.
    pub async fn shards(&self) -> Vec<Arc<Shard>> {
        self.state.read().await.shard_pool.values().cloned().collect()
    }
}
