//! `CacheManager`: the registry's counterpart for cache buckets. Owns the
//! bucket namespace, the `cachemanager` manifest, and bucket lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use jstorage_core::{ErrorKind, Result, Settings};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bucket::CacheBucket;

const MANIFEST_FILE: &str = "cachemanager";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Manifest {
    caches: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    identifier: String,
    #[serde(rename = "adaptiveLoad")]
    adaptive_load: bool,
}

/// Top-level container of cache buckets (spec.md §2, §4.1's cache-facing half).
///
/// Reads (`get_cache`) are lock-free via `DashMap`, matching the registry's
/// "read operations are lock-free" contract; creating or dropping a bucket
/// name is the only path that needs exclusive access, taken on the map
/// entry itself rather than a crate-wide lock.
pub struct CacheManager {
    cache_dir: PathBuf,
    buckets: DashMap<String, Arc<CacheBucket>>,
}

impl CacheManager {
    /// Reads the `cachemanager` manifest (if any) and loads every bucket it
    /// lists, adaptive buckets left unloaded until first access.
    pub async fn setup(cache_dir: PathBuf, settings: &Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&cache_dir).await?;
        let manifest = read_manifest(&cache_dir).await?;
        let buckets = DashMap::new();

        for entry in manifest.caches {
            let bucket = Arc::new(CacheBucket::new(
                entry.identifier.clone(),
                cache_dir.join(format!("{}_cache", entry.identifier)),
            ));
            if !entry.adaptive_load {
                bucket.load_data(settings).await?;
            }
            buckets.insert(entry.identifier, bucket);
        }

        info!(count = buckets.len(), "cache manager restored from manifest");
        Ok(Self { cache_dir, buckets })
    }

    pub fn get_cache(&self, name: &str) -> Option<Arc<CacheBucket>> {
        self.buckets.get(name).map(|e| e.clone())
    }

    pub fn contains_cache(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    pub async fn create_cache(&self, name: &str, settings: &Settings) -> Result<Arc<CacheBucket>> {
        if self.buckets.contains_key(name) {
            return Err(ErrorKind::already_exists(format!("cache bucket {name}")));
        }
        let bucket = Arc::new(CacheBucket::new(
            name.to_string(),
            self.cache_dir.join(format!("{name}_cache")),
        ));
        bucket.load_data(settings).await?;
        self.buckets.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    pub async fn delete_cache(&self, name: &str) -> Result<()> {
        let (_, bucket) = self
            .buckets
            .remove(name)
            .ok_or_else(|| ErrorKind::not_found(format!("cache bucket {name}")))?;
        bucket.unload_data(true, false, true).await?;
        Ok(())
    }

    /// Sweeps every loaded bucket's expired entries. Run by the
    /// `MaintenanceScheduler`'s cache-sweep task.
    pub async fn sweep_all(&self, now_millis: i64) -> usize {
        let mut total = 0;
        for entry in self.buckets.iter() {
            total += entry.value().sweep_expired(now_millis).await;
        }
        total
    }

    /// Writes the manifest, then asks every bucket to flush and unload.
    pub async fn shutdown(&self) -> Result<()> {
        let manifest = Manifest {
            caches: self
                .buckets
                .iter()
                .map(|e| ManifestEntry {
                    identifier: e.key().clone(),
                    adaptive_load: true,
                })
                .collect(),
        };
        write_manifest(&self.cache_dir, &manifest).await?;

        for entry in self.buckets.iter() {
            if let Err(e) = entry.value().unload_data(true, true, false).await {
                warn!(bucket = %entry.key(), error = %e, "failed to flush cache bucket on shutdown");
            }
        }
        Ok(())
    }
}

async fn read_manifest(cache_dir: &std::path::Path) -> Result<Manifest> {
    let path = cache_dir.join(MANIFEST_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_manifest(cache_dir: &std::path::Path, manifest: &Manifest) -> Result<()> {
    let raw = serde_json::to_string_pretty(manifest)?;
    tokio::fs::write(cache_dir.join(MANIFEST_FILE), raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_get_delete_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let manager = CacheManager::setup(dir.path().to_path_buf(), &settings).await.unwrap();

        let bucket = manager.create_cache("sessions", &settings).await.unwrap();
        bucket
            .insert(
                crate::entry::CachedEntry {
                    cache_identifier: "sessions".into(),
                    identifier: "s1".into(),
                    valid_until: -1,
                    data: json!({"v": 1}),
                },
                0,
            )
            .await
            .unwrap();

        assert!(manager.contains_cache("sessions"));
        assert!(manager.get_cache("sessions").is_some());

        manager.delete_cache("sessions").await.unwrap();
        assert!(!manager.contains_cache("sessions"));
    }

    #[tokio::test]
    async fn create_cache_rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let manager = CacheManager::setup(dir.path().to_path_buf(), &settings).await.unwrap();
        manager.create_cache("sessions", &settings).await.unwrap();

        let err = manager.create_cache("sessions", &settings).await.unwrap_err();
        assert!(matches!(err, ErrorKind::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn shutdown_then_setup_restores_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        {
            let manager = CacheManager::setup(dir.path().to_path_buf(), &settings).await.unwrap();
            manager.create_cache("sessions", &settings).await.unwrap();
            manager.shutdown().await.unwrap();
        }

        let restored = CacheManager::setup(dir.path().to_path_buf(), &settings).await.unwrap();
        assert!(restored.contains_cache("sessions"));
    }
}
