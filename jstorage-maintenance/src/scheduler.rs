//! `MaintenanceScheduler`: the four periodic background tasks that keep a
//! running registry healthy without an external caller driving them
//! (spec.md §4.10/§9): adaptive shard idle-unload, periodic shard
//! snapshotting, cache-bucket TTL sweeping, and notification heartbeats.
//!
//! Each task is a `tokio::spawn` + `tokio::time::interval` loop, selecting
//! against a shared `tokio_util::sync::CancellationToken` so `stop()` is a
//! single cancellation rather than a race between a flag write and the next
//! `interval.tick()`.

use std::sync::Arc;
use std::sync::Mutex;

use jstorage_crypt::CryptTool;
use jstorage_storage::Registry;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MaintenanceScheduler {
    registry: Arc<Registry>,
    cancellation: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            cancellation: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the four tasks. Calling `start` twice spawns a second set of
    /// tasks sharing the same cancellation token, so callers should only
    /// call it once per scheduler, matching `NotificationBus::start`'s own
    /// single-use contract.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("maintenance scheduler handles mutex poisoned");
        handles.push(self.spawn_idle_unload());
        handles.push(self.spawn_snapshot_sweep());
        handles.push(self.spawn_cache_sweep());
        handles.push(self.spawn_heartbeat());
        info!("maintenance scheduler started");
    }

    /// Cancels every task and waits for them to observe it. Idempotent.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("maintenance scheduler handles mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "maintenance task panicked during shutdown");
            }
        }
        info!("maintenance scheduler stopped");
    }

    /// Adaptive tables' shards past `idle_unload_after` since their last
    /// access are saved and unloaded, freeing their in-memory `DataSet`s
    /// (spec.md §8 scenario 3).
    fn spawn_idle_unload(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let cancellation = self.cancellation.clone();
        let threshold_millis = registry.settings().idle_unload_after.as_millis() as i64;
        let mut tick = interval(registry.settings().idle_unload_after / 4);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = registry.collaborators().clock.now_millis();
                for database in registry.databases() {
                    let crypt = database_crypt(&registry, &database);
                    for table_name in database.table_names() {
                        let Some(table) = database.get_table(&table_name) else { continue };
                        if !table.is_adaptive() {
                            continue;
                        }
                        for shard in table.shards().await {
                            if shard.status().await != jstorage_storage::ShardStatus::Ready {
                                continue;
                            }
                            if now - shard.last_access().await < threshold_millis {
                                continue;
                            }
                            if let Err(e) = shard.unload_data(true, true, false, crypt, database.is_encrypted()).await {
                                warn!(shard = %shard.id(), error = %e, "idle-unload failed");
                            } else {
                                debug!(shard = %shard.id(), table = %table_name, "shard idle-unloaded");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Every loaded shard is periodically saved (not unloaded) so a crash
    /// loses at most one snapshot interval of mutations.
    fn spawn_snapshot_sweep(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let cancellation = self.cancellation.clone();
        let mut tick = interval(registry.settings().snapshot_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tick.tick() => {}
                }
                for database in registry.databases() {
                    let crypt = database_crypt(&registry, &database);
                    for table_name in database.table_names() {
                        let Some(table) = database.get_table(&table_name) else { continue };
                        for shard in table.shards().await {
                            if shard.status().await != jstorage_storage::ShardStatus::Ready {
                                continue;
                            }
                            if let Err(e) = shard.unload_data(false, true, false, crypt, database.is_encrypted()).await {
                                warn!(shard = %shard.id(), error = %e, "periodic snapshot failed");
                            }
                        }
                    }
                }
                debug!("periodic shard snapshot sweep complete");
            }
        })
    }

    /// Sweeps every loaded cache bucket's expired entries.
    fn spawn_cache_sweep(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let cancellation = self.cancellation.clone();
        let mut tick = interval(registry.settings().cache_sweep_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = registry.collaborators().clock.now_millis();
                let swept = registry.cache_manager().sweep_all(now).await;
                if swept > 0 {
                    debug!(swept, "cache sweep removed expired entries");
                }
            }
        })
    }

    /// Emits a notification-bus heartbeat every `heartbeat_interval`
    /// (spec.md §4.7: fixed at 2 seconds).
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let cancellation = self.cancellation.clone();
        let mut tick = interval(registry.settings().heartbeat_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = registry.collaborators().clock.now_millis();
                registry.notify().emit_heartbeat(now);
            }
        })
    }
}

fn database_crypt<'a>(registry: &'a Registry, database: &jstorage_storage::Database) -> Option<&'a CryptTool> {
    if database.is_encrypted() {
        registry.crypt()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::SecureRandom;
    use jstorage_core::{Collaborators, SystemClock};
    use jstorage_notify::NotificationBus;

    async fn test_registry(root: &std::path::Path) -> Arc<Registry> {
        let mut settings = jstorage_core::Settings::default();
        settings.root_dir = root.to_path_buf();
        settings.heartbeat_interval = std::time::Duration::from_millis(20);
        settings.cache_sweep_interval = std::time::Duration::from_millis(20);
        settings.snapshot_interval = std::time::Duration::from_millis(20);
        settings.idle_unload_after = std::time::Duration::from_millis(80);

        let collaborators = Collaborators {
            clock: Arc::new(SystemClock),
            random: Arc::new(SecureRandom::default()),
        };
        let notify = NotificationBus::new(16);
        notify.start();
        let registry = Arc::new(Registry::new(settings, collaborators, Arc::new(CryptTool::new()), notify));
        registry.setup().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn start_and_stop_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let scheduler = MaintenanceScheduler::new(registry);
        scheduler.start();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_reaches_subscribed_listener() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let mut handle = registry
            .notify()
            .subscribe(jstorage_core::UserRef("watcher".into()), std::collections::HashMap::new());

        let scheduler = MaintenanceScheduler::new(registry);
        scheduler.start();

        let event = tokio::time::timeout(std::time::Duration::from_millis(200), handle.next())
            .await
            .expect("heartbeat should arrive within timeout")
            .unwrap();
        assert!(matches!(event.kind, jstorage_core::MutationKind::Heartbeat));

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn idle_shard_gets_unloaded_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;

        let db = registry.create_database("blog").await.unwrap();
        let settings = registry.settings().clone();
        let table = db.insert_table("posts", &settings).unwrap();
        table
            .insert_data_set(
                jstorage_storage::DataSet::new("blog", "posts", "p1", 0),
                &settings,
                registry.crypt(),
            )
            .await
            .unwrap();

        let scheduler = MaintenanceScheduler::new(registry.clone());
        scheduler.start();
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        scheduler.stop().await;

        let shards = table.shards().await;
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].status().await, jstorage_storage::ShardStatus::Unloaded);
    }
}
