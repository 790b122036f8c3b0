//! `Registry`: the process-wide container of databases and caches
//! (spec.md §4.1).
//!
//! Lifecycle `{new -> setup -> ready -> shutdown}`. The registry is the
//! only component allowed to create top-level names: database and cache
//! creation go through `create_lock`, a single lock serialising mutation of
//! the top-level mapping, while reads (`get_database`, `get_cache`) stay
//! lock-free against the underlying `DashMap`s, matching the "read
//! operations are lock-free" contract in spec.md §4.1.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jstorage_cache::CacheManager;
use jstorage_core::{Collaborators, ErrorKind, Result, Settings};
use jstorage_crypt::CryptTool;
use jstorage_notify::NotificationBus;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::database::{Database, DatabaseManifest};

const MANIFEST_FILE: &str = "registry";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryManifest {
    pub databases: Vec<RegistryDatabaseEntry>,
    pub caches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDatabaseEntry {
    pub name: String,
    pub encrypted: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    New = 0,
    Ready = 1,
    ShutDown = 2,
}

/// Singleton constructed once per process and threaded down to every
/// `Database`/`Table`/`Shard` it builds, carrying the collaborators and
/// the single `CryptTool`/`NotificationBus` instance process-wide
/// (spec.md §9: no ambient globals).
pub struct Registry {
    settings: Settings,
    collaborators: Collaborators,
    crypt: Arc<CryptTool>,
    notify: Arc<NotificationBus>,
    databases: DashMap<String, Arc<Database>>,
    cache_manager: tokio::sync::OnceCell<Arc<CacheManager>>,
    create_lock: Mutex<()>,
    state: AtomicU8,
}

impl Registry {
    pub fn new(settings: Settings, collaborators: Collaborators, crypt: Arc<CryptTool>, notify: Arc<NotificationBus>) -> Self {
        Self {
            settings,
            collaborators,
            crypt,
            notify,
            databases: DashMap::new(),
            cache_manager: tokio::sync::OnceCell::new(),
            create_lock: Mutex::new(()),
            state: AtomicU8::new(RegistryState::New as u8),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Exposed for the maintenance scheduler, which needs the clock to
    /// timestamp idle-unload/sweep decisions without its own `Collaborators`.
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn notify(&self) -> &Arc<NotificationBus> {
        &self.notify
    }

    pub fn crypt_tool(&self) -> &Arc<CryptTool> {
        &self.crypt
    }

    /// `Some` only once the crypt tool has an active key, matching the
    /// `Option<&CryptTool>` shape every shard/cache load and unload call
    /// expects (spec.md §4.9: absent crypt means "read/write plaintext").
    pub fn crypt(&self) -> Option<&CryptTool> {
        self.crypt.is_ready().then_some(self.crypt.as_ref())
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        self.cache_manager.get().expect("Registry::setup must run before cache_manager is used")
    }

    fn is_ready(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RegistryState::Ready as u8
    }

    /// Reads `./jstorage/config/registry` to learn which database and
    /// cache-bucket names exist, then reconstructs each database's table
    /// index from its own `<db>_settings` manifest. A missing top-level
    /// manifest means this is the first run: an empty registry.
    pub async fn setup(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.settings.config_dir()).await?;
        tokio::fs::create_dir_all(self.settings.db_data_dir()).await?;
        tokio::fs::create_dir_all(self.settings.cache_data_dir()).await?;

        let manifest = read_manifest(&self.settings.config_dir()).await?;

        for entry in &manifest.databases {
            let dir = self.settings.db_data_dir().join(&entry.name);
            let database = Arc::new(Database::new(entry.name.clone(), dir.clone(), self.collaborators.clone(), self.notify.clone()));
            database.set_encryption(entry.encrypted, &self.crypt).unwrap_or_else(|e| {
                warn!(database = %entry.name, error = %e, "could not re-apply encryption flag at setup; leaving plaintext");
            });

            let settings_path = dir.join(format!("{}_settings", entry.name));
            match tokio::fs::read_to_string(&settings_path).await {
                Ok(raw) => {
                    let db_manifest: DatabaseManifest = serde_json::from_str(&raw)?;
                    database.restore(&db_manifest.tables, &self.settings, self.crypt()).await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            self.databases.insert(entry.name.clone(), database);
        }

        let cache_manager = CacheManager::setup(self.settings.cache_data_dir(), &self.settings).await?;
        self.cache_manager
            .set(Arc::new(cache_manager))
            .map_err(|_| ErrorKind::Unknown { what: "Registry::setup called more than once".into() })?;

        self.state.store(RegistryState::Ready as u8, Ordering::SeqCst);
        info!(databases = manifest.databases.len(), "registry setup complete");
        Ok(())
    }

    /// `Registry.resolve(database, table?)` (spec.md §6): the external
    /// collaborators' entry point for turning names into live handles.
    pub fn resolve(&self, database: &str, table: Option<&str>) -> Result<(Arc<Database>, Option<Arc<crate::table::Table>>)> {
        if !self.is_ready() {
            return Err(ErrorKind::not_ready("registry is not ready"));
        }
        let db = self
            .get_database(database)
            .ok_or_else(|| ErrorKind::not_found(format!("database {database}")))?;
        let table = match table {
            None => None,
            Some(name) => Some(
                db.get_table(name)
                    .ok_or_else(|| ErrorKind::not_found(format!("table {name} in database {database}")))?,
            ),
        };
        Ok((db, table))
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).map(|e| e.clone())
    }

    pub fn contains_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|e| e.key().clone()).collect()
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        if !self.is_ready() {
            return Err(ErrorKind::not_ready("registry is not ready"));
        }
        let _guard = self.create_lock.lock().await;
        if self.databases.contains_key(name) {
            return Err(ErrorKind::already_exists(format!("database {name}")));
        }
        let dir = self.settings.db_data_dir().join(name);
        tokio::fs::create_dir_all(&dir).await?;
        let database = Arc::new(Database::new(name.to_string(), dir, self.collaborators.clone(), self.notify.clone()));
        self.databases.insert(name.to_string(), database.clone());
        Ok(database)
    }

    pub async fn delete_database(&self, name: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(ErrorKind::not_ready("registry is not ready"));
        }
        let _guard = self.create_lock.lock().await;
        let (_, database) = self
            .databases
            .remove(name)
            .ok_or_else(|| ErrorKind::not_found(format!("database {name}")))?;
        database.delete().await;
        Ok(())
    }

    /// Writes the top-level manifest (database names + encryption flags,
    /// cache-bucket names), then asks every database and the cache manager
    /// to flush and unload (spec.md §4.1).
    pub async fn shutdown(&self) -> Result<()> {
        let mut db_entries = Vec::new();
        for entry in self.databases.iter() {
            let database = entry.value();
            database.shutdown(&self.settings, self.crypt()).await?;
            write_database_settings(database).await?;
            db_entries.push(RegistryDatabaseEntry {
                name: database.name().to_string(),
                encrypted: database.is_encrypted(),
            });
        }

        // CacheManager persists its own `cachemanager` manifest (spec.md §6)
        // independently of the registry's top-level one.
        if let Some(cache_manager) = self.cache_manager.get() {
            cache_manager.shutdown().await?;
        }

        let manifest = RegistryManifest {
            databases: db_entries,
            caches: Vec::new(),
        };
        write_manifest(&self.settings.config_dir(), &manifest).await?;

        self.state.store(RegistryState::ShutDown as u8, Ordering::SeqCst);
        info!("registry shutdown complete");
        Ok(())
    }
}

async fn write_database_settings(database: &Database) -> Result<()> {
    let manifest = DatabaseManifest {
        database: database.name().to_string(),
        encrypted: database.is_encrypted(),
        tables: database.table_names(),
    };
    let raw = serde_json::to_string_pretty(&manifest)?;
    let dir = database.dir().to_path_buf();
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(format!("{}_settings", database.name())), raw).await?;
    Ok(())
}

async fn read_manifest(config_dir: &std::path::Path) -> Result<RegistryManifest> {
    let path = config_dir.join(MANIFEST_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryManifest::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_manifest(config_dir: &std::path::Path, manifest: &RegistryManifest) -> Result<()> {
    tokio::fs::create_dir_all(config_dir).await?;
    let raw = serde_json::to_string_pretty(manifest)?;
    tokio::fs::write(config_dir.join(MANIFEST_FILE), raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::SecureRandom;
    use jstorage_core::SystemClock;

    fn test_settings(root: &std::path::Path) -> Settings {
        let mut s = Settings::default();
        s.root_dir = root.to_path_buf();
        s
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            clock: Arc::new(SystemClock),
            random: Arc::new(SecureRandom::default()),
        }
    }

    #[tokio::test]
    async fn fresh_registry_setup_is_empty_and_ready() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let notify = NotificationBus::new(16);
        let registry = Registry::new(settings, collaborators(), Arc::new(CryptTool::new()), notify);
        registry.setup().await.unwrap();
        assert!(registry.database_names().is_empty());
        assert!(registry.is_ready());
    }

    #[tokio::test]
    async fn create_database_then_shutdown_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let notify = NotificationBus::new(16);
        let registry = Registry::new(settings.clone(), collaborators(), Arc::new(CryptTool::new()), notify.clone());
        registry.setup().await.unwrap();

        let db = registry.create_database("blog").await.unwrap();
        db.insert_table("posts", &settings).unwrap();
        registry.shutdown().await.unwrap();

        let registry2 = Registry::new(settings, collaborators(), Arc::new(CryptTool::new()), notify);
        registry2.setup().await.unwrap();
        assert!(registry2.contains_database("blog"));
        let restored = registry2.get_database("blog").unwrap();
        assert!(restored.contains_table("posts"));
    }

    #[tokio::test]
    async fn create_database_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let notify = NotificationBus::new(16);
        let registry = Registry::new(settings, collaborators(), Arc::new(CryptTool::new()), notify);
        registry.setup().await.unwrap();
        registry.create_database("blog").await.unwrap();
        let err = registry.create_database("blog").await.unwrap_err();
        assert!(matches!(err, ErrorKind::AlreadyExists { .. }));
    }
}
