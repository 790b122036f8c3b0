//! `Database`: owns a name→`Table` mapping and the at-rest encryption flag
//! that propagates to its shards (spec.md §4.2).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jstorage_core::{Collaborators, ErrorKind, Result, Settings};
use jstorage_crypt::CryptTool;
use jstorage_notify::NotificationBus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::table::{Table, TableManifest};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseManifest {
    pub database: String,
    pub encrypted: bool,
    pub tables: Vec<String>,
}

pub struct Database {
    name: String,
    dir: PathBuf,
    encrypted: Arc<AtomicBool>,
    secure_modifications: AtomicBool,
    tables: DashMap<String, Arc<Table>>,
    collaborators: Collaborators,
    notify: Arc<NotificationBus>,
}

impl Database {
    pub fn new(name: impl Into<String>, dir: PathBuf, collaborators: Collaborators, notify: Arc<NotificationBus>) -> Self {
        Self {
            name: name.into(),
            dir,
            encrypted: Arc::new(AtomicBool::new(false)),
            secure_modifications: AtomicBool::new(false),
            tables: DashMap::new(),
            collaborators,
            notify,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }

    pub fn secure_modifications(&self) -> bool {
        self.secure_modifications.load(Ordering::SeqCst)
    }

    pub fn set_secure_modifications(&self, secure: bool) {
        self.secure_modifications.store(secure, Ordering::SeqCst);
    }

    /// `setEncryption(bool)`. Fails `CryptNotReady` unless `crypt` has
    /// already been initialised with a password. Does not rewrite existing
    /// shard files; the change is a lazy migration that takes effect the
    /// next time each shard loads and unloads (spec.md §4.2).
    pub fn set_encryption(&self, enabled: bool, crypt: &CryptTool) -> Result<()> {
        if enabled && !crypt.is_ready() {
            return Err(ErrorKind::CryptNotReady {
                what: "crypt tool has no password set yet".into(),
            });
        }
        self.encrypted.store(enabled, Ordering::SeqCst);
        info!(database = %self.name, enabled, "encryption flag changed; takes effect on next shard load/unload cycle");
        Ok(())
    }

    /// Convenience dispatch for `dataType`-level CRUD: looks up `table`,
    /// then delegates to it, threading this database's `secureModifications`
    /// flag through so callers never juggle it themselves (spec.md §4.2).
    pub async fn get_data_type(
        &self,
        table: &str,
        id: &str,
        data_type: &str,
        request_token: bool,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<serde_json::Value> {
        self.require_table(table)?.get_data_type(id, data_type, request_token, settings, crypt).await
    }

    pub async fn insert_data_type(
        &self,
        table: &str,
        id: &str,
        data_type: &str,
        value: Option<serde_json::Value>,
        origin: Option<jstorage_core::UserRef>,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        self.require_table(table)?.insert_data_type(id, data_type, value, origin, settings, crypt).await
    }

    pub async fn update_data_type(
        &self,
        table: &str,
        id: &str,
        data_type: &str,
        payload: serde_json::Value,
        origin: Option<jstorage_core::UserRef>,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        self.require_table(table)?
            .update_data_type(id, data_type, payload, origin, self.secure_modifications(), settings, crypt)
            .await
    }

    pub async fn delete_data_type(
        &self,
        table: &str,
        id: &str,
        data_type: &str,
        origin: Option<jstorage_core::UserRef>,
        settings: &Settings,
        crypt: Option<&CryptTool>,
    ) -> Result<()> {
        self.require_table(table)?.delete_data_type(id, data_type, origin, settings, crypt).await
    }

    fn require_table(&self, name: &str) -> Result<Arc<Table>> {
        self.get_table(name).ok_or_else(|| ErrorKind::not_found(format!("table {name} in database {}", self.name)))
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(|e| e.clone())
    }

    pub fn insert_table(&self, name: &str, settings: &Settings) -> Result<Arc<Table>> {
        if self.tables.contains_key(name) {
            return Err(ErrorKind::already_exists(format!("table {name} in database {}", self.name)));
        }
        let table = Arc::new(Table::new(
            self.name.clone(),
            name.to_string(),
            self.dir.join(name),
            settings,
            self.collaborators.clone(),
            self.notify.clone(),
            self.encrypted.clone(),
        ));
        self.tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub async fn delete_table(&self, name: &str) -> Result<()> {
        let (_, table) = self
            .tables
            .remove(name)
            .ok_or_else(|| ErrorKind::not_found(format!("table {name} in database {}", self.name)))?;
        for shard in table.shards().await {
            shard.unload_data(true, false, true, None, false).await.ok();
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.dir.join(name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(database = %self.name, table = %name, error = %e, "failed to remove table directory");
            }
        }
        Ok(())
    }

    /// Cascading delete: every table is told to tear down, then the
    /// database directory is removed recursively. File-removal failures
    /// are logged, not propagated; the in-memory view is always cleared.
    pub async fn delete(&self) {
        let names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.delete_table(&name).await {
                warn!(database = %self.name, table = %name, error = %e, "error while cascading delete");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(database = %self.name, error = %e, "failed to remove database directory");
            }
        }
    }

    pub async fn shutdown(&self, settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        for entry in self.tables.iter() {
            let table = entry.value();
            for shard in table.shards().await {
                shard
                    .unload_data(true, true, false, crypt, self.is_encrypted())
                    .await?;
            }
            write_table_index(&self.dir, table).await?;
        }
        Ok(())
    }

    /// Re-creates `names` as empty tables (skipping ones already present),
    /// then loads each table's `<table>_index` manifest and shard pool.
    /// Driven by `Registry::setup` from the database's own `<db>_settings`
    /// file (spec.md §6: `{ database, encrypted, tables[] }`).
    pub async fn restore(&self, names: &[String], settings: &Settings, crypt: Option<&CryptTool>) -> Result<()> {
        for name in names {
            if !self.contains_table(name) {
                self.insert_table(name, settings)?;
            }
        }

        for entry in self.tables.iter() {
            let table = entry.value();
            let path = self.dir.join(format!("{}_index", table.name()));
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => {
                    let manifest: TableManifest = serde_json::from_str(&raw)?;
                    table.restore(&manifest, settings, crypt).await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }
}

async fn write_table_index(db_dir: &std::path::Path, table: &Table) -> Result<()> {
    let manifest = table.manifest().await;
    let raw = serde_json::to_string_pretty(&manifest)?;
    tokio::fs::write(db_dir.join(format!("{}_index", table.name())), raw).await?;
    Ok(())
}
