//! The storage core: `DataSet`, `Shard`, `Table`, `Database`, and the
//! top-level `Registry` that owns them (spec.md §4.1-§4.5).
//!
//! The three-level naming hierarchy is Database → Table → DataSet; a
//! `Table` additionally owns the `Shard` pool its records are paged
//! through. Everything in this crate is reached through a `Registry`
//! constructed once per process and threaded down, rather than through
//! ambient singletons (spec.md §9).

mod database;
mod dataset;
mod file_format;
mod registry;
mod shard;
mod structure;
mod table;

pub use database::{Database, DatabaseManifest};
pub use dataset::DataSet;
pub use registry::{Registry, RegistryManifest};
pub use shard::{Shard, ShardStatus};
pub use structure::matches_structure;
pub use table::{ResolveMode, ShardManifestEntry, Table, TableManifest};
