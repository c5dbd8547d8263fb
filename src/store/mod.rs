//! Persistence Adapter
//!
//! Typed tables for resource records, attributes, derived volumes, alert
//! states and the host network projection. All mutation goes through
//! [`Store::transaction`], which commits a working copy of the tables only
//! when the closure succeeds, and writes a JSON snapshot when the store is
//! file-backed.

mod tables;

pub use tables::{
    AlertKind, AlertStateRow, AlertSubject, LearnEventRow, LnetConfigurationRow,
    NetworkInterfaceRow, NidRow, PluginRow, ResourceClassRow, ResourceRecord, Tables,
    VolumeNodeRow, VolumeRow,
};

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Global identity of a persisted storage resource record
    RecordId
);
id_type!(
    /// Stable id of a registered resource class, unique by (module, class)
    ClassId
);
id_type!(
    /// Id of a derived Volume row
    VolumeId
);
id_type!(
    /// Id of a derived VolumeNode row
    VolumeNodeId
);
id_type!(
    /// Id of an alert state row
    AlertId
);

// =============================================================================
// Store
// =============================================================================

/// Transactional store over [`Tables`]
pub struct Store {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
}

impl Store {
    /// Create a store that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot_path: None,
        }
    }

    /// Open a file-backed store, loading the snapshot if one exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut tables: Tables = serde_json::from_str(&raw)?;
            tables.rebuild_indexes();
            info!(
                path = %path.display(),
                records = tables.records.len(),
                "Loaded store snapshot"
            );
            tables
        } else {
            info!(path = %path.display(), "No store snapshot found, starting empty");
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
        })
    }

    /// Run a read-only closure against the committed tables
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Run a closure against a working copy of the tables.
    ///
    /// The copy replaces the committed tables only if the closure returns
    /// `Ok` and the snapshot (if any) was written.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut guard = self.tables.write();
        let mut working = guard.clone();
        let result = f(&mut working)?;
        if let Some(path) = &self.snapshot_path {
            write_snapshot(path, &working)?;
        }
        *guard = working;
        Ok(result)
    }

    /// Snapshot path, if file-backed
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn write_snapshot(path: &Path, tables: &Tables) -> Result<()> {
    let data = serde_json::to_vec(tables)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data)
        .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Persistence(format!("rename {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), bytes = data.len(), "Wrote store snapshot");
    Ok(())
}
