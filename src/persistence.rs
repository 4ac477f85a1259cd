//! Peer identity persistence.
//!
//! Only what is needed to recreate a peer after a restart is stored: its host, its
//! port and its role. [`FileStore`] keeps all identities in one MessagePack file
//! that is rewritten through a temporary file on every change.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::registry::{PeerRecord, PeerRole};
use crate::{ClusterError, Result};

/// Stored identity of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Host name.
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Role of the peer.
    pub role: PeerRole,
    /// Unix time of the last save.
    pub modified: u64,
}

impl PeerIdentity {
    /// Identity of a registry record, or `None` if it has no role data yet.
    pub fn of(record: &PeerRecord) -> Option<Self> {
        let role = record.role()?.kind.role();
        Some(Self {
            host: record.host().to_string(),
            port: record.port(),
            role,
            modified: record.modified(),
        })
    }

    fn key(&self) -> (String, u16) {
        (self.host.to_ascii_lowercase(), self.port)
    }
}

/// Load/save/delete contract for peer identities.
pub trait PeerStore: Send + Sync + fmt::Debug {
    /// Loads the identity stored for `(host, port)`.
    fn load(&self, host: &str, port: u16) -> Result<Option<PeerIdentity>>;

    /// Loads every stored identity.
    fn load_all(&self) -> Result<Vec<PeerIdentity>>;

    /// Stores `identity`, replacing an existing entry for the same host and port.
    fn save(&self, identity: &PeerIdentity) -> Result<()>;

    /// Removes the identity for `(host, port)`. Removing a missing entry succeeds.
    fn delete(&self, host: &str, port: u16) -> Result<()>;
}

type Table = BTreeMap<(String, u16), PeerIdentity>;

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Table>,
}

impl PeerStore for MemoryStore {
    fn load(&self, host: &str, port: u16) -> Result<Option<PeerIdentity>> {
        Ok(self
            .entries
            .lock()
            .get(&(host.to_ascii_lowercase(), port))
            .cloned())
    }

    fn load_all(&self) -> Result<Vec<PeerIdentity>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn save(&self, identity: &PeerIdentity) -> Result<()> {
        self.entries.lock().insert(identity.key(), identity.clone());
        Ok(())
    }

    fn delete(&self, host: &str, port: u16) -> Result<()> {
        self.entries.lock().remove(&(host.to_ascii_lowercase(), port));
        Ok(())
    }
}

/// Store backed by a single MessagePack file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store at `path`. The file is created on the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<Table> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Table::new()),
            Err(err) => return Err(ClusterError::Store(format!("{}: {err}", self.path.display()))),
        };
        let identities: Vec<PeerIdentity> = rmp_serde::from_slice(&bytes)?;
        Ok(identities
            .into_iter()
            .map(|identity| (identity.key(), identity))
            .collect())
    }

    fn write_table(&self, table: &Table) -> Result<()> {
        let identities: Vec<&PeerIdentity> = table.values().collect();
        let bytes = rmp_serde::to_vec_named(&identities)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|err| ClusterError::Store(format!("{}: {err}", self.path.display())))?;
        trace!(path = %self.path.display(), peers = identities.len(), "wrote peer store");
        Ok(())
    }
}

impl PeerStore for FileStore {
    fn load(&self, host: &str, port: u16) -> Result<Option<PeerIdentity>> {
        let _guard = self.lock.lock();
        Ok(self.read_table()?.remove(&(host.to_ascii_lowercase(), port)))
    }

    fn load_all(&self) -> Result<Vec<PeerIdentity>> {
        let _guard = self.lock.lock();
        Ok(self.read_table()?.into_values().collect())
    }

    fn save(&self, identity: &PeerIdentity) -> Result<()> {
        let _guard = self.lock.lock();
        let mut table = self.read_table()?;
        let updated = table.insert(identity.key(), identity.clone()).is_some();
        self.write_table(&table)?;
        debug!(host = %identity.host, port = identity.port, updated, "saved peer identity");
        Ok(())
    }

    fn delete(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.lock.lock();
        let mut table = self.read_table()?;
        if table.remove(&(host.to_ascii_lowercase(), port)).is_some() {
            self.write_table(&table)?;
        }
        Ok(())
    }
}
