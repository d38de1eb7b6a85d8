// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use cache::JsonStore;
use chrono::{DateTime, Utc};
use protocol::ResourceKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::os::{self, ProcessTable};

pub const REGISTRY_VERSION: &str = "1.0";

/// Grace period for orphans asked to exit with SIGTERM.
const ORPHAN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Running,
    Stopped,
    /// The pid is alive but does not look like a backend.
    Unknown,
}

/// A backend process as recorded on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub resource_key: ResourceKey,
    pub pid: u32,
    pub backend_id: String,
    pub backend_name: String,
    pub weights_path: PathBuf,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub command_line: String,
    pub status: EntryStatus,
}

/// On-disk document.
#[derive(Debug, Serialize)]
struct RegistryDocument<'a> {
    version: &'static str,
    last_updated: DateTime<Utc>,
    processes: BTreeMap<String, &'a RegistryEntry>,
}

/// Durable map from resource key to the backend process serving it.
///
/// The file is rewritten (atomically, via [`JsonStore`]) after every
/// mutation before the call returns. On open, a missing or corrupt file is
/// an empty registry, and a corrupt entry only loses that entry.
pub struct ProcessRegistry {
    store: JsonStore,
    table: Arc<dyn ProcessTable>,
    executable_name: String,
    entries: Mutex<BTreeMap<ResourceKey, RegistryEntry>>,
}

impl ProcessRegistry {
    pub fn open(store: JsonStore, table: Arc<dyn ProcessTable>, executable_name: impl Into<String>) -> Self {
        let entries = load_entries(&store);
        info!("loaded {} entries from {}", entries.len(), store.path().display());
        Self {
            store,
            table,
            executable_name: executable_name.into(),
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, RegistryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("entries lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Write the document while the caller still holds the entries lock, so
    /// concurrent mutations reach the file in the order they were applied.
    fn persist(&self, entries: &BTreeMap<ResourceKey, RegistryEntry>) -> Result<()> {
        let doc = RegistryDocument {
            version: REGISTRY_VERSION,
            last_updated: Utc::now(),
            processes: entries.iter().map(|(k, v)| (k.to_string(), v)).collect(),
        };
        self.store.save(&doc)
    }

    /// Location of the persisted registry document.
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn executable_name(&self) -> &str {
        &self.executable_name
    }

    /// Record (or overwrite) the entry for `entry.resource_key`.
    pub fn register(&self, entry: RegistryEntry) -> Result<()> {
        let mut entries = self.lock();
        info!(
            "register {} -> pid={} backend_id={} port={}",
            entry.resource_key, entry.pid, entry.backend_id, entry.port
        );
        entries.insert(entry.resource_key.clone(), entry);
        self.persist(&entries)
    }

    /// Remove the entry for `key`; no-op when absent.
    pub fn unregister(&self, key: &ResourceKey) -> Result<()> {
        let mut entries = self.lock();
        if entries.remove(key).is_none() {
            return Ok(());
        }
        info!("unregister {}", key);
        self.persist(&entries)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<RegistryEntry> {
        self.lock().get(key).cloned()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().values().cloned().collect()
    }

    /// Update only the status field of an entry, if present.
    pub fn set_status(&self, key: &ResourceKey, status: EntryStatus) -> Result<()> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };
        if entry.status == status {
            return Ok(());
        }
        entry.status = status;
        self.persist(&entries)
    }

    fn check(&self, entry: &RegistryEntry) -> EntryStatus {
        if !self.table.is_alive(entry.pid) {
            warn!("pid={} for {} is not running", entry.pid, entry.resource_key);
            return EntryStatus::Stopped;
        }
        match self.table.name_of(entry.pid) {
            Some(name) if os::name_matches(&name, &self.executable_name) => EntryStatus::Running,
            Some(name) => {
                warn!(
                    "pid={} for {} is {:?}, not {}; assuming pid reuse",
                    entry.pid, entry.resource_key, name, self.executable_name
                );
                EntryStatus::Unknown
            }
            None => EntryStatus::Stopped,
        }
    }

    /// Whether the recorded process for `key` is alive and looks like a
    /// backend. The entry's status is updated and persisted.
    pub fn verify(&self, key: &ResourceKey) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get(key).cloned() else {
            return false;
        };
        let status = self.check(&entry);
        if status != entry.status {
            if let Some(e) = entries.get_mut(key) {
                e.status = status;
            }
            if let Err(e) = self.persist(&entries) {
                warn!("failed to persist verification of {}: {e:#}", key);
            }
        }
        status == EntryStatus::Running
    }

    pub fn verify_all(&self) -> BTreeMap<ResourceKey, bool> {
        let keys: Vec<ResourceKey> = self.lock().keys().cloned().collect();
        keys.into_iter()
            .map(|key| {
                let ok = self.verify(&key);
                (key, ok)
            })
            .collect()
    }

    /// Pids of processes named like `executable_name` that no entry records.
    pub fn find_orphans(&self, executable_name: &str) -> Vec<u32> {
        let registered: HashSet<u32> = self.lock().values().map(|e| e.pid).collect();
        let own = std::process::id();
        let mut orphans: Vec<u32> = self
            .table
            .list()
            .into_iter()
            .filter(|p| p.pid != own && !registered.contains(&p.pid))
            .filter(|p| os::name_matches(&p.name, executable_name))
            .map(|p| p.pid)
            .collect();
        orphans.sort_unstable();
        debug!("orphans for {}: {:?}", executable_name, orphans);
        orphans
    }

    /// Terminate every orphan of the configured executable; returns how many
    /// were terminated. With `force` orphans are killed without SIGTERM.
    /// A failure on one process does not stop the batch.
    pub async fn cleanup_orphans(&self, force: bool) -> usize {
        let orphans = self.find_orphans(&self.executable_name);
        let mut terminated = 0;
        for pid in orphans {
            if os::terminate_pid(&*self.table, pid, force, ORPHAN_GRACE).await {
                terminated += 1;
            } else {
                warn!("failed to terminate orphan pid={}", pid);
            }
        }
        if terminated > 0 {
            info!("cleaned up {} orphan process(es)", terminated);
        }
        terminated
    }
}

/// Tolerant load: a bad document is empty, a bad entry is skipped.
fn load_entries(store: &JsonStore) -> BTreeMap<ResourceKey, RegistryEntry> {
    let mut entries = BTreeMap::new();
    let value = match store.load_value() {
        Ok(Some(value)) => value,
        Ok(None) => return entries,
        Err(e) => {
            warn!("ignoring unreadable registry: {e:#}");
            return entries;
        }
    };

    let Some(processes) = value.get("processes").and_then(|p| p.as_object()) else {
        warn!("registry document has no processes map; starting empty");
        return entries;
    };

    for (raw_key, raw_entry) in processes {
        let key = match ResourceKey::parse(raw_key) {
            Ok(key) => key,
            Err(e) => {
                warn!("skipping entry: {e}");
                continue;
            }
        };
        match serde_json::from_value::<RegistryEntry>(raw_entry.clone()) {
            Ok(mut entry) => {
                entry.resource_key = key.clone();
                entries.insert(key, entry);
            }
            Err(e) => warn!("skipping corrupt entry {}: {e}", raw_key),
        }
    }
    entries
}
