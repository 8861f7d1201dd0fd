//! In-memory versioned store for single-node deployments and tests

use super::traits::{
    OpenStore, StorageResult, VersionedRecord, VersionedStore, WritePrecondition, WriteResult,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Namespace {
    records: BTreeMap<String, VersionedRecord>,
    /// Last version of each deleted key; a re-created key continues from it
    tombstones: BTreeMap<String, u64>,
}

/// Mutex-guarded map of namespaces.
///
/// The whole check-and-write of a conditional put happens under one lock,
/// which gives the same compare-and-swap guarantee a database row version
/// does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: Mutex<BTreeMap<String, Namespace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn precondition_holds(existing: Option<&VersionedRecord>, precondition: WritePrecondition) -> bool {
        match (precondition, existing) {
            (WritePrecondition::None, _) => true,
            (WritePrecondition::DoesNotExist, None) => true,
            (WritePrecondition::DoesNotExist, Some(_)) => false,
            (WritePrecondition::MatchesVersion(v), Some(rec)) => rec.version == v,
            (WritePrecondition::MatchesVersion(_), None) => false,
        }
    }
}

impl OpenStore for MemoryStore {
    /// Memory stores have no backing file; the path is ignored.
    fn open(_path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::new())
    }

    fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::new())
    }
}

impl VersionedStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<VersionedRecord>> {
        let namespaces = self.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        Ok(namespaces.get(namespace).and_then(|ns| ns.records.get(key)).cloned())
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult> {
        let mut namespaces = self.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        let ns = namespaces.entry(namespace.to_string()).or_default();
        let existing = ns.records.get(key);

        if !Self::precondition_holds(existing, precondition) {
            return Ok(WriteResult::PreconditionFailed {
                current_version: existing.map(|r| r.version),
            });
        }

        let previous = existing
            .map(|r| r.version)
            .or_else(|| ns.tombstones.get(key).copied())
            .unwrap_or(0);
        let version = previous + 1;
        ns.records.insert(
            key.to_string(),
            VersionedRecord {
                key: key.to_string(),
                value: value.to_string(),
                version,
                updated_at: Utc::now(),
            },
        );
        Ok(WriteResult::Success { version })
    }

    fn delete(
        &self,
        namespace: &str,
        key: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult> {
        let mut namespaces = self.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ns) = namespaces.get_mut(namespace) else {
            return Ok(WriteResult::PreconditionFailed { current_version: None });
        };
        let allowed = precondition != WritePrecondition::DoesNotExist
            && Self::precondition_holds(ns.records.get(key), precondition);
        let current_version = ns.records.get(key).map(|r| r.version);

        match current_version {
            Some(version) if allowed => {
                ns.records.remove(key);
                ns.tombstones.insert(key.to_string(), version);
                Ok(WriteResult::Success { version })
            }
            _ => Ok(WriteResult::PreconditionFailed { current_version }),
        }
    }

    fn list(&self, namespace: &str) -> StorageResult<Vec<VersionedRecord>> {
        let namespaces = self.namespaces.lock().unwrap_or_else(|e| e.into_inner());
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.records.values().cloned().collect())
            .unwrap_or_default())
    }
}
