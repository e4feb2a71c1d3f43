//! Content-addressed cache with append-only history.
//!
//! The store is durable state: it outlives individual runs and is the only
//! thing mutated across concurrent target executions. Both implementations
//! lock per operation and insert append-only, keyed by target identity; the
//! scheduler guarantees at most one writer per identity per run. The store
//! is always an explicit object handed to the pipeline, never a global.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::StoreError;
use crate::value::Value;

/// The recorded fingerprint of a target's last successful build, kept with
/// the components it was derived from so individual triggers can compare
/// their own slice. Never mutated in place; a rebuild supersedes it whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub fingerprint: Hash32,
    pub command: Hash32,
    pub deps: BTreeMap<String, Hash32>,
    pub files: BTreeMap<String, Option<Hash32>>,
    pub seed: Option<u64>,
    pub args: Hash32,
    pub change: Option<Hash32>,
}

/// One entry per build attempt, for provenance and debugging. Append-only;
/// removed only by garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub fingerprint: Hash32,
    /// Unix-epoch seconds at build start.
    pub timestamp: u64,
    pub duration_ms: u64,
    /// Literal argument values the command received.
    pub args: Vec<Value>,
}

impl HistoryRecord {
    pub(crate) fn new(fingerprint: Hash32, duration_ms: u64, args: Vec<Value>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            fingerprint,
            timestamp,
            duration_ms,
            args,
        }
    }
}

/// Persisted state interface. `put` stores the value, its record and the
/// history entry under one lock so readers never observe a half-written
/// target.
pub trait ContentStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Value>, StoreError>;
    fn record(&self, name: &str) -> Result<Option<TargetRecord>, StoreError>;
    fn put(
        &self,
        name: &str,
        record: TargetRecord,
        value: Value,
        history: HistoryRecord,
    ) -> Result<(), StoreError>;
    fn history(&self, name: &str) -> Result<Vec<HistoryRecord>, StoreError>;
    /// Remove every target not in `reachable`, including its history.
    /// Returns how many entries were collected.
    fn garbage_collect(&self, reachable: &HashSet<String>) -> Result<usize, StoreError>;
}

/// Bounded retry for store operations; after the attempts are exhausted the
/// caller escalates to an execution error for the affected target.
pub(crate) fn with_retries<T>(
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    const ATTEMPTS: usize = 3;

    let mut last = None;
    for _ in 0..ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => last = Some(err),
        }
    }

    Err(last.expect("at least one attempt ran"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    name: String,
    record: TargetRecord,
    value: Value,
    history: Vec<HistoryRecord>,
}

/// In-memory store, used for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentStore for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(name).map(|entry| entry.value.clone()))
    }

    fn record(&self, name: &str) -> Result<Option<TargetRecord>, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(name).map(|entry| entry.record.clone()))
    }

    fn put(
        &self,
        name: &str,
        record: TargetRecord,
        value: Value,
        history: HistoryRecord,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(name) {
            Some(entry) => {
                entry.record = record;
                entry.value = value;
                entry.history.push(history);
            }
            None => {
                entries.insert(name.to_string(), Entry {
                    name: name.to_string(),
                    record,
                    value,
                    history: vec![history],
                });
            }
        }

        Ok(())
    }

    fn history(&self, name: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(name)
            .map(|entry| entry.history.clone())
            .unwrap_or_default())
    }

    fn garbage_collect(&self, reachable: &HashSet<String>) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|name, _| reachable.contains(name));
        Ok(before - entries.len())
    }
}

/// On-disk store: one CBOR file per target under the root directory, named
/// by the hash of the target identity. Writes go through a temp file and a
/// rename, so a concurrent reader sees either the old entry or the new one.
pub struct DiskStore {
    root: Utf8PathBuf,
    lock: Mutex<()>,
}

impl DiskStore {
    pub fn new(root: impl AsRef<Utf8Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, name: &str) -> Utf8PathBuf {
        self.root
            .join(Hash32::hash(name.as_bytes()).to_hex())
            .with_extension("cbor")
    }

    fn read_entry(&self, path: &Utf8Path) -> Result<Option<Entry>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        ciborium::de::from_reader(bytes.as_slice())
            .map(Some)
            .map_err(|err| StoreError::Decode(err.to_string()))
    }

    fn write_entry(&self, path: &Utf8Path, entry: &Entry) -> Result<(), StoreError> {
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(entry, &mut buffer)
            .map_err(|err| StoreError::Encode(err.to_string()))?;

        let temp = path.with_extension("cbor.tmp");
        fs::write(&temp, &buffer)?;
        fs::rename(&temp, path)?;

        Ok(())
    }
}

impl ContentStore for DiskStore {
    fn get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.read_entry(&self.path_for(name))?.map(|e| e.value))
    }

    fn record(&self, name: &str) -> Result<Option<TargetRecord>, StoreError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.read_entry(&self.path_for(name))?.map(|e| e.record))
    }

    fn put(
        &self,
        name: &str,
        record: TargetRecord,
        value: Value,
        history: HistoryRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(name);

        let entry = match self.read_entry(&path)? {
            Some(mut entry) => {
                entry.record = record;
                entry.value = value;
                entry.history.push(history);
                entry
            }
            None => Entry {
                name: name.to_string(),
                record,
                value,
                history: vec![history],
            },
        };

        self.write_entry(&path, &entry)
    }

    fn history(&self, name: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let _guard = self.lock.lock().unwrap();
        Ok(self
            .read_entry(&self.path_for(name))?
            .map(|e| e.history)
            .unwrap_or_default())
    }

    fn garbage_collect(&self, reachable: &HashSet<String>) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let mut collected = 0;

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "cbor") {
                continue;
            }

            let Ok(path) = Utf8PathBuf::try_from(path) else {
                continue;
            };

            if let Some(stored) = self.read_entry(&path)?
                && !reachable.contains(&stored.name)
            {
                fs::remove_file(&path)?;
                collected += 1;
            }
        }

        Ok(collected)
    }
}
