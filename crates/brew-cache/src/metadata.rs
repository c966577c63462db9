use crate::clock::Timestamp;
use crate::error::Result;
use crate::key::ImageFormat;
use crate::util::{
    atomic_write, bincode_deserialize, bincode_serialize, read_file_limited,
    remove_file_best_effort,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Version of the metadata blob layout.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Default cap on records per registry. The blob is rewritten whole on every update, so
/// it must stay small.
pub const DEFAULT_MAX_METADATA_ENTRIES: usize = 256;

pub trait MetadataEntry: Clone + Serialize + DeserializeOwned + Send + 'static {
    /// Time used for staleness checks and for choosing eviction victims.
    fn timestamp(&self) -> Timestamp;
}

/// Last successful fetch of a structured-data kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub identity: String,
    pub timestamp: Timestamp,
}

impl MetadataEntry for DataRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Provenance of a cached image: where it came from, how fresh the upstream copy was,
/// and which file format it was stored in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub source_url: String,
    pub timestamp: Timestamp,
    pub format: ImageFormat,
}

impl MetadataEntry for ImageRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Result of reading the persisted blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Missing,
    Loaded { entries: usize },
    /// The blob was written by an older layout and was discarded.
    Incompatible,
    /// The blob could not be decoded and was deleted.
    Corrupted,
}

#[derive(Debug, Serialize)]
struct PersistedMetadata<'a, R> {
    schema_version: u32,
    entries: &'a BTreeMap<String, R>,
}

#[derive(Debug, Deserialize)]
struct PersistedMetadataOwned<R> {
    schema_version: u32,
    entries: BTreeMap<String, R>,
}

/// A key -> record table persisted as one `bincode` blob.
///
/// Updates are copy-on-write: the new table is written to disk first and only then
/// replaces the in-memory copy, so a failed save leaves both views unchanged.
#[derive(Debug)]
pub struct MetadataRegistry<R> {
    path: PathBuf,
    max_entries: usize,
    entries: Mutex<BTreeMap<String, R>>,
}

impl<R: MetadataEntry> MetadataRegistry<R> {
    /// Creates an empty registry. Nothing is read until [`Self::load`].
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> LoadOutcome {
        let mut entries = self.entries.lock();
        entries.clear();

        let Some(bytes) = read_file_limited(&self.path) else {
            return LoadOutcome::Missing;
        };

        let persisted: PersistedMetadataOwned<R> = match bincode_deserialize(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::warn!(
                    target = "brew.cache",
                    path = %self.path.display(),
                    error = %err,
                    "discarding corrupt cache metadata"
                );
                remove_file_best_effort(&self.path, "metadata.decode");
                return LoadOutcome::Corrupted;
            }
        };

        if persisted.schema_version != METADATA_SCHEMA_VERSION {
            remove_file_best_effort(&self.path, "metadata.schema_version");
            return LoadOutcome::Incompatible;
        }

        *entries = persisted.entries;
        LoadOutcome::Loaded {
            entries: entries.len(),
        }
    }

    pub fn get(&self, key: &str) -> Option<R> {
        self.entries.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Inserts or replaces `key`, returning any records evicted to stay within the cap.
    ///
    /// Eviction removes the records with the oldest timestamps.
    pub fn put(&self, key: &str, record: R) -> Result<Vec<(String, R)>> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), record);

        let mut evicted = Vec::new();
        while next.len() > self.max_entries {
            let victim = next
                .iter()
                .filter(|(candidate, _)| candidate.as_str() != key)
                .min_by_key(|(_, record)| record.timestamp())
                .map(|(candidate, _)| candidate.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(record) = next.remove(&victim) {
                evicted.push((victim, record));
            }
        }

        self.persist(&next)?;
        *entries = next;
        Ok(evicted)
    }

    pub fn remove(&self, key: &str) -> Result<Option<R>> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(None);
        }
        let mut next = entries.clone();
        let removed = next.remove(key);
        self.persist(&next)?;
        *entries = next;
        Ok(removed)
    }

    /// Drops every record and deletes the blob.
    pub fn remove_all(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, R>) -> Result<()> {
        let bytes = bincode_serialize(&PersistedMetadata {
            schema_version: METADATA_SCHEMA_VERSION,
            entries,
        })?;
        atomic_write(&self.path, &bytes)
    }
}
