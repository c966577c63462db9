use crate::error::Result;
use crate::util::{
    atomic_write, read_file_limited, remove_dir_files, remove_file_best_effort, TMP_MARKER,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Result of a read that is not allowed to repair anything.
///
/// `Damaged` means the entry exists in some form but cannot be served: the payload is
/// missing, unreadable, or fails to decode. Repair is left to the owner of the
/// directory's write queue.
#[derive(Debug)]
pub enum Lookup<V> {
    Hit(V),
    Miss,
    Damaged,
}

impl<V> Lookup<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Damaged => None,
        }
    }
}

/// Flat directory of cache files keyed by file name.
///
/// The OS may purge any file at any time; every read tolerates a missing file.
#[derive(Clone, Debug)]
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn read(&self, file_name: &str) -> Option<Vec<u8>> {
        read_file_limited(&self.path_for(file_name))
    }

    pub fn write(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.path_for(file_name), bytes)
    }

    pub fn delete(&self, file_name: &str, reason: &'static str) -> bool {
        remove_file_best_effort(&self.path_for(file_name), reason)
    }

    pub fn exists(&self, file_name: &str) -> bool {
        self.path_for(file_name).is_file()
    }

    /// Total size of regular files in the directory.
    pub fn size_on_disk(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|entry| fs::symlink_metadata(entry.path()).ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    /// File names of every regular file in the directory.
    pub fn file_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|ty| ty.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// Deletes leftovers of crashed atomic writes and any file `keep` rejects.
    pub fn sweep(&self, keep: impl Fn(&str) -> bool) -> usize {
        let mut removed = 0usize;
        for name in self.file_names() {
            let unwanted = name.contains(TMP_MARKER) || !keep(&name);
            if unwanted && self.delete(&name, "store.sweep") {
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) -> Result<usize> {
        remove_dir_files(&self.root, "store.clear")
    }
}

/// Bounded in-process LRU of decoded values. A capacity of zero disables the tier.
#[derive(Debug)]
pub struct MemoryTier<V> {
    entries: Option<Mutex<LruCache<String, V>>>,
}

impl<V: Clone> MemoryTier<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Looks up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.as_ref()?.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: V) {
        if let Some(entries) = &self.entries {
            entries.lock().put(key.to_string(), value);
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(key);
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memory tier in front of a disk tier.
///
/// Reads check memory, then disk; disk hits are decoded and promoted into memory. A file
/// that fails to decode is deleted and reported as a miss.
#[derive(Debug)]
pub struct TieredStore<V> {
    disk: DiskTier,
    memory: MemoryTier<V>,
}

impl<V: Clone> TieredStore<V> {
    pub fn new(root: impl Into<PathBuf>, memory_capacity: usize) -> Self {
        Self {
            disk: DiskTier::new(root),
            memory: MemoryTier::new(memory_capacity),
        }
    }

    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    pub fn memory(&self) -> &MemoryTier<V> {
        &self.memory
    }

    /// Checks memory, then disk, without promoting or deleting anything.
    pub fn lookup<E: std::fmt::Display>(
        &self,
        file_name: &str,
        decode: impl FnOnce(&[u8]) -> std::result::Result<V, E>,
    ) -> Lookup<V> {
        if let Some(value) = self.memory.get(file_name) {
            return Lookup::Hit(value);
        }
        let Some(bytes) = self.disk.read(file_name) else {
            return Lookup::Damaged;
        };
        match decode(&bytes) {
            Ok(value) => Lookup::Hit(value),
            Err(err) => {
                tracing::debug!(
                    target = "brew.cache",
                    path = %self.disk.path_for(file_name).display(),
                    error = %err,
                    "undecodable cache entry"
                );
                Lookup::Damaged
            }
        }
    }

    /// Like [`Self::lookup`], but promotes disk hits into memory and deletes whatever
    /// could not be served. Only call this from the owner's write queue.
    pub fn read<E: std::fmt::Display>(
        &self,
        file_name: &str,
        decode: impl FnOnce(&[u8]) -> std::result::Result<V, E>,
    ) -> Option<V> {
        match self.lookup(file_name, decode) {
            Lookup::Hit(value) => {
                self.memory.insert(file_name, value.clone());
                Some(value)
            }
            Lookup::Miss | Lookup::Damaged => {
                self.disk.delete(file_name, "store.unreadable");
                None
            }
        }
    }

    /// Writes `bytes` to disk, then caches `value` in memory.
    ///
    /// Memory is only updated after the disk write succeeded.
    pub fn write(&self, file_name: &str, bytes: &[u8], value: V) -> Result<()> {
        self.disk.write(file_name, bytes)?;
        self.memory.insert(file_name, value);
        Ok(())
    }

    pub fn delete(&self, file_name: &str) {
        self.memory.remove(file_name);
        self.disk.delete(file_name, "store.delete");
    }

    pub fn size_on_disk(&self) -> u64 {
        self.disk.size_on_disk()
    }

    pub fn clear(&self) -> Result<usize> {
        self.memory.clear();
        self.disk.clear()
    }
}
