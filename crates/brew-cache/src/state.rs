use crate::error::Result;
use crate::util::{atomic_write, read_file_limited, remove_file_best_effort};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Small persisted settings for one cache instance.
///
/// Kept outside the (purgeable) cache directory so that the kill switch and version
/// marker survive the OS reclaiming cache storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheState {
    /// Format version the on-disk entries were written with.
    pub format_version: Option<String>,
    /// Kill switch. `false` turns every cache operation into a miss/no-op.
    pub enabled: bool,
    /// Source identity of the image currently held by the hero slot.
    pub hero_identity: Option<String>,
    /// Consecutive metadata-blob corruptions observed at load time.
    pub metadata_corruptions: u32,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            format_version: None,
            enabled: true,
            hero_identity: None,
            metadata_corruptions: 0,
        }
    }
}

/// JSON-backed persistence for [`CacheState`].
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the state, falling back to defaults when the file is missing or unreadable.
    ///
    /// An unparsable file is deleted so the next save starts from a clean slate.
    pub fn load(&self) -> CacheState {
        let Some(bytes) = read_file_limited(&self.path) else {
            return CacheState::default();
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    target = "brew.cache",
                    path = %self.path.display(),
                    error = %crate::CacheError::from(err),
                    "discarding unreadable cache state"
                );
                remove_file_best_effort(&self.path, "state.decode");
                CacheState::default()
            }
        }
    }

    pub fn save(&self, state: &CacheState) -> Result<()> {
        let bytes = serde_json::to_vec(state).map_err(crate::CacheError::encode)?;
        atomic_write(&self.path, &bytes)
    }
}

/// The live [`CacheState`] of one cache instance together with its backing file.
///
/// Updates are copy-on-write: the modified state is saved first and only replaces the
/// in-memory copy once the save succeeded.
#[derive(Debug)]
pub(crate) struct StateCell {
    file: StateFile,
    state: Mutex<CacheState>,
}

impl StateCell {
    pub(crate) fn load(file: StateFile) -> Self {
        let state = file.load();
        Self {
            file,
            state: Mutex::new(state),
        }
    }

    pub(crate) fn snapshot(&self) -> CacheState {
        self.state.lock().clone()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub(crate) fn update<T>(&self, change: impl FnOnce(&mut CacheState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = change(&mut next);
        if next != *state {
            self.file.save(&next)?;
            *state = next;
        }
        Ok(out)
    }

    /// Runs `guard` against the live state, persisting whatever it leaves behind.
    pub(crate) fn with_state<T>(
        &self,
        guard: impl FnOnce(&StateFile, &mut CacheState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = guard(&self.file, &mut next)?;
        *state = next;
        Ok(out)
    }
}
