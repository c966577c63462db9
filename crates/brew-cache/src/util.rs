use crate::error::CacheError;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Hard upper bound for any cached payload we will attempt to read from disk.
///
/// Cache corruption should degrade to a cache miss, not an out-of-memory crash. Corrupted
/// length prefixes and truncated-then-extended files are both bounded by this cap.
pub const PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Marker embedded in the names of in-flight atomic writes.
pub(crate) const TMP_MARKER: &str = ".tmp.";

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options + Copy {
    bincode_options().with_limit(PAYLOAD_LIMIT_BYTES as u64)
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    bincode_options().serialize(value).map_err(CacheError::encode)
}

pub(crate) fn bincode_deserialize<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, CacheError> {
    bincode_options_limited()
        .deserialize(bytes)
        .map_err(CacheError::decode)
}

/// Reads a regular file of at most [`PAYLOAD_LIMIT_BYTES`].
///
/// Never deletes anything: symlinks, directories, oversized files and missing files all
/// read as `None`, and callers that own the directory decide what to clean up.
pub(crate) fn read_file_limited(path: &Path) -> Option<Vec<u8>> {
    let opened = fs::symlink_metadata(path).and_then(|meta| {
        if meta.file_type().is_symlink() || !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a regular file"));
        }
        if meta.len() > PAYLOAD_LIMIT_BYTES as u64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "file exceeds payload limit"));
        }
        fs::File::open(path)
    });

    let mut bytes = Vec::new();
    let read = opened.and_then(|file| {
        file.take(PAYLOAD_LIMIT_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
    });
    match read {
        Ok(len) if len <= PAYLOAD_LIMIT_BYTES => Some(bytes),
        Ok(_) => {
            tracing::debug!(target = "brew.cache", path = %path.display(), "cache file grew past payload limit");
            None
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::debug!(
                target = "brew.cache",
                path = %path.display(),
                error = %err,
                "failed to read cache file"
            );
            None
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "brew.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Removes every non-directory entry directly under `dir` and returns how many went.
///
/// A missing directory counts as already empty.
pub(crate) fn remove_dir_files(dir: &Path, reason: &'static str) -> Result<usize, CacheError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let removed = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|ty| !ty.is_dir()).unwrap_or(false))
        .filter(|entry| remove_file_best_effort(&entry.path(), reason))
        .count();
    Ok(removed)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `bytes` through a synced sibling temp file and a rename.
///
/// Readers see the old contents or the new contents, never a mix. The temp file is named
/// `<file>.tmp.<pid>.<n>` so a sweep can recognise leftovers from a crash.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(io::Error::other("cache path has no parent directory").into());
    };
    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = loop {
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(
            "{TMP_MARKER}{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp_path = parent.join(tmp_name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
            Ok(file) => break (tmp_path, file),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    };

    let written = file
        .write_all(bytes)
        .and_then(|()| file.sync_all())
        .and_then(|()| {
            drop(file);
            fs::rename(&tmp_path, path)
        });
    if let Err(err) = written {
        remove_file_best_effort(&tmp_path, "atomic_write.failed");
        return Err(err.into());
    }

    sync_dir(parent);
    Ok(())
}

/// Makes a completed rename durable. Failures are logged once and otherwise ignored.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(err) = fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            static LOGGED: OnceLock<()> = OnceLock::new();
            if LOGGED.set(()).is_ok() {
                tracing::debug!(
                    target = "brew.cache",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync cache directory"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}
