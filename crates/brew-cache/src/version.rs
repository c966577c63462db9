use crate::error::Result;
use crate::state::{CacheState, StateFile};

/// Outcome of comparing the persisted format marker with the running build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionCheck {
    Current,
    /// The store was wiped because the marker was absent or different.
    Wiped { previous: Option<String> },
}

/// Ensures entries on disk were written by a build with the `expected` format version.
///
/// On mismatch `wipe` runs first and the new marker is persisted only once it has
/// succeeded. A failed wipe leaves the old marker so the next start retries.
pub fn ensure_version(
    state_file: &StateFile,
    state: &mut CacheState,
    expected: &str,
    wipe: impl FnOnce() -> Result<()>,
) -> Result<VersionCheck> {
    if state.format_version.as_deref() == Some(expected) {
        return Ok(VersionCheck::Current);
    }

    let previous = state.format_version.clone();
    tracing::warn!(
        target = "brew.cache",
        path = %state_file.path().display(),
        previous = previous.as_deref().unwrap_or("<none>"),
        expected,
        "cache format version changed; wiping store"
    );
    wipe()?;

    state.format_version = Some(expected.to_string());
    state_file.save(state)?;
    Ok(VersionCheck::Wiped { previous })
}
