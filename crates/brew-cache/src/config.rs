use crate::error::{CacheError, Result};
use crate::image_codec::DEFAULT_LOSSY_QUALITY;
use crate::key::DataKind;
use crate::metadata::DEFAULT_MAX_METADATA_ENTRIES;
use crate::staleness::StalenessPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CACHE_DIR_ENV: &str = "BREW_CACHE_DIR";
pub const STATE_DIR_ENV: &str = "BREW_STATE_DIR";

pub const DEFAULT_MEMORY_CAPACITY: usize = 10;
pub const DEFAULT_CORRUPTION_TRIP_THRESHOLD: u32 = 2;
pub const DEFAULT_PRELOAD_CONCURRENCY: usize = 4;

/// Runtime configuration shared by [`crate::DataCache`] and [`crate::ImageCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Purgeable storage for payload files.
    pub cache_root: PathBuf,
    /// Durable storage for settings and metadata blobs.
    pub state_root: PathBuf,
    /// Format marker compared by the version guard at startup.
    pub expected_version: String,
    /// Decoded images kept in memory. Zero disables the memory tier.
    pub memory_capacity: usize,
    pub lossy_quality: u8,
    pub max_metadata_entries: usize,
    /// Consecutive image-metadata corruptions that disable the image cache.
    pub corruption_trip_threshold: u32,
    pub preload_concurrency: usize,
    pub ttl_overrides: BTreeMap<DataKind, Duration>,
}

impl CacheConfig {
    /// Builds a config with explicit roots and default tuning.
    pub fn new(cache_root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            state_root: state_root.into(),
            expected_version: env!("CARGO_PKG_VERSION").to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            lossy_quality: DEFAULT_LOSSY_QUALITY,
            max_metadata_entries: DEFAULT_MAX_METADATA_ENTRIES,
            corruption_trip_threshold: DEFAULT_CORRUPTION_TRIP_THRESHOLD,
            preload_concurrency: DEFAULT_PRELOAD_CONCURRENCY,
            ttl_overrides: BTreeMap::new(),
        }
    }

    /// Uses `BREW_CACHE_DIR` / `BREW_STATE_DIR` when set, otherwise `~/.brew/{cache,state}`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(
            resolve_root(CACHE_DIR_ENV, "cache")?,
            resolve_root(STATE_DIR_ENV, "state")?,
        ))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: CacheSettings = toml::from_str(text)?;
        settings.into_config()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = version.into();
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy::with_overrides(self.ttl_overrides.clone())
    }

    pub(crate) fn effective_quality(&self) -> u8 {
        self.lossy_quality.clamp(1, 100)
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.preload_concurrency.max(1)
    }

    pub(crate) fn effective_trip_threshold(&self) -> u32 {
        self.corruption_trip_threshold.max(1)
    }
}

/// The on-disk (TOML) form of [`CacheConfig`]. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub cache_root: Option<PathBuf>,
    pub state_root: Option<PathBuf>,
    pub expected_version: Option<String>,
    pub memory_capacity: Option<usize>,
    pub lossy_quality: Option<u8>,
    pub max_metadata_entries: Option<usize>,
    pub corruption_trip_threshold: Option<u32>,
    pub preload_concurrency: Option<usize>,
    /// Per-kind TTL in seconds, keyed by kind name (e.g. `pricing = 3600`).
    pub ttl_overrides_secs: BTreeMap<String, u64>,
}

impl CacheSettings {
    pub fn into_config(self) -> Result<CacheConfig> {
        let cache_root = match self.cache_root {
            Some(root) => root,
            None => resolve_root(CACHE_DIR_ENV, "cache")?,
        };
        let state_root = match self.state_root {
            Some(root) => root,
            None => resolve_root(STATE_DIR_ENV, "state")?,
        };
        let mut config = CacheConfig::new(cache_root, state_root);

        if let Some(version) = self.expected_version {
            config.expected_version = version;
        }
        if let Some(capacity) = self.memory_capacity {
            config.memory_capacity = capacity;
        }
        if let Some(quality) = self.lossy_quality {
            config.lossy_quality = quality.clamp(1, 100);
        }
        if let Some(max) = self.max_metadata_entries {
            config.max_metadata_entries = max;
        }
        if let Some(threshold) = self.corruption_trip_threshold {
            config.corruption_trip_threshold = threshold;
        }
        if let Some(concurrency) = self.preload_concurrency {
            config.preload_concurrency = concurrency;
        }

        for (name, secs) in self.ttl_overrides_secs {
            let Some(kind) = DataKind::from_name(&name) else {
                return Err(CacheError::Config {
                    message: format!("unknown data kind in ttl_overrides_secs: {name:?}"),
                });
            };
            config.ttl_overrides.insert(kind, Duration::from_secs(secs));
        }

        Ok(config)
    }
}

fn resolve_root(env_var: &str, leaf: &str) -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(env_var).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    Ok(brew_home()?.join(leaf))
}

fn brew_home() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;
    Ok(home.join(".brew"))
}
