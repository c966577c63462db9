//! Freshness rules.
//!
//! Structured data ages out on a per-kind TTL. Images never age out on their own: an
//! image is replaced only when upstream reports a different URL or a newer timestamp.

use crate::clock::Timestamp;
use crate::key::DataKind;
use crate::metadata::{DataRecord, ImageRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The upstream identity of an image: its URL plus the time it was last replaced.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageIdentity {
    pub url: String,
    pub updated_at: Timestamp,
}

impl ImageIdentity {
    pub fn new(url: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            url: url.into(),
            updated_at,
        }
    }
}

/// Per-kind TTL table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StalenessPolicy {
    overrides: BTreeMap<DataKind, Duration>,
}

impl StalenessPolicy {
    pub fn with_overrides(overrides: BTreeMap<DataKind, Duration>) -> Self {
        Self { overrides }
    }

    pub fn threshold(&self, kind: DataKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_ttl())
    }

    /// `true` when there is no record, or when strictly more than the kind's TTL has
    /// elapsed since it was written.
    pub fn is_stale(&self, kind: DataKind, record: Option<&DataRecord>, now: Timestamp) -> bool {
        match record {
            None => true,
            Some(record) => now.saturating_duration_since(record.timestamp) > self.threshold(kind),
        }
    }
}

/// `true` when the cached image is missing or was produced from a different or older
/// upstream identity.
pub fn needs_update(record: Option<&ImageRecord>, current: &ImageIdentity) -> bool {
    match record {
        None => true,
        Some(record) => record.source_url != current.url || record.timestamp < current.updated_at,
    }
}
