//! Durable encoding for structured cache values.
//!
//! Each data file is a `bincode` envelope carrying the schema version, the kind it was
//! written for, and the save time (epoch milliseconds) ahead of the `serde` payload.

use crate::clock::Timestamp;
use crate::error::{CacheError, Result};
use crate::key::DataKind;
use crate::util::{bincode_deserialize, bincode_serialize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version of the data envelope layout. Bump when the envelope fields change.
pub const DATA_CODEC_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct PersistedData<'a, T> {
    schema_version: u32,
    kind: &'a str,
    saved_at: Timestamp,
    value: &'a T,
}

#[derive(Debug, Deserialize)]
struct PersistedDataOwned<T> {
    schema_version: u32,
    kind: String,
    saved_at: Timestamp,
    value: T,
}

/// A decoded data payload together with its envelope save time.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedData<T> {
    pub value: T,
    pub saved_at: Timestamp,
}

pub fn encode<T: Serialize>(kind: DataKind, value: &T, saved_at: Timestamp) -> Result<Vec<u8>> {
    bincode_serialize(&PersistedData {
        schema_version: DATA_CODEC_SCHEMA_VERSION,
        kind: kind.name(),
        saved_at,
        value,
    })
}

/// Decodes a payload written by [`encode`] for `kind`.
///
/// Any mismatch (schema, kind, trailing garbage) is reported as [`CacheError::Decode`].
pub fn decode<T: DeserializeOwned>(kind: DataKind, bytes: &[u8]) -> Result<DecodedData<T>> {
    let persisted: PersistedDataOwned<T> = bincode_deserialize(bytes)?;

    if persisted.schema_version != DATA_CODEC_SCHEMA_VERSION {
        return Err(CacheError::Decode {
            message: format!(
                "data schema version {} (expected {DATA_CODEC_SCHEMA_VERSION})",
                persisted.schema_version
            ),
        });
    }
    if persisted.kind != kind.name() {
        return Err(CacheError::Decode {
            message: format!(
                "payload was written for {:?}, not {}",
                persisted.kind,
                kind.name()
            ),
        });
    }

    Ok(DecodedData {
        value: persisted.value,
        saved_at: persisted.saved_at,
    })
}
