//! Local caching for the ordering app: structured menu data and remote images.
//!
//! Both caches serve stale-while-revalidate reads from a purgeable disk directory, keep
//! their bookkeeping in a separate durable directory, wipe themselves when the format
//! version changes, self-heal from corrupt files, and can be switched off entirely.
//!
//! Layout for one [`CacheConfig`]:
//!
//! ```text
//! <cache_root>/
//!   data/<kind>.bin                  bincode envelope per DataKind
//!   images/<sha256(url)>.<png|jpg>   compressed image payloads
//!   hero/hero.img                    the hero slot
//! <state_root>/
//!   data.json, images.json           CacheState (kill switch, version marker, hero identity)
//!   data-metadata.bin                DataKind -> last fetch time
//!   image-metadata.bin               digest -> source URL, upstream timestamp, format
//! ```
//!
//! Any file under `<cache_root>` may disappear at any time; reads treat that as a miss.

pub mod clock;
pub mod config;
pub mod data_cache;
pub mod data_codec;
pub mod error;
pub mod fetch;
pub mod hero;
pub mod image_cache;
pub mod image_codec;
pub mod key;
pub mod metadata;
pub mod staleness;
pub mod state;
pub mod store;
pub mod version;
pub mod worker;

mod util;

pub use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use crate::config::{CacheConfig, CacheSettings};
pub use crate::data_cache::{DataCache, Revalidation};
pub use crate::error::{CacheError, Result};
pub use crate::fetch::{source_for_url, FileSource, HttpSource, RemoteSource, SchemeSource};
pub use crate::hero::HeroSlot;
pub use crate::image_cache::{ImageCache, PreloadReport};
pub use crate::key::{DataKind, ImageFormat, ImageKey};
pub use crate::metadata::{DataRecord, ImageRecord, LoadOutcome, MetadataRegistry};
pub use crate::staleness::{ImageIdentity, StalenessPolicy};
pub use crate::state::{CacheState, StateFile};
pub use crate::util::PAYLOAD_LIMIT_BYTES;
pub use crate::version::VersionCheck;

pub use tokio_util::sync::CancellationToken;
