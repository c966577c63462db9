use crate::clock::{Clock, Timestamp};
use crate::config::CacheConfig;
use crate::data_codec;
use crate::error::Result;
use crate::key::DataKind;
use crate::metadata::{DataRecord, LoadOutcome, MetadataRegistry};
use crate::staleness::StalenessPolicy;
use crate::state::{StateCell, StateFile};
use crate::store::{DiskTier, Lookup};
use crate::version::{ensure_version, VersionCheck};
use crate::worker::IoWorker;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Cache for the structured-data kinds in [`DataKind`].
///
/// Each kind is one file under `<cache_root>/data/`; its last-fetch time lives in
/// `<state_root>/data-metadata.bin`. Values are not kept in memory. Clones share the
/// same instance.
#[derive(Clone, Debug)]
pub struct DataCache {
    inner: Arc<DataInner>,
}

#[derive(Debug)]
struct DataInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: StateCell,
    disk: DiskTier,
    metadata: MetadataRegistry<DataRecord>,
    policy: StalenessPolicy,
    worker: IoWorker,
    initialized: AtomicBool,
}

/// A cached value served immediately, plus the refresh started because it was stale.
#[derive(Debug)]
pub struct Revalidation<T> {
    pub cached: Option<T>,
    pub refresh: Option<JoinHandle<Result<T>>>,
}

impl DataCache {
    /// Opens the cache, running the version guard unless the kill switch is off.
    ///
    /// With the cache disabled nothing beyond the state file is read.
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let state = StateCell::load(StateFile::new(config.state_root.join("data.json")));
        let inner = DataInner {
            disk: DiskTier::new(config.cache_root.join("data")),
            metadata: MetadataRegistry::new(
                config.state_root.join("data-metadata.bin"),
                config.max_metadata_entries,
            ),
            policy: config.staleness_policy(),
            worker: IoWorker::new("brew-cache-data"),
            initialized: AtomicBool::new(false),
            state,
            config,
            clock,
        };

        if inner.state.is_enabled() {
            inner.initialize()?;
        } else {
            tracing::debug!(target = "brew.cache", "data cache disabled; skipping initialization");
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Blocking lookup on the caller's thread. Prefer [`Self::get_cached_async`] from
    /// latency-sensitive code.
    ///
    /// Nothing is deleted here. An entry that cannot be served reads as `None`, and its
    /// cleanup is queued on the worker, where it is checked again before anything is removed.
    pub fn get_cached<T: DeserializeOwned + 'static>(&self, kind: DataKind) -> Option<T> {
        match self.inner.lookup::<T>(kind) {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
            Lookup::Damaged => {
                let inner = self.inner.clone();
                self.inner.worker.spawn(move || {
                    inner.get_cached::<T>(kind);
                });
                None
            }
        }
    }

    pub async fn get_cached_async<T>(&self, kind: DataKind) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.get_cached(kind)).await
    }

    /// Looks up `kind` on the worker and hands the result to `callback` there.
    pub fn get_cached_with<T, F>(&self, kind: DataKind, callback: F)
    where
        T: DeserializeOwned + 'static,
        F: FnOnce(Option<T>) + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner
            .worker
            .spawn(move || callback(inner.get_cached::<T>(kind)));
    }

    /// Persists `value` and records the current time as its fetch time.
    ///
    /// The value is encoded before this returns; the write itself runs on the worker. The
    /// metadata record is only written after the payload file is in place. A disabled
    /// cache accepts and discards the value.
    pub fn store<T: Serialize>(
        &self,
        kind: DataKind,
        value: &T,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let inner = self.inner.clone();
        let prepared = if inner.is_active() {
            let now = inner.clock.now();
            data_codec::encode(kind, value, now).map(|bytes| Some((bytes, now)))
        } else {
            Ok(None)
        };

        async move {
            let Some((bytes, now)) = prepared? else {
                return Ok(());
            };
            let job = inner.clone();
            inner
                .worker
                .run(move || job.write_entry(kind, &bytes, now))
                .await?
        }
    }

    /// `true` when `kind` has no record or its record is older than the kind's TTL.
    pub fn is_stale(&self, kind: DataKind) -> bool {
        if !self.inner.is_active() {
            return true;
        }
        let record = self.inner.metadata.get(kind.name());
        self.inner
            .policy
            .is_stale(kind, record.as_ref(), self.inner.clock.now())
    }

    /// Drops the record for `kind`, then its payload file.
    pub async fn invalidate(&self, kind: DataKind) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner
            .worker
            .run(move || inner.invalidate(&[kind]))
            .await?
    }

    /// Drops every record and the payload files they describe.
    pub async fn invalidate_all(&self) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner
            .worker
            .run(move || inner.invalidate(&DataKind::ALL))
            .await?
    }

    /// Deletes every payload file and metadata record.
    pub async fn clear_all(&self) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.wipe()).await?
    }

    /// Bytes used by payload files. Zero while disabled.
    ///
    /// Blocking: lists the data directory on the caller's thread.
    pub fn cache_size_bytes(&self) -> u64 {
        self.inner.size_on_disk()
    }

    /// [`Self::cache_size_bytes`] measured on the worker.
    pub async fn cache_size_bytes_async(&self) -> Result<u64> {
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.size_on_disk()).await
    }

    /// Resolves once every disk job queued before this call has finished, including
    /// cleanups scheduled by [`Self::get_cached`].
    pub async fn flush(&self) -> Result<()> {
        self.inner.worker.run(|| ()).await
    }

    /// Returns the cached value when fresh; otherwise awaits `fetch` and stores its result.
    ///
    /// A failed fetch leaves the cache untouched. While disabled the fetched value is
    /// returned without being persisted.
    pub async fn hydrate<T, F, Fut>(&self, kind: DataKind, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_stale(kind) {
            if let Some(value) = self.get_cached_async::<T>(kind).await? {
                return Ok(value);
            }
        }

        let value = match fetch().await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    target = "brew.cache",
                    kind = kind.name(),
                    error = %err,
                    "data hydration fetch failed"
                );
                return Err(err);
            }
        };
        self.store(kind, &value).await?;
        Ok(value)
    }

    /// Serves whatever is cached now and, if it is stale or missing, starts a background
    /// [`Self::hydrate`] on the current tokio runtime.
    pub async fn get_or_revalidate<T, F, Fut>(&self, kind: DataKind, fetch: F) -> Revalidation<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cached = match self.get_cached_async::<T>(kind).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::debug!(target = "brew.cache", kind = kind.name(), error = %err, "cached read failed");
                None
            }
        };

        let refresh = (cached.is_none() || self.is_stale(kind)).then(|| {
            let cache = self.clone();
            tokio::spawn(async move { cache.hydrate(kind, fetch).await })
        });

        Revalidation { cached, refresh }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.is_enabled()
    }

    /// Flips the kill switch. Enabling runs any initialization skipped at open.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .worker
            .run(move || inner.set_enabled(enabled))
            .await?
    }
}

impl DataInner {
    fn is_active(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && self.state.is_enabled()
    }

    fn initialize(&self) -> Result<()> {
        self.disk.ensure_dir()?;
        if let LoadOutcome::Corrupted = self.metadata.load() {
            tracing::warn!(target = "brew.cache", "data metadata was corrupt; every kind is now stale");
        }

        let expected = self.config.expected_version.as_str();
        let check = self
            .state
            .with_state(|file, state| ensure_version(file, state, expected, || self.wipe()))?;
        if let VersionCheck::Wiped { previous } = check {
            tracing::info!(
                target = "brew.cache",
                previous = previous.as_deref().unwrap_or("<none>"),
                expected,
                "data cache reset for new format version"
            );
        }

        // Runs after the version guard so only files with a surviving record are kept.
        let swept = self.disk.sweep(|name| {
            DataKind::ALL
                .iter()
                .any(|kind| kind.file_name() == name && self.metadata.contains(kind.name()))
        });
        if swept > 0 {
            tracing::debug!(target = "brew.cache", swept, "removed stray data cache files");
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        self.disk.clear()?;
        self.metadata.remove_all()
    }

    fn size_on_disk(&self) -> u64 {
        if !self.is_active() {
            return 0;
        }
        self.disk.size_on_disk()
    }

    /// Read-only check of `kind`; safe from any thread.
    fn lookup<T: DeserializeOwned>(&self, kind: DataKind) -> Lookup<T> {
        if !self.is_active() {
            return Lookup::Miss;
        }
        let file_name = kind.file_name();

        if !self.metadata.contains(kind.name()) {
            // Payload without a record counts as absent.
            return if self.disk.exists(&file_name) {
                Lookup::Damaged
            } else {
                Lookup::Miss
            };
        }

        let Some(bytes) = self.disk.read(&file_name) else {
            return Lookup::Damaged;
        };
        match data_codec::decode::<T>(kind, &bytes) {
            Ok(decoded) => Lookup::Hit(decoded.value),
            Err(err) => {
                tracing::debug!(
                    target = "brew.cache",
                    kind = kind.name(),
                    error = %err,
                    "undecodable data entry"
                );
                Lookup::Damaged
            }
        }
    }

    /// Worker-side read: anything that cannot be served loses both its file and record.
    fn get_cached<T: DeserializeOwned>(&self, kind: DataKind) -> Option<T> {
        match self.lookup(kind) {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
            Lookup::Damaged => {
                self.forget(kind, "data.unreadable");
                self.disk.delete(&kind.file_name(), "data.unreadable");
                None
            }
        }
    }

    fn invalidate(&self, kinds: &[DataKind]) -> Result<()> {
        for kind in kinds {
            self.metadata.remove(kind.name())?;
            self.disk.delete(&kind.file_name(), "data.invalidate");
        }
        Ok(())
    }

    fn forget(&self, kind: DataKind, reason: &'static str) {
        if let Err(err) = self.metadata.remove(kind.name()) {
            tracing::debug!(
                target = "brew.cache",
                kind = kind.name(),
                reason,
                error = %err,
                "failed to drop data metadata record"
            );
        }
    }

    fn write_entry(&self, kind: DataKind, bytes: &[u8], now: Timestamp) -> Result<()> {
        self.disk.write(&kind.file_name(), bytes)?;

        let record = DataRecord {
            identity: kind.name().to_string(),
            timestamp: now,
        };
        let evicted = self.metadata.put(kind.name(), record)?;
        for (name, _) in evicted {
            if let Some(evicted_kind) = DataKind::from_name(&name) {
                self.disk.delete(&evicted_kind.file_name(), "data.evict");
            }
        }
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.state.update(|state| state.enabled = enabled)?;
        tracing::info!(target = "brew.cache", enabled, "data cache kill switch updated");
        if enabled && !self.initialized.load(Ordering::Acquire) {
            self.initialize()?;
        }
        Ok(())
    }
}
