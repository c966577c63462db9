use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::fetch::{sanitize_fetch_url, RemoteSource, SchemeSource};
use crate::hero::HeroSlot;
use crate::image_codec;
use crate::key::{ImageFormat, ImageKey};
use crate::metadata::{ImageRecord, LoadOutcome, MetadataRegistry};
use crate::staleness::{self, ImageIdentity};
use crate::state::{StateCell, StateFile};
use crate::store::{DiskTier, Lookup, TieredStore};
use crate::version::{ensure_version, VersionCheck};
use crate::worker::IoWorker;
use futures::StreamExt;
use image::DynamicImage;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counts reported once a [`ImageCache::preload_batch`] has finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreloadReport {
    /// Identities that needed an update and were scheduled.
    pub attempted: usize,
    /// Identities already cached at their current version.
    pub fresh: usize,
    pub stored: usize,
    pub failed: usize,
    /// Duplicates, identities cancelled before finishing, and everything while disabled.
    pub skipped: usize,
}

/// Cache for remote images, with the hero slot alongside.
///
/// Payloads live under `<cache_root>/images/` as `<sha256(url)>.<png|jpg>`; decoded images
/// are kept in a small LRU. Provenance records live in `<state_root>/image-metadata.bin`.
/// Clones share the same instance.
#[derive(Clone, Debug)]
pub struct ImageCache {
    inner: Arc<ImageInner>,
}

struct ImageInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Arc<StateCell>,
    store: TieredStore<Arc<DynamicImage>>,
    metadata: MetadataRegistry<ImageRecord>,
    hero: HeroSlot,
    source: Arc<dyn RemoteSource>,
    worker: IoWorker,
    initialized: AtomicBool,
}

impl fmt::Debug for ImageInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageInner")
            .field("images", &self.store.disk().root())
            .field("metadata", &self.metadata.path())
            .field("entries", &self.metadata.len())
            .field("in_memory", &self.store.memory().len())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Opens the cache with [`SchemeSource`] as the downloader.
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open_with_source(config, clock, Arc::new(SchemeSource))
    }

    /// Opens the cache, running the version guard unless the kill switch is off.
    ///
    /// A corrupt metadata blob is discarded. Once corruption has been seen on
    /// `corruption_trip_threshold` consecutive opens the kill switch is turned off and
    /// stays off until [`Self::set_enabled`] is called.
    pub fn open_with_source(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        source: Arc<dyn RemoteSource>,
    ) -> Result<Self> {
        let state = Arc::new(StateCell::load(StateFile::new(
            config.state_root.join("images.json"),
        )));
        let inner = ImageInner {
            store: TieredStore::new(config.cache_root.join("images"), config.memory_capacity),
            metadata: MetadataRegistry::new(
                config.state_root.join("image-metadata.bin"),
                config.max_metadata_entries,
            ),
            hero: HeroSlot::new(DiskTier::new(config.cache_root.join("hero")), state.clone()),
            worker: IoWorker::new("brew-cache-images"),
            initialized: AtomicBool::new(false),
            state,
            source,
            config,
            clock,
        };

        if inner.state.is_enabled() {
            inner.initialize()?;
        } else {
            tracing::debug!(target = "brew.cache", "image cache disabled; skipping initialization");
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
    /// Disk hits are not promoted into memory and nothing is deleted here; cleanup of an
    /// unservable entry is queued on the worker and re-checked there.
    pub fn get_cached(&self, url: &str) -> Option<Arc<DynamicImage>> {
        match self.inner.lookup(url) {
            Lookup::Hit(image) => Some(image),
            Lookup::Miss => None,
            Lookup::Damaged => {
                let inner = self.inner.clone();
                let url = url.to_string();
                self.inner.worker.spawn(move || {
                    inner.get_cached(&url);
                });
                None
            }
        }
    }

    pub async fn get_cached_async(&self, url: &str) -> Result<Option<Arc<DynamicImage>>> {
        let inner = self.inner.clone();
        let url = url.to_string();
        self.inner.worker.run(move || inner.get_cached(&url)).await
    }

    /// Looks up `url` on the worker and hands the result to `callback` there.
    pub fn get_cached_with(
        &self,
        url: &str,
        callback: impl FnOnce(Option<Arc<DynamicImage>>) + Send + 'static,
    ) {
        let inner = self.inner.clone();
        let url = url.to_string();
        self.inner
            .worker
            .spawn(move || callback(inner.get_cached(&url)));
    }

    /// Compresses and stores `image` as the current version of `identity`.
    pub async fn store(&self, identity: &ImageIdentity, image: DynamicImage) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let quality = self.inner.config.effective_quality();
        let (image, bytes, format) = tokio::task::spawn_blocking(move || {
            let (bytes, format) = image_codec::compress(&image, quality)?;
            Ok::<_, CacheError>((Arc::new(image), bytes, format))
        })
        .await
        .map_err(|_| CacheError::WorkerUnavailable)??;

        let inner = self.inner.clone();
        let identity = identity.clone();
        self.inner
            .worker
            .run(move || inner.persist(&identity, image, &bytes, format))
            .await?
    }

    /// Stores `image` for `url`, stamped with the current time.
    pub async fn store_url(&self, url: &str, image: DynamicImage) -> Result<()> {
        let identity = ImageIdentity::new(url, self.inner.clock.now());
        self.store(&identity, image).await
    }

    /// `true` unless the cache holds `identity.url` at `identity.updated_at` or newer.
    ///
    /// Blocking: stats the payload file on the caller's thread.
    pub fn needs_update(&self, identity: &ImageIdentity) -> bool {
        self.inner.needs_update(identity)
    }

    /// [`Self::needs_update`] evaluated on the worker.
    pub async fn needs_update_async(&self, identity: &ImageIdentity) -> Result<bool> {
        let inner = self.inner.clone();
        let identity = identity.clone();
        self.inner
            .worker
            .run(move || inner.needs_update(&identity))
            .await
    }

    /// Returns the cached image when it is current; otherwise downloads, transcodes, and
    /// stores it.
    ///
    /// Download or decode failures leave the cache untouched. While disabled the image is
    /// returned without being persisted.
    pub async fn hydrate(&self, identity: &ImageIdentity) -> Result<Arc<DynamicImage>> {
        if !self.needs_update(identity) {
            if let Some(image) = self.get_cached_async(&identity.url).await? {
                return Ok(image);
            }
        }
        self.fetch_and_store(identity).await
    }

    /// Hydrates every identity that needs an update, `preload_concurrency` at a time.
    ///
    /// Individual failures do not stop the batch. `on_each` sees every scheduled identity
    /// that finished (`None` on failure); `on_complete` runs exactly once, after the last
    /// one. Cancelling `token` skips identities that have not finished yet; writes already
    /// handed to the worker still land.
    pub async fn preload_batch<E, C>(
        &self,
        identities: Vec<ImageIdentity>,
        mut on_each: E,
        on_complete: C,
        token: CancellationToken,
    ) -> PreloadReport
    where
        E: FnMut(&ImageIdentity, Option<Arc<DynamicImage>>) + Send,
        C: FnOnce(&PreloadReport) + Send,
    {
        let mut report = PreloadReport::default();
        if !self.inner.is_active() {
            report.skipped = identities.len();
            on_complete(&report);
            return report;
        }

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for identity in identities {
            if !seen.insert(identity.url.clone()) {
                report.skipped += 1;
            } else if self.needs_update(&identity) {
                pending.push(identity);
            } else {
                report.fresh += 1;
            }
        }
        report.attempted = pending.len();

        let mut results = futures::stream::iter(pending)
            .map(|identity| {
                let token = token.clone();
                async move {
                    let result = if token.is_cancelled() {
                        Err(CacheError::Cancelled)
                    } else {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => Err(CacheError::Cancelled),
                            result = self.fetch_and_store(&identity) => result,
                        }
                    };
                    (identity, result)
                }
            })
            .buffer_unordered(self.inner.config.effective_concurrency());

        while let Some((identity, result)) = results.next().await {
            match result {
                Ok(image) => {
                    report.stored += 1;
                    on_each(&identity, Some(image));
                }
                Err(CacheError::Cancelled) => report.skipped += 1,
                Err(err) => {
                    tracing::debug!(
                        target = "brew.cache",
                        url = %sanitize_fetch_url(&identity.url),
                        error = %err,
                        "image preload entry failed"
                    );
                    report.failed += 1;
                    on_each(&identity, None);
                }
            }
        }

        tracing::debug!(
            target = "brew.cache",
            attempted = report.attempted,
            fresh = report.fresh,
            stored = report.stored,
            failed = report.failed,
            skipped = report.skipped,
            "image preload finished"
        );
        on_complete(&report);
        report
    }

    /// Drops every record together with the payload files and in-memory copies they
    /// describe.
    pub async fn invalidate_all(&self) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner
            .worker
            .run(move || inner.invalidate_all())
            .await?
    }

    /// Deletes every image file, record, and in-memory copy. The hero slot is kept.
    pub async fn clear_all(&self) -> Result<()> {
        if !self.inner.is_active() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.wipe()).await?
    }

    /// Bytes used by image files, excluding the hero slot. Zero while disabled.
    ///
    /// Blocking: lists the image directory on the caller's thread.
    pub fn cache_size_bytes(&self) -> u64 {
        self.inner.size_on_disk()
    }

    /// [`Self::cache_size_bytes`] measured on the worker.
    pub async fn cache_size_bytes_async(&self) -> Result<u64> {
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.size_on_disk()).await
    }

    /// Resolves once every disk job queued before this call has finished, including
    /// cleanups scheduled by [`Self::get_cached`] and [`Self::load_hero_instant`].
    pub async fn flush(&self) -> Result<()> {
        self.inner.worker.run(|| ()).await
    }

    /// Synchronous read of the hero slot for the first frame after startup.
    ///
    /// An undecodable slot reads as `None`; its removal is queued on the worker.
    pub fn load_hero_instant(&self) -> Option<DynamicImage> {
        if !self.inner.state.is_enabled() {
            return None;
        }
        match self.inner.hero.lookup() {
            Lookup::Hit(image) => Some(image),
            Lookup::Miss => None,
            Lookup::Damaged => {
                let inner = self.inner.clone();
                self.inner.worker.spawn(move || {
                    inner.hero.load();
                });
                None
            }
        }
    }

    pub fn hero_needs_replacement(&self, identity: &str) -> bool {
        !self.inner.state.is_enabled() || self.inner.hero.needs_replacement(identity)
    }

    pub async fn replace_hero(&self, image: DynamicImage, identity: &str) -> Result<()> {
        if !self.inner.state.is_enabled() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let identity = identity.to_string();
        self.inner
            .worker
            .run(move || {
                inner
                    .hero
                    .replace(&image, &identity, inner.config.effective_quality())
            })
            .await?
    }

    /// Empties the hero slot and forgets its identity.
    pub async fn clear_hero(&self) -> Result<()> {
        if !self.inner.state.is_enabled() {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.inner.worker.run(move || inner.hero.clear()).await?
    }

    /// Returns the hero image for `url`, downloading it into the slot when the slot holds
    /// something else.
    pub async fn hydrate_hero(&self, url: &str) -> Result<DynamicImage> {
        if !self.hero_needs_replacement(url) {
            if let Some(image) = self.load_hero_instant() {
                return Ok(image);
            }
        }

        let downloaded = self.download(url).await?;
        let image = tokio::task::spawn_blocking(move || image_codec::decompress(&downloaded))
            .await
            .map_err(|_| CacheError::WorkerUnavailable)??;
        self.replace_hero(image.clone(), url).await?;
        Ok(image)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state.is_enabled()
    }

    /// Flips the kill switch. Enabling also resets the corruption counter and runs any
    /// initialization skipped at open.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let inner = self.inner.clone();
        self.inner
            .worker
            .run(move || inner.set_enabled(enabled))
            .await?
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.inner.source.fetch(url).await.map_err(|err| {
            tracing::warn!(
                target = "brew.cache",
                url = %sanitize_fetch_url(url),
                error = %err,
                "image download failed"
            );
            err
        })
    }

    async fn fetch_and_store(&self, identity: &ImageIdentity) -> Result<Arc<DynamicImage>> {
        let downloaded = self.download(&identity.url).await?;

        let quality = self.inner.config.effective_quality();
        let (image, bytes, format) =
            tokio::task::spawn_blocking(move || image_codec::transcode(&downloaded, quality))
                .await
                .map_err(|_| CacheError::WorkerUnavailable)??;
        let image = Arc::new(image);

        if !self.inner.is_active() {
            return Ok(image);
        }
        let inner = self.inner.clone();
        let identity = identity.clone();
        let stored = image.clone();
        self.inner
            .worker
            .run(move || inner.persist(&identity, stored, &bytes, format))
            .await??;
        Ok(image)
    }
}

impl ImageInner {
    fn is_active(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && self.state.is_enabled()
    }

    fn initialize(&self) -> Result<()> {
        self.store.disk().ensure_dir()?;

        match self.metadata.load() {
            LoadOutcome::Corrupted => {
                let threshold = self.config.effective_trip_threshold();
                let (seen, tripped) = self.state.update(|state| {
                    state.metadata_corruptions = state.metadata_corruptions.saturating_add(1);
                    if state.metadata_corruptions >= threshold {
                        state.enabled = false;
                    }
                    (state.metadata_corruptions, !state.enabled)
                })?;
                if tripped {
                    tracing::warn!(
                        target = "brew.cache",
                        corruptions = seen,
                        threshold,
                        "image metadata keeps getting corrupted; disabling image cache"
                    );
                    return Ok(());
                }
                tracing::warn!(
                    target = "brew.cache",
                    corruptions = seen,
                    threshold,
                    "image metadata was corrupt; starting with an empty image cache"
                );
            }
            LoadOutcome::Loaded { .. } => {
                self.state.update(|state| state.metadata_corruptions = 0)?;
            }
            LoadOutcome::Missing | LoadOutcome::Incompatible => {}
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
                "image cache reset for new format version"
            );
        }

        // Runs after the version guard so only files with a surviving record are kept.
        let swept = self.store.disk().sweep(|name| {
            ImageKey::parse_file_name(name).is_some_and(|(key, format)| {
                self.metadata
                    .get(key.as_str())
                    .is_some_and(|record| record.format == format)
            })
        });
        if swept > 0 {
            tracing::debug!(target = "brew.cache", swept, "removed stray image cache files");
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        self.store.clear()?;
        self.metadata.remove_all()
    }

    fn size_on_disk(&self) -> u64 {
        if !self.is_active() {
            return 0;
        }
        self.store.size_on_disk()
    }

    /// Read-only check of `url`; safe from any thread.
    fn lookup(&self, url: &str) -> Lookup<Arc<DynamicImage>> {
        if !self.is_active() {
            return Lookup::Miss;
        }
        let key = ImageKey::for_url(url);

        let Some(record) = self.metadata.get(key.as_str()) else {
            // Payload without a record counts as absent.
            let dangling = ImageFormat::ALL
                .into_iter()
                .any(|format| self.store.disk().exists(&key.file_name(format)));
            return if dangling { Lookup::Damaged } else { Lookup::Miss };
        };

        self.store.lookup(&key.file_name(record.format), |bytes| {
            image_codec::decompress(bytes).map(Arc::new)
        })
    }

    /// Worker-side read: promotes disk hits into memory and removes anything that cannot
    /// be served.
    fn get_cached(&self, url: &str) -> Option<Arc<DynamicImage>> {
        if !self.is_active() {
            return None;
        }
        let key = ImageKey::for_url(url);

        let Some(record) = self.metadata.get(key.as_str()) else {
            for format in ImageFormat::ALL {
                self.store.delete(&key.file_name(format));
            }
            return None;
        };

        let image = self.store.read(&key.file_name(record.format), |bytes| {
            image_codec::decompress(bytes).map(Arc::new)
        });
        if image.is_none() {
            self.forget(&key, "image.unreadable");
        }
        image
    }

    fn invalidate_all(&self) -> Result<()> {
        let records: Vec<_> = self
            .metadata
            .keys()
            .into_iter()
            .filter_map(|digest| {
                let record = self.metadata.get(&digest)?;
                Some((ImageKey::from_digest(&digest)?, record))
            })
            .collect();
        self.metadata.remove_all()?;
        for (key, record) in records {
            self.store.delete(&key.file_name(record.format));
        }
        self.store.memory().clear();
        Ok(())
    }

    fn needs_update(&self, identity: &ImageIdentity) -> bool {
        if !self.is_active() {
            return true;
        }
        let key = ImageKey::for_url(&identity.url);
        match self.metadata.get(key.as_str()) {
            Some(record) => {
                staleness::needs_update(Some(&record), identity)
                    || !self.store.disk().exists(&key.file_name(record.format))
            }
            None => true,
        }
    }

    /// Writes the payload, then the record. A failed record update removes the payload so
    /// no file is left that its metadata does not describe.
    fn persist(
        &self,
        identity: &ImageIdentity,
        image: Arc<DynamicImage>,
        bytes: &[u8],
        format: ImageFormat,
    ) -> Result<()> {
        let key = ImageKey::for_url(&identity.url);
        let file_name = key.file_name(format);
        self.store.write(&file_name, bytes, image)?;

        for other in ImageFormat::ALL.into_iter().filter(|other| *other != format) {
            self.store.delete(&key.file_name(other));
        }

        let record = ImageRecord {
            source_url: identity.url.clone(),
            timestamp: identity.updated_at,
            format,
        };
        let evicted = match self.metadata.put(key.as_str(), record) {
            Ok(evicted) => evicted,
            Err(err) => {
                self.store.delete(&file_name);
                return Err(err);
            }
        };
        for (digest, record) in evicted {
            if let Some(evicted_key) = ImageKey::from_digest(&digest) {
                self.store.delete(&evicted_key.file_name(record.format));
            }
        }
        Ok(())
    }

    fn forget(&self, key: &ImageKey, reason: &'static str) {
        if let Err(err) = self.metadata.remove(key.as_str()) {
            tracing::debug!(
                target = "brew.cache",
                key = %key,
                reason,
                error = %err,
                "failed to drop image metadata record"
            );
        }
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.state.update(|state| {
            state.enabled = enabled;
            if enabled {
                state.metadata_corruptions = 0;
            }
        })?;
        tracing::info!(target = "brew.cache", enabled, "image cache kill switch updated");

        if !enabled {
            self.store.memory().clear();
        } else if !self.initialized.load(Ordering::Acquire) {
            self.initialize()?;
        }
        Ok(())
    }
}
