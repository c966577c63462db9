use crate::suite::support::{badge, open_images, photo, png_bytes, FakeSource, START};
use brew_cache::{ImageFormat, ImageIdentity, ImageKey, StateFile, Timestamp};
use std::path::Path;

fn image_file(root: &Path, url: &str, format: ImageFormat) -> std::path::PathBuf {
    root.join("cache/images")
        .join(ImageKey::for_url(url).file_name(format))
}

#[tokio::test]
async fn alpha_images_are_stored_losslessly() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    let url = "https://cdn.example.com/badges/gold.png";

    cache.store(&ImageIdentity::new(url, START), badge(200)).await.unwrap();

    assert!(image_file(tmp.path(), url, ImageFormat::Lossless).exists());
    let cached = cache.get_cached_async(url).await.unwrap().unwrap();
    assert_eq!(cached.to_rgba8(), badge(200).to_rgba8());
}

#[tokio::test]
async fn opaque_images_are_stored_lossy_and_smaller() {
    let tmp = tempfile::tempdir().unwrap();
    // No memory tier, so the read below decodes the file.
    let config = crate::suite::support::config(tmp.path(), "1.0").with_memory_capacity(0);
    let cache = brew_cache::ImageCache::open_with_source(
        config,
        std::sync::Arc::new(brew_cache::ManualClock::new(START)),
        FakeSource::new(),
    )
    .unwrap();
    let url = "https://cdn.example.com/promo/latte.jpg";
    let original = photo(7);

    cache.store(&ImageIdentity::new(url, START), original.clone()).await.unwrap();

    let stored = std::fs::read(image_file(tmp.path(), url, ImageFormat::Lossy)).unwrap();
    assert!(stored.len() < png_bytes(&original).len());

    let cached = cache.get_cached(url).unwrap().to_rgb8();
    let original = original.to_rgb8();
    assert_eq!(cached.dimensions(), original.dimensions());
    assert_ne!(cached.as_raw(), original.as_raw());
    let total: u64 = cached
        .as_raw()
        .iter()
        .zip(original.as_raw())
        .map(|(a, b)| u64::from(a.abs_diff(*b)))
        .sum();
    let mean = total as f64 / original.as_raw().len() as f64;
    assert!(mean < 12.0, "mean absolute error too high: {mean}");
}

#[tokio::test]
async fn hydrate_follows_upstream_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let url = "https://cdn.example.com/promo/winter.png";
    source.serve(url, &badge(10));
    let cache = open_images(tmp.path(), "1.0", source.clone());

    let v1 = ImageIdentity::new(url, Timestamp::from_millis(1_000));
    assert!(cache.needs_update(&v1));
    cache.hydrate(&v1).await.unwrap();
    assert_eq!(source.fetches(), 1);
    assert!(!cache.needs_update(&v1));

    // Same identity: served from cache.
    cache.hydrate(&v1).await.unwrap();
    assert_eq!(source.fetches(), 1);

    // Upstream replaced the asset.
    source.serve(url, &badge(250));
    let v2 = ImageIdentity::new(url, Timestamp::from_millis(2_000));
    assert!(cache.needs_update(&v2));
    let image = cache.hydrate(&v2).await.unwrap();
    assert_eq!(source.fetches(), 2);
    assert_eq!(image.to_rgba8(), badge(250).to_rgba8());
    assert!(!cache.needs_update(&v1));
    assert!(!cache.needs_update(&v2));
}

#[tokio::test]
async fn download_failure_changes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let url = "https://cdn.example.com/promo/a.png";
    source.serve(url, &badge(1));
    let cache = open_images(tmp.path(), "1.0", source.clone());
    cache.hydrate(&ImageIdentity::new(url, START)).await.unwrap();

    source.fail(url);
    let newer = ImageIdentity::new(url, START.saturating_add(std::time::Duration::from_secs(60)));
    let err = cache.hydrate(&newer).await.unwrap_err();

    assert!(err.is_network());
    assert!(cache.needs_update(&newer));
    assert!(!cache.needs_update(&ImageIdentity::new(url, START)));
    assert_eq!(cache.get_cached(url).unwrap().to_rgba8(), badge(1).to_rgba8());
}

#[tokio::test]
async fn undecodable_download_is_not_written() {
    let tmp = tempfile::tempdir().unwrap();
    let source = FakeSource::new();
    let url = "https://cdn.example.com/promo/broken.png";
    source.serve_bytes(url, b"<html>502 bad gateway</html>".to_vec());
    let cache = open_images(tmp.path(), "1.0", source);

    let identity = ImageIdentity::new(url, START);
    assert!(cache.hydrate(&identity).await.is_err());
    assert!(cache.needs_update(&identity));
    assert_eq!(cache.cache_size_bytes(), 0);
    assert!(!tmp.path().join("state/image-metadata.bin").exists());
}

#[tokio::test]
async fn corrupt_image_file_heals_to_a_miss() {
    let tmp = tempfile::tempdir().unwrap();
    let config = crate::suite::support::config(tmp.path(), "1.0").with_memory_capacity(0);
    let cache = brew_cache::ImageCache::open_with_source(
        config,
        std::sync::Arc::new(brew_cache::ManualClock::new(START)),
        FakeSource::new(),
    )
    .unwrap();
    let url = "https://cdn.example.com/promo/b.jpg";
    let identity = ImageIdentity::new(url, START);
    cache.store(&identity, photo(1)).await.unwrap();

    let path = image_file(tmp.path(), url, ImageFormat::Lossy);
    std::fs::write(&path, b"\xff\xd8 truncated").unwrap();

    assert!(cache.get_cached(url).is_none());
    cache.flush().await.unwrap();
    assert!(!path.exists());
    assert!(cache.needs_update(&identity));
    assert!(cache.needs_update_async(&identity).await.unwrap());
}

#[tokio::test]
async fn invalidated_images_do_not_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    for i in 0..5u8 {
        let url = format!("https://cdn.example.com/menu/{i}.png");
        cache.store(&ImageIdentity::new(url, START), badge(i)).await.unwrap();
    }
    assert!(cache.cache_size_bytes_async().await.unwrap() > 0);

    cache.invalidate_all().await.unwrap();
    assert_eq!(cache.cache_size_bytes(), 0);
    drop(cache);

    let reopened = open_images(tmp.path(), "1.0", FakeSource::new());
    assert_eq!(reopened.cache_size_bytes(), 0);
    assert_eq!(
        std::fs::read_dir(tmp.path().join("cache/images")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn files_orphaned_by_metadata_loss_are_swept_at_open() {
    let tmp = tempfile::tempdir().unwrap();
    let kept = "https://cdn.example.com/menu/kept.png";
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    cache.store(&ImageIdentity::new(kept, START), badge(9)).await.unwrap();
    drop(cache);

    // A payload for a URL the registry has never heard of.
    let orphan = image_file(
        tmp.path(),
        "https://cdn.example.com/gone.png",
        ImageFormat::Lossless,
    );
    std::fs::write(&orphan, png_bytes(&badge(3))).unwrap();

    let reopened = open_images(tmp.path(), "1.0", FakeSource::new());
    assert!(!orphan.exists());
    assert!(image_file(tmp.path(), kept, ImageFormat::Lossless).exists());
    assert!(reopened.get_cached(kept).is_some());
}

#[test]
fn blocking_reads_never_race_stores() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let url = "https://cdn.example.com/menu/race.png";
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());

    for round in 0..50u8 {
        runtime.block_on(cache.clear_all()).unwrap();

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let cache = cache.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = cache.get_cached(url);
                }
            })
        };

        let identity = ImageIdentity::new(url, START);
        runtime.block_on(cache.store(&identity, badge(round))).unwrap();
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        reader.join().unwrap();
        runtime.block_on(cache.flush()).unwrap();

        assert!(
            image_file(tmp.path(), url, ImageFormat::Lossless).exists(),
            "payload lost in round {round}"
        );
        assert!(!cache.needs_update(&identity));
    }
}

#[tokio::test]
async fn repeated_metadata_corruption_trips_kill_switch() {
    let tmp = tempfile::tempdir().unwrap();
    let blob = tmp.path().join("state/image-metadata.bin");
    let url = "https://cdn.example.com/promo/c.png";
    let garbage = b"\x01\x00\x00\x00\xff\xff\xff\xff\xff\xff\xff\xff";

    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    cache.store(&ImageIdentity::new(url, START), badge(5)).await.unwrap();
    drop(cache);

    std::fs::write(&blob, garbage).unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    assert!(cache.is_enabled());
    assert!(cache.get_cached(url).is_none());
    cache.store(&ImageIdentity::new(url, START), badge(5)).await.unwrap();
    drop(cache);

    std::fs::write(&blob, garbage).unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    assert!(!cache.is_enabled());
    assert!(cache.get_cached(url).is_none());
    assert!(!StateFile::new(tmp.path().join("state/images.json")).load().enabled);

    cache.set_enabled(true).await.unwrap();
    assert!(cache.is_enabled());
    cache.store(&ImageIdentity::new(url, START), badge(6)).await.unwrap();
    assert!(cache.get_cached(url).is_some());
    assert_eq!(
        StateFile::new(tmp.path().join("state/images.json"))
            .load()
            .metadata_corruptions,
        0
    );
}

#[tokio::test]
async fn clean_load_resets_corruption_count() {
    let tmp = tempfile::tempdir().unwrap();
    let blob = tmp.path().join("state/image-metadata.bin");
    let state = StateFile::new(tmp.path().join("state/images.json"));
    let url = "https://cdn.example.com/promo/d.png";

    drop(open_images(tmp.path(), "1.0", FakeSource::new()));
    std::fs::write(&blob, b"garbage").unwrap();

    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    assert_eq!(state.load().metadata_corruptions, 1);
    cache.store(&ImageIdentity::new(url, START), badge(5)).await.unwrap();
    drop(cache);

    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    assert_eq!(state.load().metadata_corruptions, 0);
    assert!(cache.get_cached(url).is_some());
}

#[tokio::test]
async fn invalidate_and_clear() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    let a = "https://cdn.example.com/a.png";
    let b = "https://cdn.example.com/b.jpg";
    cache.store(&ImageIdentity::new(a, START), badge(1)).await.unwrap();
    cache.store(&ImageIdentity::new(b, START), photo(2)).await.unwrap();
    assert!(cache.cache_size_bytes() > 0);

    cache.invalidate_all().await.unwrap();
    assert!(cache.get_cached(a).is_none());
    assert!(!image_file(tmp.path(), a, ImageFormat::Lossless).exists());
    assert!(cache.needs_update(&ImageIdentity::new(b, START)));

    cache.store(&ImageIdentity::new(a, START), badge(1)).await.unwrap();
    cache.clear_all().await.unwrap();
    assert_eq!(cache.cache_size_bytes(), 0);
    assert!(cache.get_cached(a).is_none());
}

#[tokio::test]
async fn get_cached_with_delivers_on_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_images(tmp.path(), "1.0", FakeSource::new());
    let url = "https://cdn.example.com/e.png";
    cache.store(&ImageIdentity::new(url, START), badge(3)).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.get_cached_with(url, move |image| {
        let _ = tx.send(image.map(|image| (image.width(), image.height())));
    });
    assert_eq!(rx.await.unwrap(), Some((24, 24)));
}
