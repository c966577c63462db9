// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_cache_read -- -runs=1000
#![no_main]

use brew_cache::{
    CacheConfig, DataCache, DataKind, DataRecord, ImageCache, ImageFormat, ImageKey, ImageRecord,
    ManualClock, MetadataRegistry, Timestamp,
};
use libfuzzer_sys::fuzz_target;
use std::path::Path;
use std::sync::Arc;

const MAX_INPUT_SIZE: usize = 256 * 1024;
const URL: &str = "https://cdn.example.com/fuzz.png";

fn config(root: &Path) -> CacheConfig {
    CacheConfig::new(root.join("cache"), root.join("state")).with_expected_version("fuzz")
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Timestamp::from_millis(1_000)))
}

fn run_data_payload(root: &Path, payload: &[u8]) {
    drop(DataCache::open(config(root), clock()).expect("open data cache"));
    MetadataRegistry::<DataRecord>::new(root.join("state/data-metadata.bin"), 16)
        .put(
            DataKind::Pricing.name(),
            DataRecord {
                identity: DataKind::Pricing.name().to_string(),
                timestamp: Timestamp::from_millis(1_000),
            },
        )
        .expect("seed metadata");
    std::fs::write(root.join("cache/data/pricing.bin"), payload).expect("write payload");

    let cache = DataCache::open(config(root), clock()).expect("reopen data cache");
    let _ = cache.get_cached::<Vec<(String, u64)>>(DataKind::Pricing);
}

fn run_image_payload(root: &Path, format: ImageFormat, payload: &[u8]) {
    drop(ImageCache::open(config(root), clock()).expect("open image cache"));
    let key = ImageKey::for_url(URL);
    MetadataRegistry::<ImageRecord>::new(root.join("state/image-metadata.bin"), 16)
        .put(
            key.as_str(),
            ImageRecord {
                source_url: URL.to_string(),
                timestamp: Timestamp::from_millis(1_000),
                format,
            },
        )
        .expect("seed metadata");
    std::fs::write(root.join("cache/images").join(key.file_name(format)), payload)
        .expect("write payload");

    let cache = ImageCache::open(config(root), clock()).expect("reopen image cache");
    let _ = cache.get_cached(URL);
}

fn run_metadata_blob(root: &Path, blob: &[u8]) {
    std::fs::create_dir_all(root.join("state")).expect("create state dir");
    std::fs::write(root.join("state/image-metadata.bin"), blob).expect("write blob");
    std::fs::write(root.join("state/data-metadata.bin"), blob).expect("write blob");

    let images = ImageCache::open(config(root), clock()).expect("open image cache");
    let _ = images.get_cached(URL);
    let data = DataCache::open(config(root), clock()).expect("open data cache");
    let _ = data.get_cached::<Vec<String>>(DataKind::MenuCategories);
}

fuzz_target!(|input: &[u8]| {
    let input = &input[..input.len().min(MAX_INPUT_SIZE)];
    let mode = input.first().copied().unwrap_or(0);
    let payload = input.get(1..).unwrap_or(&[]);
    let dir = tempfile::tempdir().expect("failed to create tempdir");

    // Oracle: whatever is on disk, opening and reading must not panic.
    match mode % 4 {
        0 => run_data_payload(dir.path(), payload),
        1 => run_image_payload(dir.path(), ImageFormat::Lossless, payload),
        2 => run_image_payload(dir.path(), ImageFormat::Lossy, payload),
        _ => run_metadata_blob(dir.path(), payload),
    }
});
