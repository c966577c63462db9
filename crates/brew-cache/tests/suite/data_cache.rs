use crate::suite::support::{open_data, START};
use brew_cache::{CacheError, DataKind, ManualClock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct MenuCategory {
    id: String,
    title: String,
    position: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct PriceTable {
    currency: String,
    cents_by_sku: Vec<(String, u64)>,
}

fn categories() -> Vec<MenuCategory> {
    vec![
        MenuCategory {
            id: "hot".into(),
            title: "Hot Coffee".into(),
            position: 0,
        },
        MenuCategory {
            id: "cold".into(),
            title: "Cold Brew".into(),
            position: 1,
        },
    ]
}

fn prices(latte: u64) -> PriceTable {
    PriceTable {
        currency: "USD".into(),
        cents_by_sku: vec![("latte".into(), latte), ("mocha".into(), 525)],
    }
}

#[tokio::test]
async fn staleness_flips_strictly_after_threshold() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);

    for kind in DataKind::ALL {
        assert!(cache.is_stale(kind), "{kind} should start stale");
    }

    cache.store(DataKind::MenuCategories, &categories()).await.unwrap();
    assert!(!cache.is_stale(DataKind::MenuCategories));

    let ttl = DataKind::MenuCategories.default_ttl();
    clock.set(START.saturating_add(ttl));
    assert!(!cache.is_stale(DataKind::MenuCategories));

    clock.set(START.saturating_add(ttl + Duration::from_secs(1)));
    assert!(cache.is_stale(DataKind::MenuCategories));
    // Stale values are still served.
    assert_eq!(
        cache.get_cached::<Vec<MenuCategory>>(DataKind::MenuCategories),
        Some(categories())
    );
}

#[tokio::test]
async fn drink_configuration_outlives_pricing() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);

    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();
    cache
        .store(DataKind::DrinkConfiguration, &vec!["oat".to_string(), "soy".to_string()])
        .await
        .unwrap();

    clock.advance(Duration::from_secs(2 * 24 * 60 * 60));
    assert!(cache.is_stale(DataKind::Pricing));
    assert!(!cache.is_stale(DataKind::DrinkConfiguration));
}

#[tokio::test]
async fn failed_write_records_no_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);

    let data_dir = tmp.path().join("cache/data");
    std::fs::remove_dir_all(&data_dir).unwrap();
    std::fs::write(&data_dir, b"not a directory").unwrap();

    let err = cache.store(DataKind::Pricing, &prices(450)).await.unwrap_err();
    assert!(matches!(err, CacheError::Io(_)), "{err:?}");

    assert!(cache.is_stale(DataKind::Pricing));
    assert_eq!(cache.get_cached::<PriceTable>(DataKind::Pricing), None);
    assert!(!tmp.path().join("state/data-metadata.bin").exists());
}

#[tokio::test]
async fn garbage_payload_reads_as_absent_and_is_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();

    let path = tmp.path().join("cache/data/pricing.bin");
    std::fs::write(&path, b"\x00\x01garbage\xff\xfe").unwrap();

    assert_eq!(cache.get_cached::<PriceTable>(DataKind::Pricing), None);
    cache.flush().await.unwrap();
    assert!(!path.exists());
    assert!(cache.is_stale(DataKind::Pricing));
}

#[tokio::test]
async fn async_read_deletes_garbage_immediately() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();

    let path = tmp.path().join("cache/data/pricing.bin");
    std::fs::write(&path, b"garbage").unwrap();

    assert_eq!(
        cache.get_cached_async::<PriceTable>(DataKind::Pricing).await.unwrap(),
        None
    );
    assert!(!path.exists());
}

#[test]
fn blocking_reads_never_race_stores() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let path = tmp.path().join("cache/data/pricing.bin");

    for round in 0..200u64 {
        let cache = open_data(tmp.path(), "1.0", &clock);
        runtime.block_on(cache.clear_all()).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let cache = cache.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = cache.get_cached::<PriceTable>(DataKind::Pricing);
                }
            })
        };

        runtime
            .block_on(cache.store(DataKind::Pricing, &prices(round)))
            .unwrap();
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        runtime.block_on(cache.flush()).unwrap();

        assert!(path.exists(), "payload lost in round {round}");
        assert!(!cache.is_stale(DataKind::Pricing));
        assert_eq!(
            cache.get_cached::<PriceTable>(DataKind::Pricing),
            Some(prices(round))
        );
    }
}

#[tokio::test]
async fn invalidated_payloads_do_not_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();
    cache.store(DataKind::MenuCategories, &categories()).await.unwrap();

    cache.invalidate_all().await.unwrap();
    assert_eq!(cache.cache_size_bytes(), 0);
    drop(cache);

    let reopened = open_data(tmp.path(), "1.0", &clock);
    assert_eq!(reopened.cache_size_bytes_async().await.unwrap(), 0);
    for kind in DataKind::ALL {
        assert!(reopened.is_stale(kind));
    }
}

#[tokio::test]
async fn values_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    open_data(tmp.path(), "1.0", &clock)
        .store(DataKind::MenuCategories, &categories())
        .await
        .unwrap();

    let reopened = open_data(tmp.path(), "1.0", &clock);
    assert!(!reopened.is_stale(DataKind::MenuCategories));
    assert_eq!(
        reopened
            .get_cached_async::<Vec<MenuCategory>>(DataKind::MenuCategories)
            .await
            .unwrap(),
        Some(categories())
    );
}

#[tokio::test]
async fn get_cached_with_delivers_on_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(400)).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.get_cached_with(DataKind::Pricing, move |value: Option<PriceTable>| {
        let _ = tx.send(value);
    });
    assert_eq!(rx.await.unwrap(), Some(prices(400)));
}

#[tokio::test]
async fn hydrate_skips_fetch_when_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);

    let first = cache
        .hydrate(DataKind::Pricing, || async { Ok(prices(450)) })
        .await
        .unwrap();
    assert_eq!(first, prices(450));

    let refetches = AtomicUsize::new(0);
    let second = cache
        .hydrate(DataKind::Pricing, || async {
            refetches.fetch_add(1, Ordering::SeqCst);
            Ok(prices(999))
        })
        .await
        .unwrap();
    assert_eq!(second, prices(450));
    assert_eq!(refetches.load(Ordering::SeqCst), 0);

    clock.advance(DataKind::Pricing.default_ttl() + Duration::from_secs(1));
    let third = cache
        .hydrate(DataKind::Pricing, || async { Ok(prices(475)) })
        .await
        .unwrap();
    assert_eq!(third, prices(475));
    assert!(!cache.is_stale(DataKind::Pricing));
}

#[tokio::test]
async fn failed_fetch_leaves_cache_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();
    clock.advance(DataKind::Pricing.default_ttl() * 2);

    let err = cache
        .hydrate(DataKind::Pricing, || async {
            Err::<PriceTable, _>(CacheError::Network {
                message: "timed out".into(),
            })
        })
        .await
        .unwrap_err();

    assert!(err.is_network());
    assert!(cache.is_stale(DataKind::Pricing));
    assert_eq!(
        cache.get_cached::<PriceTable>(DataKind::Pricing),
        Some(prices(450))
    );
}

#[tokio::test]
async fn invalidate_one_kind_keeps_the_others() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();
    cache.store(DataKind::MenuCategories, &categories()).await.unwrap();

    cache.invalidate(DataKind::Pricing).await.unwrap();
    assert!(cache.is_stale(DataKind::Pricing));
    assert_eq!(cache.get_cached::<PriceTable>(DataKind::Pricing), None);
    assert!(!tmp.path().join("cache/data/pricing.bin").exists());
    assert!(!cache.is_stale(DataKind::MenuCategories));

    cache.invalidate_all().await.unwrap();
    assert!(cache.is_stale(DataKind::MenuCategories));
    assert_eq!(
        cache.get_cached::<Vec<MenuCategory>>(DataKind::MenuCategories),
        None
    );
}

#[tokio::test]
async fn clear_all_removes_every_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(START);
    let cache = open_data(tmp.path(), "1.0", &clock);
    cache.store(DataKind::Pricing, &prices(450)).await.unwrap();
    cache.store(DataKind::MenuCategories, &categories()).await.unwrap();
    assert!(cache.cache_size_bytes() > 0);

    cache.clear_all().await.unwrap();

    assert_eq!(cache.cache_size_bytes(), 0);
    for kind in DataKind::ALL {
        assert!(cache.is_stale(kind));
    }
    assert!(!tmp.path().join("state/data-metadata.bin").exists());
}
