use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use marketsync::cache::{
    CacheClient, CacheConfig, CacheKey, ChangeKind, ChangeNotification, Domain, FetchError,
    FetchOptions, KeyPattern, LocalPushChannel, Mutation,
};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;

fn key(raw: &str) -> CacheKey {
    raw.parse().expect("valid key")
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let channel = LocalPushChannel::default();
    let config = CacheConfig {
        max_entries: 1,
        prefetch_delay_ms: 1,
        ..Default::default()
    };
    let client = CacheClient::new(config, Arc::new(channel.clone()));

    // Miss, hit, dedup join and eviction
    let events = key("home:events:upcoming:5");
    let (first, second) = tokio::join!(
        client.fetch(&events, || async { Ok(vec![1_u32]) }, FetchOptions::new()),
        client.fetch(&events, || async { Ok(vec![2_u32]) }, FetchOptions::new()),
    );
    assert_eq!(first.expect("first"), second.expect("second"));
    client
        .fetch(&events, || async { Ok(vec![3_u32]) }, FetchOptions::new())
        .await
        .expect("hit");
    client.set_cache(key("detail:listings:42"), "Miata".to_string(), None);

    // Fetch error
    let _ = client
        .fetch::<String, _, _>(
            &key("detail:profiles:u1"),
            || async { Err(FetchError::network("offline")) },
            FetchOptions::new(),
        )
        .await;

    // Prefetch outcome
    client.mark_critical_loaded();
    client.prefetch(key("explore:events"), || async { Ok(1_u8) }, None);
    client.start_background();

    // Invalidations from every source
    client.invalidate_cache(KeyPattern::domain(Domain::Listings));
    client.apply_mutation(&Mutation::ForumPostChanged {
        post_id: "p-1".to_string(),
    });
    let _subscription = client
        .subscribe_to_domain_change(Domain::Favorites, None, |_| {})
        .expect("subscribe");
    channel.publish(ChangeNotification::new(Domain::Favorites, ChangeKind::Insert));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "marketsync_cache_hit_total",
        "marketsync_cache_miss_total",
        "marketsync_cache_dedup_join_total",
        "marketsync_cache_evict_total",
        "marketsync_fetch_error_total",
        "marketsync_prefetch_total",
        "marketsync_invalidation_total",
        "marketsync_fetch_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
