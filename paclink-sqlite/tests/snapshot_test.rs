use paclink_proto::address::Address;
use paclink_route::{LinkStat, Neighbor, NeighborSource, Route, RouteSource};
use paclink_sqlite::{LoadParams, Snapshot, Storage};

fn addr(call: &str) -> Address {
    Address::new(call, 0).unwrap()
}

fn neighbor(call: &str, quality: u8, last_seen_ms: i64) -> Neighbor {
    Neighbor {
        callsign: addr(call),
        quality,
        last_seen_ms,
        obsolescence_count: 0,
        source: NeighborSource::Classic,
    }
}

fn route(dest: &str, origin: &str, quality: u8, last_updated_ms: i64) -> Route {
    Route {
        destination: addr(dest),
        origin: addr(origin),
        quality,
        path: vec![addr(origin)],
        last_updated_ms,
        source: RouteSource::Broadcast,
    }
}

fn link(from: &str, to: &str, last_updated_ms: i64) -> LinkStat {
    LinkStat {
        from: addr(from),
        to: addr(to),
        quality: 200,
        last_updated_ms,
        df_estimate: Some(0.8),
        dr_estimate: None,
        duplicate_count: 3,
        observation_count: 17,
        ewma_quality: 190,
    }
}

fn snapshot(at_ms: i64) -> Snapshot {
    Snapshot {
        neighbors: vec![neighbor("K1AAA", 180, at_ms), neighbor("K2BBB", 120, at_ms)],
        routes: vec![
            route("K3CCC", "K1AAA", 150, at_ms),
            route("K3CCC", "K2BBB", 90, at_ms),
        ],
        link_stats: vec![link("K1AAA", "K0ME", at_ms)],
        last_packet_id: 4242,
        config_hash: Some("cfg-v1".to_string()),
        snapshot_timestamp_ms: at_ms,
    }
}

fn load_params(now_ms: i64) -> LoadParams {
    LoadParams {
        now_ms,
        max_snapshot_age_ms: 3_600_000,
        expected_config_hash: Some("cfg-v1".to_string()),
        entry_ttl_ms: 1_800_000,
        sliding_window_ms: 900_000,
    }
}

#[test]
fn test_round_trip() {
    let storage = Storage::open_in_memory().unwrap();
    let snap = snapshot(1_000_000);
    storage.save_snapshot(&snap).unwrap();

    let loaded = storage.load_snapshot(&load_params(1_100_000)).unwrap().unwrap();
    assert_eq!(loaded.last_packet_id, 4242);
    assert_eq!(loaded.config_hash.as_deref(), Some("cfg-v1"));
    assert_eq!(loaded.neighbors.len(), 2);
    assert_eq!(loaded.routes.len(), 2);
    assert_eq!(loaded.link_stats.len(), 1);
    assert_eq!(loaded.link_stats[0], snap.link_stats[0]);
}

#[test]
fn test_save_replaces_previous_snapshot() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_snapshot(&snapshot(1_000_000)).unwrap();

    let mut second = snapshot(2_000_000);
    second.neighbors = vec![neighbor("K9ZZZ", 42, 2_000_000)];
    second.last_packet_id = 9000;
    storage.save_snapshot(&second).unwrap();

    let loaded = storage.load_snapshot(&load_params(2_100_000)).unwrap().unwrap();
    assert_eq!(loaded.neighbors.len(), 1);
    assert_eq!(loaded.neighbors[0].callsign, addr("K9ZZZ"));
    assert_eq!(loaded.last_packet_id, 9000);
}

#[test]
fn test_stale_snapshot_rejected() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_snapshot(&snapshot(1_000_000)).unwrap();

    // One millisecond past the allowed age.
    let mut params = load_params(1_000_000 + 3_600_001);
    params.expected_config_hash = Some("cfg-v1".to_string());
    assert!(storage.load_snapshot(&params).unwrap().is_none());
}

#[test]
fn test_config_hash_mismatch_rejected() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_snapshot(&snapshot(1_000_000)).unwrap();

    let mut params = load_params(1_100_000);
    params.expected_config_hash = Some("other-config".to_string());
    assert!(storage.load_snapshot(&params).unwrap().is_none());

    // Not providing an expectation skips the check.
    params.expected_config_hash = None;
    assert!(storage.load_snapshot(&params).unwrap().is_some());
}

#[test]
fn test_empty_store_loads_none() {
    let storage = Storage::open_in_memory().unwrap();
    assert!(storage.load_snapshot(&load_params(1_000)).unwrap().is_none());
}

#[test]
fn test_expired_entries_kept_with_zero_quality() {
    let storage = Storage::open_in_memory().unwrap();
    let mut snap = snapshot(10_000_000);
    // This neighbor is far older than the entry TTL.
    snap.neighbors.push(neighbor("K7OLD", 200, 1_000));
    storage.save_snapshot(&snap).unwrap();

    let loaded = storage.load_snapshot(&load_params(10_100_000)).unwrap().unwrap();
    let old = loaded
        .neighbors
        .iter()
        .find(|n| n.callsign == addr("K7OLD"))
        .unwrap();
    assert_eq!(old.quality, 0);
    // Fresh entries keep their quality.
    let fresh = loaded
        .neighbors
        .iter()
        .find(|n| n.callsign == addr("K1AAA"))
        .unwrap();
    assert_eq!(fresh.quality, 180);
}

#[test]
fn test_timestamp_sanitization() {
    let storage = Storage::open_in_memory().unwrap();
    let mut snap = snapshot(10_000_000);
    snap.neighbors.push(neighbor("K6BAD", 100, 0));
    snap.neighbors.push(neighbor("K5NEG", 100, -documented_past()));
    // A valid 1971 timestamp is history, not garbage.
    snap.neighbors.push(neighbor("K4HIS", 100, 31_536_000_000));
    storage.save_snapshot(&snap).unwrap();

    let loaded = storage.load_snapshot(&load_params(10_000_000)).unwrap().unwrap();
    let expect_normalized = 10_000_000 - 900_000;
    for call in ["K6BAD", "K5NEG"] {
        let n = loaded
            .neighbors
            .iter()
            .find(|n| n.callsign == addr(call))
            .unwrap();
        assert_eq!(n.last_seen_ms, expect_normalized, "{call}");
    }
    let historical = loaded
        .neighbors
        .iter()
        .find(|n| n.callsign == addr("K4HIS"))
        .unwrap();
    assert_eq!(historical.last_seen_ms, 31_536_000_000);
}

fn documented_past() -> i64 {
    // A "distant past" sentinel some exporters write.
    62_135_596_800_000
}

#[test]
fn test_evidence_counts_round_trip() {
    let storage = Storage::open_in_memory().unwrap();
    storage.save_snapshot(&snapshot(1_000_000)).unwrap();
    let loaded = storage.load_snapshot(&load_params(1_100_000)).unwrap().unwrap();
    let stat = &loaded.link_stats[0];
    assert_eq!(stat.observation_count, 17);
    assert_eq!(stat.duplicate_count, 3);
    assert_eq!(stat.df_estimate, Some(0.8));
    // A never-observed reverse ratio stays absent.
    assert_eq!(stat.dr_estimate, None);
}

#[test]
fn test_dr_estimate_round_trips_when_present() {
    let storage = Storage::open_in_memory().unwrap();
    let mut snap = snapshot(1_000_000);
    snap.link_stats[0].dr_estimate = Some(0.65);
    storage.save_snapshot(&snap).unwrap();
    let loaded = storage.load_snapshot(&load_params(1_100_000)).unwrap().unwrap();
    assert_eq!(loaded.link_stats[0].dr_estimate, Some(0.65));
}

#[test]
fn test_load_ordering_deterministic() {
    let storage = Storage::open_in_memory().unwrap();
    let mut snap = snapshot(1_000_000);
    snap.neighbors = vec![
        neighbor("M3MMM", 120, 1_000_000),
        neighbor("A1AAA", 120, 1_000_000),
        neighbor("Z9ZZZ", 250, 1_000_000),
    ];
    storage.save_snapshot(&snap).unwrap();

    let loaded = storage.load_snapshot(&load_params(1_100_000)).unwrap().unwrap();
    let calls: Vec<String> = loaded
        .neighbors
        .iter()
        .map(|n| n.callsign.to_string())
        .collect();
    // Descending quality, then callsign.
    assert_eq!(calls, vec!["Z9ZZZ", "A1AAA", "M3MMM"]);

    // Routes: ascending destination, then descending quality, then origin.
    let routes: Vec<(String, String)> = loaded
        .routes
        .iter()
        .map(|r| (r.destination.to_string(), r.origin.to_string()))
        .collect();
    assert_eq!(
        routes,
        vec![
            ("K3CCC".to_string(), "K1AAA".to_string()),
            ("K3CCC".to_string(), "K2BBB".to_string()),
        ]
    );
}

#[test]
fn test_prune_old_entries() {
    let storage = Storage::open_in_memory().unwrap();
    let now = 30i64 * 86_400_000;
    let mut snap = snapshot(now);
    snap.neighbors.push(neighbor("K7OLD", 50, 1_000));
    snap.routes.push(route("K8OLD", "K7OLD", 50, 1_000));
    snap.link_stats.push(link("K7OLD", "K0ME", 1_000));
    storage.save_snapshot(&snap).unwrap();

    let (n, r, l) = storage.prune_old_entries(7, now).unwrap();
    assert_eq!((n, r, l), (1, 1, 1));

    let mut params = load_params(now);
    params.max_snapshot_age_ms = i64::MAX;
    let loaded = storage.load_snapshot(&params).unwrap().unwrap();
    assert!(loaded.neighbors.iter().all(|n| n.callsign != addr("K7OLD")));
    assert_eq!(loaded.routes.len(), 2);
    assert_eq!(loaded.link_stats.len(), 1);
}

#[test]
fn test_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paclink.db");
    {
        let storage = Storage::open(&path).unwrap();
        storage.save_snapshot(&snapshot(1_000_000)).unwrap();
    }
    let storage = Storage::open(&path).unwrap();
    let loaded = storage.load_snapshot(&load_params(1_100_000)).unwrap().unwrap();
    assert_eq!(loaded.last_packet_id, 4242);
}
