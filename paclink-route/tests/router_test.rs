use paclink_proto::address::Address;
use paclink_proto::classify::Classification;
use paclink_proto::netrom::{NodesBroadcast, NodesEntry};
use paclink_route::{NeighborSource, NetRomRouter, RouteSource, RouterConfig, RouterMode};

fn addr(call: &str) -> Address {
    Address::new(call, 0).unwrap()
}

fn router(mode: RouterMode) -> NetRomRouter {
    let config = RouterConfig {
        mode,
        ..RouterConfig::default()
    };
    NetRomRouter::new(addr("K0ME"), config)
}

fn broadcast(origin: &str, entries: &[(&str, &str, u8)]) -> NodesBroadcast {
    NodesBroadcast {
        origin: addr(origin),
        origin_alias: None,
        entries: entries
            .iter()
            .map(|(dest, neighbor, quality)| NodesEntry {
                destination: addr(dest),
                alias: String::new(),
                best_neighbor: addr(neighbor),
                quality: *quality,
            })
            .collect(),
    }
}

#[test]
fn test_direct_traffic_creates_neighbor() {
    let mut r = router(RouterMode::Hybrid);
    r.observe_direct(&addr("K1AAA"), Classification::DataProgress, 1_000);
    let n = r.neighbor(&addr("K1AAA")).unwrap();
    assert_eq!(n.source, NeighborSource::Classic);
    assert!(n.quality > 0);
    assert_eq!(n.last_seen_ms, 1_000);
}

#[test]
fn test_neighbor_quality_converges_without_pegging() {
    let mut r = router(RouterMode::Hybrid);
    let mut t = 0i64;
    for _ in 0..150 {
        t += 1_000;
        r.observe_direct(&addr("K1AAA"), Classification::DataProgress, t);
    }
    let q = r.neighbor(&addr("K1AAA")).unwrap().quality;
    assert!(q > 150, "quality {q} too low");
    assert!(q < 255, "quality must not peg at 255");

    // Another hundred observations stay put.
    for _ in 0..100 {
        t += 1_000;
        r.observe_direct(&addr("K1AAA"), Classification::DataProgress, t);
    }
    assert!(r.neighbor(&addr("K1AAA")).unwrap().quality < 255);
}

#[test]
fn test_mutual_traffic_boosts_quality() {
    let mut one_way = router(RouterMode::Hybrid);
    let mut two_way = router(RouterMode::Hybrid);
    let mut t = 0i64;
    for _ in 0..50 {
        t += 1_000;
        one_way.observe_direct(&addr("K1AAA"), Classification::DataProgress, t);
        two_way.note_outgoing(&addr("K1AAA"), t);
        two_way.observe_direct(&addr("K1AAA"), Classification::DataProgress, t);
    }
    let q1 = one_way.neighbor(&addr("K1AAA")).unwrap().quality;
    let q2 = two_way.neighbor(&addr("K1AAA")).unwrap().quality;
    assert!(q2 > q1, "mutual {q2} should exceed one-way {q1}");
}

#[test]
fn test_infrastructure_packets_create_no_neighbor() {
    let mut r = router(RouterMode::Hybrid);
    r.observe_direct(&addr("K1AAA"), Classification::UiBeacon, 1_000);
    r.observe_direct(&addr("K2BBB"), Classification::RoutingBroadcast, 1_000);
    assert!(r.neighbor(&addr("K1AAA")).is_none());
    assert!(r.neighbor(&addr("K2BBB")).is_none());

    // But beacons keep an existing neighbor fresh.
    r.observe_direct(&addr("K1AAA"), Classification::DataProgress, 2_000);
    r.observe_direct(&addr("K1AAA"), Classification::UiBeacon, 3_000);
    assert_eq!(r.neighbor(&addr("K1AAA")).unwrap().last_seen_ms, 3_000);
}

#[test]
fn test_broadcast_quality_math() {
    let mut r = router(RouterMode::Classic);
    // No neighbor entry for the origin: the default path quality applies.
    r.ingest_broadcast(&broadcast("K2BBB", &[("K3CCC", "K2BBB", 200)]), 1_000);
    let routes = r.routes_to(&addr("K3CCC"));
    assert_eq!(routes.len(), 1);
    // ((200 * 192) + 128) / 256 = 150
    assert_eq!(routes[0].quality, 150);
    assert_eq!(routes[0].source, RouteSource::Broadcast);
    assert_eq!(routes[0].origin, addr("K2BBB"));
}

#[test]
fn test_broadcast_loop_rejection() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(
        &broadcast("K2BBB", &[("K0ME", "K2BBB", 250), ("K3CCC", "K2BBB", 250)]),
        1_000,
    );
    assert!(r.routes_to(&addr("K0ME")).is_empty());
    assert_eq!(r.routes_to(&addr("K3CCC")).len(), 1);
}

#[test]
fn test_broadcast_quality_floor() {
    let mut r = router(RouterMode::Classic);
    // ((10 * 192) + 128) / 256 = 8, below the floor of 10.
    r.ingest_broadcast(&broadcast("K2BBB", &[("K3CCC", "K2BBB", 10)]), 1_000);
    assert!(r.routes_to(&addr("K3CCC")).is_empty());
}

#[test]
fn test_max_routes_per_destination() {
    let mut r = router(RouterMode::Classic);
    for (i, origin) in ["N1AAA", "N2BBB", "N3CCC", "N4DDD"].iter().enumerate() {
        r.ingest_broadcast(
            &broadcast(origin, &[("K9DST", origin, 100 + (i as u8) * 20)]),
            1_000,
        );
    }
    let routes = r.routes_to(&addr("K9DST"));
    assert_eq!(routes.len(), 3);
    // The weakest advertisement (from N1AAA) was dropped.
    assert!(routes.iter().all(|r| r.origin != addr("N1AAA")));
    // Ordered by descending quality.
    assert!(routes.windows(2).all(|w| w[0].quality >= w[1].quality));
}

#[test]
fn test_inference_scenario() {
    let mut r = router(RouterMode::Inference);
    for i in 0..3 {
        r.observe_third_party(
            &addr("K1AAA"),
            &addr("K3CCC"),
            &[addr("K2BBB")],
            1_000 + i * 5_000,
        );
    }

    // Exactly one inferred route to the source, through the digipeater.
    let routes = r.routes_to(&addr("K1AAA"));
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].source, RouteSource::Inferred);
    assert_eq!(routes[0].origin, addr("K2BBB"));
    assert!(routes[0].path.contains(&addr("K2BBB")));

    // No route to the digipeater via the source.
    assert!(r.routes_to(&addr("K2BBB")).is_empty());

    // The digipeater became an inferred neighbor.
    assert_eq!(
        r.neighbor(&addr("K2BBB")).unwrap().source,
        NeighborSource::Inferred
    );
}

#[test]
fn test_inference_evidence_reinforces_quality() {
    let mut r = router(RouterMode::Inference);
    r.observe_third_party(&addr("K1AAA"), &addr("K3CCC"), &[addr("K2BBB")], 0);
    let first = r.routes_to(&addr("K1AAA"))[0].quality;
    for i in 1..6 {
        r.observe_third_party(&addr("K1AAA"), &addr("K3CCC"), &[addr("K2BBB")], i * 2_000);
    }
    let reinforced = r.routes_to(&addr("K1AAA"))[0].quality;
    assert!(reinforced > first);
    assert!(reinforced <= 192);
}

#[test]
fn test_classic_mode_ignores_third_party_traffic() {
    let mut r = router(RouterMode::Classic);
    r.observe_third_party(&addr("K1AAA"), &addr("K3CCC"), &[addr("K2BBB")], 1_000);
    assert!(r.routes_to(&addr("K1AAA")).is_empty());
    assert!(r.neighbor(&addr("K2BBB")).is_none());
}

#[test]
fn test_inference_mode_ignores_broadcasts() {
    let mut r = router(RouterMode::Inference);
    r.ingest_broadcast(&broadcast("K2BBB", &[("K3CCC", "K2BBB", 200)]), 1_000);
    assert!(r.routes_to(&addr("K3CCC")).is_empty());
}

#[test]
fn test_local_involvement_ignored_by_inference() {
    let mut r = router(RouterMode::Inference);
    // We are the source.
    r.observe_third_party(&addr("K0ME"), &addr("K3CCC"), &[addr("K2BBB")], 0);
    // We are the destination.
    r.observe_third_party(&addr("K1AAA"), &addr("K0ME"), &[addr("K2BBB")], 0);
    // We are in the via path.
    r.observe_third_party(&addr("K1AAA"), &addr("K3CCC"), &[addr("K0ME")], 0);
    // Next hop would equal the destination.
    r.observe_third_party(&addr("K1AAA"), &addr("K3CCC"), &[addr("K1AAA")], 0);
    assert!(r.routes().is_empty());
}

#[test]
fn test_hybrid_tags_sources() {
    let mut r = router(RouterMode::Hybrid);
    r.ingest_broadcast(&broadcast("K2BBB", &[("K9DST", "K2BBB", 200)]), 1_000);
    r.observe_third_party(&addr("K9DST"), &addr("K3CCC"), &[addr("K4DDD")], 1_000);
    let routes = r.routes_to(&addr("K9DST"));
    assert_eq!(routes.len(), 2);
    assert!(routes.iter().any(|r| r.source == RouteSource::Broadcast));
    assert!(routes.iter().any(|r| r.source == RouteSource::Inferred));
    // Broadcast quality (150) beats the inferred base (64).
    assert_eq!(routes[0].source, RouteSource::Broadcast);
}

#[test]
fn test_best_route_hysteresis_margin() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(&broadcast("N1AAA", &[("K9DST", "N1AAA", 180)]), 0);
    let preferred = r.best_route_to(&addr("K9DST"), 0).unwrap();
    assert_eq!(preferred.origin, addr("N1AAA"));

    // A challenger within the 12% margin does not displace the preferred
    // route, even after the hold time.
    r.ingest_broadcast(&broadcast("N2BBB", &[("K9DST", "N2BBB", 190)]), 200_000);
    let still = r.best_route_to(&addr("K9DST"), 200_000).unwrap();
    assert_eq!(still.origin, addr("N1AAA"));
}

#[test]
fn test_best_route_hysteresis_hold_time() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(&broadcast("N1AAA", &[("K9DST", "N1AAA", 120)]), 0);
    r.best_route_to(&addr("K9DST"), 0).unwrap();

    // Clearly better challenger, but inside the hold window.
    r.ingest_broadcast(&broadcast("N2BBB", &[("K9DST", "N2BBB", 250)]), 10_000);
    let held = r.best_route_to(&addr("K9DST"), 10_000).unwrap();
    assert_eq!(held.origin, addr("N1AAA"));

    // After the hold expires the switch happens.
    let switched = r.best_route_to(&addr("K9DST"), 130_000).unwrap();
    assert_eq!(switched.origin, addr("N2BBB"));
}

#[test]
fn test_best_route_never_returns_expired() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(&broadcast("N1AAA", &[("K9DST", "N1AAA", 200)]), 0);
    assert!(r.best_route_to(&addr("K9DST"), 0).is_some());

    // Past the route TTL: nothing selectable, though still listed.
    assert!(r.best_route_to(&addr("K9DST"), 2_000_000).is_none());
    assert_eq!(r.routes_to(&addr("K9DST")).len(), 1);
}

#[test]
fn test_expired_preferred_switches_freely() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(&broadcast("N1AAA", &[("K9DST", "N1AAA", 200)]), 0);
    r.best_route_to(&addr("K9DST"), 0).unwrap();

    // The preferred route ages out; a fresh weaker one takes over
    // immediately, margin and hold notwithstanding.
    r.ingest_broadcast(&broadcast("N2BBB", &[("K9DST", "N2BBB", 50)]), 1_900_000);
    let switched = r.best_route_to(&addr("K9DST"), 1_900_000).unwrap();
    assert_eq!(switched.origin, addr("N2BBB"));
}

#[test]
fn test_route_ordering_deterministic() {
    let mut r = router(RouterMode::Classic);
    r.ingest_broadcast(&broadcast("N1AAA", &[("K9DST", "N1AAA", 100)]), 0);
    r.ingest_broadcast(&broadcast("N2BBB", &[("K9DST", "N2BBB", 100)]), 0);
    r.ingest_broadcast(&broadcast("N1AAA", &[("A1AAA", "N1AAA", 200)]), 0);
    let routes = r.routes();
    // Ascending destination, then descending quality, then origin.
    assert_eq!(routes[0].destination, addr("A1AAA"));
    assert_eq!(routes[1].destination, addr("K9DST"));
    assert_eq!(routes[1].origin, addr("N1AAA"));
    assert_eq!(routes[2].origin, addr("N2BBB"));
}

#[test]
fn test_neighbor_ordering_deterministic() {
    let mut r = router(RouterMode::Hybrid);
    let mut t = 0;
    for _ in 0..30 {
        t += 1_000;
        r.observe_direct(&addr("K1AAA"), Classification::DataProgress, t);
    }
    r.observe_direct(&addr("A2BBB"), Classification::DataProgress, t);
    let neighbors = r.neighbors();
    assert_eq!(neighbors[0].callsign, addr("K1AAA"));
    assert_eq!(neighbors[1].callsign, addr("A2BBB"));
}
