#![allow(dead_code)]

use paclink_core::{CoreConfig, CoreEvent, SessionCoordinator};
use paclink_proto::address::{Address, DigiPath};
use paclink_proto::time::ManualTimeProvider;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn addr(call: &str) -> Address {
    Address::new(call, 0).unwrap()
}

/// Config with the token buckets opened wide so tests exchange frames
/// without pacing delays.
pub fn test_config() -> CoreConfig {
    CoreConfig {
        scheduler_rate: 10_000.0,
        scheduler_burst: 10_000.0,
        ..CoreConfig::default()
    }
}

pub fn coordinator(
    call: &str,
    seed: u64,
    clock: &Arc<ManualTimeProvider>,
) -> SessionCoordinator {
    let time: Arc<dyn paclink_proto::time::TimeProvider> = clock.clone();
    SessionCoordinator::new(
        addr(call),
        test_config(),
        rand::rngs::StdRng::seed_from_u64(seed),
        time,
    )
}

pub fn clock() -> Arc<ManualTimeProvider> {
    Arc::new(ManualTimeProvider::new(Instant::now(), 1_700_000_000_000))
}

/// Ferries frames between two coordinators until both sides go quiet,
/// advancing time so delayed acks and pending timers fire.
pub fn pump(
    a: &mut SessionCoordinator,
    b: &mut SessionCoordinator,
    clock: &Arc<ManualTimeProvider>,
    packet_id: &mut i64,
) {
    for _ in 0..500 {
        let from_a = a.take_outbound();
        let from_b = b.take_outbound();
        if from_a.is_empty() && from_b.is_empty() {
            clock.advance(Duration::from_millis(300));
            a.poll_timers();
            b.poll_timers();
            let retry_a = a.take_outbound();
            let retry_b = b.take_outbound();
            if retry_a.is_empty() && retry_b.is_empty() {
                return;
            }
            for frame in retry_a {
                *packet_id += 1;
                b.handle_packet(&frame, *packet_id);
            }
            for frame in retry_b {
                *packet_id += 1;
                a.handle_packet(&frame, *packet_id);
            }
            continue;
        }
        for frame in from_a {
            *packet_id += 1;
            b.handle_packet(&frame, *packet_id);
        }
        for frame in from_b {
            *packet_id += 1;
            a.handle_packet(&frame, *packet_id);
        }
    }
    panic!("coordinators never went quiet");
}

/// Establishes a connected pair with the handshake fully drained.
pub fn connected_pair(
    clock: &Arc<ManualTimeProvider>,
    packet_id: &mut i64,
) -> (SessionCoordinator, SessionCoordinator) {
    let mut a = coordinator("K1AAA", 11, clock);
    let mut b = coordinator("K2BBB", 22, clock);
    a.connect(addr("K2BBB"), DigiPath::empty()).unwrap();
    pump(&mut a, &mut b, clock, packet_id);
    (a, b)
}

pub fn drain_events(c: &mut SessionCoordinator) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Some(ev) = c.poll_event() {
        events.push(ev);
    }
    events
}
