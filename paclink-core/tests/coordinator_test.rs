mod common;

use common::{addr, clock, connected_pair, coordinator, drain_events, pump};
use paclink_core::{CapabilityStatus, CoreError, CoreEvent};
use paclink_proto::address::DigiPath;
use paclink_proto::axdp::AxdpMessage;
use paclink_proto::frame::{Ax25Frame, PID_NO_L3};
use paclink_session::SessionState;
use std::time::Duration;

#[test]
fn test_connect_establishes_both_sides() {
    let clock = clock();
    let mut packet_id = 0;
    let (a, b) = connected_pair(&clock, &mut packet_id);
    assert_eq!(a.session_state(&addr("K2BBB")), Some(SessionState::Connected));
    assert_eq!(b.session_state(&addr("K1AAA")), Some(SessionState::Connected));
}

#[test]
fn test_session_state_events_surface() {
    let clock = clock();
    let mut packet_id = 0;
    let (mut a, _b) = connected_pair(&clock, &mut packet_id);
    let events = drain_events(&mut a);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::SessionStateChanged {
            new: SessionState::Connected,
            ..
        }
    )));
}

#[test]
fn test_chat_round_trip() {
    let clock = clock();
    let mut packet_id = 0;
    let (mut a, mut b) = connected_pair(&clock, &mut packet_id);
    drain_events(&mut a);
    drain_events(&mut b);

    a.send_chat(&addr("K2BBB"), "Hi!").unwrap();
    pump(&mut a, &mut b, &clock, &mut packet_id);

    let events = drain_events(&mut b);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ChatReceived { from, text } if *from == addr("K1AAA") && text == "Hi!"
    )));
}

#[test]
fn test_chat_over_ui_without_session() {
    let clock = clock();
    let mut packet_id = 0;
    let mut a = coordinator("K1AAA", 1, &clock);
    let mut b = coordinator("K2BBB", 2, &clock);

    a.send_chat(&addr("K2BBB"), "connectionless hello").unwrap();
    pump(&mut a, &mut b, &clock, &mut packet_id);

    let events = drain_events(&mut b);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ChatReceived { text, .. } if text == "connectionless hello"
    )));
}

#[test]
fn test_raw_session_data_event() {
    let clock = clock();
    let mut packet_id = 0;
    let (mut a, mut b) = connected_pair(&clock, &mut packet_id);
    drain_events(&mut b);

    a.send_raw(&addr("K2BBB"), b"plain terminal bytes").unwrap();
    pump(&mut a, &mut b, &clock, &mut packet_id);

    let events = drain_events(&mut b);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::DataReceived { bytes, .. } if bytes == b"plain terminal bytes"
    )));
}

#[test]
fn test_capability_negotiation_on_connect() {
    let clock = clock();
    let mut packet_id = 0;
    let (a, b) = connected_pair(&clock, &mut packet_id);

    // The initiator pinged automatically and got a pong back.
    assert_eq!(
        a.capabilities().status(&addr("K2BBB")),
        CapabilityStatus::Confirmed
    );
    // The responder learned our support from the ping itself.
    assert_eq!(
        b.capabilities().status(&addr("K1AAA")),
        CapabilityStatus::Confirmed
    );
}

#[test]
fn test_capability_timeout_marks_unsupported() {
    let clock = clock();
    let mut packet_id = 0;
    let mut a = coordinator("K1AAA", 1, &clock);
    let mut b = coordinator("K2BBB", 2, &clock);

    a.connect(addr("K2BBB"), DigiPath::empty()).unwrap();
    // Complete the AX.25 handshake by hand, swallowing B's AXDP pong so the
    // ping goes unanswered.
    for _ in 0..20 {
        for frame in a.take_outbound() {
            packet_id += 1;
            // Deliver only U and S frames; drop I frames carrying the ping.
            if frame.pid.is_none() {
                b.handle_packet(&frame, packet_id);
            }
        }
        for frame in b.take_outbound() {
            packet_id += 1;
            if frame.pid.is_none() {
                a.handle_packet(&frame, packet_id);
            }
        }
        clock.advance(Duration::from_millis(200));
        a.poll_timers();
        b.poll_timers();
    }
    assert_eq!(
        a.capabilities().status(&addr("K2BBB")),
        CapabilityStatus::Pending
    );

    // Past the discovery timeout with no pong.
    clock.advance(Duration::from_secs(31));
    a.poll_timers();
    assert_eq!(
        a.capabilities().status(&addr("K2BBB")),
        CapabilityStatus::Unsupported
    );
    let events = drain_events(&mut a);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::CapabilityChanged {
            status: CapabilityStatus::Unsupported,
            ..
        }
    )));
}

#[test]
fn test_peer_badges_over_ui() {
    let clock = clock();
    let mut packet_id = 0;
    let mut b = coordinator("K2BBB", 2, &clock);

    let badge = AxdpMessage::peer_badge(true);
    let frame = Ax25Frame::ui(
        addr("K1AAA"),
        addr("K2BBB"),
        DigiPath::empty(),
        PID_NO_L3,
        badge.encode(),
    );
    packet_id += 1;
    b.handle_packet(&frame, packet_id);

    assert_eq!(b.capabilities().badge(&addr("K1AAA")), Some(true));
    let events = drain_events(&mut b);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::PeerAxdpEnabled { from } if *from == addr("K1AAA")
    )));

    let badge_off = AxdpMessage::peer_badge(false);
    let frame = Ax25Frame::ui(
        addr("K1AAA"),
        addr("K2BBB"),
        DigiPath::empty(),
        PID_NO_L3,
        badge_off.encode(),
    );
    packet_id += 1;
    b.handle_packet(&frame, packet_id);
    assert_eq!(b.capabilities().badge(&addr("K1AAA")), Some(false));
}

#[test]
fn test_subscription_is_exclusive() {
    let clock = clock();
    let mut c = coordinator("K1AAA", 1, &clock);
    c.attach_packet_source().unwrap();
    assert!(matches!(
        c.attach_packet_source(),
        Err(CoreError::DuplicateSubscription)
    ));
    c.detach_packet_source();
    c.attach_packet_source().unwrap();
}

#[test]
fn test_single_rr_per_inbound_i_frame() {
    let clock = clock();
    let mut packet_id = 0;
    let (mut a, mut b) = connected_pair(&clock, &mut packet_id);

    a.send_raw(&addr("K2BBB"), b"x").unwrap();
    for frame in a.take_outbound() {
        packet_id += 1;
        b.handle_packet(&frame, packet_id);
    }
    // Let the delayed-ack timer fire repeatedly; only one RR may appear.
    let mut rr_count = 0;
    for _ in 0..5 {
        clock.advance(Duration::from_millis(300));
        b.poll_timers();
        for frame in b.take_outbound() {
            if matches!(
                frame.control,
                paclink_proto::frame::Control::S {
                    kind: paclink_proto::frame::SFrame::Rr,
                    ..
                }
            ) {
                rr_count += 1;
            }
        }
    }
    assert_eq!(rr_count, 1);
}

#[test]
fn test_nodes_broadcast_feeds_router() {
    let clock = clock();
    let mut packet_id = 0;
    let mut c = coordinator("K0ME", 1, &clock);

    // Build a broadcast: K2BBB advertises a route to K3CCC.
    let mut info = vec![0xFF];
    info.extend_from_slice(&addr("K3CCC").encode(false, false));
    info.extend_from_slice(b"CITY  ");
    info.extend_from_slice(&addr("K2BBB").encode(false, false));
    info.push(200);
    let frame = Ax25Frame::ui(
        addr("K2BBB"),
        addr("NODES"),
        DigiPath::empty(),
        paclink_proto::frame::PID_NETROM,
        info,
    );
    packet_id += 1;
    c.handle_packet(&frame, packet_id);

    assert_eq!(c.router().routes_to(&addr("K3CCC")).len(), 1);
    let events = drain_events(&mut c);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::NodesBroadcastReceived { origin } if *origin == addr("K2BBB")
    )));
}

#[test]
fn test_third_party_traffic_reaches_inference() {
    let clock = clock();
    let mut packet_id = 0;
    let mut c = coordinator("K0ME", 1, &clock);

    let frame = Ax25Frame::ui(
        addr("K1AAA"),
        addr("K3CCC"),
        DigiPath::new([addr("K2BBB")]).unwrap(),
        PID_NO_L3,
        b"overheard".to_vec(),
    );
    for _ in 0..3 {
        packet_id += 1;
        c.handle_packet(&frame, packet_id);
    }

    let routes = c.router().routes_to(&addr("K1AAA"));
    assert_eq!(routes.len(), 1);
    assert!(routes[0].path.contains(&addr("K2BBB")));
}

#[test]
fn test_high_water_mark_tracks_packet_ids() {
    let clock = clock();
    let mut packet_id = 0;
    let mut c = coordinator("K0ME", 1, &clock);
    let frame = Ax25Frame::ui(
        addr("K1AAA"),
        addr("K0ME"),
        DigiPath::empty(),
        PID_NO_L3,
        b"data".to_vec(),
    );
    for _ in 0..5 {
        packet_id += 1;
        c.handle_packet(&frame, packet_id);
    }
    assert_eq!(c.last_processed_packet_id(), 5);
}

#[test]
fn test_snapshot_restore_round_trip() {
    let clock = clock();
    let mut packet_id = 0;
    let mut c = coordinator("K0ME", 1, &clock);
    let frame = Ax25Frame::ui(
        addr("K1AAA"),
        addr("K0ME"),
        DigiPath::empty(),
        PID_NO_L3,
        b"evidence".to_vec(),
    );
    for i in 0..10 {
        packet_id += 1;
        c.handle_packet(&frame, packet_id);
        clock.advance(Duration::from_secs(60 + i));
    }

    let snap = c.snapshot(Some("cfg".to_string()));
    assert_eq!(snap.last_packet_id, 10);
    assert!(!snap.neighbors.is_empty());
    assert!(!snap.link_stats.is_empty());

    let mut restored = coordinator("K0ME", 2, &clock);
    restored.restore_snapshot(&snap);
    assert_eq!(restored.last_processed_packet_id(), 10);
    assert_eq!(restored.router().neighbors().len(), snap.neighbors.len());
    assert_eq!(restored.links().stats().len(), snap.link_stats.len());
}
