use paclink_proto::address::{Address, DigiPath};
use paclink_proto::frame::{Ax25Frame, PID_NETROM, PID_NO_L3};
use paclink_proto::netrom::{decode_nodes, is_nodes_broadcast, NODES_SIGNATURE};

fn addr(call: &str, ssid: u8) -> Address {
    Address::new(call, ssid).unwrap()
}

fn entry_bytes(dest: &Address, alias: &str, neighbor: &Address, quality: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(21);
    out.extend_from_slice(&dest.encode(false, false));
    let mut alias_bytes = alias.as_bytes().to_vec();
    alias_bytes.resize(6, b' ');
    out.extend_from_slice(&alias_bytes);
    out.extend_from_slice(&neighbor.encode(false, false));
    out.push(quality);
    out
}

#[test]
fn test_short_form() {
    let origin = addr("K1AAA", 1);
    let mut info = vec![NODES_SIGNATURE];
    info.extend(entry_bytes(&addr("K3CCC", 0), "CITY", &addr("K2BBB", 0), 200));
    info.extend(entry_bytes(&addr("K4DDD", 2), "HILL", &addr("K2BBB", 0), 150));

    let broadcast = decode_nodes(&origin, &info).unwrap();
    assert_eq!(broadcast.origin, origin);
    assert_eq!(broadcast.origin_alias, None);
    assert_eq!(broadcast.entries.len(), 2);
    assert_eq!(broadcast.entries[0].destination, addr("K3CCC", 0));
    assert_eq!(broadcast.entries[0].alias, "CITY");
    assert_eq!(broadcast.entries[0].best_neighbor, addr("K2BBB", 0));
    assert_eq!(broadcast.entries[0].quality, 200);
}

#[test]
fn test_long_form_with_origin_alias() {
    let origin = addr("K1AAA", 1);
    let mut info = vec![NODES_SIGNATURE];
    info.extend_from_slice(b"NODE1 ");
    info.extend(entry_bytes(&addr("K3CCC", 0), "CITY", &addr("K2BBB", 0), 180));

    let broadcast = decode_nodes(&origin, &info).unwrap();
    assert_eq!(broadcast.origin_alias.as_deref(), Some("NODE1"));
    assert_eq!(broadcast.entries.len(), 1);
}

#[test]
fn test_bad_entry_skipped() {
    let origin = addr("K1AAA", 0);
    let mut info = vec![NODES_SIGNATURE];
    // First entry has a non-ASCII destination callsign byte.
    let mut bad = entry_bytes(&addr("K3CCC", 0), "CITY", &addr("K2BBB", 0), 100);
    bad[0] = 0x01;
    info.extend(bad);
    info.extend(entry_bytes(&addr("K4DDD", 0), "GOOD", &addr("K2BBB", 0), 120));

    let broadcast = decode_nodes(&origin, &info).unwrap();
    assert_eq!(broadcast.entries.len(), 1);
    assert_eq!(broadcast.entries[0].destination, addr("K4DDD", 0));
}

#[test]
fn test_no_valid_entries_dropped() {
    let origin = addr("K1AAA", 0);
    // Signature only.
    assert!(decode_nodes(&origin, &[NODES_SIGNATURE]).is_err());

    // One entry, destination undecodable.
    let mut info = vec![NODES_SIGNATURE];
    let mut bad = entry_bytes(&addr("K3CCC", 0), "CITY", &addr("K2BBB", 0), 100);
    bad[0] = 0x01;
    info.extend(bad);
    assert!(decode_nodes(&origin, &info).is_err());
}

#[test]
fn test_misaligned_body_rejected() {
    let origin = addr("K1AAA", 0);
    let info = vec![NODES_SIGNATURE, 0x41, 0x42, 0x43];
    assert!(decode_nodes(&origin, &info).is_err());
}

#[test]
fn test_missing_signature_rejected() {
    let origin = addr("K1AAA", 0);
    let info = entry_bytes(&addr("K3CCC", 0), "CITY", &addr("K2BBB", 0), 100);
    assert!(decode_nodes(&origin, &info).is_err());
}

#[test]
fn test_is_nodes_broadcast() {
    let frame = Ax25Frame::ui(
        addr("K1AAA", 0),
        addr("NODES", 0),
        DigiPath::empty(),
        PID_NETROM,
        vec![NODES_SIGNATURE],
    );
    assert!(is_nodes_broadcast(&frame));

    let wrong_pid = Ax25Frame::ui(
        addr("K1AAA", 0),
        addr("NODES", 0),
        DigiPath::empty(),
        PID_NO_L3,
        vec![NODES_SIGNATURE],
    );
    assert!(!is_nodes_broadcast(&wrong_pid));

    let wrong_dest = Ax25Frame::ui(
        addr("K1AAA", 0),
        addr("K2BBB", 0),
        DigiPath::empty(),
        PID_NETROM,
        vec![NODES_SIGNATURE],
    );
    assert!(!is_nodes_broadcast(&wrong_dest));
}
