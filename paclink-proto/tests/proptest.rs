use paclink_proto::address::{Address, DigiPath};
use paclink_proto::axdp::{AxdpMessage, MessageStream};
use paclink_proto::frame::{Ax25Frame, Control};
use paclink_proto::kiss::{self, KissCodec};
use proptest::prelude::*;

fn arb_callsign() -> impl Strategy<Value = String> {
    "[A-Z0-9]{1,6}"
}

fn arb_address() -> impl Strategy<Value = Address> {
    (arb_callsign(), 0u8..=15).prop_map(|(call, ssid)| Address::new(&call, ssid).unwrap())
}

proptest! {
    #[test]
    fn kiss_roundtrip(port in 0u8..16, payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let encoded = kiss::encode(port, &payload);
        let mut codec = KissCodec::new();
        let frames = codec.feed(&encoded);
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].port, port);
        prop_assert_eq!(&frames[0].payload, &payload);
    }

    #[test]
    fn kiss_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let mut codec = KissCodec::new();
        let _ = codec.feed(&bytes);
    }

    #[test]
    fn kiss_roundtrip_split_feeds(
        port in 0u8..16,
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        split in 0usize..64,
    ) {
        let encoded = kiss::encode(port, &payload);
        let split = split.min(encoded.len());
        let mut codec = KissCodec::new();
        let mut frames = codec.feed(&encoded[..split]);
        frames.extend(codec.feed(&encoded[split..]));
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(&frames[0].payload, &payload);
    }

    #[test]
    fn address_wire_roundtrip(addr in arb_address(), is_last: bool) {
        let bytes = addr.encode(false, is_last);
        let (decoded, last) = Address::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, addr);
        prop_assert_eq!(last, is_last);
    }

    #[test]
    fn control_byte_roundtrip(byte: u8) {
        prop_assert_eq!(Control::decode(byte).encode(), byte);
    }

    #[test]
    fn frame_decode_total(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = Ax25Frame::decode(&bytes);
    }

    #[test]
    fn frame_roundtrip(
        source in arb_address(),
        dest in arb_address(),
        hops in proptest::collection::vec(arb_address(), 0..8),
        ns in 0u8..8,
        nr in 0u8..8,
        poll: bool,
        info in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let path = DigiPath::new(hops).unwrap();
        let frame = Ax25Frame::i_frame(source, dest, path, ns, nr, poll, info);
        let decoded = Ax25Frame::decode(&frame.encode()).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn axdp_decode_total(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = AxdpMessage::decode(&bytes);
    }

    #[test]
    fn axdp_stream_total(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let mut stream = MessageStream::new();
        let _ = stream.feed(&bytes);
    }

    #[test]
    fn axdp_chat_roundtrip(session in any::<u16>(), id in any::<u32>(), text in ".{0,200}") {
        let msg = AxdpMessage::chat(session, id, &text);
        let (decoded, consumed) = AxdpMessage::decode(&msg.encode()).unwrap();
        prop_assert_eq!(consumed, msg.encode().len());
        prop_assert_eq!(decoded, msg);
    }
}
