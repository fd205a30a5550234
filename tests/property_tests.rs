//! Property-based tests using proptest
//!
//! Fragmentation invariants across random payloads and frame sizes: every
//! fragment fits the frame, flags and alloc hints are consistent, and the
//! codec plus reassembler give back the original stub data.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use rpc_runtime::core::codec::FragmentCodec;
use rpc_runtime::core::fragment::{fragment_room, split, Reassembler};
use rpc_runtime::core::header::{
    Header, HeaderFields, PacketFlags, RequestHeader, ResponseHeader,
};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

fn request(object: Option<Uuid>) -> Header {
    Header::new(HeaderFields::Request(RequestHeader {
        alloc_hint: 0,
        context_id: 0,
        opnum: 3,
        object,
    }))
    .with_call_id(17)
}

fn encode_all(header: &Header, payload: &Bytes, max_frame: usize) -> (BytesMut, usize) {
    let fragments = split(header, payload, max_frame, None).expect("split");
    let count = fragments.len();
    let mut wire = BytesMut::new();
    let mut codec = FragmentCodec;
    for fragment in fragments {
        assert!(fragment.wire_len() <= max_frame);
        codec.encode(fragment, &mut wire).expect("encode");
    }
    (wire, count)
}

// Property: fragments decode and reassemble to the original payload
proptest! {
    #[test]
    fn prop_fragmentation_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..20_000),
        max_frame in 28usize..=5840,
    ) {
        let header = request(None);
        let payload = Bytes::from(payload);
        let (mut wire, count) = encode_all(&header, &payload, max_frame);

        let mut codec = FragmentCodec;
        let mut reassembler = Reassembler::new(1 << 20);
        let mut packet = None;
        let mut seen = 0;
        while let Some(fragment) = codec.decode(&mut wire).expect("decode") {
            seen += 1;
            let result = reassembler
                .push(fragment.header, fragment.stub_data(), fragment.auth)
                .expect("reassemble");
            if let Some(done) = result {
                packet = Some(done);
            }
        }

        prop_assert_eq!(seen, count);
        prop_assert!(wire.is_empty());
        let packet = packet.expect("packet completes on the last fragment");
        prop_assert_eq!(packet.payload, payload);
        prop_assert_eq!(packet.header.call_id(), 17);
    }
}

// Property: fragment count matches the room each frame leaves
proptest! {
    #[test]
    fn prop_fragment_count_and_flags(
        len in 1usize..10_000,
        max_frame in 28usize..=2048,
        with_object in any::<bool>(),
    ) {
        let header = request(with_object.then(|| Uuid::from_u128(0x0b1ec7)));
        let payload = Bytes::from(vec![0xA5u8; len]);
        let room = fragment_room(header.encoded_len(), max_frame, None);
        prop_assume!(room > 0);

        let fragments = split(&header, &payload, max_frame, None).unwrap();
        prop_assert_eq!(fragments.len(), len.div_ceil(room));

        let mut remaining = len as u32;
        for (index, fragment) in fragments.iter().enumerate() {
            let flags = fragment.header.flags();
            prop_assert_eq!(flags.contains(PacketFlags::FIRST_FRAG), index == 0);
            prop_assert_eq!(flags.contains(PacketFlags::LAST_FRAG), index + 1 == fragments.len());
            prop_assert_eq!(flags.contains(PacketFlags::OBJECT_UUID), with_object);
            prop_assert_eq!(fragment.header.fields.alloc_hint(), Some(remaining));
            remaining -= fragment.body.len() as u32;
        }
        prop_assert_eq!(remaining, 0);
    }
}

// Property: room left for stub data with a trailer is always 16-aligned
proptest! {
    #[test]
    fn prop_auth_room_is_aligned(max_frame in 28usize..=5840, token in 1usize..64) {
        let header = Header::new(HeaderFields::Response(ResponseHeader::default()));
        let room = fragment_room(header.encoded_len(), max_frame, Some(token));
        prop_assert_eq!(room % 16, 0);
        prop_assert!(header.encoded_len() + room + 8 + token <= max_frame || room == 0);
    }
}

// Property: arbitrary bytes never panic the decoder
proptest! {
    #[test]
    fn prop_decode_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut buf = BytesMut::from(&data[..]);
        let mut codec = FragmentCodec;
        while let Ok(Some(_)) = codec.decode(&mut buf) {}
    }
}
