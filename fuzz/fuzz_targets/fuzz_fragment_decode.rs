#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use rpc_runtime::core::codec::FragmentCodec;
use rpc_runtime::core::fragment::Reassembler;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode and reassemble arbitrary bytes: no panics, no unbounded allocation
    let mut buf = BytesMut::from(data);
    let mut codec = FragmentCodec;
    let mut reassembler = Reassembler::new(1 << 16);
    while let Ok(Some(fragment)) = codec.decode(&mut buf) {
        if reassembler
            .push(fragment.header, fragment.stub_data(), fragment.auth)
            .is_err()
        {
            break;
        }
    }
});
