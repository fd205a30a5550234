#![no_main]

use libfuzzer_sys::fuzz_target;
use rpc_runtime::core::packet::{BindAckBody, BindBody, BindNackBody};

fuzz_target!(|data: &[u8]| {
    // Negotiation bodies arrive from unauthenticated peers
    let _ = BindBody::decode(data, true);
    let _ = BindBody::decode(data, false);
    let _ = BindAckBody::decode(data, true);
    let _ = BindNackBody::decode(data);
});
