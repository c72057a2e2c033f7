#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_transport::wire::PgmPacket;

fuzz_target!(|data: &[u8]| {
    let _ = PgmPacket::decode(Bytes::copy_from_slice(data));
});
