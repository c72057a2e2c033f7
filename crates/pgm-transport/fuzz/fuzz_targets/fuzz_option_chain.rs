#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_transport::wire::OptionChain;

fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    let _ = OptionChain::decode(&mut buf);
});
