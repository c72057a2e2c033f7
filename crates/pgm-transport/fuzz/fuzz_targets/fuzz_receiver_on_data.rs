#![no_main]

use std::time::Duration;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_transport::clock::Timestamp;
use pgm_transport::config::TransportConfig;
use pgm_transport::peer::{Peer, Tsi};
use pgm_transport::receiver;
use pgm_transport::wire::{Nla, PgmBody, PgmPacket};

/// Decodes arbitrary bytes as a packet and, if it happens to parse as
/// ODATA/RDATA, drives it straight into `receiver::on_data` against a
/// fresh peer. Exercises the window/NAK-engine interaction on whatever
/// sequence numbers and fragment options the fuzzer finds, independent
/// of whether the bytes also form a sensible encoder output.
fuzz_target!(|data: &[u8]| {
    let Ok(pkt) = PgmPacket::decode(Bytes::copy_from_slice(data)) else {
        return;
    };
    let PgmBody::Data(db, opts, payload) = pkt.body else {
        return;
    };

    let cfg = TransportConfig::default();
    let tsi = Tsi::new(pkt.header.gsi, pkt.header.src_port);
    let t0 = Timestamp::zero();
    let mut peer = Peer::new(tsi, Nla::V4([10, 0, 0, 1]), Nla::V4([239, 0, 0, 1]), t0, t0.checked_add(Duration::from_secs(300)));

    let _ = receiver::on_data(&mut peer, &db, &opts, payload, t0, &cfg);
});
