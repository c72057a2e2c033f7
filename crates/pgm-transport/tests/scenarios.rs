//! Integration tests driving the sender/receiver/NAK-engine modules
//! together the way a bound transport's dispatch loop would, without any
//! actual socket I/O. Each test plays out one named scenario end to end:
//! plain delivery, a single loss repaired via NAK/NCF/RDATA, a batched
//! NAK-list for simultaneous losses, exhausted retries producing LOST,
//! FEC parity recovery, and the heartbeat SPM schedule's timing.

use std::time::Duration;

use bytes::Bytes;

use pgm_transport::clock::Timestamp;
use pgm_transport::codec::RsEncoder;
use pgm_transport::config::TransportConfig;
use pgm_transport::nak;
use pgm_transport::peer::{Peer, Tsi};
use pgm_transport::receiver::{self, ParityOutcome};
use pgm_transport::rxw::RxwState;
use pgm_transport::sender::Sender;
use pgm_transport::wire::{DataBody, Nla, OptionChain, PgmBody};

fn t(ms: u64) -> Timestamp {
    Timestamp::zero().checked_add(Duration::from_millis(ms))
}

fn tsi() -> Tsi {
    Tsi::new([9, 9, 9, 9, 9, 9], 2000)
}

fn nla() -> Nla {
    Nla::V4([192, 168, 0, 1])
}

fn grp_nla() -> Nla {
    Nla::V4([239, 1, 1, 1])
}

fn cfg() -> TransportConfig {
    TransportConfig::default()
}

fn peer() -> Peer {
    Peer::new(tsi(), nla(), grp_nla(), t(0), t(300_000))
}

/// A single ODATA packet, sent and received with nothing lost, is
/// committed to the peer's receive window intact.
#[test]
fn single_packet_delivery() {
    let cfg = cfg();
    let mut sender = Sender::new(&cfg, tsi(), 7000, nla(), grp_nla(), t(0));
    let mut p = peer();

    let packets = sender.send(Bytes::from_static(b"hello pgm"), t(0));
    assert_eq!(packets.len(), 1);

    let pkt = packets.into_iter().next().unwrap();
    let PgmBody::Data(db, opts, payload) = pkt.body else {
        panic!("expected data body");
    };
    let status = receiver::on_data(&mut p, &db, &opts, payload, t(1), &cfg);
    assert_eq!(status, pgm_transport::rxw::RxwStatus::Ok);

    let (items, _) = p.rxw.readv(8);
    assert_eq!(items, vec![Bytes::from_static(b"hello pgm")]);
}

/// sqn 0 never arrives; the NAK engine backs off, NAKs, gets NCF'd into
/// WAIT_DATA, and the retransmitted RDATA completes delivery.
#[test]
fn single_loss_repaired_via_nak_ncf_rdata() {
    let cfg = cfg();
    let mut sender = Sender::new(&cfg, tsi(), 7000, nla(), grp_nla(), t(0));
    let mut p = peer();

    let sent = sender.send(Bytes::from_static(b"lost and found"), t(0));
    assert_eq!(sent.len(), 1);

    // Peer learns of the gap (sqn 0 missing) from the window advancing
    // past it, as a later SPM would announce.
    let opened = p.rxw.window_update(0, 1, t(0));
    assert_eq!(opened, 1);
    nak::arm_backoff(&mut p.nak, &mut p.rxw, 0, t(0), &cfg);

    let past_backoff = t(cfg.nak_bo_ivl.as_millis() as u64 + 1);
    let req = nak::nak_rb_state(&mut p.nak, &mut p.rxw, past_backoff, &cfg, 0).expect("nak due");
    assert_eq!(req.primary_sqn, 0);
    assert!(req.list.is_empty());
    assert_eq!(p.rxw.peek(0).unwrap().state, RxwState::WaitNcf);

    let nak_body = pgm_transport::wire::NakBody {
        sqn: req.primary_sqn,
        src_nla: p.nla,
        grp_nla: p.grp_nla,
        nak_list: None,
        is_parity: false,
    };
    let (ncf, pushed) = sender.admit_nak(&nak_body).expect("nak admitted");
    assert_eq!(pushed, 1);
    let PgmBody::Ncf(ncf_body) = ncf.body else {
        panic!("expected ncf body");
    };

    receiver::on_ncf(&mut p, ncf_body.sqn, past_backoff, &cfg);
    assert_eq!(p.rxw.peek(0).unwrap().state, RxwState::WaitData);

    let rdata = sender.pop_retransmit().expect("rdata queued");
    let PgmBody::Data(db, opts, payload) = rdata.body else {
        panic!("expected rdata body");
    };
    assert_eq!(db.data_sqn, 0);
    let status = receiver::on_data(&mut p, &db, &opts, payload, past_backoff, &cfg);
    assert_eq!(status, pgm_transport::rxw::RxwStatus::Ok);

    let (items, _) = p.rxw.readv(8);
    assert_eq!(items, vec![Bytes::from_static(b"lost and found")]);
}

/// Three simultaneously-missing sqns back off together and are NAK'd as
/// one primary sqn plus a two-entry OPT_NAK_LIST, not three separate NAKs.
#[test]
fn nak_list_batches_simultaneous_losses() {
    let cfg = cfg();
    let mut p = peer();

    let opened = p.rxw.window_update(0, 3, t(0));
    assert_eq!(opened, 3);
    for sqn in 0..3u32 {
        nak::arm_backoff(&mut p.nak, &mut p.rxw, sqn, t(0), &cfg);
    }

    let past_backoff = t(cfg.nak_bo_ivl.as_millis() as u64 + 1);
    let req = nak::nak_rb_state(&mut p.nak, &mut p.rxw, past_backoff, &cfg, 0).expect("nak due");
    assert_eq!(req.primary_sqn, 0);
    assert_eq!(req.list, vec![1, 2]);
    assert_eq!(req.nak_pkt_cnt, 3);

    // A second sweep finds nothing left in BACK_OFF.
    assert!(nak::nak_rb_state(&mut p.nak, &mut p.rxw, past_backoff, &cfg, 0).is_none());
}

/// Exhausting `nak_ncf_retries` with no NCF ever arriving declares the
/// sqn LOST instead of retrying forever.
#[test]
fn exhausted_retries_become_lost() {
    let mut cfg = cfg();
    cfg.nak_ncf_retries = 0;
    let mut p = peer();

    p.rxw.window_update(0, 1, t(0));
    nak::arm_backoff(&mut p.nak, &mut p.rxw, 0, t(0), &cfg);

    let past_backoff = t(cfg.nak_bo_ivl.as_millis() as u64 + 1);
    nak::nak_rb_state(&mut p.nak, &mut p.rxw, past_backoff, &cfg, 0).expect("nak due");
    assert_eq!(p.rxw.peek(0).unwrap().state, RxwState::WaitNcf);

    let past_rpt = past_backoff
        .checked_add(cfg.nak_rpt_ivl)
        .checked_add(Duration::from_millis(1));
    let lost = nak::nak_rpt_state(&mut p.nak, &mut p.rxw, past_rpt, &cfg);
    assert_eq!(lost, vec![0]);
    assert_eq!(p.rxw.peek(0).unwrap().state, RxwState::Lost);
}

/// RS(6,4): a transmission group of 4 originals plus 2 repair shards.
/// Two of the four originals are dropped; both parity shards arrive and
/// recover them.
#[test]
fn fec_parity_recovers_two_missing_of_six() {
    let mut cfg = cfg();
    cfg.fec_k = 4;
    cfg.fec_h = 2;
    cfg.use_ondemand_parity = true;
    let mut p = peer();

    let originals: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 32]).collect();
    let repair = RsEncoder::new(4, 2).encode(&originals).unwrap();

    // sqn 1 and sqn 3 are dropped; 0 and 2 arrive as ODATA.
    for &i in &[0u32, 2] {
        let db = DataBody {
            data_sqn: i,
            data_trail: 0,
        };
        let status = receiver::on_data(
            &mut p,
            &db,
            &OptionChain::default(),
            Bytes::from(originals[i as usize].clone()),
            t(0),
            &cfg,
        );
        assert_eq!(status, pgm_transport::rxw::RxwStatus::Ok);
    }

    let first = receiver::on_parity_rdata(&mut p, 0, Bytes::from(repair[0].clone()), t(0), &cfg);
    assert_eq!(first, ParityOutcome::Parked);
    let second = receiver::on_parity_rdata(&mut p, 1, Bytes::from(repair[1].clone()), t(0), &cfg);
    match second {
        ParityOutcome::Recovered(mut sqns) => {
            sqns.sort_unstable();
            assert_eq!(sqns, vec![1, 3]);
        }
        ParityOutcome::Parked => panic!("expected recovery once both repair shards arrived"),
    }
    assert_eq!(p.rxw.peek(1).unwrap().payload.as_deref(), Some(&originals[1][..]));
    assert_eq!(p.rxw.peek(3).unwrap().payload.as_deref(), Some(&originals[3][..]));
}

/// The heartbeat schedule fires at each configured offset after a data
/// send, then exhausts and goes quiet until the next send re-arms it.
#[test]
fn heartbeat_schedule_fires_at_configured_offsets() {
    let mut cfg = cfg();
    cfg.heartbeat_spm_schedule_ms = vec![0, 100, 200, 0];
    let mut sender = Sender::new(&cfg, tsi(), 7000, nla(), grp_nla(), t(0));

    sender.send(Bytes::from_static(b"x"), t(0));

    assert!(sender.maybe_heartbeat_spm(t(50)).is_none());
    assert!(sender.maybe_heartbeat_spm(t(100)).is_some());
    assert!(sender.maybe_heartbeat_spm(t(250)).is_none());
    assert!(sender.maybe_heartbeat_spm(t(300)).is_some());
    // Sequence exhausted: no further heartbeats until the next send.
    assert!(sender.maybe_heartbeat_spm(t(10_000)).is_none());

    sender.send(Bytes::from_static(b"y"), t(10_000));
    assert!(sender.maybe_heartbeat_spm(t(10_100)).is_some());
}
