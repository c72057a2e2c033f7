//! # Scheduler
//!
//! The single background thread that drives every time-based PGM
//! behavior: ambient/heartbeat SPM emission, draining the retransmit
//! queue into RDATA/parity, and the per-peer NAK engine sweep (backoff →
//! NCF-wait → RDATA-wait expiry, SPMR arming). No peer structure owns a
//! pointer back to this thread; it is handed the shared `PeerTable` and
//! `Sender` each tick, per the cyclic-ownership design note in
//! [`crate::peer`].
//!
//! Grounded on a sibling bonding-transport crate's runtime pattern: a
//! named `std::thread::Builder` thread, a bounded `crossbeam_channel`
//! control pipe standing in for the donor's multiple wake pipes (timer,
//! NAK, waiting-list), and `recv_timeout` against a freshly computed
//! delay each pass rather than a raw `poll()`/`epoll_wait()` call —
//! prepare/check/dispatch collapsed into one `tick`.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender as CbSender};
use tracing::{debug, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::TransportConfig;
use crate::io::{DatagramSender, PacketIo, SendOptions};
use crate::nak::{self, NakRequest};
use crate::peer::{Peer, PeerTable};
use crate::receiver;
use crate::sender::Sender;
use crate::stats::ReceiverStats;
use crate::wire::{NakBody, OptNakList, PgmBody, PgmHeader, PgmPacket, PgmType, OPT_PARITY, OPT_PRESENT};

/// Upper bound on how long one `recv_timeout` call may block, mirroring
/// the donor's capped `poll()` timeout — no single tick waits forever,
/// so a peer sweep still runs periodically even with no armed timers.
const MAX_POLL: Duration = Duration::from_secs(30);
const NO_WAIT: Duration = Duration::from_millis(0);
/// Retransmit requests rebuilt into packets per tick, bounding how long
/// one pass can run before yielding back to the NAK/SPM timers.
const RETRANSMIT_BATCH: usize = 64;

enum ControlMsg {
    Shutdown { flush: bool },
}

struct SchedulerState<S: DatagramSender> {
    sender: Arc<Mutex<Sender>>,
    peers: Arc<PeerTable>,
    io: Arc<PacketIo<S>>,
    cfg: Arc<TransportConfig>,
    clock: Clock,
    receiver_stats: Arc<Mutex<ReceiverStats>>,
}

/// Handle to the running scheduler thread. Dropping it stops the thread
/// without flushing; call [`Scheduler::destroy`] for the spec's
/// `destroy(flush)` semantics.
pub struct Scheduler {
    control_tx: CbSender<ControlMsg>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn<S: DatagramSender + 'static>(
        sender: Arc<Mutex<Sender>>,
        peers: Arc<PeerTable>,
        io: Arc<PacketIo<S>>,
        cfg: Arc<TransportConfig>,
        receiver_stats: Arc<Mutex<ReceiverStats>>,
    ) -> Self {
        let (control_tx, control_rx) = bounded(8);
        let state = SchedulerState {
            sender,
            peers,
            io,
            cfg,
            clock: Clock::new(),
            receiver_stats,
        };
        let thread = std::thread::Builder::new()
            .name("pgm-scheduler".into())
            .spawn(move || loop {
                let now = state.clock.now();
                let delay = tick(&state, now);
                match control_rx.recv_timeout(delay) {
                    Ok(ControlMsg::Shutdown { flush }) => {
                        if flush {
                            tick(&state, state.clock.now());
                            while drain_retransmits(&state) {}
                        }
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("spawn pgm scheduler thread");
        Scheduler {
            control_tx,
            thread: Some(thread),
        }
    }

    /// Stop the scheduler thread. `flush` runs one final tick and drains
    /// the entire retransmit queue before exiting, per spec `destroy`.
    pub fn destroy(mut self, flush: bool) {
        let _ = self.control_tx.send(ControlMsg::Shutdown { flush });
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.control_tx.send(ControlMsg::Shutdown { flush: false });
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn tick<S: DatagramSender>(state: &SchedulerState<S>, now: Timestamp) -> Duration {
    fire_sender_timers(state, now);
    let retransmit_pending = drain_retransmits(state);
    let peer_next = sweep_peers(state, now);
    let sender_next = state.sender.lock().unwrap().next_poll();
    clamp_delay(peer_next, sender_next, retransmit_pending, now)
}

fn fire_sender_timers<S: DatagramSender>(state: &SchedulerState<S>, now: Timestamp) {
    let mut sender = state.sender.lock().unwrap();
    if let Some(pkt) = sender.maybe_ambient_spm(now) {
        drop(sender);
        send_packet(&state.io, &pkt);
        return;
    }
    if let Some(pkt) = sender.maybe_heartbeat_spm(now) {
        drop(sender);
        send_packet(&state.io, &pkt);
    }
}

/// Rebuilds up to [`RETRANSMIT_BATCH`] queued RDATA/parity TPDUs and
/// sends them. Returns whether the retransmit queue still has more
/// pending, so the caller can keep the next wakeup immediate instead of
/// falling back to timer-driven pacing.
fn drain_retransmits<S: DatagramSender>(state: &SchedulerState<S>) -> bool {
    let mut batch = Vec::new();
    {
        let mut sender = state.sender.lock().unwrap();
        for _ in 0..RETRANSMIT_BATCH {
            match sender.pop_retransmit() {
                Some(pkt) => batch.push(pkt),
                None => break,
            }
        }
    }
    for pkt in &batch {
        send_packet(&state.io, pkt);
    }
    state.sender.lock().unwrap().txw().retransmit_pending() > 0
}

/// Walks every known peer once: drains expired BACK_OFF entries into a
/// NAK, expired WAIT_NCF/WAIT_DATA entries into LOST (with stats),
/// arms/sends SPMR when the gap has outlived `spmr_expiry`, then sweeps
/// expired peers out of the table. Returns the earliest next expiry
/// across all peers' NAK-engine timers, for sizing the next wakeup.
fn sweep_peers<S: DatagramSender>(state: &SchedulerState<S>, now: Timestamp) -> Option<Timestamp> {
    let mut nak_packets: Vec<PgmPacket> = Vec::new();
    let mut spmr_packets: Vec<PgmPacket> = Vec::new();
    let mut next_expiry: Option<Timestamp> = None;
    let mut failed_ncf = 0u64;
    let mut failed_data = 0u64;

    for tsi in state.peers.order_snapshot() {
        state.peers.with_peer_mut(&tsi, |peer| {
            let mask = !0u32 << state.cfg.tg_sqn_shift();
            let current_tg_sqn = peer.rxw.lead() & mask;

            if let Some(req) = nak::nak_rb_state(&mut peer.nak, &mut peer.rxw, now, &state.cfg, current_tg_sqn) {
                nak_packets.push(build_nak_packet(peer, &req));
            }
            failed_ncf += nak::nak_rpt_state(&mut peer.nak, &mut peer.rxw, now, &state.cfg).len() as u64;
            failed_data += nak::nak_rdata_state(&mut peer.nak, &mut peer.rxw, now, &state.cfg).len() as u64;

            if receiver::should_send_spmr(peer, now, &state.cfg) {
                receiver::mark_spmr_sent(peer, now, &state.cfg);
                spmr_packets.push(build_spmr_packet(peer));
            }

            if let Some(t) = peer.spmr_expiry {
                next_expiry = Some(next_expiry.map_or(t, |cur| cur.min(t)));
            }
            if let Some(t) = nak::next_expiry(&peer.nak, &peer.rxw) {
                next_expiry = Some(next_expiry.map_or(t, |cur| cur.min(t)));
            }
        });
    }

    let removed = state.peers.remove_expired(now);
    if !removed.is_empty() {
        debug!(count = removed.len(), "peers expired and were removed");
    }

    if failed_ncf > 0 || failed_data > 0 {
        let mut stats = state.receiver_stats.lock().unwrap();
        stats.naks_failed_ncf_retries_exceeded += failed_ncf;
        stats.naks_failed_data_retries_exceeded += failed_data;
        stats.cumulative_losses += failed_ncf + failed_data;
    }
    if !nak_packets.is_empty() {
        state.receiver_stats.lock().unwrap().naks_sent += nak_packets.len() as u64;
    }

    for pkt in &nak_packets {
        send_packet(&state.io, pkt);
    }
    for pkt in &spmr_packets {
        send_packet(&state.io, pkt);
    }

    next_expiry
}

/// A NAK's header and body both carry the remote source's TSI, not the
/// local receiver's — that's what lets a router (or the source itself)
/// tell which session the request concerns. This transport doesn't model
/// a separate local-receiver TSI, so `src_port`/`dst_port` both come from
/// the peer being NAK'd.
fn build_nak_packet(peer: &Peer, req: &NakRequest) -> PgmPacket {
    let nak_list = (!req.list.is_empty()).then(|| OptNakList { sqns: req.list.clone() });
    let mut options = 0u8;
    if nak_list.is_some() {
        options |= OPT_PRESENT;
    }
    if req.is_parity {
        options |= OPT_PARITY;
    }
    let header = PgmHeader {
        src_port: peer.tsi.source_port,
        dst_port: peer.tsi.source_port,
        pgm_type: PgmType::Nak,
        options,
        checksum: 0,
        gsi: peer.tsi.gsi,
        tsdu_length: 0,
    };
    let body = PgmBody::Nak(NakBody {
        sqn: req.primary_sqn,
        src_nla: peer.nla,
        grp_nla: peer.grp_nla,
        nak_list,
        is_parity: req.is_parity,
    });
    PgmPacket { header, body }
}

fn build_spmr_packet(peer: &Peer) -> PgmPacket {
    let header = PgmHeader {
        src_port: peer.tsi.source_port,
        dst_port: peer.tsi.source_port,
        pgm_type: PgmType::Spmr,
        options: 0,
        checksum: 0,
        gsi: peer.tsi.gsi,
        tsdu_length: 0,
    };
    PgmPacket {
        header,
        body: PgmBody::Spmr,
    }
}

fn send_packet<S: DatagramSender>(io: &PacketIo<S>, pkt: &PgmPacket) {
    let bytes = pkt.encode();
    if let Err(e) = io.send(&bytes, SendOptions::default()) {
        warn!(error = %e, pgm_type = ?pkt.header.pgm_type, "scheduler send failed");
    }
}

fn clamp_delay(peer_next: Option<Timestamp>, sender_next: Option<Timestamp>, retransmit_pending: bool, now: Timestamp) -> Duration {
    if retransmit_pending {
        return NO_WAIT;
    }
    let earliest = [peer_next, sender_next].into_iter().flatten().min();
    match earliest {
        Some(t) if t > now => {
            Duration::from_micros(t.as_micros() - now.as_micros()).min(MAX_POLL)
        }
        Some(_) => NO_WAIT,
        None => MAX_POLL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Tsi;
    use crate::wire::Nla;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;

    struct CapturingSender {
        sent: Arc<StdMutex<Vec<Bytes>>>,
    }

    impl DatagramSender for CapturingSender {
        fn send_plain(&mut self, data: &[u8]) -> std::io::Result<bool> {
            self.sent.lock().unwrap().push(Bytes::copy_from_slice(data));
            Ok(true)
        }
        fn send_router_alert(&mut self, data: &[u8]) -> std::io::Result<bool> {
            self.send_plain(data)
        }
    }

    fn t(ms: u64) -> Timestamp {
        Timestamp::zero().checked_add(Duration::from_millis(ms))
    }

    fn state_with(cfg: TransportConfig, sent: Arc<StdMutex<Vec<Bytes>>>) -> SchedulerState<CapturingSender> {
        let sender = Sender::new(
            &cfg,
            Tsi::new([1, 2, 3, 4, 5, 6], 1000),
            7000,
            Nla::V4([10, 0, 0, 1]),
            Nla::V4([239, 0, 0, 1]),
            Timestamp::zero(),
        );
        SchedulerState {
            sender: Arc::new(Mutex::new(sender)),
            peers: Arc::new(PeerTable::new()),
            io: Arc::new(PacketIo::new(CapturingSender { sent }, 0)),
            cfg: Arc::new(cfg),
            clock: Clock::new(),
            receiver_stats: Arc::new(Mutex::new(ReceiverStats::new())),
        }
    }

    #[test]
    fn retransmit_queue_drains_before_sender_timers_rearm() {
        let cfg = TransportConfig {
            ambient_spm_interval: Duration::from_secs(3600),
            heartbeat_spm_schedule_ms: vec![0, 0],
            ..Default::default()
        };
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let state = state_with(cfg, sent.clone());
        {
            let mut sender = state.sender.lock().unwrap();
            sender.send(Bytes::from_static(b"hello"), t(0));
            let nak = NakBody {
                sqn: 0,
                src_nla: Nla::V4([10, 0, 0, 1]),
                grp_nla: Nla::V4([239, 0, 0, 1]),
                nak_list: None,
                is_parity: false,
            };
            sender.admit_nak(&nak).unwrap();
        }
        let pending = drain_retransmits(&state);
        assert!(!pending);
        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let pkt = PgmPacket::decode(frames[0].clone()).unwrap();
        assert_eq!(pkt.header.pgm_type, PgmType::Rdata);
    }

    #[test]
    fn peer_backoff_expiry_builds_nak_packet() {
        let cfg = TransportConfig {
            nak_bo_ivl: Duration::from_millis(10),
            ..Default::default()
        };
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let state = state_with(cfg, sent.clone());
        let tsi = Tsi::new([9, 9, 9, 9, 9, 9], 2000);
        let peer = Peer::new(tsi, Nla::V4([10, 0, 0, 2]), Nla::V4([239, 0, 0, 2]), t(0), t(10_000));
        state.peers.insert_new(peer);
        state.peers.with_peer_mut(&tsi, |p| {
            p.rxw.window_update(0, 1, t(0));
            nak::arm_backoff(&mut p.nak, &mut p.rxw, 0, t(0), &state.cfg);
        });

        sweep_peers(&state, t(50));
        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let pkt = PgmPacket::decode(frames[0].clone()).unwrap();
        assert_eq!(pkt.header.pgm_type, PgmType::Nak);
        match pkt.body {
            PgmBody::Nak(nb) => assert_eq!(nb.sqn, 0),
            _ => panic!("expected nak"),
        }
    }

    #[test]
    fn expired_peer_removed_during_sweep() {
        let cfg = TransportConfig::default();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let state = state_with(cfg, sent);
        let tsi = Tsi::new([1, 1, 1, 1, 1, 1], 3000);
        state.peers.insert_new(Peer::new(
            tsi,
            Nla::V4([0; 4]),
            Nla::V4([0; 4]),
            t(0),
            t(10),
        ));
        assert_eq!(state.peers.len(), 1);
        sweep_peers(&state, t(20));
        assert_eq!(state.peers.len(), 0);
    }

    #[test]
    fn clamp_delay_prefers_pending_retransmit() {
        let d = clamp_delay(Some(t(100)), Some(t(200)), true, t(0));
        assert_eq!(d, NO_WAIT);
    }

    #[test]
    fn clamp_delay_caps_at_max_poll() {
        let d = clamp_delay(None, None, false, t(0));
        assert_eq!(d, MAX_POLL);
    }

    #[test]
    fn clamp_delay_picks_earliest_of_peer_and_sender() {
        let d = clamp_delay(Some(t(500)), Some(t(200)), false, t(100));
        assert_eq!(d, Duration::from_millis(100));
    }
}
