//! # Transport
//!
//! The public handle spec.md §6 names: `create`/setters/`bind`, the
//! `send*`/`recv*` families, `select_info`/`poll_info`/`epoll_ctl`, and
//! `destroy(flush)`. Everything built in the other modules — the transmit
//! and receive windows, the NAK state machine, the peer table, the
//! scheduler thread, packet dispatch — is wired together here behind one
//! struct, the way the donor's top-level session handle owns its sender,
//! receiver and I/O collaborator and exposes a single narrow API to the
//! application.
//!
//! `recvmsgv` drains peers round-robin in `PeerTable`'s insertion order;
//! cross-peer delivery order is explicitly unspecified (only within-peer
//! FIFO is guaranteed), so round-robin is a legitimate choice among many.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::TransportConfig;
use crate::dispatch::{self, Handler, LocalIdentity};
use crate::error::PgmError;
use crate::io::{DatagramSender, PacketIo, SendOptions};
use crate::peer::{Peer, PeerTable, Tsi};
use crate::receiver;
use crate::rxw::RxwStatus;
use crate::scheduler::Scheduler;
use crate::sender::Sender;
use crate::stats::{ReceiverStats, SenderStats};
use crate::wire::{Nla, PgmBody, PgmPacket};

/// Minimal substitute for `select`/`poll`/`epoll_wait` readiness info: the
/// caller's own event loop owns the actual file descriptors (named
/// external collaborator, same as [`crate::io::DatagramSender`]); this
/// only tells it how long it may safely block before a timer needs
/// servicing.
#[derive(Debug, Clone, Copy)]
pub struct PollInfo {
    pub next_wakeup: Duration,
}

/// A PGM transport bound to one (GSI, dport) pair with one send group and
/// one receive group. Before [`Transport::bind`], configuration setters
/// are accepted; after, they are rejected with
/// [`PgmError::InvalidArgument`], mirroring `pgm_transport_bind`'s lock-in
/// of the parameter set.
pub struct Transport<S: DatagramSender + 'static> {
    gsi: [u8; 6],
    dport: u16,
    source_port: u16,
    nla: Nla,
    grp_nla: Nla,
    cfg: TransportConfig,
    clock: Clock,
    sender: Arc<Mutex<Sender>>,
    peers: Arc<PeerTable>,
    io: Option<Arc<PacketIo<S>>>,
    receiver_stats: Arc<Mutex<ReceiverStats>>,
    scheduler: Option<Scheduler>,
    send_only: bool,
    bound: bool,
}

impl<S: DatagramSender + 'static> Transport<S> {
    /// `create(gsi, dport, recv_group, send_group)`. `source_port`
    /// identifies this transport's own TSI (the donor's `session::Session`
    /// equivalent of a locally bound ephemeral port); NAK/NNAK addressed
    /// back to us as a source arrive on it.
    pub fn create(
        cfg: TransportConfig,
        gsi: [u8; 6],
        dport: u16,
        source_port: u16,
        nla: Nla,
        recv_group: Nla,
        send_group: Nla,
        now: Timestamp,
    ) -> Self {
        let tsi = Tsi::new(gsi, source_port);
        let sender = Sender::new(&cfg, tsi, dport, nla, send_group, now);
        Transport {
            gsi,
            dport,
            source_port,
            nla,
            grp_nla: recv_group,
            cfg,
            clock: Clock::new(),
            sender: Arc::new(Mutex::new(sender)),
            peers: Arc::new(PeerTable::new()),
            io: None,
            receiver_stats: Arc::new(Mutex::new(ReceiverStats::new())),
            scheduler: None,
            send_only: false,
            bound: false,
        }
    }

    fn ensure_not_bound(&self) -> Result<(), PgmError> {
        if self.bound {
            return Err(PgmError::InvalidArgument(
                "parameter cannot change after bind()".into(),
            ));
        }
        Ok(())
    }

    /// Run `f` over the config, rejecting the call once bound. Covers the
    /// bulk of spec.md §3's per-parameter setters without a hand-written
    /// method per field.
    pub fn configure(&mut self, f: impl FnOnce(&mut TransportConfig)) -> Result<(), PgmError> {
        self.ensure_not_bound()?;
        f(&mut self.cfg);
        Ok(())
    }

    /// `set_fec(proactive, ondemand, varpkt, n, k)`. `n` is the group
    /// size `k + h`; `h` is derived, matching `transport.c`'s own
    /// `(n, k)` parameterization.
    pub fn set_fec(
        &mut self,
        proactive: bool,
        ondemand: bool,
        varpkt: bool,
        n: u8,
        k: u8,
    ) -> Result<(), PgmError> {
        self.ensure_not_bound()?;
        if k == 0 || n <= k {
            return Err(PgmError::InvalidArgument("FEC requires n > k > 0".into()));
        }
        self.cfg.use_proactive_parity = proactive;
        self.cfg.use_ondemand_parity = ondemand;
        self.cfg.use_varpkt_len = varpkt;
        self.cfg.fec_k = k;
        self.cfg.fec_h = n - k;
        Ok(())
    }

    /// Disables inbound processing: the transport never tracks peers or
    /// emits NAK/SPMR. Distinct from [`Transport::set_recv_only`], which
    /// still receives but never sends.
    pub fn set_send_only(&mut self, send_only: bool) -> Result<(), PgmError> {
        self.ensure_not_bound()?;
        self.send_only = send_only;
        Ok(())
    }

    /// Passive receiver: never emits NAK/SPMR (`cfg.is_passive`).
    pub fn set_recv_only(&mut self, passive: bool) -> Result<(), PgmError> {
        self.ensure_not_bound()?;
        self.cfg.is_passive = passive;
        Ok(())
    }

    /// Completes setup and launches the scheduler thread. Idempotent
    /// setter rejection begins here; a second `bind()` is a no-op.
    pub fn bind(&mut self, io: PacketIo<S>) -> Result<(), PgmError> {
        if self.bound {
            return Ok(());
        }
        let io = Arc::new(io);
        self.scheduler = Some(Scheduler::spawn(
            Arc::clone(&self.sender),
            Arc::clone(&self.peers),
            Arc::clone(&io),
            Arc::new(self.cfg.clone()),
            Arc::clone(&self.receiver_stats),
        ));
        self.io = Some(io);
        self.bound = true;
        Ok(())
    }

    fn io(&self) -> Result<&Arc<PacketIo<S>>, PgmError> {
        self.io
            .as_ref()
            .ok_or_else(|| PgmError::InvalidArgument("transport not bound".into()))
    }

    fn send_packet(&self, pkt: &PgmPacket, opts: SendOptions) -> Result<(), PgmError> {
        self.io()?.send(&pkt.encode(), opts)
    }

    // ---- send family ------------------------------------------------

    pub fn send(&self, data: Bytes) -> Result<(), PgmError> {
        self.send_ex(data, SendOptions::default())
    }

    pub fn send_pkt_dontwait(&self, data: Bytes) -> Result<(), PgmError> {
        self.send_ex(
            data,
            SendOptions {
                non_blocking: true,
                ..Default::default()
            },
        )
    }

    /// Common path for `send`/`sendv`/their `_pkt_dontwait` siblings: the
    /// donor collapsed an equivalent ABI-compatibility family (`sendv2`,
    /// `sendv3`, ...) down to one buffer-plus-options call once the
    /// underlying reliability engine didn't need to distinguish them.
    fn send_ex(&self, data: Bytes, opts: SendOptions) -> Result<(), PgmError> {
        let now = self.clock.now();
        let packets = self.sender.lock().unwrap().send(data, now);
        for pkt in &packets {
            self.send_packet(pkt, opts)?;
        }
        Ok(())
    }

    /// `sendv`: concatenates the iovec into a single APDU before handing
    /// it to [`crate::sender::Sender::send`], which itself fragments it
    /// across `max_tpdu`-sized ODATA if needed.
    pub fn sendv(&self, iov: &[Bytes]) -> Result<(), PgmError> {
        self.sendv_ex(iov, SendOptions::default())
    }

    pub fn sendv2(&self, iov: &[Bytes], opts: SendOptions) -> Result<(), PgmError> {
        self.sendv_ex(iov, opts)
    }

    pub fn sendv3(&self, iov: &[Bytes], opts: SendOptions) -> Result<(), PgmError> {
        self.sendv_ex(iov, opts)
    }

    pub fn sendv3_pkt_dontwait(&self, iov: &[Bytes]) -> Result<(), PgmError> {
        self.sendv_ex(
            iov,
            SendOptions {
                non_blocking: true,
                ..Default::default()
            },
        )
    }

    fn sendv_ex(&self, iov: &[Bytes], opts: SendOptions) -> Result<(), PgmError> {
        let mut buf = Vec::with_capacity(iov.iter().map(Bytes::len).sum());
        for chunk in iov {
            buf.extend_from_slice(chunk);
        }
        self.send_ex(Bytes::from(buf), opts)
    }

    // ---- recv family --------------------------------------------------

    /// `recv`: one committed APDU, if any peer has one ready.
    pub fn recv(&self) -> Option<Bytes> {
        self.recvmsg()
    }

    pub fn recvmsg(&self) -> Option<Bytes> {
        self.recvmsgv(1).into_iter().next()
    }

    /// Drains up to `max_items` committed APDUs across all tracked peers,
    /// round-robin in insertion order. Each peer first releases the entries
    /// a previous call already delivered, before draining whatever is fresh.
    pub fn recvmsgv(&self, max_items: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        for tsi in self.peers.order_snapshot() {
            if out.len() >= max_items {
                break;
            }
            let remaining = max_items - out.len();
            if let Some((items, _bytes)) = self.peers.with_peer_mut(&tsi, |p| {
                p.rxw.free_committed();
                p.rxw.readv(remaining)
            }) {
                out.extend(items);
            }
        }
        out
    }

    // ---- readiness ------------------------------------------------------

    /// Earliest of the sender's next scheduled SPM and every peer's
    /// earliest NAK-queue expiry, clamped like the scheduler's own
    /// `clamp_delay` but read-only: this never fires a timer itself, it
    /// only reports how long the caller's own event loop may safely
    /// block.
    pub fn poll_info(&self) -> PollInfo {
        let now = self.clock.now();
        let sender_next = self.sender.lock().unwrap().next_poll();
        let mut peer_next: Option<Timestamp> = None;
        for tsi in self.peers.order_snapshot() {
            self.peers.with_peer(&tsi, |peer| {
                if let Some(t) = crate::nak::next_expiry(&peer.nak, &peer.rxw) {
                    peer_next = Some(peer_next.map_or(t, |cur| cur.min(t)));
                }
            });
        }
        let earliest = [sender_next, peer_next].into_iter().flatten().min();
        let next_wakeup = match earliest {
            Some(t) if t > now => Duration::from_micros(t.as_micros() - now.as_micros()),
            Some(_) => Duration::ZERO,
            None => Duration::from_secs(30),
        };
        PollInfo { next_wakeup }
    }

    pub fn select_info(&self) -> PollInfo {
        self.poll_info()
    }

    pub fn epoll_ctl(&self) -> PollInfo {
        self.poll_info()
    }

    // ---- inbound dispatch ----------------------------------------------

    fn ensure_peer(&self, tsi: Tsi, nla: Nla, now: Timestamp) {
        if !self.peers.contains(&tsi) {
            let expiry = now.checked_add(self.cfg.peer_expiry);
            self.peers
                .insert_new(Peer::new(tsi, nla, self.grp_nla, now, expiry));
        }
    }

    /// Entry point for one inbound datagram. `src_nla` is the packet's IP
    /// source address (the caller's raw-socket layer already has it from
    /// `recvfrom`); `dst_is_multicast` tells the packet's destination
    /// address class apart, since that isn't a wire header field.
    pub fn on_receive(&self, raw: Bytes, src_nla: Nla, dst_is_multicast: bool, now: Timestamp) {
        let pkt = match PgmPacket::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "discarding malformed packet");
                self.receiver_stats.lock().unwrap().source_packets_discarded += 1;
                return;
            }
        };
        if self.send_only {
            return;
        }

        let tsi = Tsi::new(pkt.header.gsi, pkt.header.src_port);
        let known_peer = self.peers.contains(&tsi);
        let local = LocalIdentity {
            dport: self.dport,
            tsi_source_port: self.source_port,
        };
        let handler = dispatch::classify(
            pkt.header.pgm_type,
            pkt.header.dst_port,
            dst_is_multicast,
            known_peer,
            &local,
        );
        let Some(handler) = handler else {
            self.receiver_stats.lock().unwrap().source_packets_discarded += 1;
            return;
        };

        match handler {
            Handler::OnSpm => self.handle_spm(tsi, pkt, src_nla, now),
            Handler::OnOdata | Handler::OnRdata => self.handle_data(tsi, pkt, src_nla, now),
            Handler::OnNcf => self.handle_ncf(tsi, pkt, src_nla, now),
            Handler::OnNak => self.handle_nak(pkt),
            Handler::OnPeerNak => {
                // Another receiver's multicast NAK: the backoff jitter
                // already in nak.rs is the primary de-duplication
                // mechanism, so there is nothing further to do here.
            }
            Handler::OnNnak => { /* congestion-avoidance feedback, out of scope (Non-goal) */ }
            Handler::OnSpmr => self.handle_spmr(tsi, dst_is_multicast, now),
        }
    }

    fn handle_spm(&self, tsi: Tsi, pkt: PgmPacket, src_nla: Nla, now: Timestamp) {
        let PgmBody::Spm(spm) = pkt.body else { return };
        self.ensure_peer(tsi, src_nla, now);
        let accepted = self.peers.with_peer_mut(&tsi, |peer| {
            peer.nla = spm.nla;
            if receiver::on_spm(peer, &spm, now, &self.cfg) {
                receiver::suppress_spmr(peer);
                true
            } else {
                false
            }
        });
        if accepted == Some(false) {
            self.receiver_stats.lock().unwrap().dup_spms += 1;
        }
    }

    fn handle_data(&self, tsi: Tsi, pkt: PgmPacket, src_nla: Nla, now: Timestamp) {
        let PgmBody::Data(db, opts, payload) = pkt.body else { return };
        self.ensure_peer(tsi, src_nla, now);
        let is_parity = pkt.header.options & crate::wire::OPT_PARITY != 0;
        if is_parity {
            let outcome = self
                .peers
                .with_peer_mut(&tsi, |peer| receiver::on_parity_rdata(peer, db.data_sqn, payload, now, &self.cfg));
            if let Some(receiver::ParityOutcome::Recovered(sqns)) = outcome {
                debug!(?sqns, "fec recovered sqns");
                self.receiver_stats.lock().unwrap().fec_recoveries += sqns.len() as u64;
            }
        } else {
            let status = self
                .peers
                .with_peer_mut(&tsi, |peer| receiver::on_data(peer, &db, &opts, payload, now, &self.cfg));
            if status == Some(RxwStatus::Ok) {
                let mut stats = self.receiver_stats.lock().unwrap();
                stats.receiver_data_msgs_received += 1;
                match pkt.header.pgm_type {
                    crate::wire::PgmType::Odata => stats.odata_received += 1,
                    crate::wire::PgmType::Rdata => stats.rdata_received += 1,
                    _ => {}
                }
            }
        }
    }

    fn handle_ncf(&self, tsi: Tsi, pkt: PgmPacket, src_nla: Nla, now: Timestamp) {
        let PgmBody::Ncf(nb) = pkt.body else { return };
        self.ensure_peer(tsi, src_nla, now);
        self.peers.with_peer_mut(&tsi, |peer| {
            receiver::on_ncf(peer, nb.sqn, now, &self.cfg);
            if let Some(list) = &nb.nak_list {
                for sqn in &list.sqns {
                    receiver::on_ncf(peer, *sqn, now, &self.cfg);
                }
            }
        });
    }

    /// We are the source: admit the NAK, queue retransmits, and answer
    /// with an NCF. Retransmits themselves drain from the scheduler's
    /// tick, not from here, to keep this call's critical section O(1)
    /// rather than O(retransmit batch).
    fn handle_nak(&self, pkt: PgmPacket) {
        let PgmBody::Nak(nb) = pkt.body else { return };
        let result = self.sender.lock().unwrap().admit_nak(&nb);
        match result {
            Ok((ncf, _pushed)) => {
                if let Err(e) = self.send_packet(&ncf, SendOptions::default()) {
                    warn!(error = %e, "failed to send NCF");
                }
            }
            Err(e) => debug!(error = %e, "NAK rejected"),
        }
    }

    fn handle_spmr(&self, tsi: Tsi, dst_is_multicast: bool, now: Timestamp) {
        if !dst_is_multicast {
            let pkt = self.sender.lock().unwrap().force_spm(now);
            if let Err(e) = self.send_packet(&pkt, SendOptions::default()) {
                warn!(error = %e, "failed to send SPM in reply to SPMR");
            }
        } else {
            self.peers.with_peer_mut(&tsi, |peer| receiver::suppress_spmr(peer));
        }
    }

    // ---- stats / shutdown -----------------------------------------------

    pub fn sender_stats(&self) -> SenderStats {
        self.sender.lock().unwrap().stats().clone()
    }

    pub fn receiver_stats(&self) -> ReceiverStats {
        self.receiver_stats.lock().unwrap().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// `pgm_transport_destroy(flush)`: stop the scheduler thread (letting
    /// it drain pending retransmits first if `flush`), then drop every
    /// other resource via normal `Drop`. When `!flush`, any APDUs already
    /// committed but never handed to the caller via `recvmsgv` are
    /// discarded rather than left to leak.
    pub fn destroy(mut self, flush: bool) {
        if !flush {
            for tsi in self.peers.order_snapshot() {
                self.peers.with_peer_mut(&tsi, |p| p.rxw.release_committed());
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.destroy(flush);
        }
    }
}
