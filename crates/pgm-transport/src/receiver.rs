//! # Receiver Integration
//!
//! Per-peer glue tying the receive window ([`crate::rxw`]), the NAK engine
//! ([`crate::nak`]), and the peer table ([`crate::peer`]) into the
//! behaviors spec'd for inbound SPM/ODATA/RDATA/NCF: window growth on a
//! fresh advertised lead, parity-group accumulation and RS recovery, and
//! the SPMR request/suppress discipline. Generalized from the donor's
//! `receiver::Receiver::receive` dispatch-by-type handler, which drove a
//! single flat reorder buffer directly; here each handler instead drives
//! the window plus the NAK engine's three queues together, since a PGM
//! data arrival touches both.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::clock::Timestamp;
use crate::codec::RsDecoder;
use crate::config::TransportConfig;
use crate::nak;
use crate::peer::Peer;
use crate::rxw::RxwStatus;
use crate::txw::TransmitWindow;
use crate::wire::{DataBody, OptionChain, SpmBody};

/// SPM arrived from this peer. Returns `false` on a stale/duplicate sqn
/// (the donor's `DUP_SPMS` counter belongs to the caller, which already
/// owns the transport-wide stats struct).
pub fn on_spm(peer: &mut Peer, spm: &SpmBody, now: Timestamp, cfg: &TransportConfig) -> bool {
    if !peer.accept_spm_sqn(spm.spm_sqn) {
        return false;
    }
    peer.touch(now, cfg.peer_expiry);
    let opened = peer.rxw.window_update(spm.trail, spm.lead.wrapping_add(1), now);
    if opened > 0 {
        trace!(peer = ?peer.tsi, opened, "spm window_update opened placeholders");
        arm_new_placeholders(peer, spm.lead.wrapping_add(1), opened, now, cfg);
    }
    if let Some(pp) = &spm.parity_prm {
        peer.fec_params.proactive = pp.proactive;
        peer.fec_params.ondemand = pp.ondemand;
        peer.fec_params.transmission_group_size = pp.transmission_group_size;
    }
    true
}

/// Arm `nak_rb_expiry` for the `opened` freshest placeholders below `lead`,
/// mirroring the state chart's "placeholder opened ... -> BACK_OFF".
fn arm_new_placeholders(peer: &mut Peer, lead: u32, opened: usize, now: Timestamp, cfg: &TransportConfig) {
    let mut sqn = lead.wrapping_sub(opened as u32);
    for _ in 0..opened {
        if matches!(peer.rxw.peek(sqn), Some(e) if e.queue_link.is_none()) {
            nak::arm_backoff(&mut peer.nak, &mut peer.rxw, sqn, now, cfg);
        }
        sqn = sqn.wrapping_add(1);
    }
}

/// ODATA or unfragmented-equivalent RDATA arrived. Grows the window past
/// `lead` if this sqn is new, then pushes the payload and clears the NAK
/// engine's bookkeeping for it.
pub fn on_data(
    peer: &mut Peer,
    db: &DataBody,
    opts: &OptionChain,
    payload: Bytes,
    now: Timestamp,
    cfg: &TransportConfig,
) -> RxwStatus {
    peer.touch(now, cfg.peer_expiry);
    if db.data_sqn.wrapping_sub(peer.rxw.lead()) < u32::MAX / 2 {
        let opened = peer.rxw.window_update(db.data_trail, db.data_sqn.wrapping_add(1), now);
        if opened > 0 {
            arm_new_placeholders(peer, db.data_sqn.wrapping_add(1), opened, now, cfg);
        }
    }

    let status = match opts.fragment {
        Some(frag) => peer.rxw.push_fragment_copy(db.data_sqn, payload, frag, now),
        None => peer.rxw.push_copy(db.data_sqn, payload, now),
    };
    if matches!(status, RxwStatus::Ok) {
        nak::on_data_arrival(&mut peer.nak, &mut peer.rxw, db.data_sqn);
    }
    status
}

/// NCF arrived for `sqn`: advance the NAK engine's state for it.
pub fn on_ncf(peer: &mut Peer, sqn: u32, now: Timestamp, cfg: &TransportConfig) {
    nak::on_ncf(&mut peer.nak, &mut peer.rxw, sqn, now, cfg);
}

/// Outcome of admitting a parity RDATA: either the group is still
/// incomplete (parked), or it decoded and these original sqns were
/// recovered and injected into the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParityOutcome {
    Parked,
    Recovered(Vec<u32>),
}

/// Parity RDATA arrived, wire `data_sqn = tg_sqn | rs_h` per RFC 3208.
/// Parks the payload at the first slot in the transmission group still
/// missing data, tagged with its true `rs_h`; once every slot in
/// `[tg_sqn, tg_sqn+k)` holds either an original or a parked parity
/// shard, RS-decodes the group (keyed by each parked shard's real
/// `rs_h`, not its arrival order) and injects any recovered originals
/// back into the window via `push_nth_repair`.
pub fn on_parity_rdata(
    peer: &mut Peer,
    data_sqn: u32,
    payload: Bytes,
    now: Timestamp,
    cfg: &TransportConfig,
) -> ParityOutcome {
    peer.touch(now, cfg.peer_expiry);
    let k = cfg.fec_k as u32;
    let h = cfg.fec_h as u32;
    let mask = !0u32 << cfg.tg_sqn_shift();
    let tg_sqn = data_sqn & mask;
    let rs_h = data_sqn & !mask;

    if peer.rxw.window_update(peer.rxw.trail(), peer.rxw.lead().max(tg_sqn.wrapping_add(k)), now) > 0 {
        arm_new_placeholders(peer, tg_sqn.wrapping_add(k), k as usize, now, cfg);
    }

    let slot = (0..k)
        .map(|i| tg_sqn.wrapping_add(i))
        .find(|&s| matches!(peer.rxw.peek(s), None) || matches!(peer.rxw.peek(s), Some(e) if e.payload.is_none()));

    let Some(slot) = slot else {
        return ParityOutcome::Parked; // group already fully resolved
    };
    peer.rxw.push_nth_parity_copy(slot, rs_h, payload, now);

    let mut originals = Vec::new();
    let mut recovery = Vec::new();
    let mut missing = Vec::new();
    for i in 0..k {
        let sqn = tg_sqn.wrapping_add(i);
        match peer.rxw.peek(sqn) {
            Some(e) if e.payload.is_some() && !e.is_parity => {
                originals.push((i as usize, e.payload.as_ref().unwrap().to_vec()));
            }
            Some(e) if e.payload.is_some() && e.is_parity => {
                let idx = e.parity_rs_h.expect("parked parity entry always carries rs_h") as usize;
                recovery.push((idx, e.payload.as_ref().unwrap().to_vec()));
            }
            _ => missing.push(sqn),
        }
    }

    if !missing.is_empty() {
        return ParityOutcome::Parked; // transmission group incomplete
    }
    if originals.len() as u32 == k || recovery.len() as u32 > h {
        return ParityOutcome::Parked; // nothing to recover, or malformed accounting
    }

    let decoder = RsDecoder::new(k as usize, h as usize);
    let restored = match decoder.decode(&originals, &recovery) {
        Ok(map) => map,
        Err(_) => return ParityOutcome::Parked,
    };

    let mut recovered_sqns = Vec::new();
    for (idx, shard) in restored {
        let sqn = tg_sqn.wrapping_add(idx as u32);
        let trimmed = trim_var_pktlen(shard, cfg.use_varpkt_len);
        peer.rxw.push_nth_repair(sqn, Bytes::from(trimmed), now);
        nak::on_data_arrival(&mut peer.nak, &mut peer.rxw, sqn);
        recovered_sqns.push(sqn);
    }
    debug!(peer = ?peer.tsi, tg_sqn, recovered = recovered_sqns.len(), "fec recovery");
    ParityOutcome::Recovered(recovered_sqns)
}

/// Strip the trailing 16-bit original-length trailer appended under
/// `OPT_VAR_PKTLEN` during parity encode (see
/// [`crate::sender::Sender`]'s `build_parity`).
fn trim_var_pktlen(mut shard: Vec<u8>, use_varpkt_len: bool) -> Vec<u8> {
    if use_varpkt_len && shard.len() >= 2 {
        let len = shard.len();
        let orig_len = u16::from_be_bytes([shard[len - 2], shard[len - 1]]) as usize;
        shard.truncate(len - 2);
        shard.truncate(orig_len.min(shard.len()));
    }
    shard
}

/// Whether an SPMR should be emitted for this peer right now: the peer has
/// an expired `spmr_expiry` deadline, is not passive, and hasn't already
/// sent one for the current gap.
pub fn should_send_spmr(peer: &Peer, now: Timestamp, cfg: &TransportConfig) -> bool {
    if cfg.is_passive || peer.spmr_sent {
        return false;
    }
    matches!(peer.spmr_expiry, Some(expiry) if now >= expiry)
}

pub fn mark_spmr_sent(peer: &mut Peer, now: Timestamp, cfg: &TransportConfig) {
    peer.spmr_sent = true;
    peer.spmr_expiry = Some(now.checked_add(cfg.spmr_expiry));
}

/// Another peer's multicast SPMR was heard for the same group: cancel our
/// own pending SPMR per the suppression rule in spec.md §4.F.
pub fn suppress_spmr(peer: &mut Peer) {
    peer.spmr_expiry = None;
}

/// Zero-pad an odd-length shard ahead of RS decode, mirroring the
/// sender's `TransmitWindow::zero_pad` for consistent shard length.
pub fn zero_pad_to_max(shards: &mut [Vec<u8>]) {
    let max = shards.iter().map(Vec::len).max().unwrap_or(0);
    for shard in shards {
        if shard.len() < max {
            *shard = TransmitWindow::zero_pad(shard, max);
        }
    }
}
