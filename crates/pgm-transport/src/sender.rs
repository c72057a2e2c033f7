//! # Sender Engine
//!
//! Pure logic — no I/O, matching the donor's split between state machine
//! and transport. Accepts application data, assigns sequence numbers,
//! fragments and serializes ODATA, rebuilds RDATA and parity TPDUs out of
//! the transmit window's retransmit queue, drives the SPM ambient/
//! heartbeat schedule, and admits incoming NAKs. Actual `sendto` calls are
//! made by the caller (the scheduler/dispatch layer) through [`crate::io`].
//!
//! ## Responsibilities
//!
//! 1. **ODATA emission**: assign sqns, fragment oversized payloads, push
//!    to the transmit window.
//! 2. **RDATA emission**: rebuild a TPDU from a retransmit-queue entry.
//! 3. **Parity construction**: RS-encode a transmission group on request.
//! 4. **SPM schedule**: ambient heartbeat, re-armed after every data send.
//! 5. **NAK admission**: validate, batch, and queue inbound NAKs, answer
//!    with NCF.

use bytes::Bytes;
use std::time::Duration;

use crate::clock::Timestamp;
use crate::codec::RsEncoder;
use crate::config::TransportConfig;
use crate::error::PgmError;
use crate::peer::Tsi;
use crate::stats::SenderStats;
use crate::txw::{RetransmitRequest, TransmitWindow};
use crate::wire::{
    DataBody, NakBody, Nla, OptFragment, OptParityPrm, OptionChain, PgmBody, PgmHeader, PgmPacket,
    PgmType, OPT_PARITY, OPT_PRESENT, OPT_VAR_PKTLEN, PGM_HEADER_LEN,
};

// ─── Heartbeat schedule ─────────────────────────────────────────────────────

/// The decaying-interval SPM heartbeat armed after every data send. The
/// donor's `[0, h1, .., hn, 0]` array overloads its two zero entries as
/// both "ambient state" and "terminator" (flagged for separation); this
/// keeps the same `hN` sequence but tracks armed/disarmed as an
/// `Option<usize>` index instead of a magic state value.
pub struct HeartbeatSchedule {
    intervals: Vec<Duration>,
    armed_index: Option<usize>,
    next_fire: Option<Timestamp>,
}

impl HeartbeatSchedule {
    /// `schedule_ms` is the configured array including its leading and
    /// trailing zero sentinels; only the interior non-zero values are
    /// kept as the actual heartbeat sequence.
    pub fn new(schedule_ms: &[u64]) -> Self {
        let intervals = schedule_ms
            .iter()
            .filter(|&&ms| ms != 0)
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        HeartbeatSchedule {
            intervals,
            armed_index: None,
            next_fire: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed_index.is_some()
    }

    pub fn next_fire(&self) -> Option<Timestamp> {
        self.next_fire
    }

    /// Re-arm from the start of the sequence, called after every
    /// successful ODATA/RDATA send.
    pub fn arm(&mut self, now: Timestamp) {
        if self.intervals.is_empty() {
            self.armed_index = None;
            self.next_fire = None;
            return;
        }
        self.armed_index = Some(0);
        self.next_fire = Some(now.checked_add(self.intervals[0]));
    }

    /// Disarm without scheduling a next heartbeat, called when the
    /// ambient SPM fires (it makes any pending heartbeat redundant).
    pub fn disarm(&mut self) {
        self.armed_index = None;
        self.next_fire = None;
    }

    /// Advance to the next interval, or disarm once the sequence is
    /// exhausted.
    pub fn fire(&mut self, now: Timestamp) {
        let Some(idx) = self.armed_index else { return };
        let next_idx = idx + 1;
        if next_idx >= self.intervals.len() {
            self.disarm();
        } else {
            self.armed_index = Some(next_idx);
            self.next_fire = Some(now.checked_add(self.intervals[next_idx]));
        }
    }
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// One outbound fragment: payload plus the `OPT_FRAGMENT` triple, if any.
struct Piece {
    payload: Bytes,
    fragment: Option<OptFragment>,
}

/// Sender-side state machine for one transport.
pub struct Sender {
    tsi: Tsi,
    dst_port: u16,
    nla: Nla,
    grp_nla: Nla,
    max_tpdu: u16,
    fec_k: u8,
    fec_h: u8,
    tg_sqn_shift: u32,
    use_proactive_parity: bool,
    use_ondemand_parity: bool,
    use_varpkt_len: bool,
    txw: TransmitWindow,
    ambient_interval: Duration,
    next_ambient_spm: Timestamp,
    heartbeat: HeartbeatSchedule,
    spm_sqn: u32,
    stats: SenderStats,
}

impl Sender {
    pub fn new(cfg: &TransportConfig, tsi: Tsi, dst_port: u16, nla: Nla, grp_nla: Nla, now: Timestamp) -> Self {
        Sender {
            tsi,
            dst_port,
            nla,
            grp_nla,
            max_tpdu: cfg.max_tpdu,
            fec_k: cfg.fec_k,
            fec_h: cfg.fec_h,
            tg_sqn_shift: cfg.tg_sqn_shift(),
            use_proactive_parity: cfg.use_proactive_parity,
            use_ondemand_parity: cfg.use_ondemand_parity,
            use_varpkt_len: cfg.use_varpkt_len,
            txw: TransmitWindow::new(cfg.txw_sqns),
            ambient_interval: cfg.ambient_spm_interval,
            next_ambient_spm: now.checked_add(cfg.ambient_spm_interval),
            heartbeat: HeartbeatSchedule::new(&cfg.heartbeat_spm_schedule_ms),
            spm_sqn: 0,
            stats: SenderStats::new(),
        }
    }

    fn max_payload(&self) -> usize {
        self.max_tpdu as usize - PGM_HEADER_LEN - DataBody::LEN
    }

    fn header(&self, pgm_type: PgmType, options: u8, tsdu_length: u16) -> PgmHeader {
        PgmHeader {
            src_port: self.tsi.source_port,
            dst_port: self.dst_port,
            pgm_type,
            options,
            checksum: 0,
            gsi: self.tsi.gsi,
            tsdu_length,
        }
    }

    fn split(&self, data: Bytes) -> Vec<Piece> {
        let max = self.max_payload();
        if data.len() <= max {
            return vec![Piece {
                payload: data,
                fragment: None,
            }];
        }
        let total = data.len() as u32;
        let mut pieces = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            pieces.push(Piece {
                payload: data.slice(offset..end),
                fragment: Some(OptFragment {
                    first_sqn: 0, // patched once the first sqn is known
                    frag_off: offset as u32,
                    frag_len: total,
                }),
            });
            offset = end;
        }
        pieces
    }

    /// Submit application data. Fragments if it exceeds one TPDU, pushes
    /// each piece to the transmit window, and returns the ODATA packets
    /// ready to send. Re-arms the heartbeat schedule.
    pub fn send(&mut self, data: Bytes, now: Timestamp) -> Vec<PgmPacket> {
        let pieces = self.split(data);
        let first_sqn = self.txw.next_lead();
        let mut out = Vec::with_capacity(pieces.len());

        for piece in pieces {
            let fragment = piece.fragment.map(|f| OptFragment {
                first_sqn,
                ..f
            });
            let sqn = self.txw.push(piece.payload.clone(), fragment);

            let opts = OptionChain {
                fragment,
                ..Default::default()
            };
            let options_byte = if opts.is_empty() { 0 } else { OPT_PRESENT };
            let header = self.header(PgmType::Odata, options_byte, piece.payload.len() as u16);
            let body = PgmBody::Data(
                DataBody {
                    data_sqn: sqn,
                    data_trail: self.txw.trail(),
                },
                opts,
                piece.payload,
            );
            out.push(PgmPacket { header, body });
            self.stats.odata_sent += 1;
        }

        if !out.is_empty() {
            self.stats.bytes_sent += out.iter().map(|p| p.header.tsdu_length as u64).sum::<u64>();
            self.heartbeat.arm(now);
        }
        out
    }

    fn build_spm(&mut self, now: Timestamp) -> PgmPacket {
        self.spm_sqn = self.spm_sqn.wrapping_add(1);
        let parity_prm = if self.use_proactive_parity || self.use_ondemand_parity {
            Some(OptParityPrm {
                proactive: self.use_proactive_parity,
                ondemand: self.use_ondemand_parity,
                transmission_group_size: self.fec_k as u32,
            })
        } else {
            None
        };
        let options = if parity_prm.is_some() { OPT_PRESENT } else { 0 };
        let header = self.header(PgmType::Spm, options, 0);
        let body = PgmBody::Spm(crate::wire::SpmBody {
            spm_sqn: self.spm_sqn,
            trail: self.txw.trail(),
            lead: self.txw.lead(),
            nla: self.nla,
            parity_prm,
        });
        self.stats.spm_sent += 1;
        let _ = now;
        PgmPacket { header, body }
    }

    /// Fires the ambient SPM if due, resetting the heartbeat schedule.
    pub fn maybe_ambient_spm(&mut self, now: Timestamp) -> Option<PgmPacket> {
        if now < self.next_ambient_spm {
            return None;
        }
        self.next_ambient_spm = now.checked_add(self.ambient_interval);
        self.heartbeat.disarm();
        Some(self.build_spm(now))
    }

    /// Fires the next heartbeat SPM if armed and due.
    pub fn maybe_heartbeat_spm(&mut self, now: Timestamp) -> Option<PgmPacket> {
        match self.heartbeat.next_fire() {
            Some(fire_at) if now >= fire_at => {
                self.heartbeat.fire(now);
                Some(self.build_spm(now))
            }
            _ => None,
        }
    }

    /// Builds and sends an SPM immediately regardless of the ambient
    /// schedule, re-arming `next_ambient_spm` from `now` as if it had
    /// fired normally. Used to answer a unicast SPMR.
    pub fn force_spm(&mut self, now: Timestamp) -> PgmPacket {
        self.next_ambient_spm = now.checked_add(self.ambient_interval);
        self.heartbeat.disarm();
        self.build_spm(now)
    }

    pub fn next_poll(&self) -> Option<Timestamp> {
        match (self.heartbeat.next_fire(), self.next_ambient_spm) {
            (Some(hb), ambient) => Some(if hb < ambient { hb } else { ambient }),
            (None, ambient) => Some(ambient),
        }
    }

    /// Pop one pending retransmission and rebuild it as RDATA, or as a
    /// parity TPDU over its transmission group.
    pub fn pop_retransmit(&mut self) -> Option<PgmPacket> {
        match self.txw.retransmit_try_pop()? {
            RetransmitRequest::Selective { sqn } => self.build_rdata(sqn),
            RetransmitRequest::Parity { tg_sqn, rs_h } => self.build_parity(tg_sqn, rs_h),
        }
    }

    fn build_rdata(&mut self, sqn: u32) -> Option<PgmPacket> {
        let entry = self.txw.peek(sqn)?;
        let payload = entry.payload.clone();
        let fragment = entry.fragment;
        let opts = OptionChain {
            fragment,
            ..Default::default()
        };
        let options_byte = if opts.is_empty() { 0 } else { OPT_PRESENT };
        let header = self.header(PgmType::Rdata, options_byte, payload.len() as u16);
        let body = PgmBody::Data(
            DataBody {
                data_sqn: sqn,
                data_trail: self.txw.trail(),
            },
            opts,
            payload,
        );
        self.stats.rdata_sent += 1;
        Some(PgmPacket { header, body })
    }

    /// RS-encodes the `k` members of the transmission group containing
    /// `tg_sqn` and emits the `rs_h`-th repair TPDU. Members unevenly
    /// sized are zero-padded to the group maximum and their true length
    /// appended as a trailing 16-bit trailer, per `OPT_VAR_PKTLEN`.
    fn build_parity(&mut self, tg_sqn: u32, rs_h: u8) -> Option<PgmPacket> {
        let k = self.fec_k as u32;
        let group = self.txw.peek_group(tg_sqn, k);
        if group.iter().any(|e| e.is_none()) {
            return None;
        }
        let entries: Vec<_> = group.into_iter().map(|e| e.unwrap()).collect();
        let max_len = entries.iter().map(|e| e.payload.len()).max().unwrap_or(0);
        let var_pktlen = entries.iter().any(|e| e.payload.len() != max_len) && self.use_varpkt_len;

        let shards: Vec<Vec<u8>> = entries
            .iter()
            .map(|e| {
                let mut padded = TransmitWindow::zero_pad(&e.payload, max_len);
                if var_pktlen {
                    padded.extend_from_slice(&(e.payload.len() as u16).to_be_bytes());
                }
                padded
            })
            .collect();

        let shard_len = shards.first().map(Vec::len).unwrap_or(0);
        let encoder = RsEncoder::new(self.fec_k as usize, self.fec_h as usize);
        let repair = encoder.encode(&shards).ok()?;
        let repair_payload = repair.get(rs_h as usize)?.clone();

        let mut options = OPT_PARITY;
        if var_pktlen {
            options |= OPT_VAR_PKTLEN;
        }
        let header = self.header(PgmType::Rdata, options, shard_len as u16);
        let body = PgmBody::Data(
            DataBody {
                data_sqn: tg_sqn | rs_h as u32,
                data_trail: self.txw.trail(),
            },
            OptionChain::default(),
            Bytes::from(repair_payload),
        );
        self.stats.parity_rdata_sent += 1;
        Some(PgmPacket { header, body })
    }

    /// Validate and admit an incoming NAK/parity-NAK, queueing one or more
    /// retransmit requests and returning the matching NCF to send back.
    /// `None` on a NAK that fails NLA validation or requests parity while
    /// on-demand parity is disabled.
    pub fn admit_nak(&mut self, nak: &NakBody) -> Result<(PgmPacket, usize), PgmError> {
        if nak.src_nla != self.nla || nak.grp_nla != self.grp_nla {
            return Err(PgmError::InvalidArgument(
                "NAK_SRC_NLA/NAK_GRP_NLA mismatch".into(),
            ));
        }
        if nak.is_parity && !self.use_ondemand_parity {
            return Err(PgmError::InvalidArgument(
                "parity NAK received but on-demand parity disabled".into(),
            ));
        }

        let mut sqns = vec![nak.sqn];
        if let Some(list) = &nak.nak_list {
            sqns.extend(list.sqns.iter().copied());
        }

        let mut pushed = 0;
        if nak.is_parity {
            pushed += self
                .txw
                .retransmit_push_parity(nak.sqn, self.tg_sqn_shift, self.fec_h);
        } else {
            for sqn in &sqns {
                pushed += self.txw.retransmit_push(*sqn);
            }
        }

        let ncf_header = self.header(PgmType::Ncf, if nak.nak_list.is_some() { OPT_PRESENT } else { 0 }, 0);
        let ncf_body = PgmBody::Ncf(NakBody {
            sqn: nak.sqn,
            src_nla: self.nla,
            grp_nla: self.grp_nla,
            nak_list: nak.nak_list.clone(),
            is_parity: nak.is_parity,
        });
        self.stats.naks_received += 1;
        self.stats.ncfs_sent += 1;
        Ok((
            PgmPacket {
                header: ncf_header,
                body: ncf_body,
            },
            pushed,
        ))
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn txw(&self) -> &TransmitWindow {
        &self.txw
    }

    pub fn txw_mut(&mut self) -> &mut TransmitWindow {
        &mut self.txw
    }
}
