//! # Receiver NAK Engine
//!
//! The three time-ordered FIFOs (`backoff_queue`, `wait_ncf_queue`,
//! `wait_data_queue`) per peer and the state-transition functions that
//! drive entries between them. Generalized from the donor's flat
//! `arq::LossDetector` (one NACK-suppression map keyed by seq, a single
//! rearm interval, a fixed retry budget) into PGM's three-stage
//! back-off/NCF-wait/RDATA-wait pipeline — the donor's "rearm interval"
//! becomes three distinct interval classes and its "retry budget" becomes
//! two independently exhausted counters (`ncf_retry_count`,
//! `data_retry_count`).

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;

use crate::clock::Timestamp;
use crate::config::TransportConfig;
use crate::rxw::{QueueKind, ReceiveWindow, RxwEntry, RxwState};

/// A NAK (or NAK-list, or parity-NAK) ready to be sent.
#[derive(Debug, Clone)]
pub struct NakRequest {
    pub primary_sqn: u32,
    pub list: Vec<u32>,
    pub is_parity: bool,
    pub nak_pkt_cnt: u32,
}

/// Per-peer FIFO state. Lives alongside `Peer` (kept separate so the peer
/// table doesn't need to know NAK-engine internals).
#[derive(Default)]
pub struct NakFifos {
    backoff_queue: VecDeque<u32>,
    wait_ncf_queue: VecDeque<u32>,
    wait_data_queue: VecDeque<u32>,
}

impl NakFifos {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<u32> {
        match kind {
            QueueKind::BackOff => &mut self.backoff_queue,
            QueueKind::WaitNcf => &mut self.wait_ncf_queue,
            QueueKind::WaitData => &mut self.wait_data_queue,
        }
    }

    /// Remove `sqn` from whichever queue currently holds it. O(n) in queue
    /// length; queues are bounded by window size, not total traffic.
    fn unlink(&mut self, sqn: u32) {
        self.backoff_queue.retain(|&s| s != sqn);
        self.wait_ncf_queue.retain(|&s| s != sqn);
        self.wait_data_queue.retain(|&s| s != sqn);
    }

    pub fn backoff_len(&self) -> usize {
        self.backoff_queue.len()
    }

    pub fn wait_ncf_len(&self) -> usize {
        self.wait_ncf_queue.len()
    }

    pub fn wait_data_len(&self) -> usize {
        self.wait_data_queue.len()
    }
}

fn jitter(bound: Duration) -> Duration {
    if bound.is_zero() {
        return bound;
    }
    let micros = bound.as_micros().max(1) as u64;
    Duration::from_micros(rand::rng().random_range(1..=micros))
}

/// Open a BACK_OFF placeholder's timer and link it into the backoff queue.
/// Called right after `ReceiveWindow::window_update` / `push_copy` open a
/// fresh entry.
pub fn arm_backoff(fifos: &mut NakFifos, rxw: &mut ReceiveWindow, sqn: u32, now: Timestamp, cfg: &TransportConfig) {
    if let Some(entry) = rxw.peek_mut(sqn) {
        entry.nak_rb_expiry = Some(now.checked_add(jitter(cfg.nak_bo_ivl)));
    }
    fifos.backoff_queue.push_back(sqn);
    rxw.set_queue_link(sqn, QueueKind::BackOff);
}

/// Drain the backoff queue's expired tail entries into one NAK (or, under
/// on-demand parity, one parity-NAK scoped to a single transmission
/// group strictly prior to `current_tg_sqn`).
pub fn nak_rb_state(
    fifos: &mut NakFifos,
    rxw: &mut ReceiveWindow,
    now: Timestamp,
    cfg: &TransportConfig,
    current_tg_sqn: u32,
) -> Option<NakRequest> {
    if cfg.use_ondemand_parity {
        return nak_rb_state_parity(fifos, rxw, now, cfg, current_tg_sqn);
    }

    let mut list = Vec::new();
    while let Some(&sqn) = fifos.backoff_queue.front() {
        let expiry = match rxw.peek(sqn) {
            Some(e) if matches!(e.state, RxwState::BackOff) => e.nak_rb_expiry,
            _ => {
                fifos.backoff_queue.pop_front();
                continue;
            }
        };
        let expiry = match expiry {
            Some(e) => e,
            None => {
                fifos.backoff_queue.pop_front();
                continue;
            }
        };
        if now < expiry {
            break;
        }
        fifos.backoff_queue.pop_front();
        list.push(sqn);
        if let Some(e) = rxw.peek_mut(sqn) {
            e.state = RxwState::WaitNcf;
            e.nak_rpt_expiry = Some(now.checked_add(cfg.nak_rpt_ivl));
            e.nak_transmit_count += 1;
        }
        fifos.wait_ncf_queue.push_back(sqn);
        rxw.set_queue_link(sqn, QueueKind::WaitNcf);
        if list.len() >= crate::wire::NAK_LIST_MAX {
            break;
        }
    }

    if list.is_empty() {
        return None;
    }
    let primary = list.remove(0);
    let count = 1 + list.len() as u32;
    Some(NakRequest {
        primary_sqn: primary,
        list,
        is_parity: false,
        nak_pkt_cnt: count,
    })
}

fn nak_rb_state_parity(
    fifos: &mut NakFifos,
    rxw: &mut ReceiveWindow,
    now: Timestamp,
    cfg: &TransportConfig,
    current_tg_sqn: u32,
) -> Option<NakRequest> {
    let mask = !0u32 << cfg.tg_sqn_shift();
    let mut tg_sqn: Option<u32> = None;
    let mut count = 0u32;
    let mut drained = Vec::new();

    while let Some(&sqn) = fifos.backoff_queue.front() {
        let entry_tg = sqn & mask;
        if entry_tg.wrapping_sub(current_tg_sqn) < u32::MAX / 2 && entry_tg == current_tg_sqn {
            break; // never NAK the in-flight group
        }
        if let Some(t) = tg_sqn {
            if entry_tg != t {
                break; // stop at tg boundary
            }
        }
        let expiry = match rxw.peek(sqn) {
            Some(e) if matches!(e.state, RxwState::BackOff) => e.nak_rb_expiry,
            _ => {
                fifos.backoff_queue.pop_front();
                continue;
            }
        };
        let expiry = match expiry {
            Some(e) => e,
            None => {
                fifos.backoff_queue.pop_front();
                continue;
            }
        };
        if now < expiry {
            break;
        }
        fifos.backoff_queue.pop_front();
        tg_sqn = Some(entry_tg);
        count += 1;
        drained.push(sqn);
        if let Some(e) = rxw.peek_mut(sqn) {
            e.state = RxwState::WaitNcf;
            e.nak_rpt_expiry = Some(now.checked_add(cfg.nak_rpt_ivl));
            e.nak_transmit_count += 1;
        }
        fifos.wait_ncf_queue.push_back(sqn);
        rxw.set_queue_link(sqn, QueueKind::WaitNcf);
    }

    let tg_sqn = tg_sqn?;
    Some(NakRequest {
        primary_sqn: tg_sqn,
        list: drained,
        is_parity: true,
        nak_pkt_cnt: count,
    })
}

/// Drain the NCF-wait queue's expired tail entries: re-arm into BACK_OFF
/// if retries remain, else declare LOST. Returns the sqns newly marked
/// LOST (for stats and waiting-list flush).
pub fn nak_rpt_state(
    fifos: &mut NakFifos,
    rxw: &mut ReceiveWindow,
    now: Timestamp,
    cfg: &TransportConfig,
) -> Vec<u32> {
    let mut lost = Vec::new();
    while let Some(&sqn) = fifos.wait_ncf_queue.front() {
        let expiry = match rxw.peek(sqn) {
            Some(e) if matches!(e.state, RxwState::WaitNcf) => e.nak_rpt_expiry,
            _ => {
                fifos.wait_ncf_queue.pop_front();
                continue;
            }
        };
        let expiry = match expiry {
            Some(e) => e,
            None => {
                fifos.wait_ncf_queue.pop_front();
                continue;
            }
        };
        if now < expiry {
            break;
        }
        fifos.wait_ncf_queue.pop_front();

        let retry_count = rxw.peek(sqn).map(|e| e.ncf_retry_count).unwrap_or(0);
        if retry_count < cfg.nak_ncf_retries {
            if let Some(e) = rxw.peek_mut(sqn) {
                e.state = RxwState::BackOff;
                e.nak_rb_expiry = Some(now.checked_add(jitter(cfg.nak_bo_ivl)));
                e.ncf_retry_count += 1;
            }
            fifos.backoff_queue.push_back(sqn);
            rxw.set_queue_link(sqn, QueueKind::BackOff);
        } else {
            rxw.mark_lost(sqn);
            lost.push(sqn);
        }
    }
    lost
}

/// NCF arrived for `sqn`: move it out of BACK_OFF/WAIT_NCF and into
/// WAIT_DATA, re-arming `nak_rb_expiry` in case further loss follows.
pub fn on_ncf(fifos: &mut NakFifos, rxw: &mut ReceiveWindow, sqn: u32, now: Timestamp, cfg: &TransportConfig) {
    let was_tracked = matches!(
        rxw.peek(sqn).map(|e| e.state),
        Some(RxwState::BackOff) | Some(RxwState::WaitNcf)
    );
    if !was_tracked {
        return;
    }
    fifos.unlink(sqn);
    rxw.ncf(
        sqn,
        now.checked_add(cfg.nak_rdata_ivl),
        now.checked_add(jitter(cfg.nak_bo_ivl)),
    );
    fifos.wait_data_queue.push_back(sqn);
    rxw.set_queue_link(sqn, QueueKind::WaitData);
}

/// Drain the RDATA-wait queue's expired tail entries: re-arm into
/// BACK_OFF if retries remain, else declare LOST.
pub fn nak_rdata_state(
    fifos: &mut NakFifos,
    rxw: &mut ReceiveWindow,
    now: Timestamp,
    cfg: &TransportConfig,
) -> Vec<u32> {
    let mut lost = Vec::new();
    while let Some(&sqn) = fifos.wait_data_queue.front() {
        let expiry = match rxw.peek(sqn) {
            Some(e) if matches!(e.state, RxwState::WaitData) => e.nak_rdata_expiry,
            _ => {
                fifos.wait_data_queue.pop_front();
                continue;
            }
        };
        let expiry = match expiry {
            Some(e) => e,
            None => {
                fifos.wait_data_queue.pop_front();
                continue;
            }
        };
        if now < expiry {
            break;
        }
        fifos.wait_data_queue.pop_front();

        let retry_count = rxw.peek(sqn).map(|e| e.data_retry_count).unwrap_or(0);
        if retry_count < cfg.nak_data_retries {
            if let Some(e) = rxw.peek_mut(sqn) {
                e.state = RxwState::BackOff;
                e.nak_rb_expiry = Some(now.checked_add(jitter(cfg.nak_bo_ivl)));
                e.data_retry_count += 1;
            }
            fifos.backoff_queue.push_back(sqn);
            rxw.set_queue_link(sqn, QueueKind::BackOff);
        } else {
            rxw.mark_lost(sqn);
            lost.push(sqn);
        }
    }
    lost
}

/// Earliest timer expiry across all three queues' head entries. The
/// scheduler uses this to size its next wakeup without walking every
/// tracked sqn.
pub fn next_expiry(fifos: &NakFifos, rxw: &ReceiveWindow) -> Option<Timestamp> {
    let mut best: Option<Timestamp> = None;
    let mut consider = |sqn: Option<&u32>, pick: fn(&RxwEntry) -> Option<Timestamp>| {
        if let Some(e) = sqn.and_then(|&s| rxw.peek(s)) {
            if let Some(t) = pick(e) {
                best = Some(best.map_or(t, |b: Timestamp| b.min(t)));
            }
        }
    };
    consider(fifos.backoff_queue.front(), |e| e.nak_rb_expiry);
    consider(fifos.wait_ncf_queue.front(), |e| e.nak_rpt_expiry);
    consider(fifos.wait_data_queue.front(), |e| e.nak_rdata_expiry);
    best
}

/// RDATA (or ODATA) arrived for `sqn`: it leaves all three queues. The
/// window already moved it to `HAVE_DATA`; this only clears the engine's
/// own FIFO membership.
pub fn on_data_arrival(fifos: &mut NakFifos, rxw: &mut ReceiveWindow, sqn: u32) {
    fifos.unlink(sqn);
    rxw.pkt_state_unlink(sqn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cfg() -> TransportConfig {
        let mut c = TransportConfig::default();
        c.nak_bo_ivl = Duration::from_millis(10);
        c.nak_rpt_ivl = Duration::from_millis(10);
        c.nak_rdata_ivl = Duration::from_millis(10);
        c.nak_ncf_retries = 1;
        c.nak_data_retries = 1;
        c
    }

    fn t(ms: u64) -> Timestamp {
        Timestamp::zero().checked_add(Duration::from_millis(ms))
    }

    #[test]
    fn backoff_expiry_emits_nak() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 1, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);

        assert!(nak_rb_state(&mut fifos, &mut rxw, t(1), &cfg, 1000).is_none());
        let req = nak_rb_state(&mut fifos, &mut rxw, t(20), &cfg, 1000).unwrap();
        assert_eq!(req.primary_sqn, 0);
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::WaitNcf);
    }

    #[test]
    fn nak_list_batches_multiple_sqns() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 3, t(0));
        for sqn in 0..3 {
            arm_backoff(&mut fifos, &mut rxw, sqn, t(0), &cfg);
        }
        let req = nak_rb_state(&mut fifos, &mut rxw, t(20), &cfg, 1000).unwrap();
        assert_eq!(req.nak_pkt_cnt, 3);
        assert_eq!(req.list.len(), 2);
    }

    #[test]
    fn rpt_expiry_reverts_to_backoff_then_exhausts() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 1, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);
        nak_rb_state(&mut fifos, &mut rxw, t(20), &cfg, 1000);
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::WaitNcf);

        // first rpt expiry: nak_ncf_retries=1, retry_count starts at 0 -> re-arm
        let lost = nak_rpt_state(&mut fifos, &mut rxw, t(40), &cfg);
        assert!(lost.is_empty());
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::BackOff);

        // drain it back into wait_ncf, then expire again -> exhausted -> LOST
        nak_rb_state(&mut fifos, &mut rxw, t(60), &cfg, 1000);
        let lost = nak_rpt_state(&mut fifos, &mut rxw, t(80), &cfg);
        assert_eq!(lost, vec![0]);
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::Lost);
    }

    #[test]
    fn ncf_moves_to_wait_data() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 1, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);
        nak_rb_state(&mut fifos, &mut rxw, t(20), &cfg, 1000);

        on_ncf(&mut fifos, &mut rxw, 0, t(25), &cfg);
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::WaitData);
        assert_eq!(fifos.wait_ncf_len(), 0);
        assert_eq!(fifos.wait_data_len(), 1);
    }

    #[test]
    fn rdata_expiry_exhausts_to_lost() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 1, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);
        nak_rb_state(&mut fifos, &mut rxw, t(20), &cfg, 1000);
        on_ncf(&mut fifos, &mut rxw, 0, t(25), &cfg);

        let lost = nak_rdata_state(&mut fifos, &mut rxw, t(40), &cfg);
        assert!(lost.is_empty()); // first timeout re-arms
        assert_eq!(rxw.peek(0).unwrap().state, RxwState::BackOff);

        nak_rb_state(&mut fifos, &mut rxw, t(60), &cfg, 1000);
        on_ncf(&mut fifos, &mut rxw, 0, t(65), &cfg);
        let lost = nak_rdata_state(&mut fifos, &mut rxw, t(80), &cfg);
        assert_eq!(lost, vec![0]);
    }

    #[test]
    fn next_expiry_reports_earliest_queue_head() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 2, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);
        arm_backoff(&mut fifos, &mut rxw, 1, t(5), &cfg);
        let first = rxw.peek(0).unwrap().nak_rb_expiry.unwrap();
        assert_eq!(next_expiry(&fifos, &rxw), Some(first));
    }

    #[test]
    fn data_arrival_clears_all_queues() {
        let cfg = cfg();
        let mut rxw = ReceiveWindow::new();
        let mut fifos = NakFifos::new();
        rxw.window_update(0, 1, t(0));
        arm_backoff(&mut fifos, &mut rxw, 0, t(0), &cfg);
        rxw.push_copy(0, Bytes::from_static(b"x"), t(5));
        on_data_arrival(&mut fifos, &mut rxw, 0);
        assert_eq!(fifos.backoff_len(), 0);
        assert_eq!(fifos.wait_ncf_len(), 0);
        assert_eq!(fifos.wait_data_len(), 0);
    }
}
