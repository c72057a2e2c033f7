//! # Receive Window
//!
//! Per-peer buffer of receive-window entries, keyed by sqn over the same
//! circular 32-bit space as the transmit window. Adapted from the donor's
//! `receiver::Receiver` reorder buffer: that type kept a flat
//! `BTreeMap<u64, BufferedPacket>` plus a separate `FragmentAssembler`
//! reassembling completed APDUs as a side effect of delivery order. Here
//! the map entries themselves carry NAK-engine state (`RxwState`, the
//! three expiry timestamps, the retry counters) since the window and the
//! NAK engine are consulted by the same per-sqn record; fragment
//! reassembly is folded into `readv` instead of a standalone helper.

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

use crate::clock::Timestamp;
use crate::wire::OptFragment;

/// Status codes returned by window operations, named in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxwStatus {
    CreatedPlaceholder,
    Duplicate,
    MalformedApdu,
    NotInTxw,
    ApduLost,
    Ok,
}

/// `sequence_number`, `state`, and the NAK-engine bookkeeping fields
/// named in §3 DATA MODEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxwState {
    BackOff,
    WaitNcf,
    WaitData,
    HaveData,
    Lost,
    Committed,
}

/// Which of the three FIFOs (owned by the NAK engine, not this window)
/// an entry is currently linked into, if any. Used to uphold "a packet is
/// a member of at most one queue" across `pkt_state_unlink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    BackOff,
    WaitNcf,
    WaitData,
}

#[derive(Debug, Clone)]
pub struct RxwEntry {
    pub sqn: u32,
    pub state: RxwState,
    pub payload: Option<Bytes>,
    pub fragment: Option<OptFragment>,
    pub is_parity: bool,
    /// The parity shard's true `rs_h` index within its transmission
    /// group, when `is_parity` — distinct from the key this entry is
    /// parked under, which may be any free slot in the group's sqn
    /// range, not the slot matching `rs_h`.
    pub parity_rs_h: Option<u32>,
    pub t0: Timestamp,
    pub nak_rb_expiry: Option<Timestamp>,
    pub nak_rpt_expiry: Option<Timestamp>,
    pub nak_rdata_expiry: Option<Timestamp>,
    pub nak_transmit_count: u32,
    pub ncf_retry_count: u8,
    pub data_retry_count: u8,
    pub queue_link: Option<QueueKind>,
}

impl RxwEntry {
    fn placeholder(sqn: u32, t0: Timestamp) -> Self {
        RxwEntry {
            sqn,
            state: RxwState::BackOff,
            payload: None,
            fragment: None,
            is_parity: false,
            parity_rs_h: None,
            t0,
            nak_rb_expiry: None,
            nak_rpt_expiry: None,
            nak_rdata_expiry: None,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            queue_link: None,
        }
    }
}

/// In-progress APDU reassembly, mirroring the donor's `FragmentChain`.
struct FragmentChain {
    data: Vec<u8>,
    expected_next_sqn: u32,
    total_length: u32,
}

pub struct ReceiveWindow {
    entries: BTreeMap<u32, RxwEntry>,
    /// Sender-advertised window floor (`SPM.trail` / `data_trail`). Only
    /// ever slides forward; distinct from `commit`, which tracks how far
    /// in-order delivery has actually progressed.
    trail: u32,
    /// Next sqn `try_commit` is waiting on. Advances only as entries are
    /// committed, never reset by an inbound `trail` announcement.
    commit: u32,
    lead: u32,
    committed: VecDeque<u32>,
    fragments: BTreeMap<u32, FragmentChain>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        ReceiveWindow {
            entries: BTreeMap::new(),
            trail: 0,
            commit: 0,
            lead: 0,
            committed: VecDeque::new(),
            fragments: BTreeMap::new(),
        }
    }

    /// Insert (or fill) a complete unfragmented TSDU received as ODATA/RDATA.
    pub fn push_copy(&mut self, sqn: u32, payload: Bytes, now: Timestamp) -> RxwStatus {
        self.push_inner(sqn, payload, None, false, None, now)
    }

    /// Insert a fragment carrying `OPT_FRAGMENT`; reassembly completes
    /// lazily at `readv` time.
    pub fn push_fragment_copy(
        &mut self,
        sqn: u32,
        payload: Bytes,
        fragment: OptFragment,
        now: Timestamp,
    ) -> RxwStatus {
        self.push_inner(sqn, payload, Some(fragment), false, None, now)
    }

    /// Insert the `n`-th original recovered by RS decode of a parity group.
    pub fn push_nth_repair(&mut self, sqn: u32, payload: Bytes, now: Timestamp) -> RxwStatus {
        self.push_inner(sqn, payload, None, false, None, now)
    }

    /// Insert a parity symbol of a transmission group at the first free
    /// slot in the group's own sqn range, parked until the group is
    /// complete enough to RS-decode. `rs_h` is the shard's true index
    /// within the group's repair set (`data_sqn`'s low bits per RFC 3208)
    /// — distinct from, and persisted alongside, whatever slot it parks
    /// at, so the decode step can recover the correct recovery index even
    /// when parity shards arrive out of `rs_h` order.
    pub fn push_nth_parity_copy(&mut self, sqn: u32, rs_h: u32, payload: Bytes, now: Timestamp) -> RxwStatus {
        self.push_inner(sqn, payload, None, true, Some(rs_h), now)
    }

    fn push_inner(
        &mut self,
        sqn: u32,
        payload: Bytes,
        fragment: Option<OptFragment>,
        is_parity: bool,
        parity_rs_h: Option<u32>,
        now: Timestamp,
    ) -> RxwStatus {
        if sqn.wrapping_sub(self.trail) > u32::MAX / 2 {
            return RxwStatus::NotInTxw;
        }
        match self.entries.get_mut(&sqn) {
            Some(entry) => {
                if matches!(entry.state, RxwState::HaveData | RxwState::Committed) {
                    return RxwStatus::Duplicate;
                }
                if matches!(entry.state, RxwState::Lost) {
                    return RxwStatus::ApduLost;
                }
                entry.payload = Some(payload);
                entry.fragment = fragment;
                entry.is_parity = is_parity;
                entry.parity_rs_h = parity_rs_h;
                entry.state = RxwState::HaveData;
                entry.queue_link = None;
            }
            None => {
                let mut entry = RxwEntry::placeholder(sqn, now);
                entry.payload = Some(payload);
                entry.fragment = fragment;
                entry.is_parity = is_parity;
                entry.parity_rs_h = parity_rs_h;
                entry.state = RxwState::HaveData;
                self.entries.insert(sqn, entry);
                if sqn.wrapping_sub(self.lead) < u32::MAX / 2 && sqn >= self.lead {
                    self.lead = sqn.wrapping_add(1);
                }
            }
        }
        self.try_commit();
        RxwStatus::Ok
    }

    /// Called when an SPM (or data) advances the advertised `[trail, lead)`
    /// beyond what's locally known. Opens `BACK_OFF` placeholders for each
    /// newly-announced, not-yet-seen sqn and returns how many were opened
    /// (the count the NAK engine must arm `nak_rb_expiry` for). Only ever
    /// slides `trail` forward: a sender's `data_trail` lags behind (it's
    /// `0` until the transmit window first trims), so an older-or-equal
    /// announcement must not roll the window floor backward, and must
    /// never touch the independent `commit` cursor.
    pub fn window_update(&mut self, trail: u32, lead: u32, now: Timestamp) -> usize {
        if trail.wrapping_sub(self.trail) < u32::MAX / 2 {
            self.trail = trail;
        }
        if lead.wrapping_sub(self.lead) > u32::MAX / 2 {
            return 0;
        }
        let mut opened = 0;
        let mut sqn = self.lead;
        while sqn != lead {
            if !self.entries.contains_key(&sqn) {
                self.entries.insert(sqn, RxwEntry::placeholder(sqn, now));
                opened += 1;
            }
            sqn = sqn.wrapping_add(1);
        }
        self.lead = lead;
        opened
    }

    /// NCF received for `sqn`: move a BACK_OFF/WAIT_NCF entry to WAIT_DATA.
    pub fn ncf(&mut self, sqn: u32, nak_rdata_expiry: Timestamp, nak_rb_expiry: Timestamp) {
        if let Some(entry) = self.entries.get_mut(&sqn) {
            if matches!(entry.state, RxwState::BackOff | RxwState::WaitNcf) {
                entry.state = RxwState::WaitData;
                entry.nak_rdata_expiry = Some(nak_rdata_expiry);
                entry.nak_rb_expiry = Some(nak_rb_expiry);
                entry.queue_link = None;
            }
        }
    }

    pub fn mark_lost(&mut self, sqn: u32) {
        if let Some(entry) = self.entries.get_mut(&sqn) {
            entry.state = RxwState::Lost;
            entry.queue_link = None;
        }
    }

    /// Clear an entry's FIFO-link bookkeeping. Queue ownership itself
    /// lives in the NAK engine; this keeps the window's copy of that
    /// bookkeeping consistent when the engine unlinks an entry.
    pub fn pkt_state_unlink(&mut self, sqn: u32) {
        if let Some(entry) = self.entries.get_mut(&sqn) {
            entry.queue_link = None;
        }
    }

    pub fn set_queue_link(&mut self, sqn: u32, link: QueueKind) {
        if let Some(entry) = self.entries.get_mut(&sqn) {
            entry.queue_link = Some(link);
        }
    }

    pub fn peek(&self, sqn: u32) -> Option<&RxwEntry> {
        self.entries.get(&sqn)
    }

    pub fn peek_mut(&mut self, sqn: u32) -> Option<&mut RxwEntry> {
        self.entries.get_mut(&sqn)
    }

    /// Walk entries from the commit cursor forward, reassembling fragment
    /// chains and draining complete APDUs into `committed`.
    fn try_commit(&mut self) {
        loop {
            let sqn = self.commit;
            let entry = match self.entries.get(&sqn) {
                Some(e) if matches!(e.state, RxwState::HaveData) => e,
                _ => break,
            };

            let complete = match &entry.fragment {
                None => true,
                Some(frag) => self.advance_fragment(sqn, *frag),
            };

            if !complete {
                break;
            }

            if let Some(e) = self.entries.get_mut(&sqn) {
                e.state = RxwState::Committed;
            }
            self.committed.push_back(sqn);
            self.commit = self.commit.wrapping_add(1);
        }
    }

    fn advance_fragment(&mut self, sqn: u32, frag: OptFragment) -> bool {
        let payload = match self.entries.get(&sqn).and_then(|e| e.payload.clone()) {
            Some(p) => p,
            None => return false,
        };

        if sqn == frag.first_sqn {
            self.fragments.insert(
                frag.first_sqn,
                FragmentChain {
                    data: payload.to_vec(),
                    expected_next_sqn: sqn.wrapping_add(1),
                    total_length: frag.frag_len,
                },
            );
        } else if let Some(chain) = self.fragments.get_mut(&frag.first_sqn) {
            if chain.expected_next_sqn != sqn {
                return false;
            }
            chain.data.extend_from_slice(&payload);
            chain.expected_next_sqn = sqn.wrapping_add(1);
        } else {
            return false;
        }

        let done = self
            .fragments
            .get(&frag.first_sqn)
            .map(|c| c.data.len() as u32 >= c.total_length)
            .unwrap_or(false);
        if done {
            self.fragments.remove(&frag.first_sqn);
        }
        done
    }

    /// Drain up to `max_items` committed APDUs in order, returning the
    /// assembled payloads and the total bytes consumed.
    pub fn readv(&mut self, max_items: usize) -> (Vec<Bytes>, usize) {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        while out.len() < max_items {
            let sqn = match self.committed.pop_front() {
                Some(s) => s,
                None => break,
            };
            if let Some(entry) = self.entries.get(&sqn) {
                if let Some(payload) = &entry.payload {
                    bytes += payload.len();
                    out.push(payload.clone());
                }
            }
        }
        (out, bytes)
    }

    /// Evict entries already delivered to the caller by a prior `readv`.
    /// Only entries in state `Committed` that are no longer queued in
    /// `committed` are eligible — an entry still sitting in that queue
    /// hasn't been handed to the caller yet and must survive.
    pub fn free_committed(&mut self) {
        let pending: std::collections::HashSet<u32> = self.committed.iter().copied().collect();
        self.entries
            .retain(|sqn, e| !matches!(e.state, RxwState::Committed) || pending.contains(sqn));
    }

    /// Drop entries still queued for delivery without handing them to a
    /// caller, evicting their backing storage too. Used when a transport is
    /// torn down without flushing: data the application never drained is
    /// discarded outright rather than left to `readv` later.
    pub fn release_committed(&mut self) {
        for sqn in self.committed.drain(..) {
            self.entries.remove(&sqn);
        }
    }

    pub fn trail(&self) -> u32 {
        self.trail
    }

    /// Next sqn not yet committed in order, i.e. how far delivery has
    /// actually progressed. Distinct from [`ReceiveWindow::trail`], which
    /// tracks the sender-advertised window floor.
    pub fn commit_cursor(&self) -> u32 {
        self.commit
    }

    pub fn lead(&self) -> u32 {
        self.lead
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new()
    }
}
