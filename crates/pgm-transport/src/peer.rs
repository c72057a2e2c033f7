//! # Peer Table
//!
//! TSI-keyed map of remote sources this transport has heard from, plus
//! the insertion-order list the scheduler walks each sweep. Adapted from
//! the donor's `session::Session` bookkeeping style (a `HashMap` keyed by
//! a small identifier, a handful of `Instant` timestamps, touch-on-
//! activity) generalized from one client/server handshake to many
//! concurrently tracked senders.
//!
//! Resolves the cyclic peer↔transport ownership design note: peers are
//! owned by value here with no back-reference; the scheduler is handed
//! `&mut Transport` for each sweep instead of peers holding a pointer
//! back to it.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::clock::Timestamp;
use crate::nak::NakFifos;
use crate::rxw::ReceiveWindow;
use crate::wire::Nla;

/// Transport Session Identifier: 6-byte GSI + 2-byte source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsi {
    pub gsi: [u8; 6],
    pub source_port: u16,
}

impl Tsi {
    pub fn new(gsi: [u8; 6], source_port: u16) -> Self {
        Tsi { gsi, source_port }
    }
}

/// FEC parameters a peer advertised via `OPT_PARITY_PRM` on its SPM.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFecParams {
    pub proactive: bool,
    pub ondemand: bool,
    pub transmission_group_size: u32,
}

/// A remote source this transport is receiving from.
pub struct Peer {
    pub tsi: Tsi,
    pub nla: Nla,
    pub grp_nla: Nla,
    pub rxw: ReceiveWindow,
    pub nak: NakFifos,
    pub refcount: u32,
    pub expiry: Timestamp,
    pub spmr_expiry: Option<Timestamp>,
    pub last_packet_time: Timestamp,
    pub last_spm_sqn: Option<u32>,
    pub fec_params: PeerFecParams,
    pub spmr_sent: bool,
}

impl Peer {
    pub fn new(tsi: Tsi, nla: Nla, grp_nla: Nla, now: Timestamp, expiry: Timestamp) -> Self {
        Peer {
            tsi,
            nla,
            grp_nla,
            rxw: ReceiveWindow::new(),
            nak: NakFifos::new(),
            refcount: 0,
            expiry,
            spmr_expiry: None,
            last_packet_time: now,
            last_spm_sqn: None,
            fec_params: PeerFecParams::default(),
            spmr_sent: false,
        }
    }

    /// Accept an SPM sqn if it is greater-equal the last seen, compared
    /// modulo 2^32 (serial-number arithmetic, RFC 1982).
    pub fn accept_spm_sqn(&mut self, sqn: u32) -> bool {
        let accept = match self.last_spm_sqn {
            None => true,
            Some(last) => sqn.wrapping_sub(last) < u32::MAX / 2,
        };
        if accept {
            self.last_spm_sqn = Some(sqn);
        }
        accept
    }

    pub fn touch(&mut self, now: Timestamp, peer_expiry_ivl: std::time::Duration) {
        self.last_packet_time = now;
        self.expiry = now.checked_add(peer_expiry_ivl);
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry && self.refcount == 0
    }
}

/// TSI-keyed peer table with an explicit insertion-order walk list, used
/// in place of an intrusive pointer list (Design Note, §9): the scheduler
/// iterates `order` and looks each entry up in `peers` rather than
/// following per-peer links.
pub struct PeerTable {
    peers: RwLock<HashMap<Tsi, Peer>>,
    order: RwLock<Vec<Tsi>>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            peers: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Insert a newly discovered peer. No-op if the TSI is already known.
    pub fn insert_new(&self, peer: Peer) {
        let tsi = peer.tsi;
        let mut peers = self.peers.write().unwrap();
        if peers.contains_key(&tsi) {
            return;
        }
        peers.insert(tsi, peer);
        self.order.write().unwrap().push(tsi);
    }

    pub fn contains(&self, tsi: &Tsi) -> bool {
        self.peers.read().unwrap().contains_key(tsi)
    }

    pub fn with_peer<R>(&self, tsi: &Tsi, f: impl FnOnce(&Peer) -> R) -> Option<R> {
        self.peers.read().unwrap().get(tsi).map(f)
    }

    pub fn with_peer_mut<R>(&self, tsi: &Tsi, f: impl FnOnce(&mut Peer) -> R) -> Option<R> {
        self.peers.write().unwrap().get_mut(tsi).map(f)
    }

    /// Snapshot of the insertion-order walk list, for the scheduler sweep.
    pub fn order_snapshot(&self) -> Vec<Tsi> {
        self.order.read().unwrap().clone()
    }

    /// Remove peers past `peer_expiry` with a zero receive-path refcount.
    /// Returns the removed TSIs.
    pub fn remove_expired(&self, now: Timestamp) -> Vec<Tsi> {
        let mut removed = Vec::new();
        let mut peers = self.peers.write().unwrap();
        peers.retain(|tsi, peer| {
            if peer.is_expired(now) {
                removed.push(*tsi);
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            let mut order = self.order.write().unwrap();
            order.retain(|tsi| !removed.contains(tsi));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().unwrap().is_empty()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
