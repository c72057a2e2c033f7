//! # Transport Statistics
//!
//! Per-transport counters named throughout the spec (§6, §8 invariants,
//! §7 error handling). Designed for JSON export.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub odata_sent: u64,
    pub rdata_sent: u64,
    pub parity_rdata_sent: u64,
    pub spm_sent: u64,
    pub naks_received: u64,
    pub ncfs_sent: u64,
    pub bytes_sent: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// `RECEIVER_DATA_MSGS_RECEIVED` — unique in-order messages delivered.
    pub receiver_data_msgs_received: u64,
    pub odata_received: u64,
    pub rdata_received: u64,
    pub fec_recoveries: u64,
    pub naks_sent: u64,
    /// `NAKS_FAILED_NCF_RETRIES_EXCEEDED`.
    pub naks_failed_ncf_retries_exceeded: u64,
    /// `NAKS_FAILED_DATA_RETRIES_EXCEEDED`.
    pub naks_failed_data_retries_exceeded: u64,
    /// Packets that transitioned to LOST (either retry class).
    pub cumulative_losses: u64,
    /// `DUP_SPMS` — SPM received with sqn not greater than the last seen.
    pub dup_spms: u64,
    /// Packets discarded at dispatch due to type/direction/port mismatch.
    pub source_packets_discarded: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }
}
