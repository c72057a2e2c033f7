//! # Transport Configuration
//!
//! All tunables named in the data model, with the defaults carried over
//! from `transport.c`. Loadable from TOML for the demo binaries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum TPDU size in bytes (including PGM header).
    pub max_tpdu: u16,
    /// IP TTL / hop limit for multicast sends.
    pub hops: u8,
    /// Ambient SPM interval.
    #[serde(with = "duration_ms")]
    pub ambient_spm_interval: Duration,
    /// Heartbeat SPM schedule in milliseconds: `[0, h1, .., hn, 0]`. The
    /// leading and trailing zero are boundary sentinels, not emission
    /// points — see [`crate::sender::HeartbeatSchedule`].
    pub heartbeat_spm_schedule_ms: Vec<u64>,
    /// Peer inactivity expiry.
    #[serde(with = "duration_ms")]
    pub peer_expiry: Duration,
    /// SPMR expiry (gap outlives this before a fresh SPMR is sent).
    #[serde(with = "duration_ms")]
    pub spmr_expiry: Duration,
    /// NAK back-off interval upper bound; per-packet jitter is
    /// `Uniform(1, nak_bo_ivl)`.
    #[serde(with = "duration_ms")]
    pub nak_bo_ivl: Duration,
    /// NAK repeat (NCF wait) interval.
    #[serde(with = "duration_ms")]
    pub nak_rpt_ivl: Duration,
    /// NAK RDATA wait interval.
    #[serde(with = "duration_ms")]
    pub nak_rdata_ivl: Duration,
    /// Retries waiting for RDATA before LOST.
    pub nak_data_retries: u8,
    /// Retries waiting for NCF before LOST.
    pub nak_ncf_retries: u8,
    /// Transmit window size in sqns.
    pub txw_sqns: u32,
    /// Receive window size in sqns.
    pub rxw_sqns: u32,
    /// Token-bucket send rate in bytes/sec (0 = unlimited).
    pub rate_bytes_per_sec: u64,
    /// FEC: use on-demand (NAK-triggered) parity repair.
    pub use_ondemand_parity: bool,
    /// FEC: use proactive (always-on) parity repair.
    pub use_proactive_parity: bool,
    /// FEC: allow variable packet length groups (OPT_VAR_PKTLEN).
    pub use_varpkt_len: bool,
    /// FEC transmission-group size `k` (must be a power of two).
    pub fec_k: u8,
    /// FEC repair symbols per group `h`; `n = k + h`.
    pub fec_h: u8,
    /// Passive receiver: never emits NAK/SPMR.
    pub is_passive: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_tpdu: 1500,
            hops: 16,
            ambient_spm_interval: millis(30_000),
            heartbeat_spm_schedule_ms: vec![0, 100, 200, 400, 800, 1600, 3200, 0],
            peer_expiry: millis(300_000),
            spmr_expiry: millis(250),
            nak_bo_ivl: millis(50),
            nak_rpt_ivl: millis(200),
            nak_rdata_ivl: millis(200),
            nak_data_retries: 5,
            nak_ncf_retries: 2,
            txw_sqns: 4096,
            rxw_sqns: 4096,
            rate_bytes_per_sec: 0,
            use_ondemand_parity: false,
            use_proactive_parity: false,
            use_varpkt_len: false,
            fec_k: 32,
            fec_h: 4,
            is_passive: false,
        }
    }
}

impl TransportConfig {
    /// `tg_sqn_shift = log2(k)`. Panics if `fec_k` is not a power of two —
    /// same contract as the sender/receiver FEC grouping, which both rely
    /// on `tg_sqn = sqn & !((1 << shift) - 1)`.
    pub fn tg_sqn_shift(&self) -> u32 {
        assert!(self.fec_k.is_power_of_two(), "fec_k must be a power of two");
        self.fec_k.trailing_zeros()
    }

    pub fn load_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
