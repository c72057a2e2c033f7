//! # pgm-transport
//!
//! A pure-Rust implementation of PGM (Pragmatic General Multicast,
//! RFC 3208): reliable, source-ordered multicast delivery over UDP with a
//! NAK-based repair protocol and optional Reed-Solomon forward erasure
//! correction.
//!
//! ## Crate structure
//!
//! - [`wire`] — Packet header/body encode-decode, TSI, NLA, option chains
//! - [`clock`] — Monotonic timestamp used throughout the NAK/SPM timers
//! - [`config`] — `TransportConfig`, all tunables named in the data model
//! - [`codec`] — Reed-Solomon FEC encode/decode
//! - [`txw`] / [`rxw`] — Transmit and receive windows
//! - [`nak`] — The three-queue NAK back-off/repeat/RDATA state machine
//! - [`peer`] — TSI-keyed peer table
//! - [`sender`] / [`receiver`] — Per-role packet handlers driving the
//!   windows and NAK engine
//! - [`io`] — The `DatagramSender` seam plus token-bucket rate limiting
//! - [`dispatch`] — Classifies an inbound packet into its handler
//! - [`scheduler`] — The background timer/retransmit thread
//! - [`transport`] — The public `Transport` handle
//! - [`stats`] — Per-transport counters
//! - [`error`] — Error kinds surfaced to callers

pub mod clock;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod nak;
pub mod peer;
pub mod receiver;
pub mod rxw;
pub mod scheduler;
pub mod sender;
pub mod stats;
pub mod transport;
pub mod txw;
pub mod wire;

pub use error::PgmError;
pub use transport::Transport;
