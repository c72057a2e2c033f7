//! # Dispatch
//!
//! Classifies an inbound packet by `pgm_type` plus direction (downstream,
//! upstream unicast/multicast, peer-to-peer) into the handler spec.md
//! §4.H names, before any state-machine work runs. Generalized from the
//! donor's `receiver::Receiver::receive` top-level `match` on its own
//! two-way `PacketType` (data vs. control) into PGM's seven-way
//! type-plus-direction table.

use crate::wire::PgmType;

/// This transport's own addressing, needed to tell whether an inbound
/// packet is actually meant for it.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity {
    /// Port ODATA/RDATA/SPM/NCF are addressed to (`our.dport`).
    pub dport: u16,
    /// Our TSI's source port — NAK/NNAK addressed back to us as sender
    /// use this as their destination (`our.tsi.sport`).
    pub tsi_source_port: u16,
}

/// The handler spec.md §4.H names for a classified packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    OnSpm,
    OnOdata,
    OnRdata,
    OnNcf,
    OnNak,
    OnPeerNak,
    OnNnak,
    OnSpmr,
}

/// Classify one packet. `dst_is_multicast` is the destination address
/// class of the datagram it arrived on (not a header field); `known_peer`
/// is whether `src_nla`'s TSI is already present in the peer table.
/// Returns `None` on any type/direction mismatch — the caller increments
/// `SOURCE_PACKETS_DISCARDED` and drops the packet silently.
pub fn classify(
    pgm_type: PgmType,
    dst_port: u16,
    dst_is_multicast: bool,
    known_peer: bool,
    local: &LocalIdentity,
) -> Option<Handler> {
    match pgm_type {
        PgmType::Spm => (dst_port == local.dport).then_some(Handler::OnSpm),
        PgmType::Odata => (dst_port == local.dport).then_some(Handler::OnOdata),
        PgmType::Rdata => (dst_port == local.dport).then_some(Handler::OnRdata),
        PgmType::Ncf => (dst_port == local.dport).then_some(Handler::OnNcf),
        PgmType::Nak => {
            if !dst_is_multicast && dst_port == local.tsi_source_port {
                Some(Handler::OnNak)
            } else if dst_is_multicast && known_peer {
                Some(Handler::OnPeerNak)
            } else {
                None
            }
        }
        PgmType::Nnak => (dst_port == local.tsi_source_port).then_some(Handler::OnNnak),
        PgmType::Spmr => {
            if !dst_is_multicast {
                Some(Handler::OnSpmr) // unicast: we are the source, reply with SPM
            } else if known_peer {
                Some(Handler::OnSpmr) // multicast: suppress our own pending SPMR
            } else {
                None
            }
        }
        PgmType::Poll | PgmType::Polr => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalIdentity {
        LocalIdentity {
            dport: 7000,
            tsi_source_port: 1000,
        }
    }

    #[test]
    fn spm_matches_our_dport() {
        assert_eq!(classify(PgmType::Spm, 7000, true, false, &local()), Some(Handler::OnSpm));
        assert_eq!(classify(PgmType::Spm, 9999, true, false, &local()), None);
    }

    #[test]
    fn odata_rdata_ncf_require_dport_match() {
        assert_eq!(classify(PgmType::Odata, 7000, true, false, &local()), Some(Handler::OnOdata));
        assert_eq!(classify(PgmType::Rdata, 7000, true, false, &local()), Some(Handler::OnRdata));
        assert_eq!(classify(PgmType::Ncf, 7000, true, false, &local()), Some(Handler::OnNcf));
        assert_eq!(classify(PgmType::Odata, 1, true, false, &local()), None);
    }

    #[test]
    fn unicast_nak_targets_our_source_port() {
        assert_eq!(classify(PgmType::Nak, 1000, false, false, &local()), Some(Handler::OnNak));
        assert_eq!(classify(PgmType::Nak, 9999, false, false, &local()), None);
    }

    #[test]
    fn multicast_nak_requires_known_peer() {
        assert_eq!(classify(PgmType::Nak, 7000, true, true, &local()), Some(Handler::OnPeerNak));
        assert_eq!(classify(PgmType::Nak, 7000, true, false, &local()), None);
    }

    #[test]
    fn nnak_targets_our_source_port() {
        assert_eq!(classify(PgmType::Nnak, 1000, false, false, &local()), Some(Handler::OnNnak));
        assert_eq!(classify(PgmType::Nnak, 7000, false, false, &local()), None);
    }

    #[test]
    fn spmr_unicast_or_known_multicast_peer() {
        assert_eq!(classify(PgmType::Spmr, 1000, false, false, &local()), Some(Handler::OnSpmr));
        assert_eq!(classify(PgmType::Spmr, 7000, true, true, &local()), Some(Handler::OnSpmr));
        assert_eq!(classify(PgmType::Spmr, 7000, true, false, &local()), None);
    }

    #[test]
    fn poll_polr_always_discarded() {
        assert_eq!(classify(PgmType::Poll, 7000, true, false, &local()), None);
        assert_eq!(classify(PgmType::Polr, 7000, true, false, &local()), None);
    }
}
