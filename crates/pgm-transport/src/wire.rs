//! # PGM Wire Format
//!
//! On-wire encoding for the common 16-byte PGM header (RFC 3208 §8.1), the
//! per-type bodies (SPM, SPMR, ODATA/RDATA, NAK/NNAK/NCF), and the OPT_*
//! option chain (OPT_FRAGMENT, OPT_NAK_LIST, OPT_PARITY_PRM).
//!
//! All multi-byte integers are network byte order. The checksum is the
//! Internet 16-bit ones-complement sum over header + payload; a zero
//! checksum on an SPM marks it unvalidated per RFC 3208 §14.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PGM_HEADER_LEN: usize = 16;
pub const GSI_LEN: usize = 6;

/// Maximum sequence numbers in a single NAK/NAK-list: one primary plus
/// up to 62 from OPT_NAK_LIST. Hard-coded rather than derived from MTU —
/// a caller whose configured TPDU cannot carry 63 sqns gets a `Malformed`
/// at encode time instead of silent truncation.
pub const NAK_LIST_MAX: usize = 63;

// ─── Packet type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgmType {
    Spm,
    Poll,
    Polr,
    Odata,
    Rdata,
    Nak,
    Nnak,
    Ncf,
    Spmr,
}

impl PgmType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PgmType::Spm),
            0x01 => Some(PgmType::Poll),
            0x02 => Some(PgmType::Polr),
            0x04 => Some(PgmType::Odata),
            0x05 => Some(PgmType::Rdata),
            0x08 => Some(PgmType::Nak),
            0x09 => Some(PgmType::Nnak),
            0x0A => Some(PgmType::Ncf),
            0x40 => Some(PgmType::Spmr),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            PgmType::Spm => 0x00,
            PgmType::Poll => 0x01,
            PgmType::Polr => 0x02,
            PgmType::Odata => 0x04,
            PgmType::Rdata => 0x05,
            PgmType::Nak => 0x08,
            PgmType::Nnak => 0x09,
            PgmType::Ncf => 0x0A,
            PgmType::Spmr => 0x40,
        }
    }

    pub fn is_data(self) -> bool {
        matches!(self, PgmType::Odata | PgmType::Rdata)
    }
}

// ─── Header options bitmask ──────────────────────────────────────────────────

pub const OPT_PRESENT: u8 = 0x01;
pub const OPT_NETWORK: u8 = 0x02;
pub const OPT_VAR_PKTLEN: u8 = 0x40;
pub const OPT_PARITY: u8 = 0x80;

// ─── Network Layer Address ───────────────────────────────────────────────────

/// A tagged network-layer address, IPv4 or IPv6, carried in SPM/NAK bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nla {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl Nla {
    const AFI_IP: u16 = 1;
    const AFI_IP6: u16 = 2;

    pub fn afi(&self) -> u16 {
        match self {
            Nla::V4(_) => Self::AFI_IP,
            Nla::V6(_) => Self::AFI_IP6,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Nla::V4(_) => 4,
            Nla::V6(_) => 16,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.afi());
        match self {
            Nla::V4(b) => buf.put_slice(b),
            Nla::V6(b) => buf.put_slice(b),
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let afi = buf.get_u16();
        match afi {
            Self::AFI_IP => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                let mut b = [0u8; 4];
                buf.copy_to_slice(&mut b);
                Ok(Nla::V4(b))
            }
            Self::AFI_IP6 => {
                if buf.remaining() < 16 {
                    return Err(WireError::Truncated);
                }
                let mut b = [0u8; 16];
                buf.copy_to_slice(&mut b);
                Ok(Nla::V6(b))
            }
            _ => Err(WireError::UnknownAfi(afi)),
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Truncated,
    UnknownType(u8),
    UnknownAfi(u16),
    ChecksumMismatch,
    TooManyNaks,
    OptionChainMalformed,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Truncated => write!(f, "packet truncated"),
            WireError::UnknownType(b) => write!(f, "unknown pgm_type {b:#04x}"),
            WireError::UnknownAfi(a) => write!(f, "unknown address family {a}"),
            WireError::ChecksumMismatch => write!(f, "checksum mismatch"),
            WireError::TooManyNaks => write!(f, "nak list exceeds {NAK_LIST_MAX} entries"),
            WireError::OptionChainMalformed => write!(f, "option chain malformed"),
        }
    }
}

impl std::error::Error for WireError {}

// ─── Checksum ─────────────────────────────────────────────────────────────────

/// Internet ones-complement 16-bit checksum over an arbitrary byte slice.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ─── Common header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub pgm_type: PgmType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: [u8; GSI_LEN],
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u8(self.pgm_type.to_byte());
        buf.put_u8(self.options);
        buf.put_u16(self.checksum);
        buf.put_slice(&self.gsi);
        buf.put_u16(self.tsdu_length);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < PGM_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let type_byte = buf.get_u8();
        let pgm_type = PgmType::from_byte(type_byte).ok_or(WireError::UnknownType(type_byte))?;
        let options = buf.get_u8();
        let checksum = buf.get_u16();
        let mut gsi = [0u8; GSI_LEN];
        buf.copy_to_slice(&mut gsi);
        let tsdu_length = buf.get_u16();
        Ok(PgmHeader {
            src_port,
            dst_port,
            pgm_type,
            options,
            checksum,
            gsi,
            tsdu_length,
        })
    }

    pub fn has_options(&self) -> bool {
        self.options & OPT_PRESENT != 0
    }
}

// ─── OPT chain ────────────────────────────────────────────────────────────────

pub const OPT_LENGTH: u8 = 0x00;
pub const OPT_FRAGMENT: u8 = 0x01;
pub const OPT_NAK_LIST: u8 = 0x02;
pub const OPT_PARITY_PRM: u8 = 0x08;
pub const OPT_END: u8 = 0x80;

/// `OPT_FRAGMENT`: `{reserved, first_sqn, frag_off, frag_len}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    pub first_sqn: u32,
    pub frag_off: u32,
    pub frag_len: u32,
}

impl OptFragment {
    pub const BODY_LEN: usize = 16; // reserved(4) + 3*u32

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(0);
        buf.put_u32(self.first_sqn);
        buf.put_u32(self.frag_off);
        buf.put_u32(self.frag_len);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < Self::BODY_LEN {
            return Err(WireError::Truncated);
        }
        let _reserved = buf.get_u32();
        let first_sqn = buf.get_u32();
        let frag_off = buf.get_u32();
        let frag_len = buf.get_u32();
        Ok(OptFragment {
            first_sqn,
            frag_off,
            frag_len,
        })
    }
}

/// `OPT_NAK_LIST`: up to 62 additional sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptNakList {
    pub sqns: Vec<u32>,
}

impl OptNakList {
    pub fn encode(&self, buf: &mut BytesMut) {
        for sqn in &self.sqns {
            buf.put_u32(*sqn);
        }
    }

    pub fn decode(buf: &mut Bytes, count: usize) -> Result<Self, WireError> {
        if buf.remaining() < count * 4 {
            return Err(WireError::Truncated);
        }
        let mut sqns = Vec::with_capacity(count);
        for _ in 0..count {
            sqns.push(buf.get_u32());
        }
        Ok(OptNakList { sqns })
    }
}

/// `OPT_PARITY_PRM`: `{flags(PRO=0x01, OND=0x02), tgs = k}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptParityPrm {
    pub proactive: bool,
    pub ondemand: bool,
    pub transmission_group_size: u32,
}

impl OptParityPrm {
    pub const BODY_LEN: usize = 8; // flags padded to u32 + tgs u32

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u32;
        if self.proactive {
            flags |= 0x01;
        }
        if self.ondemand {
            flags |= 0x02;
        }
        buf.put_u32(flags);
        buf.put_u32(self.transmission_group_size);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < Self::BODY_LEN {
            return Err(WireError::Truncated);
        }
        let flags = buf.get_u32();
        let tgs = buf.get_u32();
        Ok(OptParityPrm {
            proactive: flags & 0x01 != 0,
            ondemand: flags & 0x02 != 0,
            transmission_group_size: tgs,
        })
    }
}

/// The decoded option chain carried by a packet (subset actually used by the
/// state machines; unrecognized option types are skipped via their length).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionChain {
    pub fragment: Option<OptFragment>,
    pub nak_list: Option<OptNakList>,
    pub parity_prm: Option<OptParityPrm>,
    pub is_parity: bool,
    pub is_var_pktlen: bool,
}

impl OptionChain {
    /// Encode as the OPT_LENGTH header followed by each present option,
    /// the last option's type byte carrying OPT_END.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();

        let mut entries: Vec<(u8, BytesMut)> = Vec::new();
        if let Some(f) = &self.fragment {
            let mut b = BytesMut::new();
            f.encode(&mut b);
            entries.push((OPT_FRAGMENT, b));
        }
        if let Some(nl) = &self.nak_list {
            let mut b = BytesMut::new();
            nl.encode(&mut b);
            entries.push((OPT_NAK_LIST, b));
        }
        if let Some(pp) = &self.parity_prm {
            let mut b = BytesMut::new();
            pp.encode(&mut b);
            entries.push((OPT_PARITY_PRM, b));
        }

        let n = entries.len();
        for (i, (opt_type, opt_body)) in entries.into_iter().enumerate() {
            let mut type_byte = opt_type;
            if i + 1 == n {
                type_byte |= OPT_END;
            }
            body.put_u8(type_byte);
            body.put_u8((opt_body.len() + 2) as u8);
            body.extend_from_slice(&opt_body);
        }

        let total_length = 4 + body.len(); // OPT_LENGTH header itself
        buf.put_u8(OPT_LENGTH);
        buf.put_u8(4);
        buf.put_u16(total_length as u16);
        buf.extend_from_slice(&body);
    }

    /// Parse an option chain starting at the OPT_LENGTH header.
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let opt_type = buf.get_u8();
        let opt_len = buf.get_u8();
        let total_length = buf.get_u16();
        if opt_type & !OPT_END != OPT_LENGTH || opt_len != 4 {
            return Err(WireError::OptionChainMalformed);
        }
        let mut remaining = total_length.saturating_sub(4) as usize;
        if buf.remaining() < remaining {
            return Err(WireError::Truncated);
        }

        let mut chain = OptionChain::default();
        loop {
            if remaining == 0 {
                break;
            }
            if buf.remaining() < 2 {
                return Err(WireError::OptionChainMalformed);
            }
            let type_byte = buf.get_u8();
            let len = buf.get_u8();
            if (len as usize) < 2 {
                return Err(WireError::OptionChainMalformed);
            }
            let body_len = len as usize - 2;
            if buf.remaining() < body_len || remaining < len as usize {
                return Err(WireError::Truncated);
            }
            let mut body = buf.copy_to_bytes(body_len);
            remaining -= len as usize;

            match type_byte & !OPT_END {
                OPT_FRAGMENT => chain.fragment = Some(OptFragment::decode(&mut body)?),
                OPT_NAK_LIST => {
                    let count = body_len / 4;
                    chain.nak_list = Some(OptNakList::decode(&mut body, count)?);
                }
                OPT_PARITY_PRM => chain.parity_prm = Some(OptParityPrm::decode(&mut body)?),
                _ => { /* unrecognized option: length already consumed, skip */ }
            }

            if type_byte & OPT_END != 0 {
                break;
            }
        }
        Ok(chain)
    }

    pub fn is_empty(&self) -> bool {
        self.fragment.is_none() && self.nak_list.is_none() && self.parity_prm.is_none()
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 4;
        if self.fragment.is_some() {
            len += 2 + OptFragment::BODY_LEN;
        }
        if let Some(nl) = &self.nak_list {
            len += 2 + nl.sqns.len() * 4;
        }
        if self.parity_prm.is_some() {
            len += 2 + OptParityPrm::BODY_LEN;
        }
        len
    }
}

// ─── SPM body ─────────────────────────────────────────────────────────────────

/// Source Path Message: `{sqn, trail, lead, nla}` plus optional OPT_PARITY_PRM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpmBody {
    pub spm_sqn: u32,
    pub trail: u32,
    pub lead: u32,
    pub nla: Nla,
    pub parity_prm: Option<OptParityPrm>,
}

impl SpmBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.spm_sqn);
        buf.put_u32(self.trail);
        buf.put_u32(self.lead);
        self.nla.encode(buf);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < 12 {
            return Err(WireError::Truncated);
        }
        let spm_sqn = buf.get_u32();
        let trail = buf.get_u32();
        let lead = buf.get_u32();
        let nla = Nla::decode(buf)?;
        Ok(SpmBody {
            spm_sqn,
            trail,
            lead,
            nla,
            parity_prm: None,
        })
    }
}

// ─── ODATA / RDATA body ───────────────────────────────────────────────────────

/// Header shared by ODATA and RDATA: `{data_sqn, data_trail}` followed by payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    pub data_sqn: u32,
    pub data_trail: u32,
}

impl DataBody {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.data_sqn);
        buf.put_u32(self.data_trail);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < Self::LEN {
            return Err(WireError::Truncated);
        }
        Ok(DataBody {
            data_sqn: buf.get_u32(),
            data_trail: buf.get_u32(),
        })
    }
}

// ─── NAK / NNAK / NCF body ────────────────────────────────────────────────────

/// `{sqn, src_nla, reserved, grp_nla}` shared by NAK, NNAK, and NCF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakBody {
    pub sqn: u32,
    pub src_nla: Nla,
    pub grp_nla: Nla,
    pub nak_list: Option<OptNakList>,
    pub is_parity: bool,
}

impl NakBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sqn);
        self.src_nla.encode(buf);
        buf.put_u16(0); // reserved
        self.grp_nla.encode(buf);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let sqn = buf.get_u32();
        let src_nla = Nla::decode(buf)?;
        if buf.remaining() < 2 {
            return Err(WireError::Truncated);
        }
        let _reserved = buf.get_u16();
        let grp_nla = Nla::decode(buf)?;
        Ok(NakBody {
            sqn,
            src_nla,
            grp_nla,
            nak_list: None,
            is_parity: false,
        })
    }
}

/// A fully parsed PGM packet: header + type-specific body + trailing payload
/// (only present for ODATA/RDATA).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgmBody {
    Spm(SpmBody),
    Spmr,
    Data(DataBody, OptionChain, Bytes),
    Nak(NakBody),
    Nnak(NakBody),
    Ncf(NakBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgmPacket {
    pub header: PgmHeader,
    pub body: PgmBody,
}

impl PgmPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + 64);
        self.header.encode(&mut buf);

        match &self.body {
            PgmBody::Spm(spm) => {
                spm.encode(&mut buf);
                if let Some(pp) = &spm.parity_prm {
                    let chain = OptionChain {
                        parity_prm: Some(*pp),
                        ..Default::default()
                    };
                    chain.encode(&mut buf);
                }
            }
            PgmBody::Spmr => {}
            PgmBody::Data(db, opts, payload) => {
                db.encode(&mut buf);
                if !opts.is_empty() {
                    opts.encode(&mut buf);
                }
                buf.extend_from_slice(payload);
            }
            PgmBody::Nak(nb) | PgmBody::Nnak(nb) | PgmBody::Ncf(nb) => {
                nb.encode(&mut buf);
                if let Some(nl) = &nb.nak_list {
                    let chain = OptionChain {
                        nak_list: Some(nl.clone()),
                        ..Default::default()
                    };
                    chain.encode(&mut buf);
                }
            }
        }

        let sum = checksum(&buf);
        buf[6] = (sum >> 8) as u8;
        buf[7] = (sum & 0xFF) as u8;
        buf.freeze()
    }

    pub fn decode(raw: Bytes) -> Result<Self, WireError> {
        let full = raw.clone();
        let mut rest = raw;
        let header = PgmHeader::decode(&mut rest)?;
        if header.checksum != 0 {
            let computed = checksum_excluding_field(&full);
            if computed != header.checksum {
                return Err(WireError::ChecksumMismatch);
            }
        }

        let body = match header.pgm_type {
            PgmType::Spm => {
                let mut spm = SpmBody::decode(&mut rest)?;
                if header.has_options() && rest.remaining() >= 4 {
                    let chain = OptionChain::decode(&mut rest)?;
                    spm.parity_prm = chain.parity_prm;
                }
                PgmBody::Spm(spm)
            }
            PgmType::Spmr | PgmType::Poll | PgmType::Polr => PgmBody::Spmr,
            PgmType::Odata | PgmType::Rdata => {
                let db = DataBody::decode(&mut rest)?;
                let opts = if header.has_options() {
                    OptionChain::decode(&mut rest)?
                } else {
                    OptionChain::default()
                };
                PgmBody::Data(db, opts, rest)
            }
            PgmType::Nak | PgmType::Nnak | PgmType::Ncf => {
                let mut nb = NakBody::decode(&mut rest)?;
                if header.has_options() && rest.remaining() >= 4 {
                    let chain = OptionChain::decode(&mut rest)?;
                    if let Some(nl) = &chain.nak_list {
                        if 1 + nl.sqns.len() > NAK_LIST_MAX {
                            return Err(WireError::TooManyNaks);
                        }
                    }
                    nb.nak_list = chain.nak_list;
                    nb.is_parity = header.options & OPT_PARITY != 0;
                }
                match header.pgm_type {
                    PgmType::Nak => PgmBody::Nak(nb),
                    PgmType::Nnak => PgmBody::Nnak(nb),
                    _ => PgmBody::Ncf(nb),
                }
            }
        };

        Ok(PgmPacket { header, body })
    }
}

/// Checksum of a full packet with the checksum field itself zeroed.
fn checksum_excluding_field(data: &[u8]) -> u16 {
    let mut owned = data.to_vec();
    owned[6] = 0;
    owned[7] = 0;
    checksum(&owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header(pgm_type: PgmType, tsdu: u16, options: u8) -> PgmHeader {
        PgmHeader {
            src_port: 1000,
            dst_port: 2000,
            pgm_type,
            options,
            checksum: 0,
            gsi: [1, 2, 3, 4, 5, 6],
            tsdu_length: tsdu,
        }
    }

    #[test]
    fn header_roundtrip() {
        let h = sample_header(PgmType::Odata, 42, 0);
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        let mut b = buf.freeze();
        let decoded = PgmHeader::decode(&mut b).unwrap();
        assert_eq!(h, decoded);
    }

    #[test]
    fn odata_packet_roundtrip_no_options() {
        let pkt = PgmPacket {
            header: sample_header(PgmType::Odata, 2, 0),
            body: PgmBody::Data(
                DataBody {
                    data_sqn: 5,
                    data_trail: 0,
                },
                OptionChain::default(),
                Bytes::from_static(b"hi"),
            ),
        };
        let wire = pkt.encode();
        let decoded = PgmPacket::decode(wire).unwrap();
        match decoded.body {
            PgmBody::Data(db, _, payload) => {
                assert_eq!(db.data_sqn, 5);
                assert_eq!(&payload[..], b"hi");
            }
            _ => panic!("expected data body"),
        }
    }

    #[test]
    fn odata_with_fragment_option_roundtrip() {
        let opts = OptionChain {
            fragment: Some(OptFragment {
                first_sqn: 10,
                frag_off: 0,
                frag_len: 300,
            }),
            ..Default::default()
        };
        let pkt = PgmPacket {
            header: sample_header(PgmType::Odata, 100, OPT_PRESENT),
            body: PgmBody::Data(
                DataBody {
                    data_sqn: 10,
                    data_trail: 0,
                },
                opts,
                Bytes::from_static(&[0xAB; 100]),
            ),
        };
        let wire = pkt.encode();
        let decoded = PgmPacket::decode(wire).unwrap();
        match decoded.body {
            PgmBody::Data(_, opts, payload) => {
                let f = opts.fragment.unwrap();
                assert_eq!(f.first_sqn, 10);
                assert_eq!(f.frag_len, 300);
                assert_eq!(payload.len(), 100);
            }
            _ => panic!("expected data body"),
        }
    }

    #[test]
    fn spm_roundtrip() {
        let spm = SpmBody {
            spm_sqn: 7,
            trail: 0,
            lead: 100,
            nla: Nla::V4([192, 168, 1, 1]),
            parity_prm: None,
        };
        let pkt = PgmPacket {
            header: sample_header(PgmType::Spm, 0, 0),
            body: PgmBody::Spm(spm.clone()),
        };
        let wire = pkt.encode();
        let decoded = PgmPacket::decode(wire).unwrap();
        match decoded.body {
            PgmBody::Spm(s) => assert_eq!(s.spm_sqn, 7),
            _ => panic!("expected spm"),
        }
    }

    #[test]
    fn spm_with_parity_prm_roundtrip() {
        let spm = SpmBody {
            spm_sqn: 1,
            trail: 0,
            lead: 10,
            nla: Nla::V4([10, 0, 0, 1]),
            parity_prm: Some(OptParityPrm {
                proactive: true,
                ondemand: false,
                transmission_group_size: 32,
            }),
        };
        let header = sample_header(PgmType::Spm, 0, OPT_PRESENT);
        let pkt = PgmPacket {
            header,
            body: PgmBody::Spm(spm),
        };
        let wire = pkt.encode();
        let decoded = PgmPacket::decode(wire).unwrap();
        match decoded.body {
            PgmBody::Spm(s) => {
                let pp = s.parity_prm.unwrap();
                assert!(pp.proactive);
                assert_eq!(pp.transmission_group_size, 32);
            }
            _ => panic!("expected spm"),
        }
    }

    #[test]
    fn nak_with_list_roundtrip() {
        let nb = NakBody {
            sqn: 5,
            src_nla: Nla::V4([1, 1, 1, 1]),
            grp_nla: Nla::V4([239, 0, 0, 1]),
            nak_list: Some(OptNakList {
                sqns: vec![7, 9, 11],
            }),
            is_parity: false,
        };
        let pkt = PgmPacket {
            header: sample_header(PgmType::Nak, 0, OPT_PRESENT),
            body: PgmBody::Nak(nb),
        };
        let wire = pkt.encode();
        let decoded = PgmPacket::decode(wire).unwrap();
        match decoded.body {
            PgmBody::Nak(nb) => {
                assert_eq!(nb.sqn, 5);
                assert_eq!(nb.nak_list.unwrap().sqns, vec![7, 9, 11]);
            }
            _ => panic!("expected nak"),
        }
    }

    #[test]
    fn nak_list_over_max_rejected() {
        let sqns: Vec<u32> = (0..70).collect();
        let nb = NakBody {
            sqn: 1,
            src_nla: Nla::V4([0, 0, 0, 0]),
            grp_nla: Nla::V4([0, 0, 0, 0]),
            nak_list: Some(OptNakList { sqns }),
            is_parity: false,
        };
        let pkt = PgmPacket {
            header: sample_header(PgmType::Nak, 0, OPT_PRESENT),
            body: PgmBody::Nak(nb),
        };
        let wire = pkt.encode();
        let result = PgmPacket::decode(wire);
        assert!(matches!(result, Err(WireError::TooManyNaks)));
    }

    #[test]
    fn checksum_zero_on_spm_not_validated() {
        let pkt = PgmPacket {
            header: sample_header(PgmType::Spm, 0, 0),
            body: PgmBody::Spm(SpmBody {
                spm_sqn: 0,
                trail: 0,
                lead: 0,
                nla: Nla::V4([0, 0, 0, 0]),
                parity_prm: None,
            }),
        };
        let mut wire = BytesMut::from(&pkt.encode()[..]);
        wire[6] = 0;
        wire[7] = 0;
        let decoded = PgmPacket::decode(wire.freeze());
        assert!(decoded.is_ok());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let pkt = PgmPacket {
            header: sample_header(PgmType::Odata, 2, 0),
            body: PgmBody::Data(
                DataBody {
                    data_sqn: 0,
                    data_trail: 0,
                },
                OptionChain::default(),
                Bytes::from_static(b"hi"),
            ),
        };
        let mut wire = BytesMut::from(&pkt.encode()[..]);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let result = PgmPacket::decode(wire.freeze());
        assert!(matches!(result, Err(WireError::ChecksumMismatch)));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        let h = sample_header(PgmType::Odata, 0, 0);
        h.encode(&mut buf);
        buf[4] = 0xFF; // offset 4 is the type byte
        let result = PgmHeader::decode(&mut buf.freeze());
        assert!(matches!(result, Err(WireError::UnknownType(_))));
    }

    proptest! {
        #[test]
        fn proptest_odata_roundtrip(
            sqn in any::<u32>(),
            trail in any::<u32>(),
            payload in prop::collection::vec(any::<u8>(), 0..500),
        ) {
            let pkt = PgmPacket {
                header: sample_header(PgmType::Odata, payload.len() as u16, 0),
                body: PgmBody::Data(
                    DataBody { data_sqn: sqn, data_trail: trail },
                    OptionChain::default(),
                    Bytes::from(payload.clone()),
                ),
            };
            let wire = pkt.encode();
            let decoded = PgmPacket::decode(wire).unwrap();
            match decoded.body {
                PgmBody::Data(db, _, p) => {
                    prop_assert_eq!(db.data_sqn, sqn);
                    prop_assert_eq!(db.data_trail, trail);
                    prop_assert_eq!(&p[..], &payload[..]);
                }
                _ => prop_assert!(false, "expected data body"),
            }
        }
    }
}
