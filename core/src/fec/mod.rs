//! Block forward error correction.
//!
//! Source packets travel as ordinary RTP with an 8-byte payload ID trailer;
//! repair packets are standalone: an 8-byte payload ID header followed by the
//! repair shard. A codeword protects the entire serialized source packet, so
//! a repaired packet is byte-identical to the lost original.

pub mod decoder;
pub mod encoder;

/// Dynamic payload type used by Reed-Solomon repair packets.
pub const PAYLOAD_TYPE_REPAIR_RS8M: u8 = 123;

/// Dynamic payload type used by LDPC-Staircase repair packets.
pub const PAYLOAD_TYPE_REPAIR_LDPC: u8 = 124;

/// Repair payload type for a scheme.
pub fn repair_payload_type(scheme: FecScheme) -> u8 {
    match scheme {
        FecScheme::Rs8m => PAYLOAD_TYPE_REPAIR_RS8M,
        FecScheme::LdpcStaircase => PAYLOAD_TYPE_REPAIR_LDPC,
    }
}

#[cfg(feature = "fec-ldpc")]
mod ldpc;
#[cfg(feature = "fec-rs8m")]
mod rs8m;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::packet::Packet;

pub use decoder::BlockDecoder;
pub use encoder::BlockEncoder;

/// Block FEC scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FecScheme {
    /// Reed-Solomon over GF(2^8).
    Rs8m,
    /// LDPC-Staircase over GF(2).
    LdpcStaircase,
}

impl FecScheme {
    /// Runtime feature detection: whether this build carries the scheme's
    /// codec.
    pub fn is_supported(self) -> bool {
        match self {
            FecScheme::Rs8m => cfg!(feature = "fec-rs8m"),
            FecScheme::LdpcStaircase => cfg!(feature = "fec-ldpc"),
        }
    }
}

/// Serialized size of the FEC payload ID.
pub const PAYLOAD_ID_LEN: usize = 8;

/// Block and position tags carried by every FEC-protected packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadId {
    /// Block this packet belongs to.
    pub block_id: u16,
    /// Index within the block; repair packets count from
    /// `source_block_len`.
    pub index: u16,
    /// Source packets per block.
    pub source_block_len: u16,
    /// Repair packets per block.
    pub repair_block_len: u16,
}

impl PayloadId {
    /// Serializes into 8 bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_id.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.source_block_len.to_be_bytes());
        out.extend_from_slice(&self.repair_block_len.to_be_bytes());
    }

    /// Parses from 8 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAYLOAD_ID_LEN {
            return Err(Error::BadPacket);
        }
        let id = PayloadId {
            block_id: BigEndian::read_u16(&buf[0..2]),
            index: BigEndian::read_u16(&buf[2..4]),
            source_block_len: BigEndian::read_u16(&buf[4..6]),
            repair_block_len: BigEndian::read_u16(&buf[6..8]),
        };
        if id.source_block_len == 0 {
            return Err(Error::BadPacket);
        }
        Ok(id)
    }
}

/// `a < b` on the 16-bit block-number circle.
pub fn block_lt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Splits the payload-ID trailer off a parsed source packet, filling the
/// packet's FEC view and shrinking the RTP payload range.
pub fn parse_source_trailer(packet: &mut Packet) -> Result<()> {
    let rtp = packet.rtp.as_mut().ok_or(Error::BadOperation)?;
    if rtp.payload.len() < PAYLOAD_ID_LEN {
        return Err(Error::BadPacket);
    }
    let trailer_start = rtp.payload.end - PAYLOAD_ID_LEN;
    let id = PayloadId::decode(
        packet
            .buffer
            .get(trailer_start..rtp.payload.end)
            .ok_or(Error::BadPacket)?,
    )?;
    if id.index >= id.source_block_len {
        return Err(Error::BadPacket);
    }
    rtp.payload.end = trailer_start;
    packet.fec = Some(crate::packet::FecView {
        block_id: id.block_id,
        index: id.index,
        source_block_len: id.source_block_len,
        repair_block_len: id.repair_block_len,
    });
    if !packet.has_flags(Packet::FLAG_FEC) {
        packet.add_flags(Packet::FLAG_FEC);
    }
    Ok(())
}

/// Parses a repair packet's payload: payload-ID header plus shard bytes.
///
/// Repair packets are RTP-wrapped so that the repair stream carries the
/// sender's SSRC; the RTP view must already be parsed.
pub fn parse_repair(packet: &mut Packet) -> Result<()> {
    let payload = packet.rtp_payload()?;
    let id = PayloadId::decode(payload)?;
    if payload.len() <= PAYLOAD_ID_LEN {
        return Err(Error::BadPacket);
    }
    if id.index < id.source_block_len
        || id.index >= id.source_block_len + id.repair_block_len
    {
        return Err(Error::BadPacket);
    }
    packet.fec = Some(crate::packet::FecView {
        block_id: id.block_id,
        index: id.index,
        source_block_len: id.source_block_len,
        repair_block_len: id.repair_block_len,
    });
    if !packet.has_flags(Packet::FLAG_FEC) {
        packet.add_flags(Packet::FLAG_FEC);
    }
    Ok(())
}

/// Extends `shards` (the `k` filled source shards) with `m` freshly computed
/// repair shards.
pub(crate) fn encode_block(
    scheme: FecScheme,
    k: usize,
    m: usize,
    shards: &mut Vec<Vec<u8>>,
) -> Result<()> {
    debug_assert_eq!(shards.len(), k);
    match scheme {
        #[cfg(feature = "fec-rs8m")]
        FecScheme::Rs8m => rs8m::encode(k, m, shards),
        #[cfg(feature = "fec-ldpc")]
        FecScheme::LdpcStaircase => ldpc::encode(k, m, shards),
        #[allow(unreachable_patterns)]
        _ => Err(Error::BadOperation),
    }
}

/// Reconstructs the missing entries of a codeword in place. `shards` holds
/// `k + m` entries, at least `k` of them present and all the same length.
pub(crate) fn decode_block(
    scheme: FecScheme,
    k: usize,
    m: usize,
    shards: &mut [Option<Vec<u8>>],
) -> Result<()> {
    debug_assert_eq!(shards.len(), k + m);
    match scheme {
        #[cfg(feature = "fec-rs8m")]
        FecScheme::Rs8m => rs8m::decode(k, m, shards),
        #[cfg(feature = "fec-ldpc")]
        FecScheme::LdpcStaircase => ldpc::decode(k, m, shards),
        #[allow(unreachable_patterns)]
        _ => Err(Error::BadOperation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_id_round_trip() {
        let id = PayloadId {
            block_id: 7,
            index: 3,
            source_block_len: 20,
            repair_block_len: 10,
        };
        let mut bytes = Vec::new();
        id.encode(&mut bytes);
        assert_eq!(bytes.len(), PAYLOAD_ID_LEN);
        assert_eq!(PayloadId::decode(&bytes).unwrap(), id);
    }

    #[test]
    fn test_payload_id_rejects_garbage() {
        assert_eq!(PayloadId::decode(&[0u8; 4]), Err(Error::BadPacket));
        // Zero source block length is never valid.
        assert_eq!(PayloadId::decode(&[0u8; 8]), Err(Error::BadPacket));
    }

    #[test]
    fn test_block_ordering_wraps() {
        assert!(block_lt(u16::MAX, 0));
        assert!(block_lt(0, 1));
        assert!(!block_lt(1, 0));
    }

    #[test]
    fn test_schemes_supported_in_default_build() {
        assert!(FecScheme::Rs8m.is_supported());
        assert!(FecScheme::LdpcStaircase.is_supported());
    }

    fn codeword_round_trip(scheme: FecScheme, drop: &[usize]) {
        let k = 6;
        let m = 3;
        let mut shards: Vec<Vec<u8>> = (0..k)
            .map(|i| (0..32u8).map(|b| b.wrapping_mul(i as u8 + 1)).collect())
            .collect();
        let originals = shards.clone();
        encode_block(scheme, k, m, &mut shards).unwrap();
        assert_eq!(shards.len(), k + m);

        let mut holes: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for &i in drop {
            holes[i] = None;
        }
        decode_block(scheme, k, m, &mut holes).unwrap();
        for (i, original) in originals.iter().enumerate() {
            assert_eq!(holes[i].as_ref().unwrap(), original, "shard {}", i);
        }
    }

    #[test]
    fn test_rs8m_codeword_repairs_losses() {
        codeword_round_trip(FecScheme::Rs8m, &[0, 3, 5]);
        codeword_round_trip(FecScheme::Rs8m, &[1]);
    }

    #[test]
    fn test_ldpc_codeword_repairs_losses() {
        codeword_round_trip(FecScheme::LdpcStaircase, &[2]);
        codeword_round_trip(FecScheme::LdpcStaircase, &[0, 4]);
    }
}
