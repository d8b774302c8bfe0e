//! Packet model shared by the transport and pipeline layers.
//!
//! A [`Packet`] is an owned value: moving it into a writer transfers
//! ownership, and composers freeze the serialized form exactly once. The
//! parsed views ([`RtpView`], [`FecView`], [`UdpView`]) index into the
//! packet's byte buffer instead of copying out of it.

pub mod pool;
pub mod queue;

use std::net::SocketAddr;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::time::Nanos;
use pool::PoolBuf;

/// RTP synchronization source identifier.
pub type StreamSource = u32;

/// RTP sequence number.
pub type SeqNum = u16;

/// 32-bit sample-count timeline local to one sender's stream.
pub type StreamTimestamp = u32;

/// `a < b` on the 16-bit sequence circle.
pub fn seq_lt(a: SeqNum, b: SeqNum) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// `a < b` on the 32-bit stream-timestamp circle.
pub fn ts_lt(a: StreamTimestamp, b: StreamTimestamp) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` on the 32-bit stream-timestamp circle.
pub fn ts_le(a: StreamTimestamp, b: StreamTimestamp) -> bool {
    a == b || ts_lt(a, b)
}

/// Signed distance `a - b` on the 32-bit stream-timestamp circle.
pub fn ts_diff(a: StreamTimestamp, b: StreamTimestamp) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Parsed RTP header view into the packet buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpView {
    /// Stream source id (SSRC).
    pub source_id: StreamSource,
    /// Sequence number.
    pub seqnum: SeqNum,
    /// Stream timestamp of the first sample in the payload.
    pub stream_timestamp: StreamTimestamp,
    /// Payload duration in samples at the encoding rate. Filled by the
    /// parser from the payload size; zero until then.
    pub duration: u32,
    /// Payload type.
    pub payload_type: u8,
    /// Marker bit.
    pub marker: bool,
    /// Capture timestamp: nanoseconds since Unix epoch of the first payload
    /// sample, 0 if unknown. Carried as a header extension.
    pub capture_timestamp: Nanos,
    /// Byte range of the decodable payload within the packet buffer.
    pub payload: Range<usize>,
}

/// Parsed FEC payload-ID view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecView {
    /// Block this packet belongs to.
    pub block_id: u16,
    /// Index within the block: `0..source_block_len` for source packets,
    /// `source_block_len..source_block_len + repair_block_len` for repair.
    pub index: u16,
    /// Number of source packets per block.
    pub source_block_len: u16,
    /// Number of repair packets per block.
    pub repair_block_len: u16,
}

/// UDP addressing view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpView {
    /// Address the packet was received from.
    pub src_addr: Option<SocketAddr>,
    /// Address the packet should be sent to.
    pub dst_addr: Option<SocketAddr>,
}

/// An owned network packet.
#[derive(Debug)]
pub struct Packet {
    flags: u8,
    /// Serialized bytes. Frozen once [`Packet::FLAG_COMPOSED`] is set.
    pub buffer: PoolBuf<u8>,
    /// RTP view, present after parse or prepare.
    pub rtp: Option<RtpView>,
    /// FEC view, present on FEC-tagged packets.
    pub fec: Option<FecView>,
    /// UDP view, present once the packet touched a socket path.
    pub udp: Option<UdpView>,
}

impl Packet {
    /// Packet carries an RTP view.
    pub const FLAG_RTP: u8 = 1 << 0;
    /// Packet carries a FEC view.
    pub const FLAG_FEC: u8 = 1 << 1;
    /// Packet carries a UDP view.
    pub const FLAG_UDP: u8 = 1 << 2;
    /// Views are filled in and the packet is ready for composition.
    pub const FLAG_PREPARED: u8 = 1 << 3;
    /// Serialized form is frozen; mutating the views is a programmer error.
    pub const FLAG_COMPOSED: u8 = 1 << 4;
    /// Packet was reconstructed by the FEC decoder rather than received.
    pub const FLAG_RESTORED: u8 = 1 << 5;

    /// Creates an empty packet around a buffer.
    pub fn new(buffer: PoolBuf<u8>) -> Self {
        Packet {
            flags: 0,
            buffer,
            rtp: None,
            fec: None,
            udp: None,
        }
    }

    /// Returns true if all bits of `flags` are set.
    pub fn has_flags(&self, flags: u8) -> bool {
        self.flags & flags == flags
    }

    /// Sets flag bits. Setting [`Self::FLAG_COMPOSED`] twice is a programmer
    /// error and panics.
    pub fn add_flags(&mut self, flags: u8) {
        if flags & Self::FLAG_COMPOSED != 0 && self.flags & Self::FLAG_COMPOSED != 0 {
            panic!("packet: composed flag set twice");
        }
        self.flags |= flags;
    }

    /// Current flag bits.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// RTP view, or `BadOperation` if the packet has none.
    pub fn rtp(&self) -> Result<&RtpView> {
        self.rtp.as_ref().ok_or(Error::BadOperation)
    }

    /// RTP payload bytes.
    pub fn rtp_payload(&self) -> Result<&[u8]> {
        let rtp = self.rtp()?;
        self.buffer
            .get(rtp.payload.clone())
            .ok_or(Error::BadPacket)
    }

    /// Stream timestamp just past this packet's payload.
    pub fn end_timestamp(&self) -> Result<StreamTimestamp> {
        let rtp = self.rtp()?;
        Ok(rtp.stream_timestamp.wrapping_add(rtp.duration))
    }
}

/// Packet source seam between pipeline stages.
pub trait PacketReader {
    /// Reads one packet; `Err(NoData)` when none is available.
    fn read(&mut self) -> Result<Packet>;
}
