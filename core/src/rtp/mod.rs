//! RTP header codec and payload-type registry.
//!
//! RFC 3550 fixed header plus an optional one-byte header-extension block.
//! The capture timestamp rides in extension element id 1 as 8 bytes of
//! big-endian nanoseconds since the Unix epoch; 0 means unknown and the
//! element is omitted.

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::audio::sample_spec::{ChannelLayout, SampleFormat, SampleSpec};
use crate::error::{Error, Result};
use crate::packet::pool::{PacketPool, PoolBuf};
use crate::packet::{Packet, RtpView, SeqNum, StreamSource, StreamTimestamp};
use crate::time::Nanos;

/// RTP protocol version.
pub const RTP_VERSION: u8 = 2;

/// Fixed header size without CSRCs or extension.
pub const MIN_HEADER_LEN: usize = 12;

/// One-byte header-extension profile (RFC 8285).
const EXT_PROFILE_ONE_BYTE: u16 = 0xBEDE;

/// Extension element id carrying the capture timestamp.
const EXT_ID_CAPTURE_TS: u8 = 1;

const EXT_CAPTURE_TS_LEN: usize = 8;

/// A registered payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    /// RTP payload type carrying this encoding.
    pub payload_type: u8,
    /// PCM spec of the payload.
    pub spec: SampleSpec,
}

/// Payload type registry: IANA AVP entries plus user-registered dynamic
/// encodings.
#[derive(Debug, Clone)]
pub struct EncodingMap {
    encodings: Vec<Encoding>,
}

/// IANA AVP payload type for L16 stereo at 44100 Hz.
pub const PAYLOAD_TYPE_L16_STEREO: u8 = 10;

/// IANA AVP payload type for L16 mono at 44100 Hz.
pub const PAYLOAD_TYPE_L16_MONO: u8 = 11;

/// First payload type available for dynamic registration.
pub const PAYLOAD_TYPE_DYNAMIC_MIN: u8 = 96;

/// Last payload type available for dynamic registration.
pub const PAYLOAD_TYPE_DYNAMIC_MAX: u8 = 127;

impl EncodingMap {
    /// Creates a map with the built-in IANA AVP entries.
    pub fn new() -> Self {
        EncodingMap {
            encodings: vec![
                Encoding {
                    payload_type: PAYLOAD_TYPE_L16_STEREO,
                    spec: SampleSpec::new(44_100, SampleFormat::S16Be, ChannelLayout::Stereo),
                },
                Encoding {
                    payload_type: PAYLOAD_TYPE_L16_MONO,
                    spec: SampleSpec::new(44_100, SampleFormat::S16Be, ChannelLayout::Mono),
                },
            ],
        }
    }

    /// Registers a dynamic encoding. The payload type must be in the dynamic
    /// range and not taken.
    pub fn register(&mut self, encoding: Encoding) -> Result<()> {
        if !(PAYLOAD_TYPE_DYNAMIC_MIN..=PAYLOAD_TYPE_DYNAMIC_MAX)
            .contains(&encoding.payload_type)
        {
            return Err(Error::BadOperation);
        }
        if self.find(encoding.payload_type).is_some() {
            return Err(Error::BadOperation);
        }
        self.encodings.push(encoding);
        Ok(())
    }

    /// Looks up an encoding by payload type.
    pub fn find(&self, payload_type: u8) -> Option<&Encoding> {
        self.encodings
            .iter()
            .find(|e| e.payload_type == payload_type)
    }
}

impl Default for EncodingMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Header fields for composing a packet.
#[derive(Debug, Clone, Copy)]
pub struct RtpParams {
    /// Stream source id (SSRC).
    pub source_id: StreamSource,
    /// Sequence number.
    pub seqnum: SeqNum,
    /// Stream timestamp of the first payload sample.
    pub stream_timestamp: StreamTimestamp,
    /// Payload type.
    pub payload_type: u8,
    /// Marker bit.
    pub marker: bool,
    /// Capture timestamp, 0 to omit the extension.
    pub capture_timestamp: Nanos,
}

/// Serialized size of a header with the given parameters.
fn header_len(params: &RtpParams) -> usize {
    if params.capture_timestamp != 0 {
        // Extension header word plus one padded element.
        MIN_HEADER_LEN + 4 + 12
    } else {
        MIN_HEADER_LEN
    }
}

/// Composes a finished packet from header fields and payload bytes.
///
/// The returned packet carries `FLAG_RTP | FLAG_PREPARED | FLAG_COMPOSED`
/// and a frozen buffer. Fails with `NoMem` when the pool is exhausted or the
/// packet would not fit a pool buffer.
pub fn compose(pool: &PacketPool, params: RtpParams, payload: &[u8]) -> Result<Packet> {
    let total = header_len(&params) + payload.len();
    if total > pool.buf_capacity() {
        debug!(total, cap = pool.buf_capacity(), "rtp: packet too large");
        return Err(Error::NoMem);
    }
    let buf = pool.allocate().ok_or(Error::NoMem)?;
    compose_into(buf, params, payload)
}

/// Composes into a caller-provided buffer; used by tests and by the FEC
/// decoder when rebuilding packets outside the pools.
pub fn compose_into(mut buf: PoolBuf<u8>, params: RtpParams, payload: &[u8]) -> Result<Packet> {
    buf.clear();

    let has_ext = params.capture_timestamp != 0;
    let b0 = (RTP_VERSION << 6) | ((has_ext as u8) << 4);
    let b1 = ((params.marker as u8) << 7) | (params.payload_type & 0x7f);
    buf.push(b0);
    buf.push(b1);
    buf.extend_from_slice(&params.seqnum.to_be_bytes());
    buf.extend_from_slice(&params.stream_timestamp.to_be_bytes());
    buf.extend_from_slice(&params.source_id.to_be_bytes());

    if has_ext {
        buf.extend_from_slice(&EXT_PROFILE_ONE_BYTE.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes()); // 3 words of elements
        buf.push((EXT_ID_CAPTURE_TS << 4) | (EXT_CAPTURE_TS_LEN as u8 - 1));
        buf.extend_from_slice(&params.capture_timestamp.to_be_bytes());
        buf.extend_from_slice(&[0u8; 3]); // pad to word boundary
    }

    let payload_start = buf.len();
    buf.extend_from_slice(payload);
    let payload_end = buf.len();

    let mut packet = Packet::new(buf);
    packet.rtp = Some(RtpView {
        source_id: params.source_id,
        seqnum: params.seqnum,
        stream_timestamp: params.stream_timestamp,
        duration: 0,
        payload_type: params.payload_type,
        marker: params.marker,
        capture_timestamp: params.capture_timestamp,
        payload: payload_start..payload_end,
    });
    packet.add_flags(Packet::FLAG_RTP | Packet::FLAG_PREPARED | Packet::FLAG_COMPOSED);
    Ok(packet)
}

/// Parses the packet buffer into an RTP view.
///
/// Leaves `duration` at 0; call [`apply_encoding`] once the payload type has
/// been resolved against an [`EncodingMap`].
pub fn parse(packet: &mut Packet) -> Result<()> {
    let buf: &[u8] = &packet.buffer;
    if buf.len() < MIN_HEADER_LEN {
        return Err(Error::BadPacket);
    }

    let version = buf[0] >> 6;
    if version != RTP_VERSION {
        return Err(Error::BadPacket);
    }
    let padding = buf[0] & 0x20 != 0;
    let has_ext = buf[0] & 0x10 != 0;
    let csrc_count = (buf[0] & 0x0f) as usize;
    let marker = buf[1] & 0x80 != 0;
    let payload_type = buf[1] & 0x7f;
    let seqnum = BigEndian::read_u16(&buf[2..4]);
    let stream_timestamp = BigEndian::read_u32(&buf[4..8]);
    let source_id = BigEndian::read_u32(&buf[8..12]);

    let mut offset = MIN_HEADER_LEN + csrc_count * 4;
    if buf.len() < offset {
        return Err(Error::BadPacket);
    }

    let mut capture_timestamp: Nanos = 0;
    if has_ext {
        if buf.len() < offset + 4 {
            return Err(Error::BadPacket);
        }
        let profile = BigEndian::read_u16(&buf[offset..offset + 2]);
        let words = BigEndian::read_u16(&buf[offset + 2..offset + 4]) as usize;
        let ext_start = offset + 4;
        let ext_end = ext_start + words * 4;
        if buf.len() < ext_end {
            return Err(Error::BadPacket);
        }
        if profile == EXT_PROFILE_ONE_BYTE {
            let mut pos = ext_start;
            while pos < ext_end {
                let head = buf[pos];
                if head == 0 {
                    pos += 1; // padding
                    continue;
                }
                let id = head >> 4;
                let len = (head & 0x0f) as usize + 1;
                pos += 1;
                if pos + len > ext_end || id == 15 {
                    break;
                }
                if id == EXT_ID_CAPTURE_TS && len == EXT_CAPTURE_TS_LEN {
                    capture_timestamp = BigEndian::read_i64(&buf[pos..pos + 8]);
                }
                pos += len;
            }
        }
        offset = ext_end;
    }

    let mut payload_end = buf.len();
    if padding {
        let pad = *buf.last().unwrap() as usize;
        if pad == 0 || pad > payload_end - offset {
            return Err(Error::BadPacket);
        }
        payload_end -= pad;
    }
    if offset > payload_end {
        return Err(Error::BadPacket);
    }

    packet.rtp = Some(RtpView {
        source_id,
        seqnum,
        stream_timestamp,
        duration: 0,
        payload_type,
        marker,
        capture_timestamp,
        payload: offset..payload_end,
    });
    if !packet.has_flags(Packet::FLAG_RTP) {
        packet.add_flags(Packet::FLAG_RTP);
    }
    Ok(())
}

/// Resolves the packet's duration against its encoding.
///
/// Fails with `BadPacket` when the payload size is not aligned to a whole
/// number of frames.
pub fn apply_encoding(packet: &mut Packet, encoding: &Encoding) -> Result<()> {
    let rtp = packet.rtp.as_mut().ok_or(Error::BadOperation)?;
    let payload_len = rtp.payload.len();
    let frames = encoding
        .spec
        .bytes_to_frames(payload_len)
        .ok_or(Error::BadPacket)?;
    if frames == 0 {
        return Err(Error::BadPacket);
    }
    rtp.duration = frames as u32;
    Ok(())
}
