//! RTCP compound packet codec (RFC 3550 §6).
//!
//! Supported packet types: SR, RR, SDES (CNAME only) and BYE. Unknown packet
//! types inside a compound are skipped by their length field so that foreign
//! extensions never poison a whole compound.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::packet::StreamSource;
use crate::time::Nanos;

const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;

const SDES_CNAME: u8 = 1;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Converts Unix nanoseconds into a 64-bit NTP timestamp.
pub fn unix_to_ntp(unix_ns: Nanos) -> u64 {
    let unix_ns = unix_ns.max(0) as u64;
    let secs = unix_ns / 1_000_000_000 + NTP_UNIX_OFFSET_SECS;
    let frac = ((unix_ns % 1_000_000_000) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Converts a 64-bit NTP timestamp into Unix nanoseconds.
pub fn ntp_to_unix(ntp: u64) -> Nanos {
    let secs = (ntp >> 32).saturating_sub(NTP_UNIX_OFFSET_SECS);
    let frac_ns = ((ntp & 0xffff_ffff) * 1_000_000_000) >> 32;
    (secs * 1_000_000_000 + frac_ns) as Nanos
}

/// Middle 32 bits of an NTP timestamp, as used by LSR/DLSR fields.
pub fn ntp_middle(ntp: u64) -> u32 {
    ((ntp >> 16) & 0xffff_ffff) as u32
}

/// One reception report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    /// Stream the report is about.
    pub ssrc: StreamSource,
    /// Fraction of packets lost since the previous report, Q8.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit, saturating).
    pub cumulative_lost: u32,
    /// Extended highest sequence number received.
    pub highest_seq: u32,
    /// Interarrival jitter in timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that SR, in 1/65536 seconds.
    pub delay_last_sr: u32,
}

/// Sender report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// Sender's stream source id.
    pub ssrc: StreamSource,
    /// 64-bit NTP timestamp of the report instant.
    pub ntp_timestamp: u64,
    /// Stream timestamp corresponding to the NTP timestamp.
    pub rtp_timestamp: u32,
    /// Packets sent so far.
    pub packet_count: u32,
    /// Payload octets sent so far.
    pub octet_count: u32,
    /// Reception reports about remote streams, when the sender also
    /// receives.
    pub reports: Vec<ReceptionReport>,
}

/// Receiver report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// Reporter's stream source id.
    pub ssrc: StreamSource,
    /// Reception reports, one per tracked remote stream.
    pub reports: Vec<ReceptionReport>,
}

/// Source description carrying each source's CNAME.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    /// `(ssrc, cname)` chunks.
    pub chunks: Vec<(StreamSource, String)>,
}

/// Session leave notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    /// Sources leaving the session.
    pub sources: Vec<StreamSource>,
    /// Optional human-readable reason.
    pub reason: String,
}

/// One packet inside a compound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender report.
    Sr(SenderReport),
    /// Receiver report.
    Rr(ReceiverReport),
    /// Source description.
    Sdes(SourceDescription),
    /// Goodbye.
    Bye(Goodbye),
}

fn push_header(out: &mut Vec<u8>, count: u8, pt: u8, length_words: u16) {
    out.push((2 << 6) | (count & 0x1f));
    out.push(pt);
    out.extend_from_slice(&length_words.to_be_bytes());
}

fn push_reception_report(out: &mut Vec<u8>, report: &ReceptionReport) {
    out.extend_from_slice(&report.ssrc.to_be_bytes());
    out.push(report.fraction_lost);
    let lost = report.cumulative_lost.min(0x00ff_ffff);
    out.push((lost >> 16) as u8);
    out.push((lost >> 8) as u8);
    out.push(lost as u8);
    out.extend_from_slice(&report.highest_seq.to_be_bytes());
    out.extend_from_slice(&report.jitter.to_be_bytes());
    out.extend_from_slice(&report.last_sr.to_be_bytes());
    out.extend_from_slice(&report.delay_last_sr.to_be_bytes());
}

fn parse_reception_report(buf: &[u8]) -> ReceptionReport {
    ReceptionReport {
        ssrc: BigEndian::read_u32(&buf[0..4]),
        fraction_lost: buf[4],
        cumulative_lost: ((buf[5] as u32) << 16) | ((buf[6] as u32) << 8) | buf[7] as u32,
        highest_seq: BigEndian::read_u32(&buf[8..12]),
        jitter: BigEndian::read_u32(&buf[12..16]),
        last_sr: BigEndian::read_u32(&buf[16..20]),
        delay_last_sr: BigEndian::read_u32(&buf[20..24]),
    }
}

/// Serializes a compound packet.
///
/// The caller is responsible for compound ordering (SR/RR first, SDES next,
/// BYE last); this function writes packets in the order given.
pub fn encode_compound(packets: &[RtcpPacket], out: &mut Vec<u8>) {
    for packet in packets {
        match packet {
            RtcpPacket::Sr(sr) => {
                let words = 6 + 6 * sr.reports.len() as u16;
                push_header(out, sr.reports.len() as u8, PT_SR, words);
                out.extend_from_slice(&sr.ssrc.to_be_bytes());
                out.extend_from_slice(&sr.ntp_timestamp.to_be_bytes());
                out.extend_from_slice(&sr.rtp_timestamp.to_be_bytes());
                out.extend_from_slice(&sr.packet_count.to_be_bytes());
                out.extend_from_slice(&sr.octet_count.to_be_bytes());
                for report in &sr.reports {
                    push_reception_report(out, report);
                }
            }
            RtcpPacket::Rr(rr) => {
                let words = 1 + 6 * rr.reports.len() as u16;
                push_header(out, rr.reports.len() as u8, PT_RR, words);
                out.extend_from_slice(&rr.ssrc.to_be_bytes());
                for report in &rr.reports {
                    push_reception_report(out, report);
                }
            }
            RtcpPacket::Sdes(sdes) => {
                let mut body = Vec::new();
                for (ssrc, cname) in &sdes.chunks {
                    body.extend_from_slice(&ssrc.to_be_bytes());
                    body.push(SDES_CNAME);
                    let text = cname.as_bytes();
                    body.push(text.len().min(255) as u8);
                    body.extend_from_slice(&text[..text.len().min(255)]);
                    body.push(0); // end of item list
                    while body.len() % 4 != 0 {
                        body.push(0);
                    }
                }
                push_header(
                    out,
                    sdes.chunks.len() as u8,
                    PT_SDES,
                    (body.len() / 4) as u16,
                );
                out.extend_from_slice(&body);
            }
            RtcpPacket::Bye(bye) => {
                let mut body = Vec::new();
                for ssrc in &bye.sources {
                    body.extend_from_slice(&ssrc.to_be_bytes());
                }
                if !bye.reason.is_empty() {
                    let text = bye.reason.as_bytes();
                    body.push(text.len().min(255) as u8);
                    body.extend_from_slice(&text[..text.len().min(255)]);
                    while body.len() % 4 != 0 {
                        body.push(0);
                    }
                }
                push_header(
                    out,
                    bye.sources.len() as u8,
                    PT_BYE,
                    (body.len() / 4) as u16,
                );
                out.extend_from_slice(&body);
            }
        }
    }
}

/// Parses a compound packet. Unknown packet types are skipped; structural
/// damage fails the whole compound with `BadPacket`.
pub fn decode_compound(mut buf: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();

    while !buf.is_empty() {
        if buf.len() < 4 {
            return Err(Error::BadPacket);
        }
        let version = buf[0] >> 6;
        if version != 2 {
            return Err(Error::BadPacket);
        }
        let count = (buf[0] & 0x1f) as usize;
        let pt = buf[1];
        let words = BigEndian::read_u16(&buf[2..4]) as usize;
        let total = 4 + words * 4;
        if buf.len() < total {
            return Err(Error::BadPacket);
        }
        let body = &buf[4..total];

        match pt {
            PT_SR => {
                if body.len() < 24 + count * 24 {
                    return Err(Error::BadPacket);
                }
                let mut reports = Vec::with_capacity(count);
                for n in 0..count {
                    reports.push(parse_reception_report(&body[24 + n * 24..]));
                }
                packets.push(RtcpPacket::Sr(SenderReport {
                    ssrc: BigEndian::read_u32(&body[0..4]),
                    ntp_timestamp: BigEndian::read_u64(&body[4..12]),
                    rtp_timestamp: BigEndian::read_u32(&body[12..16]),
                    packet_count: BigEndian::read_u32(&body[16..20]),
                    octet_count: BigEndian::read_u32(&body[20..24]),
                    reports,
                }));
            }
            PT_RR => {
                if body.len() < 4 + count * 24 {
                    return Err(Error::BadPacket);
                }
                let mut reports = Vec::with_capacity(count);
                for n in 0..count {
                    reports.push(parse_reception_report(&body[4 + n * 24..]));
                }
                packets.push(RtcpPacket::Rr(ReceiverReport {
                    ssrc: BigEndian::read_u32(&body[0..4]),
                    reports,
                }));
            }
            PT_SDES => {
                let mut chunks = Vec::with_capacity(count);
                let mut pos = 0usize;
                for _ in 0..count {
                    if body.len() < pos + 4 {
                        return Err(Error::BadPacket);
                    }
                    let ssrc = BigEndian::read_u32(&body[pos..pos + 4]);
                    pos += 4;
                    let mut cname = String::new();
                    loop {
                        if pos >= body.len() {
                            return Err(Error::BadPacket);
                        }
                        let item = body[pos];
                        pos += 1;
                        if item == 0 {
                            // Chunk ends; skip padding to the next word.
                            while pos % 4 != 0 {
                                pos += 1;
                            }
                            break;
                        }
                        if pos >= body.len() {
                            return Err(Error::BadPacket);
                        }
                        let len = body[pos] as usize;
                        pos += 1;
                        if body.len() < pos + len {
                            return Err(Error::BadPacket);
                        }
                        if item == SDES_CNAME {
                            cname =
                                String::from_utf8_lossy(&body[pos..pos + len]).into_owned();
                        }
                        pos += len;
                    }
                    chunks.push((ssrc, cname));
                }
                packets.push(RtcpPacket::Sdes(SourceDescription { chunks }));
            }
            PT_BYE => {
                if body.len() < count * 4 {
                    return Err(Error::BadPacket);
                }
                let sources = (0..count)
                    .map(|n| BigEndian::read_u32(&body[n * 4..]))
                    .collect();
                let mut reason = String::new();
                if body.len() > count * 4 {
                    let len = body[count * 4] as usize;
                    let start = count * 4 + 1;
                    if body.len() >= start + len {
                        reason = String::from_utf8_lossy(&body[start..start + len]).into_owned();
                    }
                }
                packets.push(RtcpPacket::Bye(Goodbye { sources, reason }));
            }
            _ => {} // skip unknown packet types
        }

        buf = &buf[total..];
    }

    Ok(packets)
}
