//! RTCP participant: identity, report scheduling and reception statistics.
//!
//! The participant owns the local identity (random SSRC plus a stable
//! UUID-derived CNAME), decides when compound reports are due (5 s nominal
//! with the standard [0.5, 1.5] randomization) and builds/consumes compound
//! packets. Per-stream reception statistics live in [`StreamTracker`], one
//! per remote stream, owned by the session that receives the stream.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use uuid::Uuid;

use super::wire::{
    self, Goodbye, ReceiverReport, ReceptionReport, RtcpPacket, SenderReport,
    SourceDescription,
};
use crate::error::Result;
use crate::packet::{seq_lt, SeqNum, StreamSource, StreamTimestamp};
use crate::time::{Nanos, SECOND};

/// Nominal interval between reports.
pub const REPORT_INTERVAL: Nanos = 5 * SECOND;

/// Round-trip time from a reception report that echoes a report we sent:
/// now minus the echoed timestamp minus the remote hold time.
pub fn rtt_from_echo(report: &ReceptionReport, now_unix: Nanos) -> Option<Nanos> {
    if report.last_sr == 0 {
        return None;
    }
    let now_middle = wire::ntp_middle(wire::unix_to_ntp(now_unix)) as i64;
    let rtt_units = now_middle - report.last_sr as i64 - report.delay_last_sr as i64;
    // 1/65536-second units to nanoseconds.
    (rtt_units > 0).then(|| rtt_units * SECOND / 65_536)
}

/// Mapping between a remote stream's RTP timeline and the remote wall clock,
/// learned from sender reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockMap {
    /// Remote wall-clock time (Unix ns) at `rtp_timestamp`.
    pub remote_unix_ns: Nanos,
    /// Stream timestamp the wall-clock time corresponds to.
    pub rtp_timestamp: StreamTimestamp,
}

impl ClockMap {
    /// Translates a stream timestamp into remote wall-clock nanoseconds.
    pub fn stream_to_unix(&self, ts: StreamTimestamp, rate: u32) -> Nanos {
        let diff = ts.wrapping_sub(self.rtp_timestamp) as i32 as i64;
        self.remote_unix_ns + diff * SECOND / rate as i64
    }
}

/// Reception statistics for one remote stream (RFC 3550 appendix A).
#[derive(Debug)]
pub struct StreamTracker {
    ssrc: StreamSource,
    clock_rate: u32,

    base_seq: Option<SeqNum>,
    highest_seq: SeqNum,
    seq_cycles: u32,

    received: u64,
    expected_prior: u64,
    received_prior: u64,

    /// Interarrival jitter estimate, in timestamp units.
    jitter: f64,
    prev_arrival_mono: Option<Nanos>,
    prev_rtp_ts: Option<StreamTimestamp>,

    last_sr_middle: u32,
    last_sr_arrival_mono: Option<Nanos>,

    clock_map: Option<ClockMap>,
    rtt_ns: Nanos,
    last_activity_mono: Nanos,
}

impl StreamTracker {
    /// Creates a tracker for `ssrc` whose timestamps tick at `clock_rate`.
    pub fn new(ssrc: StreamSource, clock_rate: u32, now_mono: Nanos) -> Self {
        StreamTracker {
            ssrc,
            clock_rate,
            base_seq: None,
            highest_seq: 0,
            seq_cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            prev_arrival_mono: None,
            prev_rtp_ts: None,
            last_sr_middle: 0,
            last_sr_arrival_mono: None,
            clock_map: None,
            rtt_ns: 0,
            last_activity_mono: now_mono,
        }
    }

    /// Stream this tracker observes.
    pub fn ssrc(&self) -> StreamSource {
        self.ssrc
    }

    /// Records one received RTP packet.
    pub fn record_packet(
        &mut self,
        seqnum: SeqNum,
        rtp_ts: StreamTimestamp,
        now_mono: Nanos,
    ) {
        self.received += 1;
        self.last_activity_mono = now_mono;

        match self.base_seq {
            None => {
                self.base_seq = Some(seqnum);
                self.highest_seq = seqnum;
            }
            Some(_) => {
                if seq_lt(self.highest_seq, seqnum) {
                    if seqnum < self.highest_seq {
                        self.seq_cycles += 1;
                    }
                    self.highest_seq = seqnum;
                }
            }
        }

        // Interarrival jitter, RFC 3550 A.8.
        if let (Some(prev_arrival), Some(prev_ts)) = (self.prev_arrival_mono, self.prev_rtp_ts)
        {
            let arrival_diff_ts =
                (now_mono - prev_arrival) as f64 * self.clock_rate as f64 / SECOND as f64;
            let rtp_diff = rtp_ts.wrapping_sub(prev_ts) as i32 as f64;
            let d = (arrival_diff_ts - rtp_diff).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_arrival_mono = Some(now_mono);
        self.prev_rtp_ts = Some(rtp_ts);
    }

    /// Records a sender report for this stream.
    pub fn record_sender_report(&mut self, sr: &SenderReport, now_mono: Nanos) {
        self.clock_map = Some(ClockMap {
            remote_unix_ns: wire::ntp_to_unix(sr.ntp_timestamp),
            rtp_timestamp: sr.rtp_timestamp,
        });
        self.last_sr_middle = wire::ntp_middle(sr.ntp_timestamp);
        self.last_sr_arrival_mono = Some(now_mono);
        self.last_activity_mono = now_mono;
    }

    /// Records a reception report echoing our own reports, computing the
    /// round-trip time when the echo references a report we sent.
    pub fn record_reception_echo(&mut self, report: &ReceptionReport, now_unix: Nanos) {
        if let Some(rtt) = rtt_from_echo(report, now_unix) {
            self.rtt_ns = rtt;
        }
    }

    /// Remote-to-local clock mapping, once a sender report arrived.
    pub fn clock_map(&self) -> Option<ClockMap> {
        self.clock_map
    }

    /// Current round-trip estimate, 0 when unknown.
    pub fn rtt(&self) -> Nanos {
        self.rtt_ns
    }

    /// Interarrival jitter in nanoseconds.
    pub fn jitter_ns(&self) -> Nanos {
        (self.jitter * SECOND as f64 / self.clock_rate as f64) as Nanos
    }

    /// Last time any packet or report from this stream was seen.
    pub fn last_activity(&self) -> Nanos {
        self.last_activity_mono
    }

    fn extended_highest(&self) -> u32 {
        (self.seq_cycles << 16) | self.highest_seq as u32
    }

    /// Total packets expected so far.
    pub fn expected(&self) -> u64 {
        match self.base_seq {
            Some(base) => {
                self.extended_highest() as u64 - base as u64 + 1
            }
            None => 0,
        }
    }

    /// Lifetime packet loss ratio in [0, 1].
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.expected();
        if expected == 0 {
            return 0.0;
        }
        let lost = expected.saturating_sub(self.received);
        lost as f64 / expected as f64
    }

    /// Builds the reception report block for the next compound, advancing
    /// the per-interval counters.
    pub fn make_report(&mut self, now_mono: Nanos) -> ReceptionReport {
        let expected = self.expected();
        let lost = expected.saturating_sub(self.received);

        let expected_interval = expected - self.expected_prior;
        let received_interval = self.received - self.received_prior;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let fraction_lost = if expected_interval == 0 || received_interval >= expected_interval
        {
            0
        } else {
            (((expected_interval - received_interval) << 8) / expected_interval) as u8
        };

        let delay_last_sr = self
            .last_sr_arrival_mono
            .map(|arrival| (((now_mono - arrival).max(0)) * 65_536 / SECOND) as u32)
            .unwrap_or(0);

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: lost.min(0x00ff_ffff) as u32,
            highest_seq: self.extended_highest(),
            jitter: self.jitter as u32,
            last_sr: self.last_sr_middle,
            delay_last_sr,
        }
    }
}

/// What a consumed control packet asks the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A sender report arrived for a stream.
    SenderReport(SenderReport),
    /// A CNAME was learned for a stream.
    Cname {
        /// Stream the CNAME belongs to.
        ssrc: StreamSource,
        /// The CNAME itself.
        cname: String,
    },
    /// A remote stream said goodbye.
    Bye {
        /// Stream leaving the session.
        ssrc: StreamSource,
    },
    /// A reception report block refers to one of our own streams.
    ReceptionEcho {
        /// SSRC of the remote participant that sent the report.
        reporter: StreamSource,
        /// The reception report about our stream.
        report: ReceptionReport,
    },
}

/// Sender-side counters for building SR packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendState {
    /// Stream timestamp corresponding to "now".
    pub rtp_timestamp: StreamTimestamp,
    /// Packets sent so far.
    pub packet_count: u32,
    /// Payload octets sent so far.
    pub octet_count: u32,
}

/// The local RTCP participant of one slot.
pub struct Participant {
    source_id: StreamSource,
    cname: String,
    next_report_mono: Option<Nanos>,
    rng: StdRng,
}

impl Participant {
    /// Creates a participant with a random SSRC and a generated CNAME.
    pub fn new() -> Self {
        let mut rng = StdRng::from_entropy();
        Participant {
            source_id: rng.gen(),
            cname: Uuid::new_v4().to_string(),
            next_report_mono: None,
            rng,
        }
    }

    /// Creates a participant with a fixed CNAME.
    pub fn with_cname(cname: &str) -> Self {
        let mut participant = Self::new();
        participant.cname = cname.to_string();
        participant
    }

    /// Local stream source id.
    pub fn source_id(&self) -> StreamSource {
        self.source_id
    }

    /// Local CNAME.
    pub fn cname(&self) -> &str {
        &self.cname
    }

    /// Re-rolls the local SSRC after a collision with `remote`. Returns the
    /// new id when a collision actually occurred.
    pub fn resolve_collision(&mut self, remote: StreamSource) -> Option<StreamSource> {
        if remote != self.source_id {
            return None;
        }
        self.source_id = self.rng.gen();
        debug!(source_id = self.source_id, "rtcp: ssrc collision, re-rolled");
        Some(self.source_id)
    }

    /// Deadline of the next report. Schedules the first interval on demand.
    pub fn next_deadline(&mut self, now_mono: Nanos) -> Nanos {
        match self.next_report_mono {
            Some(deadline) => deadline,
            None => {
                let deadline = now_mono + self.random_interval();
                self.next_report_mono = Some(deadline);
                deadline
            }
        }
    }

    /// True when a report is due.
    pub fn is_due(&mut self, now_mono: Nanos) -> bool {
        self.next_deadline(now_mono) <= now_mono
    }

    /// Advances the schedule after a report was built (or dropped: a failed
    /// composition simply retries at the next tick).
    pub fn schedule_next(&mut self, now_mono: Nanos) {
        self.next_report_mono = Some(now_mono + self.random_interval());
    }

    fn random_interval(&mut self) -> Nanos {
        let factor: f64 = self.rng.gen_range(0.5..1.5);
        (REPORT_INTERVAL as f64 * factor) as Nanos
    }

    /// Builds a receiver compound: RR with the given blocks plus our SDES.
    pub fn make_receiver_compound(&self, reports: Vec<ReceptionReport>) -> Vec<u8> {
        let packets = [
            RtcpPacket::Rr(ReceiverReport {
                ssrc: self.source_id,
                reports,
            }),
            self.sdes(),
        ];
        let mut out = Vec::new();
        wire::encode_compound(&packets, &mut out);
        out
    }

    /// Builds a sender compound: SR (with optional reception blocks) plus
    /// our SDES.
    pub fn make_sender_compound(
        &self,
        now_unix: Nanos,
        send_state: SendState,
        reports: Vec<ReceptionReport>,
    ) -> Vec<u8> {
        let packets = [
            RtcpPacket::Sr(SenderReport {
                ssrc: self.source_id,
                ntp_timestamp: wire::unix_to_ntp(now_unix),
                rtp_timestamp: send_state.rtp_timestamp,
                packet_count: send_state.packet_count,
                octet_count: send_state.octet_count,
                reports,
            }),
            self.sdes(),
        ];
        let mut out = Vec::new();
        wire::encode_compound(&packets, &mut out);
        out
    }

    /// Builds the goodbye compound sent on teardown.
    pub fn make_bye_compound(&self, reason: &str) -> Vec<u8> {
        let packets = [
            RtcpPacket::Rr(ReceiverReport {
                ssrc: self.source_id,
                reports: Vec::new(),
            }),
            self.sdes(),
            RtcpPacket::Bye(Goodbye {
                sources: vec![self.source_id],
                reason: reason.to_string(),
            }),
        ];
        let mut out = Vec::new();
        wire::encode_compound(&packets, &mut out);
        out
    }

    fn sdes(&self) -> RtcpPacket {
        RtcpPacket::Sdes(SourceDescription {
            chunks: vec![(self.source_id, self.cname.clone())],
        })
    }

    /// Parses a compound packet into pipeline events.
    pub fn consume(&self, data: &[u8]) -> Result<Vec<Event>> {
        let packets = wire::decode_compound(data)?;
        let mut events = Vec::new();
        for packet in packets {
            match packet {
                RtcpPacket::Sr(sr) => {
                    for report in &sr.reports {
                        if report.ssrc == self.source_id {
                            events.push(Event::ReceptionEcho {
                                reporter: sr.ssrc,
                                report: *report,
                            });
                        }
                    }
                    events.push(Event::SenderReport(sr));
                }
                RtcpPacket::Rr(rr) => {
                    for report in &rr.reports {
                        if report.ssrc == self.source_id {
                            events.push(Event::ReceptionEcho {
                                reporter: rr.ssrc,
                                report: *report,
                            });
                        }
                    }
                }
                RtcpPacket::Sdes(sdes) => {
                    for (ssrc, cname) in sdes.chunks {
                        if !cname.is_empty() {
                            events.push(Event::Cname { ssrc, cname });
                        }
                    }
                }
                RtcpPacket::Bye(bye) => {
                    for ssrc in bye.sources {
                        events.push(Event::Bye { ssrc });
                    }
                }
            }
        }
        Ok(events)
    }
}

impl Default for Participant {
    fn default() -> Self {
        Self::new()
    }
}
