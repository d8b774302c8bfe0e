//! Per-sender receive session.
//!
//! One session owns the whole chain for one remote stream: FEC decoder
//! (when a repair endpoint exists), jitter buffer, depacketizer, channel
//! mapper, latency tuner and resampler. Sessions are pipeline-thread
//! private; the group routes packets in and pulls frames out.

use tracing::{debug, warn};

use crate::audio::pcm::ChannelMapper;
use crate::audio::{
    Depacketizer, Frame, LatencyProfile, LatencyTuner, Resampler, ResamplerProfile,
    SampleSpec,
};
use crate::error::Result;
use crate::fec::{BlockDecoder, FecScheme};
use crate::metrics::ConnectionMetrics;
use crate::packet::queue::SortedQueue;
use crate::packet::{Packet, StreamSource};
use crate::rtcp::{ClockMap, SenderReport, StreamTracker};
use crate::rtp::{self, Encoding};
use crate::time::Nanos;

/// Everything a session needs to build its chain.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Packet encoding of the remote stream.
    pub encoding: Encoding,
    /// Receiver output spec the session converges to.
    pub output_spec: SampleSpec,
    /// Target buffered latency.
    pub target_latency: Nanos,
    /// Latency tuning profile.
    pub latency_profile: LatencyProfile,
    /// Resampler quality profile.
    pub resampler_profile: ResamplerProfile,
    /// Halt after this long without a non-blank frame.
    pub no_playback_timeout: Nanos,
    /// Jitter buffer capacity in packets.
    pub jitter_capacity: usize,
    /// FEC scheme of the repair endpoint, when one exists.
    pub fec_scheme: Option<FecScheme>,
}

/// Outcome of a session refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is healthy; re-refresh at the given deadline.
    Alive(Nanos),
    /// Playback timeout fired; the group must remove the session.
    Expired,
}

/// One remote sender's receive pipeline.
pub struct Session {
    source_id: StreamSource,
    cname: Option<String>,
    config: SessionConfig,

    fec: Option<BlockDecoder>,
    jitter: SortedQueue,
    depacketizer: Depacketizer,
    mapper: ChannelMapper,
    tuner: LatencyTuner,
    resampler: Resampler,
    tracker: StreamTracker,

    /// Scratch for depacketized samples at the encoding's layout.
    scratch: Vec<f32>,

    /// Capture timestamp of the next output sample, once anchored.
    next_out_ct: Option<Nanos>,
    last_frame_ct: Nanos,
    last_nonblank_mono: Nanos,
    e2e_latency_ns: Nanos,
    ct_regressions: u64,
    last_seen_ct: Nanos,
}

impl Session {
    /// Builds the session chain for `source_id`.
    pub fn new(source_id: StreamSource, config: SessionConfig, now_mono: Nanos) -> Result<Self> {
        let fec = match config.fec_scheme {
            Some(scheme) => Some(BlockDecoder::new(scheme)?),
            None => None,
        };
        let tuned = config.latency_profile != LatencyProfile::Intact;
        let resampler = Resampler::new(
            config.resampler_profile,
            config.encoding.spec.rate,
            config.output_spec.rate,
            config.output_spec.num_channels(),
            tuned,
        )?;

        debug!(
            source_id,
            rate = config.encoding.spec.rate,
            out_rate = config.output_spec.rate,
            fec = ?config.fec_scheme,
            "session: created"
        );

        Ok(Session {
            source_id,
            cname: None,
            fec,
            jitter: SortedQueue::new(config.jitter_capacity),
            depacketizer: Depacketizer::new(config.encoding.spec),
            mapper: ChannelMapper::new(config.encoding.spec.layout, config.output_spec.layout),
            tuner: LatencyTuner::new(config.latency_profile, config.target_latency),
            resampler,
            tracker: StreamTracker::new(source_id, config.encoding.spec.rate, now_mono),
            scratch: Vec::new(),
            next_out_ct: None,
            last_frame_ct: 0,
            last_nonblank_mono: now_mono,
            e2e_latency_ns: 0,
            ct_regressions: 0,
            last_seen_ct: 0,
            config,
        })
    }

    /// Remote stream source id.
    pub fn source_id(&self) -> StreamSource {
        self.source_id
    }

    /// CNAME, once learned from RTCP SDES.
    pub fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    /// Attaches the CNAME learned from RTCP.
    pub fn set_cname(&mut self, cname: &str) {
        if self.cname.as_deref() != Some(cname) {
            self.cname = Some(cname.to_string());
        }
    }

    /// Rebinds the session to a new SSRC after a CNAME-based relocation.
    pub fn set_source_id(&mut self, source_id: StreamSource) {
        self.source_id = source_id;
    }

    /// Routes one source packet into the chain.
    pub fn route_source_packet(&mut self, packet: Packet, now_mono: Nanos) {
        if let Some(rtp) = packet.rtp.as_ref() {
            self.tracker
                .record_packet(rtp.seqnum, rtp.stream_timestamp, now_mono);

            // Sanity-check capture-timestamp monotonicity; disagreement is
            // flagged but never a reason to drop.
            if rtp.capture_timestamp != 0 {
                if self.last_seen_ct != 0 && rtp.capture_timestamp < self.last_seen_ct {
                    self.ct_regressions += 1;
                    warn!(
                        source_id = self.source_id,
                        ct = rtp.capture_timestamp,
                        prev = self.last_seen_ct,
                        "session: capture timestamp went backwards"
                    );
                }
                self.last_seen_ct = self.last_seen_ct.max(rtp.capture_timestamp);
            }
        }

        match &mut self.fec {
            Some(decoder) => {
                decoder.push_source(packet);
                self.drain_fec();
            }
            None => self.jitter.push(packet),
        }
    }

    /// Routes one repair packet into the FEC decoder.
    pub fn route_repair_packet(&mut self, packet: Packet) {
        if let Some(decoder) = &mut self.fec {
            decoder.push_repair(packet);
            self.drain_fec();
        }
    }

    fn drain_fec(&mut self) {
        let Some(decoder) = &mut self.fec else {
            return;
        };
        while let Some(mut packet) = decoder.fetch() {
            if packet.has_flags(Packet::FLAG_RESTORED) {
                // Reconstructed packets still need their duration resolved.
                if rtp::apply_encoding(&mut packet, &self.config.encoding).is_err() {
                    continue;
                }
            }
            self.jitter.push(packet);
        }
    }

    /// Produces one output frame of `len` per-channel samples at the output
    /// spec.
    pub fn read_frame(&mut self, len: usize, now_mono: Nanos) -> Frame {
        let out_ch = self.config.output_spec.num_channels();
        let enc_spec = self.config.encoding.spec;
        let enc_ch = enc_spec.num_channels() as usize;

        let mut frame = Frame::silence(len, out_ch);

        let depacketizer = &mut self.depacketizer;
        let jitter = &mut self.jitter;
        let mapper = &mut self.mapper;
        let scratch = &mut self.scratch;
        let mut first_ct: Option<Nanos> = None;
        let passthrough = self.resampler.is_passthrough();

        let flags = self
            .resampler
            .read(&mut frame.samples, |out: &mut [f32]| {
                let frames = out.len() / out_ch as usize;
                scratch.clear();
                scratch.resize(frames * enc_ch, 0.0);
                let info = depacketizer.read_into(scratch, jitter);
                if first_ct.is_none() && info.capture_timestamp != 0 {
                    first_ct = Some(info.capture_timestamp);
                }
                out.copy_from_slice(mapper.map(scratch));
                info.flags
            })
            .unwrap_or(0);

        frame.set_flags(flags);

        // Output capture timestamps: exact in passthrough, anchored with a
        // sample-accurate stride once resampling is active.
        frame.capture_timestamp = if passthrough {
            first_ct.unwrap_or(0)
        } else {
            match (self.next_out_ct, first_ct) {
                (Some(ct), _) => ct,
                (None, Some(ct)) => {
                    self.next_out_ct = Some(ct);
                    ct
                }
                (None, None) => 0,
            }
        };
        if let Some(ct) = self.next_out_ct {
            self.next_out_ct = Some(ct + self.config.output_spec.samples_to_ns(len as u64));
        }

        if frame.has_flags(Frame::NOT_BLANK) {
            self.last_nonblank_mono = now_mono;
        }
        if frame.capture_timestamp != 0 {
            self.last_frame_ct = frame.capture_timestamp;
        }

        // Latency observation: everything buffered ahead of the output.
        let queued_samples = self.jitter.span_samples() as u64
            + self.depacketizer.buffered_samples() as u64;
        let queue_latency = enc_spec.samples_to_ns(queued_samples)
            + self
                .config
                .output_spec
                .samples_to_ns(self.resampler.buffered_output_frames() as u64);
        self.tuner.observe(queue_latency);
        self.resampler.set_scaling(self.tuner.scaling());

        frame
    }

    /// Periodic housekeeping; decides whether the session is still alive.
    pub fn refresh(&mut self, now_mono: Nanos) -> SessionStatus {
        let deadline = self.last_nonblank_mono + self.config.no_playback_timeout;
        if now_mono >= deadline {
            debug!(source_id = self.source_id, "session: playback timeout");
            SessionStatus::Expired
        } else {
            SessionStatus::Alive(deadline)
        }
    }

    /// Aligns the session clock with the sink: `playback_unix` is when the
    /// first sample of the last read frame actually plays.
    pub fn reclock(&mut self, playback_unix: Nanos) {
        if self.last_frame_ct != 0 {
            self.e2e_latency_ns = (playback_unix - self.last_frame_ct).max(0);
        }
    }

    /// Feeds a sender report for this stream.
    pub fn on_sender_report(&mut self, report: &SenderReport, now_mono: Nanos) {
        self.tracker.record_sender_report(report, now_mono);
    }

    /// Remote clock mapping, once known.
    pub fn clock_map(&self) -> Option<ClockMap> {
        self.tracker.clock_map()
    }

    /// Reception statistics tracker (for RTCP report generation).
    pub fn tracker_mut(&mut self) -> &mut StreamTracker {
        &mut self.tracker
    }

    /// Last time this stream showed any activity.
    pub fn last_activity(&self) -> Nanos {
        self.tracker.last_activity()
    }

    /// Capture timestamps observed going backwards. Disagreement between
    /// the stream timeline and capture timestamps is flagged, never a
    /// reason to drop.
    pub fn ct_regressions(&self) -> u64 {
        self.ct_regressions
    }

    /// Connection metrics snapshot.
    pub fn metrics(&self) -> ConnectionMetrics {
        let enc_spec = self.config.encoding.spec;
        let queued_samples =
            self.jitter.span_samples() as u64 + self.depacketizer.buffered_samples() as u64;
        ConnectionMetrics {
            source_id: self.source_id,
            cname: self.cname.clone(),
            e2e_latency_ns: self.e2e_latency_ns,
            queue_latency_ns: enc_spec.samples_to_ns(queued_samples),
            packet_loss_rate: self.tracker.loss_ratio(),
            jitter_ns: self.tracker.jitter_ns(),
            late_drops: self.depacketizer.late_drops(),
            repaired_packets: self.fec.as_ref().map_or(0, |d| d.repaired_count()),
            rtt_ns: self.tracker.rtt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm;
    use crate::audio::{ChannelLayout, SampleFormat};
    use crate::packet::pool::PoolBuf;
    use crate::rtp::{compose_into, RtpParams, PAYLOAD_TYPE_L16_STEREO};
    use crate::time::{MILLISECOND, SECOND};

    const RATE: u32 = 44_100;
    const SAMPLES_PER_PACKET: usize = 220;

    fn config() -> SessionConfig {
        SessionConfig {
            encoding: Encoding {
                payload_type: PAYLOAD_TYPE_L16_STEREO,
                spec: SampleSpec::new(RATE, SampleFormat::S16Be, ChannelLayout::Stereo),
            },
            output_spec: SampleSpec::new(RATE, SampleFormat::F32Be, ChannelLayout::Stereo),
            target_latency: 100 * MILLISECOND,
            latency_profile: LatencyProfile::Intact,
            resampler_profile: ResamplerProfile::Low,
            no_playback_timeout: SECOND,
            jitter_capacity: 64,
            fec_scheme: None,
        }
    }

    fn packet(n: u32, value: f32) -> Packet {
        let samples = vec![value; SAMPLES_PER_PACKET * 2];
        let mut payload = Vec::new();
        pcm::encode_samples(SampleFormat::S16Be, &samples, &mut payload);
        let composed = compose_into(
            PoolBuf::unpooled(Vec::new()),
            RtpParams {
                source_id: 0x77,
                seqnum: n as u16,
                stream_timestamp: n * SAMPLES_PER_PACKET as u32,
                payload_type: PAYLOAD_TYPE_L16_STEREO,
                marker: false,
                capture_timestamp: SECOND + n as Nanos * 5 * MILLISECOND,
            },
            &payload,
        )
        .unwrap();
        let mut parsed = Packet::new(PoolBuf::unpooled(composed.buffer.to_vec()));
        rtp::parse(&mut parsed).unwrap();
        parsed
    }

    #[test]
    fn test_plain_chain_passes_samples_through() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        for n in 0..4 {
            session.route_source_packet(packet(n, 0.25), 0);
        }
        let frame = session.read_frame(SAMPLES_PER_PACKET * 4, 0);
        assert!(frame.has_flags(Frame::NOT_BLANK));
        assert!(!frame.has_flags(Frame::NOT_COMPLETE));
        for &s in &frame.samples {
            assert!((s - 0.25).abs() < 1e-4);
        }
        assert_eq!(frame.capture_timestamp, SECOND);
    }

    #[test]
    fn test_reordered_packets_come_out_in_order() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        for n in [1u32, 0, 3, 2] {
            session.route_source_packet(packet(n, (n + 1) as f32 * 0.1), 0);
        }
        let frame = session.read_frame(SAMPLES_PER_PACKET * 4, 0);
        for (p, chunk) in frame.samples.chunks(SAMPLES_PER_PACKET * 2).enumerate() {
            let expected = (p + 1) as f32 * 0.1;
            for &s in chunk {
                assert!((s - expected).abs() < 1e-4, "packet {}", p);
            }
        }
    }

    #[test]
    fn test_timeout_expires_session() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        match session.refresh(SECOND / 2) {
            SessionStatus::Alive(deadline) => assert_eq!(deadline, SECOND),
            status => panic!("unexpected {:?}", status),
        }
        assert_eq!(session.refresh(SECOND), SessionStatus::Expired);
    }

    #[test]
    fn test_nonblank_frame_feeds_watchdog() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        session.route_source_packet(packet(0, 0.5), 0);
        let half = SECOND / 2;
        let _ = session.read_frame(SAMPLES_PER_PACKET, half);
        // The non-blank read at t=half pushes the deadline to half + 1s.
        match session.refresh(SECOND) {
            SessionStatus::Alive(deadline) => assert_eq!(deadline, half + SECOND),
            status => panic!("unexpected {:?}", status),
        }
    }

    #[test]
    fn test_e2e_latency_from_reclock() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        session.route_source_packet(packet(0, 0.5), 0);
        let _ = session.read_frame(SAMPLES_PER_PACKET, 0);
        session.reclock(SECOND + 80 * MILLISECOND);
        assert_eq!(session.metrics().e2e_latency_ns, 80 * MILLISECOND);
    }

    #[test]
    fn test_metrics_reflect_late_drops() {
        let mut session = Session::new(0x77, config(), 0).unwrap();
        session.route_source_packet(packet(2, 0.1), 0);
        let _ = session.read_frame(SAMPLES_PER_PACKET * 3, 0);
        // A packet from before the consumed range is late.
        session.route_source_packet(packet(0, 0.1), 0);
        let _ = session.read_frame(SAMPLES_PER_PACKET, 0);
        assert_eq!(session.metrics().late_drops, 1);
    }

    #[test]
    fn test_fec_chain_repairs_and_counts() {
        let mut cfg = config();
        cfg.fec_scheme = Some(FecScheme::Rs8m);
        let mut session = Session::new(0x77, cfg, 0).unwrap();

        let k = 4u16;
        let m = 2u16;
        let mut encoder = crate::fec::BlockEncoder::new(FecScheme::Rs8m, k, m).unwrap();
        let mut sources = Vec::new();
        let mut repairs = Vec::new();
        for n in 0..k {
            let samples = vec![0.3f32; SAMPLES_PER_PACKET * 2];
            let mut payload = Vec::new();
            pcm::encode_samples(SampleFormat::S16Be, &samples, &mut payload);
            encoder.next_payload_id().encode(&mut payload);
            let composed = compose_into(
                PoolBuf::unpooled(Vec::new()),
                RtpParams {
                    source_id: 0x77,
                    seqnum: n,
                    stream_timestamp: n as u32 * SAMPLES_PER_PACKET as u32,
                    payload_type: PAYLOAD_TYPE_L16_STEREO,
                    marker: false,
                    capture_timestamp: 0,
                },
                &payload,
            )
            .unwrap();
            if let Some(out) = encoder.push_source(&composed.buffer).unwrap() {
                repairs = out;
            }
            sources.push(composed);
        }

        for (n, source) in sources.into_iter().enumerate() {
            if n == 1 {
                continue; // lost on the wire
            }
            let mut parsed = Packet::new(PoolBuf::unpooled(source.buffer.to_vec()));
            rtp::parse(&mut parsed).unwrap();
            crate::fec::parse_source_trailer(&mut parsed).unwrap();
            session.route_source_packet(parsed, 0);
        }
        for repair in &repairs {
            let composed = compose_into(
                PoolBuf::unpooled(Vec::new()),
                RtpParams {
                    source_id: 0x77,
                    seqnum: 1000,
                    stream_timestamp: 0,
                    payload_type: crate::fec::PAYLOAD_TYPE_REPAIR_RS8M,
                    marker: false,
                    capture_timestamp: 0,
                },
                repair,
            )
            .unwrap();
            let mut parsed = Packet::new(PoolBuf::unpooled(composed.buffer.to_vec()));
            rtp::parse(&mut parsed).unwrap();
            crate::fec::parse_repair(&mut parsed).unwrap();
            session.route_repair_packet(parsed);
        }

        let frame = session.read_frame(SAMPLES_PER_PACKET * k as usize, 0);
        assert!(frame.has_flags(Frame::NOT_BLANK));
        // The lost packet was reconstructed, so playback has no hole.
        assert!(!frame.has_flags(Frame::NOT_COMPLETE));
        for &s in &frame.samples {
            assert!((s - 0.3).abs() < 1e-4);
        }
        assert_eq!(session.metrics().repaired_packets, 1);
        assert_eq!(session.metrics().late_drops, 0);
    }
}
