//! Session group: all sessions of one receiver slot.
//!
//! The group demultiplexes inbound packets to sessions, creates sessions on
//! admission, evicts them on BYE or timeout, runs the shared RTCP
//! participant and mixes session outputs into the slot's frame.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::audio::{Frame, Mixer};
use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use crate::fec::{self, FecScheme};
use crate::metrics::{ConnectionMetrics, SlotMetrics};
use crate::packet::{Packet, StreamSource};
use crate::rtcp::{Event, Participant};
use crate::rtp::{self, EncodingMap};
use crate::time::{unix_now, Nanos};

use super::router::{CnameOutcome, SessionId, SessionRouter};
use super::session::{Session, SessionConfig, SessionStatus};
use super::Interface;

/// Sessions, router, mixer and RTCP participant of one slot.
pub struct SessionGroup {
    config: ReceiverConfig,
    encoding_map: EncodingMap,
    fec_scheme: Option<FecScheme>,

    sessions: Vec<Option<Session>>,
    router: SessionRouter,
    mixer: Mixer,
    participant: Participant,

    /// Recently halted sources barred from re-admission until expiry.
    blacklist: HashMap<StreamSource, Nanos>,
    /// Destination for outbound control packets, learned from inbound RTCP.
    control_peer: Option<SocketAddr>,
    control_out: Vec<Vec<u8>>,
    bad_packets: u64,
}

impl SessionGroup {
    /// Creates an empty group.
    pub fn new(
        config: ReceiverConfig,
        encoding_map: EncodingMap,
        fec_scheme: Option<FecScheme>,
    ) -> Self {
        let mixer = Mixer::new(config.output_spec.num_channels());
        SessionGroup {
            config,
            encoding_map,
            fec_scheme,
            sessions: Vec::new(),
            router: SessionRouter::new(),
            mixer,
            participant: Participant::new(),
            blacklist: HashMap::new(),
            control_peer: None,
            control_out: Vec::new(),
            bad_packets: 0,
        }
    }

    /// Routes one inbound packet to its session (or the participant).
    pub fn route_packet(
        &mut self,
        iface: Interface,
        packet: Packet,
        now_mono: Nanos,
    ) -> Result<()> {
        match iface {
            Interface::AudioSource => self.route_source(packet, now_mono),
            Interface::AudioRepair => self.route_repair(packet, now_mono),
            Interface::AudioControl => self.route_control(packet, now_mono),
        }
    }

    fn route_source(&mut self, mut packet: Packet, now_mono: Nanos) -> Result<()> {
        if rtp::parse(&mut packet).is_err() {
            self.bad_packets += 1;
            return Err(Error::BadPacket);
        }
        if self.fec_scheme.is_some() && fec::parse_source_trailer(&mut packet).is_err() {
            self.bad_packets += 1;
            return Err(Error::BadPacket);
        }

        let (source_id, payload_type) = {
            let rtp = packet.rtp().expect("parsed above");
            (rtp.source_id, rtp.payload_type)
        };

        let session_id = match self.router.find_by_source(source_id) {
            Some(id) => id,
            None => self.create_session(source_id, payload_type, now_mono)?,
        };

        let encoding = match self.encoding_map.find(payload_type) {
            Some(encoding) => *encoding,
            None => {
                // Live session switched to a payload type we don't know.
                self.bad_packets += 1;
                return Err(Error::BadPacket);
            }
        };
        if rtp::apply_encoding(&mut packet, &encoding).is_err() {
            self.bad_packets += 1;
            return Err(Error::BadPacket);
        }

        if let Some(session) = self.session_mut(session_id) {
            session.route_source_packet(packet, now_mono);
        }
        Ok(())
    }

    fn route_repair(&mut self, mut packet: Packet, _now_mono: Nanos) -> Result<()> {
        if self.fec_scheme.is_none() {
            self.bad_packets += 1;
            return Err(Error::NoRoute);
        }
        if rtp::parse(&mut packet).is_err() || fec::parse_repair(&mut packet).is_err() {
            self.bad_packets += 1;
            return Err(Error::BadPacket);
        }
        let source_id = packet.rtp().expect("parsed above").source_id;

        // Repair packets never create sessions: the encoding is only known
        // from source packets.
        let Some(session_id) = self.router.find_by_source(source_id) else {
            return Err(Error::NoRoute);
        };
        if let Some(session) = self.session_mut(session_id) {
            session.route_repair_packet(packet);
        }
        Ok(())
    }

    fn route_control(&mut self, packet: Packet, now_mono: Nanos) -> Result<()> {
        if let Some(udp) = packet.udp.as_ref() {
            if let Some(src) = udp.src_addr {
                self.control_peer = Some(src);
            }
        }

        let events = match self.participant.consume(&packet.buffer) {
            Ok(events) => events,
            Err(code) => {
                self.bad_packets += 1;
                return Err(code);
            }
        };

        for event in events {
            match event {
                Event::SenderReport(sr) => {
                    if let Some(id) = self.router.find_by_source(sr.ssrc) {
                        let our_id = self.participant.source_id();
                        if let Some(session) = self.session_mut(id) {
                            session.on_sender_report(&sr, now_mono);
                            for report in &sr.reports {
                                if report.ssrc == our_id {
                                    session
                                        .tracker_mut()
                                        .record_reception_echo(report, unix_now());
                                }
                            }
                        }
                    }
                }
                Event::Cname { ssrc, cname } => {
                    if let Some(new_id) = self.participant.resolve_collision(ssrc) {
                        debug!(new_id, "group: local ssrc re-rolled after collision");
                    }
                    match self.router.learn_cname(ssrc, &cname) {
                        CnameOutcome::Bound(id) => {
                            if let Some(session) = self.session_mut(id) {
                                session.set_cname(&cname);
                            }
                        }
                        CnameOutcome::Relocated {
                            session: id,
                            old_source_id,
                        } => {
                            info!(
                                old_source_id,
                                new_source_id = ssrc,
                                "group: session followed cname to new ssrc"
                            );
                            if let Some(session) = self.session_mut(id) {
                                session.set_source_id(ssrc);
                                session.set_cname(&cname);
                            }
                        }
                        CnameOutcome::Noop => {}
                    }
                }
                Event::Bye { ssrc } => {
                    debug!(ssrc, "group: bye received");
                    self.halt_recv_stream(ssrc, now_mono);
                }
                Event::ReceptionEcho { .. } => {}
            }
        }
        Ok(())
    }

    fn create_session(
        &mut self,
        source_id: StreamSource,
        payload_type: u8,
        now_mono: Nanos,
    ) -> Result<SessionId> {
        if let Some(&expiry) = self.blacklist.get(&source_id) {
            if now_mono < expiry {
                return Err(Error::NoRoute);
            }
            self.blacklist.remove(&source_id);
        }
        if self.router.len() >= self.config.max_sessions {
            warn!(source_id, "group: slot full, refusing new source");
            return Err(Error::NoRoute);
        }
        let Some(encoding) = self.encoding_map.find(payload_type).copied() else {
            return Err(Error::NoRoute);
        };

        let session_config = SessionConfig {
            encoding,
            output_spec: self.config.output_spec,
            target_latency: self.config.target_latency,
            latency_profile: self.config.latency_profile,
            resampler_profile: self.config.resampler_profile,
            no_playback_timeout: self.config.no_playback_timeout,
            jitter_capacity: self.config.jitter_capacity,
            fec_scheme: self.fec_scheme,
        };
        let session = Session::new(source_id, session_config, now_mono)?;

        let id = match self.sessions.iter().position(|s| s.is_none()) {
            Some(slot) => {
                self.sessions[slot] = Some(session);
                slot
            }
            None => {
                self.sessions.push(Some(session));
                self.sessions.len() - 1
            }
        };
        self.router.add_session(id, source_id);
        info!(source_id, session = id, "group: session created");
        Ok(id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Removes the session of `source_id` (BYE or timeout path).
    pub fn halt_recv_stream(&mut self, source_id: StreamSource, now_mono: Nanos) {
        let Some(id) = self.router.find_by_source(source_id) else {
            return;
        };
        self.router.remove_session(id);
        if let Some(slot) = self.sessions.get_mut(id) {
            *slot = None;
        }
        self.blacklist
            .insert(source_id, now_mono + self.config.halt_blacklist_timeout);
        info!(source_id, session = id, "group: session removed");
    }

    /// Refreshes sessions and the RTCP schedule.
    ///
    /// Returns the deadline at which the loop must call again even without
    /// new packets.
    pub fn refresh_sessions(&mut self, now_mono: Nanos) -> Nanos {
        self.blacklist.retain(|_, &mut expiry| expiry > now_mono);

        let mut expired = Vec::new();
        let mut next_deadline = self.participant.next_deadline(now_mono);
        for slot in self.sessions.iter_mut() {
            if let Some(session) = slot {
                match session.refresh(now_mono) {
                    SessionStatus::Alive(deadline) => {
                        next_deadline = next_deadline.min(deadline);
                    }
                    SessionStatus::Expired => expired.push(session.source_id()),
                }
            }
        }
        for source_id in expired {
            self.halt_recv_stream(source_id, now_mono);
        }

        if self.participant.is_due(now_mono) {
            let mut reports = Vec::new();
            for slot in self.sessions.iter_mut() {
                if let Some(session) = slot {
                    reports.push(session.tracker_mut().make_report(now_mono));
                }
            }
            let compound = self.participant.make_receiver_compound(reports);
            self.control_out.push(compound);
            self.participant.schedule_next(now_mono);
            next_deadline = next_deadline.min(self.participant.next_deadline(now_mono));
        }

        next_deadline
    }

    /// Pops one outbound control compound, with its destination when known.
    pub fn poll_control_out(&mut self) -> Option<(Vec<u8>, Option<SocketAddr>)> {
        if self.control_out.is_empty() {
            return None;
        }
        Some((self.control_out.remove(0), self.control_peer))
    }

    /// Mixes all session outputs into one frame.
    pub fn read_frame(&mut self, len: usize, now_mono: Nanos) -> Frame {
        let mut inputs = Vec::with_capacity(self.router.len());
        for slot in self.sessions.iter_mut() {
            if let Some(session) = slot {
                inputs.push(session.read_frame(len, now_mono));
            }
        }
        self.mixer.mix(&inputs, len)
    }

    /// Aligns all sessions with the sink playback time.
    pub fn reclock_sessions(&mut self, playback_unix: Nanos) {
        for slot in self.sessions.iter_mut() {
            if let Some(session) = slot {
                session.reclock(playback_unix);
            }
        }
    }

    /// Number of live sessions.
    pub fn num_sessions(&self) -> usize {
        self.router.len()
    }

    /// Slot-wide metrics.
    pub fn slot_metrics(&self) -> SlotMetrics {
        SlotMetrics {
            connection_count: self.router.len(),
            is_complete: !self.router.is_empty(),
            bad_packets: self.bad_packets,
        }
    }

    /// Per-connection metrics, truncated to `max_sessions` entries.
    pub fn connection_metrics(&self, max_sessions: usize) -> Vec<ConnectionMetrics> {
        self.sessions
            .iter()
            .flatten()
            .take(max_sessions)
            .map(|session| session.metrics())
            .collect()
    }

    /// The group's RTCP participant.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Sets the FEC scheme for the slot's streams. Only valid before any
    /// session exists (the scheme is fixed by the endpoint binding).
    pub fn set_fec_scheme(&mut self, scheme: Option<FecScheme>) -> Result<()> {
        if !self.router.is_empty() {
            return Err(Error::BadOperation);
        }
        self.fec_scheme = scheme;
        Ok(())
    }

    /// FEC scheme currently configured.
    pub fn fec_scheme(&self) -> Option<FecScheme> {
        self.fec_scheme
    }

    /// Where outbound control packets go, once a remote reported in.
    pub fn control_peer(&self) -> Option<SocketAddr> {
        self.control_peer
    }
}
