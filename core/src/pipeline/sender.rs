//! Sender sink: packetization, FEC encoding, shipping and RTCP emission.

use std::collections::HashMap;
use std::net::SocketAddr;

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audio::pcm::{self, ChannelMapper};
use crate::config::SenderConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fec::{self, BlockEncoder};
use crate::metrics::{ConnectionMetrics, SlotMetrics};
use crate::packet::{Packet, StreamSource, UdpView};
use crate::rtcp::{Event, Participant, ReceptionReport, SendState};
use crate::rtp::{self, Encoding, EncodingMap, RtpParams};
use crate::time::{mono_now, unix_now, Nanos, SECOND};

use super::Interface;

/// Channel pair handed to the I/O layer for one sender endpoint.
pub struct SenderEndpointQueues {
    /// Outbound packets: pipeline to I/O thread.
    pub outbound_rx: Receiver<Packet>,
    /// Inbound packets (control interface only): I/O thread to pipeline.
    pub inbound_tx: Sender<Packet>,
}

struct SenderEndpoint {
    outbound_tx: Sender<Packet>,
    /// Clone kept for codec-mode reads.
    outbound_rx: Receiver<Packet>,
    inbound_rx: Receiver<Packet>,
    dest: Option<SocketAddr>,
}

/// A remote receiver known through its receiver reports.
struct RemotePeer {
    last_report: ReceptionReport,
    rtt_ns: Nanos,
    last_activity_mono: Nanos,
}

/// One sender slot: turns PCM frames into a shipped packet stream.
pub struct SenderSink {
    config: SenderConfig,
    context: Context,
    encoding: Encoding,
    participant: Participant,

    endpoints: [Option<SenderEndpoint>; 3],

    mapper: ChannelMapper,
    samples_per_packet: usize,
    pending: Vec<f32>,
    seqnum: u16,
    stream_ts: u32,
    /// Capture timestamp of the first pending sample; 0 until known.
    cur_ct: Nanos,

    fec: Option<BlockEncoder>,
    repair_seqnum: u16,

    send_state: SendState,
    peers: HashMap<StreamSource, RemotePeer>,
}

impl SenderSink {
    /// Creates a sender for the configured packet encoding.
    pub fn new(
        config: SenderConfig,
        encoding_map: &EncodingMap,
        context: Context,
    ) -> Result<Self> {
        let encoding = *encoding_map
            .find(config.packet_encoding)
            .ok_or(Error::BadOperation)?;
        let samples_per_packet = encoding
            .spec
            .ns_to_samples(config.packet_length)
            .max(1) as usize;

        let fec = match &config.fec {
            Some(fec_config) => Some(BlockEncoder::new(
                fec_config.scheme,
                fec_config.source_block_len,
                fec_config.repair_block_len,
            )?),
            None => None,
        };

        let mut rng = rand::thread_rng();
        let mapper = ChannelMapper::new(config.input_spec.layout, encoding.spec.layout);

        info!(
            payload_type = encoding.payload_type,
            samples_per_packet,
            fec = config.fec.is_some(),
            "sender: created"
        );

        Ok(SenderSink {
            config,
            context,
            encoding,
            participant: Participant::new(),
            endpoints: [None, None, None],
            mapper,
            samples_per_packet,
            pending: Vec::new(),
            seqnum: rng.gen(),
            stream_ts: rng.gen(),
            cur_ct: 0,
            fec,
            repair_seqnum: rng.gen(),
            send_state: SendState::default(),
            peers: HashMap::new(),
        })
    }

    /// Binds an interface, returning the queues for the I/O layer.
    pub fn bind(&mut self, iface: Interface) -> Result<SenderEndpointQueues> {
        if self.endpoints[iface as usize].is_some() {
            return Err(Error::BadOperation);
        }
        if iface == Interface::AudioRepair && self.fec.is_none() {
            return Err(Error::BadOperation);
        }
        let (outbound_tx, outbound_rx) = unbounded();
        let (inbound_tx, inbound_rx) = unbounded();
        self.endpoints[iface as usize] = Some(SenderEndpoint {
            outbound_tx,
            outbound_rx: outbound_rx.clone(),
            inbound_rx,
            dest: None,
        });
        debug!(?iface, "sender: interface bound");
        Ok(SenderEndpointQueues {
            outbound_rx,
            inbound_tx,
        })
    }

    /// Connects a bound interface to a destination address.
    pub fn connect(&mut self, iface: Interface, dest: SocketAddr) -> Result<()> {
        match &mut self.endpoints[iface as usize] {
            Some(endpoint) => {
                endpoint.dest = Some(dest);
                info!(?iface, %dest, "sender: interface connected");
                Ok(())
            }
            None => Err(Error::BadOperation),
        }
    }

    /// True once every bound interface is connected (and the mandatory
    /// source interface exists).
    pub fn is_complete(&self) -> bool {
        let source_ok = matches!(
            &self.endpoints[Interface::AudioSource as usize],
            Some(endpoint) if endpoint.dest.is_some()
        );
        source_ok
            && self
                .endpoints
                .iter()
                .flatten()
                .all(|endpoint| endpoint.dest.is_some())
    }

    /// Writes interleaved PCM at the input spec.
    ///
    /// `capture_ts` is the capture time of the first sample, 0 when the
    /// caller has no capture clock (the sender then stamps its own).
    pub fn write_frame(&mut self, samples: &[f32], capture_ts: Nanos) -> Result<()> {
        if self.endpoints[Interface::AudioSource as usize].is_none() {
            return Err(Error::BadOperation);
        }

        let in_ch = self.config.input_spec.num_channels() as usize;
        debug_assert!(samples.len() % in_ch == 0);

        if capture_ts != 0 {
            let pending_frames =
                (self.pending.len() / self.encoding.spec.num_channels() as usize) as u64;
            self.cur_ct = capture_ts - self.encoding.spec.samples_to_ns(pending_frames);
        } else if self.cur_ct == 0 {
            self.cur_ct = unix_now();
        }

        let mapped = self.mapper.map(samples);
        self.pending.extend_from_slice(mapped);

        while self.pending.len()
            >= self.samples_per_packet * self.encoding.spec.num_channels() as usize
        {
            self.flush_packet()?;
        }
        Ok(())
    }

    fn flush_packet(&mut self) -> Result<()> {
        let ch = self.encoding.spec.num_channels() as usize;
        let take = self.samples_per_packet * ch;
        let chunk: Vec<f32> = self.pending.drain(..take).collect();

        let mut payload = Vec::with_capacity(self.encoding.spec.frames_size(
            self.samples_per_packet,
        ));
        pcm::encode_samples(self.encoding.spec.format, &chunk, &mut payload);
        if let Some(encoder) = &self.fec {
            encoder.next_payload_id().encode(&mut payload);
        }

        let params = RtpParams {
            source_id: self.participant.source_id(),
            seqnum: self.seqnum,
            stream_timestamp: self.stream_ts,
            payload_type: self.encoding.payload_type,
            marker: false,
            capture_timestamp: self.cur_ct,
        };
        let packet = rtp::compose(&self.context.packet_pool, params, &payload)?;

        let repairs = match &mut self.fec {
            Some(encoder) => encoder.push_source(&packet.buffer)?,
            None => None,
        };

        self.send_state.packet_count = self.send_state.packet_count.wrapping_add(1);
        self.send_state.octet_count = self
            .send_state
            .octet_count
            .wrapping_add(payload.len() as u32);
        self.send_state.rtp_timestamp = self.stream_ts;

        self.seqnum = self.seqnum.wrapping_add(1);
        self.stream_ts = self.stream_ts.wrapping_add(self.samples_per_packet as u32);
        self.cur_ct += self
            .encoding
            .spec
            .samples_to_ns(self.samples_per_packet as u64);

        self.ship(Interface::AudioSource, packet)?;

        if let Some(repairs) = repairs {
            for repair in repairs {
                let params = RtpParams {
                    source_id: self.participant.source_id(),
                    seqnum: self.repair_seqnum,
                    stream_timestamp: self.stream_ts,
                    payload_type: fec::repair_payload_type(
                        self.config.fec.as_ref().expect("fec configured").scheme,
                    ),
                    marker: false,
                    capture_timestamp: 0,
                };
                self.repair_seqnum = self.repair_seqnum.wrapping_add(1);
                let packet = rtp::compose(&self.context.packet_pool, params, &repair)?;
                self.ship(Interface::AudioRepair, packet)?;
            }
        }
        Ok(())
    }

    /// Stamps the destination address and hands the packet to the endpoint
    /// queue. The packet must already be composed.
    fn ship(&mut self, iface: Interface, mut packet: Packet) -> Result<()> {
        assert!(
            packet.has_flags(Packet::FLAG_PREPARED | Packet::FLAG_COMPOSED),
            "sender: shipping an uncomposed packet"
        );
        let Some(endpoint) = &self.endpoints[iface as usize] else {
            return Err(Error::NotFound);
        };
        let udp = packet.udp.get_or_insert(UdpView::default());
        if udp.dst_addr.is_none() {
            udp.dst_addr = endpoint.dest;
        }
        if !packet.has_flags(Packet::FLAG_UDP) {
            packet.add_flags(Packet::FLAG_UDP);
        }
        endpoint
            .outbound_tx
            .send(packet)
            .map_err(|_| Error::BadOperation)
    }

    /// Drains inbound control traffic and emits periodic sender reports.
    /// Returns the next deadline.
    pub fn process(&mut self, now_mono: Nanos) -> Nanos {
        // Consume receiver reports from the control interface.
        if let Some(endpoint) = &self.endpoints[Interface::AudioControl as usize] {
            let rx = endpoint.inbound_rx.clone();
            while let Ok(packet) = rx.try_recv() {
                if let Err(code) = self.consume_control(&packet, now_mono) {
                    debug!(%code, "sender: bad control packet");
                }
            }
        }

        // Forget peers that stopped reporting.
        self.peers
            .retain(|_, peer| now_mono - peer.last_activity_mono < 30 * SECOND);

        if self.participant.is_due(now_mono) {
            let compound = self.participant.make_sender_compound(
                unix_now(),
                self.send_state,
                Vec::new(),
            );
            match self.make_control_packet(compound) {
                Ok(Some(packet)) => {
                    let _ = self.ship(Interface::AudioControl, packet);
                    self.participant.schedule_next(now_mono);
                }
                Ok(None) => {} // control interface not bound
                Err(_) => {
                    // Dropped; retried at the next tick.
                    warn!("sender: control report dropped");
                }
            }
        }
        self.participant.next_deadline(now_mono)
    }

    fn make_control_packet(&mut self, compound: Vec<u8>) -> Result<Option<Packet>> {
        if self.endpoints[Interface::AudioControl as usize].is_none() {
            return Ok(None);
        }
        let mut buf = self.context.packet_pool.allocate().ok_or(Error::NoMem)?;
        buf.extend_from_slice(&compound);
        let mut packet = Packet::new(buf);
        packet.add_flags(Packet::FLAG_PREPARED | Packet::FLAG_COMPOSED);
        Ok(Some(packet))
    }

    fn consume_control(&mut self, packet: &Packet, now_mono: Nanos) -> Result<()> {
        let events = self.participant.consume(&packet.buffer)?;
        for event in events {
            match event {
                Event::ReceptionEcho { reporter, report } => {
                    let peer = self.peers.entry(reporter).or_insert_with(|| RemotePeer {
                        last_report: report,
                        rtt_ns: 0,
                        last_activity_mono: now_mono,
                    });
                    peer.last_report = report;
                    peer.last_activity_mono = now_mono;
                    if let Some(rtt) = crate::rtcp::rtt_from_echo(&report, unix_now()) {
                        peer.rtt_ns = rtt;
                    }
                }
                Event::Bye { ssrc } => {
                    self.peers.remove(&ssrc);
                }
                Event::Cname { .. } | Event::SenderReport(_) => {}
            }
        }
        Ok(())
    }

    /// Announces departure: ships a BYE compound on the control interface.
    /// Call once before dropping the sender.
    pub fn close(&mut self) {
        let compound = self.participant.make_bye_compound("sender closed");
        match self.make_control_packet(compound) {
            Ok(Some(packet)) => {
                let _ = self.ship(Interface::AudioControl, packet);
            }
            Ok(None) => {}
            Err(_) => warn!("sender: bye dropped"),
        }
    }

    /// Codec-mode read: pops the next outbound packet of an interface.
    pub fn read_packet(&mut self, iface: Interface) -> Result<Packet> {
        let Some(endpoint) = &self.endpoints[iface as usize] else {
            return Err(Error::NotFound);
        };
        endpoint.outbound_rx.try_recv().map_err(|_| Error::NoData)
    }

    /// Codec-mode write: feeds an inbound packet. Only the control interface
    /// accepts writes.
    pub fn write_packet(&mut self, iface: Interface, packet: Packet) -> Result<()> {
        if self.endpoints[iface as usize].is_none() {
            return Err(Error::NotFound);
        }
        if iface != Interface::AudioControl {
            return Err(Error::BadOperation);
        }
        self.consume_control(&packet, mono_now())
    }

    /// Slot metrics.
    pub fn slot_metrics(&self) -> SlotMetrics {
        SlotMetrics {
            connection_count: self.peers.len(),
            is_complete: self.is_complete(),
            bad_packets: 0,
        }
    }

    /// Per-peer metrics derived from receiver reports.
    pub fn connection_metrics(&self, max_sessions: usize) -> Vec<ConnectionMetrics> {
        self.peers
            .iter()
            .take(max_sessions)
            .map(|(&reporter, peer)| ConnectionMetrics {
                source_id: reporter,
                cname: None,
                packet_loss_rate: peer.last_report.fraction_lost as f64 / 256.0,
                jitter_ns: self
                    .encoding
                    .spec
                    .samples_to_ns(peer.last_report.jitter as u64),
                rtt_ns: peer.rtt_ns,
                ..Default::default()
            })
            .collect()
    }

    /// The sender's RTCP participant.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }
}

impl super::pipeline_loop::PipelineState for SenderSink {
    fn process(&mut self, now_mono: Nanos) -> Nanos {
        SenderSink::process(self, now_mono)
    }
}
