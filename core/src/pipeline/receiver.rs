//! Receiver source: slots, endpoint queues and the mixed PCM output.

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::audio::{Frame, Mixer};
use crate::config::ReceiverConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fec::FecScheme;
use crate::metrics::{ConnectionMetrics, SlotMetrics};
use crate::packet::{Packet, UdpView};
use crate::rtp::EncodingMap;
use crate::time::Nanos;

use super::group::SessionGroup;
use super::pipeline_loop::PipelineState;
use super::Interface;

/// Identifies one receiver slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(usize);

/// Channel pair handed to the I/O layer for one bound endpoint.
///
/// I/O threads push received packets into `inbound_tx` (many producers, one
/// pipeline consumer) and drain `outbound_rx` into the socket.
#[derive(Debug)]
pub struct EndpointQueues {
    /// Inbound packets: I/O thread to pipeline.
    pub inbound_tx: Sender<Packet>,
    /// Outbound packets: pipeline to I/O thread.
    pub outbound_rx: Receiver<Packet>,
}

struct Endpoint {
    inbound_rx: Receiver<Packet>,
    outbound_tx: Sender<Packet>,
    /// Clone kept for codec-mode reads.
    outbound_rx: Receiver<Packet>,
}

struct ReceiverSlot {
    group: SessionGroup,
    endpoints: [Option<Endpoint>; 3],
}

/// The receiver pipeline: routes packets into session groups and produces
/// one continuous PCM stream.
pub struct ReceiverSource {
    config: ReceiverConfig,
    context: Context,
    encoding_map: EncodingMap,
    mixer: Mixer,
    slots: Vec<Option<ReceiverSlot>>,
}

impl ReceiverSource {
    /// Creates a receiver with no slots.
    pub fn new(config: ReceiverConfig, encoding_map: EncodingMap, context: Context) -> Self {
        let mixer = Mixer::new(config.output_spec.num_channels());
        ReceiverSource {
            config,
            context,
            encoding_map,
            mixer,
            slots: Vec::new(),
        }
    }

    /// Creates a slot; endpoints are bound afterwards.
    pub fn create_slot(&mut self) -> SlotId {
        let slot = ReceiverSlot {
            group: SessionGroup::new(
                self.config.clone(),
                self.encoding_map.clone(),
                None,
            ),
            endpoints: [None, None, None],
        };
        let id = match self.slots.iter().position(|s| s.is_none()) {
            Some(free) => {
                self.slots[free] = Some(slot);
                free
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        info!(slot = id, "receiver: slot created");
        SlotId(id)
    }

    /// Tears a slot down, emitting a BYE when a control endpoint is bound
    /// and a peer is known.
    pub fn delete_slot(&mut self, slot: SlotId) -> Result<()> {
        let state = self.slot_mut(slot)?;
        let peer = state.group.control_peer();
        if let (Some(endpoint), Some(peer)) =
            (&state.endpoints[Interface::AudioControl as usize], peer)
        {
            let bye = state.group.participant().make_bye_compound("teardown");
            let mut packet = Packet::new(crate::packet::pool::PoolBuf::unpooled(bye));
            packet.udp = Some(UdpView {
                src_addr: None,
                dst_addr: Some(peer),
            });
            packet.add_flags(Packet::FLAG_UDP);
            let _ = endpoint.outbound_tx.send(packet);
        }
        self.slots[slot.0] = None;
        info!(slot = slot.0, "receiver: slot deleted");
        Ok(())
    }

    /// Binds an interface of a slot, returning the queues for the I/O layer.
    ///
    /// `fec_scheme` comes from the endpoint protocol (e.g. `rtp+rs8m`); it
    /// must agree between the source and repair interfaces of one slot.
    pub fn bind(
        &mut self,
        slot: SlotId,
        iface: Interface,
        fec_scheme: Option<FecScheme>,
    ) -> Result<EndpointQueues> {
        let state = self.slot_mut(slot)?;
        if state.endpoints[iface as usize].is_some() {
            return Err(Error::BadOperation);
        }
        if let Some(scheme) = fec_scheme {
            if !scheme.is_supported() {
                return Err(Error::BadOperation);
            }
            match state.group.fec_scheme() {
                Some(existing) if existing != scheme => return Err(Error::BadOperation),
                Some(_) => {}
                None => state.group.set_fec_scheme(Some(scheme))?,
            }
        } else if iface == Interface::AudioRepair {
            // A repair endpoint without a FEC scheme is meaningless.
            return Err(Error::BadOperation);
        }

        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        state.endpoints[iface as usize] = Some(Endpoint {
            inbound_rx,
            outbound_tx,
            outbound_rx: outbound_rx.clone(),
        });
        debug!(slot = slot.0, ?iface, "receiver: interface bound");
        Ok(EndpointQueues {
            inbound_tx,
            outbound_rx,
        })
    }

    /// Codec-mode write: feeds a packet directly into a bound interface.
    pub fn write_packet(
        &mut self,
        slot: SlotId,
        iface: Interface,
        packet: Packet,
        now_mono: Nanos,
    ) -> Result<()> {
        let state = self.slot_mut(slot)?;
        if state.endpoints[iface as usize].is_none() {
            return Err(Error::NotFound);
        }
        state.group.route_packet(iface, packet, now_mono)
    }

    /// Codec-mode read: pops an outbound packet from a bound interface.
    /// Only the control interface produces outbound packets on a receiver.
    pub fn read_packet(&mut self, slot: SlotId, iface: Interface) -> Result<Packet> {
        let state = self.slot_mut(slot)?;
        let Some(endpoint) = &state.endpoints[iface as usize] else {
            return Err(Error::NotFound);
        };
        if iface != Interface::AudioControl {
            return Err(Error::BadOperation);
        }
        endpoint.outbound_rx.try_recv().map_err(|_| Error::NoData)
    }

    /// Drains inbound queues, refreshes sessions, emits control traffic.
    /// Returns the next deadline the loop must honor.
    pub fn process(&mut self, now_mono: Nanos) -> Nanos {
        let mut next_deadline = Nanos::MAX;

        for slot in self.slots.iter_mut().flatten() {
            // Drain every bound interface's inbound queue.
            for iface in [
                Interface::AudioSource,
                Interface::AudioRepair,
                Interface::AudioControl,
            ] {
                let Some(endpoint) = &slot.endpoints[iface as usize] else {
                    continue;
                };
                let rx = endpoint.inbound_rx.clone();
                while let Ok(packet) = rx.try_recv() {
                    if let Err(code) = slot.group.route_packet(iface, packet, now_mono) {
                        debug!(%code, ?iface, "receiver: packet not routed");
                    }
                }
            }

            next_deadline = next_deadline.min(slot.group.refresh_sessions(now_mono));

            // Ship pending control compounds.
            while let Some((compound, peer)) = slot.group.poll_control_out() {
                let Some(endpoint) = &slot.endpoints[Interface::AudioControl as usize]
                else {
                    break;
                };
                let Some(peer) = peer else {
                    // No known peer yet; drop and retry after the next
                    // inbound report.
                    continue;
                };
                let mut buf = match self.context.packet_pool.allocate() {
                    Some(buf) => buf,
                    None => {
                        warn!("receiver: packet pool exhausted, control report dropped");
                        continue;
                    }
                };
                buf.extend_from_slice(&compound);
                let mut packet = Packet::new(buf);
                packet.udp = Some(UdpView {
                    src_addr: None,
                    dst_addr: Some(peer),
                });
                packet.add_flags(Packet::FLAG_UDP);
                let _ = endpoint.outbound_tx.send(packet);
            }
        }

        next_deadline
    }

    /// Produces the next output frame of `len` per-channel samples, mixing
    /// every slot's sessions.
    pub fn read_frame(&mut self, len: usize, now_mono: Nanos) -> Frame {
        let mut inputs = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            inputs.push(slot.group.read_frame(len, now_mono));
        }
        self.mixer.mix(&inputs, len)
    }

    /// Like [`ReceiverSource::read_frame`], but maps the mixed samples into
    /// the output spec's wire format for byte-oriented sinks. Returns the
    /// frame's flags and capture timestamp.
    pub fn read_frame_bytes(
        &mut self,
        len: usize,
        now_mono: Nanos,
        out: &mut Vec<u8>,
    ) -> (u8, Nanos) {
        let frame = self.read_frame(len, now_mono);
        crate::audio::pcm::encode_samples(
            self.config.output_spec.format,
            &frame.samples,
            out,
        );
        (frame.flags(), frame.capture_timestamp)
    }

    /// Aligns session clocks with the actual playback time of the last
    /// frame's first sample.
    pub fn reclock(&mut self, playback_unix: Nanos) {
        for slot in self.slots.iter_mut().flatten() {
            slot.group.reclock_sessions(playback_unix);
        }
    }

    /// Metrics for one slot, connection list truncated at `max_sessions`.
    pub fn query_metrics(
        &self,
        slot: SlotId,
        max_sessions: usize,
    ) -> Result<(SlotMetrics, Vec<ConnectionMetrics>)> {
        let state = self.slot_ref(slot)?;
        Ok((
            state.group.slot_metrics(),
            state.group.connection_metrics(max_sessions),
        ))
    }

    /// Whether the slot has at least one established session.
    pub fn is_complete(&self, slot: SlotId) -> Result<bool> {
        Ok(self.slot_ref(slot)?.group.slot_metrics().is_complete)
    }

    /// Number of sessions across all slots.
    pub fn num_sessions(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.group.num_sessions())
            .sum()
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut ReceiverSlot> {
        self.slots
            .get_mut(slot.0)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)
    }

    fn slot_ref(&self, slot: SlotId) -> Result<&ReceiverSlot> {
        self.slots
            .get(slot.0)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound)
    }
}

impl PipelineState for ReceiverSource {
    fn process(&mut self, now_mono: Nanos) -> Nanos {
        ReceiverSource::process(self, now_mono)
    }
}
