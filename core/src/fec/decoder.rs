//! Receiver-side block FEC decoder.

use std::collections::{HashMap, VecDeque};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use super::{block_lt, decode_block, FecScheme, PAYLOAD_ID_LEN};
use crate::error::{Error, Result};
use crate::packet::pool::PoolBuf;
use crate::packet::Packet;
use crate::rtp;

/// Default distance (in blocks) behind the newest block before a block is
/// given up on.
pub const DEFAULT_MAX_BLOCK_DISTANCE: u16 = 16;

struct BlockState {
    source_block_len: u16,
    repair_block_len: u16,
    shards: Vec<Option<Vec<u8>>>,
    present: usize,
    decoded: bool,
}

/// Reassembles FEC blocks and reconstructs lost source packets.
///
/// Source packets pass through immediately (the jitter buffer downstream
/// re-orders); reconstructed packets surface as soon as a block becomes
/// decodable, marked [`Packet::FLAG_RESTORED`]. Blocks that fall more than
/// `max_block_distance` behind the newest seen block are flushed, so
/// uncorrectable losses propagate as gaps instead of pinning memory.
pub struct BlockDecoder {
    scheme: FecScheme,
    max_block_distance: u16,
    blocks: HashMap<u16, BlockState>,
    newest_block: Option<u16>,
    ready: VecDeque<Packet>,
    repaired: u64,
    bad_packets: u64,
}

impl BlockDecoder {
    /// Creates a decoder for one stream.
    pub fn new(scheme: FecScheme) -> Result<Self> {
        if !scheme.is_supported() {
            return Err(Error::BadOperation);
        }
        Ok(BlockDecoder {
            scheme,
            max_block_distance: DEFAULT_MAX_BLOCK_DISTANCE,
            blocks: HashMap::new(),
            newest_block: None,
            ready: VecDeque::new(),
            repaired: 0,
            bad_packets: 0,
        })
    }

    /// Packets reconstructed so far.
    pub fn repaired_count(&self) -> u64 {
        self.repaired
    }

    /// Malformed FEC packets dropped so far.
    pub fn bad_packets(&self) -> u64 {
        self.bad_packets
    }

    /// Feeds a source packet (RTP and FEC views parsed). The packet itself
    /// is immediately available through [`BlockDecoder::fetch`].
    pub fn push_source(&mut self, packet: Packet) {
        let Some(fec) = packet.fec else {
            // FEC-untagged packet on a protected stream: pass through.
            self.ready.push_back(packet);
            return;
        };

        let mut shard = Vec::with_capacity(packet.buffer.len() + 2);
        shard.extend_from_slice(&(packet.buffer.len() as u16).to_be_bytes());
        shard.extend_from_slice(&packet.buffer);

        self.store_shard(fec.block_id, fec.index, fec, shard);
        self.ready.push_back(packet);
        self.try_decode(fec.block_id);
    }

    /// Feeds a repair packet (RTP and FEC views parsed). Repair packets
    /// never surface downstream.
    pub fn push_repair(&mut self, packet: Packet) {
        let Some(fec) = packet.fec else {
            self.bad_packets += 1;
            return;
        };
        let shard = match packet.rtp_payload() {
            Ok(payload) if payload.len() > PAYLOAD_ID_LEN => {
                payload[PAYLOAD_ID_LEN..].to_vec()
            }
            _ => {
                self.bad_packets += 1;
                return;
            }
        };
        self.store_shard(fec.block_id, fec.index, fec, shard);
        self.try_decode(fec.block_id);
    }

    /// Pops the next available packet (received or reconstructed).
    pub fn fetch(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }

    fn store_shard(
        &mut self,
        block_id: u16,
        index: u16,
        fec: crate::packet::FecView,
        shard: Vec<u8>,
    ) {
        self.flush_old(block_id);

        // A block that already fell behind the window is not re-opened.
        if let Some(newest) = self.newest_block {
            if block_lt(block_id, newest)
                && newest.wrapping_sub(block_id) > self.max_block_distance
            {
                self.bad_packets += 1;
                return;
            }
        }

        let total = fec.source_block_len as usize + fec.repair_block_len as usize;
        let state = self.blocks.entry(block_id).or_insert_with(|| BlockState {
            source_block_len: fec.source_block_len,
            repair_block_len: fec.repair_block_len,
            shards: vec![None; total],
            present: 0,
            decoded: false,
        });

        if state.decoded {
            // Late shards for an already decoded block carry nothing new.
            return;
        }
        if state.source_block_len != fec.source_block_len
            || state.repair_block_len != fec.repair_block_len
            || (index as usize) >= state.shards.len()
        {
            warn!(block_id, index, "fec: inconsistent block geometry");
            self.bad_packets += 1;
            return;
        }
        if state.shards[index as usize].is_none() {
            state.shards[index as usize] = Some(shard);
            state.present += 1;
        }
    }

    fn try_decode(&mut self, block_id: u16) {
        let Some(state) = self.blocks.get_mut(&block_id) else {
            return;
        };
        let k = state.source_block_len as usize;
        let m = state.repair_block_len as usize;
        if state.decoded || state.present < k {
            return;
        }

        let missing: Vec<usize> = (0..k).filter(|&i| state.shards[i].is_none()).collect();
        if missing.is_empty() {
            state.decoded = true;
            state.shards.clear();
            return;
        }

        let mut shards = std::mem::take(&mut state.shards);
        if let Err(code) = decode_block(self.scheme, k, m, &mut shards) {
            // Non-MDS schemes may still succeed once more shards arrive.
            debug!(block_id, %code, "fec: block decode failed");
            if let Some(state) = self.blocks.get_mut(&block_id) {
                state.shards = shards;
            }
            return;
        }
        if let Some(state) = self.blocks.get_mut(&block_id) {
            state.decoded = true;
        }

        for index in missing {
            match Self::rebuild_packet(shards[index].take()) {
                Ok(packet) => {
                    self.repaired += 1;
                    debug!(block_id, index, "fec: packet reconstructed");
                    self.ready.push_back(packet);
                }
                Err(code) => {
                    warn!(block_id, index, %code, "fec: reconstructed bytes unusable");
                    self.bad_packets += 1;
                }
            }
        }
    }

    fn rebuild_packet(shard: Option<Vec<u8>>) -> Result<Packet> {
        let shard = shard.ok_or(Error::BadPacket)?;
        if shard.len() < 2 {
            return Err(Error::BadPacket);
        }
        let len = BigEndian::read_u16(&shard[0..2]) as usize;
        let bytes = shard.get(2..2 + len).ok_or(Error::BadPacket)?;

        let mut packet = Packet::new(PoolBuf::unpooled(bytes.to_vec()));
        rtp::parse(&mut packet)?;
        super::parse_source_trailer(&mut packet)?;
        packet.add_flags(Packet::FLAG_RESTORED);
        Ok(packet)
    }

    fn flush_old(&mut self, incoming: u16) {
        let newest = match self.newest_block {
            Some(newest) if block_lt(newest, incoming) => {
                self.newest_block = Some(incoming);
                incoming
            }
            Some(newest) => newest,
            None => {
                self.newest_block = Some(incoming);
                incoming
            }
        };

        self.blocks.retain(|&id, state| {
            let keep =
                !block_lt(id, newest) || newest.wrapping_sub(id) <= self.max_block_distance;
            if !keep && !state.decoded {
                debug!(block_id = id, "fec: flushing stale block");
            }
            keep
        });
    }
}
