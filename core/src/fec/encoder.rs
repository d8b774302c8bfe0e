//! Sender-side block FEC encoder.

use tracing::debug;

use super::{encode_block, FecScheme, PayloadId, PAYLOAD_ID_LEN};
use crate::error::{Error, Result};

/// Groups outgoing source packets into blocks and derives repair payloads.
///
/// The caller appends [`BlockEncoder::next_payload_id`] as a payload trailer
/// before composing each source packet, then feeds the composed bytes to
/// [`BlockEncoder::push_source`]. When a block fills up the encoder returns
/// the repair packet payloads (payload ID header included) ready to ship on
/// the repair endpoint.
pub struct BlockEncoder {
    scheme: FecScheme,
    source_block_len: u16,
    repair_block_len: u16,
    cur_block: u16,
    next_index: u16,
    shards: Vec<Vec<u8>>,
}

impl BlockEncoder {
    /// Creates an encoder emitting `repair_block_len` repair packets per
    /// `source_block_len` source packets.
    pub fn new(scheme: FecScheme, source_block_len: u16, repair_block_len: u16) -> Result<Self> {
        if source_block_len == 0 || repair_block_len == 0 {
            return Err(Error::BadOperation);
        }
        if !scheme.is_supported() {
            debug!(?scheme, "fec: scheme not compiled in");
            return Err(Error::BadOperation);
        }
        Ok(BlockEncoder {
            scheme,
            source_block_len,
            repair_block_len,
            cur_block: 0,
            next_index: 0,
            shards: Vec::with_capacity(source_block_len as usize),
        })
    }

    /// Payload ID the next source packet must carry as its trailer.
    pub fn next_payload_id(&self) -> PayloadId {
        PayloadId {
            block_id: self.cur_block,
            index: self.next_index,
            source_block_len: self.source_block_len,
            repair_block_len: self.repair_block_len,
        }
    }

    /// Feeds the composed bytes of the source packet just shipped. On block
    /// completion returns one payload per repair packet.
    pub fn push_source(&mut self, packet_bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let mut shard = Vec::with_capacity(packet_bytes.len() + 2);
        shard.extend_from_slice(&(packet_bytes.len() as u16).to_be_bytes());
        shard.extend_from_slice(packet_bytes);
        self.shards.push(shard);
        self.next_index += 1;

        if self.next_index < self.source_block_len {
            return Ok(None);
        }

        let k = self.source_block_len as usize;
        let m = self.repair_block_len as usize;
        let mut shards = std::mem::take(&mut self.shards);
        encode_block(self.scheme, k, m, &mut shards)?;

        let mut repairs = Vec::with_capacity(m);
        for (i, shard) in shards.drain(..).skip(k).enumerate() {
            let id = PayloadId {
                block_id: self.cur_block,
                index: self.source_block_len + i as u16,
                source_block_len: self.source_block_len,
                repair_block_len: self.repair_block_len,
            };
            let mut payload = Vec::with_capacity(PAYLOAD_ID_LEN + shard.len());
            id.encode(&mut payload);
            payload.extend_from_slice(&shard);
            repairs.push(payload);
        }

        debug!(
            block = self.cur_block,
            repairs = repairs.len(),
            "fec: block complete"
        );
        self.cur_block = self.cur_block.wrapping_add(1);
        self.next_index = 0;
        self.shards = Vec::with_capacity(k);
        Ok(Some(repairs))
    }
}
