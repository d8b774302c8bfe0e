//! Wrap-aware sorted packet queue.
//!
//! Packets are kept ordered by stream timestamp with wrap-aware comparison,
//! duplicates are dropped by sequence number, and a capacity bound protects
//! against unbounded buildup from a misbehaving sender.

use std::collections::VecDeque;

use tracing::debug;

use super::{ts_lt, Packet, StreamTimestamp};

/// Reorder queue sorted by stream timestamp.
#[derive(Debug)]
pub struct SortedQueue {
    packets: VecDeque<Packet>,
    capacity: usize,
    dup_drops: u64,
    overflow_drops: u64,
}

impl SortedQueue {
    /// Creates a queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        SortedQueue {
            packets: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dup_drops: 0,
            overflow_drops: 0,
        }
    }

    /// Inserts a packet at its timestamp position.
    ///
    /// Duplicates (same sequence number as a queued packet) are dropped. When
    /// the queue is full the oldest packet is discarded to make room, which
    /// surfaces downstream as a gap.
    pub fn push(&mut self, packet: Packet) {
        let rtp = match packet.rtp.as_ref() {
            Some(rtp) => rtp,
            None => return,
        };
        let (ts, seq) = (rtp.stream_timestamp, rtp.seqnum);

        if self
            .packets
            .iter()
            .any(|p| p.rtp.as_ref().map(|r| r.seqnum) == Some(seq))
        {
            self.dup_drops += 1;
            debug!(seqnum = seq, "queue: dropping duplicate packet");
            return;
        }

        // Packets usually arrive in order; scan from the back.
        let mut pos = self.packets.len();
        while pos > 0 {
            let prev_ts = self.packets[pos - 1]
                .rtp
                .as_ref()
                .map(|r| r.stream_timestamp)
                .unwrap_or(ts);
            if !ts_lt(ts, prev_ts) {
                break;
            }
            pos -= 1;
        }
        self.packets.insert(pos, packet);

        if self.packets.len() > self.capacity {
            self.packets.pop_front();
            self.overflow_drops += 1;
            debug!(capacity = self.capacity, "queue: overflow, dropped oldest");
        }
    }

    /// Removes and returns the earliest packet.
    pub fn pop(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Timestamp of the earliest queued packet.
    pub fn head_timestamp(&self) -> Option<StreamTimestamp> {
        self.packets
            .front()
            .and_then(|p| p.rtp.as_ref())
            .map(|r| r.stream_timestamp)
    }

    /// Stream-timestamp span currently buffered, in samples. Used by the
    /// latency tuner as the queue-fill observation.
    pub fn span_samples(&self) -> u32 {
        let head = self.packets.front().and_then(|p| p.rtp.as_ref());
        let tail_end = self.packets.back().and_then(|p| p.end_timestamp().ok());
        match (head, tail_end) {
            (Some(head), Some(end)) => end.wrapping_sub(head.stream_timestamp),
            _ => 0,
        }
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Duplicates dropped so far.
    pub fn dup_drops(&self) -> u64 {
        self.dup_drops
    }

    /// Packets discarded to keep the capacity bound.
    pub fn overflow_drops(&self) -> u64 {
        self.overflow_drops
    }
}
