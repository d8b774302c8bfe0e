//! Metrics surfaced through the control API.

use serde::Serialize;

use crate::packet::StreamSource;
use crate::time::Nanos;

/// Metrics for one slot as a whole.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SlotMetrics {
    /// Number of live connections (sessions on a receiver, peers on a
    /// sender).
    pub connection_count: usize,
    /// Whether the slot's pipeline is fully established.
    pub is_complete: bool,
    /// Malformed packets dropped at this slot.
    pub bad_packets: u64,
}

/// Metrics for one connection (remote participant).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetrics {
    /// Remote stream source id.
    pub source_id: StreamSource,
    /// CNAME, once learned via RTCP.
    pub cname: Option<String>,
    /// Capture-to-playback latency estimate.
    pub e2e_latency_ns: Nanos,
    /// Duration currently buffered in the receive queues.
    pub queue_latency_ns: Nanos,
    /// Lifetime packet loss ratio in [0, 1].
    pub packet_loss_rate: f64,
    /// Interarrival jitter.
    pub jitter_ns: Nanos,
    /// Packets dropped for arriving too late.
    pub late_drops: u64,
    /// Packets reconstructed by FEC.
    pub repaired_packets: u64,
    /// Round-trip time estimate, 0 when unknown.
    pub rtt_ns: Nanos,
}
