//! Shared context: the process-wide pools handed to every component.

use crate::packet::pool::{FramePool, PacketPool, Pool};

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Maximum packet buffers alive at once.
    pub max_packets: usize,
    /// Byte capacity of one packet buffer.
    pub packet_size: usize,
    /// Maximum frame buffers alive at once.
    pub max_frames: usize,
    /// Sample capacity of one frame buffer.
    pub frame_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            max_packets: 4096,
            packet_size: 2048,
            max_frames: 128,
            frame_size: 16384,
        }
    }
}

/// Owns the packet and frame pools. Cloning shares the same pools; there is
/// no implicit global state.
#[derive(Clone)]
pub struct Context {
    /// Pool for packet byte buffers.
    pub packet_pool: PacketPool,
    /// Pool for frame sample buffers.
    pub frame_pool: FramePool,
}

impl Context {
    /// Creates a context with the given pool sizing.
    pub fn new(config: ContextConfig) -> Self {
        Context {
            packet_pool: Pool::new(config.max_packets, config.packet_size),
            frame_pool: Pool::new(config.max_frames, config.frame_size),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
