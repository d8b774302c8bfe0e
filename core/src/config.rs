//! Pipeline configuration.

use serde::{Deserialize, Serialize};

use crate::audio::{
    ChannelLayout, LatencyProfile, ResamplerProfile, SampleFormat, SampleSpec,
};
use crate::fec::FecScheme;
use crate::rtp::PAYLOAD_TYPE_L16_STEREO;
use crate::time::{Nanos, MILLISECOND, SECOND};

/// Block FEC parameters shared by sender and receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecConfig {
    /// FEC scheme to use.
    pub scheme: FecScheme,
    /// Source packets per block.
    pub source_block_len: u16,
    /// Repair packets per block.
    pub repair_block_len: u16,
}

impl FecConfig {
    /// Reed-Solomon defaults: 20 source packets protected by 10 repair
    /// packets.
    pub fn rs8m() -> Self {
        FecConfig {
            scheme: FecScheme::Rs8m,
            source_block_len: 20,
            repair_block_len: 10,
        }
    }
}

/// Receiver-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Output sample spec; sessions resample and remap to this before
    /// mixing.
    pub output_spec: SampleSpec,
    /// Target end-to-end buffering the latency tuner holds.
    pub target_latency: Nanos,
    /// Latency tuning profile.
    pub latency_profile: LatencyProfile,
    /// Resampler quality profile.
    pub resampler_profile: ResamplerProfile,
    /// A session producing no non-blank frame for this long is halted.
    pub no_playback_timeout: Nanos,
    /// Maximum concurrent sessions per slot; admission refuses beyond this.
    pub max_sessions: usize,
    /// Packets held per session jitter buffer.
    pub jitter_capacity: usize,
    /// How long a halted source stays blacklisted from re-admission.
    pub halt_blacklist_timeout: Nanos,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            output_spec: SampleSpec::new(44_100, SampleFormat::F32Be, ChannelLayout::Stereo),
            target_latency: 200 * MILLISECOND,
            latency_profile: LatencyProfile::Gradual,
            resampler_profile: ResamplerProfile::Low,
            no_playback_timeout: 2 * SECOND,
            max_sessions: 16,
            jitter_capacity: 512,
            halt_blacklist_timeout: 2 * SECOND,
        }
    }
}

/// Sender-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Spec of the frames written into the sender.
    pub input_spec: SampleSpec,
    /// Payload type of the packet encoding (looked up in the encoding map).
    pub packet_encoding: u8,
    /// Duration of each packet.
    pub packet_length: Nanos,
    /// Optional block FEC.
    pub fec: Option<FecConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            input_spec: SampleSpec::new(44_100, SampleFormat::F32Be, ChannelLayout::Stereo),
            packet_encoding: PAYLOAD_TYPE_L16_STEREO,
            packet_length: 5 * MILLISECOND,
            fec: None,
        }
    }
}
