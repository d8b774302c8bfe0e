//! Sample specifications.
//!
//! A [`SampleSpec`] fully describes a PCM stream: rate, wire format, channel
//! layout, channel order and channel mask. Two specs are interchangeable only
//! if every field matches; conversion between differing specs is always
//! explicit (see [`crate::audio::pcm`]).

use serde::{Deserialize, Serialize};

use crate::time::{Nanos, SECOND};

/// PCM wire format of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit IEEE float, big-endian, nominal range [-1.0, 1.0].
    F32Be,
    /// 16-bit signed integer, big-endian (IANA L16).
    S16Be,
    /// 32-bit signed integer, big-endian.
    S32Be,
}

impl SampleFormat {
    /// Size of one encoded sample in bytes.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::F32Be | SampleFormat::S32Be => 4,
            SampleFormat::S16Be => 2,
        }
    }
}

/// Channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLayout {
    /// Single channel.
    Mono,
    /// Left/right interleaved pair.
    Stereo,
    /// Interleaved multitrack PCM with an explicit track count.
    Multitrack(u16),
}

impl ChannelLayout {
    /// Number of interleaved channels.
    pub fn num_channels(self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Multitrack(tracks) => tracks,
        }
    }

    /// Default channel mask: one bit per active channel, LSB first.
    pub fn default_mask(self) -> u64 {
        match self.num_channels() {
            64.. => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }
}

/// Channel ordering convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    /// No defined order (multitrack).
    None,
    /// SMPTE order (mono/stereo/surround families).
    Smpte,
}

/// Full description of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Wire format of one sample.
    pub format: SampleFormat,
    /// Channel layout.
    pub layout: ChannelLayout,
    /// Channel ordering convention.
    pub order: ChannelOrder,
    /// Bitmask of active channels.
    pub channel_mask: u64,
}

impl SampleSpec {
    /// Builds a spec with the layout's default order and mask.
    pub fn new(rate: u32, format: SampleFormat, layout: ChannelLayout) -> Self {
        let order = match layout {
            ChannelLayout::Multitrack(_) => ChannelOrder::None,
            _ => ChannelOrder::Smpte,
        };
        SampleSpec {
            rate,
            format,
            layout,
            order,
            channel_mask: layout.default_mask(),
        }
    }

    /// Number of interleaved channels.
    pub fn num_channels(&self) -> u16 {
        self.layout.num_channels()
    }

    /// Converts a per-channel sample count to nanoseconds at this rate.
    pub fn samples_to_ns(&self, samples: u64) -> Nanos {
        debug_assert!(self.rate > 0);
        (samples as i128 * SECOND as i128 / self.rate as i128) as Nanos
    }

    /// Converts a nanosecond duration to a per-channel sample count,
    /// rounding to nearest.
    pub fn ns_to_samples(&self, ns: Nanos) -> u64 {
        debug_assert!(self.rate > 0);
        let ns = ns.max(0) as i128;
        ((ns * self.rate as i128 + SECOND as i128 / 2) / SECOND as i128) as u64
    }

    /// Size in bytes of `samples` per-channel samples across all channels.
    pub fn frames_size(&self, samples: usize) -> usize {
        samples * self.num_channels() as usize * self.format.sample_size()
    }

    /// Number of per-channel samples encoded in `bytes` bytes, or `None`
    /// when the byte count does not divide evenly.
    pub fn bytes_to_frames(&self, bytes: usize) -> Option<usize> {
        let frame = self.num_channels() as usize * self.format.sample_size();
        (frame > 0 && bytes % frame == 0).then(|| bytes / frame)
    }
}
