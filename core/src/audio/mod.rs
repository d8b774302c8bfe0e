//! Audio-domain types and processing stages.
//!
//! Everything in here works on interleaved f32 PCM. Wire formats and channel
//! layouts are converted at the edges by [`pcm`]; the stream stages
//! ([`depacketizer`], [`resampler`], [`mixer`]) stay format-agnostic.

pub mod depacketizer;
pub mod frame;
pub mod latency_tuner;
pub mod mixer;
pub mod pcm;
pub mod resampler;
pub mod sample_spec;

pub use depacketizer::{Depacketizer, FrameInfo};
pub use frame::Frame;
pub use latency_tuner::{LatencyProfile, LatencyTuner};
pub use mixer::Mixer;
pub use resampler::{Resampler, ResamplerProfile};
pub use sample_spec::{ChannelLayout, ChannelOrder, SampleFormat, SampleSpec};
