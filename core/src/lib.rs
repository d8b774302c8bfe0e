//! Wavecast core: transport-agnostic real-time PCM streaming pipeline.
//!
//! A sender turns PCM frames into an RTP packet stream (optionally protected
//! by block FEC); a receiver reorders, repairs, decodes, latency-tunes and
//! mixes concurrent streams into one continuous PCM output, exchanging RTCP
//! reports on a side channel.
//!
//! # Architecture
//!
//! This crate is a pure library with no socket code:
//! - [`packet`], [`audio`] define the data model (owned packets, f32 frames)
//! - [`rtp`], [`rtcp`], [`fec`] are the wire codecs
//! - [`pipeline`] assembles them into [`pipeline::ReceiverSource`] /
//!   [`pipeline::SenderSink`], both driven by a single-threaded cooperative
//!   [`pipeline::PipelineLoop`]
//!
//! Transport crates (UDP today) sit on top: they bind sockets, run the I/O
//! threads and move [`packet::Packet`] values through the endpoint queues
//! returned by `bind`.
//!
//! # Example
//!
//! ```
//! use wavecast_core::config::ReceiverConfig;
//! use wavecast_core::context::Context;
//! use wavecast_core::pipeline::{Interface, ReceiverSource};
//! use wavecast_core::rtp::EncodingMap;
//!
//! let mut receiver = ReceiverSource::new(
//!     ReceiverConfig::default(),
//!     EncodingMap::new(),
//!     Context::default(),
//! );
//! let slot = receiver.create_slot();
//! let queues = receiver.bind(slot, Interface::AudioSource, None).unwrap();
//! // Hand `queues` to the I/O layer; frames come out of `read_frame`.
//! # let _ = queues;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod context;
pub mod fec;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod rtcp;
pub mod rtp;
pub mod time;

mod error;
pub use error::{Error, Result};

/// Initializes logging for binaries and tests embedding the pipeline.
///
/// Installs a `tracing` subscriber honoring `RUST_LOG`; safe to call once at
/// startup.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("wavecast core initialized");
}
