//! UDP transport for the wavecast pipeline.
//!
//! The core crate is transport-agnostic; this crate owns the sockets. Each
//! bound endpoint gets dedicated I/O threads that exchange
//! [`wavecast_core::packet::Packet`] values with the pipeline through
//! lock-free channels:
//!
//! - [`EndpointUri`] names an endpoint as `<proto>://<host>:<port>` with
//!   proto in {rtp, rtp+rs8m, rs8m, rtp+ldpc, ldpc, rtcp}
//! - [`UdpPort`] binds a socket and runs the receive/send threads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod udp;

pub use endpoint::{EndpointUri, Proto};
pub use udp::UdpPort;

use thiserror::Error as ThisError;

/// Transport-layer errors.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A pipeline status code.
    #[error(transparent)]
    Status(#[from] wavecast_core::Error),
    /// Socket-level failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed or unresolvable endpoint URI.
    #[error("bad endpoint uri: {0}")]
    BadUri(String),
}
