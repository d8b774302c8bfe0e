//! Status codes for pipeline operations.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes returned by pipeline operations.
///
/// Per-packet failures are counted and dropped inside the pipeline and never
/// surface through frame reads; these codes are what the library boundary and
/// the intra-pipeline seams speak.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No packet or frame is currently available (non-blocking read).
    #[error("no data available")]
    NoData,

    /// Admission refused: no slot, capacity exceeded, or unknown session.
    #[error("no route to session")]
    NoRoute,

    /// Packet failed to parse or decode.
    #[error("malformed packet")]
    BadPacket,

    /// Operation is not valid in the current state.
    #[error("operation not allowed in current state")]
    BadOperation,

    /// Requested interface, slot, or session does not exist.
    #[error("not found")]
    NotFound,

    /// Task was cancelled before it ran.
    #[error("task aborted")]
    Aborted,

    /// Pool or allocator is exhausted.
    #[error("allocation failed")]
    NoMem,
}
