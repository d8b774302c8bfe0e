//! Nanosecond clocks shared by the pipeline.
//!
//! Two domains: the monotonic clock drives deadlines and timeouts, the Unix
//! clock stamps capture timestamps carried on the wire. Both are plain `i64`
//! nanoseconds so arithmetic across packets and reports stays branch-free.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Nanoseconds, either since an arbitrary monotonic anchor or since the Unix
/// epoch depending on context. Signed so that differences are well-formed.
pub type Nanos = i64;

/// One second in [`Nanos`].
pub const SECOND: Nanos = 1_000_000_000;

/// One millisecond in [`Nanos`].
pub const MILLISECOND: Nanos = 1_000_000;

/// One microsecond in [`Nanos`].
pub const MICROSECOND: Nanos = 1_000;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Current monotonic time. The first call anchors the clock; all later calls
/// are offsets from that anchor.
pub fn mono_now() -> Nanos {
    anchor().elapsed().as_nanos() as Nanos
}

/// Current Unix wall-clock time in nanoseconds.
pub fn unix_now() -> Nanos {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Nanos)
        .unwrap_or(0)
}

/// Checks two timestamps for equality within `delta` nanoseconds.
pub fn ns_equal_delta(a: Nanos, b: Nanos, delta: Nanos) -> bool {
    (a - b).abs() <= delta
}
