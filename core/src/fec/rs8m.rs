//! Reed-Solomon (8-bit) codec backend.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use crate::error::{Error, Result};

fn codec(k: usize, m: usize) -> Result<ReedSolomon> {
    ReedSolomon::new(k, m).map_err(|e| {
        debug!(k, m, error = %e, "rs8m: bad block geometry");
        Error::BadOperation
    })
}

pub(crate) fn encode(k: usize, m: usize, shards: &mut Vec<Vec<u8>>) -> Result<()> {
    let rs = codec(k, m)?;
    let len = shards.iter().map(|s| s.len()).max().unwrap_or(0);
    for shard in shards.iter_mut() {
        shard.resize(len, 0);
    }
    for _ in 0..m {
        shards.push(vec![0u8; len]);
    }
    rs.encode(&mut shards[..]).map_err(|e| {
        debug!(error = %e, "rs8m: encode failed");
        Error::BadPacket
    })
}

pub(crate) fn decode(k: usize, m: usize, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
    let rs = codec(k, m)?;
    if let Some(len) = shards.iter().flatten().map(|s| s.len()).max() {
        for shard in shards.iter_mut().flatten() {
            shard.resize(len, 0);
        }
    }
    rs.reconstruct(shards).map_err(|e| {
        debug!(error = %e, "rs8m: reconstruct failed");
        Error::BadPacket
    })
}
