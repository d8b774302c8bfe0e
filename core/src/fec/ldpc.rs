//! LDPC-Staircase codec backend.
//!
//! Parity equations follow the staircase construction: every source shard
//! feeds three parity rows chosen by a deterministic spread, and each parity
//! shard additionally folds in its predecessor. Erasure decoding runs
//! Gaussian elimination over GF(2) with whole shards as symbols.

use crate::error::{Error, Result};

/// Parity rows fed by each source shard.
const DEGREE: usize = 3;

/// Rows of the parity-check matrix touched by source shard `j`.
///
/// Both sides derive the spread deterministically from `(j, k, m)`. Columns
/// must differ between shards as much as the geometry allows, otherwise two
/// losses sharing the exact same rows become indistinguishable; a multiply-
/// shift hash with linear probing keeps the picked rows distinct per shard.
fn source_rows(j: usize, k: usize, m: usize) -> Vec<usize> {
    let degree = DEGREE.min(m.saturating_sub(1)).max(1).min(m);
    let mut h = (j as u64 ^ ((k as u64) << 24) ^ ((m as u64) << 48))
        .wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut rows = Vec::with_capacity(degree);
    // First row walks the matrix so neighboring shards always diverge.
    rows.push(j % m);
    while rows.len() < degree {
        h = h.rotate_left(23).wrapping_mul(0xff51_afd7_ed55_8ccd);
        let mut row = (h >> 17) as usize % m;
        while rows.contains(&row) {
            row = (row + 1) % m;
        }
        rows.push(row);
    }
    rows
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

pub(crate) fn encode(k: usize, m: usize, shards: &mut Vec<Vec<u8>>) -> Result<()> {
    if k == 0 || m == 0 {
        return Err(Error::BadOperation);
    }
    let len = shards.iter().map(|s| s.len()).max().unwrap_or(0);
    for shard in shards.iter_mut() {
        shard.resize(len, 0);
    }

    let mut parity = vec![vec![0u8; len]; m];
    for (j, shard) in shards.iter().enumerate() {
        for row in source_rows(j, k, m) {
            xor_into(&mut parity[row], shard);
        }
    }
    // Staircase: each parity row folds in the previous one.
    for i in 1..m {
        let (prev, cur) = parity.split_at_mut(i);
        xor_into(&mut cur[0], &prev[i - 1]);
    }
    shards.extend(parity);
    Ok(())
}

pub(crate) fn decode(k: usize, m: usize, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
    if k == 0 || m == 0 || shards.len() != k + m {
        return Err(Error::BadOperation);
    }
    let len = match shards.iter().flatten().map(|s| s.len()).max() {
        Some(len) => len,
        None => return Err(Error::BadPacket),
    };
    for shard in shards.iter_mut().flatten() {
        shard.resize(len, 0);
    }

    let missing: Vec<usize> = shards
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    // One equation per parity row: XOR of its sources, the previous parity
    // and the row's own parity equals zero. Build the system restricted to
    // the missing shards; known shards fold into the right-hand side.
    let unknown_of: std::collections::HashMap<usize, usize> = missing
        .iter()
        .enumerate()
        .map(|(col, &shard)| (shard, col))
        .collect();

    let mut rows: Vec<(Vec<bool>, Vec<u8>)> = Vec::with_capacity(m);
    for i in 0..m {
        let mut coeffs = vec![false; missing.len()];
        let mut rhs = vec![0u8; len];
        let mut fold = |idx: usize, coeffs: &mut Vec<bool>, rhs: &mut Vec<u8>| {
            match &shards[idx] {
                Some(shard) => xor_into(rhs, shard),
                None => {
                    let col = unknown_of[&idx];
                    coeffs[col] = !coeffs[col];
                }
            }
        };
        for j in 0..k {
            if source_rows(j, k, m).contains(&i) {
                fold(j, &mut coeffs, &mut rhs);
            }
        }
        if i > 0 {
            fold(k + i - 1, &mut coeffs, &mut rhs);
        }
        fold(k + i, &mut coeffs, &mut rhs);
        rows.push((coeffs, rhs));
    }

    // Gaussian elimination over GF(2).
    let mut solved: Vec<Option<Vec<u8>>> = vec![None; missing.len()];
    let mut pivot_row = 0usize;
    for col in 0..missing.len() {
        let Some(found) = (pivot_row..rows.len()).find(|&r| rows[r].0[col]) else {
            continue;
        };
        rows.swap(pivot_row, found);
        let (pivot_coeffs, pivot_rhs) = rows[pivot_row].clone();
        for (r, (coeffs, rhs)) in rows.iter_mut().enumerate() {
            if r != pivot_row && coeffs[col] {
                for (c, p) in coeffs.iter_mut().zip(&pivot_coeffs) {
                    *c ^= p;
                }
                xor_into(rhs, &pivot_rhs);
            }
        }
        pivot_row += 1;
    }

    for (coeffs, rhs) in &rows {
        let set: Vec<usize> = (0..missing.len()).filter(|&c| coeffs[c]).collect();
        if set.len() == 1 && solved[set[0]].is_none() {
            solved[set[0]] = Some(rhs.clone());
        }
    }

    if solved.iter().any(|s| s.is_none()) {
        return Err(Error::BadPacket);
    }
    for (col, &shard_idx) in missing.iter().enumerate() {
        shards[shard_idx] = solved[col].take();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|b| (b as u8).wrapping_add(17 * i as u8)).collect())
            .collect()
    }

    #[test]
    fn test_encode_appends_parity() {
        let mut data = shards(5, 24);
        encode(5, 3, &mut data).unwrap();
        assert_eq!(data.len(), 8);
        assert!(data[5..].iter().any(|p| p.iter().any(|&b| b != 0)));
    }

    #[test]
    fn test_single_loss_always_repairs() {
        let k = 8;
        let m = 4;
        let mut data = shards(k, 16);
        let originals = data.clone();
        encode(k, m, &mut data).unwrap();

        for lost in 0..k + m {
            let mut holes: Vec<Option<Vec<u8>>> = data.clone().into_iter().map(Some).collect();
            holes[lost] = None;
            decode(k, m, &mut holes).unwrap();
            for (i, original) in originals.iter().enumerate() {
                assert_eq!(holes[i].as_ref().unwrap(), original, "lost {}, shard {}", lost, i);
            }
        }
    }

    #[test]
    fn test_double_loss_mostly_repairs() {
        let k = 8;
        let m = 4;
        let mut data = shards(k, 16);
        let originals = data.clone();
        encode(k, m, &mut data).unwrap();

        let mut attempts = 0;
        let mut repaired = 0;
        for a in 0..k {
            for b in a + 1..k {
                attempts += 1;
                let mut holes: Vec<Option<Vec<u8>>> =
                    data.clone().into_iter().map(Some).collect();
                holes[a] = None;
                holes[b] = None;
                if decode(k, m, &mut holes).is_ok() {
                    repaired += 1;
                    // Whenever decoding claims success the bytes must be
                    // exact.
                    for (i, original) in originals.iter().enumerate() {
                        assert_eq!(holes[i].as_ref().unwrap(), original);
                    }
                }
            }
        }
        // LDPC is not MDS; a small residue of loss pairs may be
        // unrecoverable, but the bulk must repair.
        assert!(
            repaired * 3 >= attempts * 2,
            "only {}/{} pairs repaired",
            repaired,
            attempts
        );
    }

    #[test]
    fn test_unsolvable_pattern_fails_cleanly() {
        let k = 5;
        let m = 1;
        let mut data = shards(k, 16);
        encode(k, m, &mut data).unwrap();
        let mut holes: Vec<Option<Vec<u8>>> = data.into_iter().map(Some).collect();
        holes[0] = None;
        holes[1] = None; // two losses, one parity shard
        assert_eq!(decode(k, m, &mut holes), Err(Error::BadPacket));
    }
}
