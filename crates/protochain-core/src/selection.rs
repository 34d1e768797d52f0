// STAKE-WEIGHTED SELECTION
// Deterministic quorum and leader order derived from an epoch seed.
//
// SAFETY INVARIANTS:
// 1. Same pools + same seed -> same output on every node
// 2. A pool is selected at most once
// 3. Pools without stake are only appended after every staked pool is placed

use crate::crypto::blake3_hex;
use crate::epoch::PoolRecord;
use std::collections::BTreeMap;

/// Draw a deterministic value in `[0, modulus)` from `seed` and a round number.
fn draw(seed_hash: &str, round: usize, modulus: u128) -> u128 {
    let digest = blake3_hex(&format!("{}_{}", seed_hash, round));
    // First 16 bytes of the digest, read big-endian.
    let value = u128::from_str_radix(&digest[..32], 16).unwrap_or(0);
    value % modulus
}

/// Order up to `count` candidates, each round picking proportionally to stake.
pub fn weighted_order(candidates: &[(String, u64)], seed: &str, count: usize) -> Vec<String> {
    let seed_hash = blake3_hex(seed);
    let mut remaining: Vec<(String, u64)> = candidates.to_vec();
    remaining.sort_by(|a, b| a.0.cmp(&b.0));
    remaining.dedup_by(|a, b| a.0 == b.0);

    let mut total: u128 = remaining.iter().map(|(_, stake)| *stake as u128).sum();
    let mut selected = Vec::with_capacity(count.min(remaining.len()));

    for round in 0..count {
        if remaining.is_empty() {
            break;
        }
        if total == 0 {
            let take = count - round;
            selected.extend(remaining.drain(..).take(take).map(|(key, _)| key));
            break;
        }

        let target = draw(&seed_hash, round, total);
        let mut cumulative: u128 = 0;
        let mut chosen = remaining.len() - 1;
        for (position, (_, stake)) in remaining.iter().enumerate() {
            cumulative += *stake as u128;
            if target < cumulative {
                chosen = position;
                break;
            }
        }

        let (key, stake) = remaining.remove(chosen);
        total -= stake as u128;
        selected.push(key);
    }

    selected
}

/// Pick the quorum for an epoch. Small registries are taken whole.
pub fn select_quorum(
    pools: &BTreeMap<String, PoolRecord>,
    quorum_size: usize,
    seed: &str,
) -> Vec<String> {
    if pools.len() <= quorum_size {
        return pools.keys().cloned().collect();
    }
    let candidates: Vec<(String, u64)> = pools
        .iter()
        .map(|(key, pool)| (key.clone(), pool.total_stake))
        .collect();
    weighted_order(&candidates, seed, quorum_size)
}

/// Order the quorum into the epoch's leaders sequence.
pub fn leaders_sequence(
    pools: &BTreeMap<String, PoolRecord>,
    quorum: &[String],
    seed: &str,
) -> Vec<String> {
    let candidates: Vec<(String, u64)> = quorum
        .iter()
        .map(|key| {
            let stake = pools.get(key).map(|pool| pool.total_stake).unwrap_or(0);
            (key.clone(), stake)
        })
        .collect();
    weighted_order(&candidates, seed, candidates.len())
}
