//! Commit-time transaction splitting.
//!
//! A large transaction is partitioned across all commit proxies so that
//! resolver and log work parallelizes while the master still assigns one
//! commit version for the whole split. Mutations are balanced with the
//! longest-processing-time-first heuristic on value size; conflict ranges
//! go either to one uniformly chosen part or round-robin across parts.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rand::Rng;
use uuid::Uuid;

use braid_core::interfaces::{CommitTransaction, CommitTransactionRequest, FLAG_FIRST_IN_BATCH};
use braid_core::knobs::{Knobs, CONFLICTS_EVENLY_DISTRIBUTE, CONFLICTS_TO_ONE_PROXY};
use braid_core::types::SplitTransaction;

/// Splitting applies only when it can actually parallelize work: several
/// proxies, several mutations, and enough value bytes to matter.
pub fn should_split(req: &CommitTransactionRequest, num_proxies: usize, knobs: &Knobs) -> bool {
    if num_proxies < 2 || req.transaction.mutations.len() < 2 || !knobs.split_enabled() {
        return false;
    }
    req.transaction.value_bytes() >= knobs.large_transaction_criteria
}

/// Partition `req` into `num_proxies` parts sharing a fresh split id.
/// Every part carries the first-in-batch flag so no batcher coalesces it.
pub fn split_transaction(
    req: &CommitTransactionRequest,
    num_proxies: usize,
    knobs: &Knobs,
) -> Vec<CommitTransactionRequest> {
    assert!(num_proxies >= 2, "splitting requires at least two proxies");
    let split_id = Uuid::new_v4();

    let mut parts: Vec<CommitTransactionRequest> = (0..num_proxies)
        .map(|index| {
            let mut part = req.clone();
            part.transaction = CommitTransaction {
                read_conflict_ranges: Vec::new(),
                write_conflict_ranges: Vec::new(),
                mutations: Vec::new(),
                read_snapshot: req.transaction.read_snapshot,
            };
            part.split_transaction = Some(SplitTransaction::new(
                split_id,
                num_proxies as u16,
                index as u16,
            ));
            part.flags |= FLAG_FIRST_IN_BATCH;
            part
        })
        .collect();

    distribute_conflicts(req, &mut parts, knobs);
    distribute_mutations(req, &mut parts);
    parts
}

fn distribute_conflicts(
    req: &CommitTransactionRequest,
    parts: &mut [CommitTransactionRequest],
    knobs: &Knobs,
) {
    match knobs.conflict_split_mode() {
        CONFLICTS_TO_ONE_PROXY => {
            let chosen = rand::thread_rng().gen_range(0..parts.len());
            parts[chosen].transaction.read_conflict_ranges =
                req.transaction.read_conflict_ranges.clone();
            parts[chosen].transaction.write_conflict_ranges =
                req.transaction.write_conflict_ranges.clone();
        }
        CONFLICTS_EVENLY_DISTRIBUTE => {
            let mut index = 0usize;
            for range in &req.transaction.read_conflict_ranges {
                parts[index]
                    .transaction
                    .read_conflict_ranges
                    .push(range.clone());
                index = (index + 1) % parts.len();
            }
            for range in &req.transaction.write_conflict_ranges {
                parts[index]
                    .transaction
                    .write_conflict_ranges
                    .push(range.clone());
                index = (index + 1) % parts.len();
            }
        }
        other => unreachable!("unknown conflict split mode {other:#b}"),
    }
}

/// Greedy LPT assignment: repeatedly hand the largest remaining mutation
/// to the currently least-loaded part. The partition problem is NP-hard;
/// this gets within 4/3 of optimal in `O(n log n)`.
fn distribute_mutations(req: &CommitTransactionRequest, parts: &mut [CommitTransactionRequest]) {
    let mutations = &req.transaction.mutations;

    // Max-heap of mutations by value size.
    let mut by_size: BinaryHeap<(usize, usize)> = mutations
        .iter()
        .enumerate()
        .map(|(index, m)| (m.param2().len(), index))
        .collect();

    // Min-heap of parts by accumulated value size.
    let mut loads: BinaryHeap<Reverse<(usize, usize)>> =
        (0..parts.len()).map(|index| Reverse((0, index))).collect();

    while let Some((size, mutation_index)) = by_size.pop() {
        let Reverse((load, part_index)) = loads.pop().expect("one entry per part");
        parts[part_index]
            .transaction
            .mutations
            .push(mutations[mutation_index].clone());
        loads.push(Reverse((load + size, part_index)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::knobs::ENABLE_SPLIT_TRANSACTION;
    use braid_core::mutation::Mutation;
    use braid_core::types::KeyRange;

    fn request_with_values(sizes: &[usize]) -> CommitTransactionRequest {
        let transaction = CommitTransaction {
            read_conflict_ranges: vec![
                KeyRange::new(&b"a"[..], &b"b"[..]),
                KeyRange::new(&b"c"[..], &b"d"[..]),
                KeyRange::new(&b"e"[..], &b"f"[..]),
            ],
            write_conflict_ranges: vec![KeyRange::new(&b"a"[..], &b"f"[..])],
            mutations: sizes
                .iter()
                .enumerate()
                .map(|(i, size)| Mutation::set(vec![i as u8], vec![0u8; *size]))
                .collect(),
            read_snapshot: 100,
        };
        CommitTransactionRequest::new(transaction).0
    }

    fn knobs_with_mode(mode: u32) -> Knobs {
        let mut knobs = Knobs::default();
        knobs.transaction_split_mode = ENABLE_SPLIT_TRANSACTION | mode;
        knobs.large_transaction_criteria = 100;
        knobs
    }

    #[test]
    fn split_preconditions() {
        let knobs = knobs_with_mode(CONFLICTS_TO_ONE_PROXY);
        let big = request_with_values(&[200, 200]);
        assert!(should_split(&big, 3, &knobs));
        // One proxy, one mutation, or a small transaction: no split.
        assert!(!should_split(&big, 1, &knobs));
        assert!(!should_split(&request_with_values(&[500]), 3, &knobs));
        assert!(!should_split(&request_with_values(&[10, 10]), 3, &knobs));

        let mut disabled = knobs_with_mode(CONFLICTS_TO_ONE_PROXY);
        disabled.transaction_split_mode &= !ENABLE_SPLIT_TRANSACTION;
        assert!(!should_split(&big, 3, &disabled));
    }

    #[test]
    fn lpt_balances_loads() {
        // Sizes in KB from a descending workload; LPT packs them into
        // loads {190, 180, 180}, within 4/3 of the optimal 190.
        let sizes: Vec<usize> = [100, 90, 80, 70, 60, 50, 40, 30, 20, 10]
            .iter()
            .map(|kb| kb * 1000)
            .collect();
        let req = request_with_values(&sizes);
        let knobs = knobs_with_mode(CONFLICTS_TO_ONE_PROXY);
        let parts = split_transaction(&req, 3, &knobs);

        let mut loads: Vec<i64> = parts
            .iter()
            .map(|p| p.transaction.value_bytes())
            .collect();
        loads.sort_unstable();
        assert_eq!(loads, vec![180_000, 180_000, 190_000]);

        // Conservation: every byte of value lands in exactly one part.
        let total: i64 = parts.iter().map(|p| p.transaction.value_bytes()).sum();
        assert_eq!(total, req.transaction.value_bytes());
        let mutation_count: usize = parts.iter().map(|p| p.transaction.mutations.len()).sum();
        assert_eq!(mutation_count, sizes.len());
    }

    #[test]
    fn parts_share_id_and_flags() {
        let req = request_with_values(&[200, 100, 50]);
        let knobs = knobs_with_mode(CONFLICTS_TO_ONE_PROXY);
        let parts = split_transaction(&req, 3, &knobs);

        let split_id = parts[0].split_transaction.unwrap().id;
        let mut seen_indices: Vec<u16> = Vec::new();
        for part in &parts {
            let split = part.split_transaction.unwrap();
            assert_eq!(split.id, split_id);
            assert_eq!(split.total_parts, 3);
            seen_indices.push(split.part_index);
            assert!(part.first_in_batch());
            assert_eq!(part.transaction.read_snapshot, 100);
        }
        seen_indices.sort_unstable();
        assert_eq!(seen_indices, vec![0, 1, 2]);
    }

    #[test]
    fn conflicts_to_one_proxy_go_to_a_single_part() {
        let req = request_with_values(&[200, 100]);
        let knobs = knobs_with_mode(CONFLICTS_TO_ONE_PROXY);
        let parts = split_transaction(&req, 3, &knobs);

        let with_conflicts: Vec<_> = parts
            .iter()
            .filter(|p| {
                !p.transaction.read_conflict_ranges.is_empty()
                    || !p.transaction.write_conflict_ranges.is_empty()
            })
            .collect();
        assert_eq!(with_conflicts.len(), 1);
        assert_eq!(with_conflicts[0].transaction.read_conflict_ranges.len(), 3);
        assert_eq!(with_conflicts[0].transaction.write_conflict_ranges.len(), 1);
    }

    #[test]
    fn conflicts_round_robin_across_parts() {
        let req = request_with_values(&[200, 100]);
        let knobs = knobs_with_mode(CONFLICTS_EVENLY_DISTRIBUTE);
        let parts = split_transaction(&req, 3, &knobs);

        let read_total: usize = parts
            .iter()
            .map(|p| p.transaction.read_conflict_ranges.len())
            .sum();
        let write_total: usize = parts
            .iter()
            .map(|p| p.transaction.write_conflict_ranges.len())
            .sum();
        assert_eq!(read_total, 3);
        assert_eq!(write_total, 1);
        // Three read ranges round-robin onto three parts: one each.
        for part in &parts {
            assert_eq!(part.transaction.read_conflict_ranges.len(), 1);
        }
    }

    #[test]
    fn empty_conflicts_distribute_as_a_noop() {
        let mut req = request_with_values(&[200, 100]);
        req.transaction.read_conflict_ranges.clear();
        req.transaction.write_conflict_ranges.clear();
        for mode in [CONFLICTS_TO_ONE_PROXY, CONFLICTS_EVENLY_DISTRIBUTE] {
            let parts = split_transaction(&req, 2, &knobs_with_mode(mode));
            for part in parts {
                assert!(part.transaction.read_conflict_ranges.is_empty());
                assert!(part.transaction.write_conflict_ranges.is_empty());
            }
        }
    }
}
