//! K-way merge of per-shard top-k tables
//!
//! Each shard contributes a list of at most `k` candidates per query, already
//! sorted by the selection order and cut short by a `-1` index when the shard
//! had fewer than `k` neighbors. The merge keeps one head per non-exhausted
//! shard in a heap, so the heap never holds more than `nshard` entries and no
//! shard can contribute a candidate out of turn.
//!
//! Ties between shards pop the lower shard id first.

use super::comparator::SelectOrder;
use super::SENTINEL_INDEX;
use crate::{KnnError, Result};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Current head of one shard's list
#[derive(Debug, Clone, Copy)]
struct HeapItem {
    distance: f32,
    shard: usize,
    order: SelectOrder,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest item, so "better" must compare greater:
        // 1. better distance under the policy
        // 2. lower shard id
        self.order
            .compare(other.distance, self.distance)
            .then(other.shard.cmp(&self.shard))
    }
}

/// Per-worker scratch, reused across the queries a worker handles
struct MergeScratch {
    heap: BinaryHeap<HeapItem>,
    cursor: Vec<usize>,
}

impl MergeScratch {
    fn new(nshard: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(nshard),
            cursor: vec![0; nshard],
        }
    }
}

/// Merge stacked per-shard results into one top-k list per query
///
/// # Arguments
/// * `n` - number of queries
/// * `k` - neighbors per query
/// * `nshard` - number of stacked shard tables
/// * `distances` / `labels` - output, `n × k`
/// * `all_distances` / `all_labels` - input, shard-major `nshard × n × k`
/// * `translations` - offset added to every local index of a shard, `nshard`
/// * `order` - selection order the shard lists are sorted by
///
/// `k == 0` returns immediately without touching the outputs. Negative
/// translations, or a translated index that does not fit in `i64`, are
/// rejected with `InvalidArgument`; the outputs may then be partially written.
#[allow(clippy::too_many_arguments)]
pub fn merge_tables(
    n: usize,
    k: usize,
    nshard: usize,
    distances: &mut [f32],
    labels: &mut [i64],
    all_distances: &[f32],
    all_labels: &[i64],
    translations: &[i64],
    order: SelectOrder,
) -> Result<()> {
    if k == 0 {
        return Ok(());
    }

    let stride = checked_product("output", n, k)?;
    let stacked = checked_product("stacked input", nshard, stride)?;
    check_len("output distances", distances.len(), stride)?;
    check_len("output labels", labels.len(), stride)?;
    check_len("stacked distances", all_distances.len(), stacked)?;
    check_len("stacked labels", all_labels.len(), stacked)?;
    check_len("translations", translations.len(), nshard)?;
    if let Some(s) = translations.iter().position(|&t| t < 0) {
        return Err(KnnError::InvalidArgument(format!(
            "translation {} of shard {} is negative",
            translations[s], s
        )));
    }

    distances
        .par_chunks_mut(k)
        .zip(labels.par_chunks_mut(k))
        .enumerate()
        .try_for_each_init(
            || MergeScratch::new(nshard),
            |scratch, (i, (d_out, i_out))| {
                let base = i * k;
                scratch.heap.clear();
                scratch.cursor.fill(0);

                for s in 0..nshard {
                    let head = s * stride + base;
                    if all_labels[head] >= 0 {
                        scratch.heap.push(HeapItem {
                            distance: all_distances[head],
                            shard: s,
                            order,
                        });
                    }
                }

                for j in 0..k {
                    let Some(top) = scratch.heap.pop() else {
                        d_out[j..].fill(order.neutral());
                        i_out[j..].fill(SENTINEL_INDEX);
                        break;
                    };

                    let s = top.shard;
                    let row = s * stride + base;
                    let p = scratch.cursor[s];
                    let local = all_labels[row + p];
                    d_out[j] = top.distance;
                    i_out[j] = local.checked_add(translations[s]).ok_or_else(|| {
                        KnnError::InvalidArgument(format!(
                            "index {} of shard {} overflows i64 after translation {}",
                            local, s, translations[s]
                        ))
                    })?;

                    let p = p + 1;
                    scratch.cursor[s] = p;
                    if p < k && all_labels[row + p] >= 0 {
                        scratch.heap.push(HeapItem {
                            distance: all_distances[row + p],
                            shard: s,
                            order,
                        });
                    }
                }
                Ok(())
            },
        )
}

fn checked_product(what: &str, a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b).ok_or_else(|| {
        KnnError::ShapeMismatch(format!("{} size {} x {} overflows usize", what, a, b))
    })
}

fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(KnnError::ShapeMismatch(format!(
            "{} has {} elements, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}
