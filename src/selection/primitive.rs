//! Per-shard top-k search primitive

use super::{MatrixView, SENTINEL_INDEX};
use crate::device::ExecutionContext;
use crate::distance::{l2_squared, DistanceType};
use crate::{KnnError, Result};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One shard-local search
#[derive(Debug, Clone, Copy)]
pub struct TopKRequest<'a> {
    pub base: MatrixView<'a>,
    pub queries: MatrixView<'a>,
    pub k: usize,
    pub metric: DistanceType,
}

/// Exact top-k over a single device-resident base set
///
/// Writes `queries.rows() × k` results, row-major, sorted nearest first.
/// Rows with fewer than `k` neighbors are padded with index `-1`.
/// Indices are local to `base`.
pub trait KnnPrimitive: Send + Sync {
    fn search(
        &self,
        ctx: &ExecutionContext,
        request: &TopKRequest<'_>,
        distances: &mut [f32],
        indices: &mut [i64],
    ) -> Result<()>;
}

/// Brute-force primitive backed by the host L2 kernel
///
/// Both unexpanded L2 variants produce squared distances here; the square
/// root belongs to the post-merge transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatL2Primitive;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    index: i64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

impl KnnPrimitive for FlatL2Primitive {
    fn search(
        &self,
        ctx: &ExecutionContext,
        request: &TopKRequest<'_>,
        distances: &mut [f32],
        indices: &mut [i64],
    ) -> Result<()> {
        if !request.metric.is_supported_for_knn() {
            return Err(KnnError::UnsupportedMetric(request.metric));
        }
        let TopKRequest { base, queries, k, .. } = *request;
        if base.dim() != queries.dim() {
            return Err(KnnError::ShapeMismatch(format!(
                "base dim {} != query dim {}",
                base.dim(),
                queries.dim()
            )));
        }
        let expected = queries.rows().checked_mul(k).ok_or_else(|| {
            KnnError::ShapeMismatch(format!("{} queries x k={} overflows usize", queries.rows(), k))
        })?;
        if distances.len() != expected || indices.len() != expected {
            return Err(KnnError::ShapeMismatch(format!(
                "output holds {}/{} values, expected {}",
                distances.len(),
                indices.len(),
                expected
            )));
        }
        if k == 0 || queries.is_empty() {
            return Ok(());
        }
        // the heap never holds more than min(k, rows) + 1 candidates
        let capacity = k.min(base.rows()) + 1;

        let pooled = ctx.options().temp_memory;
        tracing::trace!(
            device = %ctx.device(),
            stream = ctx.stream(),
            base_rows = base.rows(),
            queries = queries.rows(),
            k,
            pooled,
            "flat l2 search"
        );

        let rows = distances
            .par_chunks_mut(k)
            .zip(indices.par_chunks_mut(k))
            .enumerate();
        if pooled {
            // one heap per worker, reused across its queries
            rows.for_each_init(
                || BinaryHeap::with_capacity(capacity),
                |heap, (q, (d_out, i_out))| select_row(heap, &base, queries.row(q), k, d_out, i_out),
            );
        } else {
            rows.for_each(|(q, (d_out, i_out))| {
                let mut heap = BinaryHeap::with_capacity(capacity);
                select_row(&mut heap, &base, queries.row(q), k, d_out, i_out)
            });
        }

        Ok(())
    }
}

/// Keep the k best rows of `base` for one query in a bounded max-heap
fn select_row(
    heap: &mut BinaryHeap<Candidate>,
    base: &MatrixView<'_>,
    query: &[f32],
    k: usize,
    d_out: &mut [f32],
    i_out: &mut [i64],
) {
    heap.clear();
    for row in 0..base.rows() {
        let candidate = Candidate {
            distance: l2_squared(base.row(row), query),
            index: row as i64,
        };
        if heap.len() < k {
            heap.push(candidate);
        } else if heap.peek().map_or(false, |worst| candidate < *worst) {
            heap.pop();
            heap.push(candidate);
        }
    }

    // ascending; drains the heap but keeps its allocation
    let mut ranked = Vec::with_capacity(heap.len());
    while let Some(c) = heap.pop() {
        ranked.push(c);
    }
    ranked.reverse();

    for j in 0..k {
        match ranked.get(j) {
            Some(c) => {
                d_out[j] = c.distance;
                i_out[j] = c.index;
            }
            None => {
                d_out[j] = f32::INFINITY;
                i_out[j] = SENTINEL_INDEX;
            }
        }
    }
}
