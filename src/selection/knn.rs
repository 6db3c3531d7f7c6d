//! Caller-facing brute-force kNN over sharded, device-resident data

use super::comparator::SelectOrder;
use super::dispatch::{ShardDispatcher, ShardFailure};
use super::merge::merge_tables;
use super::primitive::{FlatL2Primitive, KnnPrimitive};
use super::{resolve_translations, MatrixView, Shard};
use crate::config::KnnConfig;
use crate::device::{slice_attributes, DeviceRuntime, ExecutionContext, MemoryKind};
use crate::linalg::unary_op;
use crate::{KnnError, Result};
use std::borrow::Cow;
use std::sync::Arc;

/// Outcome of a search that returned complete output buffers
#[derive(Debug, Default)]
pub struct SearchReport {
    /// Shards skipped because their worker failed
    pub shard_failures: Vec<ShardFailure>,
    /// Number of shards searched
    pub shards: usize,
    /// Translations were derived from shard sizes
    pub synthesized_translations: bool,
}

impl SearchReport {
    /// Every shard contributed
    pub fn is_complete(&self) -> bool {
        self.shard_failures.is_empty()
    }

    pub fn failed_shards(&self) -> Vec<usize> {
        self.shard_failures.iter().map(|f| f.shard).collect()
    }
}

/// Exact kNN across shards that may live on different devices
///
/// ## Flow
/// 1. Validate shapes and buffer residency (fatal, outputs untouched)
/// 2. Fan out one primitive call per shard ([`ShardDispatcher`])
/// 3. K-way merge into the caller's buffers ([`merge_tables`])
/// 4. Square root of final distances for [`L2SqrtUnexpanded`](crate::DistanceType::L2SqrtUnexpanded)
pub struct BruteForceKnn<R, P = FlatL2Primitive> {
    runtime: Arc<R>,
    primitive: P,
    config: KnnConfig,
    pool: Option<rayon::ThreadPool>,
}

impl<R: DeviceRuntime> BruteForceKnn<R, FlatL2Primitive> {
    /// Search with the host brute-force primitive
    pub fn flat(runtime: Arc<R>, config: KnnConfig) -> Result<Self> {
        Self::new(runtime, FlatL2Primitive, config)
    }
}

impl<R, P> BruteForceKnn<R, P>
where
    R: DeviceRuntime,
    P: KnnPrimitive,
{
    pub fn new(runtime: Arc<R>, primitive: P, config: KnnConfig) -> Result<Self> {
        config.validate()?;

        let pool = match config.num_threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("shardknn-{}", i))
                    .build()
                    .map_err(|e| KnnError::Config(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            runtime,
            primitive,
            config,
            pool,
        })
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    /// Find the `k` nearest rows across all `shards` for every query row
    ///
    /// # Arguments
    /// * `shards` - device-resident partitions, all with the queries' dimension
    /// * `queries` - device-resident `n × dim` matrix
    /// * `k` - neighbors per query
    /// * `translations` - global offset per shard; prefix sum of shard sizes if `None`
    /// * `ctx` - caller's execution context, synchronized before returning
    /// * `out_distances` / `out_indices` - device-resident `n × k` outputs
    ///
    /// Shards that cannot be searched are reported in the returned
    /// [`SearchReport`] and contribute no candidates; queries left with fewer
    /// than `k` neighbors are padded with index `-1` and `+inf`.
    #[allow(clippy::too_many_arguments)]
    pub fn search(
        &self,
        shards: &[Shard<'_>],
        queries: &MatrixView<'_>,
        k: usize,
        translations: Option<&[i64]>,
        ctx: &ExecutionContext,
        out_distances: &mut [f32],
        out_indices: &mut [i64],
    ) -> Result<SearchReport> {
        self.validate(shards, queries, k, out_distances, out_indices)?;
        let translations = resolve_translations(translations, shards)?;

        let mut report = SearchReport {
            shard_failures: Vec::new(),
            shards: shards.len(),
            synthesized_translations: matches!(translations, Cow::Owned(_)),
        };
        if k == 0 {
            return Ok(report);
        }

        if self.config.sync_before_dispatch {
            self.runtime.synchronize(ctx)?;
        }

        let metric = self.config.metric;
        report.shard_failures = self.install(|| -> Result<Vec<ShardFailure>> {
            let dispatcher = ShardDispatcher::new(self.runtime.as_ref(), &self.primitive, metric);
            let (stacked, failures) = dispatcher.dispatch(shards, queries, k)?;

            merge_tables(
                queries.rows(),
                k,
                shards.len(),
                out_distances,
                out_indices,
                &stacked.distances,
                &stacked.indices,
                &translations,
                SelectOrder::Nearest,
            )?;

            // only after the merge, so ranking uses the untransformed metric
            if metric.requires_sqrt() {
                unary_op(ctx, out_distances, f32::sqrt);
            }
            Ok(failures)
        })?;

        self.runtime.synchronize(ctx)?;

        if !report.is_complete() {
            tracing::warn!(
                failed = ?report.failed_shards(),
                shards = report.shards,
                "search completed without some shards"
            );
        }
        Ok(report)
    }

    fn validate(
        &self,
        shards: &[Shard<'_>],
        queries: &MatrixView<'_>,
        k: usize,
        out_distances: &[f32],
        out_indices: &[i64],
    ) -> Result<()> {
        for (s, shard) in shards.iter().enumerate() {
            if shard.dim() != queries.dim() {
                return Err(KnnError::ShapeMismatch(format!(
                    "shard {} has dim {}, queries have dim {}",
                    s,
                    shard.dim(),
                    queries.dim()
                )));
            }
        }

        let expected = queries.rows().checked_mul(k).ok_or_else(|| {
            KnnError::ShapeMismatch(format!(
                "{} queries × k={} overflows usize",
                queries.rows(),
                k
            ))
        })?;
        if out_distances.len() != expected || out_indices.len() != expected {
            return Err(KnnError::ShapeMismatch(format!(
                "outputs hold {} distances and {} indices, expected {} × {} = {}",
                out_distances.len(),
                out_indices.len(),
                queries.rows(),
                k,
                expected
            )));
        }

        self.require_device_memory(queries.data(), "search items")?;
        self.require_device_memory(out_indices, "output index array")?;
        self.require_device_memory(out_distances, "output distance array")
    }

    fn require_device_memory<T>(&self, data: &[T], what: &str) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let att = slice_attributes(self.runtime.as_ref(), data)?;
        if att.kind != MemoryKind::Device {
            return Err(KnnError::InvalidArgument(format!("{} must be device memory", what)));
        }
        Ok(())
    }

    fn install<T, F>(&self, op: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}
