//! Per-shard fan-out of the top-k primitive
//!
//! One worker per shard, run on the device that owns the shard's memory.
//! Every worker writes only its own `n × k` slice of the stacked buffers.
//! A failing shard is logged, its slice is reset to sentinels, and the
//! remaining shards carry on.

use super::comparator::SelectOrder;
use super::primitive::{KnnPrimitive, TopKRequest};
use super::{MatrixView, Shard, SENTINEL_INDEX};
use crate::device::{slice_attributes, ContextOptions, DeviceId, DeviceRuntime, MemoryKind};
use crate::distance::DistanceType;
use crate::{KnnError, Result};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Row-major `nshard × n × k` results, one slice per shard
#[derive(Debug, Clone)]
pub struct StackedTopK {
    pub distances: Vec<f32>,
    pub indices: Vec<i64>,
    stride: usize,
}

impl StackedTopK {
    /// Buffers where every shard initially contributes nothing
    ///
    /// Fails with `ShapeMismatch` if `nshard × n × k` does not fit in `usize`.
    pub fn empty(nshard: usize, n: usize, k: usize, order: SelectOrder) -> Result<Self> {
        let len = n
            .checked_mul(k)
            .and_then(|stride| stride.checked_mul(nshard).map(|len| (stride, len)));
        let Some((stride, len)) = len else {
            return Err(KnnError::ShapeMismatch(format!(
                "stacked results of {} shards x {} queries x k={} overflow usize",
                nshard, n, k
            )));
        };
        Ok(Self {
            distances: vec![order.neutral(); len],
            indices: vec![SENTINEL_INDEX; len],
            stride,
        })
    }

    /// Elements per shard
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Distances and local indices written by one shard
    pub fn shard(&self, s: usize) -> (&[f32], &[i64]) {
        let range = s * self.stride()..(s + 1) * self.stride();
        (&self.distances[range.clone()], &self.indices[range])
    }
}

/// A shard that contributed no candidates because its worker failed
#[derive(Debug)]
pub struct ShardFailure {
    pub shard: usize,
    pub rows: usize,
    pub error: KnnError,
}

/// Runs the top-k primitive once per shard
pub struct ShardDispatcher<'r, R: ?Sized, P: ?Sized> {
    runtime: &'r R,
    primitive: &'r P,
    metric: DistanceType,
}

impl<'r, R, P> ShardDispatcher<'r, R, P>
where
    R: DeviceRuntime + ?Sized,
    P: KnnPrimitive + ?Sized,
{
    pub fn new(runtime: &'r R, primitive: &'r P, metric: DistanceType) -> Self {
        Self {
            runtime,
            primitive,
            metric,
        }
    }

    /// Search every shard against all `queries`
    ///
    /// Only an unrepresentable result shape fails the call as a whole.
    /// Per-shard failures come back alongside the stacked buffers, whose
    /// slices for failed shards hold only sentinels.
    pub fn dispatch(
        &self,
        shards: &[Shard<'_>],
        queries: &MatrixView<'_>,
        k: usize,
    ) -> Result<(StackedTopK, Vec<ShardFailure>)> {
        let order = SelectOrder::Nearest;
        let n = queries.rows();
        let mut stacked = StackedTopK::empty(shards.len(), n, k, order)?;
        let stride = stacked.stride();
        if stride == 0 {
            return Ok((stacked, Vec::new()));
        }

        let failures: Vec<ShardFailure> = stacked
            .distances
            .par_chunks_mut(stride)
            .zip(stacked.indices.par_chunks_mut(stride))
            .zip(shards.par_iter())
            .enumerate()
            .filter_map(|(s, ((d_out, i_out), shard))| {
                let error = self.run_shard(s, shard, queries, k, d_out, i_out).err()?;

                // whatever the primitive wrote before failing must not be merged
                d_out.fill(order.neutral());
                i_out.fill(SENTINEL_INDEX);

                tracing::warn!(shard = s, rows = shard.rows(), error = %error, "shard skipped");
                Some(ShardFailure {
                    shard: s,
                    rows: shard.rows(),
                    error,
                })
            })
            .collect();

        Ok((stacked, failures))
    }

    fn run_shard(
        &self,
        s: usize,
        shard: &Shard<'_>,
        queries: &MatrixView<'_>,
        k: usize,
        d_out: &mut [f32],
        i_out: &mut [i64],
    ) -> Result<()> {
        if shard.is_empty() {
            return Ok(());
        }

        let device = self.owning_device(s, shard)?;
        let ctx = self.runtime.create_context(device, ContextOptions::transient())?;

        let request = TopKRequest {
            base: *shard,
            queries: *queries,
            k,
            metric: self.metric,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.primitive.search(&ctx, &request, d_out, i_out)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err @ KnnError::ResourceExhausted(_))) => return Err(err),
            Ok(Err(err)) => {
                return Err(KnnError::PrimitiveFailure {
                    shard: s,
                    reason: err.to_string(),
                })
            }
            Err(payload) => {
                return Err(KnnError::PrimitiveFailure {
                    shard: s,
                    reason: panic_message(&*payload),
                })
            }
        }

        self.runtime
            .synchronize(&ctx)
            .map_err(|err| KnnError::PrimitiveFailure {
                shard: s,
                reason: err.to_string(),
            })
    }

    fn owning_device(&self, s: usize, shard: &Shard<'_>) -> Result<DeviceId> {
        let att = slice_attributes(self.runtime, shard.data()).map_err(|err| {
            KnnError::InvalidShardMemory {
                shard: s,
                reason: err.to_string(),
            }
        })?;
        match (att.kind, att.device) {
            (MemoryKind::Device, Some(device)) if device.0 < self.runtime.device_count() => Ok(device),
            (MemoryKind::Device, Some(device)) => Err(KnnError::InvalidShardMemory {
                shard: s,
                reason: format!(
                    "owner {} is outside the runtime's {} devices",
                    device,
                    self.runtime.device_count()
                ),
            }),
            _ => Err(KnnError::InvalidShardMemory {
                shard: s,
                reason: format!(
                    "{:p} is not device memory (N={})",
                    shard.data().as_ptr(),
                    shard.rows()
                ),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, ExecutionContext, HostRuntime, PointerAttributes};
    use crate::selection::primitive::FlatL2Primitive;

    /// Fails (or panics) on any base set with the given row count
    struct Faulty {
        rows: usize,
        panic: bool,
    }

    impl KnnPrimitive for Faulty {
        fn search(
            &self,
            ctx: &ExecutionContext,
            request: &TopKRequest<'_>,
            distances: &mut [f32],
            indices: &mut [i64],
        ) -> Result<()> {
            if request.base.rows() != self.rows {
                return FlatL2Primitive.search(ctx, request, distances, indices);
            }
            // scribble first so the dispatcher has to clean up
            distances.fill(0.0);
            indices.fill(0);
            if self.panic {
                panic!("kernel launch failed");
            }
            Err(KnnError::InvalidArgument("bad launch config".to_string()))
        }
    }

    fn shard_buffers(rt: &HostRuntime) -> Vec<DeviceBuffer<f32>> {
        vec![
            rt.alloc(DeviceId(0), vec![0.0, 10.0, 20.0]).unwrap(),
            rt.alloc(DeviceId(1), vec![5.0, 15.0, 25.0, 35.0]).unwrap(),
        ]
    }

    fn views(buffers: &[DeviceBuffer<f32>]) -> Vec<Shard<'_>> {
        buffers.iter().map(|b| MatrixView::from_buffer(b, 1).unwrap()).collect()
    }

    #[test]
    fn test_dispatch_writes_each_shard_slice() {
        let rt = HostRuntime::new(2);
        let buffers = shard_buffers(&rt);
        let shards = views(&buffers);
        let query_buf = rt.alloc(DeviceId(0), vec![6.0f32, 30.0]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 2).unwrap();

        assert!(failures.is_empty());
        assert_eq!(stacked.stride(), 4);

        let (d0, i0) = stacked.shard(0);
        assert_eq!(i0, &[1, 0, 2, 1]);
        assert_eq!(d0, &[16.0, 36.0, 100.0, 400.0]);

        let (_, i1) = stacked.shard(1);
        assert_eq!(i1, &[0, 1, 2, 3]);

        // every worker released its transient context
        for dev in 0..2 {
            let stats = rt.stats(DeviceId(dev)).unwrap();
            assert_eq!(stats.contexts_created, 1);
            assert_eq!(stats.pooled_contexts, 0);
            assert_eq!(stats.live_contexts, 0);
            assert_eq!(stats.synchronizations, 1);
        }
    }

    #[test]
    fn test_host_memory_shard_is_isolated() {
        let rt = HostRuntime::new(2);
        let buffers = shard_buffers(&rt);
        let host_rows = vec![6.0f32, 7.0];
        let mut shards = views(&buffers);
        shards.insert(1, MatrixView::new(&host_rows, 2, 1).unwrap());

        let query_buf = rt.alloc(DeviceId(0), vec![6.0f32]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 2).unwrap();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].shard, 1);
        assert_eq!(failures[0].rows, 2);
        assert!(matches!(failures[0].error, KnnError::InvalidShardMemory { shard: 1, .. }));

        assert_eq!(stacked.shard(1).1, &[-1, -1]);
        assert_eq!(stacked.shard(1).0, &[f32::INFINITY, f32::INFINITY]);
        assert_eq!(stacked.shard(0).1, &[1, 0]);
        assert_eq!(stacked.shard(2).1, &[0, 1]);
    }

    #[test]
    fn test_primitive_error_and_panic_are_isolated() {
        for should_panic in [false, true] {
            let rt = HostRuntime::new(2);
            let buffers = shard_buffers(&rt);
            let shards = views(&buffers);
            let query_buf = rt.alloc(DeviceId(1), vec![6.0f32]).unwrap();
            let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

            let faulty = Faulty { rows: 4, panic: should_panic };
            let dispatcher = ShardDispatcher::new(&rt, &faulty, DistanceType::L2Unexpanded);
            let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 2).unwrap();

            assert_eq!(failures.len(), 1);
            match &failures[0].error {
                KnnError::PrimitiveFailure { shard, reason } => {
                    assert_eq!(*shard, 1);
                    assert_eq!(reason.contains("panicked"), should_panic);
                }
                other => panic!("unexpected error {:?}", other),
            }

            // the scribbled slice was reset
            assert_eq!(stacked.shard(1).1, &[-1, -1]);
            assert_eq!(stacked.shard(0).1, &[1, 0]);

            // context lease was returned on the failure path too
            assert_eq!(rt.stats(DeviceId(1)).unwrap().live_contexts, 0);
        }
    }

    #[test]
    fn test_context_exhaustion_is_isolated() {
        let rt = HostRuntime::new(2);
        rt.set_context_limit(DeviceId(1), Some(0)).unwrap();
        let buffers = shard_buffers(&rt);
        let shards = views(&buffers);
        let query_buf = rt.alloc(DeviceId(0), vec![6.0f32]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 1).unwrap();

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, KnnError::ResourceExhausted(_)));
        assert_eq!(stacked.shard(0).1, &[1]);
        assert_eq!(stacked.shard(1).1, &[-1]);
    }

    /// Attributes every allocation to a device the runtime does not have
    struct StrayOwner(HostRuntime);

    impl DeviceRuntime for StrayOwner {
        fn device_count(&self) -> usize {
            self.0.device_count()
        }

        fn pointer_attributes(&self, _addr: usize, _len_bytes: usize) -> Result<PointerAttributes> {
            Ok(PointerAttributes::device(DeviceId(9)))
        }

        fn create_context(&self, device: DeviceId, options: ContextOptions) -> Result<ExecutionContext> {
            self.0.create_context(device, options)
        }

        fn synchronize(&self, ctx: &ExecutionContext) -> Result<()> {
            self.0.synchronize(ctx)
        }
    }

    #[test]
    fn test_unknown_owner_device_is_invalid_memory() {
        let rt = StrayOwner(HostRuntime::new(2));
        let buffers = shard_buffers(&rt.0);
        let shards = views(&buffers);
        let query_buf = rt.0.alloc(DeviceId(0), vec![6.0f32]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 1).unwrap();

        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|f| matches!(f.error, KnnError::InvalidShardMemory { .. })));
        assert!(stacked.indices.iter().all(|&i| i == -1));
    }

    #[test]
    fn test_oversized_result_shape_is_rejected() {
        let rt = HostRuntime::new(2);
        let buffers = shard_buffers(&rt);
        let shards = views(&buffers);
        let query_buf = rt.alloc(DeviceId(0), vec![6.0f32, 7.0]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let err = dispatcher.dispatch(&shards, &queries, usize::MAX).unwrap_err();
        assert!(matches!(err, KnnError::ShapeMismatch(_)));
        assert!(matches!(
            StackedTopK::empty(3, 1, usize::MAX / 2, SelectOrder::Nearest),
            Err(KnnError::ShapeMismatch(_))
        ));
        assert_eq!(rt.stats(DeviceId(0)).unwrap().contexts_created, 0);
    }

    #[test]
    fn test_empty_shard_is_not_a_failure() {
        let rt = HostRuntime::new(1);
        let buffers = vec![rt.alloc(DeviceId(0), vec![1.0f32, 2.0]).unwrap()];
        let mut shards = views(&buffers);
        shards.push(MatrixView::new(&[], 0, 1).unwrap());

        let query_buf = rt.alloc(DeviceId(0), vec![0.0f32]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 2).unwrap();

        assert!(failures.is_empty());
        assert_eq!(stacked.shard(1).1, &[-1, -1]);
    }

    #[test]
    fn test_zero_k_dispatches_nothing() {
        let rt = HostRuntime::new(2);
        let buffers = shard_buffers(&rt);
        let shards = views(&buffers);
        let query_buf = rt.alloc(DeviceId(0), vec![6.0f32]).unwrap();
        let queries = MatrixView::from_buffer(&query_buf, 1).unwrap();

        let dispatcher = ShardDispatcher::new(&rt, &FlatL2Primitive, DistanceType::L2Unexpanded);
        let (stacked, failures) = dispatcher.dispatch(&shards, &queries, 0).unwrap();

        assert!(failures.is_empty());
        assert!(stacked.distances.is_empty());
        assert_eq!(rt.stats(DeviceId(0)).unwrap().contexts_created, 0);
    }
}
