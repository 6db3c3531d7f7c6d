//! ShardKNN
//!
//! Exact k-nearest-neighbor search over a collection split into shards that
//! may live on different accelerator devices.
//!
//! ## Architecture
//! - Device layer: memory introspection, per-worker execution contexts, scoped device buffers
//! - Dispatch: one top-k primitive call per shard, on the shard's own device
//! - Merge: per-query k-way heap merge of the shard lists into a global top-k
//! - Post-processing: optional square root of the merged L2 distances
//!
//! ## Example
//! ```
//! use shardknn::{BruteForceKnn, DeviceId, ExecutionContext, HostRuntime, KnnConfig, MatrixView};
//! use std::sync::Arc;
//!
//! let rt = Arc::new(HostRuntime::new(2));
//! let a = rt.alloc(DeviceId(0), vec![0.0f32, 10.0, 20.0]).unwrap();
//! let b = rt.alloc(DeviceId(1), vec![5.0f32, 15.0, 25.0]).unwrap();
//! let q = rt.alloc(DeviceId(0), vec![6.0f32]).unwrap();
//! let mut dist = rt.alloc_filled(DeviceId(0), 2, 0.0f32).unwrap();
//! let mut idx = rt.alloc_filled(DeviceId(0), 2, 0i64).unwrap();
//!
//! let shards = [MatrixView::from_buffer(&a, 1).unwrap(), MatrixView::from_buffer(&b, 1).unwrap()];
//! let queries = MatrixView::from_buffer(&q, 1).unwrap();
//!
//! let knn = BruteForceKnn::flat(Arc::clone(&rt), KnnConfig::l2_sqrt()).unwrap();
//! let ctx = ExecutionContext::new(DeviceId(0), 0);
//! knn.search(&shards, &queries, 2, None, &ctx, dist.as_mut_slice(), idx.as_mut_slice()).unwrap();
//!
//! assert_eq!(idx.to_vec(), vec![3, 1]);
//! assert_eq!(dist.to_vec(), vec![1.0, 4.0]);
//! ```

pub mod config;
pub mod device;
pub mod distance;
pub mod linalg;
pub mod selection;

mod error;

pub use config::KnnConfig;
pub use device::{
    ContextOptions, DeviceBuffer, DeviceId, DeviceRuntime, DeviceStats, ExecutionContext, HostRuntime,
    MemoryKind, PointerAttributes,
};
pub use distance::DistanceType;
pub use error::{KnnError, Result};
pub use selection::{
    merge_tables, BruteForceKnn, FlatL2Primitive, KnnPrimitive, MatrixView, SearchReport, SelectOrder,
    Shard, ShardDispatcher, ShardFailure, StackedTopK, TopKRequest, SENTINEL_INDEX,
};
