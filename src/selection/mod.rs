//! Sharded top-k selection
//!
//! ## Pipeline
//! 1. [`ShardDispatcher`] runs the top-k primitive once per shard, each on
//!    the device that owns the shard, into a stacked `shards × n × k` buffer.
//! 2. [`merge_tables`] k-way merges the per-shard lists of every query,
//!    remapping shard-local row ids through the translation offsets.
//! 3. [`BruteForceKnn`] ties both together behind the caller-facing contract
//!    and applies the square-root post-transform when the metric asks for it.

pub mod comparator;
pub mod dispatch;
pub mod knn;
pub mod merge;
pub mod primitive;

pub use comparator::SelectOrder;
pub use dispatch::{ShardDispatcher, ShardFailure, StackedTopK};
pub use knn::{BruteForceKnn, SearchReport};
pub use merge::merge_tables;
pub use primitive::{FlatL2Primitive, KnnPrimitive, TopKRequest};

use crate::device::DeviceBuffer;
use crate::{KnnError, Result};
use std::borrow::Cow;

/// Index value marking "no neighbor"
pub const SENTINEL_INDEX: i64 = -1;

/// Borrowed row-major `rows × dim` matrix
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a> {
    data: &'a [f32],
    rows: usize,
    dim: usize,
}

/// One partition of the searchable collection
pub type Shard<'a> = MatrixView<'a>;

impl<'a> MatrixView<'a> {
    pub fn new(data: &'a [f32], rows: usize, dim: usize) -> Result<Self> {
        let expected = rows.checked_mul(dim).ok_or_else(|| {
            KnnError::ShapeMismatch(format!("{} rows × {} dims overflows", rows, dim))
        })?;
        if data.len() != expected {
            return Err(KnnError::ShapeMismatch(format!(
                "expected {} × {} = {} values, got {}",
                rows,
                dim,
                expected,
                data.len()
            )));
        }
        Ok(Self { data, rows, dim })
    }

    /// View a device buffer as `len / dim` rows
    pub fn from_buffer(buffer: &'a DeviceBuffer<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(KnnError::ShapeMismatch("dimension must be non-zero".to_string()));
        }
        if buffer.len() % dim != 0 {
            return Err(KnnError::ShapeMismatch(format!(
                "buffer of {} values is not a multiple of dim {}",
                buffer.len(),
                dim
            )));
        }
        Self::new(buffer.as_slice(), buffer.len() / dim, dim)
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, i: usize) -> &'a [f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

/// Offset of every shard in the global index space: the sum of the sizes of
/// all shards before it, in input order
///
/// Fails with `ShapeMismatch` if the total row count does not fit in `i64`.
pub fn prefix_sum_translations(shards: &[Shard<'_>]) -> Result<Vec<i64>> {
    let mut total = 0i64;
    shards
        .iter()
        .map(|shard| -> Result<i64> {
            let offset = total;
            total = global_end(offset, shard.rows()).ok_or_else(|| {
                KnnError::ShapeMismatch(format!(
                    "shard sizes exceed the i64 index space at {} + {} rows",
                    offset,
                    shard.rows()
                ))
            })?;
            Ok(offset)
        })
        .collect()
}

/// First global index past a shard of `rows` rows starting at `offset`
fn global_end(offset: i64, rows: usize) -> Option<i64> {
    i64::try_from(rows).ok().and_then(|rows| offset.checked_add(rows))
}

/// Caller translations if supplied (one per shard), otherwise a synthesized prefix sum
///
/// Supplied translations must be non-negative and leave every shard's last
/// global index representable as `i64`; otherwise `InvalidArgument`.
pub fn resolve_translations<'t>(
    supplied: Option<&'t [i64]>,
    shards: &[Shard<'_>],
) -> Result<Cow<'t, [i64]>> {
    match supplied {
        Some(translations) => {
            if translations.len() != shards.len() {
                return Err(KnnError::ShapeMismatch(format!(
                    "{} translations for {} shards",
                    translations.len(),
                    shards.len()
                )));
            }
            for (s, (&offset, shard)) in translations.iter().zip(shards).enumerate() {
                if offset < 0 || global_end(offset, shard.rows()).is_none() {
                    return Err(KnnError::InvalidArgument(format!(
                        "translation {} of shard {} ({} rows) is outside the i64 index space",
                        offset,
                        s,
                        shard.rows()
                    )));
                }
            }
            tracing::debug!(?translations, "using caller translations");
            Ok(Cow::Borrowed(translations))
        }
        None => {
            let translations = prefix_sum_translations(shards)?;
            tracing::debug!(?translations, "synthesized prefix-sum translations");
            Ok(Cow::Owned(translations))
        }
    }
}
