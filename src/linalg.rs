//! Elementwise buffer transforms

use crate::device::ExecutionContext;
use rayon::prelude::*;

/// Apply `op` to every element of `buf` in place, on `ctx`
pub fn unary_op<T, F>(ctx: &ExecutionContext, buf: &mut [T], op: F)
where
    T: Copy + Send + Sync,
    F: Fn(T) -> T + Send + Sync,
{
    tracing::trace!(device = %ctx.device(), stream = ctx.stream(), len = buf.len(), "unary_op");
    buf.par_iter_mut().for_each(|x| *x = op(*x));
}
