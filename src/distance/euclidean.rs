//! Squared Euclidean distance for the host top-k primitive

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

const LANES: usize = 8;

/// Squared L2 distance between two equally sized vectors
///
/// This is the unexpanded form, `sum((a_i - b_i)^2)`, which is what the host
/// top-k primitive ranks by. The square root is applied (if at all) only
/// after shard results have been merged.
///
/// # Panics
/// Panics if vectors have different dimensions
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    #[cfg(target_arch = "x86_64")]
    if a.len() >= LANES && is_x86_feature_detected!("avx2") {
        // SAFETY: avx2 availability was checked at runtime
        return unsafe { l2_squared_avx2(a, b) };
    }

    l2_squared_lanes(a, b)
}

/// Portable form: eight independent accumulators the compiler can keep in
/// one vector register, then a scalar tail
fn l2_squared_lanes(a: &[f32], b: &[f32]) -> f32 {
    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let tail: f32 = a_chunks
        .remainder()
        .iter()
        .zip(b_chunks.remainder())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();

    let mut acc = [0.0f32; LANES];
    for (ca, cb) in a_chunks.zip(b_chunks) {
        for lane in 0..LANES {
            let diff = ca[lane] - cb[lane];
            acc[lane] += diff * diff;
        }
    }
    acc.iter().sum::<f32>() + tail
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let tail = l2_squared_lanes(a_chunks.remainder(), b_chunks.remainder());

    let mut acc = _mm256_setzero_ps();
    for (ca, cb) in a_chunks.zip(b_chunks) {
        let diff = _mm256_sub_ps(_mm256_loadu_ps(ca.as_ptr()), _mm256_loadu_ps(cb.as_ptr()));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
    }

    let mut lanes = [0.0f32; LANES];
    _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
    lanes.iter().sum::<f32>() + tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared_basic() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((l2_squared(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_squared_same_vector() {
        let a = vec![1.0, 2.0, 3.0];
        assert_eq!(l2_squared(&a, &a), 0.0);
    }

    #[test]
    #[should_panic(expected = "Vector dimensions must match")]
    fn test_l2_squared_dimension_mismatch() {
        l2_squared(&[1.0, 2.0], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_path_matches_naive_sum() {
        // 19 values: two full lanes of 8 plus a tail of 3
        let a: Vec<f32> = (0..19).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..19).map(|i| (19 - i) as f32 * 0.25).collect();
        let naive: f32 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();

        let fast = l2_squared(&a, &b);
        let lanes = l2_squared_lanes(&a, &b);
        assert!((fast - naive).abs() < 1e-3, "{} vs {}", fast, naive);
        assert!((lanes - naive).abs() < 1e-3, "{} vs {}", lanes, naive);
    }

    #[test]
    fn test_l2_squared_large_vectors() {
        let a: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..1000).map(|i| (i * 2) as f32).collect();
        let dist = l2_squared(&a, &b);
        assert!(dist.is_finite());
        assert!(dist > 0.0);
    }
}
