//! Distance kernels for the three supported spaces.
//!
//! Every function returns a *distance* (lower is closer) so callers can sort
//! ascending and keep the first `k` hits.

use crate::types::DistanceSpace;

/// Dispatch to the kernel for `space`.
#[inline]
pub fn compute_distance(a: &[f32], b: &[f32], space: DistanceSpace) -> f32 {
    match space {
        DistanceSpace::L2 => l2_distance(a, b),
        DistanceSpace::Cosine => cosine_distance(a, b),
        DistanceSpace::Ip => inner_product_distance(a, b),
    }
}

/// Squared Euclidean distance. The square root is skipped since it does
/// not change the ranking.
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    let mut sum: f32 = 0.0;
    let chunks = a.len() / 8;

    for i in 0..chunks {
        let base = i * 8;
        let mut tmp = [0.0f32; 8];
        for j in 0..8 {
            let d = a[base + j] - b[base + j];
            tmp[j] = d * d;
        }
        for val in tmp {
            sum += val;
        }
    }

    for i in chunks * 8..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// `1 - cosine_similarity(a, b)`. Zero-magnitude input counts as
/// orthogonal (distance 1.0).
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    let mut dot: f32 = 0.0;
    let mut norm_a: f32 = 0.0;
    let mut norm_b: f32 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }
    // Clamp for floating-point drift.
    1.0 - (dot / denom).clamp(-1.0, 1.0)
}

/// `1 - dot(a, b)`.
#[inline]
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");
    let mut sum: f32 = 0.0;
    let chunks = a.len() / 8;

    for i in 0..chunks {
        let base = i * 8;
        let mut tmp = [0.0f32; 8];
        for j in 0..8 {
            tmp[j] = a[base + j] * b[base + j];
        }
        for val in tmp {
            sum += val;
        }
    }

    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    1.0 - sum
}
