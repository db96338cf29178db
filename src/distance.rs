//! Pairwise distance primitives shared by the squared-exponential kernel and
//! the built-in scaled-Euclidean metric.

use crate::covariance::CovarianceError;
use ndarray::{Array2, ArrayView2};

/// Fail unless both point sets live in the same input dimension.
pub fn check_matching_columns(
    x1: ArrayView2<'_, f64>,
    x2: ArrayView2<'_, f64>,
) -> Result<(), CovarianceError> {
    if x1.ncols() != x2.ncols() {
        return Err(CovarianceError::DimensionMismatch {
            x1_cols: x1.ncols(),
            x2_cols: x2.ncols(),
        });
    }
    Ok(())
}

/// Clamp a scaled squared distance to exactly zero when it falls below
/// machine epsilon, so the diagonal of a self-covariance exponentiates to
/// exactly one.
#[inline]
pub fn clamp_sq_distance(r2: f64) -> f64 {
    if r2 < f64::EPSILON { 0.0 } else { r2 }
}

/// Scaled squared distances `sum_j (x1[p,j] - x2[q,j])^2 * inv_sq[j]` for
/// every pair of rows, clamped at machine epsilon.
pub fn scaled_sq_distances(
    x1: ArrayView2<'_, f64>,
    x2: ArrayView2<'_, f64>,
    inv_sq: &[f64],
) -> Array2<f64> {
    let m = x1.ncols();
    Array2::from_shape_fn((x1.nrows(), x2.nrows()), |(p, q)| {
        let mut r2 = 0.0;
        for j in 0..m {
            let d = x1[[p, j]] - x2[[q, j]];
            r2 += d * d * inv_sq[j];
        }
        clamp_sq_distance(r2)
    })
}

/// Symmetric form of [`scaled_sq_distances`] for one point set: only the
/// lower triangle is computed and then mirrored.
pub fn sym_scaled_sq_distances(x: ArrayView2<'_, f64>, inv_sq: &[f64]) -> Array2<f64> {
    let n = x.nrows();
    let m = x.ncols();
    let mut r2 = Array2::<f64>::zeros((n, n));
    for p in 0..n {
        for q in 0..p {
            let mut acc = 0.0;
            for j in 0..m {
                let d = x[[p, j]] - x[[q, j]];
                acc += d * d * inv_sq[j];
            }
            let acc = clamp_sq_distance(acc);
            r2[[p, q]] = acc;
            r2[[q, p]] = acc;
        }
    }
    r2
}

/// Signed coordinate differences `x1[p, dim] - x2[q, dim]` for every pair of
/// rows.
pub fn coordinate_deltas(
    x1: ArrayView2<'_, f64>,
    x2: ArrayView2<'_, f64>,
    dim: usize,
) -> Array2<f64> {
    Array2::from_shape_fn((x1.nrows(), x2.nrows()), |(p, q)| {
        x1[[p, dim]] - x2[[q, dim]]
    })
}

/// Unordered dimension pairs `(i, j), i < j`, flattened column-wise:
/// `(0,1), (0,2), (1,2), (0,3), ...`. The second-order gradient engine
/// consumes this order positionally.
pub fn column_major_pairs(m: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(m.saturating_sub(1) * m / 2);
    for j in 1..m {
        for i in 0..j {
            pairs.push((i, j));
        }
    }
    pairs
}

/// True when both matrices have identical shape and elements. Used to reject
/// aliased inputs where a dedicated self-covariance path exists.
pub fn same_points(x1: ArrayView2<'_, f64>, x2: ArrayView2<'_, f64>) -> bool {
    x1.shape() == x2.shape() && x1.iter().zip(x2.iter()).all(|(a, b)| a == b)
}
