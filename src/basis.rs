use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

/// Smallest control-point count that spans a cubic B-spline basis with one
/// padding point beyond each end of the bin range.
pub const MIN_CONTROL_POINTS: usize = 4;

/// Below this count the fixed curvature edge stencils overlap.
const STENCIL_MIN_CONTROL_POINTS: usize = 6;

const UNIFORM_SPACING_REL_TOL: f64 = 1e-9;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("At least two bin edges are required, but {0} were provided.")]
    TooFewEdges(usize),

    #[error("Bin edge {index} is not finite ({value}).")]
    NonFiniteEdge { index: usize, value: f64 },

    #[error(
        "Bin edges must be strictly increasing: edge {index} ({value}) does not exceed the preceding edge ({previous})."
    )]
    NonIncreasingEdges {
        index: usize,
        value: f64,
        previous: f64,
    },

    #[error("At least 4 control points are required, but {0} were requested.")]
    TooFewControlPoints(usize),

    #[error("Control points must be finite, strictly increasing and uniformly spaced: {0}")]
    InvalidControlPoints(String),

    #[error(
        "Integration interval is inverted: tmin ({tmin}) > tmax ({tmax}). Bin edges or control points are malformed."
    )]
    InvertedInterval { tmin: f64, tmax: f64 },
}

fn validate_edges(bin_edges: ArrayView1<f64>) -> Result<(), BasisError> {
    if bin_edges.len() < 2 {
        return Err(BasisError::TooFewEdges(bin_edges.len()));
    }
    for (index, &value) in bin_edges.iter().enumerate() {
        if !value.is_finite() {
            return Err(BasisError::NonFiniteEdge { index, value });
        }
        if index > 0 && value <= bin_edges[index - 1] {
            return Err(BasisError::NonIncreasingEdges {
                index,
                value,
                previous: bin_edges[index - 1],
            });
        }
    }
    Ok(())
}

/// Places `count` control points evenly over the bin range, with exactly one
/// point beyond each end: `c_k = min + d·(k − 1)`, `d = (max − min)/(count − 3)`.
pub fn control_points(bin_edges: ArrayView1<f64>, count: usize) -> Result<Array1<f64>, BasisError> {
    validate_edges(bin_edges)?;
    if count < MIN_CONTROL_POINTS {
        return Err(BasisError::TooFewControlPoints(count));
    }
    let lo = bin_edges[0];
    let hi = bin_edges[bin_edges.len() - 1];
    let spacing = (hi - lo) / (count - 3) as f64;
    Ok(Array1::from_shape_fn(count, |k| {
        lo + spacing * (k as f64 - 1.0)
    }))
}

/// Returns the uniform spacing of a validated control-point vector.
fn control_point_spacing(control_points: ArrayView1<f64>) -> Result<f64, BasisError> {
    let n = control_points.len();
    if n < MIN_CONTROL_POINTS {
        return Err(BasisError::TooFewControlPoints(n));
    }
    if !control_points.iter().all(|c| c.is_finite()) {
        return Err(BasisError::InvalidControlPoints(
            "non-finite position".to_string(),
        ));
    }
    let spacing = (control_points[n - 1] - control_points[0]) / (n - 1) as f64;
    if !(spacing > 0.0) {
        return Err(BasisError::InvalidControlPoints(format!(
            "non-positive spacing {spacing}"
        )));
    }
    for k in 1..n {
        let step = control_points[k] - control_points[k - 1];
        if (step - spacing).abs() > UNIFORM_SPACING_REL_TOL * spacing {
            return Err(BasisError::InvalidControlPoints(format!(
                "step {k} is {step}, expected {spacing}"
            )));
        }
    }
    Ok(spacing)
}

/// Maps a position onto the control-point index axis: the first bin edge maps
/// to 0 and the last to `count − 3`.
#[inline]
fn to_spline_coordinate(x: f64, first_control_point: f64, spacing: f64) -> f64 {
    (x - first_control_point) / spacing - 1.0
}

/// Knot boundaries of the six pieces in the local coordinate `s = t − k`.
const PIECE_BOUNDS: [f64; 7] = [
    f64::NEG_INFINITY,
    -3.0,
    -2.0,
    -1.0,
    0.0,
    1.0,
    f64::INFINITY,
];

#[inline]
fn piece_index(s: f64) -> usize {
    if s < -3.0 {
        0
    } else if s < -2.0 {
        1
    } else if s < -1.0 {
        2
    } else if s < 0.0 {
        3
    } else if s < 1.0 {
        4
    } else {
        5
    }
}

/// Antiderivative of six times the unit cubic B-spline on one piece.
#[inline]
fn piece_antiderivative(s: f64, piece: usize) -> f64 {
    match piece {
        1 => (s + 3.0).powi(4) / 4.0,
        2 => -0.75 * s.powi(4) - 5.0 * s.powi(3) - 10.5 * s * s - 5.0 * s,
        3 => 0.75 * s.powi(4) + s.powi(3) - 1.5 * s * s + s,
        4 => -(1.0 - s).powi(4) / 4.0,
        _ => 0.0,
    }
}

/// Exact integral over `[tmin, tmax]` of the cubic B-spline with index `index`.
///
/// Coordinates are in control-point units; the spline of index `k` is centred
/// at `t = k − 1` and supported on `[k − 3, k + 1]`. Each spline integrates to
/// one over its full support.
pub fn spline_integral(tmin: f64, tmax: f64, index: usize) -> Result<f64, BasisError> {
    if tmin > tmax {
        return Err(BasisError::InvertedInterval { tmin, tmax });
    }
    let shift = index as f64;
    let smin = tmin - shift;
    let smax = tmax - shift;
    let first = piece_index(smin);
    let last = piece_index(smax);

    let mut total = 0.0;
    for piece in first..=last {
        let lo = smin.max(PIECE_BOUNDS[piece]);
        let hi = smax.min(PIECE_BOUNDS[piece + 1]);
        total += piece_antiderivative(hi, piece) - piece_antiderivative(lo, piece);
    }
    Ok(total / 6.0)
}

/// Matrix of cubic B-splines integrated over each bin.
///
/// Entry `(i, k)` is the integral of spline `k` over bin `i`, divided by the
/// bin width in control-point units, i.e. the bin-averaged spline value. Rows
/// of bins inside the control-point range sum to one.
pub fn basis_matrix(
    bin_edges: ArrayView1<f64>,
    control_points: ArrayView1<f64>,
) -> Result<Array2<f64>, BasisError> {
    validate_edges(bin_edges)?;
    let spacing = control_point_spacing(control_points)?;
    let origin = control_points[0];
    let t: Array1<f64> = bin_edges.mapv(|x| to_spline_coordinate(x, origin, spacing));

    let num_bins = t.len() - 1;
    let num_points = control_points.len();
    let mut basis = Array2::<f64>::zeros((num_bins, num_points));
    for i in 0..num_bins {
        let (tmin, tmax) = (t[i], t[i + 1]);
        let width = tmax - tmin;
        // Only splines whose support [k - 3, k + 1] meets the bin contribute.
        let k_lo = (tmin - 1.0).floor().max(0.0) as usize;
        let k_hi = ((tmax + 3.0).ceil().max(0.0) as usize).min(num_points - 1);
        for k in k_lo..=k_hi {
            basis[[i, k]] = spline_integral(tmin, tmax, k)? / width;
        }
    }
    Ok(basis)
}

/// Second derivative of the unit cubic B-spline centred at zero.
#[inline]
fn centred_second_derivative(u: f64) -> f64 {
    let a = u.abs();
    if a <= 1.0 {
        3.0 * a - 2.0
    } else if a <= 2.0 {
        2.0 - a
    } else {
        0.0
    }
}

/// `6·∫ B_j''(t) B_k''(t) dt` over the bin range `[0, count − 3]`.
///
/// `B''` is linear between integer knots, so Simpson's rule on each unit
/// interval is exact.
fn curvature_gram(count: usize) -> Array2<f64> {
    let second = |k: usize, t: f64| centred_second_derivative(t - (k as f64 - 1.0));
    let mut gram = Array2::<f64>::zeros((count, count));
    for a in 0..count - 3 {
        let nodes = [a as f64, a as f64 + 0.5, a as f64 + 1.0];
        let weights = [1.0, 4.0, 1.0];
        for j in 0..count {
            for k in j..count {
                let mut acc = 0.0;
                for (&t, &w) in nodes.iter().zip(weights.iter()) {
                    acc += w * second(j, t) * second(k, t);
                }
                gram[[j, k]] += acc;
            }
        }
    }
    for j in 0..count {
        for k in 0..j {
            gram[[j, k]] = gram[[k, j]];
        }
    }
    gram
}

const INTERIOR_STENCIL: [f64; 7] = [1.0, 0.0, -9.0, 16.0, -9.0, 0.0, 1.0];
const EDGE_STENCILS: [(&[f64], usize); 3] = [
    (&[2.0, -3.0, 0.0, 1.0], 0),
    (&[-3.0, 8.0, -6.0, 0.0, 1.0], 0),
    (&[-6.0, 14.0, -9.0, 0.0, 1.0], 1),
];

/// Curvature penalty for `count` cubic B-spline coefficients.
///
/// Interior rows carry the stencil `{1, 0, −9, 16, −9, 0, 1}`; the first and
/// last three rows carry edge stencils (mirrored at the upper end) that
/// account for splines cut off by the bin range. Below six points the edge
/// stencils would overlap and the matrix is taken from the exact
/// second-derivative integral instead, which the stencils reproduce for
/// larger counts.
pub fn curvature_matrix(count: usize) -> Result<Array2<f64>, BasisError> {
    if count < MIN_CONTROL_POINTS {
        return Err(BasisError::TooFewControlPoints(count));
    }
    if count < STENCIL_MIN_CONTROL_POINTS {
        return Ok(curvature_gram(count));
    }

    let mut c = Array2::<f64>::zeros((count, count));
    for row in 0..count {
        if row < EDGE_STENCILS.len() {
            let (stencil, start) = EDGE_STENCILS[row];
            for (offset, &value) in stencil.iter().enumerate() {
                c[[row, start + offset]] = value;
            }
        } else if row >= count - EDGE_STENCILS.len() {
            let (stencil, start) = EDGE_STENCILS[count - 1 - row];
            let mirrored_start = count - start - stencil.len();
            for (offset, &value) in stencil.iter().rev().enumerate() {
                c[[row, mirrored_start + offset]] = value;
            }
        } else {
            for (offset, &value) in INTERIOR_STENCIL.iter().enumerate() {
                c[[row, row - 3 + offset]] = value;
            }
        }
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn uniform_edges(lo: f64, hi: f64, bins: usize) -> Array1<f64> {
        Array1::linspace(lo, hi, bins + 1)
    }

    #[test]
    fn control_points_pad_one_spacing_beyond_each_end() {
        let edges = uniform_edges(-10.0, 10.0, 20);
        let cp = control_points(edges.view(), 7).unwrap();
        assert_eq!(cp.len(), 7);
        // d = 20 / 4 = 5
        let expected = array![-15.0, -10.0, -5.0, 0.0, 5.0, 10.0, 15.0];
        assert_abs_diff_eq!(
            cp.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn control_points_reject_bad_inputs() {
        let edges = uniform_edges(0.0, 1.0, 4);
        assert!(matches!(
            control_points(edges.view(), 3),
            Err(BasisError::TooFewControlPoints(3))
        ));
        let unordered = array![0.0, 2.0, 1.0];
        assert!(matches!(
            control_points(unordered.view(), 5),
            Err(BasisError::NonIncreasingEdges { index: 2, .. })
        ));
        let single = array![1.0];
        assert!(matches!(
            control_points(single.view(), 5),
            Err(BasisError::TooFewEdges(1))
        ));
    }

    #[test]
    fn spline_integrates_to_one_over_full_support() {
        for k in 0..5 {
            let full = spline_integral(-100.0, 100.0, k).unwrap();
            assert_abs_diff_eq!(full, 1.0, epsilon = 1e-12);
            let left_half = spline_integral(k as f64 - 3.0, k as f64 - 1.0, k).unwrap();
            assert_abs_diff_eq!(left_half, 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn spline_integral_is_additive_across_knots() {
        let whole = spline_integral(-2.7, 0.4, 1).unwrap();
        let split = spline_integral(-2.7, -1.3, 1).unwrap() + spline_integral(-1.3, 0.4, 1).unwrap();
        assert_abs_diff_eq!(whole, split, epsilon = 1e-13);
    }

    #[test]
    fn spline_peak_value_matches_cubic_bspline() {
        // Bin-averaged value over a vanishing bin at the centre is B(0) = 2/3.
        let h = 1e-6;
        let value = spline_integral(-1.0 - h, -1.0 + h, 0).unwrap() / (2.0 * h);
        assert_abs_diff_eq!(value, 2.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn inverted_interval_is_reported() {
        assert!(matches!(
            spline_integral(1.0, 0.0, 0),
            Err(BasisError::InvertedInterval { .. })
        ));
    }

    #[test]
    fn basis_rows_form_partition_of_unity() {
        let edges = uniform_edges(-10.0, 10.0, 20);
        for count in [4, 5, 9, 20] {
            let cp = control_points(edges.view(), count).unwrap();
            let b = basis_matrix(edges.view(), cp.view()).unwrap();
            assert_eq!(b.dim(), (20, count));
            for row in b.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
                assert!(row.iter().all(|&v| v >= -1e-15));
            }
        }
    }

    #[test]
    fn basis_rows_sum_to_one_for_non_uniform_bins() {
        let edges = array![0.0, 0.3, 1.0, 1.2, 2.5, 4.0, 4.1, 6.0];
        let cp = control_points(edges.view(), 8).unwrap();
        let b = basis_matrix(edges.view(), cp.view()).unwrap();
        for row in b.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn basis_rejects_non_uniform_control_points() {
        let edges = uniform_edges(0.0, 1.0, 4);
        let cp = array![-0.5, 0.0, 0.4, 1.0, 1.5];
        assert!(matches!(
            basis_matrix(edges.view(), cp.view()),
            Err(BasisError::InvalidControlPoints(_))
        ));
    }

    #[test]
    fn curvature_is_symmetric_with_toeplitz_interior() {
        for count in 6..=15 {
            let c = curvature_matrix(count).unwrap();
            for i in 0..count {
                for j in 0..count {
                    assert_eq!(c[[i, j]], c[[j, i]], "asymmetry at ({i},{j}) for M={count}");
                }
            }
            for row in 3..count.saturating_sub(3) {
                for (offset, &value) in INTERIOR_STENCIL.iter().enumerate() {
                    assert_eq!(c[[row, row - 3 + offset]], value);
                }
            }
        }
    }

    #[test]
    fn curvature_stencils_match_exact_second_derivative_integral() {
        for count in 6..=12 {
            let stencil = curvature_matrix(count).unwrap();
            let exact = curvature_gram(count);
            for (x, y) in stencil.iter().zip(exact.iter()) {
                assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn curvature_annihilates_linear_coefficients() {
        for count in 4..=10 {
            let c = curvature_matrix(count).unwrap();
            let constant = Array1::<f64>::ones(count);
            let linear = Array1::from_shape_fn(count, |k| k as f64);
            for v in [c.dot(&constant), c.dot(&linear)] {
                assert!(v.iter().all(|x| x.abs() < 1e-12));
            }
        }
    }

    #[test]
    fn curvature_rejects_too_few_points() {
        assert!(matches!(
            curvature_matrix(3),
            Err(BasisError::TooFewControlPoints(3))
        ));
    }
}
