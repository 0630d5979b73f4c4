use super::{LinearSystem, SolverError};
use crate::linalg::faer_ndarray::fast_ab;
use crate::linalg::utils::{diagonal_similarity, similarity, symmetric_inverse};
use crate::types::ControlPointValues;
use ndarray::{Array1, Array2};

/// Control-point values, truth-bin contents, and their covariances for one
/// `(M, τ)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularizedSolution {
    pub control_point_values: ControlPointValues,
    pub truth: Array1<f64>,
    pub control_point_covariance: Array2<f64>,
    pub truth_covariance: Array2<f64>,
}

impl RegularizedSolution {
    fn zeros(num_truth: usize, num_points: usize) -> Self {
        Self {
            control_point_values: ControlPointValues::zeros(num_points),
            truth: Array1::zeros(num_truth),
            control_point_covariance: Array2::zeros((num_points, num_points)),
            truth_covariance: Array2::zeros((num_truth, num_truth)),
        }
    }
}

/// Solves `(H + τC)·p = h·y` and propagates the measurement covariance.
///
/// With `K = (H + τC)⁻¹·h` the results are `p = K·y`, `t = B·p`,
/// `cov_p = K·V·Kᵀ` and `cov_t = B·cov_p·Bᵀ`. A system in which no measured
/// bin carries weight has `h = 0`, so every output is exactly zero.
pub fn solve_regularized(
    system: &LinearSystem<'_>,
    tau: f64,
) -> Result<RegularizedSolution, SolverError> {
    if !(tau.is_finite() && tau >= 0.0) {
        return Err(SolverError::InvalidTau(tau));
    }
    let basis = system.basis();
    let num_points = system.control_point_count();

    if !system.has_information() {
        log::warn!(
            "[Regularized] No measured bin has a positive variance; returning a zero solution for {} control points.",
            num_points
        );
        return Ok(RegularizedSolution::zeros(basis.nrows(), num_points));
    }

    let normal = system.normal_equations();
    let mut penalized = normal.information;
    penalized.scaled_add(tau, system.curvature());
    let penalized_inv =
        symmetric_inverse(&penalized, "H + tau*C").map_err(SolverError::SingularSystem)?;

    let gain = fast_ab(&penalized_inv, &normal.weighted_design);
    let values = gain.dot(&system.measured());
    let truth = basis.dot(&values);

    let control_point_covariance = diagonal_similarity(gain.view(), system.variances());
    let truth_covariance = similarity(basis.view(), &control_point_covariance);

    Ok(RegularizedSolution {
        control_point_values: ControlPointValues::new(values),
        truth,
        control_point_covariance,
        truth_covariance,
    })
}
