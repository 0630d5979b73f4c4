//! Eigenbasis solution of the regularized unfolding problem.
//!
//! The information matrix `H` is diagonalized and used to whiten the
//! problem; the curvature penalty is then diagonalized in the whitened
//! coordinates. In that joint basis regularization acts independently on
//! each mode, which exposes the per-mode damping factors and the rotated
//! "noise" vector used for model selection.

use super::selection::{SelectionOptions, tau_for_effective_parameters, tau_from_noise};
use super::{LinearSystem, SolverError};
use crate::linalg::faer_ndarray::{FaerEigh, fast_ab};
use crate::linalg::utils::similarity;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Rotated coefficients larger than this in magnitude count as significant.
pub const SIGNIFICANCE_THRESHOLD: f64 = 2.0;


#[derive(Debug, Clone)]
pub struct EigenDiagnostics {
    /// Eigenvalues of `H`, ascending, after any shift.
    pub information_eigenvalues: Array1<f64>,
    /// Amount added to every eigenvalue of `H`; zero unless one was negative.
    pub eigenvalue_shift: f64,
    /// Eigenvalues `μ` of the whitened curvature matrix, ascending.
    pub curvature_eigenvalues: Array1<f64>,
    /// Unregularized whitened solution `q = D^{-1/2}·Uᵀ·h·y`.
    pub whitened_solution: Array1<f64>,
    /// Unregularized solution in the curvature eigenbasis, `q' = Q·y`.
    pub rotated_solution: Array1<f64>,
    /// `U·D^{-1/2}·q`, the unregularized control-point values.
    pub unregularized_control_points: Array1<f64>,
    /// `U·D^{-1/2}·U_cp`, mapping rotated coefficients to control points.
    back_transform: Array2<f64>,
}

impl EigenDiagnostics {
    pub fn compute(system: &LinearSystem<'_>) -> Result<Self, SolverError> {
        let normal = system.normal_equations();

        let (lambda, u, eigenvalue_shift) = shifted_spectrum(&normal.information)?;

        // W = D^{-1/2} Uᵀ
        let inv_sqrt = lambda.mapv(|l| 1.0 / l.sqrt());
        let mut whitening = u.t().to_owned();
        for (mut row, &s) in whitening.rows_mut().into_iter().zip(inv_sqrt.iter()) {
            row *= s;
        }

        let whitened_curvature = similarity(whitening.view(), system.curvature());
        let (mut mu, u_cp) = whitened_curvature
            .eigh(Side::Lower)
            .map_err(SolverError::Eigendecomposition)?;
        // W·C·Wᵀ is positive semidefinite; negative eigenvalues are rounding.
        mu.mapv_inplace(|m| m.max(0.0));

        let whitened_design = fast_ab(&whitening, &normal.weighted_design);
        let whitened_solution = whitened_design.dot(&system.measured());
        let rotated_solution = u_cp.t().dot(&whitened_solution);

        let whitening_t = whitening.t();
        let unregularized_control_points = whitening_t.dot(&whitened_solution);
        let back_transform = fast_ab(&whitening_t, &u_cp);

        Ok(Self {
            information_eigenvalues: lambda,
            eigenvalue_shift,
            curvature_eigenvalues: mu,
            whitened_solution,
            rotated_solution,
            unregularized_control_points,
            back_transform,
        })
    }

    pub fn num_modes(&self) -> usize {
        self.curvature_eigenvalues.len()
    }

    /// Per-mode damping `1/(1 + τ·μ_i)`.
    pub fn regularization_factors(&self, tau: f64) -> Array1<f64> {
        self.curvature_eigenvalues.mapv(|mu| 1.0 / (1.0 + tau * mu))
    }

    /// Effective number of parameters at `tau`, the sum of the damping factors.
    pub fn effective_parameters(&self, tau: f64) -> f64 {
        effective_parameters(self.curvature_eigenvalues.view(), tau)
    }

    /// Damped rotated solution `q''_i = q'_i/(1 + τ·μ_i)`.
    pub fn regularized_rotated(&self, tau: f64) -> Array1<f64> {
        &self.rotated_solution * &self.regularization_factors(tau)
    }

    /// Control-point values of the regularized solution at `tau`.
    pub fn regularized_control_points(&self, tau: f64) -> Array1<f64> {
        self.back_transform.dot(&self.regularized_rotated(tau))
    }

    /// Number of whitened modes with `|q_i| > 2`.
    pub fn significant_modes(&self) -> usize {
        self.whitened_solution
            .iter()
            .filter(|q| q.abs() > SIGNIFICANCE_THRESHOLD)
            .count()
    }
}

/// Eigendecomposition of the information matrix with every eigenvalue made
/// positive.
///
/// A negative smallest eigenvalue `λ_min` shifts the whole spectrum by
/// `2·|λ_min|`. Near-null directions stay in the basis; whitening gives them
/// a large curvature eigenvalue, so any `τ > 0` damps them. Only a spectrum
/// with no positive part after the shift is rejected.
pub(crate) fn shifted_spectrum(
    information: &Array2<f64>,
) -> Result<(Array1<f64>, Array2<f64>, f64), SolverError> {
    let (mut lambda, u) = information
        .eigh(Side::Lower)
        .map_err(SolverError::Eigendecomposition)?;

    let min_eigenvalue = lambda.iter().copied().fold(f64::INFINITY, f64::min);
    let eigenvalue_shift = if min_eigenvalue < 0.0 {
        -2.0 * min_eigenvalue
    } else {
        0.0
    };
    if eigenvalue_shift > 0.0 {
        lambda += eigenvalue_shift;
        log::debug!(
            "[EigenDiagnostics] Shifted information eigenvalues by {eigenvalue_shift:.4e} (minimum was {min_eigenvalue:.4e})."
        );
    }

    let shifted_min = lambda.iter().copied().fold(f64::INFINITY, f64::min);
    if !(shifted_min.is_finite() && shifted_min > 0.0) {
        return Err(SolverError::DegenerateInformation {
            min_eigenvalue: shifted_min,
        });
    }
    Ok((lambda, u, eigenvalue_shift))
}

/// Everything the eigenbasis path knows about one solve at a fixed `τ`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub tau: f64,
    pub information_eigenvalues: Array1<f64>,
    pub eigenvalue_shift: f64,
    pub whitened_solution: Array1<f64>,
    pub unregularized_control_points: Array1<f64>,
    pub curvature_eigenvalues: Array1<f64>,
    pub regularization_factors: Array1<f64>,
    pub effective_parameters: f64,
    pub regularized_rotated: Array1<f64>,
    pub regularized_control_points: Array1<f64>,
    /// `m0_q`, the count of `|q_i| > 2`.
    pub significant_modes: usize,
    /// `τ` giving `m0_q` effective parameters, if the root is bracketed.
    pub significant_modes_tau: Option<f64>,
    /// `τ_noise`, if the noise criterion has a root in the bracket.
    pub tau_noise: Option<f64>,
    /// `m0_noise` at `τ_noise`.
    pub noise_parameters: Option<usize>,
}

impl EigenDiagnostics {
    /// Collects the per-mode quantities at `tau` together with the
    /// significant-mode and noise estimates. Root-finding failures are logged
    /// and leave the corresponding field empty.
    pub fn report(&self, tau: f64, options: &SelectionOptions) -> DiagnosticReport {
        let mu = self.curvature_eigenvalues.view();
        let significant_modes = self.significant_modes();
        let significant_modes_tau = match tau_for_effective_parameters(
            mu,
            significant_modes as f64,
            options.tau_bracket,
            options.scan,
        ) {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("[EigenDiagnostics] tau for m0_q = {significant_modes} unavailable: {e}");
                None
            }
        };
        let tau_noise = match tau_from_noise(
            mu,
            self.rotated_solution.view(),
            options.tau_bracket,
            options.scan,
        ) {
            Ok(t) => Some(t),
            Err(e) => {
                log::warn!("[EigenDiagnostics] tau from noise unavailable: {e}");
                None
            }
        };
        let noise_parameters =
            tau_noise.map(|t| (self.effective_parameters(t) + 2.0).floor() as usize);

        DiagnosticReport {
            tau,
            information_eigenvalues: self.information_eigenvalues.clone(),
            eigenvalue_shift: self.eigenvalue_shift,
            whitened_solution: self.whitened_solution.clone(),
            unregularized_control_points: self.unregularized_control_points.clone(),
            curvature_eigenvalues: self.curvature_eigenvalues.clone(),
            regularization_factors: self.regularization_factors(tau),
            effective_parameters: self.effective_parameters(tau),
            regularized_rotated: self.regularized_rotated(tau),
            regularized_control_points: self.regularized_control_points(tau),
            significant_modes,
            significant_modes_tau,
            tau_noise,
            noise_parameters,
        }
    }
}

/// `Σ_i 1/(1 + τ·μ_i)`.
pub fn effective_parameters(curvature_eigenvalues: ArrayView1<'_, f64>, tau: f64) -> f64 {
    curvature_eigenvalues
        .iter()
        .map(|&mu| 1.0 / (1.0 + tau * mu))
        .sum()
}
