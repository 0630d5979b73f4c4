//! Automatic choice of the control-point count and regularization strength.
//!
//! Follows the noise criterion of Blobel's unfolding method as analysed by
//! Cowan: the rotated unregularized coefficients `q'` are unit-variance noise
//! for modes the data cannot resolve, and `τ` is chosen so that the damping
//! removes exactly that noise. The resulting effective number of parameters
//! sets the next control-point count until it stops decreasing.

use super::eigen::{EigenDiagnostics, effective_parameters};
use super::{LinearSystem, SolverError};
use crate::basis::MIN_CONTROL_POINTS;
use crate::linalg::rootfind::{Bracket, ScanGrid, find_first_root};
use crate::types::Verbosity;
use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITERATIONS: usize = 20;
pub const DEFAULT_TAU_BRACKET: Bracket = Bracket::new(0.0, 1e-3);

/// Options for [`select_regularization`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionOptions {
    pub max_iterations: usize,
    /// Search interval for both `τ` equations.
    pub tau_bracket: Bracket,
    pub scan: ScanGrid,
    pub verbosity: Verbosity,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tau_bracket: DEFAULT_TAU_BRACKET,
            scan: ScanGrid::default(),
            verbosity: Verbosity::Summary,
        }
    }
}

/// One pass of the selection loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionStep {
    pub control_points: usize,
    pub tau_noise: f64,
    pub noise_parameters: usize,
    pub tau: f64,
}

/// Outcome of [`select_regularization`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Selected control-point count, never above the starting count.
    pub control_points: usize,
    /// Raw `m0_noise` of the last iteration.
    pub noise_parameters: usize,
    /// `τ_opt` of the last iteration.
    pub tau: f64,
    pub iterations: usize,
    pub history: Vec<SelectionStep>,
}

/// Noise criterion
/// `Σ_i [q'_i²·(2x_i + x_i²)/(1 + x_i)² − 1]·3/(3 + x_i)` with `x_i = τ·μ_i`.
pub fn noise_criterion(
    curvature_eigenvalues: ArrayView1<'_, f64>,
    rotated_solution: ArrayView1<'_, f64>,
    tau: f64,
) -> f64 {
    curvature_eigenvalues
        .iter()
        .zip(rotated_solution.iter())
        .map(|(&mu, &q)| {
            let x = tau * mu;
            (q * q * (2.0 * x + x * x) / ((1.0 + x) * (1.0 + x)) - 1.0) * (3.0 / (3.0 + x))
        })
        .sum()
}

/// Solves the noise criterion for `τ`.
pub fn tau_from_noise(
    curvature_eigenvalues: ArrayView1<'_, f64>,
    rotated_solution: ArrayView1<'_, f64>,
    bracket: Bracket,
    scan: ScanGrid,
) -> Result<f64, SolverError> {
    find_first_root(
        |tau| noise_criterion(curvature_eigenvalues, rotated_solution, tau),
        bracket,
        scan,
    )
    .map_err(|e| SolverError::from_root("noise", e))
}

/// Solves `Σ_i 1/(1 + τ·μ_i) = target` for `τ`.
pub fn tau_for_effective_parameters(
    curvature_eigenvalues: ArrayView1<'_, f64>,
    target: f64,
    bracket: Bracket,
    scan: ScanGrid,
) -> Result<f64, SolverError> {
    find_first_root(
        |tau| effective_parameters(curvature_eigenvalues, tau) - target,
        bracket,
        scan,
    )
    .map_err(|e| SolverError::from_root("effective parameter", e))
}

/// `τ_noise`, `m0_noise = ⌊Σ 1/(1 + τ_noise·μ_i) + 2⌋` and `τ_opt` for one
/// eigenbasis.
pub fn noise_step(
    diagnostics: &EigenDiagnostics,
    options: &SelectionOptions,
) -> Result<SelectionStep, SolverError> {
    let mu = diagnostics.curvature_eigenvalues.view();
    let m = diagnostics.num_modes();
    let tau_noise = tau_from_noise(
        mu,
        diagnostics.rotated_solution.view(),
        options.tau_bracket,
        options.scan,
    )?;
    let noise_sum = diagnostics.effective_parameters(tau_noise);
    let noise_parameters = (noise_sum + 2.0).floor() as usize;
    let target = noise_parameters.min(m.saturating_sub(1)) as f64;
    let tau = tau_for_effective_parameters(mu, target, options.tau_bracket, options.scan)?;
    Ok(SelectionStep {
        control_points: m,
        tau_noise,
        noise_parameters,
        tau,
    })
}

/// Iterates the noise criterion from `initial_control_points` downwards.
///
/// Each pass rebuilds the basis at the current count `M`, computes the
/// eigenbasis, and derives `m0_noise` and `τ_opt`. The loop stops when
/// `m0_noise ≥ M`, when `m0_noise` drops below the smallest usable count, or
/// after `max_iterations` passes.
pub fn select_regularization<'a>(
    response: ArrayView2<'a, f64>,
    bin_edges: ArrayView1<'_, f64>,
    measured: ArrayView1<'a, f64>,
    variances: ArrayView1<'a, f64>,
    initial_control_points: usize,
    options: &SelectionOptions,
) -> Result<Selection, SolverError> {
    if options.max_iterations == 0 {
        return Err(SolverError::InvalidOptions(
            "selection needs at least one iteration",
        ));
    }

    let mut current = initial_control_points;
    let mut history = Vec::new();

    for iteration in 0..options.max_iterations {
        let system = LinearSystem::build(response, bin_edges, measured, variances, current)?;
        let diagnostics = EigenDiagnostics::compute(&system)?;
        let step = noise_step(&diagnostics, options)?;

        if options.verbosity.summary() {
            log::info!(
                "[Selection] iteration {iteration}: M = {current}, tau_noise = {:.6e}, m0_noise = {}, tau = {:.6e}",
                step.tau_noise,
                step.noise_parameters,
                step.tau
            );
        }
        history.push(step);

        let next = step.noise_parameters;
        if next >= current || next < MIN_CONTROL_POINTS {
            break;
        }
        current = next;
    }

    let Some(last) = history.last().copied() else {
        return Err(SolverError::InvalidOptions("selection produced no iterations"));
    };
    if last.noise_parameters < MIN_CONTROL_POINTS {
        log::warn!(
            "[Selection] m0_noise = {} is below the minimum of {MIN_CONTROL_POINTS} control points; selecting {MIN_CONTROL_POINTS}.",
            last.noise_parameters
        );
    }

    Ok(Selection {
        control_points: last.noise_parameters.min(last.control_points).max(MIN_CONTROL_POINTS),
        noise_parameters: last.noise_parameters,
        tau: last.tau,
        iterations: history.len(),
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn effective_parameter_root_matches_closed_form() {
        // Two null modes plus four modes at mu = 1e4: 2 + 4/(1 + 1e4 tau) = 4.
        let mu = array![0.0, 0.0, 1e4, 1e4, 1e4, 1e4];
        let tau = tau_for_effective_parameters(
            mu.view(),
            4.0,
            DEFAULT_TAU_BRACKET,
            ScanGrid::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(tau, 1e-4, epsilon = 1e-12);
    }

    #[test]
    fn noise_root_matches_closed_form() {
        // Equal modes with q'^2 = 4: 4(2x + x^2) = (1 + x)^2 gives
        // (1 + x)^2 = 4/3, so x = sqrt(4/3) - 1.
        let mu = Array1::from_elem(5, 1000.0);
        let q = Array1::from_elem(5, 2.0);
        let tau = tau_from_noise(mu.view(), q.view(), DEFAULT_TAU_BRACKET, ScanGrid::default())
            .unwrap();
        let expected = ((4.0f64 / 3.0).sqrt() - 1.0) / 1000.0;
        assert_abs_diff_eq!(tau, expected, epsilon = 1e-12);
    }

    #[test]
    fn noise_criterion_starts_at_minus_mode_count() {
        let mu = array![0.0, 1.0, 10.0];
        let q = array![5.0, 0.3, 2.0];
        assert_abs_diff_eq!(noise_criterion(mu.view(), q.view(), 0.0), -3.0, epsilon = 1e-15);
    }

    #[test]
    fn unbracketed_root_is_surfaced() {
        // Pure noise (|q'| < 1) never pushes the criterion above zero.
        let mu = Array1::from_elem(4, 1000.0);
        let q = Array1::from_elem(4, 0.5);
        assert!(matches!(
            tau_from_noise(mu.view(), q.view(), DEFAULT_TAU_BRACKET, ScanGrid::default()),
            Err(SolverError::RootNotBracketed { criterion: "noise", .. })
        ));
    }

    #[test]
    fn options_default_to_twenty_iterations() {
        let options = SelectionOptions::default();
        assert_eq!(options.max_iterations, 20);
        assert_eq!(options.tau_bracket, Bracket::new(0.0, 1e-3));
    }
}
