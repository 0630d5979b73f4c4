//! Top-level unfolding driver: fake subtraction, optional automatic choice of
//! `(M, τ)`, and the final regularized solve.

use crate::basis::{BasisError, MIN_CONTROL_POINTS};
use crate::solver::eigen::{DiagnosticReport, EigenDiagnostics};
use crate::solver::regularized::solve_regularized;
use crate::solver::selection::{Selection, SelectionOptions, select_regularization};
use crate::solver::{LinearSystem, SolverError};
use crate::types::{AutoMode, ControlPointValues, UnfoldConfig};
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Relative disagreement between the eigenbasis and direct solutions that is
/// reported at diagnostic verbosity.
const CROSS_CHECK_REL_TOL: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum UnfoldError {
    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error(
        "Requested {requested} control points but only {measured_bins} measured bins are available."
    )]
    TooManyControlPoints {
        requested: usize,
        measured_bins: usize,
    },

    #[error("At least 4 control points are required, but {0} were requested.")]
    TooFewControlPoints(usize),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Discretized detector response supplied by the caller.
#[derive(Debug, Clone)]
pub struct Response {
    /// Measured-bin × truth-bin migration matrix, including efficiency.
    pub matrix: Array2<f64>,
    pub truth_edges: Array1<f64>,
    /// Expected fake (background) yield per measured bin in the training sample.
    pub fakes: Option<Array1<f64>>,
    /// Total measured weight of the training sample the fakes were taken from.
    pub training_measured_total: f64,
}

impl Response {
    pub fn new(matrix: Array2<f64>, truth_edges: Array1<f64>) -> Result<Self, UnfoldError> {
        if truth_edges.len() != matrix.ncols() + 1 {
            return Err(UnfoldError::DimensionMismatch(format!(
                "response has {} truth bins but {} truth edges were supplied",
                matrix.ncols(),
                truth_edges.len()
            )));
        }
        Ok(Self {
            matrix,
            truth_edges,
            fakes: None,
            training_measured_total: 0.0,
        })
    }

    pub fn with_fakes(
        mut self,
        fakes: Array1<f64>,
        training_measured_total: f64,
    ) -> Result<Self, UnfoldError> {
        if fakes.len() != self.num_measured() {
            return Err(UnfoldError::DimensionMismatch(format!(
                "fake vector has {} entries for {} measured bins",
                fakes.len(),
                self.num_measured()
            )));
        }
        if !training_measured_total.is_finite() {
            return Err(UnfoldError::InvalidInput(format!(
                "training measured total is {training_measured_total}"
            )));
        }
        self.fakes = Some(fakes);
        self.training_measured_total = training_measured_total;
        Ok(self)
    }

    pub fn num_measured(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn num_truth(&self) -> usize {
        self.matrix.ncols()
    }
}

/// Measured bin contents and their uncorrelated errors.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub values: Array1<f64>,
    pub errors: Array1<f64>,
}

impl Measurement {
    pub fn new(values: Array1<f64>, errors: Array1<f64>) -> Result<Self, UnfoldError> {
        if values.len() != errors.len() {
            return Err(UnfoldError::DimensionMismatch(format!(
                "{} measured values but {} errors",
                values.len(),
                errors.len()
            )));
        }
        Ok(Self { values, errors })
    }

    /// Counting measurement with `√n` errors.
    pub fn from_counts(values: Array1<f64>) -> Self {
        let errors = values.mapv(|v| v.max(0.0).sqrt());
        Self { values, errors }
    }

    pub fn variances(&self) -> Array1<f64> {
        self.errors.mapv(|e| e * e)
    }
}

/// Output of one successful [`Unfolding::unfold`] call.
#[derive(Debug, Clone)]
pub struct UnfoldResult {
    pub truth: Array1<f64>,
    pub covariance: Array2<f64>,
    /// `√diag(covariance)`.
    pub errors: Array1<f64>,
    pub control_point_positions: Array1<f64>,
    pub control_point_values: ControlPointValues,
    pub control_point_covariance: Array2<f64>,
    /// Control-point count used for the solve.
    pub control_points: usize,
    /// Regularization strength used for the solve.
    pub tau: f64,
    /// Scale applied to the fake yield before subtraction.
    pub fake_scale: f64,
    pub selection: Option<Selection>,
    pub diagnostics: Option<DiagnosticReport>,
}

/// A stateful unfolding algorithm: unsolved until `unfold` succeeds.
pub trait Unfolding {
    /// Runs the unfolding and stores the result, replacing any previous one.
    /// On error the stored state is left as it was.
    fn unfold(&mut self) -> Result<&UnfoldResult, UnfoldError>;

    fn result(&self) -> Option<&UnfoldResult>;

    fn covariance(&self) -> Option<&Array2<f64>> {
        self.result().map(|r| &r.covariance)
    }

    /// Discards the stored result.
    fn reset(&mut self);

    fn is_unfolded(&self) -> bool {
        self.result().is_some()
    }
}

/// Regularized cubic B-spline unfolding.
#[derive(Debug, Clone)]
pub struct SplineUnfold {
    response: Response,
    measurement: Measurement,
    config: UnfoldConfig,
    result: Option<UnfoldResult>,
}

impl SplineUnfold {
    pub fn new(
        response: Response,
        measurement: Measurement,
        config: UnfoldConfig,
    ) -> Result<Self, UnfoldError> {
        if measurement.values.len() != response.num_measured() {
            return Err(UnfoldError::DimensionMismatch(format!(
                "measurement has {} bins but the response has {} measured bins",
                measurement.values.len(),
                response.num_measured()
            )));
        }
        Ok(Self {
            response,
            measurement,
            config,
            result: None,
        })
    }

    pub fn config(&self) -> &UnfoldConfig {
        &self.config
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    /// Sets the fixed regularization strength and discards any result.
    pub fn set_tau(&mut self, tau: f64) {
        self.config.tau = tau;
        self.reset();
    }

    /// Sets the control-point count (`0` uses the truth binning) and discards
    /// any result.
    pub fn set_control_points(&mut self, control_points: usize) {
        self.config.control_points = control_points;
        self.reset();
    }

    pub fn set_auto_mode(&mut self, auto_mode: AutoMode) {
        self.config.auto_mode = auto_mode;
        self.reset();
    }

    pub fn set_config(&mut self, config: UnfoldConfig) {
        self.config = config;
        self.reset();
    }

    pub fn truth(&self) -> Option<&Array1<f64>> {
        self.result.as_ref().map(|r| &r.truth)
    }

    pub fn errors(&self) -> Option<&Array1<f64>> {
        self.result.as_ref().map(|r| &r.errors)
    }

    /// Measured vector with the scaled fake yield removed, and the scale used.
    fn subtract_fakes(&self) -> (Array1<f64>, f64) {
        let mut measured = self.measurement.values.clone();
        let Some(fakes) = self.response.fakes.as_ref() else {
            return (measured, 0.0);
        };

        let mut scale = 0.0;
        if self.response.training_measured_total != 0.0 {
            scale = measured.sum() / self.response.training_measured_total;
        } else {
            log::warn!(
                "[SplineUnfold] Training sample has zero total measured weight; fake subtraction disabled."
            );
        }
        if self.config.verbosity.summary() {
            log::info!(
                "[SplineUnfold] Subtracting {:.6e} fakes (scale {scale:.6e}) from {:.6e} measured.",
                scale * fakes.sum(),
                measured.sum()
            );
        }
        measured.scaled_add(-scale, fakes);
        (measured, scale)
    }

    fn initial_control_points(&self) -> Result<usize, UnfoldError> {
        let requested = match self.config.control_points {
            0 => self.response.num_truth(),
            m => m,
        };
        let measured_bins = self.response.num_measured();
        if requested > measured_bins {
            return Err(UnfoldError::TooManyControlPoints {
                requested,
                measured_bins,
            });
        }
        if requested < MIN_CONTROL_POINTS {
            return Err(UnfoldError::TooFewControlPoints(requested));
        }
        Ok(requested)
    }

    fn selection_options(&self) -> SelectionOptions {
        SelectionOptions {
            verbosity: self.config.verbosity,
            ..self.config.selection.clone()
        }
    }

    fn cross_check(
        &self,
        system: &LinearSystem<'_>,
        tau: f64,
        direct: &ControlPointValues,
    ) -> Option<DiagnosticReport> {
        let diagnostics = match EigenDiagnostics::compute(system) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("[SplineUnfold] Eigenbasis cross-check unavailable: {e}");
                return None;
            }
        };
        let report = diagnostics.report(tau, &self.selection_options());

        log::debug!("[SplineUnfold] eigenvalues of H: {}", report.information_eigenvalues);
        log::debug!("[SplineUnfold] unreg. solution q: {}", report.whitened_solution);
        log::debug!(
            "[SplineUnfold] unreg. solution p: {}",
            report.unregularized_control_points
        );
        log::debug!(
            "[SplineUnfold] diagonal curvature matrix: {}",
            report.curvature_eigenvalues
        );
        log::debug!(
            "[SplineUnfold] reg. factors: {} (sum {:.6})",
            report.regularization_factors,
            report.effective_parameters
        );
        log::debug!("[SplineUnfold] reg. eigenvalue solution q'': {}", report.regularized_rotated);
        log::debug!(
            "[SplineUnfold] reg. eigenvalue solution p: {}",
            report.regularized_control_points
        );
        log::info!(
            "[SplineUnfold] m0 and tau from unreg. solution q: {} {:?}",
            report.significant_modes,
            report.significant_modes_tau
        );
        log::info!(
            "[SplineUnfold] tau and m0 from noise in q': {:?} {:?}",
            report.tau_noise,
            report.noise_parameters
        );

        let scale = direct.iter().fold(1.0f64, |acc, v| acc.max(v.abs()));
        let deviation = direct
            .iter()
            .zip(report.regularized_control_points.iter())
            .fold(0.0f64, |acc, (a, b)| acc.max((a - b).abs()));
        if deviation > CROSS_CHECK_REL_TOL * scale {
            log::warn!(
                "[SplineUnfold] Eigenbasis and direct solutions differ by {deviation:.3e} (scale {scale:.3e})."
            );
        }
        Some(report)
    }
}

impl Unfolding for SplineUnfold {
    fn unfold(&mut self) -> Result<&UnfoldResult, UnfoldError> {
        let (measured, fake_scale) = self.subtract_fakes();
        let variances = self.measurement.variances();
        let initial = self.initial_control_points()?;
        let response = self.response.matrix.view();
        let edges = self.response.truth_edges.view();

        let mut control_points = initial;
        let mut tau = self.config.tau;
        let auto_mode = self.config.auto_mode;

        let selection = if auto_mode.runs_selector() {
            let selection = select_regularization(
                response,
                edges,
                measured.view(),
                variances.view(),
                initial,
                &self.selection_options(),
            )?;
            if auto_mode.applies_control_points() {
                control_points = selection.control_points;
            }
            if auto_mode.applies_tau() {
                tau = selection.tau;
            }
            if self.config.verbosity.summary() {
                log::info!(
                    "[SplineUnfold] auto mode {:?} ({}): selected M = {}, tau = {:.6e} after {} iterations; using M = {control_points}, tau = {tau:.6e}",
                    auto_mode,
                    u8::from(auto_mode),
                    selection.control_points,
                    selection.tau,
                    selection.iterations
                );
            }
            Some(selection)
        } else {
            None
        };

        let system = LinearSystem::build(
            response,
            edges,
            measured.view(),
            variances.view(),
            control_points,
        )?;
        let solution = solve_regularized(&system, tau)?;

        if self.config.verbosity.diagnostics() {
            log::debug!(
                "[SplineUnfold] reg. inversion solution p: {}",
                *solution.control_point_values
            );
        }
        let diagnostics = if self.config.verbosity.diagnostics() {
            self.cross_check(&system, tau, &solution.control_point_values)
        } else {
            None
        };

        let errors = solution.truth_covariance.diag().mapv(|v| v.max(0.0).sqrt());
        let control_point_positions = system.control_points().clone();
        let result = UnfoldResult {
            truth: solution.truth,
            covariance: solution.truth_covariance,
            errors,
            control_point_positions,
            control_point_values: solution.control_point_values,
            control_point_covariance: solution.control_point_covariance,
            control_points,
            tau,
            fake_scale,
            selection,
            diagnostics,
        };
        Ok(self.result.insert(result))
    }

    fn result(&self) -> Option<&UnfoldResult> {
        self.result.as_ref()
    }

    fn reset(&mut self) {
        self.result = None;
    }
}
