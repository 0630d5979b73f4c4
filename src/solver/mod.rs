//! Penalized least-squares machinery shared by the direct and eigenbasis
//! solution paths and by the regularization selector.

pub mod eigen;
pub mod regularized;
pub mod selection;

use crate::basis::{self, BasisError};
use crate::linalg::faer_ndarray::{FaerLinalgError, fast_ab, fast_atb};
use crate::linalg::rootfind::RootError;
use crate::linalg::utils::{inverse_variances, symmetrize};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Basis construction failed: {0}")]
    Basis(#[from] BasisError),

    #[error("The regularized normal matrix H + tau*C could not be inverted: {0}")]
    SingularSystem(FaerLinalgError),

    #[error("Eigendecomposition failed: {0}")]
    Eigendecomposition(FaerLinalgError),

    #[error(
        "The information matrix is degenerate: smallest eigenvalue after shifting is {min_eigenvalue:.4e}. The measurement carries no weight."
    )]
    DegenerateInformation { min_eigenvalue: f64 },

    #[error("No root of the {criterion} equation in the search bracket: {source}")]
    RootNotBracketed {
        criterion: &'static str,
        source: RootError,
    },

    #[error("Root finding for the {criterion} equation failed: {source}")]
    RootFinding {
        criterion: &'static str,
        source: RootError,
    },

    #[error("Regularization strength must be finite and non-negative, got {0}")]
    InvalidTau(f64),

    #[error("Invalid solver options: {0}")]
    InvalidOptions(&'static str),

    #[error("Input contains non-finite values: {0}")]
    NonFiniteInput(&'static str),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl SolverError {
    pub(crate) fn from_root(criterion: &'static str, source: RootError) -> Self {
        match source {
            RootError::NotBracketed { .. } => SolverError::RootNotBracketed { criterion, source },
            other => SolverError::RootFinding {
                criterion,
                source: other,
            },
        }
    }
}

/// One unfolding problem at a fixed control-point count: response `R`,
/// spline basis `B`, curvature penalty `C`, measured vector `y` and its
/// diagonal variance `V`.
#[derive(Debug, Clone)]
pub struct LinearSystem<'a> {
    response: ArrayView2<'a, f64>,
    measured: ArrayView1<'a, f64>,
    variances: ArrayView1<'a, f64>,
    inverse_variances: Array1<f64>,
    control_points: Array1<f64>,
    basis: Array2<f64>,
    curvature: Array2<f64>,
}

impl<'a> LinearSystem<'a> {
    /// Places `control_point_count` control points over `bin_edges` and builds
    /// the matching basis and curvature matrices.
    pub fn build(
        response: ArrayView2<'a, f64>,
        bin_edges: ArrayView1<'_, f64>,
        measured: ArrayView1<'a, f64>,
        variances: ArrayView1<'a, f64>,
        control_point_count: usize,
    ) -> Result<Self, SolverError> {
        let (num_measured, num_truth) = response.dim();
        if measured.len() != num_measured || variances.len() != num_measured {
            return Err(SolverError::DimensionMismatch(format!(
                "response has {num_measured} measured bins, measured vector has {} and variance vector has {}",
                measured.len(),
                variances.len()
            )));
        }
        if bin_edges.len() != num_truth + 1 {
            return Err(SolverError::DimensionMismatch(format!(
                "response has {num_truth} truth bins but {} bin edges were supplied",
                bin_edges.len()
            )));
        }
        if !response.iter().all(|v| v.is_finite()) {
            return Err(SolverError::NonFiniteInput("response matrix"));
        }
        if !measured.iter().all(|v| v.is_finite()) {
            return Err(SolverError::NonFiniteInput("measured vector"));
        }
        if !variances.iter().all(|v| v.is_finite()) {
            return Err(SolverError::NonFiniteInput("measured variances"));
        }

        let control_points = basis::control_points(bin_edges, control_point_count)?;
        let basis = basis::basis_matrix(bin_edges, control_points.view())?;
        let curvature = basis::curvature_matrix(control_point_count)?;

        Ok(Self {
            response,
            measured,
            variances,
            inverse_variances: inverse_variances(variances),
            control_points,
            basis,
            curvature,
        })
    }

    pub fn control_point_count(&self) -> usize {
        self.control_points.len()
    }

    pub fn control_points(&self) -> &Array1<f64> {
        &self.control_points
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    pub fn curvature(&self) -> &Array2<f64> {
        &self.curvature
    }

    pub fn measured(&self) -> ArrayView1<'a, f64> {
        self.measured
    }

    pub fn variances(&self) -> ArrayView1<'a, f64> {
        self.variances
    }

    /// True when at least one measured bin carries weight.
    pub fn has_information(&self) -> bool {
        self.inverse_variances.iter().any(|&w| w > 0.0)
    }

    pub(crate) fn normal_equations(&self) -> NormalEquations {
        let folded_basis = fast_ab(&self.response, &self.basis);

        let mut weighted = folded_basis.clone();
        for (mut row, &w) in weighted.rows_mut().into_iter().zip(self.inverse_variances.iter()) {
            row *= w;
        }
        let mut information = fast_atb(&weighted, &folded_basis);
        symmetrize(&mut information);

        NormalEquations {
            weighted_design: weighted.reversed_axes(),
            information,
        }
    }
}

/// `h = ABᵀ·V⁻¹` and `H = h·AB` for `AB = R·B`.
pub(crate) struct NormalEquations {
    pub weighted_design: Array2<f64>,
    pub information: Array2<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn normal_equations_match_dense_formulas() {
        let response = array![[0.8, 0.1, 0.0], [0.2, 0.7, 0.2], [0.0, 0.2, 0.8]];
        let edges = array![0.0, 1.0, 2.0, 3.0];
        let measured = array![10.0, 20.0, 15.0];
        let variances = array![10.0, 0.0, 15.0];
        let system = LinearSystem::build(
            response.view(),
            edges.view(),
            measured.view(),
            variances.view(),
            4,
        )
        .unwrap();

        let ab = response.dot(system.basis());
        let vinv = Array2::from_diag(&array![0.1, 0.0, 1.0 / 15.0]);
        let h = ab.t().dot(&vinv);
        let big_h = h.dot(&ab);

        let normal = system.normal_equations();
        for (x, y) in normal.weighted_design.iter().zip(h.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
        for (x, y) in normal.information.iter().zip(big_h.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
        assert!(system.has_information());
    }

    #[test]
    fn build_rejects_mismatched_shapes() {
        let response = Array2::<f64>::eye(3);
        let edges = array![0.0, 1.0, 2.0, 3.0];
        let short = array![1.0, 2.0];
        let ok = array![1.0, 2.0, 3.0];
        assert!(matches!(
            LinearSystem::build(response.view(), edges.view(), short.view(), ok.view(), 4),
            Err(SolverError::DimensionMismatch(_))
        ));
        let few_edges = array![0.0, 1.0, 2.0];
        assert!(matches!(
            LinearSystem::build(response.view(), few_edges.view(), ok.view(), ok.view(), 4),
            Err(SolverError::DimensionMismatch(_))
        ));
        let nan = array![1.0, f64::NAN, 3.0];
        assert!(matches!(
            LinearSystem::build(response.view(), edges.view(), nan.view(), ok.view(), 4),
            Err(SolverError::NonFiniteInput(_))
        ));
    }

    #[test]
    fn root_errors_are_classified() {
        let missing = RootError::NotBracketed {
            lower: 0.0,
            upper: 1.0,
            f_lower: 1.0,
            f_upper: 2.0,
        };
        assert!(matches!(
            SolverError::from_root("noise", missing),
            SolverError::RootNotBracketed { criterion: "noise", .. }
        ));
        let invalid = RootError::InvalidBracket {
            lower: 1.0,
            upper: 0.0,
        };
        assert!(matches!(
            SolverError::from_root("noise", invalid),
            SolverError::RootFinding { .. }
        ));
    }
}
