#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod linalg;
pub mod solver;
pub mod types;
pub mod unfold;

pub use basis::{BasisError, basis_matrix, control_points, curvature_matrix, spline_integral};
pub use linalg::rootfind::{Bracket, RootError, ScanGrid};
pub use solver::eigen::{DiagnosticReport, EigenDiagnostics};
pub use solver::regularized::{RegularizedSolution, solve_regularized};
pub use solver::selection::{Selection, SelectionOptions, SelectionStep, select_regularization};
pub use solver::{LinearSystem, SolverError};
pub use types::{AutoMode, ControlPointValues, UnfoldConfig, Verbosity};
pub use unfold::{Measurement, Response, SplineUnfold, UnfoldError, UnfoldResult, Unfolding};
