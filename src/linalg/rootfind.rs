//! Bracketed scalar root finding.
//!
//! The target functions solved here (regularization strength against an
//! effective parameter count) may change sign more than once over a wide
//! bracket, so the bracket is first scanned for the *first* sign change and
//! only that sub-interval is handed to Brent's method.

use roots::{Convergency, SearchError, find_root_brent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RootError {
    #[error("Invalid root bracket [{lower}, {upper}]: bounds must be finite with 0 <= lower < upper.")]
    InvalidBracket { lower: f64, upper: f64 },

    #[error("Target function is not finite at x = {x:.6e} (value {value}).")]
    NonFinite { x: f64, value: f64 },

    #[error(
        "No sign change in [{lower:.3e}, {upper:.3e}]: f(lower) = {f_lower:.4e}, f(upper) = {f_upper:.4e}."
    )]
    NotBracketed {
        lower: f64,
        upper: f64,
        f_lower: f64,
        f_upper: f64,
    },

    #[error("Brent refinement in [{lower:.3e}, {upper:.3e}] failed: {reason:?}")]
    Refinement {
        lower: f64,
        upper: f64,
        reason: SearchError,
    },
}

/// Closed search interval for a non-negative scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    pub lower: f64,
    pub upper: f64,
}

impl Bracket {
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    fn validate(&self) -> Result<(), RootError> {
        if !(self.lower.is_finite() && self.upper.is_finite())
            || self.lower < 0.0
            || self.lower >= self.upper
        {
            return Err(RootError::InvalidBracket {
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }
}

/// Geometric pre-scan used to locate the first sign change.
///
/// With `lower == 0` the grid is `0` followed by `decades * points_per_decade`
/// log-spaced points ending at `upper`; with `lower > 0` the log-spaced grid
/// runs from `lower` to `upper` at the same density.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanGrid {
    pub decades: u32,
    pub points_per_decade: u32,
}

impl Default for ScanGrid {
    fn default() -> Self {
        Self {
            decades: 12,
            points_per_decade: 8,
        }
    }
}

impl ScanGrid {
    fn points(&self, bracket: Bracket) -> Vec<f64> {
        let per_decade = self.points_per_decade.max(1) as f64;
        let (start, steps) = if bracket.lower > 0.0 {
            let span = (bracket.upper / bracket.lower).log10();
            (bracket.lower, (span * per_decade).ceil().max(1.0) as usize)
        } else {
            let decades = self.decades.max(1);
            (
                bracket.upper * 10f64.powi(-(decades as i32)),
                (decades as usize) * (per_decade as usize),
            )
        };

        let mut points = Vec::with_capacity(steps + 2);
        if bracket.lower == 0.0 {
            points.push(0.0);
        }
        let ratio = (bracket.upper / start).powf(1.0 / steps as f64);
        let mut x = start;
        for _ in 0..steps {
            points.push(x);
            x *= ratio;
        }
        points.push(bracket.upper);
        points
    }
}

/// Brent stopping rule with separate abscissa and ordinate tolerances.
struct BrentTolerance {
    x_tol: f64,
    f_tol: f64,
    max_iter: usize,
}

impl Convergency<f64> for BrentTolerance {
    fn is_root_found(&mut self, y: f64) -> bool {
        y.abs() < self.f_tol
    }

    fn is_converged(&mut self, x1: f64, x2: f64) -> bool {
        (x1 - x2).abs() < self.x_tol
    }

    fn is_iteration_limit_reached(&mut self, iter: usize) -> bool {
        iter >= self.max_iter
    }
}

const BRENT_REL_X_TOL: f64 = 1e-12;
const BRENT_F_TOL: f64 = 1e-12;
const BRENT_MAX_ITER: usize = 200;

fn checked(x: f64, value: f64) -> Result<f64, RootError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RootError::NonFinite { x, value })
    }
}

/// Finds the first root of `f` inside `bracket`.
///
/// The bracket is scanned on `grid`; the first adjacent pair of grid points
/// with opposite signs is refined with Brent's method. No sign change over
/// the whole grid is reported as [`RootError::NotBracketed`].
pub fn find_first_root<F>(mut f: F, bracket: Bracket, grid: ScanGrid) -> Result<f64, RootError>
where
    F: FnMut(f64) -> f64,
{
    bracket.validate()?;
    let points = grid.points(bracket);

    let mut prev_x = points[0];
    let mut prev_f = checked(prev_x, f(prev_x))?;
    let f_lower = prev_f;
    if prev_f == 0.0 {
        return Ok(prev_x);
    }

    for &x in &points[1..] {
        let fx = checked(x, f(x))?;
        if fx == 0.0 {
            return Ok(x);
        }
        if fx.signum() != prev_f.signum() {
            let mut tolerance = BrentTolerance {
                x_tol: ((x - prev_x) * BRENT_REL_X_TOL).max(f64::MIN_POSITIVE),
                f_tol: BRENT_F_TOL,
                max_iter: BRENT_MAX_ITER,
            };
            let root = find_root_brent(prev_x, x, &mut f, &mut tolerance).map_err(|reason| {
                RootError::Refinement {
                    lower: prev_x,
                    upper: x,
                    reason,
                }
            })?;
            return Ok(root.clamp(prev_x, x));
        }
        prev_x = x;
        prev_f = fx;
    }

    Err(RootError::NotBracketed {
        lower: bracket.lower,
        upper: bracket.upper,
        f_lower,
        f_upper: prev_f,
    })
}
