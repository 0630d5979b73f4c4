//! Bridge between the ndarray containers used at every API boundary and the
//! faer kernels that do the dense work.

use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, Ldlt, Llt, Solve};
use faer::{Accum, Mat, MatMut, MatRef, Par, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("Matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Matrix contains non-finite entries")]
    NonFinite,
    #[error("Matrix '{label}' is numerically singular: condition estimate {condition:.3e}")]
    IllConditioned { label: &'static str, condition: f64 },
    #[error(
        "Matrix '{label}' has an inaccurate inverse: residual {residual:.3e} exceeds {tolerance:.3e}"
    )]
    Singular {
        label: &'static str,
        residual: f64,
        tolerance: f64,
    },
}

/// Cholesky factor, or the pivoted LDLT factor when Cholesky breaks down.
pub enum FaerSymmetricFactor {
    Llt(Llt<f64>),
    Ldlt(Ldlt<f64>),
}

impl FaerSymmetricFactor {
    pub fn solve_in_place(&self, rhs: MatMut<'_, f64>) {
        match self {
            Self::Llt(f) => f.solve_in_place(rhs),
            Self::Ldlt(f) => f.solve_in_place(rhs),
        }
    }
}

pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    match Llt::new(matrix, side) {
        Ok(llt) => Ok(FaerSymmetricFactor::Llt(llt)),
        Err(_) => Ldlt::new(matrix, side)
            .map(FaerSymmetricFactor::Ldlt)
            .map_err(FaerLinalgError::Ldlt),
    }
}

/// faer view of an ndarray matrix. Layouts with a non-positive stride are
/// copied, the rest are borrowed in place.
pub enum FaerArrayView<'a> {
    Borrowed(MatRef<'a, f64>),
    Copied(Mat<f64>),
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] > 0 && strides[1] > 0 {
            // SAFETY: shape and strides describe `array`, borrowed for 'a.
            let view = unsafe {
                MatRef::from_raw_parts(array.as_ptr(), rows, cols, strides[0], strides[1])
            };
            Self::Borrowed(view)
        } else {
            Self::Copied(Mat::from_fn(rows, cols, |i, j| array[[i, j]]))
        }
    }

    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            Self::Borrowed(view) => *view,
            Self::Copied(mat) => mat.as_ref(),
        }
    }
}

pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let (rs, cs) = (array.strides()[0], array.strides()[1]);
    // SAFETY: `array` is mutably borrowed for the lifetime of the view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, rs, cs) }
}

/// Small products stay on ndarray's own `dot`.
fn worth_gemm(m: usize, n: usize, k: usize) -> bool {
    m.max(n).max(k) >= 32 && m.saturating_mul(n).saturating_mul(k) >= 4096
}

fn gemm(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Mat::<f64>::zeros(lhs.nrows(), rhs.ncols());
    matmul(out.as_mut(), Accum::Replace, lhs, rhs, 1.0, Par::Seq);
    mat_to_array(out.as_ref())
}

/// `Aᵀ·B`.
pub fn fast_atb<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    debug_assert_eq!(a.nrows(), b.nrows());
    if !worth_gemm(a.ncols(), b.ncols(), a.nrows()) {
        return a.t().dot(b);
    }
    gemm(
        FaerArrayView::new(a).as_ref().transpose(),
        FaerArrayView::new(b).as_ref(),
    )
}

/// `A·B`.
pub fn fast_ab<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    debug_assert_eq!(a.ncols(), b.nrows());
    if !worth_gemm(a.nrows(), b.ncols(), a.ncols()) {
        return a.dot(b);
    }
    gemm(FaerArrayView::new(a).as_ref(), FaerArrayView::new(b).as_ref())
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

pub trait FaerEigh {
    /// Eigenvalues in ascending order with matching eigenvector columns.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        if !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let eigen = FaerArrayView::new(self)
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = eigen.S().column_vector().as_mat();
        Ok((
            Array1::from_shape_fn(rows, |i| values[(i, 0)]),
            mat_to_array(eigen.U()),
        ))
    }
}
