use crate::linalg::faer_ndarray::{
    FaerArrayView, FaerLinalgError, array2_to_mat_mut, factorize_symmetric_with_fallback, fast_ab,
};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Allowed growth of `max|A·A⁻¹ − I|` over the rounding bound `n·ε·‖A‖·‖A⁻¹‖`.
const RESIDUAL_SAFETY: f64 = 100.0;

fn inf_norm(matrix: &Array2<f64>) -> f64 {
    matrix
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Inverts a symmetric matrix through LLT with an LDLT fallback.
///
/// The matrix counts as singular when the factorization fails, the inverse
/// is not finite, or `‖A‖∞·‖A⁻¹‖∞ ≥ 1/ε`. Below that the residual
/// `A·A⁻¹ − I` is only checked against its own rounding bound, so a badly
/// conditioned but invertible matrix is accepted.
pub(crate) fn symmetric_inverse(
    matrix: &Array2<f64>,
    label: &'static str,
) -> Result<Array2<f64>, FaerLinalgError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    if !matrix.iter().all(|v| v.is_finite()) {
        return Err(FaerLinalgError::NonFinite);
    }

    let view = FaerArrayView::new(matrix);
    let factor = factorize_symmetric_with_fallback(view.as_ref(), Side::Lower)?;

    let mut inv = Array2::<f64>::eye(rows);
    factor.solve_in_place(array2_to_mat_mut(&mut inv));

    let condition = inf_norm(matrix) * inf_norm(&inv);
    if !(condition.is_finite() && condition * f64::EPSILON < 1.0) {
        return Err(FaerLinalgError::IllConditioned { label, condition });
    }

    let mut residual = fast_ab(matrix, &inv);
    for i in 0..rows {
        residual[[i, i]] -= 1.0;
    }
    let max_residual = residual.iter().fold(0.0f64, |acc, &x| acc.max(x.abs()));
    let tolerance = RESIDUAL_SAFETY * rows as f64 * f64::EPSILON * condition;
    if !(max_residual <= tolerance) {
        return Err(FaerLinalgError::Singular {
            label,
            residual: max_residual,
            tolerance,
        });
    }

    symmetrize(&mut inv);
    Ok(inv)
}

/// Numerical products leave tiny asymmetry; average it away.
pub(crate) fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

/// `A · S · Aᵀ`, symmetrized.
pub(crate) fn similarity(a: ArrayView2<'_, f64>, s: &Array2<f64>) -> Array2<f64> {
    let left = fast_ab(&a, s);
    let mut out = fast_ab(&left, &a.t());
    symmetrize(&mut out);
    out
}

/// `A · diag(d) · Aᵀ`, symmetrized.
pub(crate) fn diagonal_similarity(a: ArrayView2<'_, f64>, d: ArrayView1<'_, f64>) -> Array2<f64> {
    let mut scaled = a.to_owned();
    for (mut col, &w) in scaled.columns_mut().into_iter().zip(d.iter()) {
        col *= w;
    }
    let mut out = fast_ab(&scaled, &a.t());
    symmetrize(&mut out);
    out
}

/// Per-bin inverse variance; bins without a positive variance carry no weight.
pub fn inverse_variances(variances: ArrayView1<'_, f64>) -> Array1<f64> {
    variances.mapv(|v| if v > 0.0 { 1.0 / v } else { 0.0 })
}
