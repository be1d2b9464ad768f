use faer::{Accum, Mat, MatMut, MatRef, Par, linalg::matmul::matmul};

use crate::{NnError, Result};

pub(crate) fn shape(m: MatRef<'_, f64>) -> (usize, usize) {
    (m.nrows(), m.ncols())
}

#[track_caller]
pub(crate) fn check_rows(layer: &'static str, m: MatRef<'_, f64>, rows: usize) -> Result<()> {
    if m.nrows() != rows {
        return Err(NnError::ShapeMismatch {
            layer,
            expected: (rows, m.ncols()),
            found: shape(m),
        });
    }
    Ok(())
}

#[track_caller]
pub(crate) fn check_shape(
    layer: &'static str,
    m: MatRef<'_, f64>,
    expected: (usize, usize),
) -> Result<()> {
    if shape(m) != expected {
        return Err(NnError::ShapeMismatch {
            layer,
            expected,
            found: shape(m),
        });
    }
    Ok(())
}

#[track_caller]
pub(crate) fn check_len(layer: &'static str, slice: &[f64], len: usize) -> Result<()> {
    if slice.len() != len {
        return Err(NnError::ShapeMismatch {
            layer,
            expected: (len, 1),
            found: (slice.len(), 1),
        });
    }
    Ok(())
}

/// Column-major view of a parameter slot.
pub(crate) fn mat_view(slice: &[f64], nrows: usize, ncols: usize) -> MatRef<'_, f64> {
    MatRef::from_column_major_slice(slice, nrows, ncols)
}

/// Column-major mutable view of a parameter slot.
pub(crate) fn mat_view_mut(slice: &mut [f64], nrows: usize, ncols: usize) -> MatMut<'_, f64> {
    MatMut::from_column_major_slice_mut(slice, nrows, ncols)
}

pub(crate) fn map(m: MatRef<'_, f64>, mut f: impl FnMut(f64) -> f64) -> Mat<f64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| f(m[(i, j)]))
}

/// Elementwise combination. `a` and `b` must have the same shape.
pub(crate) fn zip_map(
    a: MatRef<'_, f64>,
    b: MatRef<'_, f64>,
    mut f: impl FnMut(f64, f64) -> f64,
) -> Mat<f64> {
    debug_assert_eq!(shape(a), shape(b));
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| f(a[(i, j)], b[(i, j)]))
}

/// `lhs * rhs`
pub(crate) fn mul(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Mat<f64> {
    let mut out = Mat::zeros(lhs.nrows(), rhs.ncols());
    matmul(out.as_mut(), Accum::Replace, lhs, rhs, 1.0, Par::Seq);
    out
}

/// `dst += lhs * rhs`
pub(crate) fn mul_add(dst: MatMut<'_, f64>, lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) {
    matmul(dst, Accum::Add, lhs, rhs, 1.0, Par::Seq);
}

/// Sum of every row across the batch, accumulated into `out`.
pub(crate) fn add_row_sums(out: &mut [f64], m: MatRef<'_, f64>) {
    let ones = Mat::from_fn(m.ncols(), 1, |_, _| 1.0);
    let nrows = m.nrows();
    mul_add(mat_view_mut(out, nrows, 1), m, ones.as_ref());
}

/// Copies `src` into rows `row_start..` of `dst`.
pub(crate) fn copy_rows_into(dst: &mut Mat<f64>, row_start: usize, src: MatRef<'_, f64>) {
    for j in 0..src.ncols() {
        for i in 0..src.nrows() {
            dst[(row_start + i, j)] = src[(i, j)];
        }
    }
}

pub(crate) fn rows_of(m: MatRef<'_, f64>, row_start: usize, nrows: usize) -> Mat<f64> {
    Mat::from_fn(nrows, m.ncols(), |i, j| m[(row_start + i, j)])
}

/// Owned copy of columns `col_start..col_start + ncols`.
pub(crate) fn cols_of(m: MatRef<'_, f64>, col_start: usize, ncols: usize) -> Mat<f64> {
    Mat::from_fn(m.nrows(), ncols, |i, j| m[(i, col_start + j)])
}

#[cfg(test)]
mod tests {
    use faer::mat;

    use super::*;

    #[test]
    fn row_sums_accumulate() {
        let mut out = [1.0, -1.0];
        add_row_sums(&mut out, mat![[1.0, 2.0, 3.0], [0.5, 0.5, 0.5]].as_ref());
        assert_eq!(out, [7.0, 0.5]);
    }
}
