//! Sparse matrix types and operations.
//!
//! CSC storage throughout, as the factorization backend expects. The product
//! kernels write into caller-provided buffers so they can run on the solve
//! path without allocating.

use sprs::errors::StructureError;
use sprs::{CsMat, TriMat};

/// Sparse matrix in CSC format (general, not necessarily symmetric).
pub type SparseCsc = CsMat<f64>;

/// Build a sparse CSC matrix from triplets (row, col, value).
///
/// Duplicate entries are summed.
pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I) -> SparseCsc
where
    I: IntoIterator<Item = (usize, usize, f64)>,
{
    let mut tri = TriMat::new((nrows, ncols));
    for (i, j, v) in triplets {
        tri.add_triplet(i, j, v);
    }
    tri.to_csc()
}

/// Build a CSC matrix from raw parts, checking the structure.
pub fn try_csc(
    nrows: usize,
    ncols: usize,
    colptr: Vec<usize>,
    rowval: Vec<usize>,
    values: Vec<f64>,
) -> Result<SparseCsc, StructureError> {
    CsMat::try_new_csc((nrows, ncols), colptr, rowval, values).map_err(|(_, _, _, e)| e)
}

/// Create a diagonal matrix in CSC format.
pub fn diagonal(diag: &[f64]) -> SparseCsc {
    let n = diag.len();
    from_triplets(n, n, diag.iter().enumerate().map(|(i, &v)| (i, i, v)))
}

/// Create an identity matrix in CSC format.
pub fn identity(n: usize) -> SparseCsc {
    diagonal(&vec![1.0; n])
}

/// Keep only the upper triangle (row <= col) of a square matrix.
///
/// Explicit zeros on the diagonal are kept so the pattern survives value
/// updates.
pub fn upper_triangle(mat: &SparseCsc) -> SparseCsc {
    let mat = mat.to_csc();
    let mut tri = TriMat::new((mat.rows(), mat.cols()));
    for (val, (row, col)) in mat.iter() {
        if row <= col {
            tri.add_triplet(row, col, *val);
        }
    }
    tri.to_csc()
}

/// y = alpha * A * x + beta * y
pub fn spmv(a: &SparseCsc, x: &[f64], y: &mut [f64], alpha: f64, beta: f64) {
    debug_assert_eq!(a.cols(), x.len());
    debug_assert_eq!(a.rows(), y.len());

    scale_in_place(y, beta);
    if alpha == 0.0 {
        return;
    }

    let colptr = a.indptr();
    let colptr = colptr.raw_storage();
    let rowval = a.indices();
    let nzval = a.data();
    for (col, &xj) in x.iter().enumerate() {
        let axj = alpha * xj;
        if axj == 0.0 {
            continue;
        }
        for k in colptr[col]..colptr[col + 1] {
            y[rowval[k]] += nzval[k] * axj;
        }
    }
}

/// y = alpha * A^T * x + beta * y
pub fn spmv_transpose(a: &SparseCsc, x: &[f64], y: &mut [f64], alpha: f64, beta: f64) {
    debug_assert_eq!(a.rows(), x.len());
    debug_assert_eq!(a.cols(), y.len());

    scale_in_place(y, beta);
    if alpha == 0.0 {
        return;
    }

    let colptr = a.indptr();
    let colptr = colptr.raw_storage();
    let rowval = a.indices();
    let nzval = a.data();
    for (col, yj) in y.iter_mut().enumerate() {
        let mut acc = 0.0;
        for k in colptr[col]..colptr[col + 1] {
            acc += nzval[k] * x[rowval[k]];
        }
        *yj += alpha * acc;
    }
}

/// y = alpha * P * x + beta * y for symmetric P stored as its upper triangle.
pub fn symv_upper(p: &SparseCsc, x: &[f64], y: &mut [f64], alpha: f64, beta: f64) {
    debug_assert_eq!(p.cols(), x.len());
    debug_assert_eq!(p.rows(), y.len());

    scale_in_place(y, beta);
    if alpha == 0.0 {
        return;
    }

    let colptr = p.indptr();
    let colptr = colptr.raw_storage();
    let rowval = p.indices();
    let nzval = p.data();
    for col in 0..p.cols() {
        for k in colptr[col]..colptr[col + 1] {
            let row = rowval[k];
            let v = alpha * nzval[k];
            y[row] += v * x[col];
            if row != col {
                y[col] += v * x[row];
            }
        }
    }
}

/// x^T P x for symmetric P stored as its upper triangle.
pub fn quad_form_upper(p: &SparseCsc, x: &[f64]) -> f64 {
    let colptr = p.indptr();
    let colptr = colptr.raw_storage();
    let rowval = p.indices();
    let nzval = p.data();
    let mut acc = 0.0;
    for col in 0..p.cols() {
        for k in colptr[col]..colptr[col + 1] {
            let row = rowval[k];
            let term = nzval[k] * x[row] * x[col];
            acc += if row == col { term } else { 2.0 * term };
        }
    }
    acc
}

/// Column infinity norms of a symmetric matrix stored as its upper triangle,
/// folded into `norms` with `max`.
pub fn col_norms_sym_upper(p: &SparseCsc, norms: &mut [f64]) {
    let colptr = p.indptr();
    let colptr = colptr.raw_storage();
    let rowval = p.indices();
    let nzval = p.data();
    for col in 0..p.cols() {
        for k in colptr[col]..colptr[col + 1] {
            let row = rowval[k];
            let v = nzval[k].abs();
            norms[col] = norms[col].max(v);
            if row != col {
                norms[row] = norms[row].max(v);
            }
        }
    }
}

/// Row and column infinity norms of a general matrix, folded with `max`.
pub fn row_col_norms(a: &SparseCsc, row_norms: &mut [f64], col_norms: &mut [f64]) {
    let colptr = a.indptr();
    let colptr = colptr.raw_storage();
    let rowval = a.indices();
    let nzval = a.data();
    for col in 0..a.cols() {
        for k in colptr[col]..colptr[col + 1] {
            let v = nzval[k].abs();
            row_norms[rowval[k]] = row_norms[rowval[k]].max(v);
            col_norms[col] = col_norms[col].max(v);
        }
    }
}

/// values <- diag(left) * M * diag(right) for a CSC pattern given as slices.
///
/// Works on the value array alone so callers can keep the pattern elsewhere
/// and mutate values without touching the matrix structure.
pub fn scale_values(
    colptr: &[usize],
    rowval: &[usize],
    values: &mut [f64],
    left: &[f64],
    right: &[f64],
) {
    for (col, &r) in right.iter().enumerate() {
        for k in colptr[col]..colptr[col + 1] {
            values[k] *= left[rowval[k]] * r;
        }
    }
}

/// Largest absolute value in a slice (0 for empty).
pub fn norm_inf(x: &[f64]) -> f64 {
    x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

fn scale_in_place(y: &mut [f64], beta: f64) {
    if beta == 0.0 {
        y.fill(0.0);
    } else if beta != 1.0 {
        for yi in y.iter_mut() {
            *yi *= beta;
        }
    }
}
