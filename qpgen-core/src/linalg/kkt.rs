//! Quasi-definite KKT system of the ADMM linear step.
//!
//! ```text
//! K = [ P + σI        A^T      ]
//!     [ A       -diag(1/ρ)     ]
//! ```
//!
//! The upper triangle of K is assembled once from the fixed patterns of P and
//! A. Index maps from P/A value slots, P diagonals and ρ diagonals into the
//! KKT value array let numeric updates run in O(nnz) with no reassembly.

use super::ldl::{FactorError, LdlFactor, Ordering};
use super::sparse::SparseCsc;

pub struct KktSystem {
    n: usize,
    m: usize,
    colptr: Vec<usize>,
    rowval: Vec<usize>,
    values: Vec<f64>,

    /// P value slot -> KKT slot
    p_map: Vec<usize>,
    /// A value slot -> KKT slot
    a_map: Vec<usize>,
    /// KKT slot of diagonal (j, j) for j < n
    p_diag: Vec<usize>,
    /// P value slot holding (j, j), if the pattern of P has one
    p_diag_src: Vec<Option<usize>>,
    /// KKT slot of diagonal (n + i, n + i)
    rho_diag: Vec<usize>,

    factor: LdlFactor,
    sigma: f64,
}

impl KktSystem {
    /// Assemble the pattern of K from P (upper triangle) and A, and run the
    /// symbolic analysis.
    pub fn new(p: &SparseCsc, a: &SparseCsc) -> Result<Self, FactorError> {
        let n = p.cols();
        let m = a.rows();
        let dim = n + m;

        let p_colptr = p.indptr();
        let p_colptr = p_colptr.raw_storage();
        let p_rowval = p.indices();
        let a_colptr = a.indptr();
        let a_colptr = a_colptr.raw_storage();
        let a_rowval = a.indices();

        // Entries of A grouped by row, columns ascending: (col, A slot).
        let mut row_start = vec![0usize; m + 1];
        for &row in a_rowval {
            row_start[row + 1] += 1;
        }
        for i in 0..m {
            row_start[i + 1] += row_start[i];
        }
        let mut by_row = vec![(0usize, 0usize); a_rowval.len()];
        let mut fill = row_start.clone();
        for col in 0..n {
            for k in a_colptr[col]..a_colptr[col + 1] {
                let row = a_rowval[k];
                by_row[fill[row]] = (col, k);
                fill[row] += 1;
            }
        }

        let nnz = p_rowval.len() + n + a_rowval.len() + m;
        let mut colptr = Vec::with_capacity(dim + 1);
        let mut rowval = Vec::with_capacity(nnz);
        let mut p_map = vec![0usize; p_rowval.len()];
        let mut a_map = vec![0usize; a_rowval.len()];
        let mut p_diag = Vec::with_capacity(n);
        let mut p_diag_src = vec![None; n];
        let mut rho_diag = Vec::with_capacity(m);

        colptr.push(0);
        for col in 0..n {
            for k in p_colptr[col]..p_colptr[col + 1] {
                let row = p_rowval[k];
                if row == col {
                    p_diag_src[col] = Some(k);
                } else {
                    p_map[k] = rowval.len();
                    rowval.push(row);
                }
            }
            // Diagonal last: every other row in an upper column is smaller.
            let slot = rowval.len();
            rowval.push(col);
            p_diag.push(slot);
            if let Some(k) = p_diag_src[col] {
                p_map[k] = slot;
            }
            colptr.push(rowval.len());
        }
        for row in 0..m {
            for &(col, k) in &by_row[row_start[row]..row_start[row + 1]] {
                a_map[k] = rowval.len();
                rowval.push(col);
            }
            rho_diag.push(rowval.len());
            rowval.push(n + row);
            colptr.push(rowval.len());
        }

        let mut signs = vec![1i8; dim];
        for s in &mut signs[n..] {
            *s = -1;
        }
        let factor = LdlFactor::analyze(dim, &colptr, &rowval, signs, Ordering::Amd)?;

        Ok(Self {
            n,
            m,
            values: vec![0.0; rowval.len()],
            colptr,
            rowval,
            p_map,
            a_map,
            p_diag,
            p_diag_src,
            rho_diag,
            factor,
            sigma: 0.0,
        })
    }

    pub fn dim(&self) -> usize {
        self.n + self.m
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn nnz(&self) -> usize {
        self.rowval.len()
    }

    pub fn factor_nnz(&self) -> usize {
        self.factor.factor_nnz()
    }

    /// Write all values: P + σI, A^T and -1/ρ.
    pub fn update_values(&mut self, p: &[f64], a: &[f64], sigma: f64, rho_inv: &[f64]) {
        for (k, &slot) in self.p_map.iter().enumerate() {
            self.values[slot] = p[k];
        }
        for (j, &slot) in self.p_diag.iter().enumerate() {
            let pjj = self.p_diag_src[j].map_or(0.0, |k| p[k]);
            self.values[slot] = pjj + sigma;
        }
        for (k, &slot) in self.a_map.iter().enumerate() {
            self.values[slot] = a[k];
        }
        self.sigma = sigma;
        self.update_rho(rho_inv);
    }

    /// Rewrite only the -1/ρ diagonal.
    pub fn update_rho(&mut self, rho_inv: &[f64]) {
        for (i, &slot) in self.rho_diag.iter().enumerate() {
            self.values[slot] = -rho_inv[i];
        }
    }

    pub fn factor(&mut self) -> Result<(), FactorError> {
        self.factor.factor(&self.values)
    }

    pub fn solve_in_place(&mut self, rhs: &mut [f64]) -> Result<(), FactorError> {
        self.factor.solve_in_place(rhs)
    }

    /// y = K x using the assembled upper triangle.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
        for col in 0..self.dim() {
            for k in self.colptr[col]..self.colptr[col + 1] {
                let row = self.rowval[k];
                let v = self.values[k];
                y[row] += v * x[col];
                if row != col {
                    y[col] += v * x[row];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse;

    #[test]
    fn test_assembly_inserts_missing_diagonal() {
        // P has no (1, 1) entry.
        let p = sparse::from_triplets(2, 2, vec![(0, 0, 4.0), (0, 1, 1.0)]);
        let a = sparse::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, 1.0)]);
        let mut kkt = KktSystem::new(&p, &a).unwrap();
        assert_eq!(kkt.dim(), 3);
        assert_eq!(kkt.nnz(), 1 + 2 + 2 + 1);

        kkt.update_values(p.data(), a.data(), 0.5, &[0.1]);
        kkt.factor().unwrap();

        let x = [1.0, -2.0, 3.0];
        let mut rhs = vec![0.0; 3];
        kkt.matvec(&x, &mut rhs);
        // [4.5, 1, 1; 1, 0.5, 1; 1, 1, -0.1] * x
        assert!((rhs[0] - (4.5 - 2.0 + 3.0)).abs() < 1e-12);
        assert!((rhs[1] - (1.0 - 1.0 + 3.0)).abs() < 1e-12);
        assert!((rhs[2] - (1.0 - 2.0 - 0.3)).abs() < 1e-12);

        kkt.solve_in_place(&mut rhs).unwrap();
        for i in 0..3 {
            assert!((rhs[i] - x[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rho_update_refactors() {
        let p = sparse::identity(2);
        let a = sparse::identity(2);
        let mut kkt = KktSystem::new(&p, &a).unwrap();
        kkt.update_values(p.data(), a.data(), 1e-6, &[1.0, 1.0]);
        kkt.factor().unwrap();
        kkt.update_rho(&[0.01, 100.0]);
        kkt.factor().unwrap();

        let x = [1.0, 2.0, 3.0, 4.0];
        let mut rhs = vec![0.0; 4];
        kkt.matvec(&x, &mut rhs);
        assert!((rhs[2] - (1.0 - 0.03)).abs() < 1e-12);
        assert!((rhs[3] - (2.0 - 400.0)).abs() < 1e-12);
        kkt.solve_in_place(&mut rhs).unwrap();
        for i in 0..4 {
            assert!((rhs[i] - x[i]).abs() < 1e-8);
        }
    }
}
