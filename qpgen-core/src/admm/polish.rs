//! Active-set polishing.
//!
//! After ADMM converges, guess the active constraints from the signs of the
//! duals and solve the equality-constrained QP on that set:
//!
//! ```text
//! [ P + δI   A_actᵀ ] [x]   [ -q    ]
//! [ A_act    -δI    ] [y] = [ b_act ]
//! ```
//!
//! with iterative refinement against the unregularized matrix. The result
//! replaces the ADMM solution only if it does not make the residuals worse.
//!
//! Buffers are kept between calls and only grow; the reduced system's
//! symbolic analysis is redone per call since the active set changes.

use super::scaling::ScaledQp;
use crate::linalg::ldl::{FactorError, LdlFactor, Ordering};
use crate::linalg::sparse::{self, SparseCsc};

pub(crate) struct Polisher {
    n: usize,
    // Entries of A grouped by row: (column, value slot), columns ascending.
    row_start: Vec<usize>,
    row_entries: Vec<(usize, usize)>,

    active: Vec<(usize, f64)>,
    colptr: Vec<usize>,
    rowval: Vec<usize>,
    values: Vec<f64>,
    rhs: Vec<f64>,
    sol: Vec<f64>,
    kx: Vec<f64>,

    pub x: Vec<f64>,
    pub z: Vec<f64>,
    pub y: Vec<f64>,
}

impl Polisher {
    pub fn new(a: &SparseCsc) -> Self {
        let m = a.rows();
        let n = a.cols();
        let colptr = a.indptr();
        let colptr = colptr.raw_storage();
        let rowval = a.indices();

        let mut row_start = vec![0usize; m + 1];
        for &row in rowval {
            row_start[row + 1] += 1;
        }
        for i in 0..m {
            row_start[i + 1] += row_start[i];
        }
        let mut row_entries = vec![(0usize, 0usize); rowval.len()];
        let mut fill = row_start.clone();
        for col in 0..n {
            for k in colptr[col]..colptr[col + 1] {
                let row = rowval[k];
                row_entries[fill[row]] = (col, k);
                fill[row] += 1;
            }
        }

        Self {
            n,
            row_start,
            row_entries,
            active: Vec::new(),
            colptr: Vec::new(),
            rowval: Vec::new(),
            values: Vec::new(),
            rhs: Vec::new(),
            sol: Vec::new(),
            kx: Vec::new(),
            x: vec![0.0; n],
            z: vec![0.0; m],
            y: vec![0.0; m],
        }
    }

    /// Number of constraints guessed active in the last run.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Polish the scaled iterate (x, z, y); results land in `self.x/z/y`.
    pub fn run(
        &mut self,
        qp: &ScaledQp,
        z: &[f64],
        y: &[f64],
        delta: f64,
        refine_iters: usize,
    ) -> Result<(), FactorError> {
        let n = self.n;

        self.active.clear();
        for i in 0..z.len() {
            if z[i] - qp.l[i] < -y[i] {
                self.active.push((i, qp.l[i]));
            } else if qp.u[i] - z[i] < y[i] {
                self.active.push((i, qp.u[i]));
            }
        }
        let dim = n + self.active.len();

        self.assemble(qp, delta);
        let mut signs = vec![1i8; dim];
        for s in &mut signs[n..] {
            *s = -1;
        }
        let mut factor = LdlFactor::analyze(dim, &self.colptr, &self.rowval, signs, Ordering::Amd)?;
        factor.factor(&self.values)?;

        self.rhs.clear();
        self.rhs.extend(qp.q.iter().map(|q| -q));
        self.rhs.extend(self.active.iter().map(|&(_, b)| b));
        self.sol.clear();
        self.sol.extend_from_slice(&self.rhs);
        factor.solve_in_place(&mut self.sol)?;

        self.kx.resize(dim, 0.0);
        for _ in 0..refine_iters {
            // residual against K0 = Kδ - diag(δI, -δI)
            reduced_matvec(&self.colptr, &self.rowval, &self.values, &self.sol, &mut self.kx);
            for j in 0..dim {
                let reg = if j < n { delta } else { -delta };
                self.kx[j] = self.rhs[j] - (self.kx[j] - reg * self.sol[j]);
            }
            factor.solve_in_place(&mut self.kx)?;
            for j in 0..dim {
                self.sol[j] += self.kx[j];
            }
        }

        self.x.copy_from_slice(&self.sol[..n]);
        self.y.fill(0.0);
        for (r, &(row, _)) in self.active.iter().enumerate() {
            self.y[row] = self.sol[n + r];
        }
        sparse::spmv(&qp.a, &self.x, &mut self.z, 1.0, 0.0);
        Ok(())
    }

    fn assemble(&mut self, qp: &ScaledQp, delta: f64) {
        let p_colptr = qp.p.indptr();
        let p_colptr = p_colptr.raw_storage();
        let p_rowval = qp.p.indices();
        let p_vals = qp.p.data();
        let a_vals = qp.a.data();

        self.colptr.clear();
        self.rowval.clear();
        self.values.clear();
        self.colptr.push(0);

        for col in 0..self.n {
            let mut diag = 0.0;
            for k in p_colptr[col]..p_colptr[col + 1] {
                if p_rowval[k] == col {
                    diag += p_vals[k];
                } else {
                    self.rowval.push(p_rowval[k]);
                    self.values.push(p_vals[k]);
                }
            }
            self.rowval.push(col);
            self.values.push(diag + delta);
            self.colptr.push(self.rowval.len());
        }
        for (r, &(row, _)) in self.active.iter().enumerate() {
            for &(col, slot) in &self.row_entries[self.row_start[row]..self.row_start[row + 1]] {
                self.rowval.push(col);
                self.values.push(a_vals[slot]);
            }
            self.rowval.push(self.n + r);
            self.values.push(-delta);
            self.colptr.push(self.rowval.len());
        }
    }
}

/// y = K x for a symmetric matrix stored as its upper triangle.
fn reduced_matvec(colptr: &[usize], rowval: &[usize], values: &[f64], x: &[f64], y: &mut [f64]) {
    y.fill(0.0);
    for col in 0..colptr.len() - 1 {
        for k in colptr[col]..colptr[col + 1] {
            let row = rowval[k];
            y[row] += values[k] * x[col];
            if row != col {
                y[col] += values[k] * x[row];
            }
        }
    }
}
