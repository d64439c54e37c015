//! Sparse LDL^T factorization of quasi-definite systems, backed by faer.
//!
//! Symbolic analysis (AMD ordering, elimination tree, supernode detection) and
//! all scratch memory are set up once in [`LdlFactor::analyze`]. Numeric
//! refactorization and solves afterwards only reuse those buffers.

use faer::dyn_stack::{MemBuffer, MemStack, StackReq};
use faer::linalg::cholesky::ldlt::factor::{LdltParams, LdltRegularization};
use faer::sparse::linalg::cholesky::{
    factorize_symbolic_cholesky, CholeskySymbolicParams, LdltRef, SymbolicCholesky,
    SymmetricOrdering,
};
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::{SparseColMatRef, SymbolicSparseColMatRef};
use faer::{Conj, MatMut, Par, Side, Spec};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactorError {
    #[error("symbolic analysis failed: {0}")]
    Symbolic(String),
    #[error("zero pivot at column {index}")]
    ZeroPivot { index: usize },
    #[error("factor contains NaN or infinity")]
    NonFinite,
    #[error("matrix has {actual} values, pattern has {expected}")]
    ValueCount { expected: usize, actual: usize },
    #[error("solve requested before numeric factorization")]
    NotFactored,
}

/// Fill-reducing ordering used during symbolic analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Amd,
    Natural,
}

/// LDL^T factorization of a symmetric matrix given by its upper triangle.
pub struct LdlFactor {
    n: usize,
    colptr: Vec<usize>,
    rowval: Vec<usize>,

    // Expected pivot signs (+1 primal block, -1 dual block) for dynamic
    // regularization, in the caller's ordering.
    signs: Vec<i8>,
    reg_delta: f64,
    reg_eps: f64,

    symbolic: SymbolicCholesky<usize>,
    ld_vals: Vec<f64>,
    work: MemBuffer,
    par: Par,
    params: Spec<LdltParams, f64>,
    factored: bool,
}

impl LdlFactor {
    /// Symbolic analysis of the upper-triangular CSC pattern.
    ///
    /// Rows within each column must be strictly increasing.
    pub fn analyze(
        n: usize,
        colptr: &[usize],
        rowval: &[usize],
        signs: Vec<i8>,
        ordering: Ordering,
    ) -> Result<Self, FactorError> {
        let symb = SymbolicSparseColMatRef::new_checked(n, n, colptr, None, rowval);
        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::AUTO,
            ..Default::default()
        };
        let ordering = match ordering {
            Ordering::Amd => SymmetricOrdering::Amd,
            Ordering::Natural => SymmetricOrdering::Identity,
        };
        let symbolic = factorize_symbolic_cholesky(symb, Side::Upper, ordering, params)
            .map_err(|e| FactorError::Symbolic(format!("{:?}", e)))?;

        let par = Par::Seq;
        let ldlt_params: Spec<LdltParams, f64> = Spec::default();
        let req_factor = symbolic.factorize_numeric_ldlt_scratch::<f64>(par, ldlt_params);
        let req_solve = symbolic.solve_in_place_scratch::<f64>(1, par);
        let work = MemBuffer::new(StackReq::any_of(&[req_factor, req_solve]));

        Ok(Self {
            n,
            colptr: colptr.to_vec(),
            rowval: rowval.to_vec(),
            signs,
            reg_delta: 1e-7,
            reg_eps: 1e-13,
            ld_vals: vec![0.0; symbolic.len_val()],
            symbolic,
            work,
            par,
            params: ldlt_params,
            factored: false,
        })
    }

    /// Nonzeros in the factor (fill-in included).
    pub fn factor_nnz(&self) -> usize {
        self.ld_vals.len()
    }

    /// Numeric factorization with the analyzed pattern and new values.
    pub fn factor(&mut self, values: &[f64]) -> Result<(), FactorError> {
        if values.len() != self.rowval.len() {
            return Err(FactorError::ValueCount {
                expected: self.rowval.len(),
                actual: values.len(),
            });
        }
        self.factored = false;

        let symb = SymbolicSparseColMatRef::new_checked(
            self.n,
            self.n,
            &self.colptr,
            None,
            &self.rowval,
        );
        let mat = SparseColMatRef::new(symb, values);
        let regularization = LdltRegularization {
            dynamic_regularization_signs: Some(&self.signs),
            dynamic_regularization_delta: self.reg_delta,
            dynamic_regularization_epsilon: self.reg_eps,
        };

        self.symbolic
            .factorize_numeric_ldlt(
                &mut self.ld_vals,
                mat,
                Side::Upper,
                regularization,
                self.par,
                MemStack::new(&mut self.work),
                self.params,
            )
            .map_err(|e| match e {
                faer::linalg::cholesky::ldlt::factor::LdltError::ZeroPivot { index } => {
                    FactorError::ZeroPivot { index }
                }
            })?;

        if self.ld_vals.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::NonFinite);
        }
        self.factored = true;
        Ok(())
    }

    /// Overwrite `rhs` with K^{-1} rhs.
    pub fn solve_in_place(&mut self, rhs: &mut [f64]) -> Result<(), FactorError> {
        if !self.factored {
            return Err(FactorError::NotFactored);
        }
        let ldlt = LdltRef::new(&self.symbolic, &self.ld_vals);
        ldlt.solve_in_place_with_conj(
            Conj::No,
            MatMut::from_column_major_slice_mut(rhs, self.n, 1),
            self.par,
            MemStack::new(&mut self.work),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spd_solve() {
        // K = [2, 1; 1, 2]
        let mut ldl = LdlFactor::analyze(2, &[0, 1, 3], &[0, 0, 1], vec![1, 1], Ordering::Amd)
            .unwrap();
        ldl.factor(&[2.0, 1.0, 2.0]).unwrap();
        let mut rhs = vec![3.0, 4.0];
        ldl.solve_in_place(&mut rhs).unwrap();
        assert!((rhs[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((rhs[1] - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_quasi_definite_solve_and_refactor() {
        // K = [1, 0, 1; 0, 1, 1; 1, 1, -1] (upper triangle)
        let colptr = [0, 1, 2, 5];
        let rowval = [0, 1, 0, 1, 2];
        let mut ldl =
            LdlFactor::analyze(3, &colptr, &rowval, vec![1, 1, -1], Ordering::Amd).unwrap();
        assert!(matches!(
            ldl.solve_in_place(&mut [0.0; 3]),
            Err(FactorError::NotFactored)
        ));

        for scale in [1.0, 3.0] {
            let vals = [scale, scale, 1.0, 1.0, -1.0];
            ldl.factor(&vals).unwrap();
            let rhs = [1.0, 2.0, 1.0];
            let mut sol = rhs;
            ldl.solve_in_place(&mut sol).unwrap();

            let kx = [
                scale * sol[0] + sol[2],
                scale * sol[1] + sol[2],
                sol[0] + sol[1] - sol[2],
            ];
            for i in 0..3 {
                assert!((kx[i] - rhs[i]).abs() < 1e-10, "row {} residual", i);
            }
        }
    }

    #[test]
    fn test_nan_value_reports_non_finite_factor() {
        let mut ldl = LdlFactor::analyze(2, &[0, 1, 3], &[0, 0, 1], vec![1, 1], Ordering::Amd)
            .unwrap();
        assert!(matches!(
            ldl.factor(&[f64::NAN, 1.0, 2.0]),
            Err(FactorError::NonFinite)
        ));
        assert!(matches!(
            ldl.solve_in_place(&mut [1.0, 1.0]),
            Err(FactorError::NotFactored)
        ));
        // A clean refactor recovers.
        ldl.factor(&[2.0, 1.0, 2.0]).unwrap();
    }

    #[test]
    fn test_value_count_checked() {
        let mut ldl =
            LdlFactor::analyze(1, &[0, 1], &[0], vec![1], Ordering::Natural).unwrap();
        assert!(matches!(
            ldl.factor(&[1.0, 2.0]),
            Err(FactorError::ValueCount { expected: 1, actual: 2 })
        ));
    }
}
