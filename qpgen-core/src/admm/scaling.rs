//! Modified Ruiz equilibration of the KKT matrix, computed in place.
//!
//! With D (columns), E (rows) and cost scaling c the solver works on
//!
//! ```text
//! P_s = c D P D,  q_s = c D q,  A_s = E A D,  l_s = E l,  u_s = E u
//! ```
//!
//! and maps iterates back with x = D x_s, z = E⁻¹ z_s, y = c⁻¹ E y_s.
//! All buffers are sized at construction; rescaling after a matrix update
//! reuses them.

use crate::linalg::sparse::{self, SparseCsc};
use crate::workspace::CanonicalQp;

/// Scaling factors below this are treated as 1 (empty rows/columns).
pub(crate) const MIN_SCALING: f64 = 1e-4;
pub(crate) const MAX_SCALING: f64 = 1e4;

/// Scaled copy of the canonical data, same patterns as the source.
pub(crate) struct ScaledQp {
    pub p: SparseCsc,
    pub a: SparseCsc,
    pub q: Vec<f64>,
    pub l: Vec<f64>,
    pub u: Vec<f64>,
    p_colptr: Vec<usize>,
    p_rowval: Vec<usize>,
    a_colptr: Vec<usize>,
    a_rowval: Vec<usize>,
}

impl ScaledQp {
    pub fn new(data: &CanonicalQp) -> Self {
        Self {
            p: data.p.clone(),
            a: data.a.clone(),
            q: data.q.clone(),
            l: data.l.clone(),
            u: data.u.clone(),
            p_colptr: data.p.indptr().raw_storage().to_vec(),
            p_rowval: data.p.indices().to_vec(),
            a_colptr: data.a.indptr().raw_storage().to_vec(),
            a_rowval: data.a.indices().to_vec(),
        }
    }
}

/// Accumulated scaling factors.
pub(crate) struct Scaling {
    pub d: Vec<f64>,
    pub d_inv: Vec<f64>,
    pub e: Vec<f64>,
    pub e_inv: Vec<f64>,
    pub c: f64,
    pub c_inv: f64,
    d_temp: Vec<f64>,
    e_temp: Vec<f64>,
    p_norms: Vec<f64>,
}

impl Scaling {
    pub fn identity(n: usize, m: usize) -> Self {
        Self {
            d: vec![1.0; n],
            d_inv: vec![1.0; n],
            e: vec![1.0; m],
            e_inv: vec![1.0; m],
            c: 1.0,
            c_inv: 1.0,
            d_temp: vec![0.0; n],
            e_temp: vec![0.0; m],
            p_norms: vec![0.0; n],
        }
    }

    /// Copy P, A and q from `data` and equilibrate them.
    ///
    /// Bounds are not touched; call [`Scaling::load_bounds`] afterwards since
    /// E changes here.
    pub fn equilibrate(&mut self, data: &CanonicalQp, scaled: &mut ScaledQp, iters: usize) {
        scaled.p.data_mut().copy_from_slice(data.p.data());
        scaled.a.data_mut().copy_from_slice(data.a.data());
        scaled.q.copy_from_slice(&data.q);

        self.d.fill(1.0);
        self.e.fill(1.0);
        self.c = 1.0;

        for _ in 0..iters {
            // Column norms of the KKT matrix [P A'; A 0] restricted to the
            // first n columns, and row norms of A.
            self.d_temp.fill(0.0);
            self.e_temp.fill(0.0);
            sparse::col_norms_sym_upper(&scaled.p, &mut self.d_temp);
            sparse::row_col_norms(&scaled.a, &mut self.e_temp, &mut self.d_temp);

            for v in self.d_temp.iter_mut().chain(self.e_temp.iter_mut()) {
                *v = 1.0 / limit_scaling(*v).sqrt();
            }

            sparse::scale_values(
                &scaled.p_colptr,
                &scaled.p_rowval,
                scaled.p.data_mut(),
                &self.d_temp,
                &self.d_temp,
            );
            sparse::scale_values(
                &scaled.a_colptr,
                &scaled.a_rowval,
                scaled.a.data_mut(),
                &self.e_temp,
                &self.d_temp,
            );
            for j in 0..self.d.len() {
                self.d[j] *= self.d_temp[j];
                scaled.q[j] *= self.d_temp[j];
            }
            for i in 0..self.e.len() {
                self.e[i] *= self.e_temp[i];
            }

            // Cost scaling: bring the average column norm of P and the
            // largest |q| to about one.
            self.p_norms.fill(0.0);
            sparse::col_norms_sym_upper(&scaled.p, &mut self.p_norms);
            let mean_p = if self.p_norms.is_empty() {
                0.0
            } else {
                self.p_norms.iter().sum::<f64>() / self.p_norms.len() as f64
            };
            let q_norm = limit_scaling(sparse::norm_inf(&scaled.q));
            let c_temp = 1.0 / limit_scaling(mean_p.max(q_norm));

            for v in scaled.p.data_mut() {
                *v *= c_temp;
            }
            for v in scaled.q.iter_mut() {
                *v *= c_temp;
            }
            self.c *= c_temp;
        }

        for (inv, &d) in self.d_inv.iter_mut().zip(&self.d) {
            *inv = 1.0 / d;
        }
        for (inv, &e) in self.e_inv.iter_mut().zip(&self.e) {
            *inv = 1.0 / e;
        }
        self.c_inv = 1.0 / self.c;
    }

    /// q_s = c D q
    pub fn load_q(&self, data: &CanonicalQp, scaled: &mut ScaledQp) {
        for j in 0..self.d.len() {
            scaled.q[j] = self.c * self.d[j] * data.q[j];
        }
    }

    /// l_s = E l, u_s = E u (infinities stay infinite).
    pub fn load_bounds(&self, data: &CanonicalQp, scaled: &mut ScaledQp) {
        for i in 0..self.e.len() {
            scaled.l[i] = self.e[i] * data.l[i];
            scaled.u[i] = self.e[i] * data.u[i];
        }
    }
}

fn limit_scaling(v: f64) -> f64 {
    if v < MIN_SCALING {
        1.0
    } else if v > MAX_SCALING {
        MAX_SCALING
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::from_triplets;

    fn badly_scaled() -> CanonicalQp {
        let p = from_triplets(2, 2, vec![(0, 0, 1e4), (1, 1, 1e-2)]);
        let a = from_triplets(2, 2, vec![(0, 0, 1e3), (1, 1, 1.0), (1, 0, 5.0)]);
        CanonicalQp::new(
            p,
            vec![10.0, -0.1],
            a,
            vec![-1.0, f64::NEG_INFINITY],
            vec![1.0, 2.0],
            0.0,
        )
    }

    #[test]
    fn test_scaled_data_matches_definition() {
        let data = badly_scaled();
        let mut scaled = ScaledQp::new(&data);
        let mut scaling = Scaling::identity(2, 2);
        scaling.equilibrate(&data, &mut scaled, 10);
        scaling.load_bounds(&data, &mut scaled);

        // P_s = c D P D, entry by entry (diagonal P).
        let p_s = scaled.p.data();
        assert!((p_s[0] - scaling.c * scaling.d[0] * 1e4 * scaling.d[0]).abs() < 1e-9 * p_s[0].abs());
        // A_s = E A D
        let a_s = scaled.a.data();
        assert!((a_s[0] - scaling.e[0] * 1e3 * scaling.d[0]).abs() < 1e-9 * a_s[0].abs());
        // q_s = c D q
        assert!((scaled.q[0] - scaling.c * scaling.d[0] * 10.0).abs() < 1e-12);
        assert!(scaled.l[1].is_infinite() && scaled.l[1] < 0.0);
        assert!((scaled.u[1] - scaling.e[1] * 2.0).abs() < 1e-12);

        // Equilibration shrinks the spread of A's entries.
        let spread = a_s.iter().map(|v| v.abs()).fold(0.0_f64, f64::max)
            / a_s.iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min);
        assert!(spread < 1e3 / 1.0);

        let mut again = ScaledQp::new(&data);
        scaling.load_q(&data, &mut again);
        assert!((again.q[1] - scaled.q[1]).abs() < 1e-12);
    }

    #[test]
    fn test_zero_iterations_is_identity() {
        let data = badly_scaled();
        let mut scaled = ScaledQp::new(&data);
        let mut scaling = Scaling::identity(2, 2);
        scaling.equilibrate(&data, &mut scaled, 0);
        assert_eq!(scaled.p.data(), data.p.data());
        assert_eq!(scaling.c, 1.0);
        assert!(scaling.d_inv.iter().all(|&v| v == 1.0));
    }
}
