//! Generation-time canonical QP template.
//!
//! A template is what the canonicalizer hands over once: dimensions, the
//! fixed sparsity patterns of P and A, constant data, and the affine maps that
//! connect named parameters and variables to canonical entries. It is the
//! persisted artifact from which a [`crate::Workspace`] is rebuilt in another
//! process.
//!
//! The canonical problem is
//!
//! ```text
//! minimize    (1/2) x^T P x + q^T x + d
//! subject to  l <= A x <= u
//! ```
//!
//! with P stored as its upper triangle in CSC form.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};
use crate::linalg::sparse::{self, SparseCsc};
use crate::mapper::{AffineMap, ParameterKind};
use crate::value::{ArrayView, Shape};

/// Magnitude at which a bound is treated as infinite.
pub const INFINITY_BOUND: f64 = 1e30;

/// Map bounds at or beyond [`INFINITY_BOUND`] to the matching infinity.
pub fn normalize_bound(v: f64) -> f64 {
    if v >= INFINITY_BOUND {
        f64::INFINITY
    } else if v <= -INFINITY_BOUND {
        f64::NEG_INFINITY
    } else {
        v
    }
}

/// Canonical array addressed by an affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalArray {
    /// Values of the upper-triangular cost matrix, in pattern order.
    P,
    /// Linear cost vector.
    Q,
    /// Values of the constraint matrix, in pattern order.
    A,
    /// Lower bounds.
    L,
    /// Upper bounds.
    U,
    /// Constant objective term (a single slot).
    Offset,
}

impl CanonicalArray {
    pub const ALL: [CanonicalArray; 6] = [
        CanonicalArray::P,
        CanonicalArray::Q,
        CanonicalArray::A,
        CanonicalArray::L,
        CanonicalArray::U,
        CanonicalArray::Offset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CanonicalArray::P => "P",
            CanonicalArray::Q => "q",
            CanonicalArray::A => "A",
            CanonicalArray::L => "l",
            CanonicalArray::U => "u",
            CanonicalArray::Offset => "d",
        }
    }
}

/// Problem dimensions fixed at generation time.
///
/// Horizon, state and input dimensions of the MPC example; all zero for
/// templates that are not MPC problems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDims {
    pub horizon: usize,
    pub states: usize,
    pub inputs: usize,
}

/// Fixed CSC sparsity pattern (no values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CscPattern {
    pub nrows: usize,
    pub ncols: usize,
    pub colptr: Vec<usize>,
    pub rowval: Vec<usize>,
}

impl CscPattern {
    /// Pattern with no entries.
    pub fn empty(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            colptr: vec![0; ncols + 1],
            rowval: Vec::new(),
        }
    }

    /// Build a pattern from `(row, col)` pairs; duplicates are merged.
    pub fn from_entries(nrows: usize, ncols: usize, entries: &[(usize, usize)]) -> Self {
        let mut sorted: Vec<(usize, usize)> = entries.iter().map(|&(r, c)| (c, r)).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut colptr = vec![0usize; ncols + 1];
        for &(c, _) in &sorted {
            colptr[c + 1] += 1;
        }
        for j in 0..ncols {
            colptr[j + 1] += colptr[j];
        }
        let rowval = sorted.into_iter().map(|(_, r)| r).collect();

        Self {
            nrows,
            ncols,
            colptr,
            rowval,
        }
    }

    /// Pattern of an existing sparse matrix.
    pub fn of(mat: &SparseCsc) -> Self {
        Self {
            nrows: mat.rows(),
            ncols: mat.cols(),
            colptr: mat.indptr().raw_storage().to_vec(),
            rowval: mat.indices().to_vec(),
        }
    }

    pub fn nnz(&self) -> usize {
        self.rowval.len()
    }

    /// Position of `(row, col)` in the value array, if it is in the pattern.
    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        if col >= self.ncols {
            return None;
        }
        let start = self.colptr[col];
        let end = self.colptr[col + 1];
        self.rowval[start..end]
            .binary_search(&row)
            .ok()
            .map(|k| start + k)
    }

    /// Iterate `(row, col)` in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.ncols).flat_map(move |col| {
            self.rowval[self.colptr[col]..self.colptr[col + 1]]
                .iter()
                .map(move |&row| (row, col))
        })
    }

    pub fn is_upper_triangular(&self) -> bool {
        self.iter().all(|(row, col)| row <= col)
    }

    /// Check pointer monotonicity, row ranges and strictly increasing rows.
    pub fn validate(&self, name: &str) -> EmbedResult<()> {
        if self.colptr.len() != self.ncols + 1 {
            return Err(invalid(format!(
                "{}: colptr has length {}, expected {}",
                name,
                self.colptr.len(),
                self.ncols + 1
            )));
        }
        if self.colptr[0] != 0 || self.colptr[self.ncols] != self.rowval.len() {
            return Err(invalid(format!("{}: colptr does not span rowval", name)));
        }
        for col in 0..self.ncols {
            let (start, end) = (self.colptr[col], self.colptr[col + 1]);
            if start > end {
                return Err(invalid(format!("{}: colptr decreases at column {}", name, col)));
            }
            let rows = &self.rowval[start..end];
            if rows.iter().any(|&r| r >= self.nrows) {
                return Err(invalid(format!("{}: row index out of range in column {}", name, col)));
            }
            if rows.windows(2).any(|w| w[0] >= w[1]) {
                return Err(invalid(format!(
                    "{}: rows of column {} are not strictly increasing",
                    name, col
                )));
            }
        }
        Ok(())
    }

    /// Attach values, producing a solver-native CSC matrix.
    pub fn with_values(&self, values: Vec<f64>) -> EmbedResult<SparseCsc> {
        sparse::try_csc(self.nrows, self.ncols, self.colptr.clone(), self.rowval.clone(), values)
            .map_err(|e| invalid(e.to_string()))
    }
}

/// Declared parameter: shape, structural kind, default value and maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Shape,
    pub kind: ParameterKind,
    /// Default value, full column-major matrix of `shape`.
    pub value: Vec<f64>,
    pub maps: Vec<AffineMap>,
}

/// User-facing variable: one canonical primal index per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    pub shape: Shape,
    pub indices: Vec<usize>,
}

/// Named constraint block: one canonical row per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub name: String,
    pub shape: Shape,
    pub rows: Vec<usize>,
}

/// Serializable output of the canonicalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTemplate {
    pub name: String,
    pub dims: ProblemDims,
    pub num_vars: usize,
    pub num_constraints: usize,
    pub p: CscPattern,
    pub p_values: Vec<f64>,
    pub q: Vec<f64>,
    pub a: CscPattern,
    pub a_values: Vec<f64>,
    #[serde(with = "bounds")]
    pub l: Vec<f64>,
    #[serde(with = "bounds")]
    pub u: Vec<f64>,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

impl CanonicalTemplate {
    /// Template for a fixed QP with a single variable `x` and a single
    /// constraint block `c`, no parameters.
    ///
    /// Used for reference solves of explicit data.
    pub fn from_qp(
        p: &SparseCsc,
        q: &[f64],
        a: &SparseCsc,
        l: &[f64],
        u: &[f64],
    ) -> EmbedResult<Self> {
        let n = q.len();
        let m = l.len();
        if p.rows() != n || p.cols() != n {
            return Err(invalid(format!(
                "P has shape {}x{}, expected {}x{}",
                p.rows(),
                p.cols(),
                n,
                n
            )));
        }
        if a.rows() != m || a.cols() != n {
            return Err(invalid(format!(
                "A has shape {}x{}, expected {}x{}",
                a.rows(),
                a.cols(),
                m,
                n
            )));
        }
        let p_upper = sparse::upper_triangle(p);
        let template = Self {
            name: "qp".to_string(),
            dims: ProblemDims::default(),
            num_vars: n,
            num_constraints: m,
            p: CscPattern::of(&p_upper),
            p_values: p_upper.data().to_vec(),
            q: q.to_vec(),
            a: CscPattern::of(a),
            a_values: a.data().to_vec(),
            l: l.iter().copied().map(normalize_bound).collect(),
            u: u.iter().copied().map(normalize_bound).collect(),
            offset: 0.0,
            parameters: Vec::new(),
            variables: vec![VariableSpec {
                name: "x".to_string(),
                shape: Shape::vector(n),
                indices: (0..n).collect(),
            }],
            constraints: vec![ConstraintSpec {
                name: "c".to_string(),
                shape: Shape::vector(m),
                rows: (0..m).collect(),
            }],
        };
        template.validate()?;
        Ok(template)
    }

    /// Length of the value array a map may address.
    pub fn target_len(&self, target: CanonicalArray) -> usize {
        match target {
            CanonicalArray::P => self.p.nnz(),
            CanonicalArray::Q => self.num_vars,
            CanonicalArray::A => self.a.nnz(),
            CanonicalArray::L | CanonicalArray::U => self.num_constraints,
            CanonicalArray::Offset => 1,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Validate every pattern, index and map of the template.
    pub fn validate(&self) -> EmbedResult<()> {
        let n = self.num_vars;
        let m = self.num_constraints;

        if self.p.nrows != n || self.p.ncols != n {
            return Err(invalid(format!("P pattern must be {}x{}", n, n)));
        }
        if self.a.nrows != m || self.a.ncols != n {
            return Err(invalid(format!("A pattern must be {}x{}", m, n)));
        }
        self.p.validate("P")?;
        self.a.validate("A")?;
        if !self.p.is_upper_triangular() {
            return Err(invalid("P pattern must be upper triangular".to_string()));
        }

        check_len("P values", self.p_values.len(), self.p.nnz())?;
        check_len("A values", self.a_values.len(), self.a.nnz())?;
        check_len("q", self.q.len(), n)?;
        check_len("l", self.l.len(), m)?;
        check_len("u", self.u.len(), m)?;

        let finite = self
            .p_values
            .iter()
            .chain(&self.a_values)
            .chain(&self.q)
            .all(|v| v.is_finite());
        if !finite || !self.offset.is_finite() {
            return Err(invalid("P, A, q and d must be finite".to_string()));
        }
        if self.l.iter().chain(&self.u).any(|v| v.is_nan()) {
            return Err(invalid("bounds must not be NaN".to_string()));
        }
        // Such a bound would come back infinite from JSON.
        if let Some(v) = self
            .l
            .iter()
            .chain(&self.u)
            .find(|v| v.is_finite() && v.abs() >= INFINITY_BOUND)
        {
            return Err(invalid(format!(
                "finite bound {:e} is at or beyond {:e}; use an infinite bound",
                v, INFINITY_BOUND
            )));
        }

        self.validate_parameters()?;

        let mut seen = HashMap::new();
        for var in &self.variables {
            if seen.insert(var.name.as_str(), ()).is_some() {
                return Err(invalid(format!("duplicate variable '{}'", var.name)));
            }
            check_len(&var.name, var.indices.len(), var.shape.numel())?;
            if let Some(&bad) = var.indices.iter().find(|&&i| i >= n) {
                return Err(invalid(format!(
                    "variable '{}' maps to index {} (num_vars = {})",
                    var.name, bad, n
                )));
            }
        }

        seen.clear();
        for con in &self.constraints {
            if seen.insert(con.name.as_str(), ()).is_some() {
                return Err(invalid(format!("duplicate constraint '{}'", con.name)));
            }
            check_len(&con.name, con.rows.len(), con.shape.numel())?;
            if let Some(&bad) = con.rows.iter().find(|&&r| r >= m) {
                return Err(invalid(format!(
                    "constraint '{}' maps to row {} (num_constraints = {})",
                    con.name, bad, m
                )));
            }
        }

        Ok(())
    }

    fn validate_parameters(&self) -> EmbedResult<()> {
        // (array, position) -> owning parameter
        let mut owner: HashMap<(CanonicalArray, usize), usize> = HashMap::new();

        for (idx, param) in self.parameters.iter().enumerate() {
            if self.parameters[..idx].iter().any(|p| p.name == param.name) {
                return Err(invalid(format!("duplicate parameter '{}'", param.name)));
            }
            if param.shape.numel() == 0 {
                return Err(invalid(format!("parameter '{}' is empty", param.name)));
            }
            param
                .kind
                .validate_declaration(&param.name, param.shape)
                .map_err(|e| invalid(e.to_string()))?;
            param
                .kind
                .check(&param.name, param.shape, ArrayView::new(param.shape, &param.value))
                .map_err(|e| invalid(format!("default value: {}", e)))?;

            let buffer_len = param.kind.buffer_len(param.shape);
            for map in &param.maps {
                map.validate(&param.name, &param.kind, buffer_len, self.target_len(map.target()))
                    .map_err(|e| invalid(e.to_string()))?;

                // Positions may repeat only inside one sparse map, where
                // contributions accumulate.
                let mut local: Vec<usize> = map.positions().collect();
                local.sort_unstable();
                local.dedup();
                for pos in local {
                    if let Some(&other) = owner.get(&(map.target(), pos)) {
                        return Err(invalid(format!(
                            "{}[{}] is written by both '{}' and '{}'",
                            map.target().name(),
                            pos,
                            self.parameters[other].name,
                            param.name
                        )));
                    }
                    owner.insert((map.target(), pos), idx);
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> EmbedResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a template.
    pub fn from_json(json: &str) -> EmbedResult<Self> {
        let template: Self = serde_json::from_str(json)?;
        template.validate()?;
        Ok(template)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> EmbedResult<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> EmbedResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let template: Self = serde_json::from_reader(reader)?;
        template.validate()?;
        Ok(template)
    }
}

fn invalid(msg: String) -> EmbedError {
    EmbedError::InvalidTemplate(msg)
}

fn check_len(name: &str, actual: usize, expected: usize) -> EmbedResult<()> {
    if actual != expected {
        return Err(invalid(format!(
            "{} has length {}, expected {}",
            name, actual, expected
        )));
    }
    Ok(())
}

/// Bound vectors on the wire: infinities become ±1e30 and anything at or
/// beyond that magnitude is read back as infinite.
///
/// The mapping is lossless only for finite bounds below 1e30 in magnitude;
/// [`CanonicalTemplate::validate`] rejects larger finite bounds.
mod bounds {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{normalize_bound, INFINITY_BOUND};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|&v| v.clamp(-INFINITY_BOUND, INFINITY_BOUND)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let raw = Vec::<f64>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(normalize_bound).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::SparseEntry;

    fn box_qp() -> CanonicalTemplate {
        // min x0^2 + x1^2 - x0  s.t. 0 <= x0 + x1 <= inf, -1 <= x1 <= 1
        let p = sparse::from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
        let a = sparse::from_triplets(2, 2, vec![(0, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0)]);
        CanonicalTemplate::from_qp(&p, &[-1.0, 0.0], &a, &[0.0, -1.0], &[f64::INFINITY, 1.0])
            .unwrap()
    }

    #[test]
    fn test_pattern_from_entries() {
        let pat = CscPattern::from_entries(3, 3, &[(2, 1), (0, 0), (1, 1), (2, 1)]);
        assert_eq!(pat.colptr, vec![0, 1, 3, 3]);
        assert_eq!(pat.rowval, vec![0, 1, 2]);
        assert_eq!(pat.position(2, 1), Some(2));
        assert_eq!(pat.position(0, 2), None);
        assert!(pat.validate("pat").is_ok());
        assert!(!pat.is_upper_triangular());
    }

    #[test]
    fn test_pattern_rejects_unsorted_rows() {
        let pat = CscPattern {
            nrows: 3,
            ncols: 1,
            colptr: vec![0, 2],
            rowval: vec![2, 1],
        };
        assert!(matches!(pat.validate("bad"), Err(EmbedError::InvalidTemplate(_))));
    }

    #[test]
    fn test_json_round_trip_keeps_infinite_bounds() {
        let template = box_qp();
        let json = template.to_json().unwrap();
        assert!(json.contains("1e30"));
        let back = CanonicalTemplate::from_json(&json).unwrap();
        assert_eq!(back, template);
        assert!(back.u[0].is_infinite());
    }

    #[test]
    fn test_huge_finite_bounds() {
        // OSQP-style 1e30 passed to from_qp means infinity.
        let p = sparse::identity(1);
        let a = sparse::identity(1);
        let t = CanonicalTemplate::from_qp(&p, &[0.0], &a, &[-1e30], &[2e30]).unwrap();
        assert_eq!(t.l[0], f64::NEG_INFINITY);
        assert_eq!(t.u[0], f64::INFINITY);

        // Below the cutoff survives JSON unchanged.
        let t = CanonicalTemplate::from_qp(&p, &[0.0], &a, &[-1e29], &[1e29]).unwrap();
        let back = CanonicalTemplate::from_json(&t.to_json().unwrap()).unwrap();
        assert_eq!(back.u[0], 1e29);

        // A hand-built finite 1e31 would not round trip, so it is rejected.
        let mut bad = box_qp();
        bad.u[1] = 1e31;
        let err = bad.validate().unwrap_err();
        assert!(matches!(err, EmbedError::InvalidTemplate(_)));
        assert!(err.to_string().contains("infinite bound"));
    }

    #[test]
    fn test_rejects_lower_triangular_p() {
        let mut template = box_qp();
        template.p = CscPattern::from_entries(2, 2, &[(0, 0), (1, 0), (1, 1)]);
        template.p_values = vec![2.0, 0.5, 2.0];
        assert!(matches!(template.validate(), Err(EmbedError::InvalidTemplate(_))));
    }

    #[test]
    fn test_rejects_shared_ownership() {
        let mut template = box_qp();
        for name in ["a", "b"] {
            template.parameters.push(ParameterSpec {
                name: name.to_string(),
                shape: Shape::scalar(),
                kind: ParameterKind::Dense,
                value: vec![1.0],
                maps: vec![AffineMap::Sparse {
                    target: CanonicalArray::Q,
                    entries: vec![SparseEntry {
                        element: 0,
                        position: 1,
                        coeff: 1.0,
                        offset: 0.0,
                    }],
                }],
            });
        }
        let err = template.validate().unwrap_err();
        assert!(err.to_string().contains("written by both"));
    }

    #[test]
    fn test_rejects_variable_index_out_of_range() {
        let mut template = box_qp();
        template.variables[0].indices[1] = 7;
        assert!(template.validate().is_err());
    }
}
