//! Parameter mapper: named parameter values to canonical QP entries.
//!
//! Every parameter carries a compact value buffer (the full matrix for dense
//! parameters, the diagonal for diagonal ones, the pattern values for sparse
//! ones) and a list of affine maps fixed at generation time. An update
//! validates the caller's value, compresses it into the buffer and replays the
//! maps, touching only the canonical entries the parameter owns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};
use crate::template::{CanonicalArray, CscPattern, ParameterSpec};
use crate::value::{ArrayView, Matrix, Shape};
use crate::workspace::CanonicalQp;

/// Structural kind of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Any value of the declared shape.
    Dense,
    /// Square matrix whose off-diagonal entries must be zero.
    Diagonal,
    /// Matrix whose nonzeros must lie in a fixed pattern.
    Sparse { pattern: CscPattern },
}

impl ParameterKind {
    /// Length of the compact value buffer.
    pub fn buffer_len(&self, shape: Shape) -> usize {
        match self {
            ParameterKind::Dense => shape.numel(),
            ParameterKind::Diagonal => shape.rows,
            ParameterKind::Sparse { pattern } => pattern.nnz(),
        }
    }

    pub(crate) fn validate_declaration(&self, name: &str, shape: Shape) -> EmbedResult<()> {
        match self {
            ParameterKind::Dense => Ok(()),
            ParameterKind::Diagonal if shape.is_square() => Ok(()),
            ParameterKind::Diagonal => Err(EmbedError::InvalidTemplate(format!(
                "diagonal parameter '{}' must be square, declared {}",
                name, shape
            ))),
            ParameterKind::Sparse { pattern } => {
                if pattern.nrows != shape.rows || pattern.ncols != shape.cols {
                    return Err(EmbedError::InvalidTemplate(format!(
                        "pattern of '{}' does not match its shape {}",
                        name, shape
                    )));
                }
                pattern.validate(name)
            }
        }
    }

    /// Validate a full column-major value without writing anything.
    ///
    /// Order of checks: shape, finiteness, structure.
    pub fn check(&self, name: &str, shape: Shape, value: ArrayView<'_>) -> EmbedResult<()> {
        if value.shape != shape || !value.is_consistent() {
            let actual = if value.is_consistent() {
                value.shape
            } else {
                Shape::vector(value.data.len())
            };
            return Err(EmbedError::ShapeMismatch {
                name: name.to_string(),
                expected: shape,
                actual,
            });
        }
        if let Some(pos) = value.data.iter().position(|v| !v.is_finite()) {
            return Err(EmbedError::InvalidValue {
                name: name.to_string(),
                reason: format!("element {} is {}", pos, value.data[pos]),
            });
        }
        match self {
            ParameterKind::Dense => Ok(()),
            ParameterKind::Diagonal => {
                for col in 0..shape.cols {
                    for row in 0..shape.rows {
                        if row != col && value.get(row, col) != 0.0 {
                            return Err(EmbedError::StructuralMismatch(format!(
                                "'{}' is diagonal but entry ({}, {}) is {}",
                                name,
                                row,
                                col,
                                value.get(row, col)
                            )));
                        }
                    }
                }
                Ok(())
            }
            ParameterKind::Sparse { pattern } => {
                for col in 0..shape.cols {
                    let rows = &pattern.rowval[pattern.colptr[col]..pattern.colptr[col + 1]];
                    let mut next = 0;
                    for row in 0..shape.rows {
                        if next < rows.len() && rows[next] == row {
                            next += 1;
                            continue;
                        }
                        if value.get(row, col) != 0.0 {
                            return Err(EmbedError::StructuralMismatch(format!(
                                "'{}' has a nonzero at ({}, {}) outside its sparsity pattern",
                                name, row, col
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Copy a checked value into the compact buffer.
    fn compress(&self, value: ArrayView<'_>, buffer: &mut [f64]) {
        match self {
            ParameterKind::Dense => buffer.copy_from_slice(value.data),
            ParameterKind::Diagonal => {
                for (i, slot) in buffer.iter_mut().enumerate() {
                    *slot = value.get(i, i);
                }
            }
            ParameterKind::Sparse { pattern } => {
                for (slot, (row, col)) in buffer.iter_mut().zip(pattern.iter()) {
                    *slot = value.get(row, col);
                }
            }
        }
    }

    /// Expand a compact buffer back into a full matrix.
    fn expand(&self, shape: Shape, buffer: &[f64]) -> Matrix {
        let mut out = Matrix::zeros(shape);
        match self {
            ParameterKind::Dense => out.data.copy_from_slice(buffer),
            ParameterKind::Diagonal => {
                for (i, &v) in buffer.iter().enumerate() {
                    out.data[shape.index(i, i)] = v;
                }
            }
            ParameterKind::Sparse { pattern } => {
                for (&v, (row, col)) in buffer.iter().zip(pattern.iter()) {
                    out.data[shape.index(row, col)] = v;
                }
            }
        }
        out
    }
}

/// One term of a general sparse map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparseEntry {
    /// Index into the parameter's value buffer.
    pub element: usize,
    /// Index into the target canonical array.
    pub position: usize,
    pub coeff: f64,
    #[serde(default)]
    pub offset: f64,
}

/// Affine relationship between a parameter buffer and canonical entries.
///
/// `DenseBlock` and `Diagonal` write buffer element `k` to
/// `positions[b * len + k]` for every replica block `b`, so a dynamics matrix
/// repeated over a horizon is one map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AffineMap {
    DenseBlock {
        target: CanonicalArray,
        coeff: f64,
        #[serde(default)]
        offset: f64,
        positions: Vec<usize>,
    },
    Diagonal {
        target: CanonicalArray,
        coeff: f64,
        #[serde(default)]
        offset: f64,
        positions: Vec<usize>,
    },
    IdentityScaled {
        target: CanonicalArray,
        coeff: f64,
        #[serde(default)]
        offset: f64,
        positions: Vec<usize>,
    },
    Sparse {
        target: CanonicalArray,
        entries: Vec<SparseEntry>,
    },
}

impl AffineMap {
    pub fn target(&self) -> CanonicalArray {
        match self {
            AffineMap::DenseBlock { target, .. }
            | AffineMap::Diagonal { target, .. }
            | AffineMap::IdentityScaled { target, .. }
            | AffineMap::Sparse { target, .. } => *target,
        }
    }

    /// Canonical positions written by this map (may repeat for `Sparse`).
    pub fn positions(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            AffineMap::DenseBlock { positions, .. }
            | AffineMap::Diagonal { positions, .. }
            | AffineMap::IdentityScaled { positions, .. } => Box::new(positions.iter().copied()),
            AffineMap::Sparse { entries, .. } => Box::new(entries.iter().map(|e| e.position)),
        }
    }

    /// Number of canonical writes per update.
    pub fn touched(&self) -> usize {
        match self {
            AffineMap::DenseBlock { positions, .. }
            | AffineMap::Diagonal { positions, .. }
            | AffineMap::IdentityScaled { positions, .. } => positions.len(),
            AffineMap::Sparse { entries, .. } => entries.len(),
        }
    }

    pub(crate) fn validate(
        &self,
        name: &str,
        kind: &ParameterKind,
        buffer_len: usize,
        target_len: usize,
    ) -> EmbedResult<()> {
        let fail = |msg: String| Err(EmbedError::InvalidTemplate(format!("'{}': {}", name, msg)));

        match self {
            AffineMap::DenseBlock { positions, .. } | AffineMap::Diagonal { positions, .. } => {
                if matches!(self, AffineMap::Diagonal { .. }) && *kind != ParameterKind::Diagonal {
                    return fail("diagonal map on a non-diagonal parameter".to_string());
                }
                if buffer_len == 0 || positions.len() % buffer_len != 0 {
                    return fail(format!(
                        "{} positions is not a multiple of the buffer length {}",
                        positions.len(),
                        buffer_len
                    ));
                }
                let mut sorted = positions.clone();
                sorted.sort_unstable();
                if sorted.windows(2).any(|w| w[0] == w[1]) {
                    return fail("block map writes a position twice".to_string());
                }
            }
            AffineMap::IdentityScaled { positions, .. } => {
                if buffer_len != 1 {
                    return fail("identity-scaled map needs a scalar parameter".to_string());
                }
                let mut sorted = positions.clone();
                sorted.sort_unstable();
                if sorted.windows(2).any(|w| w[0] == w[1]) {
                    return fail("identity-scaled map writes a position twice".to_string());
                }
            }
            AffineMap::Sparse { entries, .. } => {
                if let Some(e) = entries.iter().find(|e| e.element >= buffer_len) {
                    return fail(format!("element {} out of range", e.element));
                }
            }
        }

        if let Some(pos) = self.positions().find(|&p| p >= target_len) {
            return fail(format!(
                "position {} out of range for {} (length {})",
                pos,
                self.target().name(),
                target_len
            ));
        }
        Ok(())
    }

    /// Write this map's contribution for `buffer` into `dst`.
    pub(crate) fn apply(&self, buffer: &[f64], dst: &mut [f64]) {
        match self {
            AffineMap::DenseBlock {
                coeff,
                offset,
                positions,
                ..
            }
            | AffineMap::Diagonal {
                coeff,
                offset,
                positions,
                ..
            } => {
                for block in positions.chunks_exact(buffer.len()) {
                    for (&pos, &v) in block.iter().zip(buffer) {
                        dst[pos] = offset + coeff * v;
                    }
                }
            }
            AffineMap::IdentityScaled {
                coeff,
                offset,
                positions,
                ..
            } => {
                let v = offset + coeff * buffer[0];
                for &pos in positions {
                    dst[pos] = v;
                }
            }
            AffineMap::Sparse { entries, .. } => {
                for e in entries {
                    dst[e.position] = 0.0;
                }
                for e in entries {
                    dst[e.position] += e.offset + e.coeff * buffer[e.element];
                }
            }
        }
    }
}

/// Classes of canonical data touched since the solver last consumed them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtySet {
    /// P or A values (requires rescaling and refactorization).
    pub matrices: bool,
    /// q or d.
    pub vectors: bool,
    /// l or u.
    pub bounds: bool,
}

impl DirtySet {
    pub fn all() -> Self {
        Self {
            matrices: true,
            vectors: true,
            bounds: true,
        }
    }

    pub fn mark(&mut self, target: CanonicalArray) {
        match target {
            CanonicalArray::P | CanonicalArray::A => self.matrices = true,
            CanonicalArray::Q | CanonicalArray::Offset => self.vectors = true,
            CanonicalArray::L | CanonicalArray::U => self.bounds = true,
        }
    }

    pub fn merge(&mut self, other: DirtySet) {
        self.matrices |= other.matrices;
        self.vectors |= other.vectors;
        self.bounds |= other.bounds;
    }

    pub fn is_empty(&self) -> bool {
        !(self.matrices || self.vectors || self.bounds)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Runtime state of one parameter.
#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    shape: Shape,
    kind: ParameterKind,
    buffer: Vec<f64>,
    maps: Vec<AffineMap>,
    touches: DirtySet,
}

/// Owns parameter buffers and replays their maps onto the canonical data.
#[derive(Debug, Clone)]
pub struct ParameterMapper {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
    pending: DirtySet,
}

impl ParameterMapper {
    /// Build from validated specs and write every default value.
    pub(crate) fn new(specs: &[ParameterSpec], data: &mut CanonicalQp) -> Self {
        let params: Vec<Parameter> = specs
            .iter()
            .map(|spec| {
                let mut touches = DirtySet::default();
                for map in &spec.maps {
                    touches.mark(map.target());
                }
                let mut buffer = vec![0.0; spec.kind.buffer_len(spec.shape)];
                spec.kind
                    .compress(ArrayView::new(spec.shape, &spec.value), &mut buffer);
                Parameter {
                    name: spec.name.clone(),
                    shape: spec.shape,
                    kind: spec.kind.clone(),
                    buffer,
                    maps: spec.maps.clone(),
                    touches,
                }
            })
            .collect();
        let index = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();

        let mut mapper = Self {
            params,
            index,
            pending: DirtySet::default(),
        };
        for i in 0..mapper.params.len() {
            mapper.write(i, data);
        }
        mapper.pending = DirtySet::all();
        mapper
    }

    fn lookup(&self, name: &str) -> EmbedResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EmbedError::UnknownParameter(name.to_string()))
    }

    /// Validate a value for `name` without writing.
    pub fn check(&self, name: &str, value: ArrayView<'_>) -> EmbedResult<()> {
        let param = &self.params[self.lookup(name)?];
        param.kind.check(&param.name, param.shape, value)
    }

    /// Validate and write one parameter. Nothing is written on error.
    pub(crate) fn update(
        &mut self,
        name: &str,
        value: ArrayView<'_>,
        data: &mut CanonicalQp,
    ) -> EmbedResult<()> {
        let idx = self.lookup(name)?;
        {
            let param = &self.params[idx];
            param.kind.check(&param.name, param.shape, value)?;
        }
        self.store(idx, value, data);
        Ok(())
    }

    /// Validate every entry first, then write them all.
    pub(crate) fn update_many(
        &mut self,
        values: &[(&str, ArrayView<'_>)],
        data: &mut CanonicalQp,
    ) -> EmbedResult<()> {
        for (name, value) in values {
            self.check(name, *value)?;
        }
        for (name, value) in values {
            let idx = self.lookup(name)?;
            self.store(idx, *value, data);
        }
        Ok(())
    }

    fn store(&mut self, idx: usize, value: ArrayView<'_>, data: &mut CanonicalQp) {
        let param = &mut self.params[idx];
        param.kind.compress(value, &mut param.buffer);
        self.write(idx, data);
    }

    fn write(&mut self, idx: usize, data: &mut CanonicalQp) {
        let param = &self.params[idx];
        for map in &param.maps {
            map.apply(&param.buffer, data.values_mut(map.target()));
        }
        self.pending.merge(param.touches);
    }

    /// Changes written since the last [`ParameterMapper::take_pending`].
    pub fn pending(&self) -> DirtySet {
        self.pending
    }

    pub(crate) fn take_pending(&mut self) -> DirtySet {
        std::mem::take(&mut self.pending)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn shape(&self, name: &str) -> EmbedResult<Shape> {
        Ok(self.params[self.lookup(name)?].shape)
    }

    pub fn kind(&self, name: &str) -> EmbedResult<&ParameterKind> {
        Ok(&self.params[self.lookup(name)?].kind)
    }

    /// Current value as a full matrix.
    pub fn value(&self, name: &str) -> EmbedResult<Matrix> {
        let param = &self.params[self.lookup(name)?];
        Ok(param.kind.expand(param.shape, &param.buffer))
    }

    /// Canonical entries rewritten by one update of `name`.
    pub fn touched(&self, name: &str) -> EmbedResult<usize> {
        Ok(self.params[self.lookup(name)?]
            .maps
            .iter()
            .map(AffineMap::touched)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse;

    fn qp_data() -> CanonicalQp {
        let p = sparse::from_triplets(3, 3, vec![(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0)]);
        let a = sparse::from_triplets(2, 3, vec![(0, 0, 1.0), (1, 1, 1.0), (1, 2, 1.0)]);
        CanonicalQp::new(p, vec![0.0; 3], a, vec![-1.0; 2], vec![1.0; 2], 0.0)
    }

    fn diag_spec() -> ParameterSpec {
        ParameterSpec {
            name: "W".to_string(),
            shape: Shape::matrix(3, 3),
            kind: ParameterKind::Diagonal,
            value: vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0],
            maps: vec![AffineMap::Diagonal {
                target: CanonicalArray::P,
                coeff: 2.0,
                offset: 0.0,
                positions: vec![0, 1, 2],
            }],
        }
    }

    #[test]
    fn test_diagonal_update_writes_one_entry_per_diagonal() {
        let mut data = qp_data();
        let mut mapper = ParameterMapper::new(&[diag_spec()], &mut data);
        assert_eq!(data.p.data(), &[2.0, 4.0, 6.0]);
        assert_eq!(mapper.touched("W").unwrap(), 3);

        mapper.take_pending();
        let value = [5.0, 0.0, 0.0, 0.0, 6.0, 0.0, 0.0, 0.0, 7.0];
        mapper
            .update("W", ArrayView::matrix(3, 3, &value), &mut data)
            .unwrap();
        assert_eq!(data.p.data(), &[10.0, 12.0, 14.0]);
        assert_eq!(
            mapper.pending(),
            DirtySet {
                matrices: true,
                vectors: false,
                bounds: false
            }
        );
    }

    #[test]
    fn test_diagonal_rejects_off_diagonal_nonzero() {
        let mut data = qp_data();
        let mut mapper = ParameterMapper::new(&[diag_spec()], &mut data);
        let value = [5.0, 0.0, 0.0, 0.1, 6.0, 0.0, 0.0, 0.0, 7.0];
        let err = mapper
            .update("W", ArrayView::matrix(3, 3, &value), &mut data)
            .unwrap_err();
        assert!(matches!(err, EmbedError::StructuralMismatch(_)));
        assert_eq!(data.p.data(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_shape_mismatch_leaves_data_untouched() {
        let mut data = qp_data();
        let mut mapper = ParameterMapper::new(&[diag_spec()], &mut data);
        let err = mapper
            .update("W", ArrayView::matrix(2, 2, &[1.0, 0.0, 0.0, 1.0]), &mut data)
            .unwrap_err();
        match err {
            EmbedError::ShapeMismatch { expected, actual, .. } => {
                assert_eq!(expected, Shape::matrix(3, 3));
                assert_eq!(actual, Shape::matrix(2, 2));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(mapper.value("W").unwrap().get(2, 2), 3.0);
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let mut data = qp_data();
        let mut mapper = ParameterMapper::new(&[diag_spec()], &mut data);
        let value = [f64::NAN, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let err = mapper
            .update("W", ArrayView::matrix(3, 3, &value), &mut data)
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidValue { .. }));
    }

    #[test]
    fn test_dense_block_replicates_and_bounds_dirty() {
        let mut data = qp_data();
        let spec = ParameterSpec {
            name: "bound".to_string(),
            shape: Shape::vector(1),
            kind: ParameterKind::Dense,
            value: vec![0.5],
            maps: vec![AffineMap::DenseBlock {
                target: CanonicalArray::U,
                coeff: 1.0,
                offset: 0.0,
                positions: vec![0, 1],
            }],
        };
        let mut mapper = ParameterMapper::new(&[spec], &mut data);
        assert_eq!(data.u, vec![0.5, 0.5]);
        mapper.take_pending();
        mapper
            .update("bound", ArrayView::vector(&[2.0]), &mut data)
            .unwrap();
        assert_eq!(data.u, vec![2.0, 2.0]);
        assert!(mapper.pending().bounds);
        assert!(!mapper.pending().matrices);
    }

    #[test]
    fn test_sparse_map_accumulates_shared_positions() {
        let mut data = qp_data();
        let spec = ParameterSpec {
            name: "w".to_string(),
            shape: Shape::vector(2),
            kind: ParameterKind::Dense,
            value: vec![1.0, 2.0],
            maps: vec![AffineMap::Sparse {
                target: CanonicalArray::Q,
                entries: vec![
                    SparseEntry { element: 0, position: 1, coeff: 1.0, offset: 0.5 },
                    SparseEntry { element: 1, position: 1, coeff: -3.0, offset: 0.0 },
                ],
            }],
        };
        ParameterMapper::new(&[spec], &mut data);
        assert_eq!(data.q[1], 1.5 - 6.0);
    }

    #[test]
    fn test_sparse_kind_rejects_off_pattern() {
        let kind = ParameterKind::Sparse {
            pattern: CscPattern::from_entries(2, 2, &[(0, 0), (1, 1)]),
        };
        let ok = [1.0, 0.0, 0.0, 2.0];
        let bad = [1.0, 3.0, 0.0, 2.0];
        let shape = Shape::matrix(2, 2);
        assert!(kind.check("S", shape, ArrayView::matrix(2, 2, &ok)).is_ok());
        assert!(matches!(
            kind.check("S", shape, ArrayView::matrix(2, 2, &bad)),
            Err(EmbedError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn test_update_many_is_all_or_nothing() {
        let mut data = qp_data();
        let mut mapper = ParameterMapper::new(&[diag_spec()], &mut data);
        let good = [9.0, 0.0, 0.0, 0.0, 9.0, 0.0, 0.0, 0.0, 9.0];
        let err = mapper.update_many(
            &[
                ("W", ArrayView::matrix(3, 3, &good)),
                ("missing", ArrayView::vector(&[1.0])),
            ],
            &mut data,
        );
        assert!(matches!(err, Err(EmbedError::UnknownParameter(_))));
        assert_eq!(data.p.data(), &[2.0, 4.0, 6.0]);
    }
}
