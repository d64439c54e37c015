//! Shapes and dense column-major value buffers exchanged with callers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shape of a parameter or variable (rows × cols, column-major storage).
///
/// Scalars are 1×1 and vectors are n×1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn scalar() -> Self {
        Self { rows: 1, cols: 1 }
    }

    pub const fn vector(len: usize) -> Self {
        Self { rows: len, cols: 1 }
    }

    pub const fn matrix(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of elements.
    pub const fn numel(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Column-major linear index of `(row, col)`.
    pub const fn index(&self, row: usize, col: usize) -> usize {
        col * self.rows + row
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Borrowed column-major view of caller data.
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a> {
    pub shape: Shape,
    pub data: &'a [f64],
}

impl<'a> ArrayView<'a> {
    pub fn new(shape: Shape, data: &'a [f64]) -> Self {
        Self { shape, data }
    }

    pub fn scalar(value: &'a f64) -> Self {
        Self {
            shape: Shape::scalar(),
            data: std::slice::from_ref(value),
        }
    }

    pub fn vector(data: &'a [f64]) -> Self {
        Self {
            shape: Shape::vector(data.len()),
            data,
        }
    }

    /// View of a column-major `rows × cols` buffer.
    ///
    /// The shape is taken at face value; the length is checked where the
    /// view is consumed so that a bad buffer surfaces as `ShapeMismatch`.
    pub fn matrix(rows: usize, cols: usize, data: &'a [f64]) -> Self {
        Self {
            shape: Shape::matrix(rows, cols),
            data,
        }
    }

    /// True when the buffer length agrees with the declared shape.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.shape.numel()
    }

    /// Element `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[self.shape.index(row, col)]
    }
}

/// Owned column-major matrix returned by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub shape: Shape,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.numel()],
        }
    }

    pub fn from_column_major(shape: Shape, data: Vec<f64>) -> Self {
        debug_assert_eq!(shape.numel(), data.len());
        Self { shape, data }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[self.shape.index(row, col)]
    }

    /// Column `col` as a contiguous slice.
    pub fn column(&self, col: usize) -> &[f64] {
        let start = col * self.shape.rows;
        &self.data[start..start + self.shape.rows]
    }

    pub fn view(&self) -> ArrayView<'_> {
        ArrayView::new(self.shape, &self.data)
    }

    /// Largest absolute entry (0 for an empty matrix).
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_major_indexing() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = ArrayView::matrix(2, 3, &data);
        assert!(view.is_consistent());
        assert_eq!(view.get(0, 0), 1.0);
        assert_eq!(view.get(1, 0), 2.0);
        assert_eq!(view.get(0, 2), 5.0);

        let m = Matrix::from_column_major(Shape::matrix(2, 3), data.to_vec());
        assert_eq!(m.column(1), &[3.0, 4.0]);
        assert_eq!(m.max_abs(), 6.0);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::matrix(6, 11).to_string(), "6x11");
        assert_eq!(Shape::scalar().numel(), 1);
        assert!(!ArrayView::matrix(2, 2, &[1.0, 2.0, 3.0]).is_consistent());
    }
}
