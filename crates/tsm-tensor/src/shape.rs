use crate::error::{Result, TensorError};
use std::fmt;

/// The shape of a row-major 2D matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    rows: usize,
    cols: usize,
}

impl Shape {
    /// Create a new `rows x cols` shape.
    pub fn new(rows: usize, cols: usize) -> Self {
        Shape { rows, cols }
    }

    /// Create a square `n x n` shape.
    pub fn square(n: usize) -> Self {
        Shape { rows: n, cols: n }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.rows * self.cols
    }

    /// Flat index of element `(row, col)`.
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// The shape with rows and columns swapped.
    pub fn transposed(&self) -> Shape {
        Shape {
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Shape of `self @ other`, or an error when the inner dimensions differ.
    pub fn matmul_shape(&self, other: &Shape) -> Result<Shape> {
        if self.cols != other.rows {
            return Err(TensorError::MatmulMismatch {
                m: self.rows,
                k: self.cols,
                k2: other.rows,
                n: other.cols,
            });
        }
        Ok(Shape::new(self.rows, other.cols))
    }

    pub fn dims(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.rows, self.cols)
    }
}
