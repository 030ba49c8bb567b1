use crate::backend::MatmulBackend;
use crate::error::{Result, TensorError};
use crate::shape::Shape;

/// A dense row-major matrix of `u32` elements.
///
/// Arithmetic on matrix elements wraps on overflow, so products computed by
/// different backends can be compared exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    data: Vec<u32>,
    shape: Shape,
}

impl Matrix {
    /// Create a new matrix from row-major data and a shape.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<u32>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        Matrix { data, shape }
    }

    /// Fallible counterpart of [`Matrix::new`].
    pub fn try_new(data: Vec<u32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::LengthMismatch {
                len: data.len(),
                dims: shape.dims().to_vec(),
            });
        }
        Ok(Matrix { data, shape })
    }

    /// Create a zero-filled matrix.
    pub fn zeros(shape: Shape) -> Self {
        Matrix {
            data: vec![0; shape.numel()],
            shape,
        }
    }

    /// Build a matrix by evaluating `f(row, col)` for every element.
    pub fn from_fn(shape: Shape, mut f: impl FnMut(usize, usize) -> u32) -> Self {
        let mut data = Vec::with_capacity(shape.numel());
        for i in 0..shape.rows() {
            for j in 0..shape.cols() {
                data.push(f(i, j));
            }
        }
        Matrix { data, shape }
    }

    /// `factor * I` of size `n x n`.
    pub fn scaled_identity(n: usize, factor: u32) -> Self {
        Matrix::from_fn(Shape::square(n), |i, j| if i == j { factor } else { 0 })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    pub fn get(&self, row: usize, col: usize) -> u32 {
        self.data[self.shape.index(row, col)]
    }

    /// Row-major element data.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    /// Reset every element to zero, keeping the shape.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Return the transpose as a new matrix.
    pub fn transpose(&self) -> Matrix {
        let shape = self.shape.transposed();
        Matrix::from_fn(shape, |i, j| self.get(j, i))
    }

    /// Multiply every element by `s` (wrapping).
    pub fn scale(&self, s: u32) -> Matrix {
        Matrix {
            data: self.data.iter().map(|x| x.wrapping_mul(s)).collect(),
            shape: self.shape,
        }
    }

    /// Position and values of the first element that differs from `other`.
    ///
    /// Both matrices are expected to have the same shape.
    pub fn first_mismatch(&self, other: &Matrix) -> Option<(usize, usize, u32, u32)> {
        self.data
            .iter()
            .zip(other.data.iter())
            .position(|(x, y)| x != y)
            .map(|idx| {
                let (i, j) = (idx / self.cols(), idx % self.cols());
                (i, j, self.data[idx], other.data[idx])
            })
    }

    /// Matrix multiplication `self @ other` using the given backend.
    pub fn matmul(&self, other: &Matrix, backend: &dyn MatmulBackend) -> Result<Matrix> {
        let out = self.shape.matmul_shape(&other.shape)?;
        let data = backend.matmul(&self.data, &other.data, out.rows(), self.cols(), out.cols())?;
        Matrix::try_new(data, out)
    }
}
