//! `tsm-tensor` - Row-major integer matrices for tile-streaming-matmul.
//!
//! This crate provides:
//! - A `Matrix` type holding row-major `u32` data
//! - A `MatmulBackend` trait for pluggable multiply implementations
//! - A reference `CpuBackend` (naive host triple loop)
//! - 2D shape utilities

pub mod backend;
pub mod cpu;
pub mod error;
pub mod matrix;
pub mod shape;

// Re-export primary types at the crate root for convenience.
pub use backend::MatmulBackend;
pub use cpu::CpuBackend;
pub use error::{Result, TensorError};
pub use matrix::Matrix;
pub use shape::Shape;
