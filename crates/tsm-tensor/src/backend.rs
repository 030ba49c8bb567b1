use std::fmt::Debug;

use crate::error::Result;

/// Trait for pluggable matrix-multiply backends (host reference, tiled
/// scratchpad engine, etc.).
///
/// Data is passed in as row-major `u32` slices and returned as an owned
/// vector. Element arithmetic wraps on overflow.
pub trait MatmulBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu", "tiled").
    fn name(&self) -> &str;

    /// Matrix multiplication: C = A @ B.
    ///
    /// - `a`: row-major data of shape [m, k]
    /// - `b`: row-major data of shape [k, n]
    /// - Returns: row-major data of shape [m, n]
    fn matmul(&self, a: &[u32], b: &[u32], m: usize, k: usize, n: usize) -> Result<Vec<u32>>;
}
