use crate::backend::MatmulBackend;
use crate::error::{Result, TensorError};

/// Host-only reference backend.
///
/// A plain triple loop with wrapping arithmetic. Used to validate other
/// backends element for element.
#[derive(Debug, Clone)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks that `a` is [m, k] and `b` is [k, n].
pub fn check_operands(a: &[u32], b: &[u32], m: usize, k: usize, n: usize) -> Result<()> {
    if a.len() != m * k {
        return Err(TensorError::Other(format!(
            "matmul: a.len()={} but expected m*k={}",
            a.len(),
            m * k
        )));
    }
    if b.len() != k * n {
        return Err(TensorError::Other(format!(
            "matmul: b.len()={} but expected k*n={}",
            b.len(),
            k * n
        )));
    }
    Ok(())
}

impl MatmulBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn matmul(&self, a: &[u32], b: &[u32], m: usize, k: usize, n: usize) -> Result<Vec<u32>> {
        check_operands(a, b, m, k, n)?;

        let mut c = vec![0u32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0u32;
                for p in 0..k {
                    sum = sum.wrapping_add(a[i * k + p].wrapping_mul(b[p * n + j]));
                }
                c[i * n + j] = sum;
            }
        }
        Ok(c)
    }
}
