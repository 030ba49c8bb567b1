use tsm_tensor::{MatmulBackend, TensorError};

use crate::config::{EngineConfig, ELEMENT_SIZE};
use crate::error::{EngineError, Result};
use crate::offload::Offload;

/// [`MatmulBackend`] that routes multiplies through the tile pipeline.
///
/// Only `[m, k] @ [k, m]` products are accepted, since C stripes are square
/// tiles of A rows against B columns.
#[derive(Debug)]
pub struct TiledBackend {
    offload: Offload,
}

impl TiledBackend {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            offload: Offload::new(config)?,
        })
    }

    pub fn offload(&self) -> &Offload {
        &self.offload
    }

    /// Largest stripe height that divides `height` and keeps both A and C
    /// stripes within half of the planner budget.
    pub fn stripe_height_for(&self, width: usize, height: usize) -> Result<usize> {
        let config = self.offload.pipeline().config();
        let half_budget = config.stripe_budget / 2;
        let fits = |sh: usize, len: usize| {
            sh.checked_mul(len)
                .and_then(|v| v.checked_mul(ELEMENT_SIZE))
                .is_some_and(|bytes| bytes < half_budget)
        };
        let start = (height / 2).max(1);
        (config.min_stripe_height..=start)
            .rev()
            .find(|&sh| height % sh == 0 && fits(sh, width) && fits(sh, height))
            .ok_or(EngineError::Capacity {
                n: width.max(height),
                budget: config.stripe_budget,
                min_stripe_height: config.min_stripe_height,
            })
    }

    fn run(&self, a: &[u32], b: &[u32], width: usize, height: usize) -> Result<Vec<u32>> {
        let stripe_height = self.stripe_height_for(width, height)?;
        let mut c = vec![0u32; height * height];
        self.offload
            .run_tiled_matmul(a, b, &mut c, width, height, stripe_height)?;
        Ok(c)
    }
}

impl MatmulBackend for TiledBackend {
    fn name(&self) -> &str {
        "tiled"
    }

    fn matmul(
        &self,
        a: &[u32],
        b: &[u32],
        m: usize,
        k: usize,
        n: usize,
    ) -> tsm_tensor::Result<Vec<u32>> {
        tsm_tensor::cpu::check_operands(a, b, m, k, n)?;
        if m != n {
            return Err(TensorError::Other(format!(
                "tiled backend needs a square result, got [{}, {}]",
                m, n
            )));
        }
        self.run(a, b, k, m)
            .map_err(|e| TensorError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsm_tensor::{CpuBackend, Matrix, Shape};

    #[test]
    fn test_matches_cpu_backend() {
        let tiled = TiledBackend::new(EngineConfig::default().with_compute_workers(2)).unwrap();
        let a = Matrix::from_fn(Shape::new(12, 20), |i, j| (i * 20 + j) as u32);
        let b = Matrix::from_fn(Shape::new(20, 12), |i, j| ((i + 3 * j) % 7) as u32);
        let got = a.matmul(&b, &tiled).unwrap();
        let want = a.matmul(&b, &CpuBackend::new()).unwrap();
        assert_eq!(got, want);
        assert_eq!(tiled.name(), "tiled");
    }

    #[test]
    fn test_stripe_height_divides_height() {
        let tiled = TiledBackend::new(EngineConfig::default()).unwrap();
        let sh = tiled.stripe_height_for(24, 12).unwrap();
        assert_eq!(12 % sh, 0);
        assert_eq!(sh, 6);
    }

    #[test]
    fn test_non_square_result_rejected() {
        let tiled = TiledBackend::new(EngineConfig::default()).unwrap();
        assert_eq!(tiled.matmul(&[1; 6], &[1; 6], 2, 3, 2).unwrap(), vec![3; 4]);
        let err = tiled.matmul(&[1; 6], &[1; 3], 2, 3, 1).unwrap_err();
        assert!(matches!(err, TensorError::Other(_)));
    }

    #[test]
    fn test_budget_too_small() {
        let tiled = TiledBackend::new(EngineConfig::default().with_scratchpad_bytes(48)).unwrap();
        assert!(matches!(
            tiled.stripe_height_for(64, 64),
            Err(EngineError::Capacity { .. })
        ));
    }
}
