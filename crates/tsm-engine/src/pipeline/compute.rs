use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::BLayout;
use crate::error::{EngineError, Result};
use crate::planner::TileGeometry;

/// Compute one `sh x sh` tile of C from settled stripes.
///
/// - `a`: A stripe, `[sh, width]`
/// - `b`: B stripe, `[width, sh]` for row-major B or `[sh, width]` for
///   transposed B
/// - `c`: C stripe, `[sh, height]`; columns `t*sh..(t+1)*sh` are written
///
/// Rows of the tile are split across the current rayon pool.
pub fn multiply_tile(
    a: &[u32],
    b: &[u32],
    c: &mut [u32],
    geometry: &TileGeometry,
    layout: BLayout,
    t: usize,
) {
    let width = geometry.width();
    let sh = geometry.stripe_height();
    let col0 = t * sh;

    c.par_chunks_mut(geometry.height())
        .enumerate()
        .for_each(|(i, c_row)| {
            let a_row = &a[i * width..(i + 1) * width];
            let tile_row = &mut c_row[col0..col0 + sh];
            match layout {
                BLayout::RowMajor => {
                    tile_row.fill(0);
                    for (k, &x) in a_row.iter().enumerate() {
                        let b_row = &b[k * sh..(k + 1) * sh];
                        for (acc, &y) in tile_row.iter_mut().zip(b_row) {
                            *acc = acc.wrapping_add(x.wrapping_mul(y));
                        }
                    }
                }
                BLayout::Transposed => {
                    for (j, out) in tile_row.iter_mut().enumerate() {
                        let b_col = &b[j * width..(j + 1) * width];
                        *out = a_row
                            .iter()
                            .zip(b_col)
                            .fold(0u32, |acc, (&x, &y)| acc.wrapping_add(x.wrapping_mul(y)));
                    }
                }
            }
        });
}

/// The fixed team of compute threads.
#[derive(Debug)]
pub struct ComputeTeam {
    pool: ThreadPool,
    workers: usize,
}

impl ComputeTeam {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tsm-compute-{}", i))
            .build()
            .map_err(|e| EngineError::InvalidConfig(format!("cannot build compute team: {}", e)))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run [`multiply_tile`] on the team.
    pub fn multiply_tile(
        &self,
        a: &[u32],
        b: &[u32],
        c: &mut [u32],
        geometry: &TileGeometry,
        layout: BLayout,
        t: usize,
    ) {
        self.pool
            .install(|| multiply_tile(a, b, c, geometry, layout, t));
    }

    /// Run `f` for every row index in `0..rows` on the team, stopping at the
    /// first error.
    pub fn try_for_each_row<F>(&self, rows: usize, f: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + Sync,
    {
        self.pool
            .install(|| (0..rows).into_par_iter().try_for_each(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_tile() {
        // width 2, height 4, sh 2. A stripe rows: [1, 2], [3, 4].
        // B stripe (columns 2..4 of B) laid out [k][j]: [[5, 6], [7, 8]].
        let g = TileGeometry::from_parts(2, 4, 2).unwrap();
        let a = [1, 2, 3, 4];
        let b = [5, 6, 7, 8];
        let mut c = [0u32; 8];
        multiply_tile(&a, &b, &mut c, &g, BLayout::RowMajor, 1);
        assert_eq!(c, [0, 0, 19, 22, 0, 0, 43, 50]);
    }

    #[test]
    fn test_transposed_tile() {
        // Same product with B stored as [j][k].
        let g = TileGeometry::from_parts(2, 4, 2).unwrap();
        let a = [1, 2, 3, 4];
        let b = [5, 7, 6, 8];
        let mut c = [0u32; 8];
        multiply_tile(&a, &b, &mut c, &g, BLayout::Transposed, 0);
        assert_eq!(c, [19, 22, 0, 0, 43, 50, 0, 0]);
    }

    #[test]
    fn test_tile_overwrites_stale_values() {
        let g = TileGeometry::from_parts(1, 1, 1).unwrap();
        let mut c = [99u32];
        multiply_tile(&[3], &[4], &mut c, &g, BLayout::RowMajor, 0);
        assert_eq!(c, [12]);
    }

    #[test]
    fn test_team_row_errors_propagate() {
        let team = ComputeTeam::new(3).unwrap();
        let seen = std::sync::atomic::AtomicUsize::new(0);
        team.try_for_each_row(10, |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.into_inner(), 10);

        let err = team
            .try_for_each_row(10, |i| match i {
                7 => Err(EngineError::InvalidGeometry("row 7".to_string())),
                _ => Ok(()),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGeometry(_)));
    }

    #[test]
    fn test_team_runs_tile() {
        let team = ComputeTeam::new(2).unwrap();
        assert_eq!(team.workers(), 2);
        let g = TileGeometry::from_parts(2, 2, 1).unwrap();
        let mut c = [0u32; 2];
        team.multiply_tile(&[2, 3], &[10, 100], &mut c, &g, BLayout::RowMajor, 1);
        assert_eq!(c, [0, 320]);
    }
}
