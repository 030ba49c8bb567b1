use tracing::{debug, info};

use crate::error::Result;
use crate::far::FarRegion;
use crate::planner::TileGeometry;
use crate::pool::{acquire_slot, Half, Operand};
use crate::scratchpad::LocalAllocator;
use crate::transfer::{Transfer, TransferEngine};

use super::{FarOperands, Pipeline, RunReport};

impl Pipeline {
    /// Multiply with all three matrices resident in scratchpad.
    ///
    /// A and B are fetched whole with two concurrent transfers, C is
    /// computed as a single stripe and written back in one transfer. Fails
    /// with `OutOfLocalMemory` when the matrices do not fit together.
    pub fn run_resident<E: TransferEngine>(
        &self,
        engine: &E,
        alloc: &dyn LocalAllocator,
        operands: &FarOperands,
        width: usize,
        height: usize,
    ) -> Result<RunReport> {
        let geometry = TileGeometry::from_parts(width, height, height)?;
        operands.check(&geometry)?;

        let a = acquire_slot(alloc, Operand::A, Half::Ping, geometry.a_len())?;
        let b = acquire_slot(alloc, Operand::B, Half::Ping, geometry.b_len())?;
        let mut c = acquire_slot(alloc, Operand::C, Half::Ping, geometry.c_len())?;
        debug!(in_use = alloc.in_use(), capacity = alloc.capacity(), "acquired resident buffers");

        let a_job = engine.issue(Transfer::fetch(
            FarRegion::contiguous(&operands.a, 0, geometry.a_len())?,
            a,
        ));
        let b_job = engine.issue(Transfer::fetch(
            FarRegion::contiguous(&operands.b, 0, geometry.b_len())?,
            b,
        ));
        // Both jobs are waited before either result is inspected.
        let a = a_job.and_then(|job| engine.wait(job));
        let b = b_job.and_then(|job| engine.wait(job));
        let (a, b) = (a?, b?);

        let layout = self.config().b_layout;
        self.team().multiply_tile(&a, &b, &mut c, &geometry, layout, 0);
        drop((a, b));

        let region = FarRegion::contiguous(&operands.c, 0, geometry.c_len())?;
        let job = engine.issue(Transfer::writeback(c, region))?;
        drop(engine.wait(job)?);

        info!(width, height, engine = engine.name(), "resident multiply finished");
        Ok(RunReport {
            geometry,
            tiles: 1,
            a_fetches: 1,
            b_fetches: 1,
            c_writebacks: 1,
        })
    }
}
