//! Host-side offload entry points.
//!
//! An [`Offload`] maps host slices into far memory, runs the engine against
//! its own scratchpad and maps C back. C is only copied back when the run
//! succeeded, so a failed run leaves the caller's buffer untouched.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{EngineConfig, ELEMENT_SIZE};
use crate::error::{EngineError, Result};
use crate::far::FarBuffer;
use crate::pipeline::{FarOperands, Pipeline, RunReport};
use crate::planner::TileGeometry;
use crate::scratchpad::{LocalAllocator, Scratchpad};
use crate::svm::{SvmReport, TranslationTable, DEFAULT_PAGE_ELEMS};
use crate::transfer::ThreadedDma;

#[derive(Debug)]
pub struct Offload {
    pipeline: Pipeline,
    scratchpad: Scratchpad,
}

impl Offload {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let scratchpad = Scratchpad::new(config.scratchpad_bytes);
        let pipeline = Pipeline::new(config)?;
        Ok(Self {
            pipeline,
            scratchpad,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    /// Plan the geometry for an `n x n` multiply under this offload's budget.
    pub fn plan(&self, n: usize) -> Result<TileGeometry> {
        let config = self.pipeline.config();
        TileGeometry::plan(n, ELEMENT_SIZE, config.stripe_budget, config.min_stripe_height)
    }

    /// Stream `C = A @ B` through the double-buffered pipeline.
    pub fn run_tiled_matmul(
        &self,
        a: &[u32],
        b: &[u32],
        c: &mut [u32],
        width: usize,
        height: usize,
        stripe_height: usize,
    ) -> Result<RunReport> {
        let geometry = TileGeometry::from_parts(width, height, stripe_height)?;
        let operands = map_operands(a, b, c.len());
        let dma = ThreadedDma::new()?;
        let report = self
            .pipeline
            .run(&dma, &self.scratchpad, &operands, &geometry)?;
        self.finish(&operands, c)?;
        Ok(report)
    }

    /// Multiply with all three matrices held in scratchpad at once.
    pub fn run_resident(
        &self,
        a: &[u32],
        b: &[u32],
        c: &mut [u32],
        width: usize,
        height: usize,
    ) -> Result<RunReport> {
        let operands = map_operands(a, b, c.len());
        let dma = ThreadedDma::new()?;
        let report = self
            .pipeline
            .run_resident(&dma, &self.scratchpad, &operands, width, height)?;
        self.finish(&operands, c)?;
        Ok(report)
    }

    /// Run the tile pipeline in shared-virtual-memory mode.
    ///
    /// The geometry travels to the compute side as a far-memory parameter
    /// block, and every far page is faulted in on first touch.
    pub fn run_svm(
        &self,
        a: &[u32],
        b: &[u32],
        c: &mut [u32],
        width: usize,
        height: usize,
        stripe_height: usize,
    ) -> Result<SvmReport> {
        let params = param_block(width, height, stripe_height)?;
        let table = Arc::new(TranslationTable::new(DEFAULT_PAGE_ELEMS)?);
        let operands = map_operands(a, b, c.len());
        let dma = ThreadedDma::new()?;
        let report = self
            .pipeline
            .run_svm(&dma, &self.scratchpad, &table, &params, &operands)?;
        self.finish(&operands, c)?;
        Ok(report)
    }

    /// Shared-virtual-memory mode without DMA: the compute team reads A and
    /// B and writes C in far memory directly.
    pub fn run_svm_direct(
        &self,
        a: &[u32],
        b: &[u32],
        c: &mut [u32],
        width: usize,
        height: usize,
    ) -> Result<SvmReport> {
        let params = param_block(width, height, height)?;
        let table = Arc::new(TranslationTable::new(DEFAULT_PAGE_ELEMS)?);
        let operands = map_operands(a, b, c.len());
        let report = self.pipeline.run_svm_direct(&table, &params, &operands)?;
        self.finish(&operands, c)?;
        Ok(report)
    }

    fn finish(&self, operands: &FarOperands, c: &mut [u32]) -> Result<()> {
        operands.c.copy_to_slice(c)?;
        let in_use = self.scratchpad.in_use();
        if in_use != 0 {
            warn!(in_use, "scratchpad not empty after run");
        }
        debug!(peak = self.scratchpad.peak(), "offload finished");
        Ok(())
    }
}

fn map_operands(a: &[u32], b: &[u32], c_len: usize) -> FarOperands {
    FarOperands::new(
        FarBuffer::from_slice(a),
        FarBuffer::from_slice(b),
        FarBuffer::zeroed(c_len),
    )
}

fn param_block(width: usize, height: usize, stripe_height: usize) -> Result<FarBuffer> {
    Ok(FarBuffer::from_slice(&[
        param(width, "width")?,
        param(height, "height")?,
        param(stripe_height, "stripe_height")?,
    ]))
}

fn param(value: usize, name: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| EngineError::InvalidGeometry(format!("{}={} does not fit in u32", name, value)))
}
