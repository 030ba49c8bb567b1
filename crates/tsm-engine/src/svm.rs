//! Shared-virtual-memory mode.
//!
//! The compute domain reaches far memory through a page-granular
//! [`TranslationTable`]. Touching an unmapped page raises a miss and blocks
//! the caller until the fault handler thread maps it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::config::BLayout;
use crate::error::{EngineError, Result};
use crate::far::{FarBuffer, FarRegion};
use crate::fault::{CompletionFlag, FaultHandler, FaultResolver, FaultStats, FaultStatus};
use crate::pipeline::{FarOperands, Pipeline, RunReport};
use crate::planner::TileGeometry;
use crate::scratchpad::LocalAllocator;
use crate::transfer::{SvmDma, TransferEngine};

/// 4 KiB pages of `u32` elements.
pub const DEFAULT_PAGE_ELEMS: usize = 1024;

/// Code reported for an injected resolution failure.
const EFAULT: i32 = -14;

type PageKey = (u64, usize);

#[derive(Debug, Default)]
struct TableState {
    mapped: HashSet<PageKey>,
    pending: VecDeque<PageKey>,
    misses: u64,
    failures_left: usize,
}

/// Page mappings of far buffers into the compute domain's address space.
#[derive(Debug)]
pub struct TranslationTable {
    page_elems: usize,
    state: Mutex<TableState>,
    mapped: Condvar,
}

impl TranslationTable {
    pub fn new(page_elems: usize) -> Result<Self> {
        if page_elems == 0 {
            return Err(EngineError::InvalidConfig(
                "page_elems must be > 0".to_string(),
            ));
        }
        Ok(Self {
            page_elems,
            state: Mutex::new(TableState::default()),
            mapped: Condvar::new(),
        })
    }

    /// Make the next `count` resolution attempts fail with `-EFAULT`.
    ///
    /// A failed attempt leaves its page pending, so a later attempt still
    /// maps it.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.state.lock().failures_left = count;
        self
    }

    pub fn page_elems(&self) -> usize {
        self.page_elems
    }

    pub fn mapped_pages(&self) -> usize {
        self.state.lock().mapped.len()
    }

    /// Misses raised so far.
    pub fn misses(&self) -> u64 {
        self.state.lock().misses
    }

    fn pages(&self, region: &FarRegion) -> HashSet<PageKey> {
        let id = region.buffer().id();
        region
            .runs()
            .filter(|(start, end)| end > start)
            .flat_map(|(start, end)| (start / self.page_elems)..=((end - 1) / self.page_elems))
            .map(|page| (id, page))
            .collect()
    }

    /// Block until every page `region` touches is mapped.
    ///
    /// Raises one miss per unmapped page and returns the number raised.
    pub fn ensure_mapped(&self, region: &FarRegion) -> usize {
        let wanted = self.pages(region);
        let mut state = self.state.lock();
        let mut raised = 0;
        for key in &wanted {
            if !state.mapped.contains(key) && !state.pending.contains(key) {
                state.pending.push_back(*key);
                state.misses += 1;
                raised += 1;
            }
        }
        if raised > 0 {
            trace!(buffer = region.buffer().id(), raised, "translation misses raised");
        }
        while !wanted.iter().all(|key| state.mapped.contains(key)) {
            self.mapped.wait(&mut state);
        }
        raised
    }

    /// Read one scalar from far memory, faulting its page in first.
    pub fn read(&self, buffer: &FarBuffer, index: usize) -> Result<u32> {
        let region = FarRegion::contiguous(buffer, index, 1)?;
        self.ensure_mapped(&region);
        far_load(buffer, index)
    }

    /// Read a scalar shared with the host and re-validate it.
    ///
    /// A prefetch read is followed by confirming reads until two consecutive
    /// reads agree, up to `attempts` reads in total.
    pub fn read_confirmed(&self, buffer: &FarBuffer, index: usize, attempts: usize) -> Result<u32> {
        confirm_scalar(|| self.read(buffer, index), index, attempts)
    }
}

fn confirm_scalar(
    mut read: impl FnMut() -> Result<u32>,
    index: usize,
    attempts: usize,
) -> Result<u32> {
    let mut previous = read()?;
    for _ in 1..attempts {
        let current = read()?;
        if current == previous {
            return Ok(current);
        }
        previous = current;
    }
    Err(EngineError::UnstableScalar { index, attempts })
}

impl FaultResolver for TranslationTable {
    fn resolve_one_fault(&self) -> FaultStatus {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return FaultStatus::NonePending;
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return FaultStatus::Error(EFAULT);
        }
        match state.pending.pop_front() {
            Some(key) => {
                state.mapped.insert(key);
                drop(state);
                self.mapped.notify_all();
                FaultStatus::Resolved
            }
            None => FaultStatus::NonePending,
        }
    }
}

/// Offsets of the offload parameters in the shared scalar block.
pub const PARAM_WIDTH: usize = 0;
pub const PARAM_HEIGHT: usize = 1;
pub const PARAM_STRIPE_HEIGHT: usize = 2;

/// Result of an SVM-mode run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmReport {
    pub run: RunReport,
    pub faults: FaultStats,
    pub misses: u64,
}

impl Pipeline {
    /// Run the tile pipeline in shared-virtual-memory mode.
    ///
    /// A fault handler thread serves `table` for the whole run. Geometry is
    /// read from `params` (`[width, height, stripe_height]`) through
    /// confirmed scalar reads. The completion flag is set on every exit
    /// path, then the handler is joined.
    pub fn run_svm<E: TransferEngine>(
        &self,
        engine: &E,
        alloc: &dyn LocalAllocator,
        table: &Arc<TranslationTable>,
        params: &FarBuffer,
        operands: &FarOperands,
    ) -> Result<SvmReport> {
        self.with_fault_handler(table, || self.svm_body(engine, alloc, table, params, operands))
    }

    /// Multiply in shared-virtual-memory mode by dereferencing far memory
    /// directly.
    ///
    /// No scratchpad and no bulk copies: rows of C are spread over the
    /// compute team, and each row touches its A row, all of B and its C row
    /// in place. `params` is read the same way as in [`Pipeline::run_svm`];
    /// its stripe height entry is ignored.
    pub fn run_svm_direct(
        &self,
        table: &Arc<TranslationTable>,
        params: &FarBuffer,
        operands: &FarOperands,
    ) -> Result<SvmReport> {
        self.with_fault_handler(table, || self.direct_body(table, params, operands))
    }

    fn with_fault_handler(
        &self,
        table: &Arc<TranslationTable>,
        body: impl FnOnce() -> Result<RunReport>,
    ) -> Result<SvmReport> {
        let flag = CompletionFlag::new();
        let handler = FaultHandler::new(flag.clone(), self.config().fault_idle_backoff);
        let misses_before = table.misses();

        thread::scope(|scope| -> Result<SvmReport> {
            let handler_thread = thread::Builder::new()
                .name("tsm-fault".to_string())
                .spawn_scoped(scope, || handler.run(table.as_ref()))
                .map_err(|e| {
                    EngineError::InvalidConfig(format!("cannot start fault handler: {}", e))
                })?;

            let outcome = body();
            flag.set();
            debug!("completion flag set");
            let faults = handler_thread
                .join()
                .map_err(|_| EngineError::WorkerPanicked("fault handler"))?;

            let run = outcome?;
            let report = SvmReport {
                run,
                faults,
                misses: table.misses() - misses_before,
            };
            info!(
                misses = report.misses,
                resolved = faults.resolved,
                errors = faults.errors,
                "svm run finished"
            );
            Ok(report)
        })
    }

    fn svm_body<E: TransferEngine>(
        &self,
        engine: &E,
        alloc: &dyn LocalAllocator,
        table: &Arc<TranslationTable>,
        params: &FarBuffer,
        operands: &FarOperands,
    ) -> Result<RunReport> {
        let attempts = self.config().scalar_read_attempts;
        let width = table.read_confirmed(params, PARAM_WIDTH, attempts)?;
        let height = table.read_confirmed(params, PARAM_HEIGHT, attempts)?;
        let stripe_height = table.read_confirmed(params, PARAM_STRIPE_HEIGHT, attempts)?;
        let geometry =
            TileGeometry::from_parts(width as usize, height as usize, stripe_height as usize)?;

        let dma = SvmDma::new(engine, Arc::clone(table));
        self.run(&dma, alloc, operands, &geometry)
    }

    fn direct_body(
        &self,
        table: &TranslationTable,
        params: &FarBuffer,
        operands: &FarOperands,
    ) -> Result<RunReport> {
        let attempts = self.config().scalar_read_attempts;
        let width = table.read_confirmed(params, PARAM_WIDTH, attempts)? as usize;
        let height = table.read_confirmed(params, PARAM_HEIGHT, attempts)? as usize;
        let geometry = TileGeometry::from_parts(width, height, height)?;
        operands.check(&geometry)?;

        table.ensure_mapped(&FarRegion::contiguous(&operands.b, 0, geometry.b_len())?);
        let layout = self.config().b_layout;
        self.team().try_for_each_row(height, |i| {
            table.ensure_mapped(&FarRegion::contiguous(&operands.a, i * width, width)?);
            table.ensure_mapped(&FarRegion::contiguous(&operands.c, i * height, height)?);
            for j in 0..height {
                let mut acc = 0u32;
                for k in 0..width {
                    let b_index = match layout {
                        BLayout::RowMajor => k * height + j,
                        BLayout::Transposed => j * width + k,
                    };
                    let x = far_load(&operands.a, i * width + k)?;
                    let y = far_load(&operands.b, b_index)?;
                    acc = acc.wrapping_add(x.wrapping_mul(y));
                }
                far_store(&operands.c, i * height + j, acc)?;
            }
            Ok(())
        })?;
        debug!(width, height, "direct svm multiply finished");

        Ok(RunReport {
            geometry,
            tiles: geometry.tile_count(),
            a_fetches: 0,
            b_fetches: 0,
            c_writebacks: 0,
        })
    }
}

fn out_of_range(buffer: &FarBuffer, index: usize) -> EngineError {
    EngineError::InvalidGeometry(format!(
        "index {} outside far buffer of {} elements",
        index,
        buffer.len()
    ))
}

fn far_load(buffer: &FarBuffer, index: usize) -> Result<u32> {
    buffer.load(index).ok_or_else(|| out_of_range(buffer, index))
}

fn far_store(buffer: &FarBuffer, index: usize, value: u32) -> Result<()> {
    buffer
        .store(index, value)
        .ok_or_else(|| out_of_range(buffer, index))
}
