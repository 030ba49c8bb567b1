//! `tsm-engine` - Double-buffered tile-streaming matrix multiplication.
//!
//! The operands live in far memory that is much larger than the compute
//! domain's scratchpad. The engine streams row stripes of A, column stripes
//! of B and row stripes of C through two scratchpad slots per operand,
//! overlapping block transfers with the tile multiplies.
//!
//! - [`planner`] picks a stripe height that fits the scratchpad budget
//! - [`pool`] allocates the six typed stripe slots
//! - [`transfer`] issues and waits on asynchronous block copies
//! - [`pipeline`] runs the streaming roles and the compute team
//! - [`fault`] and [`svm`] handle shared-virtual-memory mode
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod backend;
pub mod config;
pub mod error;
pub mod far;
pub mod fault;
pub mod offload;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod scratchpad;
pub mod svm;
pub mod transfer;

pub use backend::TiledBackend;
pub use config::{BLayout, EngineConfig, ELEMENT_SIZE};
pub use error::{EngineError, Result};
pub use far::{FarBuffer, FarRegion};
pub use fault::{CompletionFlag, FaultHandler, FaultResolver, FaultStats, FaultStatus};
pub use offload::Offload;
pub use pipeline::{FarOperands, Pipeline, RunReport, PIPELINE_DEPTH};
pub use planner::TileGeometry;
pub use pool::{BufferPool, Half, Operand, Slot};
pub use scratchpad::{LocalAllocator, Scratchpad};
pub use svm::{SvmReport, TranslationTable};
pub use transfer::{ImmediateDma, SvmDma, ThreadedDma, Transfer, TransferEngine};

/// Compute `C = A @ B` with the default configuration.
///
/// A is `[height, width]`, B is `[width, height]` and C is `[height, height]`,
/// all row-major.
pub fn run_tiled_matmul(
    a: &[u32],
    b: &[u32],
    c: &mut [u32],
    width: usize,
    height: usize,
    stripe_height: usize,
) -> Result<RunReport> {
    Offload::new(EngineConfig::default())?.run_tiled_matmul(a, b, c, width, height, stripe_height)
}
