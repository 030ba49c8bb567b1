use std::time::Duration;

use crate::error::{EngineError, Result};

/// Size in bytes of one matrix element.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<u32>();

/// Default scratchpad capacity: 256 KiB of cluster-local memory.
pub const DEFAULT_SCRATCHPAD_BYTES: usize = 256 * 1024;

/// Memory layout of the B operand in far memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BLayout {
    /// B is stored row-major as `[width, height]`; column stripes are
    /// gathered with a strided transfer. Computes `C = A @ B`.
    #[default]
    RowMajor,
    /// B is stored pre-transposed (`[height, width]`, row `j` holds column
    /// `j` of the logical operand), so each stripe is contiguous. Computes
    /// `C = A @ B^T` of the stored matrix.
    Transposed,
}

/// Parameters controlling one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total bytes of scratchpad the local allocator may hand out.
    pub scratchpad_bytes: usize,
    /// Bytes available to one operand's buffer pair when planning geometry.
    pub stripe_budget: usize,
    /// Smallest stripe height the planner will accept.
    pub min_stripe_height: usize,
    /// Threads in the compute team.
    pub compute_workers: usize,
    pub b_layout: BLayout,
    /// Sleep between fault-handler polls that found nothing to do. Zero
    /// yields instead.
    pub fault_idle_backoff: Duration,
    /// Upper bound on reads when re-validating a shared scalar.
    pub scalar_read_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratchpad_bytes: DEFAULT_SCRATCHPAD_BYTES,
            stripe_budget: DEFAULT_SCRATCHPAD_BYTES / 3,
            min_stripe_height: 1,
            compute_workers: 4,
            b_layout: BLayout::RowMajor,
            fault_idle_backoff: Duration::ZERO,
            scalar_read_attempts: 8,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scratchpad capacity; the planner budget follows as a third of it.
    pub fn with_scratchpad_bytes(mut self, bytes: usize) -> Self {
        self.scratchpad_bytes = bytes;
        self.stripe_budget = bytes / 3;
        self
    }

    pub fn with_stripe_budget(mut self, bytes: usize) -> Self {
        self.stripe_budget = bytes;
        self
    }

    pub fn with_min_stripe_height(mut self, rows: usize) -> Self {
        self.min_stripe_height = rows;
        self
    }

    pub fn with_compute_workers(mut self, workers: usize) -> Self {
        self.compute_workers = workers;
        self
    }

    pub fn with_b_layout(mut self, layout: BLayout) -> Self {
        self.b_layout = layout;
        self
    }

    pub fn with_fault_idle_backoff(mut self, backoff: Duration) -> Self {
        self.fault_idle_backoff = backoff;
        self
    }

    pub fn with_scalar_read_attempts(mut self, attempts: usize) -> Self {
        self.scalar_read_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.scratchpad_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "scratchpad_bytes must be > 0".to_string(),
            ));
        }
        if self.stripe_budget > self.scratchpad_bytes {
            return Err(EngineError::InvalidConfig(format!(
                "stripe_budget={} exceeds scratchpad_bytes={}",
                self.stripe_budget, self.scratchpad_bytes
            )));
        }
        if self.min_stripe_height == 0 {
            return Err(EngineError::InvalidConfig(
                "min_stripe_height must be > 0".to_string(),
            ));
        }
        if self.compute_workers == 0 {
            return Err(EngineError::InvalidConfig(
                "compute_workers must be > 0".to_string(),
            ));
        }
        if self.scalar_read_attempts < 2 {
            return Err(EngineError::InvalidConfig(format!(
                "scalar_read_attempts={} but a confirming read needs at least 2",
                self.scalar_read_attempts
            )));
        }
        Ok(())
    }
}
