use tsm_engine::{BLayout, EngineConfig, EngineError, TileGeometry};

/// Status codes returned by all FFI functions.
///
/// Failures are negative errno-style values.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsmStatus {
    Ok = 0,
    ErrorTransfer = -5,
    ErrorUnstableScalar = -11,
    ErrorOutOfLocalMemory = -12,
    ErrorFaultResolution = -14,
    ErrorInvalidArgument = -22,
    ErrorCapacity = -28,
    ErrorInternal = -131,
}

impl From<&EngineError> for TsmStatus {
    fn from(err: &EngineError) -> Self {
        match err.status() {
            -5 => TsmStatus::ErrorTransfer,
            -11 => TsmStatus::ErrorUnstableScalar,
            -12 => TsmStatus::ErrorOutOfLocalMemory,
            -14 => TsmStatus::ErrorFaultResolution,
            -22 => TsmStatus::ErrorInvalidArgument,
            -28 => TsmStatus::ErrorCapacity,
            _ => TsmStatus::ErrorInternal,
        }
    }
}

/// How an offload runs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsmMode {
    /// Double-buffered stripe pipeline.
    Tiled = 0,
    /// All three matrices held in scratchpad.
    Resident = 1,
    /// Stripe pipeline with on-demand page faults.
    Svm = 2,
    /// On-demand page faults, compute reads far memory in place.
    SvmDirect = 3,
}

/// Engine parameters exposed to C callers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TsmConfig {
    pub scratchpad_bytes: usize,
    pub compute_workers: u32,
    /// B is stored pre-transposed.
    pub b_transposed: bool,
}

impl Default for TsmConfig {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self {
            scratchpad_bytes: config.scratchpad_bytes,
            compute_workers: config.compute_workers as u32,
            b_transposed: false,
        }
    }
}

impl From<&TsmConfig> for EngineConfig {
    fn from(c: &TsmConfig) -> Self {
        let layout = if c.b_transposed {
            BLayout::Transposed
        } else {
            BLayout::RowMajor
        };
        EngineConfig::default()
            .with_scratchpad_bytes(c.scratchpad_bytes)
            .with_compute_workers(c.compute_workers as usize)
            .with_b_layout(layout)
    }
}

/// A planned stripe layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsmGeometry {
    pub width: usize,
    pub height: usize,
    pub stripe_height: usize,
    pub n_stripes: usize,
}

impl From<&TileGeometry> for TsmGeometry {
    fn from(g: &TileGeometry) -> Self {
        Self {
            width: g.width(),
            height: g.height(),
            stripe_height: g.stripe_height(),
            n_stripes: g.n_stripes(),
        }
    }
}
