use thiserror::Error;

use crate::pool::Operand;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no stripe height >= {min_stripe_height} fits {n}x{n} elements into a {budget}-byte buffer pair")]
    Capacity {
        n: usize,
        budget: usize,
        min_stripe_height: usize,
    },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("out of local memory: {operand} buffer of {bytes} bytes ({in_use}/{capacity} bytes in use)")]
    OutOfLocalMemory {
        operand: Operand,
        bytes: usize,
        in_use: usize,
        capacity: usize,
    },
    #[error("transfer #{job} failed: {reason}")]
    Transfer { job: u64, reason: String },
    #[error("fault resolution failed with code {0}")]
    FaultResolution(i32),
    #[error("shared scalar at index {index} did not settle after {attempts} reads")]
    UnstableScalar { index: usize, attempts: usize },
    #[error("{0} stream closed before the pipeline finished")]
    StreamClosed(&'static str),
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
    #[error("tensor error: {0}")]
    Tensor(#[from] tsm_tensor::TensorError),
}

impl EngineError {
    /// Negative errno-style status reported across the offload boundary.
    pub fn status(&self) -> i32 {
        match self {
            EngineError::Capacity { .. } => -28,
            EngineError::InvalidGeometry(_)
            | EngineError::InvalidConfig(_)
            | EngineError::Tensor(_) => -22,
            EngineError::OutOfLocalMemory { .. } => -12,
            EngineError::Transfer { .. } => -5,
            EngineError::FaultResolution(_) => -14,
            EngineError::UnstableScalar { .. } => -11,
            EngineError::StreamClosed(_) | EngineError::WorkerPanicked(_) => -131,
        }
    }

    /// True for errors that only report a peer's failure.
    pub(crate) fn is_secondary(&self) -> bool {
        matches!(self, EngineError::StreamClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
