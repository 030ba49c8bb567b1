use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::error::Result;
use crate::pool::Slot;
use crate::transfer::{Injection, Transfer, TransferEngine};

/// Transfer engine that copies synchronously inside `issue`.
///
/// Completion is only published through `wait`, so callers still follow
/// the issue/wait protocol. Useful as a deterministic baseline.
#[derive(Debug, Default)]
pub struct ImmediateDma {
    next_job: AtomicU64,
    injection: Injection,
}

/// A finished copy waiting to be collected.
#[must_use = "every transfer job must be waited exactly once"]
#[derive(Debug)]
pub struct ImmediateJob {
    id: u64,
    outcome: Result<Slot>,
}

impl ImmediateJob {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl ImmediateDma {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_injection(injection: Injection) -> Self {
        Self {
            next_job: AtomicU64::new(0),
            injection,
        }
    }

    /// Jobs issued so far.
    pub fn issued(&self) -> u64 {
        self.next_job.load(Ordering::Acquire)
    }
}

impl TransferEngine for ImmediateDma {
    type Job = ImmediateJob;

    fn name(&self) -> &str {
        "immediate"
    }

    fn issue(&self, transfer: Transfer) -> Result<ImmediateJob> {
        let id = self.next_job.fetch_add(1, Ordering::AcqRel);
        trace!(job = id, operand = %transfer.operand(), direction = ?transfer.direction(), "issue");
        let outcome = self.injection.execute(id, transfer);
        Ok(ImmediateJob { id, outcome })
    }

    fn wait(&self, job: ImmediateJob) -> Result<Slot> {
        self.injection.jitter.pause();
        let slot = job.outcome?;
        self.injection.jitter.pause();
        Ok(slot)
    }
}
