//! Asynchronous block transfers between far memory and scratchpad slots.
//!
//! A transfer moves ownership of its local slot into the job that carries
//! it. `wait` consumes the job and hands the slot back, so a job can only be
//! waited once and a slot can never be read while its copy is in flight.

pub mod immediate;
pub mod svm;
pub mod threaded;

use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EngineError, Result};
use crate::far::FarRegion;
use crate::pool::{Operand, Slot};

pub use immediate::{ImmediateDma, ImmediateJob};
pub use svm::SvmDma;
pub use threaded::{ThreadedDma, ThreadedJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// far -> local
    Fetch,
    /// local -> far
    Writeback,
}

/// One block copy, owning its local end.
#[derive(Debug)]
pub enum Transfer {
    Fetch { src: FarRegion, dst: Slot },
    Writeback { src: Slot, dst: FarRegion },
}

impl Transfer {
    pub fn fetch(src: FarRegion, dst: Slot) -> Self {
        Transfer::Fetch { src, dst }
    }

    pub fn writeback(src: Slot, dst: FarRegion) -> Self {
        Transfer::Writeback { src, dst }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Transfer::Fetch { .. } => Direction::Fetch,
            Transfer::Writeback { .. } => Direction::Writeback,
        }
    }

    pub fn far(&self) -> &FarRegion {
        match self {
            Transfer::Fetch { src, .. } => src,
            Transfer::Writeback { dst, .. } => dst,
        }
    }

    pub fn operand(&self) -> Operand {
        match self {
            Transfer::Fetch { dst, .. } => dst.operand(),
            Transfer::Writeback { src, .. } => src.operand(),
        }
    }

    /// Perform the copy and return the local slot.
    pub fn execute(self, job: u64) -> Result<Slot> {
        let outcome = match self {
            Transfer::Fetch { src, mut dst } => src.read_into(&mut dst).map(|()| dst),
            Transfer::Writeback { src, dst } => dst.write_from(&src).map(|()| src),
        };
        outcome.map_err(|e| EngineError::Transfer {
            job,
            reason: e.to_string(),
        })
    }
}

/// Async transfer collaborator.
///
/// Jobs complete in issuance order for a given caller; every job must be
/// passed to `wait` exactly once.
pub trait TransferEngine: Send + Sync {
    type Job: Send;

    fn name(&self) -> &str;

    /// Start a non-blocking copy.
    fn issue(&self, transfer: Transfer) -> Result<Self::Job>;

    /// Block until the copy behind `job` is visible, returning its slot.
    fn wait(&self, job: Self::Job) -> Result<Slot>;
}

impl<E: TransferEngine + ?Sized> TransferEngine for &E {
    type Job = E::Job;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn issue(&self, transfer: Transfer) -> Result<Self::Job> {
        (**self).issue(transfer)
    }

    fn wait(&self, job: Self::Job) -> Result<Slot> {
        (**self).wait(job)
    }
}

/// Random delays injected around transfer completion.
#[derive(Debug)]
pub struct Jitter {
    max: Duration,
    rng: Mutex<StdRng>,
}

impl Jitter {
    pub fn none() -> Self {
        Self::uniform(Duration::ZERO, 0)
    }

    /// Delays drawn uniformly from `[0, max)` using a seeded generator.
    pub fn uniform(max: Duration, seed: u64) -> Self {
        Self {
            max,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn pause(&self) {
        if self.max.is_zero() {
            return;
        }
        let nanos = self.max.as_nanos().min(u64::MAX as u128) as u64;
        let delay = self.rng.lock().gen_range(0..nanos);
        std::thread::sleep(Duration::from_nanos(delay));
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::none()
    }
}

/// Test hooks shared by the bundled engines.
#[derive(Debug, Default)]
pub struct Injection {
    pub jitter: Jitter,
    /// Sequence number of a job whose copy fails.
    pub fail_job: Option<u64>,
}

impl Injection {
    pub fn with_jitter(mut self, max: Duration, seed: u64) -> Self {
        self.jitter = Jitter::uniform(max, seed);
        self
    }

    pub fn with_failed_job(mut self, job: u64) -> Self {
        self.fail_job = Some(job);
        self
    }

    /// Run `transfer` unless job `id` is scheduled to fail.
    pub(crate) fn execute(&self, id: u64, transfer: Transfer) -> Result<Slot> {
        if self.fail_job == Some(id) {
            return Err(EngineError::Transfer {
                job: id,
                reason: format!("injected {:?} failure", transfer.direction()),
            });
        }
        transfer.execute(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::far::FarBuffer;
    use crate::pool::{acquire_slot, Half};
    use crate::scratchpad::{LocalAllocator, Scratchpad};

    #[test]
    fn test_execute_fetch_and_writeback() {
        let pad = Scratchpad::new(1024);
        let far = FarBuffer::from_slice(&[5, 6, 7, 8]);
        let out = FarBuffer::zeroed(4);
        let slot = acquire_slot(&pad, Operand::A, Half::Ping, 2).unwrap();

        let fetch = Transfer::fetch(FarRegion::contiguous(&far, 2, 2).unwrap(), slot);
        assert_eq!(fetch.direction(), Direction::Fetch);
        assert_eq!(fetch.operand(), Operand::A);
        let slot = fetch.execute(1).unwrap();
        assert_eq!(&slot[..], &[7, 8]);

        let wb = Transfer::writeback(slot, FarRegion::contiguous(&out, 0, 2).unwrap());
        wb.execute(2).unwrap();
        assert_eq!(out.to_vec(), vec![7, 8, 0, 0]);
    }

    #[test]
    fn test_execute_length_mismatch_is_transfer_error() {
        let pad = Scratchpad::new(1024);
        let far = FarBuffer::zeroed(8);
        let slot = acquire_slot(&pad, Operand::B, Half::Pong, 3).unwrap();
        let fetch = Transfer::fetch(FarRegion::contiguous(&far, 0, 4).unwrap(), slot);
        assert!(matches!(
            fetch.execute(9),
            Err(EngineError::Transfer { job: 9, .. })
        ));
        assert_eq!(pad.in_use(), 0);
    }

    #[test]
    fn test_injected_failure() {
        let pad = Scratchpad::new(1024);
        let far = FarBuffer::zeroed(2);
        let injection = Injection::default().with_failed_job(4);
        let slot = acquire_slot(&pad, Operand::A, Half::Ping, 2).unwrap();
        let t = Transfer::fetch(FarRegion::contiguous(&far, 0, 2).unwrap(), slot);
        assert!(injection.execute(4, t).is_err());
    }

    #[test]
    fn test_zero_jitter_returns_immediately() {
        Jitter::none().pause();
    }
}
