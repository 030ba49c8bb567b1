use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::pool::Slot;
use crate::transfer::{Injection, Transfer, TransferEngine};

struct Request {
    id: u64,
    transfer: Transfer,
    done: Sender<Result<Slot>>,
}

/// Transfer engine backed by a dedicated copy thread.
///
/// Requests are served strictly in arrival order, so jobs issued by one
/// role complete in issuance order. Dropping the engine stops the thread
/// once the queue has drained.
pub struct ThreadedDma {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    next_job: AtomicU64,
    injection: Arc<Injection>,
}

/// Handle to a copy queued on the DMA thread.
#[must_use = "every transfer job must be waited exactly once"]
#[derive(Debug)]
pub struct ThreadedJob {
    id: u64,
    done: Receiver<Result<Slot>>,
}

impl ThreadedJob {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl ThreadedDma {
    pub fn new() -> Result<Self> {
        Self::with_injection(Injection::default())
    }

    pub fn with_injection(injection: Injection) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Request>();
        let injection = Arc::new(injection);
        let worker_injection = Arc::clone(&injection);
        let worker = thread::Builder::new()
            .name("tsm-dma".to_string())
            .spawn(move || serve(rx, &worker_injection))
            .map_err(|e| EngineError::InvalidConfig(format!("cannot start DMA thread: {}", e)))?;
        debug!("DMA thread started");
        Ok(Self {
            requests: Some(tx),
            worker: Some(worker),
            next_job: AtomicU64::new(0),
            injection,
        })
    }

    pub fn issued(&self) -> u64 {
        self.next_job.load(Ordering::Acquire)
    }
}

fn serve(requests: Receiver<Request>, injection: &Injection) {
    for req in requests {
        injection.jitter.pause();
        let outcome = injection.execute(req.id, req.transfer);
        if req.done.send(outcome).is_err() {
            warn!(job = req.id, "transfer completed after its job was dropped");
        }
    }
    debug!("DMA thread stopped");
}

impl TransferEngine for ThreadedDma {
    type Job = ThreadedJob;

    fn name(&self) -> &str {
        "threaded"
    }

    fn issue(&self, transfer: Transfer) -> Result<ThreadedJob> {
        let id = self.next_job.fetch_add(1, Ordering::AcqRel);
        trace!(job = id, operand = %transfer.operand(), direction = ?transfer.direction(), "issue");
        let (done_tx, done_rx) = channel::bounded(1);
        let requests = self.requests.as_ref().ok_or_else(|| EngineError::Transfer {
            job: id,
            reason: "DMA engine is shut down".to_string(),
        })?;
        requests
            .send(Request {
                id,
                transfer,
                done: done_tx,
            })
            .map_err(|_| EngineError::Transfer {
                job: id,
                reason: "DMA thread is gone".to_string(),
            })?;
        Ok(ThreadedJob { id, done: done_rx })
    }

    fn wait(&self, job: ThreadedJob) -> Result<Slot> {
        self.injection.jitter.pause();
        let outcome = job.done.recv().map_err(|_| EngineError::Transfer {
            job: job.id,
            reason: "DMA thread dropped the job".to_string(),
        })?;
        let slot = outcome?;
        self.injection.jitter.pause();
        Ok(slot)
    }
}

impl Drop for ThreadedDma {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("DMA thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadedDma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedDma")
            .field("issued", &self.issued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::far::{FarBuffer, FarRegion};
    use crate::pool::{acquire_slot, Half, Operand};
    use crate::scratchpad::{LocalAllocator, Scratchpad};
    use std::time::Duration;

    #[test]
    fn test_fetch_then_writeback() {
        let dma = ThreadedDma::new().unwrap();
        let pad = Scratchpad::new(64);
        let src = FarBuffer::from_slice(&[4, 5, 6, 7]);
        let dst = FarBuffer::zeroed(4);

        let slot = acquire_slot(&pad, Operand::C, Half::Ping, 4).unwrap();
        let job = dma
            .issue(Transfer::fetch(FarRegion::contiguous(&src, 0, 4).unwrap(), slot))
            .unwrap();
        let slot = dma.wait(job).unwrap();
        let job = dma
            .issue(Transfer::writeback(slot, FarRegion::contiguous(&dst, 0, 4).unwrap()))
            .unwrap();
        drop(dma.wait(job).unwrap());
        assert_eq!(dst.to_vec(), vec![4, 5, 6, 7]);
        assert_eq!(pad.in_use(), 0);
    }

    #[test]
    fn test_jobs_complete_in_issue_order() {
        let dma = ThreadedDma::with_injection(
            Injection::default().with_jitter(Duration::from_micros(200), 3),
        )
        .unwrap();
        let pad = Scratchpad::new(1024);
        let far = FarBuffer::from_slice(&(0..16).collect::<Vec<u32>>());
        let jobs: Vec<_> = (0..4)
            .map(|i| {
                let slot = acquire_slot(&pad, Operand::B, Half::Ping, 4).unwrap();
                let region = FarRegion::contiguous(&far, i * 4, 4).unwrap();
                dma.issue(Transfer::fetch(region, slot)).unwrap()
            })
            .collect();
        for (i, job) in jobs.into_iter().enumerate() {
            assert_eq!(job.id(), i as u64);
            let slot = dma.wait(job).unwrap();
            assert_eq!(slot[0], (i * 4) as u32);
        }
    }

    #[test]
    fn test_injected_failure_is_reported() {
        let dma = ThreadedDma::with_injection(Injection::default().with_failed_job(0)).unwrap();
        let pad = Scratchpad::new(64);
        let far = FarBuffer::zeroed(2);
        let slot = acquire_slot(&pad, Operand::A, Half::Ping, 2).unwrap();
        let job = dma
            .issue(Transfer::fetch(FarRegion::contiguous(&far, 0, 2).unwrap(), slot))
            .unwrap();
        assert!(matches!(dma.wait(job), Err(EngineError::Transfer { job: 0, .. })));
    }
}
