use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::pool::Slot;
use crate::svm::TranslationTable;
use crate::transfer::{Transfer, TransferEngine};

/// Transfer engine for shared-virtual-memory mode.
///
/// Before a copy is handed to the inner engine, every far page it touches
/// must be mapped; unmapped pages raise misses and `issue` blocks until the
/// fault handler resolves them.
#[derive(Debug)]
pub struct SvmDma<E> {
    inner: E,
    table: Arc<TranslationTable>,
}

impl<E: TransferEngine> SvmDma<E> {
    pub fn new(inner: E, table: Arc<TranslationTable>) -> Self {
        Self { inner, table }
    }
}

impl<E: TransferEngine> TransferEngine for SvmDma<E> {
    type Job = E::Job;

    fn name(&self) -> &str {
        "svm"
    }

    fn issue(&self, transfer: Transfer) -> Result<E::Job> {
        let raised = self.table.ensure_mapped(transfer.far());
        if raised > 0 {
            trace!(operand = %transfer.operand(), raised, "transfer faulted in pages");
        }
        self.inner.issue(transfer)
    }

    fn wait(&self, job: E::Job) -> Result<Slot> {
        self.inner.wait(job)
    }
}
