//! The three streaming roles.
//!
//! Each role owns one operand's double buffer and the channel ends that
//! connect it to the compute side. A slot is only ever sent to compute
//! after the role's `wait` for it returned, and the role only refills a
//! slot after compute sent it back.

use std::collections::VecDeque;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::far::{FarBuffer, FarRegion};
use crate::config::BLayout;
use crate::planner::TileGeometry;
use crate::pool::{Operand, Slot, SlotPair};
use crate::transfer::{Transfer, TransferEngine};

use super::PIPELINE_DEPTH;

/// Far-memory locations of every stripe.
#[derive(Debug, Clone)]
pub struct StripeMap {
    geometry: TileGeometry,
    layout: BLayout,
    a: FarBuffer,
    b: FarBuffer,
    c: FarBuffer,
}

impl StripeMap {
    pub fn new(geometry: TileGeometry, layout: BLayout, a: FarBuffer, b: FarBuffer, c: FarBuffer) -> Self {
        Self {
            geometry,
            layout,
            a,
            b,
            c,
        }
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    /// Rows `s*sh..(s+1)*sh` of A.
    pub fn a_stripe(&self, s: usize) -> Result<FarRegion> {
        let len = self.geometry.operand_stripe_len();
        FarRegion::contiguous(&self.a, s * len, len)
    }

    /// Columns `t*sh..(t+1)*sh` of the logical B operand.
    ///
    /// Row-major B is gathered as `width` runs of `sh` elements, giving a
    /// local `[width, sh]` block. Transposed B is one contiguous
    /// `[sh, width]` block.
    pub fn b_stripe(&self, t: usize) -> Result<FarRegion> {
        let g = &self.geometry;
        let sh = g.stripe_height();
        match self.layout {
            BLayout::RowMajor => FarRegion::strided(&self.b, t * sh, g.width(), sh, g.height()),
            BLayout::Transposed => {
                let len = g.operand_stripe_len();
                FarRegion::contiguous(&self.b, t * len, len)
            }
        }
    }

    /// Rows `s*sh..(s+1)*sh` of C.
    pub fn c_stripe(&self, s: usize) -> Result<FarRegion> {
        let len = self.geometry.result_stripe_len();
        FarRegion::contiguous(&self.c, s * len, len)
    }
}

/// Outstanding jobs of one role, oldest first.
///
/// Any job still queued when the role exits early is waited on drop, so
/// every issued job is waited exactly once on every path.
pub(crate) struct JobQueue<'e, E: TransferEngine> {
    engine: &'e E,
    operand: Operand,
    jobs: VecDeque<E::Job>,
    issued: usize,
}

impl<'e, E: TransferEngine> JobQueue<'e, E> {
    pub(crate) fn new(engine: &'e E, operand: Operand) -> Self {
        Self {
            engine,
            operand,
            jobs: VecDeque::with_capacity(PIPELINE_DEPTH),
            issued: 0,
        }
    }

    pub(crate) fn issue(&mut self, transfer: Transfer) -> Result<()> {
        let job = self.engine.issue(transfer)?;
        self.jobs.push_back(job);
        self.issued += 1;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Wait on the oldest outstanding job.
    pub(crate) fn wait_oldest(&mut self) -> Result<Slot> {
        let job = self.jobs.pop_front().ok_or_else(|| {
            EngineError::InvalidGeometry(format!("{} stream waited with no job in flight", self.operand))
        })?;
        self.engine.wait(job)
    }

    pub(crate) fn issued(&self) -> usize {
        self.issued
    }
}

impl<E: TransferEngine> Drop for JobQueue<'_, E> {
    fn drop(&mut self) {
        let abandoned = self.jobs.len();
        if abandoned > 0 {
            debug!(operand = %self.operand, abandoned, "settling transfers after early exit");
        }
        while let Some(job) = self.jobs.pop_front() {
            let _ = self.engine.wait(job);
        }
    }
}

fn closed(operand: Operand) -> EngineError {
    EngineError::StreamClosed(operand.name())
}

/// RoleA: prefetches A stripes one outer step ahead.
pub(crate) struct StreamA<'p, E: TransferEngine> {
    pub engine: &'p E,
    pub map: &'p StripeMap,
    pub slots: SlotPair,
    pub settled: Sender<Slot>,
    pub recycled: Receiver<Slot>,
}

impl<E: TransferEngine> StreamA<'_, E> {
    pub(crate) fn run(self) -> Result<usize> {
        let StreamA {
            engine,
            map,
            slots,
            settled,
            recycled,
        } = self;
        let n = map.geometry().n_stripes();
        let mut in_flight = JobQueue::new(engine, Operand::A);
        let mut spare = Some(slots.pong);

        in_flight.issue(Transfer::fetch(map.a_stripe(0)?, slots.ping))?;
        for s in 0..n {
            if s + 1 < n {
                let slot = match spare.take() {
                    Some(slot) => slot,
                    None => recycled.recv().map_err(|_| closed(Operand::A))?,
                };
                in_flight.issue(Transfer::fetch(map.a_stripe(s + 1)?, slot))?;
            }
            let slot = in_flight.wait_oldest()?;
            trace!(stripe = s, half = ?slot.half(), "A stripe settled");
            settled.send(slot).map_err(|_| closed(Operand::A))?;
        }
        Ok(in_flight.issued())
    }
}

/// RoleB: cycles through every B stripe once per outer step.
pub(crate) struct StreamB<'p, E: TransferEngine> {
    pub engine: &'p E,
    pub map: &'p StripeMap,
    pub slots: SlotPair,
    pub settled: Sender<Slot>,
    pub recycled: Receiver<Slot>,
}

impl<E: TransferEngine> StreamB<'_, E> {
    pub(crate) fn run(self) -> Result<usize> {
        let StreamB {
            engine,
            map,
            slots,
            settled,
            recycled,
        } = self;
        let n = map.geometry().n_stripes();
        let mut in_flight = JobQueue::new(engine, Operand::B);
        let mut spare = Some(slots.pong);

        in_flight.issue(Transfer::fetch(map.b_stripe(0)?, slots.ping))?;
        for s in 0..n {
            for t in 0..n {
                if t + 1 < n || s + 1 < n {
                    let slot = match spare.take() {
                        Some(slot) => slot,
                        None => recycled.recv().map_err(|_| closed(Operand::B))?,
                    };
                    in_flight.issue(Transfer::fetch(map.b_stripe((t + 1) % n)?, slot))?;
                }
                let slot = in_flight.wait_oldest()?;
                trace!(stripe = s, tile = t, half = ?slot.half(), "B stripe settled");
                settled.send(slot).map_err(|_| closed(Operand::B))?;
            }
        }
        Ok(in_flight.issued())
    }
}

/// RoleC: writes finished C stripes back, lagging compute by one stripe.
///
/// After issuing the writeback of stripe `k` it waits on the writeback of
/// stripe `k + 1 - PIPELINE_DEPTH`, whose slot is the one compute fills
/// next. The loop's last iteration is the drain of the final stripe.
pub(crate) struct StreamC<'p, E: TransferEngine> {
    pub engine: &'p E,
    pub map: &'p StripeMap,
    pub slots: SlotPair,
    pub fresh: Sender<Slot>,
    pub completed: Receiver<Slot>,
}

impl<E: TransferEngine> StreamC<'_, E> {
    pub(crate) fn run(self) -> Result<usize> {
        let StreamC {
            engine,
            map,
            slots,
            fresh,
            completed,
        } = self;
        let n = map.geometry().n_stripes();

        for slot in [slots.ping, slots.pong].into_iter().take(n.min(PIPELINE_DEPTH)) {
            fresh.send(slot).map_err(|_| closed(Operand::C))?;
        }

        let mut in_flight = JobQueue::new(engine, Operand::C);
        for stripe in 0..n {
            let filled = completed.recv().map_err(|_| closed(Operand::C))?;
            in_flight.issue(Transfer::writeback(filled, map.c_stripe(stripe)?))?;
            trace!(stripe, "C writeback issued");
            if in_flight.len() == PIPELINE_DEPTH {
                let freed = in_flight.wait_oldest()?;
                let reuse = stripe + 1;
                if reuse < n {
                    trace!(stripe = reuse, half = ?freed.half(), "C slot recycled");
                    fresh.send(freed).map_err(|_| closed(Operand::C))?;
                }
            }
        }
        while in_flight.len() > 0 {
            in_flight.wait_oldest()?;
        }
        Ok(in_flight.issued())
    }
}
