//! The double-buffered streaming pipeline.
//!
//! RoleA, RoleB and RoleC each run on their own thread and talk to the
//! compute side through bounded channels of depth [`PIPELINE_DEPTH`]: one
//! channel carries settled slots to compute, the other carries consumed
//! slots back. Compute is admitted to tile `(s, t)` only once it holds the
//! settled A stripe `s`, B stripe `t` and an empty C stripe.

pub mod compute;
pub mod resident;
pub mod roles;

use std::thread::{self, ScopedJoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::far::FarBuffer;
use crate::planner::TileGeometry;
use crate::pool::{BufferPool, Operand, Slot};
use crate::scratchpad::LocalAllocator;
use crate::transfer::TransferEngine;

use compute::ComputeTeam;
use roles::{StreamA, StreamB, StreamC, StripeMap};

/// Buffers per stream; also the writeback lag plus one.
pub const PIPELINE_DEPTH: usize = 2;

/// The three matrices, resident in far memory.
#[derive(Debug, Clone)]
pub struct FarOperands {
    pub a: FarBuffer,
    pub b: FarBuffer,
    pub c: FarBuffer,
}

impl FarOperands {
    pub fn new(a: FarBuffer, b: FarBuffer, c: FarBuffer) -> Self {
        Self { a, b, c }
    }

    /// Check buffer lengths against `geometry`.
    pub fn check(&self, geometry: &TileGeometry) -> Result<()> {
        let expected = [
            (Operand::A, self.a.len(), geometry.a_len()),
            (Operand::B, self.b.len(), geometry.b_len()),
            (Operand::C, self.c.len(), geometry.c_len()),
        ];
        for (operand, got, want) in expected {
            if got != want {
                return Err(EngineError::InvalidGeometry(format!(
                    "{} holds {} elements but geometry needs {}",
                    operand, got, want
                )));
            }
        }
        Ok(())
    }
}

/// Counters from one completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub geometry: TileGeometry,
    pub tiles: usize,
    pub a_fetches: usize,
    pub b_fetches: usize,
    pub c_writebacks: usize,
}

impl RunReport {
    pub fn transfers(&self) -> usize {
        self.a_fetches + self.b_fetches + self.c_writebacks
    }
}

/// Channel ends held by the compute side.
struct ComputeEnds {
    a_settled: Receiver<Slot>,
    a_recycle: Sender<Slot>,
    b_settled: Receiver<Slot>,
    b_recycle: Sender<Slot>,
    c_fresh: Receiver<Slot>,
    c_completed: Sender<Slot>,
}

/// Tile-streaming matrix multiply over a fixed team of threads.
#[derive(Debug)]
pub struct Pipeline {
    config: EngineConfig,
    team: ComputeTeam,
}

impl Pipeline {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let team = ComputeTeam::new(config.compute_workers)?;
        Ok(Self { config, team })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn team(&self) -> &ComputeTeam {
        &self.team
    }

    /// Compute `C = A @ B` by streaming stripes through scratchpad.
    ///
    /// Buffers are acquired from `alloc` before any transfer is issued and
    /// are all released again before this returns, on success or error.
    pub fn run<E: TransferEngine>(
        &self,
        engine: &E,
        alloc: &dyn LocalAllocator,
        operands: &FarOperands,
        geometry: &TileGeometry,
    ) -> Result<RunReport> {
        operands.check(geometry)?;
        let pool = BufferPool::acquire(alloc, geometry)?;
        let map = StripeMap::new(
            *geometry,
            self.config.b_layout,
            operands.a.clone(),
            operands.b.clone(),
            operands.c.clone(),
        );
        info!(
            engine = engine.name(),
            width = geometry.width(),
            height = geometry.height(),
            stripe_height = geometry.stripe_height(),
            n_stripes = geometry.n_stripes(),
            "starting tile pipeline"
        );

        let (a_settled_tx, a_settled_rx) = channel::bounded(PIPELINE_DEPTH);
        let (a_recycle_tx, a_recycle_rx) = channel::bounded(PIPELINE_DEPTH);
        let (b_settled_tx, b_settled_rx) = channel::bounded(PIPELINE_DEPTH);
        let (b_recycle_tx, b_recycle_rx) = channel::bounded(PIPELINE_DEPTH);
        let (c_fresh_tx, c_fresh_rx) = channel::bounded(PIPELINE_DEPTH);
        let (c_completed_tx, c_completed_rx) = channel::bounded(PIPELINE_DEPTH);

        let stream_a = StreamA {
            engine,
            map: &map,
            slots: pool.a,
            settled: a_settled_tx,
            recycled: a_recycle_rx,
        };
        let stream_b = StreamB {
            engine,
            map: &map,
            slots: pool.b,
            settled: b_settled_tx,
            recycled: b_recycle_rx,
        };
        let stream_c = StreamC {
            engine,
            map: &map,
            slots: pool.c,
            fresh: c_fresh_tx,
            completed: c_completed_rx,
        };
        let ends = ComputeEnds {
            a_settled: a_settled_rx,
            a_recycle: a_recycle_tx,
            b_settled: b_settled_rx,
            b_recycle: b_recycle_tx,
            c_fresh: c_fresh_rx,
            c_completed: c_completed_tx,
        };

        let results = thread::scope(|scope| {
            let spawn_error =
                |e: std::io::Error| EngineError::InvalidConfig(format!("cannot start role thread: {}", e));
            let role_a = thread::Builder::new()
                .name("tsm-role-a".to_string())
                .spawn_scoped(scope, move || stream_a.run())
                .map_err(spawn_error)?;
            let role_b = thread::Builder::new()
                .name("tsm-role-b".to_string())
                .spawn_scoped(scope, move || stream_b.run())
                .map_err(spawn_error)?;
            let role_c = thread::Builder::new()
                .name("tsm-role-c".to_string())
                .spawn_scoped(scope, move || stream_c.run())
                .map_err(spawn_error)?;

            let tiles = self.compute(ends, geometry);
            let a = join_role(role_a, "RoleA");
            let b = join_role(role_b, "RoleB");
            let c = join_role(role_c, "RoleC");
            Ok::<_, EngineError>((tiles, a, b, c))
        });
        let (tiles, a, b, c) = results?;

        let (tiles, a_fetches, b_fetches, c_writebacks) = match (tiles, a, b, c) {
            (Ok(tiles), Ok(a), Ok(b), Ok(c)) => (tiles, a, b, c),
            (tiles, a, b, c) => {
                return Err(first_root_cause([tiles.err(), a.err(), b.err(), c.err()]));
            }
        };

        let report = RunReport {
            geometry: *geometry,
            tiles,
            a_fetches,
            b_fetches,
            c_writebacks,
        };
        info!(
            tiles = report.tiles,
            transfers = report.transfers(),
            "tile pipeline finished"
        );
        Ok(report)
    }

    /// RoleCompute: walk the `(s, t)` grid as settled stripes arrive.
    fn compute(&self, ends: ComputeEnds, geometry: &TileGeometry) -> Result<usize> {
        let ComputeEnds {
            a_settled,
            a_recycle,
            b_settled,
            b_recycle,
            c_fresh,
            c_completed,
        } = ends;
        let n = geometry.n_stripes();
        let layout = self.config.b_layout;
        let mut tiles = 0;

        for s in 0..n {
            let a = a_settled
                .recv()
                .map_err(|_| EngineError::StreamClosed(Operand::A.name()))?;
            let mut c = c_fresh
                .recv()
                .map_err(|_| EngineError::StreamClosed(Operand::C.name()))?;
            for t in 0..n {
                let b = b_settled
                    .recv()
                    .map_err(|_| EngineError::StreamClosed(Operand::B.name()))?;
                trace!(s, t, a = ?a.half(), b = ?b.half(), c = ?c.half(), "computing tile");
                self.team.multiply_tile(&a, &b, &mut c, geometry, layout, t);
                tiles += 1;
                // RoleB stops listening after its last prefetch.
                let _ = b_recycle.send(b);
            }
            c_completed
                .send(c)
                .map_err(|_| EngineError::StreamClosed(Operand::C.name()))?;
            let _ = a_recycle.send(a);
            debug!(stripe = s, "C stripe complete");
        }
        Ok(tiles)
    }
}

fn join_role(handle: ScopedJoinHandle<'_, Result<usize>>, role: &'static str) -> Result<usize> {
    handle
        .join()
        .unwrap_or(Err(EngineError::WorkerPanicked(role)))
}

/// Pick the error that caused a failed run, skipping peers that only saw a
/// closed stream.
fn first_root_cause(errors: [Option<EngineError>; 4]) -> EngineError {
    let mut secondary = None;
    for e in errors.into_iter().flatten() {
        if !e.is_secondary() {
            return e;
        }
        secondary.get_or_insert(e);
    }
    secondary.unwrap_or(EngineError::WorkerPanicked("pipeline"))
}
