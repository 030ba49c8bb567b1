use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::config::ELEMENT_SIZE;
use crate::error::{EngineError, Result};
use crate::planner::TileGeometry;
use crate::scratchpad::{LocalAllocator, LocalBlock};

/// One of the three streamed matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    A,
    B,
    C,
}

impl Operand {
    pub fn name(&self) -> &'static str {
        match self {
            Operand::A => "A",
            Operand::B => "B",
            Operand::C => "C",
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which half of a double buffer a slot is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    Ping,
    Pong,
}

impl Half {
    pub fn flip(self) -> Half {
        match self {
            Half::Ping => Half::Pong,
            Half::Pong => Half::Ping,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Half::Ping => 0,
            Half::Pong => 1,
        }
    }
}

/// A typed scratchpad slot, addressed by operand and ping-pong half.
///
/// Whoever holds the `Slot` value owns the buffer: a transfer job while it
/// is in flight, the compute step while it is settled.
pub struct Slot {
    operand: Operand,
    half: Half,
    block: LocalBlock,
}

impl Slot {
    pub fn operand(&self) -> Operand {
        self.operand
    }

    pub fn half(&self) -> Half {
        self.half
    }
}

impl Deref for Slot {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        &self.block
    }
}

impl DerefMut for Slot {
    fn deref_mut(&mut self) -> &mut [u32] {
        &mut self.block
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("operand", &self.operand)
            .field("half", &self.half)
            .field("len", &self.block.len())
            .finish()
    }
}

/// Both halves of one operand's double buffer.
#[derive(Debug)]
pub struct SlotPair {
    pub ping: Slot,
    pub pong: Slot,
}

/// The six stripe buffers of one pipeline run.
#[derive(Debug)]
pub struct BufferPool {
    pub a: SlotPair,
    pub b: SlotPair,
    pub c: SlotPair,
}

impl BufferPool {
    /// Allocate both halves for A, B and C.
    ///
    /// If any allocation fails the slots acquired so far are dropped, which
    /// returns them to the allocator, before the error is reported.
    pub fn acquire(alloc: &dyn LocalAllocator, geometry: &TileGeometry) -> Result<Self> {
        let a = Self::acquire_pair(alloc, Operand::A, geometry.operand_stripe_len())?;
        let b = Self::acquire_pair(alloc, Operand::B, geometry.operand_stripe_len())?;
        let c = Self::acquire_pair(alloc, Operand::C, geometry.result_stripe_len())?;
        debug!(
            bytes = geometry.pool_bytes(ELEMENT_SIZE),
            in_use = alloc.in_use(),
            capacity = alloc.capacity(),
            "acquired stripe buffers"
        );
        Ok(BufferPool { a, b, c })
    }

    fn acquire_pair(alloc: &dyn LocalAllocator, operand: Operand, len: usize) -> Result<SlotPair> {
        let ping = acquire_slot(alloc, operand, Half::Ping, len)?;
        let pong = acquire_slot(alloc, operand, Half::Pong, len)?;
        Ok(SlotPair { ping, pong })
    }
}

/// Allocate a single slot outside of a double buffer.
pub fn acquire_slot(
    alloc: &dyn LocalAllocator,
    operand: Operand,
    half: Half,
    len: usize,
) -> Result<Slot> {
    match alloc.alloc(len) {
        Some(block) => Ok(Slot {
            operand,
            half,
            block,
        }),
        None => {
            let bytes = len.saturating_mul(ELEMENT_SIZE);
            warn!(%operand, ?half, bytes, "local allocation failed");
            Err(EngineError::OutOfLocalMemory {
                operand,
                bytes,
                in_use: alloc.in_use(),
                capacity: alloc.capacity(),
            })
        }
    }
}
