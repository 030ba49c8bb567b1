//! Software-managed local memory.
//!
//! The scratchpad hands out fixed-size typed blocks against a byte budget.
//! A block returns its bytes to the ledger it was reserved from when it is
//! dropped, so every exit path releases local memory.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ELEMENT_SIZE;

/// Byte accounting for one local memory.
#[derive(Debug)]
pub struct Ledger {
    capacity: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest `in_use` value observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let reserved = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.capacity)
            });
        match reserved {
            Ok(prev) => {
                self.peak.fetch_max(prev + bytes, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// A block of local memory holding `len` elements.
pub struct LocalBlock {
    data: Box<[u32]>,
    ledger: Arc<Ledger>,
}

impl LocalBlock {
    /// Reserve `len` elements from `ledger`, or `None` when it is full.
    pub fn reserve(ledger: &Arc<Ledger>, len: usize) -> Option<LocalBlock> {
        let bytes = len.checked_mul(ELEMENT_SIZE)?;
        if !ledger.try_reserve(bytes) {
            return None;
        }
        Some(LocalBlock {
            data: vec![0u32; len].into_boxed_slice(),
            ledger: Arc::clone(ledger),
        })
    }

    pub fn bytes(&self) -> usize {
        self.data.len() * ELEMENT_SIZE
    }
}

impl Deref for LocalBlock {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        &self.data
    }
}

impl DerefMut for LocalBlock {
    fn deref_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }
}

impl Drop for LocalBlock {
    fn drop(&mut self) {
        self.ledger.release(self.bytes());
    }
}

impl fmt::Debug for LocalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBlock")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Local allocator collaborator.
///
/// `alloc` may fail; dropping a returned block is always a valid free.
pub trait LocalAllocator: Send + Sync + fmt::Debug {
    fn alloc(&self, len: usize) -> Option<LocalBlock>;

    fn capacity(&self) -> usize;

    fn in_use(&self) -> usize;
}

/// Bump-style scratchpad backed by a [`Ledger`].
#[derive(Debug, Clone)]
pub struct Scratchpad {
    ledger: Arc<Ledger>,
}

impl Scratchpad {
    pub fn new(capacity: usize) -> Self {
        Self {
            ledger: Arc::new(Ledger::new(capacity)),
        }
    }

    pub fn peak(&self) -> usize {
        self.ledger.peak()
    }
}

impl LocalAllocator for Scratchpad {
    fn alloc(&self, len: usize) -> Option<LocalBlock> {
        LocalBlock::reserve(&self.ledger, len)
    }

    fn capacity(&self) -> usize {
        self.ledger.capacity()
    }

    fn in_use(&self) -> usize {
        self.ledger.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_release() {
        let pad = Scratchpad::new(64);
        let a = pad.alloc(8).unwrap();
        assert_eq!(a.len(), 8);
        assert_eq!(pad.in_use(), 32);
        let b = pad.alloc(8).unwrap();
        assert_eq!(pad.in_use(), 64);
        assert!(pad.alloc(1).is_none());
        drop(a);
        assert_eq!(pad.in_use(), 32);
        drop(b);
        assert_eq!(pad.in_use(), 0);
        assert_eq!(pad.peak(), 64);
    }

    #[test]
    fn test_block_is_zeroed_and_writable() {
        let pad = Scratchpad::new(1024);
        let mut block = pad.alloc(4).unwrap();
        assert_eq!(&block[..], &[0, 0, 0, 0]);
        block[2] = 7;
        assert_eq!(block[2], 7);
    }

    #[test]
    fn test_oversized_request_fails() {
        let pad = Scratchpad::new(16);
        assert!(pad.alloc(5).is_none());
        assert!(pad.alloc(usize::MAX).is_none());
        assert_eq!(pad.in_use(), 0);
    }

    #[test]
    fn test_clones_share_ledger() {
        let pad = Scratchpad::new(32);
        let other = pad.clone();
        let _block = pad.alloc(4).unwrap();
        assert_eq!(other.in_use(), 16);
    }
}
