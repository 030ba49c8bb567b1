//! Far (main) memory as seen by the compute domain.
//!
//! A [`FarBuffer`] is shared between the host, the transfer engine and the
//! compute domain. Element accesses are relaxed atomics; ordering between a
//! copy and its consumer comes from the transfer job's completion handshake.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A shared, fixed-length far-memory buffer of `u32` elements.
#[derive(Debug, Clone)]
pub struct FarBuffer {
    id: u64,
    cells: Arc<[AtomicU32]>,
}

impl FarBuffer {
    /// Map host data into far memory.
    pub fn from_slice(data: &[u32]) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            cells: data.iter().map(|&v| AtomicU32::new(v)).collect(),
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            cells: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Process-unique identity, used as the address-space key for page
    /// translation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn load(&self, index: usize) -> Option<u32> {
        self.cells.get(index).map(|c| c.load(Ordering::Relaxed))
    }

    pub fn store(&self, index: usize, value: u32) -> Option<()> {
        self.cells
            .get(index)
            .map(|c| c.store(value, Ordering::Relaxed))
    }

    /// Map far data back into host memory.
    pub fn copy_to_slice(&self, dst: &mut [u32]) -> Result<()> {
        if dst.len() != self.len() {
            return Err(EngineError::InvalidGeometry(format!(
                "far buffer holds {} elements but destination has {}",
                self.len(),
                dst.len()
            )));
        }
        for (d, c) in dst.iter_mut().zip(self.cells.iter()) {
            *d = c.load(Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn fill(&self, value: u32) {
        for c in self.cells.iter() {
            c.store(value, Ordering::Relaxed);
        }
    }
}

/// A 2D window into a far buffer: `rows` runs of `row_len` elements, each
/// run starting `stride` elements after the previous one.
#[derive(Debug, Clone)]
pub struct FarRegion {
    buffer: FarBuffer,
    offset: usize,
    rows: usize,
    row_len: usize,
    stride: usize,
}

impl FarRegion {
    /// A contiguous run of `len` elements.
    pub fn contiguous(buffer: &FarBuffer, offset: usize, len: usize) -> Result<Self> {
        Self::strided(buffer, offset, 1, len, len)
    }

    pub fn strided(
        buffer: &FarBuffer,
        offset: usize,
        rows: usize,
        row_len: usize,
        stride: usize,
    ) -> Result<Self> {
        let out_of_bounds = || {
            EngineError::InvalidGeometry(format!(
                "region offset={} rows={} row_len={} stride={} exceeds far buffer of {} elements",
                offset,
                rows,
                row_len,
                stride,
                buffer.len()
            ))
        };
        if rows > 1 && stride < row_len {
            return Err(EngineError::InvalidGeometry(format!(
                "stride={} is shorter than row_len={}",
                stride, row_len
            )));
        }
        let end = match rows {
            0 => offset,
            _ => (rows - 1)
                .checked_mul(stride)
                .and_then(|v| v.checked_add(offset))
                .and_then(|v| v.checked_add(row_len))
                .ok_or_else(out_of_bounds)?,
        };
        if end > buffer.len() {
            return Err(out_of_bounds());
        }
        Ok(Self {
            buffer: buffer.clone(),
            offset,
            rows,
            row_len,
            stride,
        })
    }

    pub fn buffer(&self) -> &FarBuffer {
        &self.buffer
    }

    /// Number of elements covered by the region.
    pub fn len(&self) -> usize {
        self.rows * self.row_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element ranges `[start, end)` of each run, in order.
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows).map(move |r| {
            let start = self.offset + r * self.stride;
            (start, start + self.row_len)
        })
    }

    /// Gather the region into `dst`, packing runs back to back.
    pub fn read_into(&self, dst: &mut [u32]) -> Result<()> {
        self.check_len(dst.len())?;
        let cells = &self.buffer.cells;
        for (run, (start, end)) in self.runs().enumerate() {
            let out = &mut dst[run * self.row_len..(run + 1) * self.row_len];
            for (d, c) in out.iter_mut().zip(cells[start..end].iter()) {
                *d = c.load(Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Scatter `src` into the region, one run of `row_len` at a time.
    pub fn write_from(&self, src: &[u32]) -> Result<()> {
        self.check_len(src.len())?;
        let cells = &self.buffer.cells;
        for (run, (start, end)) in self.runs().enumerate() {
            let input = &src[run * self.row_len..(run + 1) * self.row_len];
            for (c, &v) in cells[start..end].iter().zip(input.iter()) {
                c.store(v, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn check_len(&self, local: usize) -> Result<()> {
        if local != self.len() {
            return Err(EngineError::InvalidGeometry(format!(
                "local buffer holds {} elements but far region covers {}",
                local,
                self.len()
            )));
        }
        Ok(())
    }
}
