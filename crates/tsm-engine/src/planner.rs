use tracing::debug;

use crate::error::{EngineError, Result};

/// Stripe layout shared by every role of one pipeline run.
///
/// A is `[height, width]`, B is `[width, height]` and C is `[height, height]`.
/// A and C are cut into `n_stripes` row stripes, B into `n_stripes` column
/// stripes, each `stripe_height` wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    width: usize,
    height: usize,
    stripe_height: usize,
    n_stripes: usize,
}

impl TileGeometry {
    /// Plan the stripe height for an `n x n` multiply.
    ///
    /// Starts at `n / 2` and halves until one stripe fits in half of
    /// `budget` bytes, so both halves of a double buffer fit. `n` shrinks to
    /// the largest multiple of the chosen stripe height.
    pub fn plan(n: usize, element_size: usize, budget: usize, min_stripe_height: usize) -> Result<Self> {
        let capacity_error = || EngineError::Capacity {
            n,
            budget,
            min_stripe_height,
        };
        if element_size == 0 || min_stripe_height == 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "element_size={} min_stripe_height={} must be > 0",
                element_size, min_stripe_height
            )));
        }

        let row_bytes = n.checked_mul(element_size).ok_or_else(capacity_error)?;
        let mut stripe_height = n / 2;
        while stripe_height >= min_stripe_height {
            match stripe_height
                .checked_mul(row_bytes)
                .and_then(|bytes| bytes.checked_mul(2))
            {
                Some(pair_bytes) if pair_bytes < budget => break,
                _ => stripe_height /= 2,
            }
        }
        if stripe_height < min_stripe_height || stripe_height == 0 {
            return Err(capacity_error());
        }

        let n_stripes = n / stripe_height;
        let adjusted = n_stripes * stripe_height;
        debug!(
            n,
            adjusted,
            stripe_height,
            n_stripes,
            budget,
            "planned tile geometry"
        );
        Ok(TileGeometry {
            width: adjusted,
            height: adjusted,
            stripe_height,
            n_stripes,
        })
    }

    /// Validate an explicitly supplied geometry.
    pub fn from_parts(width: usize, height: usize, stripe_height: usize) -> Result<Self> {
        if width == 0 || height == 0 || stripe_height == 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "width={} height={} stripe_height={} must all be > 0",
                width, height, stripe_height
            )));
        }
        if height % stripe_height != 0 {
            return Err(EngineError::InvalidGeometry(format!(
                "stripe_height={} does not divide height={}",
                stripe_height, height
            )));
        }
        Ok(TileGeometry {
            width,
            height,
            stripe_height,
            n_stripes: height / stripe_height,
        })
    }

    /// Shared (inner) dimension.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows of A and C, columns of B and C.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn stripe_height(&self) -> usize {
        self.stripe_height
    }

    pub fn n_stripes(&self) -> usize {
        self.n_stripes
    }

    /// Elements in one A or B stripe.
    pub fn operand_stripe_len(&self) -> usize {
        self.stripe_height * self.width
    }

    /// Elements in one C stripe.
    pub fn result_stripe_len(&self) -> usize {
        self.stripe_height * self.height
    }

    pub fn a_len(&self) -> usize {
        self.height * self.width
    }

    pub fn b_len(&self) -> usize {
        self.width * self.height
    }

    pub fn c_len(&self) -> usize {
        self.height * self.height
    }

    /// Bytes needed by the largest operand's buffer pair.
    pub fn pair_bytes(&self, element_size: usize) -> usize {
        2 * self.stripe_height * self.width.max(self.height) * element_size
    }

    /// Bytes needed for all six stripe buffers.
    pub fn pool_bytes(&self, element_size: usize) -> usize {
        2 * (2 * self.operand_stripe_len() + self.result_stripe_len()) * element_size
    }

    /// Tiles computed by one full run.
    pub fn tile_count(&self) -> usize {
        self.n_stripes * self.n_stripes
    }
}
