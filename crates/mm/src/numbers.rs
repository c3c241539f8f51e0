//! Physical frame numbers.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PhysicalAddress, arch};

/// The index of a `PAGE_SIZE` frame of physical memory; frame `n` starts at `n * PAGE_SIZE`.
///
/// Frames are what the allocator hands out, what the page database is indexed by and what
/// backing objects hold, so the type is kept separate from raw addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Returns the physical address one past the end of this frame.
    #[inline]
    pub const fn end(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 + 1) * arch::PAGE_SIZE)
    }

    /// Returns the largest order of a naturally aligned block that starts at this frame and fits
    /// in `available` frames.
    ///
    /// # Panics
    /// Panics if `available` is zero.
    #[inline]
    pub fn largest_block_order(self, available: usize) -> usize {
        assert!(available > 0, "no frames available for a block");
        let fits = available.ilog2() as usize;
        match self.0 {
            // Frame zero is aligned to every order.
            0 => fits,
            n => (n.trailing_zeros() as usize).min(fits),
        }
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    /// Returns the frame containing `addr`.
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, frames: usize) -> Self {
        Self(self.0 + frames)
    }
}

impl Sub<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn sub(self, frames: usize) -> Self {
        Self(self.0 - frames)
    }
}

impl Sub for FrameNumber {
    type Output = usize;

    /// Returns the number of frames between two frame numbers.
    #[inline]
    fn sub(self, other: Self) -> usize {
        self.0 - other.0
    }
}
