//! Per-frame metadata.
//!
//! Modeled after Linux's `struct page`: every tracked frame has one [`PhysicalPage`] in the page
//! database. All state is held in atomics so each frame's transitions are individually atomic and
//! no global lock is needed to inspect or update unrelated frames.

use core::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::BackingObjectId;

/// Order value recorded for frames that are not the head of an allocated block.
pub const ORDER_NONE: u8 = 0xFF;

bitflags! {
    /// State bits for a physical frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// The frame is in use (part of an allocated block, a bootstrap allocation, or pinned).
        const ALLOCATED = 1 << 0;
        /// The frame is reserved by firmware or is a hole and must never be allocated.
        const RESERVED = 1 << 1;
        /// The frame holds a page table.
        const PAGE_TABLE = 1 << 2;
        /// The frame is the canonical zero frame.
        const ZERO_PAGE = 1 << 3;
        /// The frame holds content of a backing object.
        const BACKED = 1 << 4;
    }
}

/// Holds metadata for a physical memory frame.
pub struct PhysicalPage {
    flags: AtomicU32,
    /// Block order, only meaningful on the head frame of an allocated block.
    order: AtomicU8,
    /// Number of backing-object references to this frame.
    ref_count: AtomicU32,
    /// Number of page-table entries currently pointing at this frame.
    map_count: AtomicU32,
    /// Owning backing object id, 0 when unowned.
    owner: AtomicU32,
    /// Page offset within the owning backing object.
    offset: AtomicUsize,
}

impl PhysicalPage {
    /// Creates metadata for a free frame.
    pub const fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            order: AtomicU8::new(ORDER_NONE),
            ref_count: AtomicU32::new(0),
            map_count: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            offset: AtomicUsize::new(0),
        }
    }

    /// Creates metadata for a frame that can never be allocated.
    pub const fn reserved() -> Self {
        Self {
            flags: AtomicU32::new(FrameFlags::RESERVED.bits()),
            order: AtomicU8::new(ORDER_NONE),
            ref_count: AtomicU32::new(0),
            map_count: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            offset: AtomicUsize::new(0),
        }
    }

    /// Returns the current flags.
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Sets the given flags atomically, returning the previous flags.
    pub fn insert_flags(&self, flags: FrameFlags) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clears the given flags atomically, returning the previous flags.
    pub fn remove_flags(&self, flags: FrameFlags) -> FrameFlags {
        FrameFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub fn is_allocated(&self) -> bool {
        self.flags().contains(FrameFlags::ALLOCATED)
    }

    pub fn is_reserved(&self) -> bool {
        self.flags().contains(FrameFlags::RESERVED)
    }

    /// Returns true if the frame may be handed out by the allocator.
    pub fn is_free(&self) -> bool {
        !self
            .flags()
            .intersects(FrameFlags::ALLOCATED | FrameFlags::RESERVED)
    }

    /// Marks the frame used. Returns false if it was already used or is reserved.
    pub fn mark_allocated(&self) -> bool {
        let previous = self.insert_flags(FrameFlags::ALLOCATED);
        if previous.contains(FrameFlags::RESERVED) {
            self.remove_flags(FrameFlags::ALLOCATED);
            return false;
        }

        !previous.contains(FrameFlags::ALLOCATED)
    }

    /// Marks the frame free and clears every per-use field. Returns false if it was not in use.
    pub fn mark_free(&self) -> bool {
        let previous = self.remove_flags(
            FrameFlags::ALLOCATED
                | FrameFlags::PAGE_TABLE
                | FrameFlags::ZERO_PAGE
                | FrameFlags::BACKED,
        );
        self.order.store(ORDER_NONE, Ordering::Release);
        self.ref_count.store(0, Ordering::Release);
        self.map_count.store(0, Ordering::Release);
        self.clear_owner();
        previous.contains(FrameFlags::ALLOCATED)
    }

    /// Gets the allocation order for this frame.
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Acquire)
    }

    /// Sets the allocation order for this frame.
    pub fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Release);
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn set_ref_count(&self, count: u32) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Adds one reference, returning the new count.
    pub fn add_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn release_ref(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "frame reference count underflow");
        previous - 1
    }

    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    /// Records one more page-table entry pointing at this frame.
    pub fn map(&self) -> u32 {
        self.map_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Records that one page-table entry pointing at this frame was removed.
    pub fn unmap(&self) -> u32 {
        let previous = self.map_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "frame map count underflow");
        previous - 1
    }

    /// Returns the owning backing object and page offset, if any.
    ///
    /// A frame shared by fork keeps the object that produced it until the last sharer upgrades
    /// it in place, which then takes ownership.
    pub fn owner(&self) -> Option<(BackingObjectId, usize)> {
        let id = BackingObjectId::from_raw(self.owner.load(Ordering::Acquire))?;
        Some((id, self.offset.load(Ordering::Acquire)))
    }

    /// Records the backing object and page offset whose content this frame holds.
    pub fn set_owner(&self, owner: BackingObjectId, offset: usize) {
        self.offset.store(offset, Ordering::Release);
        self.owner.store(owner.as_u32(), Ordering::Release);
        self.insert_flags(FrameFlags::BACKED);
    }

    pub fn clear_owner(&self) {
        self.owner.store(0, Ordering::Release);
        self.offset.store(0, Ordering::Release);
        self.remove_flags(FrameFlags::BACKED);
    }
}

impl Default for PhysicalPage {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("flags", &self.flags())
            .field("order", &self.order())
            .field("ref_count", &self.ref_count())
            .field("map_count", &self.map_count())
            .field("owner", &self.owner())
            .finish()
    }
}
