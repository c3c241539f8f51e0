//! Phase-one physical frame allocator.
//!
//! Before the page database exists nothing can track individual frames, so early boot hands
//! out frames with a bump cursor over the firmware memory map. Frames handed out here are never
//! freed; every consumed range is recorded so the frame allocator can register it as used once
//! the page database has been built. This is modelled after Linux's memblock: fixed-size,
//! statically allocated region arrays so no heap is needed.

use crate::arch::PAGE_SIZE;
use crate::{AllocError, FrameNumber, PhysicalAddress};

/// Maximum number of memory regions that can be tracked per list.
pub const MAX_REGIONS: usize = 128;

/// Represents a single entry in a boot-time memory map.
///
/// Implement this trait on bootloader-specific memory map entry types
/// to feed them into [`BootstrapAllocator::from_memory_map`].
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (reserved, ACPI, device memory, etc.) should return `false`.
    fn is_usable(&self) -> bool;
}

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    /// Creates a new memory region.
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of this region.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.size)
    }

    /// Returns the first frame of this region.
    pub fn first_frame(&self) -> FrameNumber {
        self.base.frame_number()
    }

    /// Returns the number of whole frames in this region.
    pub const fn frame_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Returns true if this region overlaps with another region.
    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() < other.end().as_usize()
            && other.base.as_usize() < self.end().as_usize()
    }

    /// Returns true if this region touches or overlaps another region.
    const fn mergeable(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() <= other.end().as_usize()
            && other.base.as_usize() <= self.end().as_usize()
    }

    /// Returns a new region spanning both regions. The regions must be mergeable.
    const fn merge(&self, other: &MemoryRegion) -> MemoryRegion {
        let base = if self.base.as_usize() < other.base.as_usize() {
            self.base
        } else {
            other.base
        };
        let end = if self.end().as_usize() > other.end().as_usize() {
            self.end()
        } else {
            other.end()
        };
        MemoryRegion::new(base, end.as_usize() - base.as_usize())
    }

    /// Returns true if the frame lies inside this region.
    pub fn contains_frame(&self, frame: FrameNumber) -> bool {
        let start = frame.as_usize() * PAGE_SIZE;
        self.base.as_usize() <= start && start + PAGE_SIZE <= self.end().as_usize()
    }
}

/// Fixed-size, address-ordered array of disjoint memory regions.
#[derive(Debug, Clone)]
pub(crate) struct RegionArray {
    regions: [Option<MemoryRegion>; MAX_REGIONS],
    count: usize,
}

impl RegionArray {
    const fn new() -> Self {
        Self {
            regions: [None; MAX_REGIONS],
            count: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter().filter_map(|r| r.as_ref())
    }

    fn get(&self, index: usize) -> Option<MemoryRegion> {
        self.regions.get(index).copied().flatten()
    }

    /// Inserts a region at the specified index, shifting subsequent regions.
    fn insert(&mut self, index: usize, region: MemoryRegion) -> Result<(), AllocError> {
        if self.count >= MAX_REGIONS || index > self.count {
            return Err(AllocError::RegionsFull);
        }

        self.regions.copy_within(index..self.count, index + 1);
        self.regions[index] = Some(region);
        self.count += 1;
        Ok(())
    }

    /// Removes the region at the specified index, shifting subsequent regions.
    fn remove(&mut self, index: usize) {
        if index >= self.count {
            return;
        }

        self.regions.copy_within(index + 1..self.count, index);
        self.regions[self.count - 1] = None;
        self.count -= 1;
    }

    /// Adds a region, keeping the array sorted and merging touching or overlapping regions.
    fn add(&mut self, region: MemoryRegion) -> Result<(), AllocError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut merged = region;
        let mut index = 0;
        while let Some(existing) = self.get(index) {
            if existing.end() < merged.base() {
                index += 1;
            } else if merged.mergeable(&existing) {
                merged = merged.merge(&existing);
                self.remove(index);
            } else {
                break;
            }
        }

        self.insert(index, merged)
    }

    /// Removes a range from the array, splitting regions that straddle it.
    fn subtract(&mut self, region: MemoryRegion) -> Result<(), AllocError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut index = 0;
        while let Some(existing) = self.get(index) {
            if !existing.overlaps(&region) {
                index += 1;
                continue;
            }

            self.remove(index);

            if existing.base() < region.base() {
                let before =
                    MemoryRegion::new(existing.base(), region.base() - existing.base());
                self.insert(index, before)?;
                index += 1;
            }

            if existing.end() > region.end() {
                let after = MemoryRegion::new(region.end(), existing.end() - region.end());
                self.insert(index, after)?;
                index += 1;
            }
        }

        Ok(())
    }

    fn total_size(&self) -> usize {
        self.iter().map(MemoryRegion::size).sum()
    }
}

/// A bump allocator over the firmware memory map.
///
/// The allocator keeps three lists: usable memory, firmware-reserved memory, and the ranges it
/// has handed out. The cursor only ever moves forward, so frames are handed out in address order.
#[derive(Debug, Clone)]
pub struct BootstrapAllocator {
    usable: RegionArray,
    reserved: RegionArray,
    consumed: RegionArray,
    cursor: usize,
}

impl BootstrapAllocator {
    /// Creates a new empty bootstrap allocator.
    pub const fn new() -> Self {
        Self {
            usable: RegionArray::new(),
            reserved: RegionArray::new(),
            consumed: RegionArray::new(),
            cursor: 0,
        }
    }

    /// Builds a bootstrap allocator from a firmware memory map.
    pub fn from_memory_map<R: BootMemoryRegion>(map: &[R]) -> Result<Self, AllocError> {
        let mut allocator = Self::new();
        for entry in map {
            if entry.is_usable() {
                allocator.add(entry.base(), entry.size())?;
            } else {
                allocator.reserve(entry.base(), entry.size())?;
            }
        }

        Ok(allocator)
    }

    /// Adds a usable memory region.
    ///
    /// The region is shrunk inward to page boundaries. Adjacent or overlapping regions are merged.
    pub fn add(&mut self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        let start = base.as_usize().next_multiple_of(PAGE_SIZE);
        let end = (base.as_usize() + size) & !(PAGE_SIZE - 1);
        if end <= start {
            return Ok(());
        }

        self.usable
            .add(MemoryRegion::new(PhysicalAddress::new(start), end - start))
    }

    /// Reserves a memory region, marking it as unavailable for allocation.
    ///
    /// The region is grown outward to page boundaries. This is used for firmware tables, the
    /// kernel image, and anything else that must never be handed out.
    pub fn reserve(&mut self, base: PhysicalAddress, size: usize) -> Result<(), AllocError> {
        if size == 0 {
            return Ok(());
        }

        let start = base.as_usize() & !(PAGE_SIZE - 1);
        let end = (base.as_usize() + size).next_multiple_of(PAGE_SIZE);
        self.reserved
            .add(MemoryRegion::new(PhysicalAddress::new(start), end - start))
    }

    /// Hands out `count` physically contiguous frames, returning the first one's address.
    ///
    /// Allocation is first-fit above the cursor. The returned frames are not zeroed.
    pub fn allocate_frames(&mut self, count: usize) -> Result<PhysicalAddress, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidAlignment);
        }

        let size = count * PAGE_SIZE;
        let mut found = None;
        'regions: for region in self.usable.iter() {
            let end = region.end().as_usize();
            let mut candidate = region.base().as_usize().max(self.cursor);

            while candidate + size <= end {
                let window = MemoryRegion::new(PhysicalAddress::new(candidate), size);
                match self.reserved.iter().find(|r| r.overlaps(&window)) {
                    Some(reserved) => candidate = reserved.end().as_usize(),
                    None => {
                        found = Some(window);
                        break 'regions;
                    }
                }
            }
        }

        let Some(window) = found else {
            log::error!("bootstrap allocator exhausted allocating {} frames", count);
            return Err(AllocError::OutOfPhysicalMemory);
        };

        self.consumed.add(window)?;
        self.cursor = window.end().as_usize();
        log::trace!(
            "bootstrap: {} frames at {} (cursor now {:#x})",
            count,
            window.base(),
            self.cursor
        );

        Ok(window.base())
    }

    /// Returns the usable memory regions reported by firmware.
    pub fn usable(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.usable.iter()
    }

    /// Returns the reserved memory regions reported by firmware.
    pub fn reserved(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.reserved.iter()
    }

    /// Returns every range handed out by [`allocate_frames`](Self::allocate_frames).
    pub fn consumed(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.consumed.iter()
    }

    /// Returns the range from the lowest to the highest usable address.
    pub fn span(&self) -> Option<MemoryRegion> {
        let first = self.usable.iter().next()?;
        let last = self.usable.iter().last()?;
        Some(MemoryRegion::new(first.base(), last.end() - first.base()))
    }

    /// Returns usable memory that is neither reserved nor consumed.
    pub(crate) fn remaining(&self) -> Result<RegionArray, AllocError> {
        let mut remaining = self.usable.clone();
        for region in self.reserved.iter().chain(self.consumed.iter()) {
            remaining.subtract(*region)?;
        }

        Ok(remaining)
    }

    /// Returns true if the frame lies in a firmware-reserved region.
    pub fn is_reserved(&self, frame: FrameNumber) -> bool {
        self.reserved.iter().any(|r| r.contains_frame(frame))
    }

    /// Returns the total amount of usable memory.
    pub fn total_memory(&self) -> usize {
        self.usable.total_size()
    }

    /// Returns the total amount of memory handed out so far.
    pub fn consumed_memory(&self) -> usize {
        self.consumed.total_size()
    }
}

impl Default for BootstrapAllocator {
    fn default() -> Self {
        Self::new()
    }
}
