//! Phase-two physical frame allocator.
//!
//! Frames are grouped into power-of-two block sizes, orders 0 through [`MAX_ORDER`], where order
//! n holds blocks of 2^n contiguous frames. Allocation pops from the requested order, splitting a
//! larger block when that list is empty. Freed blocks go back onto their own order's list; blocks
//! are never merged with their buddies, so fragmentation can grow over many split/free cycles.
//!
//! The free lists are intrusive: the link to the next free block is written into the free frame
//! itself through the direct map. The lists sit behind one short-held spin lock, while each frame's
//! state lives in the page database and changes atomically.

use core::ptr;

use thiserror::Error;

use crate::arch::PAGE_SIZE;
use crate::bootstrap::BootstrapAllocator;
use crate::{FrameFlags, FrameNumber, PageDatabase, PhysicalAddress, PhysicalPage};

/// Largest block order (order 11 = 2048 frames).
pub const MAX_ORDER: usize = 11;

/// Number of free lists (orders 0 through MAX_ORDER inclusive).
const NUM_FREE_LISTS: usize = MAX_ORDER + 1;

/// Errors that can occur during physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Every free list for the requested and larger orders is empty.
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    /// The requested order exceeds MAX_ORDER.
    #[error("block order too large")]
    OrderTooLarge,
    /// A size, count or address does not meet the required alignment.
    #[error("invalid alignment")]
    InvalidAlignment,
    /// Attempted to free an untracked, reserved or already free frame, or with the wrong order.
    #[error("invalid deallocation")]
    InvalidDeallocation,
    /// The bootstrap region arrays are full.
    #[error("bootstrap region table is full")]
    RegionsFull,
}

/// Link written into the first frame of every free block.
#[repr(C)]
struct FreeBlock {
    next: Option<FrameNumber>,
}

/// Free list for a specific order.
#[derive(Clone, Copy)]
struct FreeList {
    head: Option<FrameNumber>,
    count: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }
}

/// All free lists; only reachable through the allocator's lock.
struct FreeLists {
    lists: [FreeList; NUM_FREE_LISTS],
}

impl FreeLists {
    const fn new() -> Self {
        Self {
            lists: [FreeList::new(); NUM_FREE_LISTS],
        }
    }

    fn push(&mut self, frame: FrameNumber, order: usize) {
        let list = &mut self.lists[order];
        let block: *mut FreeBlock = frame.start().direct_mapped_ptr();
        // SAFETY: The frame is free and owned by the allocator, so its memory is ours to use.
        unsafe { block.write(FreeBlock { next: list.head }) };
        list.head = Some(frame);
        list.count += 1;
    }

    fn pop(&mut self, order: usize) -> Option<FrameNumber> {
        let list = &mut self.lists[order];
        let frame = list.head?;
        let block: *const FreeBlock = frame.start().direct_mapped_ptr();
        // SAFETY: Every frame on a free list had a link written by `push`.
        list.head = unsafe { block.read() }.next;
        list.count -= 1;
        Some(frame)
    }

    /// Finds the lowest order with available blocks that can satisfy the request.
    fn find_free_order(&self, min_order: usize) -> Option<usize> {
        (min_order..NUM_FREE_LISTS).find(|&order| self.lists[order].count > 0)
    }

    fn free_frames(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.count << order)
            .sum()
    }
}

/// The physical frame allocator.
///
/// Owns the page database and the free lists. Besides block allocation it tracks frame reference
/// counts for backing objects and provides the canonical zero frame.
pub struct FrameAllocator {
    database: PageDatabase,
    free: spin::Mutex<FreeLists>,
    zero_frame: FrameNumber,
    total_frames: usize,
}

impl FrameAllocator {
    /// Transitions from the bootstrap allocator to the frame allocator.
    ///
    /// Builds the page database in bootstrap frames, registers every frame the bootstrap
    /// allocator handed out as used, seeds the free lists with the remaining usable memory in the
    /// largest naturally aligned blocks, and allocates the zero frame.
    pub fn bootstrap(mut boot: BootstrapAllocator) -> Result<Self, AllocError> {
        let database = PageDatabase::build(&mut boot)?;
        let remaining = boot.remaining()?;

        let total_frames = database.pages().iter().filter(|p| !p.is_reserved()).count();
        let mut free = FreeLists::new();
        for region in remaining.iter() {
            let mut frame = region.first_frame();
            let mut left = region.frame_count();
            while left > 0 {
                let order = frame.largest_block_order(left).min(MAX_ORDER);
                free.push(frame, order);
                frame = frame + (1 << order);
                left -= 1 << order;
            }
        }

        let mut allocator = Self {
            database,
            free: spin::Mutex::new(free),
            zero_frame: FrameNumber::new(0),
            total_frames,
        };

        let zero_frame = allocator.allocate_frame()?;
        if let Some(page) = allocator.page(zero_frame) {
            page.insert_flags(FrameFlags::ZERO_PAGE);
        }
        allocator.zero_frame = zero_frame;

        log::info!(
            "frame allocator: {} frames tracked, {} used at boot, {} free in {} regions",
            allocator.total_frames,
            allocator.used_frames(),
            allocator.free_frames(),
            remaining.len()
        );

        Ok(allocator)
    }

    /// Allocates 2^order contiguous frames.
    ///
    /// If the requested order is empty, the smallest larger block is split and the upper halves
    /// are pushed onto the lower lists. The frames are not zeroed.
    pub fn allocate(&self, order: usize) -> Result<PhysicalAddress, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }

        let frame = {
            let mut free = self.free.lock();
            let found = free
                .find_free_order(order)
                .ok_or(AllocError::OutOfPhysicalMemory)?;
            let frame = free.pop(found).ok_or(AllocError::OutOfPhysicalMemory)?;
            for split in (order..found).rev() {
                free.push(frame + (1 << split), split);
            }
            frame
        };

        for i in 0..1usize << order {
            let page = self.tracked(frame + i)?;
            if !page.mark_allocated() {
                log::error!("frame {} on a free list was already in use", frame + i);
                panic!("frame allocator free list corrupted");
            }
        }
        self.tracked(frame)?.set_order(order as u8);

        log::trace!("allocate: order {} at {}", order, frame.start());
        Ok(frame.start())
    }

    /// Returns 2^order frames starting at `base` to the free list of that order.
    ///
    /// Freed blocks are not merged with their buddies.
    pub fn free(&self, base: PhysicalAddress, order: usize) -> Result<(), AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }
        if !base.is_aligned(PAGE_SIZE << order) {
            return Err(AllocError::InvalidAlignment);
        }

        let frame = base.frame_number();
        if frame == self.zero_frame {
            log::error!("free: attempt to free the zero frame");
            return Err(AllocError::InvalidDeallocation);
        }

        let head = self.tracked(frame)?;
        if head.order() as usize != order {
            log::error!(
                "free: {} freed with order {} but allocated with order {}",
                base,
                order,
                head.order()
            );
            return Err(AllocError::InvalidDeallocation);
        }
        if !head.mark_free() {
            log::error!("free: {} is not allocated", base);
            return Err(AllocError::InvalidDeallocation);
        }
        for i in 1..1usize << order {
            self.tracked(frame + i)?.mark_free();
        }

        self.free.lock().push(frame, order);
        log::trace!("free: order {} at {}", order, base);
        Ok(())
    }

    /// Allocates one zeroed frame with a reference count of one.
    pub fn allocate_frame(&self) -> Result<FrameNumber, AllocError> {
        let frame = self.allocate(0)?.frame_number();
        self.zero(frame);
        self.tracked(frame)?.set_ref_count(1);
        Ok(frame)
    }

    /// Adds a reference to an allocated frame, returning the new count.
    pub fn share(&self, frame: FrameNumber) -> Result<u32, AllocError> {
        let page = self.tracked(frame)?;
        if !page.is_allocated() {
            return Err(AllocError::InvalidDeallocation);
        }
        Ok(page.add_ref())
    }

    /// Drops a reference to a frame. The frame returns to the allocator when the count reaches
    /// zero, in which case `true` is returned.
    ///
    /// The zero frame holds one permanent reference of its own and is never freed.
    pub fn release(&self, frame: FrameNumber) -> Result<bool, AllocError> {
        let page = self.tracked(frame)?;
        if !page.is_allocated() || page.ref_count() == 0 {
            log::error!("release: frame {} holds no references", frame);
            return Err(AllocError::InvalidDeallocation);
        }

        if page.release_ref() > 0 {
            return Ok(false);
        }

        self.free(frame.start(), 0)?;
        Ok(true)
    }

    /// Returns the canonical zero frame.
    pub fn zero_frame(&self) -> FrameNumber {
        self.zero_frame
    }

    pub fn is_zero_frame(&self, frame: FrameNumber) -> bool {
        frame == self.zero_frame
    }

    /// Returns the metadata for `frame`.
    pub fn page(&self, frame: FrameNumber) -> Option<&PhysicalPage> {
        self.database.page(frame)
    }

    pub fn database(&self) -> &PageDatabase {
        &self.database
    }

    /// Returns the reference count of `frame`, or zero if it is untracked.
    pub fn ref_count(&self, frame: FrameNumber) -> u32 {
        self.page(frame).map_or(0, PhysicalPage::ref_count)
    }

    /// Fills a frame with zeroes.
    pub fn zero(&self, frame: FrameNumber) {
        // SAFETY: The caller owns the frame; it is PAGE_SIZE bytes in the direct map.
        unsafe { ptr::write_bytes(frame.start().direct_mapped_ptr::<u8>(), 0, PAGE_SIZE) };
    }

    /// Copies the content of one frame to another.
    pub fn copy(&self, from: FrameNumber, to: FrameNumber) {
        let src: *const u8 = from.start().direct_mapped_ptr();
        let dst: *mut u8 = to.start().direct_mapped_ptr();
        // SAFETY: Distinct frames never overlap and both are PAGE_SIZE bytes in the direct map.
        unsafe { ptr::copy_nonoverlapping(src, dst, PAGE_SIZE) };
    }

    /// Returns the content of a frame as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure nothing writes the frame while the slice is alive.
    pub unsafe fn frame_bytes(&self, frame: FrameNumber) -> &[u8] {
        // SAFETY: Upheld by the caller.
        unsafe { core::slice::from_raw_parts(frame.start().direct_mapped_ptr(), PAGE_SIZE) }
    }

    /// Returns the content of a frame as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the frame while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_bytes_mut(&self, frame: FrameNumber) -> &mut [u8] {
        // SAFETY: Upheld by the caller.
        unsafe { core::slice::from_raw_parts_mut(frame.start().direct_mapped_ptr(), PAGE_SIZE) }
    }

    /// Returns the number of usable frames tracked by this allocator.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of free frames across all orders.
    pub fn free_frames(&self) -> usize {
        self.free.lock().free_frames()
    }

    /// Returns the number of free blocks at a specific order.
    pub fn free_blocks_at_order(&self, order: usize) -> usize {
        if order > MAX_ORDER {
            return 0;
        }
        self.free.lock().lists[order].count
    }

    /// Returns the number of frames marked used in the page database.
    pub fn used_frames(&self) -> usize {
        self.database
            .pages()
            .iter()
            .filter(|p| p.is_allocated())
            .count()
    }

    fn tracked(&self, frame: FrameNumber) -> Result<&PhysicalPage, AllocError> {
        match self.database.page(frame) {
            Some(page) if !page.is_reserved() => Ok(page),
            _ => {
                log::error!("frame {} is not tracked by the allocator", frame);
                Err(AllocError::InvalidDeallocation)
            }
        }
    }
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("database", &self.database)
            .field("zero_frame", &self.zero_frame)
            .field("total_frames", &self.total_frames)
            .finish()
    }
}
