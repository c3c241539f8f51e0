//! Flat physical page database.
//!
//! The database holds one [`PhysicalPage`] for every frame between the lowest and highest usable
//! address in the firmware memory map. It is self-hosting: its storage comes from the bootstrap
//! allocator and it describes the very frames it lives in. Building it is an explicit two-phase
//! process:
//!
//! 1. [`PageDatabaseBuilder::carve`] takes raw storage from the bootstrap allocator.
//! 2. [`PageDatabaseBuilder::construct`] writes every entry in place through the direct map.
//!
//! Afterwards [`PageDatabase::register_consumed`] retroactively marks every bootstrap allocation
//! (the database's own storage included) as used.

use core::ptr::NonNull;

use crate::arch::PAGE_SIZE;
use crate::bootstrap::{BootstrapAllocator, MemoryRegion};
use crate::{AllocError, FrameNumber, PhysicalAddress, PhysicalPage};

/// Table of per-frame metadata, indexed by frame number.
///
/// The size is fixed when the table is built and it is never reallocated.
pub struct PageDatabase {
    first: FrameNumber,
    pages: NonNull<PhysicalPage>,
    len: usize,
    storage: MemoryRegion,
}

// SAFETY: The table lives in frames that are never freed, and every entry is made of atomics.
unsafe impl Send for PageDatabase {}
unsafe impl Sync for PageDatabase {}

impl PageDatabase {
    /// Builds the database from the bootstrap allocator's memory map.
    pub fn build(boot: &mut BootstrapAllocator) -> Result<Self, AllocError> {
        let builder = PageDatabaseBuilder::carve(boot)?;
        let database = builder.construct(boot);
        database.register_consumed(boot);
        Ok(database)
    }

    /// Returns the metadata for the frame containing `address`.
    pub fn lookup(&self, address: PhysicalAddress) -> Option<&PhysicalPage> {
        self.page(address.frame_number())
    }

    /// Returns the metadata for `frame`, or `None` if the frame is outside the table.
    pub fn page(&self, frame: FrameNumber) -> Option<&PhysicalPage> {
        let index = frame.as_usize().checked_sub(self.first.as_usize())?;
        self.pages().get(index)
    }

    /// Returns every entry in frame order.
    pub fn pages(&self) -> &[PhysicalPage] {
        // SAFETY: `construct` initialized `len` entries at `pages`, and the storage is never freed.
        unsafe { core::slice::from_raw_parts(self.pages.as_ptr(), self.len) }
    }

    /// Iterates over every tracked frame with its metadata.
    pub fn frames(&self) -> impl Iterator<Item = (FrameNumber, &PhysicalPage)> {
        let first = self.first;
        self.pages()
            .iter()
            .enumerate()
            .map(move |(i, page)| (first + i, page))
    }

    /// Returns the first tracked frame.
    pub fn first_frame(&self) -> FrameNumber {
        self.first
    }

    /// Returns the number of tracked frames.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the frames the table itself is stored in.
    pub fn storage(&self) -> MemoryRegion {
        self.storage
    }

    /// Marks every bootstrap allocation as used, returning the number of frames registered.
    ///
    /// # Panics
    ///
    /// Panics if a consumed frame is untracked or already registered. Bootstrap allocations are
    /// disjoint and inside usable memory, so either case means the bootstrap state is corrupt.
    pub fn register_consumed(&self, boot: &BootstrapAllocator) -> usize {
        let mut registered = 0;
        for region in boot.consumed() {
            let first = region.first_frame();
            for frame in (0..region.frame_count()).map(|i| first + i) {
                let Some(page) = self.page(frame) else {
                    panic!("bootstrap frame {} is outside the page database", frame);
                };
                assert!(
                    page.mark_allocated(),
                    "bootstrap frame {} registered twice",
                    frame
                );
                registered += 1;
            }
        }

        log::trace!("page database: registered {} bootstrap frames", registered);
        registered
    }
}

impl core::fmt::Debug for PageDatabase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDatabase")
            .field("first", &self.first)
            .field("len", &self.len)
            .field("storage", &self.storage)
            .finish()
    }
}

/// The first phase of building a [`PageDatabase`]: storage carved, entries not yet written.
pub struct PageDatabaseBuilder {
    span: MemoryRegion,
    storage: MemoryRegion,
}

impl PageDatabaseBuilder {
    /// Sizes the table from the usable span and takes its storage from the bootstrap allocator.
    pub fn carve(boot: &mut BootstrapAllocator) -> Result<Self, AllocError> {
        let span = boot.span().ok_or(AllocError::OutOfPhysicalMemory)?;
        let bytes = span.frame_count() * size_of::<PhysicalPage>();
        let frames = bytes.div_ceil(PAGE_SIZE);
        let base = boot.allocate_frames(frames)?;

        log::debug!(
            "page database: {} entries for {} in {} frames at {}",
            span.frame_count(),
            span.base(),
            frames,
            base
        );

        Ok(Self {
            span,
            storage: MemoryRegion::new(base, frames * PAGE_SIZE),
        })
    }

    /// Writes every entry in place. Frames that are not usable (holes and reserved ranges) are
    /// recorded as reserved.
    pub fn construct(self, boot: &BootstrapAllocator) -> PageDatabase {
        let first = self.span.first_frame();
        let len = self.span.frame_count();
        let base: *mut PhysicalPage = self.storage.base().direct_mapped_ptr();

        for i in 0..len {
            let frame = first + i;
            let usable = boot.usable().any(|r| r.contains_frame(frame)) && !boot.is_reserved(frame);
            let page = if usable {
                PhysicalPage::new()
            } else {
                PhysicalPage::reserved()
            };

            // SAFETY: The storage holds at least `len` entries and is exclusively ours.
            unsafe { base.add(i).write(page) };
        }

        PageDatabase {
            first,
            // SAFETY: The direct map never yields a null pointer for carved storage.
            pages: unsafe { NonNull::new_unchecked(base) },
            len,
            storage: self.storage,
        }
    }
}
