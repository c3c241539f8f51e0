//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns a tree of architecture-specific
//! `PageTable`s stored in frames from the frame allocator, and provides operations for mapping,
//! unmapping and inspecting virtual addresses.

use crate::{
    AllocError, FrameAllocator, FrameFlags, FrameNumber, PhysicalAddress, VirtualAddress,
    arch::{self, PageEntry, PageFlags, PageTable},
};

/// An architecture-independent page table manager.
///
/// The directory owns the root table and every intermediate table below it, but not the frames
/// that leaf entries point at; those belong to backing objects.
#[derive(Debug)]
pub struct PageDirectory {
    root: FrameNumber,
}

impl PageDirectory {
    /// Creates a page directory with an empty root table.
    pub fn new(frames: &FrameAllocator) -> Result<Self, AllocError> {
        Ok(Self {
            root: Self::allocate_table(frames)?,
        })
    }

    /// Returns the frame holding the root table.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Maps a virtual page to a physical frame with the given flags.
    ///
    /// Intermediate tables are allocated as needed. Returns the entry that was replaced, if the
    /// page was already mapped.
    ///
    /// # Panics
    /// Panics if either address is not page-aligned.
    pub fn map(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<Option<PageEntry>, AllocError> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let entry = self.walk_or_create(frames, virt)?;
        let previous = entry.is_present().then_some(*entry);
        let mut new_flags = flags;
        new_flags.set_present(true);
        *entry = PageEntry::new(phys, new_flags);

        log::trace!("map {} -> {}", virt, phys);
        Ok(previous)
    }

    /// Unmaps a virtual page, returning the physical address it was mapped to.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let entry = self.walk(virt)?;
        let phys = entry.address()?;
        entry.clear();

        log::trace!("unmap {} (was {})", virt, phys);
        Some(phys)
    }

    /// Returns the leaf entry for a virtual address, if one is present.
    pub fn entry(&self, virt: VirtualAddress) -> Option<PageEntry> {
        let mut table = self.table(self.root);
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let next = table.entry(virt.page_index(level)).address()?;
            table = self.table(next.frame_number());
        }

        let entry = table.entry(virt.page_index(0));
        entry.is_present().then_some(entry)
    }

    /// Translates a virtual address to the physical address it is mapped to.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.entry(virt)?.address()?;
        Some(frame + virt.page_offset())
    }

    /// Replaces the flags of a present leaf entry, returning the previous entry.
    pub fn update_flags(&mut self, virt: VirtualAddress, flags: PageFlags) -> Option<PageEntry> {
        let entry = self.walk(virt)?;
        if !entry.is_present() {
            return None;
        }

        let previous = *entry;
        let mut new_flags = flags;
        new_flags.set_present(true);
        entry.set_flags(new_flags);
        Some(previous)
    }

    /// Frees every table frame of this directory. Leaf frames are left alone.
    pub fn release(mut self, frames: &FrameAllocator) {
        // SAFETY: The directory is consumed.
        unsafe { self.release_tables(frames) };
    }

    /// Frees every table frame in place, for owners that cannot give the directory up by value.
    ///
    /// # Safety
    ///
    /// The directory must not be used afterwards.
    pub(crate) unsafe fn release_tables(&mut self, frames: &FrameAllocator) {
        self.release_table(frames, self.root, arch::PAGE_TABLE_LEVELS - 1);
    }

    /// Returns the number of frames used by tables in this directory.
    pub fn table_frames(&self) -> usize {
        self.count_tables(self.root, arch::PAGE_TABLE_LEVELS - 1)
    }

    fn allocate_table(frames: &FrameAllocator) -> Result<FrameNumber, AllocError> {
        // A zeroed frame is an empty table.
        let frame = frames.allocate_frame()?;
        if let Some(page) = frames.page(frame) {
            page.insert_flags(FrameFlags::PAGE_TABLE);
        }
        Ok(frame)
    }

    fn table(&self, frame: FrameNumber) -> &PageTable {
        // SAFETY: Frames reached from the root were allocated as tables by this directory.
        unsafe { &*frame.start().direct_mapped_ptr::<PageTable>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, frame: FrameNumber) -> &mut PageTable {
        // SAFETY: As for `table`; callers hold `&mut self`, so no other borrow is live.
        unsafe { &mut *frame.start().direct_mapped_ptr::<PageTable>() }
    }

    /// Walks the page table hierarchy to find the leaf entry for a virtual address.
    ///
    /// Returns None if any intermediate table is not present.
    fn walk(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let next = self.table(table).entry(virt.page_index(level)).address()?;
            table = next.frame_number();
        }

        Some(self.table_mut(table).entry_mut(virt.page_index(0)))
    }

    /// Walks the page table hierarchy, creating intermediate tables as needed.
    fn walk_or_create(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtualAddress,
    ) -> Result<&mut PageEntry, AllocError> {
        let mut table = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = self.table_mut(table).entry_mut(virt.page_index(level));
            if !entry.is_present() {
                let child = Self::allocate_table(frames)?;
                // Intermediate entries are permissive; the leaf decides.
                let mut flags = PageFlags::empty();
                flags.set_present(true);
                flags.set_writable(true);
                flags.set_user(true);
                *entry = PageEntry::new(child.start(), flags);
            }

            table = match entry.address() {
                Some(next) => next.frame_number(),
                None => unreachable!("intermediate entry was just made present"),
            };
        }

        Ok(self.table_mut(table).entry_mut(virt.page_index(0)))
    }

    fn release_table(&self, frames: &FrameAllocator, frame: FrameNumber, level: usize) {
        if level > 0 {
            let table = self.table(frame);
            for index in 0..table.len() {
                if let Some(child) = table.entry(index).address() {
                    self.release_table(frames, child.frame_number(), level - 1);
                }
            }
        }

        if let Err(err) = frames.release(frame) {
            log::error!("failed to release page table frame {}: {}", frame, err);
        }
    }

    fn count_tables(&self, frame: FrameNumber, level: usize) -> usize {
        if level == 0 {
            return 1;
        }

        let table = self.table(frame);
        1 + (0..table.len())
            .filter_map(|index| table.entry(index).address())
            .map(|child| self.count_tables(child.frame_number(), level - 1))
            .sum::<usize>()
    }
}
