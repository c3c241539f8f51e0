//! Page table structure for x86_64 architecture.

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::PhysicalAddress;

use super::entry::PageEntry;

/// Number of entries in an x86_64 page table.
const ENTRY_COUNT: usize = 512;

/// A page table for x86_64 architecture.
///
/// This represents a single level in the page table hierarchy. On x86_64 with
/// 4-level paging, there are four levels: PML4 (level 3), PDPT (level 2),
/// PD (level 1), and PT (level 0).
///
/// The table is stored in place inside a physical frame; a zeroed frame is an empty table.
#[repr(transparent)]
pub struct PageTable(x86_64::structures::paging::PageTable);

impl PageTable {
    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        let entry = &self.0[index];
        PageEntry::from(entry.addr().as_u64() as usize | entry.flags().bits() as usize)
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: We're reinterpreting the page table entry as our PageEntry type.
        // Both are 64-bit values with the same layout.
        unsafe { &mut *(&mut self.0[index] as *mut _ as *mut PageEntry) }
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }
}

/// Activates the page table rooted at `root` by loading it into CR3.
///
/// # Safety
/// Loading an invalid page table can cause undefined behavior. The caller must ensure:
/// - The page table correctly maps all memory that will be accessed
/// - The kernel is properly mapped
/// - The page table itself is mapped
pub unsafe fn activate(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: Upheld by the caller.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}
