//! Page table structure for software emulation.

use crate::PhysicalAddress;

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
/// With 4-bit indexes, we have 16 entries per table.
const ENTRY_COUNT: usize = 16;

/// A page table for software emulation.
///
/// This is a scale model of x86_64 page tables:
/// - 16-bit virtual addresses (stored as usize with sign-extension)
/// - 2 levels of page tables (level 1, level 0)
/// - 4-bit index at each level (16 entries per table)
/// - 8-bit page offset (256-byte pages)
///
/// Address layout:
/// - Bits 0-7: Page offset (256 bytes)
/// - Bits 8-11: Level 0 index (PT)
/// - Bits 12-15: Level 1 index (root)
///
/// The table is stored in place inside a physical frame; a zeroed frame is an empty table.
#[repr(C)]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }
}

/// Activates the page table rooted at `root`.
///
/// The scale model has no MMU to load, so this only records the switch.
///
/// # Safety
/// Kept unsafe to match the hardware contract: the table must stay valid while active.
pub unsafe fn activate(root: PhysicalAddress) {
    log::trace!("software mmu: activate root {}", root);
}
