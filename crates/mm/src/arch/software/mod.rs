//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any host.
//! It's designed for testing and development without requiring actual hardware access.
//!
//! The software-emulated architecture is a "scale model" of x86_64:
//! - 16-bit addresses (vs 48-bit on x86_64)
//! - 2 levels of page tables (vs 4 on x86_64)
//! - 4-bit indexes (16 entries per table, vs 9-bit/512 entries on x86_64)
//! - 8-bit page offset (256-byte pages, vs 12-bit/4KB on x86_64)
//!
//! Pages are large enough that a page table (16 entries of 8 bytes) and a useful number of
//! frame descriptors fit inside a single frame, so the page database and the page tables can
//! live in emulated physical memory exactly like they live in real frames on hardware.

use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::{PageTable, activate};

use crate::VirtualAddress;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// Page size in bytes (256 bytes = 2^8).
pub const PAGE_SIZE: usize = 256;

/// Number of page table levels (2 levels: level 1 and level 0).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// End of the range user mappings may occupy.
///
/// The last page below the canonical hole is kept unmapped so every user range end stays canonical.
pub const USER_SPACE_END: usize = 0x7F00;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For software emulation:
/// - Level 0: Bits 8-11 (page table)
/// - Level 1: Bits 12-15 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let bits_for_level = match level {
        0 | 1 => 4,
        _ => panic!("level out of range for software emulation (0-1)"),
    };
    let shift = 8 + (level * bits_for_level);
    (address >> shift) & ((1 << bits_for_level) - 1)
}

/// Validates a physical address for software emulation.
///
/// Physical addresses must fit within 16 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical (bits 16-63 must be sign-extended from bit 15).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for software emulation.
///
/// This sign-extends bit 15 to bits 16-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & 0x8000) != 0 {
        addr | 0xFFFF_FFFF_FFFF_0000
    } else {
        addr & 0xFFFF
    }
}

/// Invalidates the current CPU's cached translation for one page.
///
/// The scale model has no translation cache, so there is nothing to invalidate.
#[inline]
pub fn flush_local(page: VirtualAddress) {
    log::trace!("software tlb: flush {}", page);
}

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space backed by a page-aligned host allocation,
/// so frame contents, free-list links, page tables and frame descriptors can all be written
/// through the emulated direct map.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is only reached through raw pointers handed out by `translate`, and every
// structure stored in it synchronizes its own access (atomics or locks).
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or exceeds the emulated physical address width.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        assert!(
            size <= 1 << MAX_PHYSICAL_BITS,
            "emulated memory exceeds the physical address width"
        );

        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated layout");
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self { base, layout }
    }

    /// Translates a physical address to a virtual address (pointer into the buffer).
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.layout.size(), "physical address out of bounds");
        // SAFETY: `phys` is within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a virtual address (pointer) back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.layout.size(),
            "pointer not within emulated memory"
        );
        addr - base
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with `layout` in `new`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}
