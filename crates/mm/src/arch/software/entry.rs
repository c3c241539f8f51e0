//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page table entry for software emulation.
///
/// This is a scale model of x86_64 using 16-bit addresses stored in 64-bit values.
/// The entry format:
/// - Bits 0-7: Flags (the low byte is free because frames are 256-byte aligned)
/// - Bits 8-15: Physical frame number
/// - Bits 16-63: Reserved (always zero)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical address mask (bits 8-15).
    const ADDRESS_MASK: usize = 0xFF00;

    /// Flag bits mask (bits 0-7).
    const FLAGS_MASK: usize = 0xFF;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 8 bits must be zero for 256-byte pages).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & Self::FLAGS_MASK == 0,
            "physical address must be page-aligned (256-byte alignment)"
        );

        let addr_bits = address.as_usize() & Self::ADDRESS_MASK;
        let flag_bits = flags.as_usize() & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        let addr_bits = self.0 & Self::ADDRESS_MASK;
        let flag_bits = flags.as_usize() & Self::FLAGS_MASK;
        self.0 = addr_bits | flag_bits;
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw usize value of this entry.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for PageEntry {
    fn from(value: usize) -> Self {
        Self(value)
    }
}
