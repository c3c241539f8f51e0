//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, with methods to manipulate them for page table operations.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for converting between physical and virtual addresses.
///
/// This enum supports two modes:
/// - Hardware: Uses a direct-map offset for translation (kernel mode)
/// - Emulated: Uses an emulated memory buffer for translation (testing mode)
///
/// The emulated variant shares its buffer so several host threads, each standing in for a CPU,
/// can install the same physical memory.
#[derive(Clone)]
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Arc<EmulatedMemory>),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(Arc::new(EmulatedMemory::new(size)))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization. In emulation mode the
    /// translator is per thread, and every thread touching physical memory must install one.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!(
                "address translator not set; call AddressTranslator::set_current during initialization"
            ),
        }
    }

    /// Returns a reference to the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: Once set, the thread-local translator is never replaced and lives
                    // until the thread exits, which outlives every borrow taken on that thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a virtual address to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }

    /// Translates a pointer to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        PhysicalAddress::new(self.virt_to_phys(ptr as usize))
    }
}

/// Global address translator.
///
/// This is initialized once during kernel initialization (with Hardware variant).
/// In test/software-emulation mode, this is thread-local to allow each test to have its own
/// emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     physical address. It provides methods for address manipulation and alignment checks."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a direct-mapped virtual address back to a physical address.
    ///
    /// This assumes the virtual address is within the kernel's direct mapping region.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(virt.as_usize()))
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }

    /// Returns a pointer to this physical address through the direct map.
    #[inline]
    pub fn direct_mapped_ptr<T>(self) -> *mut T {
        VirtualAddress::direct_mapped(self).as_mut_ptr()
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. It provides methods for address manipulation, alignment checks,\n\
     and extracting page table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            crate::arch::validate_virtual(addr),
            "address is not canonical"
        );
        Self(addr)
    }

    /// Creates a virtual address from a physical address using the direct map offset.
    ///
    /// This assumes the kernel has set up a direct mapping of all physical memory
    /// at a fixed offset in the virtual address space.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // In emulated mode, phys_to_virt returns a host pointer which isn't canonical
        // for the guest architecture. Bypass the validity check in that case.
        #[cfg(any(test, feature = "software-emulation"))]
        if matches!(translator, AddressTranslator::Emulated(_)) {
            return Self(virt);
        }

        Self::new(virt)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the byte offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index at the specified level (0 is the leaf table).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns whether this address lies in the part of the address space user mappings may use.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < arch::USER_SPACE_END
    }
}

/// A half-open range of virtual addresses, `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtualRange {
    /// Creates a range from its bounds.
    ///
    /// # Panics
    ///
    /// Panics if `end` is below `start`.
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(start <= end, "range end precedes its start");
        Self { start, end }
    }

    /// Creates a range of `len` bytes starting at `start`.
    pub fn from_len(start: VirtualAddress, len: usize) -> Self {
        Self::new(start, start + len)
    }

    /// Creates a range covering exactly one page.
    pub fn page(start: VirtualAddress) -> Self {
        Self::from_len(start, arch::PAGE_SIZE)
    }

    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the number of pages in the range.
    pub fn page_count(&self) -> usize {
        self.len() / arch::PAGE_SIZE
    }

    /// Returns whether both bounds are page-aligned.
    pub fn is_page_aligned(&self) -> bool {
        self.start.is_aligned(arch::PAGE_SIZE) && self.end.is_aligned(arch::PAGE_SIZE)
    }

    /// Returns whether the whole range lies in the user part of the address space.
    pub fn is_user(&self) -> bool {
        self.end.as_usize() <= arch::USER_SPACE_END
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Returns whether `other` lies entirely within this range.
    pub fn covers(&self, other: &VirtualRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &VirtualRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the common part of two ranges, if they overlap.
    pub fn intersect(&self, other: &VirtualRange) -> Option<VirtualRange> {
        if !self.overlaps(other) {
            return None;
        }

        Some(VirtualRange::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }

    /// Iterates over the start address of every page in the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let start = self.start;
        (0..self.page_count()).map(move |i| start + i * arch::PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start.as_usize(), self.end.as_usize())
    }
}
