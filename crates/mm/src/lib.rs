#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Memory Manager (MM)
//!
//! The physical and virtual memory manager of the Polaris microkernel. It provides:
//!
//! - A two-phase physical frame allocator: a bump allocator over the firmware memory map during
//!   early boot, then per-order free lists backed by a self-hosted page database.
//! - Backing objects (anonymous, file-backed, shared and copy-on-write) that own page content.
//! - Address spaces built from regions, populated lazily by the page fault handler.
//! - Cross-CPU TLB shootdown, so no frame is reused while a stale translation may point at it.
//! - Software emulation of a scaled-down x86_64 for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod backing;
mod bootstrap;
mod fault;
mod frame_allocator;
mod numbers;
mod page_database;
mod page_directory;
mod physical_page;
mod region;
mod shootdown;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress, VirtualRange};
pub use address_space::{AddressSpace, AddressSpaceId};
pub use backing::{
    BackedPhysicalPage, BackingKind, BackingObject, BackingObjectId, EvictError, FileSource,
    IoError, PageState, PopulateError, Populated, WriteFault,
};
pub use bootstrap::{BootMemoryRegion, BootstrapAllocator, MAX_REGIONS, MemoryRegion};
pub use fault::{AccessKind, FaultError, FaultOutcome, on_page_fault};
pub use frame_allocator::{AllocError, FrameAllocator, MAX_ORDER};
pub use numbers::FrameNumber;
pub use page_database::{PageDatabase, PageDatabaseBuilder};
pub use page_directory::PageDirectory;
pub use physical_page::{FrameFlags, ORDER_NONE, PhysicalPage};
pub use region::{MapError, Permissions, Region, RegionTree};
pub use shootdown::{
    AtomicCpuSet, CpuInterconnect, CpuSet, Flusher, MAX_CPUS, ShootdownConfig,
    ShootdownCoordinator, TLB_SHOOTDOWN_VECTOR,
};

pub use arch::{PAGE_SIZE, PageEntry, PageFlags, USER_SPACE_END};
