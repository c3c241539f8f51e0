//! Architecture-specific implementations for memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features.
//!
//! Every backend exposes the same surface: page geometry constants, address validation,
//! `PageTable`/`PageEntry`/`PageFlags` primitives that live directly inside a physical frame,
//! and `flush_local` to invalidate the current CPU's cached translation for one page.

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;

// A page table must fit in the frame that stores it.
const _: () = assert!(core::mem::size_of::<PageTable>() <= PAGE_SIZE);
