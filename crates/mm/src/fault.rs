//! Page fault entry point for the trap layer.

use thiserror::Error;

use crate::{AddressSpace, AllocError, IoError, Permissions, PopulateError, VirtualAddress};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Decodes an x86 page fault error code.
    pub fn from_error_code(code: u64) -> Self {
        const CAUSED_BY_WRITE: u64 = 1 << 1;
        const INSTRUCTION_FETCH: u64 = 1 << 4;

        if code & INSTRUCTION_FETCH != 0 {
            Self::Execute
        } else if code & CAUSED_BY_WRITE != 0 {
            Self::Write
        } else {
            Self::Read
        }
    }

    /// Returns true if a region with `permissions` allows this access.
    pub fn permitted_by(self, permissions: Permissions) -> bool {
        match self {
            Self::Read => permissions.contains(Permissions::READ),
            Self::Write => permissions.contains(Permissions::WRITE),
            Self::Execute => permissions.contains(Permissions::EXECUTE),
        }
    }
}

/// Reasons a fault cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    #[error("no mapping at the faulting address")]
    NoSuchMapping,
    #[error("access not permitted by the mapping")]
    PermissionDenied,
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("failed to read page content: {0}")]
    Io(IoError),
}

impl From<PopulateError> for FaultError {
    fn from(err: PopulateError) -> Self {
        match err {
            PopulateError::OutOfPhysicalMemory => Self::OutOfPhysicalMemory,
            PopulateError::Io(err) => Self::Io(err),
            // The region reaches past the end of its object.
            PopulateError::OutOfBounds => Self::NoSuchMapping,
        }
    }
}

impl From<AllocError> for FaultError {
    fn from(_: AllocError) -> Self {
        Self::OutOfPhysicalMemory
    }
}

/// What the trap layer should do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Retry the faulting instruction.
    Resolved,
    /// The fault cannot be resolved; end the task.
    Terminate(FaultError),
}

/// Resolves a fault at `addr` in `space`, the address space current on the faulting CPU.
pub fn on_page_fault(addr: VirtualAddress, access: AccessKind, space: &AddressSpace) -> FaultOutcome {
    match space.handle_fault(addr, access) {
        Ok(()) => FaultOutcome::Resolved,
        Err(err) => {
            log::warn!(
                "{}: unresolvable {:?} fault at {}: {}",
                space.id(),
                access,
                addr,
                err
            );
            FaultOutcome::Terminate(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::testing::{self, SimulatedCpus};
    use crate::{BackingObject, FileSource, ShootdownConfig, ShootdownCoordinator, VirtualRange};

    struct BrokenFile;

    impl FileSource for BrokenFile {
        fn read_page(&self, _page: usize, _buf: &mut [u8]) -> Result<(), IoError> {
            Err(IoError(-5))
        }
    }

    fn space() -> AddressSpace {
        let frames = testing::frame_allocator();
        let cpus = SimulatedCpus::new(1);
        let shootdown = Arc::new(ShootdownCoordinator::new(
            cpus,
            1,
            ShootdownConfig::default(),
        ));
        AddressSpace::new(frames, shootdown).unwrap()
    }

    fn range(start: usize, end: usize) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(start), VirtualAddress::new(end))
    }

    #[test]
    fn error_codes() {
        assert_eq!(AccessKind::from_error_code(0b00100), AccessKind::Read);
        assert_eq!(AccessKind::from_error_code(0b00110), AccessKind::Write);
        assert_eq!(AccessKind::from_error_code(0b10100), AccessKind::Execute);
    }

    #[test]
    fn resolved_faults_map_the_page() {
        let space = space();
        let object = BackingObject::new_anonymous(Arc::clone(space.frames()), 0x200);
        space
            .map(
                range(0x1000, 0x1200),
                Permissions::READ | Permissions::WRITE | Permissions::USER,
                object,
                0,
            )
            .unwrap();

        let addr = VirtualAddress::new(0x1180);
        assert_eq!(
            on_page_fault(addr, AccessKind::Write, &space),
            FaultOutcome::Resolved
        );
        assert!(space.translate(addr).is_some());
    }

    #[test]
    fn unresolvable_faults_terminate() {
        let space = space();
        let object = BackingObject::new_file_backed(
            Arc::clone(space.frames()),
            Arc::new(BrokenFile),
            0x100,
        );
        space
            .map(range(0x2000, 0x2100), Permissions::READ | Permissions::USER, object, 0)
            .unwrap();

        assert_eq!(
            on_page_fault(VirtualAddress::new(0x0800), AccessKind::Read, &space),
            FaultOutcome::Terminate(FaultError::NoSuchMapping)
        );
        assert_eq!(
            on_page_fault(VirtualAddress::new(0x2000), AccessKind::Write, &space),
            FaultOutcome::Terminate(FaultError::PermissionDenied)
        );
        assert_eq!(
            on_page_fault(VirtualAddress::new(0x2000), AccessKind::Execute, &space),
            FaultOutcome::Terminate(FaultError::PermissionDenied)
        );
        assert_eq!(
            on_page_fault(VirtualAddress::new(0x2010), AccessKind::Read, &space),
            FaultOutcome::Terminate(FaultError::Io(IoError(-5)))
        );
        assert_eq!(space.translate(VirtualAddress::new(0x2010)), None);
    }
}
