//! Address space management.
//!
//! An [`AddressSpace`] pairs a page directory with the tree of regions mapped into it. Mapping is
//! lazy: `map` only records a region, and page-table entries are installed by `handle_fault` on
//! first access. Anything that removes or downgrades entries goes through a [`Flusher`], so frames
//! and backing object references are only let go once no CPU can still translate through them.
//!
//! The state sits behind one spin lock. A CPU spinning for it keeps answering shootdown requests,
//! and the lock is never held across backing object population, which may read from a file.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::{self, PAGE_SIZE, PageEntry, USER_SPACE_END};
use crate::{
    AccessKind, AllocError, AtomicCpuSet, BackingObject, CpuSet, FaultError, Flusher,
    FrameAllocator, FrameNumber, MapError, PageDirectory, PageState, Permissions,
    PhysicalAddress, Region, RegionTree, ShootdownCoordinator, VirtualAddress, VirtualRange,
};

static NEXT_ADDRESS_SPACE_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies an address space in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

struct State {
    directory: PageDirectory,
    regions: RegionTree,
}

/// How a resolved fault wants its page mapped.
struct Resolution {
    frame: FrameNumber,
    writable: bool,
    replaced: Option<FrameNumber>,
}

/// A virtual address space: page tables plus the regions mapped into them.
pub struct AddressSpace {
    id: AddressSpaceId,
    frames: Arc<FrameAllocator>,
    shootdown: Arc<ShootdownCoordinator>,
    /// CPUs that currently run on this address space and may cache its translations.
    active: AtomicCpuSet,
    state: spin::Mutex<State>,
}

impl AddressSpace {
    /// Creates an empty address space with a zeroed root table.
    pub fn new(
        frames: Arc<FrameAllocator>,
        shootdown: Arc<ShootdownCoordinator>,
    ) -> Result<Self, AllocError> {
        let directory = PageDirectory::new(&frames)?;
        let id = AddressSpaceId(NEXT_ADDRESS_SPACE_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!("{}: created with root {}", id, directory.root());

        Ok(Self {
            id,
            frames,
            shootdown,
            active: AtomicCpuSet::new(),
            state: spin::Mutex::new(State {
                directory,
                regions: RegionTree::new(),
            }),
        })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// Returns the frame holding the root page table.
    pub fn root(&self) -> FrameNumber {
        self.lock().directory.root()
    }

    /// Records that `cpu` switched to this address space.
    pub fn activate(&self, cpu: usize) {
        self.active.insert(cpu);
    }

    /// Records that `cpu` switched away from this address space.
    pub fn deactivate(&self, cpu: usize) {
        self.active.remove(cpu);
    }

    pub fn active_cpus(&self) -> CpuSet {
        self.active.load()
    }

    /// Loads the root table on the executing CPU.
    ///
    /// # Safety
    ///
    /// The page tables must map everything the CPU is about to execute and touch, kernel included.
    pub unsafe fn load(&self) {
        let root = self.root();
        // SAFETY: Upheld by the caller.
        unsafe { arch::activate(root.start()) };
    }

    /// Maps `range` to the object pages starting at page `offset`, without populating anything.
    pub fn map(
        &self,
        range: VirtualRange,
        permissions: Permissions,
        object: Arc<BackingObject>,
        offset: usize,
    ) -> Result<(), MapError> {
        Self::validate(&range)?;
        Self::validate_object(&range, &object, offset)?;

        self.lock()
            .regions
            .insert(Region::new(range, permissions, object, offset))?;
        log::debug!("{}: mapped {:?} {:?}", self.id, range, permissions);
        Ok(())
    }

    /// Maps `range` like [`Self::map`], first unmapping whatever overlaps it.
    pub fn map_fixed(
        &self,
        range: VirtualRange,
        permissions: Permissions,
        object: Arc<BackingObject>,
        offset: usize,
    ) -> Result<(), MapError> {
        Self::validate(&range)?;
        Self::validate_object(&range, &object, offset)?;

        let mut state = self.lock();
        let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
        self.remove_locked(&mut state, &range, &mut flusher);
        state
            .regions
            .insert(Region::new(range, permissions, object, offset))?;
        flusher.flush();

        log::debug!("{}: mapped {:?} {:?} (fixed)", self.id, range, permissions);
        Ok(())
    }

    /// Maps `len` bytes at the lowest free user address and returns it. Page zero is never used.
    pub fn map_anywhere(
        &self,
        len: usize,
        permissions: Permissions,
        object: Arc<BackingObject>,
        offset: usize,
    ) -> Result<VirtualAddress, MapError> {
        if len == 0 {
            return Err(MapError::InvalidRange);
        }
        let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let mut state = self.lock();
        let start = state
            .regions
            .find_gap(
                len,
                VirtualAddress::new(PAGE_SIZE),
                VirtualAddress::new(USER_SPACE_END),
            )
            .ok_or(MapError::OutOfBounds)?;
        let range = VirtualRange::from_len(start, len);
        Self::validate_object(&range, &object, offset)?;
        state
            .regions
            .insert(Region::new(range, permissions, object, offset))?;

        log::debug!("{}: mapped {:?} {:?}", self.id, range, permissions);
        Ok(start)
    }

    /// Removes every mapping in `range`, splitting regions that straddle its ends.
    ///
    /// Returns once every CPU running this address space dropped its translations; frames and
    /// object references the range held are released after that.
    pub fn unmap(&self, range: VirtualRange) -> Result<(), MapError> {
        Self::validate(&range)?;

        let mut state = self.lock();
        if state.regions.overlapping(&range).next().is_none() {
            return Err(MapError::NoSuchMapping);
        }

        let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
        self.remove_locked(&mut state, &range, &mut flusher);
        flusher.flush();

        log::debug!("{}: unmapped {:?}", self.id, range);
        Ok(())
    }

    /// Changes the permissions of `range`, which must be fully mapped.
    ///
    /// Installed entries are rewritten; a page that was read-only because it is shared stays
    /// read-only until it faults.
    pub fn protect(&self, range: VirtualRange, permissions: Permissions) -> Result<(), MapError> {
        Self::validate(&range)?;

        let mut state = self.lock();
        if !state.regions.covers(&range) {
            return Err(MapError::NoSuchMapping);
        }

        let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
        let State {
            directory,
            regions,
        } = &mut *state;
        regions.split_boundaries(&range);
        for region in regions.within_mut(&range) {
            region.set_permissions(permissions);
        }

        let mut changed = false;
        for page in range.pages() {
            let Some(entry) = directory.entry(page) else {
                continue;
            };
            directory.update_flags(page, permissions.page_flags(entry.flags().is_writable()));
            changed = true;
        }
        if changed {
            flusher.queue(range);
        }
        flusher.flush();

        log::debug!("{}: protected {:?} as {:?}", self.id, range, permissions);
        Ok(())
    }

    /// Resolves a fault at `addr`.
    ///
    /// The region's object produces the frame with the lock released; afterwards the region is
    /// looked up again, and if it changed in the meantime the fault is retried from scratch.
    pub fn handle_fault(&self, addr: VirtualAddress, access: AccessKind) -> Result<(), FaultError> {
        let page = addr.align_down(PAGE_SIZE);

        loop {
            let (object, offset) = {
                let state = self.lock();
                let region = state
                    .regions
                    .find(addr)
                    .ok_or(FaultError::NoSuchMapping)?;
                if !access.permitted_by(region.permissions()) {
                    return Err(FaultError::PermissionDenied);
                }
                (Arc::clone(region.object()), region.translate(page))
            };

            let resolution = match access {
                AccessKind::Write => {
                    let fault = object.handle_write_fault(offset)?;
                    Resolution {
                        frame: fault.frame,
                        writable: true,
                        replaced: fault.replaced,
                    }
                }
                AccessKind::Read | AccessKind::Execute => {
                    let populated = object.populate(offset)?;
                    Resolution {
                        frame: populated.frame,
                        writable: populated.state == PageState::Private,
                        replaced: None,
                    }
                }
            };

            let mut state = self.lock();
            let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
            if let Some(replaced) = resolution.replaced {
                self.unmap_stale(&mut state, &object, offset, replaced, &mut flusher);
                flusher.defer_release(replaced);
            }

            let permissions = state
                .regions
                .find(addr)
                .filter(|region| {
                    Arc::ptr_eq(region.object(), &object)
                        && region.translate(page) == offset
                        && access.permitted_by(region.permissions())
                })
                .map(Region::permissions);
            let Some(permissions) = permissions else {
                log::debug!("{}: region at {} changed during fault, retrying", self.id, addr);
                if resolution.replaced.is_some() {
                    flusher.queue(VirtualRange::page(page));
                }
                continue;
            };

            let flags = permissions.page_flags(resolution.writable);
            let previous = state
                .directory
                .map(&self.frames, page, resolution.frame.start(), flags)?
                .and_then(PageEntry::address)
                .map(PhysicalAddress::frame_number);

            if previous != Some(resolution.frame) {
                if let Some(installed) = self.frames.page(resolution.frame) {
                    installed.map();
                }
                if let Some(previous) = previous {
                    flusher.queue(VirtualRange::page(page));
                    flusher.defer_unmapped(previous);
                }
            }
            flusher.flush();

            log::debug!(
                "{}: {:?} fault at {} -> {} ({})",
                self.id,
                access,
                addr,
                resolution.frame,
                if resolution.writable { "rw" } else { "ro" }
            );
            return Ok(());
        }
    }

    /// Creates a copy of this address space for a child process.
    ///
    /// Private regions get a child object sharing every populated page copy-on-write: both sides
    /// map those pages read-only, and the first write on either side takes a private copy. Shared
    /// and file-backed regions map the same object in both.
    pub fn fork(&self) -> Result<AddressSpace, MapError> {
        let mut child = AddressSpace::new(Arc::clone(&self.frames), Arc::clone(&self.shootdown))?;
        let child_state = child.state.get_mut();

        let mut state = self.lock();
        let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
        let State {
            directory,
            regions,
        } = &mut *state;

        // Aliases of one private object fork into one child object.
        let mut forked: Vec<(Arc<BackingObject>, Arc<BackingObject>)> = Vec::new();
        for region in regions.iter() {
            if !region.object().kind().is_private() {
                child_state.regions.insert(region.clone())?;
                continue;
            }

            let object = region.object();
            let child_object = match forked.iter().find(|(parent, _)| Arc::ptr_eq(parent, object)) {
                Some((_, child_object)) => Arc::clone(child_object),
                None => {
                    let child_object = object.fork();
                    forked.push((Arc::clone(object), Arc::clone(&child_object)));
                    child_object
                }
            };
            child_state.regions.insert(Region::new(
                region.range(),
                region.permissions(),
                Arc::clone(&child_object),
                region.offset(),
            ))?;

            let read_only = region.permissions().page_flags(false);
            for (offset, _) in object.pages_in(region.object_pages(&region.range())) {
                let Some(frame) = object
                    .fork_copy_on_write(offset, &child_object)
                    .map_err(|_| MapError::OutOfPhysicalMemory)?
                else {
                    continue;
                };
                let page = region.start() + (offset - region.offset()) * PAGE_SIZE;

                if directory
                    .entry(page)
                    .is_some_and(|entry| entry.flags().is_writable())
                {
                    directory.update_flags(page, read_only);
                    flusher.queue(VirtualRange::page(page));
                }

                child_state
                    .directory
                    .map(&self.frames, page, frame.start(), read_only)?;
                if let Some(shared) = self.frames.page(frame) {
                    shared.map();
                }
            }
        }
        flusher.flush();
        drop(state);

        log::debug!(
            "{}: forked into {} with {} regions",
            self.id,
            child.id,
            child.state.get_mut().regions.len()
        );
        Ok(child)
    }

    /// Tears the address space down: every region, then the page tables.
    pub fn destroy(self) {
        log::debug!("{}: destroyed", self.id);
        drop(self);
    }

    /// Returns the physical address `addr` currently translates to.
    pub fn translate(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        self.lock().directory.translate(addr)
    }

    /// Returns the installed page-table entry for `addr`.
    pub fn entry(&self, addr: VirtualAddress) -> Option<PageEntry> {
        self.lock().directory.entry(addr.align_down(PAGE_SIZE))
    }

    /// Returns a snapshot of the mapped regions in address order.
    pub fn regions(&self) -> Vec<Region> {
        self.lock().regions.iter().cloned().collect()
    }

    fn lock(&self) -> spin::MutexGuard<'_, State> {
        loop {
            if let Some(guard) = self.state.try_lock() {
                return guard;
            }
            // The holder may be waiting for us to acknowledge a shootdown.
            self.shootdown.service_pending();
            core::hint::spin_loop();
        }
    }

    fn validate(range: &VirtualRange) -> Result<(), MapError> {
        if range.is_empty() {
            return Err(MapError::InvalidRange);
        }
        if !range.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !range.is_user() {
            return Err(MapError::OutOfBounds);
        }
        Ok(())
    }

    fn validate_object(
        range: &VirtualRange,
        object: &BackingObject,
        offset: usize,
    ) -> Result<(), MapError> {
        match offset.checked_add(range.page_count()) {
            Some(end) if end <= object.page_count() => Ok(()),
            _ => Err(MapError::OutOfBounds),
        }
    }

    /// Unmaps every page of this space mapping `object`'s page `offset` that still translates to
    /// `stale`, the frame a copy-on-write fault just replaced. Aliases of the faulting page are
    /// included; they fault again and find the new frame.
    fn unmap_stale(
        &self,
        state: &mut State,
        object: &Arc<BackingObject>,
        offset: usize,
        stale: FrameNumber,
        flusher: &mut Flusher<'_>,
    ) {
        let aliases: Vec<VirtualAddress> = state
            .regions
            .iter()
            .filter(|region| {
                Arc::ptr_eq(region.object(), object)
                    && region.object_pages(&region.range()).contains(&offset)
            })
            .map(|region| region.start() + (offset - region.offset()) * PAGE_SIZE)
            .collect();

        for at in aliases {
            let mapped = state
                .directory
                .entry(at)
                .and_then(PageEntry::address)
                .map(PhysicalAddress::frame_number);
            if mapped == Some(stale) {
                state.directory.unmap(at);
                flusher.queue(VirtualRange::page(at));
                flusher.defer_unmapped(stale);
                log::trace!("{}: dropped stale mapping of {} at {}", self.id, stale, at);
            }
        }
    }

    /// Removes `range` from the region tree and page tables, handing everything that must outlive
    /// the shootdown to `flusher`.
    fn remove_locked(&self, state: &mut State, range: &VirtualRange, flusher: &mut Flusher<'_>) {
        let removed = state.regions.remove_range(range);

        for region in &removed {
            for page in region.range().pages() {
                if let Some(phys) = state.directory.unmap(page) {
                    flusher.defer_unmapped(phys.frame_number());
                }
            }
            flusher.queue(region.range());

            // Private pages of an object nobody else maps are unreachable once unmapped, unless a
            // remaining alias of the object still covers them.
            let object = region.object();
            let references = state
                .regions
                .iter()
                .chain(removed.iter())
                .filter(|other| Arc::ptr_eq(other.object(), object))
                .count();
            if Arc::strong_count(object) != references {
                continue;
            }
            let covered: Vec<_> = state
                .regions
                .iter()
                .filter(|other| Arc::ptr_eq(other.object(), object))
                .map(|other| other.object_pages(&other.range()))
                .collect();
            for (offset, _) in object.pages_in(region.object_pages(&region.range())) {
                if covered.iter().any(|pages| pages.contains(&offset)) {
                    continue;
                }
                for frame in object.discard(offset..offset + 1) {
                    flusher.defer_release(frame);
                }
            }
        }

        for region in removed {
            flusher.defer_drop(region);
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let regions = state.regions.take_all();

        let mut flusher = Flusher::new(&self.shootdown, &self.frames, &self.active);
        for region in regions {
            for page in region.range().pages() {
                if let Some(phys) = state.directory.unmap(page) {
                    flusher.defer_unmapped(phys.frame_number());
                }
            }
            flusher.queue(region.range());
            flusher.defer_drop(region);
        }
        flusher.flush();

        // SAFETY: The address space is going away and nothing walks its tables any more.
        unsafe { state.directory.release_tables(&self.frames) };
        log::trace!("{}: page tables released", self.id);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("active", &self.active.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{self, SimulatedCpus};
    use crate::{EvictError, FileSource, IoError, ShootdownConfig};

    fn rw() -> Permissions {
        Permissions::READ | Permissions::WRITE | Permissions::USER
    }

    fn range(start: usize, end: usize) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(start), VirtualAddress::new(end))
    }

    fn addr(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn setup(cpu_count: usize) -> (Arc<SimulatedCpus>, Arc<ShootdownCoordinator>, AddressSpace) {
        let frames = testing::frame_allocator();
        let cpus = SimulatedCpus::new(cpu_count);
        let shootdown = Arc::new(ShootdownCoordinator::new(
            cpus.clone(),
            cpu_count,
            ShootdownConfig::default(),
        ));
        let space = AddressSpace::new(frames, Arc::clone(&shootdown)).unwrap();
        space.activate(0);
        (cpus, shootdown, space)
    }

    fn frame_of(space: &AddressSpace, at: usize) -> FrameNumber {
        space.translate(addr(at)).unwrap().frame_number()
    }

    fn is_writable(space: &AddressSpace, at: usize) -> bool {
        space.entry(addr(at)).unwrap().flags().is_writable()
    }

    fn read_byte(space: &AddressSpace, at: usize) -> u8 {
        let phys = space.translate(addr(at)).unwrap();
        unsafe { phys.direct_mapped_ptr::<u8>().read() }
    }

    fn write_byte(space: &AddressSpace, at: usize, value: u8) {
        assert!(is_writable(space, at), "{:#x} is mapped read-only", at);
        let phys = space.translate(addr(at)).unwrap();
        unsafe { phys.direct_mapped_ptr::<u8>().write(value) };
    }

    /// Page `n` of the file is filled with `n + 1`.
    struct PatternFile;

    impl FileSource for PatternFile {
        fn read_page(&self, page: usize, buf: &mut [u8]) -> Result<(), IoError> {
            buf.fill(page as u8 + 1);
            Ok(())
        }
    }

    #[test]
    fn map_validates_ranges() {
        let (_cpus, _shootdown, space) = setup(1);
        let object = BackingObject::new_anonymous(Arc::clone(space.frames()), 0x1000);

        let map = |r: VirtualRange, offset: usize| space.map(r, rw(), Arc::clone(&object), offset);
        assert_eq!(map(range(0x1000, 0x1000), 0), Err(MapError::InvalidRange));
        assert_eq!(map(range(0x1080, 0x1200), 0), Err(MapError::Unaligned));
        assert_eq!(
            map(range(0xFFFF_FFFF_FFFF_8000, 0xFFFF_FFFF_FFFF_8100), 0),
            Err(MapError::OutOfBounds)
        );
        assert_eq!(map(range(0x1000, 0x1200), 15), Err(MapError::OutOfBounds));

        map(range(0x1000, 0x1200), 0).unwrap();
        assert_eq!(map(range(0x1100, 0x1300), 0), Err(MapError::Overlap));
        assert_eq!(space.regions().len(), 1);
        assert_eq!(space.unmap(range(0x4000, 0x4100)), Err(MapError::NoSuchMapping));
    }

    #[test]
    fn anonymous_region_fault_unmap_and_reuse() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());

        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x2000);
        space.map(range(0x1000, 0x3000), rw(), object, 0).unwrap();
        assert_eq!(space.translate(addr(0x1010)), None);

        space.handle_fault(addr(0x1010), AccessKind::Write).unwrap();
        write_byte(&space, 0x1010, 0xAB);
        assert_eq!(read_byte(&space, 0x1010), 0xAB);
        let frame = frame_of(&space, 0x1010);
        assert_eq!(frames.page(frame).unwrap().map_count(), 1);

        space.unmap(range(0x1000, 0x3000)).unwrap();
        assert_eq!(space.translate(addr(0x1010)), None);
        assert!(space.regions().is_empty());
        assert!(frames.page(frame).unwrap().is_free());

        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x2000);
        space.map(range(0x1000, 0x3000), rw(), object, 0).unwrap();
        space.handle_fault(addr(0x1010), AccessKind::Read).unwrap();
        assert_eq!(read_byte(&space, 0x1010), 0);
    }

    #[test]
    fn fork_shares_pages_until_written() {
        let (_cpus, _shootdown, parent) = setup(1);
        let frames = Arc::clone(parent.frames());

        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x200);
        parent.map(range(0x2000, 0x2200), rw(), object, 0).unwrap();
        parent.handle_fault(addr(0x2000), AccessKind::Write).unwrap();
        parent.handle_fault(addr(0x2100), AccessKind::Write).unwrap();
        write_byte(&parent, 0x2000, 0x11);
        write_byte(&parent, 0x2100, 0x22);
        let shared = frame_of(&parent, 0x2000);

        let child = parent.fork().unwrap();
        assert_eq!(frame_of(&child, 0x2000), shared);
        assert!(!is_writable(&parent, 0x2000));
        assert!(!is_writable(&child, 0x2000));
        assert_eq!(frames.ref_count(shared), 2);
        assert_eq!(frames.page(shared).unwrap().map_count(), 2);
        assert_eq!(read_byte(&child, 0x2100), 0x22);

        child.handle_fault(addr(0x2000), AccessKind::Write).unwrap();
        let private = frame_of(&child, 0x2000);
        assert_ne!(private, shared);
        assert_eq!(read_byte(&child, 0x2000), 0x11);
        write_byte(&child, 0x2000, 0x33);
        assert_eq!(read_byte(&parent, 0x2000), 0x11);
        assert_eq!(frames.ref_count(shared), 1);
        assert_eq!(frames.page(shared).unwrap().map_count(), 1);

        // The parent is now the only user and upgrades in place.
        parent.handle_fault(addr(0x2000), AccessKind::Write).unwrap();
        assert_eq!(frame_of(&parent, 0x2000), shared);
        assert!(is_writable(&parent, 0x2000));

        let still_shared = frame_of(&parent, 0x2100);
        assert_eq!(frame_of(&child, 0x2100), still_shared);
        assert_eq!(frames.ref_count(still_shared), 2);
    }

    #[test]
    fn unmapped_frames_wait_for_every_acknowledgment() {
        let (cpus, shootdown, space) = setup(2);
        let frames = Arc::clone(space.frames());
        space.activate(1);

        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x100);
        space.map(range(0x1000, 0x1100), rw(), object, 0).unwrap();
        space.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        let frame = frame_of(&space, 0x1000);

        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            let frames = Arc::clone(&frames);
            cpus.on_flush(move |cpu, _| {
                if cpu == 1 {
                    seen.lock().push(frames.page(frame).unwrap().is_allocated());
                }
            });
        }
        let _cpu1 = testing::spawn_cpu(&cpus, &shootdown, 1, Duration::from_millis(30));

        space.unmap(range(0x1000, 0x1100)).unwrap();

        assert_eq!(*seen.lock(), vec![true]);
        assert!(frames.page(frame).unwrap().is_free());
    }

    #[test]
    fn concurrent_faults_install_one_frame_per_page() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());
        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x400);
        space.map(range(0x1000, 0x1400), rw(), object, 0).unwrap();

        let space = Arc::new(space);
        let translator = testing::translator();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let space = Arc::clone(&space);
                let translator = translator.clone();
                std::thread::spawn(move || {
                    crate::AddressTranslator::set_current(translator);
                    for page in range(0x1000, 0x1400).pages() {
                        space.handle_fault(page, AccessKind::Write).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for page in range(0x1000, 0x1400).pages() {
            let frame = frame_of(&space, page.as_usize());
            assert_eq!(frames.ref_count(frame), 1);
            assert_eq!(frames.page(frame).unwrap().map_count(), 1);
        }
    }

    #[test]
    fn protect_splits_and_downgrades() {
        let (cpus, _shootdown, space) = setup(1);
        let object = BackingObject::new_anonymous(Arc::clone(space.frames()), 0x300);
        space.map(range(0x1000, 0x1300), rw(), object, 0).unwrap();
        space.handle_fault(addr(0x1100), AccessKind::Write).unwrap();

        space
            .protect(range(0x1100, 0x1200), Permissions::READ | Permissions::USER)
            .unwrap();
        assert_eq!(space.regions().len(), 3);
        assert!(!is_writable(&space, 0x1100));
        assert!(cpus.flushes().contains(&(0, range(0x1100, 0x1200))));
        assert_eq!(
            space.handle_fault(addr(0x1100), AccessKind::Write),
            Err(FaultError::PermissionDenied)
        );
        space.handle_fault(addr(0x1000), AccessKind::Write).unwrap();

        // Granting write back leaves the entry read-only until the next write fault.
        space.protect(range(0x1100, 0x1200), rw()).unwrap();
        assert!(!is_writable(&space, 0x1100));
        space.handle_fault(addr(0x1100), AccessKind::Write).unwrap();
        assert!(is_writable(&space, 0x1100));

        assert_eq!(
            space.protect(range(0x1200, 0x1400), rw()),
            Err(MapError::NoSuchMapping)
        );
    }

    #[test]
    fn map_fixed_replaces_overlapping_mappings() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());
        let first = BackingObject::new_anonymous(Arc::clone(&frames), 0x400);
        space.map(range(0x1000, 0x1400), rw(), first, 0).unwrap();
        space.handle_fault(addr(0x1200), AccessKind::Write).unwrap();
        let replaced = frame_of(&space, 0x1200);

        let second = BackingObject::new_anonymous(Arc::clone(&frames), 0x400);
        space
            .map_fixed(range(0x1200, 0x1600), rw(), second, 0)
            .unwrap();

        assert_eq!(space.translate(addr(0x1200)), None);
        assert!(frames.page(replaced).unwrap().is_free());
        let ranges: Vec<VirtualRange> = space.regions().iter().map(Region::range).collect();
        assert_eq!(ranges, vec![range(0x1000, 0x1200), range(0x1200, 0x1600)]);
    }

    #[test]
    fn map_anywhere_uses_the_first_gap() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());

        let low = BackingObject::new_anonymous(Arc::clone(&frames), 0xF00);
        space.map(range(0x0100, 0x1000), rw(), low, 0).unwrap();

        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x300);
        let start = space.map_anywhere(0x250, rw(), object, 0).unwrap();
        assert_eq!(start, addr(0x1000));
        assert_eq!(space.regions()[1].range(), range(0x1000, 0x1300));
    }

    #[test]
    fn file_pages_fault_read_only_until_written() {
        let (_cpus, _shootdown, space) = setup(1);
        let object =
            BackingObject::new_file_backed(Arc::clone(space.frames()), Arc::new(PatternFile), 0x400);
        space
            .map(range(0x3000, 0x3400), rw(), Arc::clone(&object), 0)
            .unwrap();

        space.handle_fault(addr(0x3100), AccessKind::Read).unwrap();
        assert_eq!(read_byte(&space, 0x3100), 2);
        assert!(!is_writable(&space, 0x3100));
        assert!(object.dirty_pages().is_empty());

        space.handle_fault(addr(0x3100), AccessKind::Write).unwrap();
        assert!(is_writable(&space, 0x3100));
        assert_eq!(object.dirty_pages(), vec![1]);

        space.unmap(range(0x3000, 0x3400)).unwrap();
        assert_eq!(object.mark_clean(1), Ok(true));
        assert_eq!(object.evict(1), Ok(true));
    }

    #[test]
    fn writes_after_writeback_are_not_lost() {
        let (_cpus, _shootdown, space) = setup(1);
        let object =
            BackingObject::new_file_backed(Arc::clone(space.frames()), Arc::new(PatternFile), 0x200);
        space
            .map(range(0x3000, 0x3200), rw(), Arc::clone(&object), 0)
            .unwrap();
        space.handle_fault(addr(0x3000), AccessKind::Write).unwrap();
        let frame = frame_of(&space, 0x3000);

        // The writable mapping keeps the page dirty.
        assert_eq!(object.mark_clean(0), Err(EvictError::Mapped));
        write_byte(&space, 0x3000, 0x99);
        assert_eq!(object.evict(0), Err(EvictError::Dirty));

        space.unmap(range(0x3000, 0x3200)).unwrap();
        assert_eq!(object.dirty_pages(), vec![0]);
        assert_eq!(object.evict(0), Err(EvictError::Dirty));
        assert_eq!(unsafe { space.frames().frame_bytes(frame) }[0], 0x99);

        assert_eq!(object.mark_clean(0), Ok(true));
        assert_eq!(object.evict(0), Ok(true));
    }

    #[test]
    fn unmapping_one_alias_keeps_the_other_mapped() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());
        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x100);
        space
            .map(range(0x1000, 0x1100), rw(), Arc::clone(&object), 0)
            .unwrap();
        space.map(range(0x5000, 0x5100), rw(), object, 0).unwrap();

        space.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        space.handle_fault(addr(0x5000), AccessKind::Write).unwrap();
        let frame = frame_of(&space, 0x1000);
        assert_eq!(frame_of(&space, 0x5000), frame);
        write_byte(&space, 0x1000, 0x5A);

        space.unmap(range(0x1000, 0x1100)).unwrap();
        assert_eq!(frame_of(&space, 0x5000), frame);
        assert_eq!(read_byte(&space, 0x5000), 0x5A);
        let page = frames.page(frame).unwrap();
        assert!(!page.is_free());
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(page.map_count(), 1);

        let fresh = frames.allocate_frame().unwrap();
        assert_ne!(fresh, frame);
        frames.release(fresh).unwrap();

        space.unmap(range(0x5000, 0x5100)).unwrap();
        assert!(frames.page(frame).unwrap().is_free());
    }

    #[test]
    fn fork_keeps_aliases_of_one_object_coherent() {
        let (_cpus, _shootdown, parent) = setup(1);
        let frames = Arc::clone(parent.frames());
        let object = BackingObject::new_anonymous(Arc::clone(&frames), 0x100);
        parent
            .map(range(0x1000, 0x1100), rw(), Arc::clone(&object), 0)
            .unwrap();
        parent.map(range(0x5000, 0x5100), rw(), object, 0).unwrap();
        parent.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        parent.handle_fault(addr(0x5000), AccessKind::Read).unwrap();
        write_byte(&parent, 0x1000, 0x11);
        assert_eq!(read_byte(&parent, 0x5000), 0x11);
        let shared = frame_of(&parent, 0x1000);

        let child = parent.fork().unwrap();
        let regions = child.regions();
        assert_eq!(regions.len(), 2);
        assert!(Arc::ptr_eq(regions[0].object(), regions[1].object()));
        assert_eq!(frames.ref_count(shared), 2);
        assert_eq!(frames.page(shared).unwrap().map_count(), 4);

        child.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        write_byte(&child, 0x1000, 0x22);
        child.handle_fault(addr(0x5000), AccessKind::Read).unwrap();
        assert_eq!(read_byte(&child, 0x5000), 0x22);
        assert_eq!(frame_of(&child, 0x5000), frame_of(&child, 0x1000));

        assert_eq!(read_byte(&parent, 0x1000), 0x11);
        assert_eq!(read_byte(&parent, 0x5000), 0x11);
        assert_eq!(frames.ref_count(shared), 1);
        assert_eq!(frames.page(shared).unwrap().map_count(), 2);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let (_cpus, _shootdown, parent) = setup(1);
        let frames = Arc::clone(parent.frames());
        let free = frames.free_frames();

        let anonymous = BackingObject::new_anonymous(Arc::clone(&frames), 0x400);
        parent.map(range(0x1000, 0x1400), rw(), anonymous, 0).unwrap();
        let zeroes = BackingObject::new_copy_on_write(Arc::clone(&frames), 0x200);
        parent.map(range(0x5000, 0x5200), rw(), zeroes, 0).unwrap();

        parent.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        parent.handle_fault(addr(0x1300), AccessKind::Read).unwrap();
        parent.handle_fault(addr(0x5000), AccessKind::Read).unwrap();
        parent.handle_fault(addr(0x5100), AccessKind::Write).unwrap();

        let child = parent.fork().unwrap();
        child.handle_fault(addr(0x1000), AccessKind::Write).unwrap();
        child.handle_fault(addr(0x5000), AccessKind::Write).unwrap();
        child.destroy();
        parent.destroy();

        // The root table was allocated before `free` was sampled.
        assert_eq!(frames.free_frames(), free + 1);
        assert_eq!(frames.ref_count(frames.zero_frame()), 1);
        assert_eq!(frames.page(frames.zero_frame()).unwrap().map_count(), 0);
    }

    /// Unmaps the region it backs while its content is being read.
    struct UnmappingFile {
        space: spin::Mutex<Option<Arc<AddressSpace>>>,
    }

    impl FileSource for UnmappingFile {
        fn read_page(&self, _page: usize, buf: &mut [u8]) -> Result<(), IoError> {
            if let Some(space) = self.space.lock().take() {
                space.unmap(range(0x2000, 0x2100)).unwrap();
            }
            buf.fill(7);
            Ok(())
        }
    }

    #[test]
    fn fault_revalidates_after_population() {
        let (_cpus, _shootdown, space) = setup(1);
        let frames = Arc::clone(space.frames());
        let space = Arc::new(space);

        let file = Arc::new(UnmappingFile {
            space: spin::Mutex::new(Some(Arc::clone(&space))),
        });
        let object = BackingObject::new_file_backed(Arc::clone(&frames), file, 0x100);
        space.map(range(0x2000, 0x2100), rw(), object, 0).unwrap();
        let free = frames.free_frames();

        assert_eq!(
            space.handle_fault(addr(0x2000), AccessKind::Read),
            Err(FaultError::NoSuchMapping)
        );
        assert!(space.regions().is_empty());
        assert_eq!(space.translate(addr(0x2000)), None);
        assert_eq!(frames.free_frames(), free);
    }
}
