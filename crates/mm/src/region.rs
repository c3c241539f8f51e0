//! Virtual memory regions and the per-address-space region tree.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use bitflags::bitflags;
use thiserror::Error;

use crate::arch::{PAGE_SIZE, PageFlags};
use crate::{AllocError, BackingObject, VirtualAddress, VirtualRange};

bitflags! {
    /// Access rights of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
    }
}

impl Permissions {
    /// Page-table flags for a page of a region with these permissions.
    ///
    /// `writable` is false when the page must stay read-only even though the region allows writes,
    /// as for frames shared copy-on-write.
    pub fn page_flags(self, writable: bool) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_writable(writable && self.contains(Self::WRITE));
        flags.set_user(self.contains(Self::USER));
        flags.set_no_execute(!self.contains(Self::EXECUTE));
        flags
    }
}

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("range or offset is not page-aligned")]
    Unaligned,
    #[error("range is empty or reversed")]
    InvalidRange,
    #[error("range lies outside the address space or the backing object")]
    OutOfBounds,
    #[error("no mapping covers the range")]
    NoSuchMapping,
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        Self::OutOfPhysicalMemory
    }
}

/// A contiguous range of one address space backed by one object.
#[derive(Clone)]
pub struct Region {
    range: VirtualRange,
    permissions: Permissions,
    object: Arc<BackingObject>,
    /// Page offset into `object` of the region's first page.
    offset: usize,
}

impl Region {
    /// Creates a region.
    ///
    /// # Panics
    ///
    /// Panics if `range` is empty or not page-aligned.
    pub fn new(
        range: VirtualRange,
        permissions: Permissions,
        object: Arc<BackingObject>,
        offset: usize,
    ) -> Self {
        assert!(
            !range.is_empty() && range.is_page_aligned(),
            "region range must be page-aligned and non-empty"
        );
        Self {
            range,
            permissions,
            object,
            offset,
        }
    }

    pub fn range(&self) -> VirtualRange {
        self.range
    }

    pub fn start(&self) -> VirtualAddress {
        self.range.start()
    }

    pub fn end(&self) -> VirtualAddress {
        self.range.end()
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn object(&self) -> &Arc<BackingObject> {
        &self.object
    }

    /// Returns the page offset into the backing object of the region's first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.range.contains(addr)
    }

    /// Returns the backing object page offset for `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the region does not contain `addr`.
    pub fn translate(&self, addr: VirtualAddress) -> usize {
        assert!(self.contains(addr), "{} is outside {:?}", addr, self.range);
        self.offset + (addr - self.range.start()) / PAGE_SIZE
    }

    /// Returns the object page offsets covered by `range`, clamped to this region.
    pub fn object_pages(&self, range: &VirtualRange) -> Range<usize> {
        match self.range.intersect(range) {
            Some(overlap) => {
                let first = self.translate(overlap.start());
                first..first + overlap.page_count()
            }
            None => self.offset..self.offset,
        }
    }

    /// Splits the region at `addr` into `[start, addr)` and `[addr, end)`.
    ///
    /// Both halves reference the same object; the upper half's offset is advanced.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not page-aligned or not strictly inside the region.
    pub fn split_at(self, addr: VirtualAddress) -> (Region, Region) {
        assert!(addr.is_aligned(PAGE_SIZE), "split address must be page-aligned");
        assert!(
            addr > self.range.start() && addr < self.range.end(),
            "split address {} is not inside {:?}",
            addr,
            self.range
        );

        let upper = Region {
            range: VirtualRange::new(addr, self.range.end()),
            permissions: self.permissions,
            object: Arc::clone(&self.object),
            offset: self.translate(addr),
        };
        let lower = Region {
            range: VirtualRange::new(self.range.start(), addr),
            ..self
        };
        (lower, upper)
    }

    pub(crate) fn set_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("range", &self.range)
            .field("permissions", &self.permissions)
            .field("object", &self.object.id())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Non-overlapping regions ordered by start address.
#[derive(Debug, Default, Clone)]
pub struct RegionTree {
    regions: BTreeMap<VirtualAddress, Region>,
}

impl RegionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// Inserts a region, failing with [`MapError::Overlap`] if it intersects an existing one.
    pub fn insert(&mut self, region: Region) -> Result<(), MapError> {
        if self.overlapping(&region.range()).next().is_some() {
            return Err(MapError::Overlap);
        }
        self.regions.insert(region.start(), region);
        Ok(())
    }

    /// Returns the region containing `addr`.
    pub fn find(&self, addr: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Iterates over the regions intersecting `range`, in address order.
    pub fn overlapping(&self, range: &VirtualRange) -> impl Iterator<Item = &Region> {
        // Only the last region starting before `range` can reach into it.
        let first = self
            .regions
            .range(..range.start())
            .next_back()
            .map(|(&start, _)| start)
            .unwrap_or(range.start());
        let range = *range;
        self.regions
            .range(first..)
            .map(|(_, region)| region)
            .take_while(move |region| region.start() < range.end())
            .filter(move |region| region.range().overlaps(&range))
    }

    /// Returns true if every address of `range` belongs to some region.
    pub fn covers(&self, range: &VirtualRange) -> bool {
        let mut next = range.start();
        for region in self.overlapping(range) {
            if region.start() > next {
                return false;
            }
            next = region.end();
        }
        next >= range.end()
    }

    /// Removes `range` from the tree.
    ///
    /// Regions straddling a boundary are split and keep their outside parts. Returns the removed
    /// pieces, each lying entirely within `range`, in address order.
    pub fn remove_range(&mut self, range: &VirtualRange) -> Vec<Region> {
        let starts: Vec<VirtualAddress> = self
            .overlapping(range)
            .map(|region| region.start())
            .collect();

        let mut removed = Vec::with_capacity(starts.len());
        for start in starts {
            let Some(mut region) = self.regions.remove(&start) else {
                continue;
            };

            if region.start() < range.start() {
                let (lower, upper) = region.split_at(range.start());
                self.regions.insert(lower.start(), lower);
                region = upper;
            }
            if region.end() > range.end() {
                let (lower, upper) = region.split_at(range.end());
                self.regions.insert(upper.start(), upper);
                region = lower;
            }
            removed.push(region);
        }

        removed
    }

    /// Splits regions so that no region straddles either end of `range`.
    pub fn split_boundaries(&mut self, range: &VirtualRange) {
        for boundary in [range.start(), range.end()] {
            let Some(start) = self
                .find(boundary)
                .filter(|region| region.start() != boundary)
                .map(Region::start)
            else {
                continue;
            };
            if let Some(region) = self.regions.remove(&start) {
                let (lower, upper) = region.split_at(boundary);
                self.regions.insert(lower.start(), lower);
                self.regions.insert(upper.start(), upper);
            }
        }
    }

    /// Mutable access to the regions lying within `range`, after [`Self::split_boundaries`].
    pub(crate) fn within_mut(&mut self, range: &VirtualRange) -> impl Iterator<Item = &mut Region> {
        let range = *range;
        self.regions
            .range_mut(range.start()..range.end())
            .map(|(_, region)| region)
            .filter(move |region| range.covers(&region.range()))
    }

    /// Finds the lowest page-aligned address in `[floor, ceiling)` where `len` bytes fit between
    /// existing regions.
    pub fn find_gap(
        &self,
        len: usize,
        floor: VirtualAddress,
        ceiling: VirtualAddress,
    ) -> Option<VirtualAddress> {
        if len == 0 {
            return None;
        }

        let mut candidate = floor.align_up(PAGE_SIZE);
        let fits = |start: VirtualAddress| {
            start
                .as_usize()
                .checked_add(len)
                .is_some_and(|end| end <= ceiling.as_usize())
        };

        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start() >= candidate && region.start() - candidate >= len {
                break;
            }
            candidate = region.end();
        }

        fits(candidate).then_some(candidate)
    }

    /// Checks that regions are sorted, non-empty and pairwise disjoint.
    pub fn is_disjoint(&self) -> bool {
        let mut previous_end: Option<VirtualAddress> = None;
        for (&start, region) in &self.regions {
            if start != region.start() || region.range().is_empty() {
                return false;
            }
            if previous_end.is_some_and(|end| end > start) {
                return false;
            }
            previous_end = Some(region.end());
        }
        true
    }

    /// Removes every region, in address order.
    pub fn take_all(&mut self) -> Vec<Region> {
        core::mem::take(&mut self.regions).into_values().collect()
    }
}
