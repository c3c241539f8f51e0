//! Backing objects: the source of truth for the content of a range of pages.
//!
//! A [`BackingObject`] owns a sparse, offset-ordered collection of [`BackedPhysicalPage`]s and
//! decides how a page is produced on first access, what happens on a write to a shared page, and
//! whether a page can be dropped again. Four policies exist:
//!
//! - Anonymous: zero-filled, privately owned pages.
//! - File-backed: pages read from a [`FileSource`], evictable when clean and unmapped.
//! - Shared: zero-filled pages that every mapper sees and writes directly.
//! - Copy-on-write: pages start out as the canonical zero frame, mapped read-only, and turn into
//!   private copies on the first write.
//!
//! Objects are reference counted with `Arc`; the regions mapping an object hold the references.
//! Frames point back at their owner through an id stored in the page database, never through an
//! owning pointer.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU32;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::arch::PAGE_SIZE;
use crate::{AllocError, FrameAllocator, FrameNumber};

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a backing object in frame back-references and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackingObjectId(NonZeroU32);

impl BackingObjectId {
    fn next() -> Self {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        match NonZeroU32::new(id) {
            Some(id) => Self(id),
            None => panic!("backing object ids exhausted"),
        }
    }

    /// Rebuilds an id from its raw value; zero means "no object".
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for BackingObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Error reported by a [`FileSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("i/o error {0}")]
pub struct IoError(pub i32);

/// Content provider for file-backed objects, implemented by the page cache.
pub trait FileSource: Send + Sync {
    /// Fills `buf` (one page) with the content of page number `page` of the file.
    fn read_page(&self, page: usize, buf: &mut [u8]) -> Result<(), IoError>;
}

/// Errors that can occur while producing a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopulateError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("failed to read page content: {0}")]
    Io(#[from] IoError),
    #[error("page offset beyond the end of the object")]
    OutOfBounds,
}

impl From<AllocError> for PopulateError {
    fn from(err: AllocError) -> Self {
        if err != AllocError::OutOfPhysicalMemory {
            log::error!("frame allocator failed while populating: {}", err);
        }
        Self::OutOfPhysicalMemory
    }
}

/// Reasons a page cannot be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EvictError {
    #[error("page has unwritten modifications")]
    Dirty,
    #[error("page is mapped")]
    Mapped,
}

/// The population policy of a backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anonymous,
    FileBacked,
    Shared,
    CopyOnWrite,
}

impl BackingKind {
    /// Returns true if pages are private to the object, so fork must copy-on-write them.
    pub fn is_private(self) -> bool {
        matches!(self, Self::Anonymous | Self::CopyOnWrite)
    }
}

enum Source {
    Anonymous,
    File(Arc<dyn FileSource>),
    Shared,
    CopyOnWrite,
}

/// A frame held by a backing object at some page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackedPhysicalPage {
    pub frame: FrameNumber,
    /// Written since it was last read or cleaned (file-backed objects only).
    pub dirty: bool,
}

/// How a populated page may be mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// The frame may be mapped writable: the object holds the only reference, or is a Shared object.
    Private,
    /// The frame must be mapped read-only: it is shared copy-on-write, or it is a clean file page
    /// whose first write has to be seen.
    Shared,
}

/// Result of [`BackingObject::populate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Populated {
    pub frame: FrameNumber,
    pub state: PageState,
}

/// Result of [`BackingObject::handle_write_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFault {
    /// The frame to map writable.
    pub frame: FrameNumber,
    /// The frame this object stopped referencing. The caller owns that reference and must release
    /// it only after every stale translation of it has been shot down.
    pub replaced: Option<FrameNumber>,
}

/// The source of truth for a range of page-granular content.
pub struct BackingObject {
    id: BackingObjectId,
    source: Source,
    pages: usize,
    frames: Arc<FrameAllocator>,
    map: spin::Mutex<BTreeMap<usize, BackedPhysicalPage>>,
}

impl BackingObject {
    /// Creates an object of zero-filled, private pages covering `len` bytes.
    pub fn new_anonymous(frames: Arc<FrameAllocator>, len: usize) -> Arc<Self> {
        Self::new(frames, Source::Anonymous, len)
    }

    /// Creates an object whose pages are read from `file`, covering `len` bytes.
    pub fn new_file_backed(
        frames: Arc<FrameAllocator>,
        file: Arc<dyn FileSource>,
        len: usize,
    ) -> Arc<Self> {
        Self::new(frames, Source::File(file), len)
    }

    /// Creates an object whose zero-filled pages are shared by every mapper.
    pub fn new_shared(frames: Arc<FrameAllocator>, len: usize) -> Arc<Self> {
        Self::new(frames, Source::Shared, len)
    }

    /// Creates an object whose pages start as the zero frame and are copied on the first write.
    pub fn new_copy_on_write(frames: Arc<FrameAllocator>, len: usize) -> Arc<Self> {
        Self::new(frames, Source::CopyOnWrite, len)
    }

    fn new(frames: Arc<FrameAllocator>, source: Source, len: usize) -> Arc<Self> {
        let object = Self {
            id: BackingObjectId::next(),
            source,
            pages: len.div_ceil(PAGE_SIZE),
            frames,
            map: spin::Mutex::new(BTreeMap::new()),
        };
        log::debug!(
            "{}: new {:?} object of {} pages",
            object.id,
            object.kind(),
            object.pages
        );
        Arc::new(object)
    }

    /// Creates an empty object of the same kind and size, used as a fork child.
    ///
    /// File-backed children read from the same file.
    pub fn fork(&self) -> Arc<Self> {
        let source = match &self.source {
            Source::Anonymous => Source::Anonymous,
            Source::File(file) => Source::File(Arc::clone(file)),
            Source::Shared => Source::Shared,
            Source::CopyOnWrite => Source::CopyOnWrite,
        };
        Self::new(Arc::clone(&self.frames), source, self.pages * PAGE_SIZE)
    }

    pub fn id(&self) -> BackingObjectId {
        self.id
    }

    pub fn kind(&self) -> BackingKind {
        match self.source {
            Source::Anonymous => BackingKind::Anonymous,
            Source::File(_) => BackingKind::FileBacked,
            Source::Shared => BackingKind::Shared,
            Source::CopyOnWrite => BackingKind::CopyOnWrite,
        }
    }

    /// Returns the size of the object in pages.
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Returns the number of pages currently backed by a frame.
    pub fn resident_pages(&self) -> usize {
        self.map.lock().len()
    }

    /// Returns the frame at `offset`, if the page is populated.
    pub fn frame_at(&self, offset: usize) -> Option<FrameNumber> {
        self.map.lock().get(&offset).map(|page| page.frame)
    }

    /// Returns the frame backing page `offset`, producing it on first access.
    ///
    /// File content is read without holding the object's lock. If another CPU populated the same
    /// offset in the meantime, its frame wins and ours is released.
    pub fn populate(&self, offset: usize) -> Result<Populated, PopulateError> {
        self.check_bounds(offset)?;

        let existing = self.map.lock().get(&offset).copied();
        let page = match existing {
            Some(page) => page,
            None => self.fill(offset, false)?,
        };

        Ok(Populated {
            frame: page.frame,
            state: self.state_of(&page),
        })
    }

    /// Resolves a write to page `offset`, returning the frame to map writable.
    ///
    /// An unpopulated page is populated privately. A page only this object references is upgraded
    /// in place. A shared page (reference count above one, or the zero frame) is copied into a
    /// fresh private frame while the object's lock is held, so concurrent faults on the same offset
    /// observe either the old frame or the finished copy.
    pub fn handle_write_fault(&self, offset: usize) -> Result<WriteFault, PopulateError> {
        self.check_bounds(offset)?;

        loop {
            let mut map = self.map.lock();
            let Some(page) = map.get_mut(&offset) else {
                drop(map);
                self.fill(offset, true)?;
                continue;
            };

            match self.source {
                Source::Shared => {
                    return Ok(WriteFault {
                        frame: page.frame,
                        replaced: None,
                    });
                }
                Source::File(_) => {
                    page.dirty = true;
                    return Ok(WriteFault {
                        frame: page.frame,
                        replaced: None,
                    });
                }
                Source::Anonymous | Source::CopyOnWrite => {}
            }

            let old = page.frame;
            if self.state_of(page) == PageState::Private {
                // The last holder of a frame shared by fork becomes its owner.
                self.claim(old, offset);
                return Ok(WriteFault {
                    frame: old,
                    replaced: None,
                });
            }

            let new = self.frames.allocate_frame()?;
            if !self.frames.is_zero_frame(old) {
                self.frames.copy(old, new);
            }
            self.claim(new, offset);
            page.frame = new;

            log::debug!(
                "{}: copy-on-write at page {}: {} -> {}",
                self.id,
                offset,
                old,
                new
            );
            return Ok(WriteFault {
                frame: new,
                replaced: Some(old),
            });
        }
    }

    /// Shares the frame at `offset` with `child` without copying, adding one reference.
    ///
    /// Both objects now see the page as shared, so each maps it read-only until a write fault
    /// gives that side a private copy. Returns the shared frame, or `None` if the page is not
    /// populated.
    pub fn fork_copy_on_write(
        &self,
        offset: usize,
        child: &BackingObject,
    ) -> Result<Option<FrameNumber>, PopulateError> {
        let map = self.map.lock();
        let Some(page) = map.get(&offset) else {
            return Ok(None);
        };

        let mut child_map = child.map.lock();
        // Aliased regions of one object fork each offset once.
        if child_map.get(&offset).is_some_and(|shared| shared.frame == page.frame) {
            return Ok(Some(page.frame));
        }

        self.frames.share(page.frame)?;
        let previous = child_map.insert(
            offset,
            BackedPhysicalPage {
                frame: page.frame,
                dirty: false,
            },
        );
        drop(child_map);
        if let Some(previous) = previous {
            self.release_frame(previous.frame);
        }

        Ok(Some(page.frame))
    }

    /// Drops a clean, unmapped page of a file-backed object back to the allocator.
    ///
    /// Returns `Ok(true)` if a frame was released. Other kinds have nowhere to refetch content
    /// from, so this is a no-op returning `Ok(false)` for them.
    pub fn evict(&self, offset: usize) -> Result<bool, EvictError> {
        if self.kind() != BackingKind::FileBacked {
            return Ok(false);
        }

        let mut map = self.map.lock();
        let Some(page) = map.get(&offset) else {
            return Ok(false);
        };
        if page.dirty {
            return Err(EvictError::Dirty);
        }
        if self
            .frames
            .page(page.frame)
            .is_some_and(|p| p.map_count() > 0)
        {
            return Err(EvictError::Mapped);
        }

        let frame = page.frame;
        map.remove(&offset);
        drop(map);

        log::trace!("{}: evicted page {} ({})", self.id, offset, frame);
        self.release_frame(frame);
        Ok(true)
    }

    /// Clears the dirty bit of page `offset` after writeback. Returns the previous dirty state.
    ///
    /// A dirty page still mapped somewhere stays dirty: the mapping that dirtied it is writable
    /// and later stores would never reach the file. It can be cleaned once every mapping is gone.
    pub fn mark_clean(&self, offset: usize) -> Result<bool, EvictError> {
        let mut map = self.map.lock();
        let Some(page) = map.get_mut(&offset) else {
            return Ok(false);
        };
        if !page.dirty {
            return Ok(false);
        }
        if self
            .frames
            .page(page.frame)
            .is_some_and(|p| p.map_count() > 0)
        {
            return Err(EvictError::Mapped);
        }

        page.dirty = false;
        Ok(true)
    }

    /// Returns the offsets of every dirty page, in order.
    pub fn dirty_pages(&self) -> Vec<usize> {
        self.map
            .lock()
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(&offset, _)| offset)
            .collect()
    }

    /// Returns the populated pages whose offsets fall in `range`, in order.
    pub fn pages_in(&self, range: Range<usize>) -> Vec<(usize, BackedPhysicalPage)> {
        self.map
            .lock()
            .range(range)
            .map(|(&offset, &page)| (offset, page))
            .collect()
    }

    /// Removes the pages in `range` from a private object and returns their frames.
    ///
    /// The caller owns the returned references and releases them once no translation of them can
    /// remain. Shared and file-backed objects keep their pages and return nothing.
    pub fn discard(&self, range: Range<usize>) -> Vec<FrameNumber> {
        if !self.kind().is_private() {
            return Vec::new();
        }

        let mut map = self.map.lock();
        let offsets: Vec<usize> = map.range(range).map(|(&offset, _)| offset).collect();
        offsets
            .into_iter()
            .filter_map(|offset| map.remove(&offset))
            .map(|page| page.frame)
            .collect()
    }

    fn check_bounds(&self, offset: usize) -> Result<(), PopulateError> {
        if offset < self.pages {
            Ok(())
        } else {
            Err(PopulateError::OutOfBounds)
        }
    }

    /// Produces a frame for an unpopulated offset and installs it, unless another CPU won the race.
    fn fill(&self, offset: usize, write: bool) -> Result<BackedPhysicalPage, PopulateError> {
        let frame = match &self.source {
            Source::CopyOnWrite if !write => {
                let zero = self.frames.zero_frame();
                self.frames.share(zero)?;
                zero
            }
            Source::File(file) => {
                let frame = self.frames.allocate_frame()?;
                // SAFETY: The frame was just allocated and is not reachable by anyone else.
                let buf = unsafe { self.frames.frame_bytes_mut(frame) };
                if let Err(err) = file.read_page(offset, buf) {
                    log::warn!("{}: reading page {} failed: {}", self.id, offset, err);
                    self.release_frame(frame);
                    return Err(err.into());
                }
                frame
            }
            _ => self.frames.allocate_frame()?,
        };

        let mut map = self.map.lock();
        if let Some(&existing) = map.get(&offset) {
            drop(map);
            self.release_frame(frame);
            return Ok(existing);
        }

        let page = BackedPhysicalPage {
            frame,
            dirty: false,
        };
        self.claim(frame, offset);
        map.insert(offset, page);
        log::trace!("{}: populated page {} with {}", self.id, offset, frame);
        Ok(page)
    }

    /// Records this object as the owner of a freshly produced frame.
    fn claim(&self, frame: FrameNumber, offset: usize) {
        if self.frames.is_zero_frame(frame) {
            return;
        }
        if let Some(page) = self.frames.page(frame) {
            page.set_owner(self.id, offset);
        }
    }

    fn state_of(&self, page: &BackedPhysicalPage) -> PageState {
        let read_only = match self.source {
            Source::Anonymous | Source::CopyOnWrite => {
                self.frames.is_zero_frame(page.frame) || self.frames.ref_count(page.frame) > 1
            }
            Source::File(_) => !page.dirty,
            Source::Shared => false,
        };
        if read_only {
            PageState::Shared
        } else {
            PageState::Private
        }
    }

    fn release_frame(&self, frame: FrameNumber) {
        if let Err(err) = self.frames.release(frame) {
            log::error!("{}: failed to release {}: {}", self.id, frame, err);
        }
    }
}

impl Drop for BackingObject {
    fn drop(&mut self) {
        let map = core::mem::take(self.map.get_mut());
        log::debug!("{}: dropped with {} resident pages", self.id, map.len());
        for page in map.into_values() {
            self.release_frame(page.frame);
        }
    }
}

impl fmt::Debug for BackingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingObject")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("pages", &self.pages)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing;

    /// A file whose page `n` is filled with the byte `n + 1`.
    struct PatternFile {
        reads: AtomicUsize,
        fail: bool,
    }

    impl PatternFile {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                fail: false,
            })
        }
    }

    impl FileSource for PatternFile {
        fn read_page(&self, page: usize, buf: &mut [u8]) -> Result<(), IoError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(IoError(5));
            }
            buf.fill(page as u8 + 1);
            Ok(())
        }
    }

    fn bytes(frames: &FrameAllocator, frame: FrameNumber) -> &[u8] {
        unsafe { frames.frame_bytes(frame) }
    }

    #[test]
    fn anonymous_pages_are_zeroed_and_private() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_anonymous(Arc::clone(&frames), 4 * PAGE_SIZE);

        let populated = object.populate(1).unwrap();
        assert_eq!(populated.state, PageState::Private);
        assert!(bytes(&frames, populated.frame).iter().all(|&b| b == 0));
        assert_eq!(object.populate(1).unwrap(), populated);
        assert_eq!(
            frames.page(populated.frame).unwrap().owner(),
            Some((object.id(), 1))
        );
        assert_eq!(object.populate(4), Err(PopulateError::OutOfBounds));
    }

    #[test]
    fn copy_on_write_starts_on_the_zero_frame() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_copy_on_write(Arc::clone(&frames), 2 * PAGE_SIZE);

        let populated = object.populate(0).unwrap();
        assert_eq!(populated.frame, frames.zero_frame());
        assert_eq!(populated.state, PageState::Shared);
        assert_eq!(frames.ref_count(frames.zero_frame()), 2);

        let fault = object.handle_write_fault(0).unwrap();
        assert_ne!(fault.frame, frames.zero_frame());
        assert_eq!(fault.replaced, Some(frames.zero_frame()));
        assert!(bytes(&frames, fault.frame).iter().all(|&b| b == 0));

        frames.release(frames.zero_frame()).unwrap();
        assert_eq!(frames.ref_count(frames.zero_frame()), 1);
    }

    #[test]
    fn write_to_unpopulated_copy_on_write_page_skips_the_zero_frame() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_copy_on_write(Arc::clone(&frames), PAGE_SIZE);

        let fault = object.handle_write_fault(0).unwrap();
        assert_ne!(fault.frame, frames.zero_frame());
        assert_eq!(fault.replaced, None);
        assert_eq!(frames.ref_count(frames.zero_frame()), 1);
    }

    #[test]
    fn sole_reference_is_upgraded_in_place() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_anonymous(Arc::clone(&frames), PAGE_SIZE);

        let frame = object.populate(0).unwrap().frame;
        let fault = object.handle_write_fault(0).unwrap();
        assert_eq!(fault, WriteFault { frame, replaced: None });
    }

    #[test]
    fn fork_shares_then_copies() {
        let frames = testing::frame_allocator();
        let parent = BackingObject::new_anonymous(Arc::clone(&frames), 2 * PAGE_SIZE);
        let frame = parent.populate(0).unwrap().frame;
        unsafe { frames.frame_bytes_mut(frame) }.fill(0x11);

        let child = parent.fork();
        assert_eq!(child.kind(), BackingKind::Anonymous);
        assert_eq!(parent.fork_copy_on_write(0, &child), Ok(Some(frame)));
        assert_eq!(parent.fork_copy_on_write(1, &child), Ok(None));
        assert_eq!(frames.ref_count(frame), 2);
        assert_eq!(child.populate(0).unwrap().state, PageState::Shared);
        assert_eq!(parent.populate(0).unwrap().state, PageState::Shared);

        let fault = child.handle_write_fault(0).unwrap();
        assert_eq!(fault.replaced, Some(frame));
        assert!(bytes(&frames, fault.frame).iter().all(|&b| b == 0x11));

        // The caller drops the replaced reference once translations are gone.
        frames.release(frame).unwrap();
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(parent.populate(0).unwrap().state, PageState::Private);
        assert_eq!(parent.handle_write_fault(0).unwrap().replaced, None);
    }

    #[test]
    fn forking_an_offset_twice_adds_one_reference() {
        let frames = testing::frame_allocator();
        let parent = BackingObject::new_anonymous(Arc::clone(&frames), PAGE_SIZE);
        let frame = parent.populate(0).unwrap().frame;

        let child = parent.fork();
        assert_eq!(parent.fork_copy_on_write(0, &child), Ok(Some(frame)));
        assert_eq!(parent.fork_copy_on_write(0, &child), Ok(Some(frame)));
        assert_eq!(frames.ref_count(frame), 2);
    }

    #[test]
    fn last_sharer_takes_ownership_of_the_frame() {
        let frames = testing::frame_allocator();
        let parent = BackingObject::new_anonymous(Arc::clone(&frames), PAGE_SIZE);
        let frame = parent.populate(0).unwrap().frame;

        let child = parent.fork();
        parent.fork_copy_on_write(0, &child).unwrap();
        let fault = parent.handle_write_fault(0).unwrap();
        assert_eq!(fault.replaced, Some(frame));
        assert_eq!(
            frames.page(fault.frame).unwrap().owner(),
            Some((parent.id(), 0))
        );
        frames.release(frame).unwrap();

        // Still tagged with the parent until the child writes.
        assert_eq!(frames.page(frame).unwrap().owner(), Some((parent.id(), 0)));
        let fault = child.handle_write_fault(0).unwrap();
        assert_eq!(fault, WriteFault { frame, replaced: None });
        assert_eq!(frames.page(frame).unwrap().owner(), Some((child.id(), 0)));
    }

    #[test]
    fn shared_objects_write_in_place() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_shared(Arc::clone(&frames), PAGE_SIZE);

        let frame = object.populate(0).unwrap().frame;
        let fault = object.handle_write_fault(0).unwrap();
        assert_eq!(fault, WriteFault { frame, replaced: None });
        assert_eq!(object.populate(0).unwrap().state, PageState::Private);
        assert!(object.discard(0..1).is_empty());
    }

    #[test]
    fn file_backed_pages_are_read_and_tracked_dirty() {
        let frames = testing::frame_allocator();
        let file = PatternFile::new();
        let object =
            BackingObject::new_file_backed(Arc::clone(&frames), file.clone(), 3 * PAGE_SIZE);

        let populated = object.populate(2).unwrap();
        let frame = populated.frame;
        assert_eq!(populated.state, PageState::Shared);
        assert!(bytes(&frames, frame).iter().all(|&b| b == 3));
        object.populate(2).unwrap();
        assert_eq!(file.reads.load(Ordering::Relaxed), 1);

        assert!(object.dirty_pages().is_empty());
        object.handle_write_fault(2).unwrap();
        assert_eq!(object.dirty_pages(), vec![2]);
        assert_eq!(object.populate(2).unwrap().state, PageState::Private);

        assert_eq!(object.evict(2), Err(EvictError::Dirty));
        frames.page(frame).unwrap().map();
        assert_eq!(object.mark_clean(2), Err(EvictError::Mapped));
        assert_eq!(object.dirty_pages(), vec![2]);
        frames.page(frame).unwrap().unmap();
        assert_eq!(object.mark_clean(2), Ok(true));
        assert_eq!(object.mark_clean(2), Ok(false));

        frames.page(frame).unwrap().map();
        assert_eq!(object.evict(2), Err(EvictError::Mapped));
        frames.page(frame).unwrap().unmap();

        let free = frames.free_frames();
        assert_eq!(object.evict(2), Ok(true));
        assert_eq!(frames.free_frames(), free + 1);
        assert_eq!(object.evict(2), Ok(false));

        // Refetched on the next access.
        object.populate(2).unwrap();
        assert_eq!(file.reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn read_failures_release_the_frame() {
        let frames = testing::frame_allocator();
        let file = Arc::new(PatternFile {
            reads: AtomicUsize::new(0),
            fail: true,
        });
        let object = BackingObject::new_file_backed(Arc::clone(&frames), file, PAGE_SIZE);

        let free = frames.free_frames();
        assert_eq!(object.populate(0), Err(PopulateError::Io(IoError(5))));
        assert_eq!(frames.free_frames(), free);
        assert_eq!(object.resident_pages(), 0);
    }

    #[test]
    fn evict_is_a_no_op_for_memory_objects() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_anonymous(Arc::clone(&frames), PAGE_SIZE);
        object.populate(0).unwrap();
        assert_eq!(object.evict(0), Ok(false));
        assert_eq!(object.resident_pages(), 1);
    }

    #[test]
    fn range_queries_and_discard() {
        let frames = testing::frame_allocator();
        let object = BackingObject::new_anonymous(Arc::clone(&frames), 8 * PAGE_SIZE);
        for offset in [1, 3, 4, 7] {
            object.populate(offset).unwrap();
        }

        let offsets: Vec<usize> = object.pages_in(2..5).iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![3, 4]);

        let discarded = object.discard(3..8);
        assert_eq!(discarded.len(), 3);
        assert_eq!(object.resident_pages(), 1);
        for frame in discarded {
            assert_eq!(frames.release(frame), Ok(true));
        }
    }

    #[test]
    fn dropping_the_last_reference_frees_every_frame() {
        let frames = testing::frame_allocator();
        let free = frames.free_frames();

        let object = BackingObject::new_copy_on_write(Arc::clone(&frames), 4 * PAGE_SIZE);
        object.populate(0).unwrap();
        object.handle_write_fault(1).unwrap();
        object.handle_write_fault(2).unwrap();
        assert_eq!(frames.free_frames(), free - 2);

        drop(object);
        assert_eq!(frames.free_frames(), free);
        assert_eq!(frames.ref_count(frames.zero_frame()), 1);
    }

    #[test]
    fn concurrent_write_faults_copy_once() {
        let frames = testing::frame_allocator();
        let translator = testing::translator();
        let object = BackingObject::new_copy_on_write(Arc::clone(&frames), PAGE_SIZE);
        object.populate(0).unwrap();

        let results: Vec<WriteFault> = (0..4)
            .map(|_| {
                let object = Arc::clone(&object);
                let translator = translator.clone();
                std::thread::spawn(move || {
                    crate::AddressTranslator::set_current(translator);
                    object.handle_write_fault(0).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let frame = object.frame_at(0).unwrap();
        assert!(results.iter().all(|fault| fault.frame == frame));
        let replaced = results.iter().filter(|fault| fault.replaced.is_some()).count();
        assert_eq!(replaced, 1);
    }
}
