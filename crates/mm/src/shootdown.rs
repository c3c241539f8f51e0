//! Cross-CPU TLB shootdown.
//!
//! A CPU that removes or downgrades a translation other CPUs may have cached posts a request into
//! each target's mailbox, rings them with an IPI and waits until every target acknowledged. Only
//! then may frames the translation pointed at go back to the allocator; [`Flusher`] holds such
//! deferred work until the shootdown it belongs to has completed.
//!
//! A CPU waiting for acknowledgments keeps servicing its own mailbox, so two CPUs shooting each
//! other down at the same time both make progress.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch;
use crate::{FrameAllocator, FrameNumber, Region, VirtualRange};

/// Largest number of CPUs a [`CpuSet`] can describe.
pub const MAX_CPUS: usize = 64;

/// Interrupt vector used for shootdown IPIs.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xF0;

/// A set of CPU indexes.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of CPUs `0..count`.
    pub const fn all(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn single(cpu: usize) -> Self {
        Self::empty().with(cpu)
    }

    /// # Panics
    ///
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub const fn with(self, cpu: usize) -> Self {
        assert!(cpu < MAX_CPUS, "cpu index out of range");
        Self(self.0 | 1 << cpu)
    }

    pub const fn without(self, cpu: usize) -> Self {
        if cpu >= MAX_CPUS {
            return self;
        }
        Self(self.0 & !(1 << cpu))
    }

    pub const fn intersection(self, other: CpuSet) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates over the members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuSet`] that can be updated concurrently.
#[derive(Debug, Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    pub fn insert(&self, cpu: usize) {
        self.0.fetch_or(CpuSet::single(cpu).0, Ordering::AcqRel);
    }

    pub fn remove(&self, cpu: usize) {
        self.0.fetch_and(!CpuSet::single(cpu).0, Ordering::AcqRel);
    }
}

/// Hardware services the shootdown protocol needs from the interrupt controller.
pub trait CpuInterconnect: Send + Sync {
    /// Index of the CPU executing the call.
    fn current_cpu(&self) -> usize;

    /// Sends `vector` to every CPU in `targets`.
    fn send_ipi(&self, targets: CpuSet, vector: u8);

    /// Invalidates the executing CPU's cached translations for `range`.
    fn flush_local(&self, range: &VirtualRange) {
        for page in range.pages() {
            arch::flush_local(page);
        }
    }
}

/// Runtime tuning for the shootdown protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShootdownConfig {
    /// Wait iterations after which a missing acknowledgment is treated as a wedged CPU and the
    /// kernel panics. `None` waits forever.
    pub spin_limit: Option<usize>,
}

struct ShootdownRequest {
    range: VirtualRange,
    pending: AtomicU32,
}

/// Delivers TLB invalidations to other CPUs and waits for them.
pub struct ShootdownCoordinator {
    interconnect: Arc<dyn CpuInterconnect>,
    config: ShootdownConfig,
    mailboxes: Vec<spin::Mutex<Vec<Arc<ShootdownRequest>>>>,
}

impl ShootdownCoordinator {
    /// # Panics
    ///
    /// Panics if `cpu_count` is zero or above [`MAX_CPUS`].
    pub fn new(
        interconnect: Arc<dyn CpuInterconnect>,
        cpu_count: usize,
        config: ShootdownConfig,
    ) -> Self {
        assert!(
            cpu_count > 0 && cpu_count <= MAX_CPUS,
            "unsupported cpu count {}",
            cpu_count
        );
        Self {
            interconnect,
            config,
            mailboxes: (0..cpu_count).map(|_| spin::Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn current_cpu(&self) -> usize {
        self.interconnect.current_cpu()
    }

    pub fn config(&self) -> ShootdownConfig {
        self.config
    }

    /// Invalidates `range` on every CPU in `targets` and returns once all of them acknowledged.
    ///
    /// The calling CPU flushes itself directly if it is a target.
    ///
    /// # Panics
    ///
    /// Panics if a spin limit is configured and a target does not acknowledge within it.
    pub fn shootdown(&self, range: VirtualRange, targets: CpuSet) {
        let me = self.current_cpu();
        let remote = targets
            .intersection(CpuSet::all(self.cpu_count()))
            .without(me);

        let request = (!remote.is_empty()).then(|| {
            let request = Arc::new(ShootdownRequest {
                range,
                pending: AtomicU32::new(remote.len() as u32),
            });
            for cpu in remote.iter() {
                self.mailboxes[cpu].lock().push(Arc::clone(&request));
            }
            self.interconnect.send_ipi(remote, TLB_SHOOTDOWN_VECTOR);
            request
        });

        if targets.contains(me) {
            self.interconnect.flush_local(&range);
        }

        if let Some(request) = request {
            log::trace!("cpu {}: shootdown {:?} -> {:?}", me, range, remote);
            self.wait(&request, remote);
        }
    }

    /// Shootdown interrupt handler: invalidates every pending range for `cpu` and acknowledges.
    ///
    /// Returns the number of requests handled.
    pub fn handle_interrupt(&self, cpu: usize) -> usize {
        let Some(mailbox) = self.mailboxes.get(cpu) else {
            return 0;
        };

        let pending = core::mem::take(&mut *mailbox.lock());
        for request in &pending {
            self.interconnect.flush_local(&request.range);
            request.pending.fetch_sub(1, Ordering::Release);
        }
        pending.len()
    }

    /// Handles any requests addressed to the executing CPU.
    ///
    /// Called wherever a CPU spins with interrupts potentially masked.
    pub fn service_pending(&self) -> usize {
        self.handle_interrupt(self.current_cpu())
    }

    fn wait(&self, request: &Arc<ShootdownRequest>, remote: CpuSet) {
        let mut spins = 0usize;
        while request.pending.load(Ordering::Acquire) > 0 {
            self.service_pending();
            core::hint::spin_loop();

            spins += 1;
            if self.config.spin_limit.is_some_and(|limit| spins > limit) {
                let stalled: CpuSet = remote
                    .iter()
                    .filter(|&cpu| {
                        self.mailboxes[cpu]
                            .lock()
                            .iter()
                            .any(|queued| Arc::ptr_eq(queued, request))
                    })
                    .fold(CpuSet::empty(), CpuSet::with);
                panic!(
                    "cpus {:?} failed to acknowledge TLB shootdown of {:?}",
                    stalled, request.range
                );
            }
        }
    }
}

impl fmt::Debug for ShootdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShootdownCoordinator")
            .field("cpu_count", &self.cpu_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Batches invalidations and holds back the frees that depend on them.
///
/// The target set is read when the batch is flushed, after the page tables were changed, so a
/// CPU that switched to the address space in the meantime is included. Flushing happens on
/// [`Flusher::flush`] or on drop.
pub struct Flusher<'a> {
    coordinator: &'a ShootdownCoordinator,
    frames: &'a FrameAllocator,
    targets: &'a AtomicCpuSet,
    ranges: Vec<VirtualRange>,
    unmapped: Vec<FrameNumber>,
    released: Vec<FrameNumber>,
    dropped: Vec<Region>,
}

impl<'a> Flusher<'a> {
    pub fn new(
        coordinator: &'a ShootdownCoordinator,
        frames: &'a FrameAllocator,
        targets: &'a AtomicCpuSet,
    ) -> Self {
        Self {
            coordinator,
            frames,
            targets,
            ranges: Vec::new(),
            unmapped: Vec::new(),
            released: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Queues `range` for invalidation, merging it with the previous range when adjacent.
    pub fn queue(&mut self, range: VirtualRange) {
        if range.is_empty() {
            return;
        }
        if let Some(last) = self.ranges.last_mut() {
            if last.end() == range.start() {
                *last = VirtualRange::new(last.start(), range.end());
                return;
            }
        }
        self.ranges.push(range);
    }

    /// Releases one reference to `frame` after the flush.
    pub fn defer_release(&mut self, frame: FrameNumber) {
        self.released.push(frame);
    }

    /// Decrements the map count of `frame` after the flush.
    pub fn defer_unmapped(&mut self, frame: FrameNumber) {
        self.unmapped.push(frame);
    }

    /// Drops `region` after the flush.
    pub fn defer_drop(&mut self, region: Region) {
        self.dropped.push(region);
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
            && self.unmapped.is_empty()
            && self.released.is_empty()
            && self.dropped.is_empty()
    }

    /// Performs the queued shootdowns, then the deferred work: map-count updates, frame releases
    /// and region drops, in that order.
    pub fn flush(mut self) {
        self.flush_now();
    }

    fn flush_now(&mut self) {
        if !self.ranges.is_empty() {
            let targets = self.targets.load();
            for range in core::mem::take(&mut self.ranges) {
                self.coordinator.shootdown(range, targets);
            }
        }

        // Map counts first: a release may free the frame and reset its metadata.
        for frame in core::mem::take(&mut self.unmapped) {
            if let Some(page) = self.frames.page(frame) {
                page.unmap();
            }
        }
        for frame in core::mem::take(&mut self.released) {
            if let Err(err) = self.frames.release(frame) {
                log::error!("deferred release of {} failed: {}", frame, err);
            }
        }
        self.dropped.clear();
    }
}

impl Drop for Flusher<'_> {
    fn drop(&mut self) {
        self.flush_now();
    }
}
