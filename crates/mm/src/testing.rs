//! Shared fixtures for the unit tests: a small emulated machine with a bootstrapped allocator, and
//! host threads standing in for CPUs.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bootstrap::BootstrapAllocator;
use crate::{
    AddressTranslator, CpuInterconnect, CpuSet, FrameAllocator, PhysicalAddress,
    ShootdownCoordinator, VirtualRange,
};

/// Size of the emulated physical memory (128 frames of 256 bytes).
pub const MEMORY_SIZE: usize = 0x8000;

/// First usable physical address; frame 0 is left out of the memory map.
pub const MEMORY_BASE: usize = 0x0100;

/// Installs fresh emulated memory on the current thread and bootstraps a frame allocator on it.
pub fn frame_allocator() -> Arc<FrameAllocator> {
    AddressTranslator::set_current(AddressTranslator::emulated(MEMORY_SIZE));

    let mut boot = BootstrapAllocator::new();
    boot.add(PhysicalAddress::new(MEMORY_BASE), MEMORY_SIZE - MEMORY_BASE)
        .unwrap();
    Arc::new(FrameAllocator::bootstrap(boot).unwrap())
}

/// Returns the translator installed on the current thread, for sharing with spawned threads.
pub fn translator() -> AddressTranslator {
    AddressTranslator::current().clone()
}

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

type FlushHook = Box<dyn Fn(usize, VirtualRange) + Send + Sync>;

/// An interconnect where every host thread is a CPU (the test thread is CPU 0), IPIs are
/// doorbells, and local flushes are recorded.
pub struct SimulatedCpus {
    doorbells: Vec<AtomicBool>,
    ipis: AtomicUsize,
    flushes: spin::Mutex<Vec<(usize, VirtualRange)>>,
    hook: spin::Mutex<Option<FlushHook>>,
}

impl SimulatedCpus {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            doorbells: (0..count).map(|_| AtomicBool::new(false)).collect(),
            ipis: AtomicUsize::new(0),
            flushes: spin::Mutex::new(Vec::new()),
            hook: spin::Mutex::new(None),
        })
    }

    pub fn count(&self) -> usize {
        self.doorbells.len()
    }

    /// Makes the calling thread act as `cpu`.
    pub fn set_current_cpu(&self, cpu: usize) {
        CURRENT_CPU.with(|current| current.set(cpu));
    }

    /// Number of IPIs sent so far.
    pub fn ipis(&self) -> usize {
        self.ipis.load(Ordering::Acquire)
    }

    /// Every local flush so far, as `(cpu, range)`.
    pub fn flushes(&self) -> Vec<(usize, VirtualRange)> {
        self.flushes.lock().clone()
    }

    /// Runs `hook` on the flushing CPU's thread before each local flush is recorded.
    pub fn on_flush(&self, hook: impl Fn(usize, VirtualRange) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    fn take_doorbell(&self, cpu: usize) -> bool {
        self.doorbells[cpu].swap(false, Ordering::AcqRel)
    }
}

impl CpuInterconnect for SimulatedCpus {
    fn current_cpu(&self) -> usize {
        CURRENT_CPU.with(Cell::get)
    }

    fn send_ipi(&self, targets: CpuSet, _vector: u8) {
        self.ipis.fetch_add(1, Ordering::AcqRel);
        for cpu in targets.iter() {
            self.doorbells[cpu].store(true, Ordering::Release);
        }
    }

    fn flush_local(&self, range: &VirtualRange) {
        let cpu = self.current_cpu();
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(cpu, *range);
        }
        self.flushes.lock().push((cpu, *range));
    }
}

/// A host thread acting as a CPU that takes shootdown interrupts. Stops when dropped.
pub struct CpuThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for CpuThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Starts CPU `cpu`, which answers each IPI after waiting `delay`.
///
/// The thread shares the caller's emulated memory, if any.
pub fn spawn_cpu(
    cpus: &Arc<SimulatedCpus>,
    coordinator: &Arc<ShootdownCoordinator>,
    cpu: usize,
    delay: Duration,
) -> CpuThread {
    let stop = Arc::new(AtomicBool::new(false));
    let translator = AddressTranslator::try_current().cloned();
    let handle = {
        let stop = Arc::clone(&stop);
        let cpus = Arc::clone(cpus);
        let coordinator = Arc::clone(coordinator);
        std::thread::spawn(move || {
            if let Some(translator) = translator {
                AddressTranslator::set_current(translator);
            }
            cpus.set_current_cpu(cpu);

            while !stop.load(Ordering::Acquire) {
                if cpus.take_doorbell(cpu) {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    coordinator.handle_interrupt(cpu);
                } else {
                    std::thread::yield_now();
                }
            }
        })
    };

    CpuThread {
        stop,
        handle: Some(handle),
    }
}
