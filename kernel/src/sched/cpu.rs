//! Processor sets and per-CPU dispatch state

use alloc::{boxed::Box, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use super::{SchedulerId, ThreadId};

/// Maximum number of processors a system can be configured with
pub const MAX_CPUS: usize = 64;

/// Set of processors (bit N = CPU N)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuSet {
    mask: u64,
}

impl CpuSet {
    /// Empty set
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    /// Every processor the system can have
    pub const fn all() -> Self {
        Self { mask: !0u64 }
    }

    /// Set holding a single CPU; empty if `cpu` is out of range
    pub const fn single(cpu: usize) -> Self {
        if cpu >= MAX_CPUS {
            return Self::empty();
        }
        Self {
            mask: 1u64 << cpu,
        }
    }

    /// Processors `0..count`
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self::all()
        } else {
            Self {
                mask: (1u64 << count) - 1,
            }
        }
    }

    /// Create from raw mask
    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    /// Raw mask
    pub const fn mask(&self) -> u64 {
        self.mask
    }

    /// Check if CPU is in set
    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && (self.mask & (1u64 << cpu)) != 0
    }

    /// Add CPU to set
    pub fn add(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.mask |= 1u64 << cpu;
        }
    }

    /// Remove CPU from set
    pub fn remove(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.mask &= !(1u64 << cpu);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn count(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn intersection(&self, other: CpuSet) -> CpuSet {
        Self {
            mask: self.mask & other.mask,
        }
    }

    pub fn intersects(&self, other: CpuSet) -> bool {
        self.mask & other.mask != 0
    }

    /// True if every CPU of `other` is also in `self`
    pub fn is_superset_of(&self, other: CpuSet) -> bool {
        other.mask & !self.mask == 0
    }

    /// Lowest CPU index in the set
    pub fn lowest(&self) -> Option<usize> {
        if self.mask == 0 {
            None
        } else {
            Some(self.mask.trailing_zeros() as usize)
        }
    }

    /// CPUs in ascending order
    pub fn iter(&self) -> CpuSetIter {
        CpuSetIter { mask: self.mask }
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = CpuSet::empty();
        for cpu in iter {
            set.add(cpu);
        }
        set
    }
}

/// Iterator over the CPUs of a [`CpuSet`]
pub struct CpuSetIter {
    mask: u64,
}

impl Iterator for CpuSetIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.mask == 0 {
            return None;
        }
        let cpu = self.mask.trailing_zeros() as usize;
        self.mask &= self.mask - 1;
        Some(cpu)
    }
}

const NO_THREAD: u32 = u32::MAX;
const NO_SCHEDULER: usize = usize::MAX;

/// Dispatch state of one processor.
///
/// Written by the owning scheduler instance while its lock is held, read
/// lock-free by the dispatcher.
pub struct PerCpu {
    /// CPU index
    pub id: usize,
    /// Scheduler instance owning this processor, if any
    scheduler: AtomicUsize,
    /// Thread selected to run next
    heir: AtomicU32,
    /// Thread the dispatcher last switched to
    executing: AtomicU32,
    /// Heir differs from the executing thread
    dispatch_necessary: AtomicBool,
}

impl PerCpu {
    fn new(id: usize, scheduler: Option<SchedulerId>) -> Self {
        Self {
            id,
            scheduler: AtomicUsize::new(scheduler.map_or(NO_SCHEDULER, |id| id.0)),
            heir: AtomicU32::new(NO_THREAD),
            executing: AtomicU32::new(NO_THREAD),
            dispatch_necessary: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> Option<SchedulerId> {
        match self.scheduler.load(Ordering::Acquire) {
            NO_SCHEDULER => None,
            id => Some(SchedulerId(id)),
        }
    }

    /// Record a change of owner after a processor handover.
    pub(crate) fn set_scheduler(&self, scheduler: Option<SchedulerId>) {
        let raw = scheduler.map_or(NO_SCHEDULER, |id| id.0);
        self.scheduler.store(raw, Ordering::Release);
    }

    pub fn heir(&self) -> Option<ThreadId> {
        decode(self.heir.load(Ordering::Acquire))
    }

    pub fn executing(&self) -> Option<ThreadId> {
        decode(self.executing.load(Ordering::Acquire))
    }

    pub fn dispatch_necessary(&self) -> bool {
        self.dispatch_necessary.load(Ordering::Acquire)
    }

    /// Publish a new heir; returns true if it changed.
    pub(crate) fn set_heir(&self, heir: Option<ThreadId>) -> bool {
        let raw = encode(heir);
        let previous = self.heir.swap(raw, Ordering::AcqRel);
        if previous != raw {
            self.dispatch_necessary.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Commit the heir as the executing thread.
    pub(crate) fn dispatch(&self) -> Option<ThreadId> {
        self.dispatch_necessary.store(false, Ordering::Release);
        let heir = self.heir.load(Ordering::Acquire);
        self.executing.store(heir, Ordering::Release);
        decode(heir)
    }
}

fn encode(thread: Option<ThreadId>) -> u32 {
    thread.map_or(NO_THREAD, |t| t.0)
}

fn decode(raw: u32) -> Option<ThreadId> {
    if raw == NO_THREAD {
        None
    } else {
        Some(ThreadId(raw))
    }
}

/// Per-CPU state for every configured processor, indexed by CPU.
pub struct CpuTable {
    cpus: Box<[PerCpu]>,
}

impl CpuTable {
    /// `owners[cpu]` names the scheduler instance owning each processor.
    pub fn new(owners: &[Option<SchedulerId>]) -> Self {
        let cpus: Vec<PerCpu> = owners
            .iter()
            .enumerate()
            .map(|(id, owner)| PerCpu::new(id, *owner))
            .collect();
        Self {
            cpus: cpus.into_boxed_slice(),
        }
    }

    pub fn get(&self, cpu: usize) -> Option<&PerCpu> {
        self.cpus.get(cpu)
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerCpu> {
        self.cpus.iter()
    }
}
