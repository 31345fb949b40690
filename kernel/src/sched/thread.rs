//! Thread control blocks and thread wait flags
//!
//! The control block is a leaf lock: it is taken briefly, possibly while a
//! scheduler lock is held, and never while acquiring another lock.
//!
//! Wait flags resolve the race between a resource handing itself to a
//! waiting thread and the wait timing out. Both paths try to move the flags
//! from `INTEND_TO_BLOCK` or `BLOCKED` to `READY` with a compare-and-swap;
//! whoever succeeds completes the wait, the other backs off.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::{
    node::CpuBudget,
    priority::{NodePriority, Priority},
    CpuSet, ResourceId, SchedulerId, ThreadId,
};
use crate::sync::SeqLock;

bitflags! {
    /// Thread wait state and wait class
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        const INTEND_TO_BLOCK = 0x1;
        const BLOCKED = 0x2;
        const CLASS_EVENT = 0x100;
        const CLASS_SYSTEM_EVENT = 0x200;
        const CLASS_OBJECT = 0x400;
        const CLASS_PERIOD = 0x800;
    }
}

impl WaitFlags {
    /// No wait in progress
    pub const READY: WaitFlags = WaitFlags::empty();

    pub const STATE_MASK: WaitFlags = WaitFlags::INTEND_TO_BLOCK.union(WaitFlags::BLOCKED);

    pub const CLASS_MASK: WaitFlags = WaitFlags::CLASS_EVENT
        .union(WaitFlags::CLASS_SYSTEM_EVENT)
        .union(WaitFlags::CLASS_OBJECT)
        .union(WaitFlags::CLASS_PERIOD);

    pub fn class(self) -> WaitFlags {
        self.intersection(Self::CLASS_MASK)
    }

    pub fn state(self) -> WaitFlags {
        self.intersection(Self::STATE_MASK)
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Successful,
    Timeout,
}

/// Result of trying to complete a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Another path completed the wait first
    Lost,
    /// Completed before the thread blocked; no unblock needed
    BeforeBlock,
    /// Completed a blocked wait; the thread must be unblocked
    Unblock,
}

/// Wait flags of one thread
#[derive(Debug)]
pub struct AtomicWaitFlags(AtomicU32);

impl AtomicWaitFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn get(&self) -> WaitFlags {
        WaitFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, flags: WaitFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }

    pub fn try_change(&self, expected: WaitFlags, desired: WaitFlags) -> bool {
        self.0
            .compare_exchange(
                expected.bits(),
                desired.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Start a wait of `class`.
    pub fn prepare(&self, class: WaitFlags) {
        self.set(class.class() | WaitFlags::INTEND_TO_BLOCK);
    }

    /// Move from intend-to-block to blocked; false if the wait completed in
    /// the meantime.
    pub fn commit(&self) -> bool {
        let current = self.get();
        current.state() == WaitFlags::INTEND_TO_BLOCK
            && self.try_change(current, current.class() | WaitFlags::BLOCKED)
    }

    /// Claim completion of the pending wait.
    pub fn complete(&self) -> WaitOutcome {
        loop {
            let current = self.get();
            let ready = current.class() | WaitFlags::READY;
            let state = current.state();
            let outcome = if state == WaitFlags::INTEND_TO_BLOCK {
                WaitOutcome::BeforeBlock
            } else if state == WaitFlags::BLOCKED {
                WaitOutcome::Unblock
            } else {
                return WaitOutcome::Lost;
            };
            if self.try_change(current, ready) {
                return outcome;
            }
        }
    }

    pub fn is_waiting(&self) -> bool {
        !self.get().state().is_empty()
    }
}

impl Default for AtomicWaitFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a thread slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLifecycle {
    /// Slot not in use
    Free,
    /// Created, not started
    Dormant,
    Active,
}

impl ThreadLifecycle {
    pub fn name(self) -> &'static str {
        match self {
            ThreadLifecycle::Free => "free",
            ThreadLifecycle::Dormant => "dormant",
            ThreadLifecycle::Active => "active",
        }
    }
}

/// Per-thread bookkeeping outside the scheduler nodes
#[derive(Debug, Clone)]
pub struct ThreadControl {
    pub id: ThreadId,
    pub lifecycle: ThreadLifecycle,
    pub is_idle: bool,
    /// Scheduler instance owning the thread's node
    pub scheduler: SchedulerId,
    pub initial_priority: Priority,
    /// Priority set by the application
    pub real_priority: Priority,
    /// Ceiling boosts of resources owned or spun on
    pub ceilings: Vec<(ResourceId, Priority)>,
    pub affinity: CpuSet,
    pub preemptible: bool,
    pub budget: CpuBudget,
    /// Thread is blocked by an explicit block or a committed wait
    pub blocked: bool,
    /// Absolute deadline of the released EDF job
    pub job_deadline: Option<u64>,
    pub wait_status: Option<WaitStatus>,
    /// Ticks spent executing
    pub cpu_time: u64,
    /// Nesting depth of pin requests
    pub pin_level: u32,
    /// Processor the thread is pinned to while `pin_level > 0`
    pub pinned_cpu: Option<usize>,
}

impl ThreadControl {
    fn free(id: ThreadId) -> Self {
        Self {
            id,
            lifecycle: ThreadLifecycle::Free,
            is_idle: false,
            scheduler: SchedulerId(0),
            initial_priority: Priority::HIGHEST,
            real_priority: Priority::HIGHEST,
            ceilings: Vec::new(),
            affinity: CpuSet::all(),
            preemptible: true,
            budget: CpuBudget::None,
            blocked: true,
            job_deadline: None,
            wait_status: None,
            cpu_time: 0,
            pin_level: 0,
            pinned_cpu: None,
        }
    }

    /// Return the slot to the free state.
    pub(crate) fn reset(&mut self) {
        *self = Self::free(self.id);
    }

    /// Real priority raised by every ceiling boost
    pub fn effective_priority(&self) -> Priority {
        self.ceilings
            .iter()
            .map(|&(_, ceiling)| ceiling)
            .fold(self.real_priority, Priority::min)
    }

    pub fn add_ceiling(&mut self, resource: ResourceId, ceiling: Priority) {
        if !self.ceilings.iter().any(|&(id, _)| id == resource) {
            self.ceilings.push((resource, ceiling));
        }
    }

    /// Returns true if a boost was removed
    pub fn remove_ceiling(&mut self, resource: ResourceId) -> bool {
        let before = self.ceilings.len();
        self.ceilings.retain(|&(id, _)| id != resource);
        self.ceilings.len() != before
    }

    pub fn is_usable(&self) -> bool {
        matches!(
            self.lifecycle,
            ThreadLifecycle::Dormant | ThreadLifecycle::Active
        )
    }
}

/// One thread slot: control block, wait flags and the node priority
/// published to the scheduler.
pub struct ThreadSlot {
    pub control: Mutex<ThreadControl>,
    pub wait: AtomicWaitFlags,
    pub priority: SeqLock<NodePriority>,
}

/// Fixed-size thread table; slots of deleted threads are reused.
pub struct ThreadTable {
    slots: Box<[ThreadSlot]>,
}

impl ThreadTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<ThreadSlot> = (0..capacity)
            .map(|index| ThreadSlot {
                control: Mutex::new(ThreadControl::free(ThreadId(index as u32))),
                wait: AtomicWaitFlags::new(),
                priority: SeqLock::new(NodePriority::default()),
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, thread: ThreadId) -> Option<&ThreadSlot> {
        self.slots.get(thread.index())
    }

    /// Claim the first free slot, initializing it with `init`.
    pub fn allocate<F>(&self, init: F) -> Option<ThreadId>
    where
        F: FnOnce(&mut ThreadControl),
    {
        for slot in self.slots.iter() {
            let mut control = slot.control.lock();
            if control.lifecycle == ThreadLifecycle::Free {
                slot.wait.set(WaitFlags::READY);
                init(&mut control);
                return Some(control.id);
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadSlot> {
        self.slots.iter()
    }
}
