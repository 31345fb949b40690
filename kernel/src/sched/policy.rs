//! Scheduler operations table
//!
//! Every scheduler instance is a `Box<dyn SchedulerPolicy>` guarded by its
//! own lock. Operations take the thread and, where needed, the priority the
//! caller read from the thread's sequence lock; they never allocate and
//! never fail once a node exists. Heir selection is read back with
//! [`SchedulerPolicy::heir`] after each operation.

use alloc::vec::Vec;

use super::{
    help::HelpState,
    node::{CpuBudget, IdleThread, NodeState, SchedulerNode},
    priority::{NodePriority, Priority, PriorityMap},
    CpuSet, ThreadId,
};
use crate::error::{SchedError, SchedResult};

/// Concrete scheduler algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Single sorted ready chain
    Simple,
    /// Deterministic priority: per-level FIFO chains and a bitmap
    Priority,
    /// Earliest deadline first
    Edf,
    /// EDF with constant bandwidth servers
    Cbs,
    /// Global fixed-priority SMP
    PrioritySmp,
    /// Fixed-priority SMP honouring thread affinity
    PriorityAffinitySmp,
    /// EDF SMP; a thread runs everywhere or on one processor
    EdfSmp,
}

impl PolicyKind {
    pub fn is_smp(self) -> bool {
        matches!(
            self,
            PolicyKind::PrioritySmp | PolicyKind::PriorityAffinitySmp | PolicyKind::EdfSmp
        )
    }

    pub fn is_edf(self) -> bool {
        matches!(self, PolicyKind::Edf | PolicyKind::Cbs | PolicyKind::EdfSmp)
    }

    /// Accept or reject a thread affinity for an instance owning
    /// `processors`. The affinity scheduler accepts any overlapping set,
    /// EDF SMP all processors or exactly one of them.
    pub fn check_affinity(self, processors: CpuSet, affinity: CpuSet) -> SchedResult<()> {
        let admitted = match self {
            PolicyKind::PriorityAffinitySmp => affinity.intersects(processors),
            PolicyKind::EdfSmp => {
                affinity.is_superset_of(processors)
                    || (affinity.count() == 1 && affinity.intersects(processors))
            }
            _ => affinity.is_superset_of(processors),
        };
        if admitted {
            Ok(())
        } else {
            Err(SchedError::InvalidAffinity)
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Simple => "simple",
            PolicyKind::Priority => "priority",
            PolicyKind::Edf => "edf",
            PolicyKind::Cbs => "cbs",
            PolicyKind::PrioritySmp => "priority-smp",
            PolicyKind::PriorityAffinitySmp => "priority-affinity-smp",
            PolicyKind::EdfSmp => "edf-smp",
        }
    }
}

/// Operations every scheduler instance provides.
pub trait SchedulerPolicy: Send {
    fn kind(&self) -> PolicyKind;

    /// Processors owned by this instance
    fn processors(&self) -> CpuSet;

    fn priority_map(&self) -> PriorityMap;

    /// Node priority for an application priority
    fn map_priority(&self, priority: Priority) -> SchedResult<NodePriority> {
        self.priority_map()
            .map(priority)
            .map(|index| NodePriority::new(index as u64))
    }

    /// Application priority for a node priority, when it encodes one
    fn unmap_priority(&self, priority: NodePriority) -> Option<Priority> {
        self.priority_map().unmap(priority.value as usize)
    }

    /// Hand the idle thread of `cpu` to the scheduler.
    fn start_idle(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread>;

    /// Take ownership of `cpu` at run time, together with its idle thread.
    fn add_processor(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread>;

    /// Give up `cpu`. Threads scheduled there move elsewhere or back to the
    /// ready set; the idle thread of the processor is returned. `None`
    /// leaves everything unchanged.
    fn remove_processor(&mut self, cpu: usize) -> Option<IdleThread>;

    /// Create the node of `thread` in the blocked state.
    fn node_initialize(
        &mut self,
        thread: ThreadId,
        priority: NodePriority,
        affinity: CpuSet,
    ) -> SchedResult<()>;

    /// Remove the node from every queue and mark it destroyed.
    fn node_destroy(&mut self, thread: ThreadId);

    /// Recompute heirs.
    fn schedule(&mut self);

    fn block(&mut self, thread: ThreadId);

    fn unblock(&mut self, thread: ThreadId);

    /// Requeue at `priority`; an unchanged priority without `prepend_it`
    /// leaves the node where it is.
    fn update_priority(&mut self, thread: ThreadId, priority: NodePriority);

    fn yield_thread(&mut self, thread: ThreadId);

    /// Account one clock tick to the thread on `cpu`.
    fn tick(&mut self, cpu: usize, ticks_per_timeslice: u32);

    /// Validate and apply a thread affinity. Nothing changes on error.
    fn set_affinity(&mut self, thread: ThreadId, affinity: CpuSet) -> SchedResult<()>;

    fn set_help_state(
        &mut self,
        thread: ThreadId,
        state: HelpState,
        accepts_help: Option<ThreadId>,
    ) -> SchedResult<()>;

    /// Let `helped` execute with the scheduled node of `rival`.
    fn lend_node(&mut self, _rival: ThreadId, _helped: ThreadId) -> bool {
        false
    }

    /// Give a lent node back to its owner; returns the thread that was
    /// helped.
    fn reclaim_node(&mut self, _rival: ThreadId) -> Option<ThreadId> {
        None
    }

    /// Node priority for a job with the given absolute deadline
    fn release_job(&self, _deadline: u64) -> SchedResult<NodePriority> {
        Err(SchedError::NotSupported {
            operation: "release_job",
        })
    }

    /// Node priority once the job of a thread with `priority` is cancelled
    fn cancel_job(&self, _priority: Priority) -> SchedResult<NodePriority> {
        Err(SchedError::NotSupported {
            operation: "cancel_job",
        })
    }

    /// Restrict `thread` to `cpu` regardless of its affinity.
    fn pin(&mut self, thread: ThreadId, cpu: usize) -> SchedResult<()> {
        if self.node(thread).is_none() {
            return Err(SchedError::ThreadNotFound { id: thread });
        }
        if !self.processors().contains(cpu) {
            return Err(SchedError::InvalidCpuId { cpu });
        }
        Ok(())
    }

    fn unpin(&mut self, thread: ThreadId) {
        if self.node(thread).is_none() {
            unknown_node("unpin", thread);
        }
    }

    fn set_preemptible(&mut self, thread: ThreadId, preemptible: bool);

    fn set_cpu_budget(&mut self, thread: ThreadId, budget: CpuBudget, ticks_per_timeslice: u32);

    /// Thread selected to run on `cpu`
    fn heir(&self, cpu: usize) -> Option<ThreadId>;

    fn node(&self, thread: ThreadId) -> Option<&SchedulerNode>;

    fn node_state(&self, thread: ThreadId) -> Option<NodeState> {
        self.node(thread).map(|node| node.state)
    }

    /// Ready and scheduled threads in dispatch order
    fn ready_order(&self) -> Vec<ThreadId>;

    /// Internal invariants hold
    fn check_consistency(&self) -> bool;
}

pub(crate) fn unknown_node(op: &str, thread: ThreadId) {
    log::warn!("{}: {} has no active node", op, thread);
}
