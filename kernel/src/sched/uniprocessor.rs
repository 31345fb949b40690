//! Uniprocessor schedulers: simple, deterministic priority and EDF
//!
//! All three share one heir-selection body and differ only in how the
//! ready set is ordered. The executing thread stays in the ready set, so
//! the heir is always the first ready thread unless a non-preemptible heir
//! keeps the processor.

use alloc::vec::Vec;

use super::{
    help::HelpState,
    node::{CpuBudget, IdleThread, NodePayload, NodeState, NodeTable, SchedulerNode},
    policy::{unknown_node, PolicyKind, SchedulerPolicy},
    priority::{NodePriority, Priority, PriorityMap},
    queue::{DeterministicQueue, EdfQueue, ReadyStore, SimpleChain},
    CpuSet, ThreadId,
};
use crate::error::{SchedError, SchedResult};

/// Uniprocessor scheduler over a [`ReadyStore`]
pub struct Uniprocessor<S: ReadyStore> {
    kind: PolicyKind,
    /// Owned processor; `None` once it was handed to another instance
    cpu: Option<usize>,
    map: PriorityMap,
    nodes: NodeTable,
    ready: S,
    heir: Option<ThreadId>,
    idle: Option<IdleThread>,
}

/// Sorted-chain scheduler
pub type SimpleScheduler = Uniprocessor<SimpleChain>;
/// Deterministic priority scheduler
pub type PriorityScheduler = Uniprocessor<DeterministicQueue>;
/// Earliest deadline first scheduler
pub type EdfScheduler = Uniprocessor<EdfQueue>;

impl<S: ReadyStore> Uniprocessor<S> {
    /// Scheduler for `cpu` with nodes for thread slots `0..capacity`.
    pub fn new(kind: PolicyKind, cpu: usize, map: PriorityMap, capacity: usize) -> Self {
        debug_assert!(!kind.is_smp());
        Self {
            kind,
            cpu: Some(cpu),
            map,
            nodes: NodeTable::new(capacity),
            ready: S::with_capacity(map.levels(), capacity),
            heir: None,
            idle: None,
        }
    }

    pub fn ready_store(&self) -> &S {
        &self.ready
    }

    fn insert_ready(&mut self, thread: ThreadId, priority: NodePriority) {
        if priority.prepend_it {
            self.ready.enqueue_first(thread, priority.value);
        } else {
            self.ready.enqueue(thread, priority.value);
        }
    }

    /// Heir becomes the first ready thread unless the current heir is
    /// non-preemptible and `force` is not set.
    fn update_heir(&mut self, force: bool) {
        let candidate = self.ready.first();
        if candidate == self.heir {
            return;
        }

        if !force {
            let pinned = self
                .heir
                .and_then(|heir| self.nodes.get(heir))
                .is_some_and(|node| node.state == NodeState::Scheduled && !node.preemptible);
            if pinned {
                return;
            }
        }

        if let Some(old) = self.heir.and_then(|heir| self.nodes.get_mut(heir)) {
            if old.state == NodeState::Scheduled {
                old.state = NodeState::Ready;
                old.cpu = None;
            }
        }
        if let Some(new) = candidate.and_then(|thread| self.nodes.get_mut(thread)) {
            new.state = NodeState::Scheduled;
            new.cpu = self.cpu;
        }

        log::trace!(
            "{} cpu {:?}: heir {:?} -> {:?}",
            self.kind.name(),
            self.cpu,
            self.heir,
            candidate
        );
        self.heir = candidate;
    }
}

impl<S: ReadyStore> SchedulerPolicy for Uniprocessor<S> {
    fn kind(&self) -> PolicyKind {
        self.kind
    }

    fn processors(&self) -> CpuSet {
        self.cpu.map_or(CpuSet::empty(), CpuSet::single)
    }

    fn priority_map(&self) -> PriorityMap {
        self.map
    }

    fn map_priority(&self, priority: Priority) -> SchedResult<NodePriority> {
        if self.kind.is_edf() {
            self.map.map_background(priority)
        } else {
            self.map.map(priority).map(|index| NodePriority::new(index as u64))
        }
    }

    fn unmap_priority(&self, priority: NodePriority) -> Option<Priority> {
        if self.kind.is_edf() {
            self.map.unmap_background(priority)
        } else {
            self.map.unmap(priority.value as usize)
        }
    }

    fn start_idle(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread> {
        if Some(cpu) != self.cpu || self.idle.is_some() {
            return Err(idle);
        }
        self.idle = Some(idle);
        Ok(())
    }

    fn add_processor(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread> {
        if self.cpu.is_some() {
            return Err(idle);
        }
        self.cpu = Some(cpu);
        self.idle = Some(idle);
        if let Some(node) = self.heir.and_then(|heir| self.nodes.get_mut(heir)) {
            node.cpu = Some(cpu);
        }
        log::debug!("{}: took over cpu {}", self.kind.name(), cpu);
        Ok(())
    }

    fn remove_processor(&mut self, cpu: usize) -> Option<IdleThread> {
        if Some(cpu) != self.cpu {
            return None;
        }
        self.cpu = None;
        if let Some(node) = self.heir.and_then(|heir| self.nodes.get_mut(heir)) {
            node.cpu = None;
        }
        self.idle.take()
    }

    fn node_initialize(
        &mut self,
        thread: ThreadId,
        priority: NodePriority,
        _affinity: CpuSet,
    ) -> SchedResult<()> {
        let payload = if self.kind.is_edf() {
            NodePayload::Edf { deadline: None }
        } else {
            NodePayload::Basic
        };
        self.nodes
            .insert(SchedulerNode::new(thread, priority, payload))
            .map_err(|_| SchedError::InvalidState {
                expected: "inactive node",
                actual: "active node",
            })
    }

    fn node_destroy(&mut self, thread: ThreadId) {
        self.block(thread);
        self.nodes.destroy(thread);
    }

    fn schedule(&mut self) {
        self.update_heir(false);
    }

    fn block(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("block", thread);
            return;
        };
        node.owner_blocked = true;
        if node.state == NodeState::Blocked {
            return;
        }
        node.state = NodeState::Blocked;
        node.cpu = None;
        self.ready.extract(thread);
        if self.heir == Some(thread) {
            self.update_heir(true);
        }
    }

    fn unblock(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("unblock", thread);
            return;
        };
        node.owner_blocked = false;
        if node.state != NodeState::Blocked {
            return;
        }
        node.state = NodeState::Ready;
        let priority = node.priority;
        self.insert_ready(thread, priority);
        self.update_heir(false);
    }

    fn update_priority(&mut self, thread: ThreadId, priority: NodePriority) {
        let edf = self.kind.is_edf();
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("update_priority", thread);
            return;
        };
        if edf {
            node.payload = NodePayload::Edf {
                deadline: priority.is_deadline().then_some(priority.value),
            };
        }
        if node.priority.value == priority.value && !priority.prepend_it {
            return;
        }
        node.priority = priority;
        if node.state == NodeState::Blocked {
            return;
        }
        self.ready.extract(thread);
        self.insert_ready(thread, priority);
        self.update_heir(false);
    }

    fn yield_thread(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get(thread) else {
            unknown_node("yield", thread);
            return;
        };
        if node.state == NodeState::Blocked {
            return;
        }
        let key = node.priority.value;
        self.ready.extract(thread);
        self.ready.enqueue(thread, key);
        self.update_heir(true);
    }

    fn tick(&mut self, cpu: usize, ticks_per_timeslice: u32) {
        if Some(cpu) != self.cpu {
            return;
        }
        let Some(heir) = self.heir else {
            return;
        };
        let expired = self
            .nodes
            .get_mut(heir)
            .is_some_and(|node| node.consume_timeslice(ticks_per_timeslice));
        if expired {
            self.yield_thread(heir);
        }
    }

    fn set_affinity(&mut self, thread: ThreadId, affinity: CpuSet) -> SchedResult<()> {
        if self.nodes.get(thread).is_none() {
            return Err(SchedError::ThreadNotFound { id: thread });
        }
        self.kind.check_affinity(self.processors(), affinity)
    }

    fn set_help_state(
        &mut self,
        thread: ThreadId,
        state: HelpState,
        accepts_help: Option<ThreadId>,
    ) -> SchedResult<()> {
        let node = self
            .nodes
            .get_mut(thread)
            .ok_or(SchedError::ThreadNotFound { id: thread })?;
        node.help_state.check_transition(state)?;
        node.help_state = state;
        node.accepts_help = accepts_help;
        Ok(())
    }

    fn release_job(&self, deadline: u64) -> SchedResult<NodePriority> {
        if !self.kind.is_edf() {
            return Err(SchedError::NotSupported {
                operation: "release_job",
            });
        }
        Ok(NodePriority::deadline(deadline))
    }

    fn cancel_job(&self, priority: Priority) -> SchedResult<NodePriority> {
        if !self.kind.is_edf() {
            return Err(SchedError::NotSupported {
                operation: "cancel_job",
            });
        }
        self.map_priority(priority)
    }

    fn set_preemptible(&mut self, thread: ThreadId, preemptible: bool) {
        match self.nodes.get_mut(thread) {
            Some(node) => node.preemptible = preemptible,
            None => unknown_node("set_preemptible", thread),
        }
        if preemptible {
            self.update_heir(false);
        }
    }

    fn set_cpu_budget(&mut self, thread: ThreadId, budget: CpuBudget, ticks_per_timeslice: u32) {
        match self.nodes.get_mut(thread) {
            Some(node) => {
                node.budget = budget;
                node.timeslice = ticks_per_timeslice;
            }
            None => unknown_node("set_cpu_budget", thread),
        }
    }

    fn heir(&self, cpu: usize) -> Option<ThreadId> {
        if Some(cpu) != self.cpu {
            return None;
        }
        self.heir.or_else(|| self.idle.as_ref().map(IdleThread::id))
    }

    fn node(&self, thread: ThreadId) -> Option<&SchedulerNode> {
        self.nodes.get(thread)
    }

    fn ready_order(&self) -> Vec<ThreadId> {
        self.ready.order()
    }

    fn check_consistency(&self) -> bool {
        let heir_ok = match self.heir {
            Some(heir) => self
                .nodes
                .get(heir)
                .is_some_and(|node| node.state == NodeState::Scheduled),
            None => self.ready.first().is_none(),
        };
        let scheduled = self
            .nodes
            .iter()
            .filter(|node| node.state == NodeState::Scheduled)
            .count();
        heir_ok && scheduled <= 1 && self.ready.is_consistent()
    }
}
