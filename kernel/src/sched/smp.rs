//! SMP schedulers
//!
//! One engine serves the global priority SMP scheduler, the priority
//! affinity SMP scheduler and EDF SMP. Scheduled nodes are kept in a list
//! ordered by priority (best first), ready nodes in the variant's
//! [`ReadyStore`]. Each owned processor holds either a scheduled node or an
//! idle thread; idle threads not occupying a processor sit in the idle
//! pool. Processors may be added and removed while the system runs.
//!
//! Nodes of threads owning a helping resource are sticky: when the owner
//! blocks, an idle thread is taken from the pool and keeps running on the
//! node's processor until the owner unblocks or gives the resource up.
//! Nodes of spinning rivals may be lent to the resource owner.

use alloc::vec::Vec;
use core::marker::PhantomData;

use super::{
    help::HelpState,
    node::{CpuBudget, IdleThread, NodePayload, NodeState, NodeTable, NodeUser, SchedulerNode},
    policy::{unknown_node, PolicyKind, SchedulerPolicy},
    priority::{NodePriority, Priority, PriorityMap},
    queue::{DeterministicQueue, EdfQueue, ReadyStore},
    CpuSet, ThreadId,
};
use crate::error::{SchedError, SchedResult};

/// What distinguishes the SMP scheduler variants
pub trait SmpVariant: Send + 'static {
    const KIND: PolicyKind;

    /// Ordering of ready nodes
    type Ready: ReadyStore;

    /// Node payload for a thread with `affinity`
    fn payload(affinity: CpuSet) -> NodePayload;
}

/// Every thread may run on every processor of the instance.
pub struct GlobalPriority;

impl SmpVariant for GlobalPriority {
    const KIND: PolicyKind = PolicyKind::PrioritySmp;
    type Ready = DeterministicQueue;

    fn payload(_affinity: CpuSet) -> NodePayload {
        NodePayload::Basic
    }
}

/// Threads run only on processors in their affinity set.
pub struct ProcessorAffinity;

impl SmpVariant for ProcessorAffinity {
    const KIND: PolicyKind = PolicyKind::PriorityAffinitySmp;
    type Ready = DeterministicQueue;

    fn payload(affinity: CpuSet) -> NodePayload {
        NodePayload::Affinity(affinity)
    }
}

/// Earliest deadline first across processors. Affinity is either every
/// processor or a single one.
pub struct EdfAffinity;

impl SmpVariant for EdfAffinity {
    const KIND: PolicyKind = PolicyKind::EdfSmp;
    type Ready = EdfQueue;

    fn payload(affinity: CpuSet) -> NodePayload {
        NodePayload::Affinity(affinity)
    }
}

/// Occupant of an owned processor
#[derive(Debug)]
enum CpuSlot {
    /// No idle thread handed over yet
    Vacant,
    Idle(IdleThread),
    Node(ThreadId),
}

/// A single rebalancing step
enum Move {
    /// Place a ready node on an idle processor
    Fill(ThreadId, usize),
    /// Replace a scheduled node by a better ready node
    Preempt(ThreadId, ThreadId),
}

pub struct SmpScheduler<V: SmpVariant> {
    map: PriorityMap,
    processors: CpuSet,
    nodes: NodeTable,
    ready: V::Ready,
    /// Scheduled nodes, best priority first, FIFO among equals
    scheduled: Vec<ThreadId>,
    /// Owned processors in ascending order
    slots: Vec<(usize, CpuSlot)>,
    idle_pool: Vec<IdleThread>,
    _variant: PhantomData<V>,
}

/// Global fixed-priority SMP scheduler
pub type PrioritySmpScheduler = SmpScheduler<GlobalPriority>;
/// Fixed-priority SMP scheduler with thread affinity
pub type PriorityAffinitySmpScheduler = SmpScheduler<ProcessorAffinity>;
/// EDF SMP scheduler
pub type EdfSmpScheduler = SmpScheduler<EdfAffinity>;

impl<V: SmpVariant> SmpScheduler<V> {
    pub fn new(processors: CpuSet, map: PriorityMap, capacity: usize) -> Self {
        let count = processors.count();
        Self {
            map,
            processors,
            nodes: NodeTable::new(capacity),
            ready: <V::Ready as ReadyStore>::with_capacity(map.levels(), capacity),
            scheduled: Vec::with_capacity(count),
            slots: processors.iter().map(|cpu| (cpu, CpuSlot::Vacant)).collect(),
            idle_pool: Vec::with_capacity(count),
            _variant: PhantomData,
        }
    }

    pub fn ready_store(&self) -> &V::Ready {
        &self.ready
    }

    /// Scheduled threads, best priority first
    pub fn scheduled(&self) -> &[ThreadId] {
        &self.scheduled
    }

    pub fn idle_pool_len(&self) -> usize {
        self.idle_pool.len()
    }

    fn prio(&self, thread: ThreadId) -> u64 {
        self.nodes
            .get(thread)
            .map_or(u64::MAX, |node| node.priority.value)
    }

    fn admits(&self, thread: ThreadId, cpu: usize) -> bool {
        self.nodes.get(thread).is_some_and(|node| node.admits(cpu))
    }

    fn slot_mut(&mut self, cpu: usize) -> Option<&mut CpuSlot> {
        self.slots
            .iter_mut()
            .find(|(id, _)| *id == cpu)
            .map(|(_, slot)| slot)
    }

    fn insert_scheduled(&mut self, thread: ThreadId, prepend: bool) {
        let priority = self.prio(thread);
        let at = self
            .scheduled
            .iter()
            .position(|&other| {
                let other = self.prio(other);
                if prepend {
                    other >= priority
                } else {
                    other > priority
                }
            })
            .unwrap_or(self.scheduled.len());
        self.scheduled.insert(at, thread);
    }

    fn remove_scheduled(&mut self, thread: ThreadId) {
        if let Some(at) = self.scheduled.iter().position(|&t| t == thread) {
            self.scheduled.remove(at);
        }
    }

    fn insert_ready(&mut self, thread: ThreadId, prepend: bool) {
        let key = self.prio(thread);
        if prepend {
            self.ready.enqueue_first(thread, key);
        } else {
            self.ready.enqueue(thread, key);
        }
        if let Some(node) = self.nodes.get_mut(thread) {
            node.state = NodeState::Ready;
            node.cpu = None;
        }
    }

    /// Put `thread` on `cpu`, pushing an idle occupant back to the pool.
    fn place(&mut self, thread: ThreadId, cpu: usize, prepend: bool) {
        if let Some(slot) = self.slot_mut(cpu) {
            match core::mem::replace(slot, CpuSlot::Node(thread)) {
                CpuSlot::Idle(idle) => self.idle_pool.push(idle),
                CpuSlot::Node(other) if other != thread => {
                    log::error!("cpu {}: {} placed over {}", cpu, thread, other);
                    debug_assert!(false, "processor already occupied");
                }
                _ => {}
            }
        }

        let needs_idle = self.nodes.get(thread).is_some_and(|node| node.owner_blocked);
        let idle = if needs_idle { self.idle_pool.pop() } else { None };
        if let Some(node) = self.nodes.get_mut(thread) {
            node.user = match idle {
                Some(idle) => NodeUser::Idle(idle),
                None => NodeUser::Owner,
            };
            node.state = NodeState::Scheduled;
            node.cpu = Some(cpu);
        }
        self.insert_scheduled(thread, prepend);
    }

    /// Take `thread` off its processor and leave the processor vacant;
    /// the caller refills it.
    fn vacate(&mut self, thread: ThreadId) -> Option<usize> {
        self.remove_scheduled(thread);
        let node = self.nodes.get_mut(thread)?;
        let cpu = node.cpu.take();
        if let NodeUser::Idle(idle) = core::mem::replace(&mut node.user, NodeUser::Owner) {
            self.idle_pool.push(idle);
        }
        if let Some(cpu) = cpu {
            if let Some(slot) = self.slot_mut(cpu) {
                if matches!(slot, CpuSlot::Node(t) if *t == thread) {
                    *slot = CpuSlot::Vacant;
                }
            }
        }
        cpu
    }

    /// Take a scheduled node off its processor for good and let it compete
    /// again. A blocked owner keeps competing only while sticky.
    fn displace(&mut self, thread: ThreadId) {
        if self.vacate(thread).is_none() {
            return;
        }
        let Some(node) = self.nodes.get_mut(thread) else {
            return;
        };
        if node.owner_blocked && !node.help_state.is_sticky() {
            node.state = NodeState::Blocked;
        } else {
            self.enqueue(thread, true);
        }
    }

    fn fill_idle(&mut self, cpu: usize) {
        let occupant = match self.idle_pool.pop() {
            Some(idle) => CpuSlot::Idle(idle),
            None => {
                log::error!("cpu {}: idle pool exhausted", cpu);
                CpuSlot::Vacant
            }
        };
        if let Some(slot) = self.slot_mut(cpu) {
            *slot = occupant;
        }
    }

    fn idle_cpu_for(&self, thread: ThreadId) -> Option<usize> {
        self.slots
            .iter()
            .find(|(cpu, slot)| matches!(slot, CpuSlot::Idle(_)) && self.admits(thread, *cpu))
            .map(|(cpu, _)| *cpu)
    }

    fn lowest_scheduled_for(&self, thread: ThreadId) -> Option<ThreadId> {
        let node = self.nodes.get(thread)?;
        self.scheduled.iter().rev().copied().find(|&other| {
            self.nodes
                .get(other)
                .and_then(|o| o.cpu)
                .is_some_and(|cpu| node.admits(cpu))
        })
    }

    fn highest_ready_for(&self, cpu: usize) -> Option<ThreadId> {
        self.ready
            .find_map(|thread| self.admits(thread, cpu).then_some(thread))
    }

    /// Make a ready node compete for a processor.
    fn enqueue(&mut self, thread: ThreadId, prepend: bool) {
        if let Some(cpu) = self.idle_cpu_for(thread) {
            self.place(thread, cpu, prepend);
            return;
        }
        if let Some(victim) = self.lowest_scheduled_for(thread) {
            let (mine, theirs) = (self.prio(thread), self.prio(victim));
            let better = if prepend { mine <= theirs } else { mine < theirs };
            if better {
                if let Some(cpu) = self.vacate(victim) {
                    self.insert_ready(victim, true);
                    self.place(thread, cpu, prepend);
                    return;
                }
            }
        }
        self.insert_ready(thread, prepend);
    }

    /// A scheduled node changed priority or yielded: keep its processor or
    /// hand it to the best ready node.
    fn enqueue_scheduled(&mut self, thread: ThreadId, prepend: bool) {
        self.remove_scheduled(thread);
        let Some(cpu) = self.nodes.get(thread).and_then(|node| node.cpu) else {
            return;
        };
        if let Some(highest) = self.highest_ready_for(cpu) {
            let (mine, theirs) = (self.prio(thread), self.prio(highest));
            let stays = if prepend { mine <= theirs } else { mine < theirs };
            if !stays {
                self.vacate(thread);
                self.insert_ready(thread, prepend);
                self.ready.extract(highest);
                self.place(highest, cpu, false);
                return;
            }
        }
        self.insert_scheduled(thread, prepend);
    }

    fn schedule_highest_ready(&mut self, cpu: usize) {
        match self.highest_ready_for(cpu) {
            Some(highest) => {
                self.ready.extract(highest);
                self.place(highest, cpu, false);
            }
            None => self.fill_idle(cpu),
        }
    }

    /// Node of a blocked owner lost its reason to stay on a processor.
    fn withdraw(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get(thread) else {
            return;
        };
        if !node.owner_blocked || node.help_state.is_sticky() {
            return;
        }
        if matches!(node.user, NodeUser::Helped(_)) {
            return;
        }
        match node.state {
            NodeState::Scheduled => {
                if let Some(cpu) = self.vacate(thread) {
                    self.schedule_highest_ready(cpu);
                }
            }
            NodeState::Ready => {
                self.ready.extract(thread);
            }
            NodeState::Blocked => {}
        }
        if let Some(node) = self.nodes.get_mut(thread) {
            node.state = NodeState::Blocked;
            node.cpu = None;
        }
    }

    fn next_move(&self) -> Option<Move> {
        self.ready.find_map(|thread| {
            if let Some(cpu) = self.idle_cpu_for(thread) {
                return Some(Move::Fill(thread, cpu));
            }
            let victim = self.lowest_scheduled_for(thread)?;
            (self.prio(thread) < self.prio(victim)).then_some(Move::Preempt(thread, victim))
        })
    }

    /// Move ready nodes onto processors until no ready node is better than
    /// an occupant of a processor it admits.
    fn rebalance(&mut self) {
        while let Some(step) = self.next_move() {
            match step {
                Move::Fill(thread, cpu) => {
                    self.ready.extract(thread);
                    self.place(thread, cpu, false);
                }
                Move::Preempt(thread, victim) => {
                    self.ready.extract(thread);
                    match self.vacate(victim) {
                        Some(cpu) => {
                            self.insert_ready(victim, true);
                            self.place(thread, cpu, false);
                        }
                        None => {
                            // Scheduled list and node disagree; stop instead
                            // of looping.
                            self.insert_ready(thread, true);
                            log::error!("{}: scheduled without a processor", victim);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn occupant_priority(&self, cpu: usize) -> Option<u64> {
        self.slots.iter().find(|(id, _)| *id == cpu).map(|(_, slot)| match slot {
            CpuSlot::Node(thread) => self.prio(*thread),
            _ => u64::MAX,
        })
    }
}

impl<V: SmpVariant> SchedulerPolicy for SmpScheduler<V> {
    fn kind(&self) -> PolicyKind {
        V::KIND
    }

    fn processors(&self) -> CpuSet {
        self.processors
    }

    fn priority_map(&self) -> PriorityMap {
        self.map
    }

    fn map_priority(&self, priority: Priority) -> SchedResult<NodePriority> {
        if V::KIND.is_edf() {
            self.map.map_background(priority)
        } else {
            self.map.map(priority).map(|index| NodePriority::new(index as u64))
        }
    }

    fn unmap_priority(&self, priority: NodePriority) -> Option<Priority> {
        if V::KIND.is_edf() {
            self.map.unmap_background(priority)
        } else {
            self.map.unmap(priority.value as usize)
        }
    }

    fn start_idle(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread> {
        match self.slot_mut(cpu) {
            Some(slot) if matches!(slot, CpuSlot::Vacant) => *slot = CpuSlot::Idle(idle),
            _ => return Err(idle),
        }
        self.rebalance();
        Ok(())
    }

    fn add_processor(&mut self, cpu: usize, idle: IdleThread) -> Result<(), IdleThread> {
        if self.slots.iter().any(|(id, _)| *id == cpu) {
            return Err(idle);
        }
        let at = self
            .slots
            .iter()
            .position(|(id, _)| *id > cpu)
            .unwrap_or(self.slots.len());
        self.slots.insert(at, (cpu, CpuSlot::Idle(idle)));
        self.processors.add(cpu);
        log::debug!("{}: took over cpu {}", V::KIND.name(), cpu);
        self.rebalance();
        Ok(())
    }

    fn remove_processor(&mut self, cpu: usize) -> Option<IdleThread> {
        let at = self.slots.iter().position(|(id, _)| *id == cpu)?;
        let idle = match self.slots[at].1 {
            CpuSlot::Vacant => return None,
            CpuSlot::Node(thread) => {
                self.displace(thread);
                // The idle thread the processor would fall back to
                self.idle_pool.pop()
            }
            CpuSlot::Idle(_) => None,
        };
        let (_, slot) = self.slots.remove(at);
        self.processors.remove(cpu);
        let idle = match slot {
            CpuSlot::Idle(own) => Some(own),
            _ => idle,
        };
        if idle.is_none() {
            log::error!("cpu {}: removed without an idle thread", cpu);
        }
        log::debug!("{}: gave up cpu {}", V::KIND.name(), cpu);
        self.rebalance();
        idle
    }

    fn node_initialize(
        &mut self,
        thread: ThreadId,
        priority: NodePriority,
        affinity: CpuSet,
    ) -> SchedResult<()> {
        self.nodes
            .insert(SchedulerNode::new(thread, priority, V::payload(affinity)))
            .map_err(|_| SchedError::InvalidState {
                expected: "inactive node",
                actual: "active node",
            })
    }

    fn node_destroy(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get(thread) else {
            unknown_node("node_destroy", thread);
            return;
        };
        match node.state {
            NodeState::Scheduled => {
                if let Some(cpu) = self.vacate(thread) {
                    self.schedule_highest_ready(cpu);
                }
            }
            NodeState::Ready => {
                self.ready.extract(thread);
            }
            NodeState::Blocked => {}
        }
        if let Some(NodeUser::Idle(idle)) = self.nodes.destroy(thread) {
            self.idle_pool.push(idle);
        }
        self.rebalance();
    }

    fn schedule(&mut self) {
        self.rebalance();
    }

    fn block(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("block", thread);
            return;
        };
        node.owner_blocked = true;
        let sticky = node.help_state.is_sticky();

        match node.state {
            NodeState::Blocked => return,
            NodeState::Scheduled => match node.user {
                NodeUser::Helped(_) => {}
                NodeUser::Idle(_) => {}
                NodeUser::Owner if sticky => {
                    if let Some(idle) = self.idle_pool.pop() {
                        if let Some(node) = self.nodes.get_mut(thread) {
                            node.user = NodeUser::Idle(idle);
                        }
                    } else {
                        log::error!("{}: no idle thread for sticky node", thread);
                    }
                }
                NodeUser::Owner => {
                    if let Some(cpu) = self.vacate(thread) {
                        if let Some(node) = self.nodes.get_mut(thread) {
                            node.state = NodeState::Blocked;
                        }
                        self.schedule_highest_ready(cpu);
                    }
                }
            },
            NodeState::Ready => {
                if !sticky {
                    node.state = NodeState::Blocked;
                    self.ready.extract(thread);
                }
            }
        }
        self.rebalance();
    }

    fn unblock(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("unblock", thread);
            return;
        };
        node.owner_blocked = false;
        match node.state {
            NodeState::Blocked => {
                let prepend = node.priority.prepend_it;
                self.enqueue(thread, prepend);
            }
            NodeState::Scheduled => {
                if matches!(node.user, NodeUser::Idle(_)) {
                    if let NodeUser::Idle(idle) =
                        core::mem::replace(&mut node.user, NodeUser::Owner)
                    {
                        self.idle_pool.push(idle);
                    }
                }
            }
            NodeState::Ready => {}
        }
        self.rebalance();
    }

    fn update_priority(&mut self, thread: ThreadId, priority: NodePriority) {
        let Some(node) = self.nodes.get_mut(thread) else {
            unknown_node("update_priority", thread);
            return;
        };
        if node.priority.value == priority.value && !priority.prepend_it {
            return;
        }
        node.priority = priority;
        match node.state {
            NodeState::Blocked => return,
            NodeState::Ready => {
                self.ready.extract(thread);
                self.enqueue(thread, priority.prepend_it);
            }
            NodeState::Scheduled => self.enqueue_scheduled(thread, priority.prepend_it),
        }
        self.rebalance();
    }

    fn yield_thread(&mut self, thread: ThreadId) {
        let Some(node) = self.nodes.get(thread) else {
            unknown_node("yield", thread);
            return;
        };
        match node.state {
            NodeState::Blocked => return,
            NodeState::Ready => {
                self.ready.extract(thread);
                self.insert_ready(thread, false);
            }
            NodeState::Scheduled => self.enqueue_scheduled(thread, false),
        }
        self.rebalance();
    }

    fn tick(&mut self, cpu: usize, ticks_per_timeslice: u32) {
        let occupant = self.slots.iter().find_map(|(id, slot)| match slot {
            CpuSlot::Node(thread) if *id == cpu => Some(*thread),
            _ => None,
        });
        let Some(thread) = occupant else {
            return;
        };
        let expired = self.nodes.get_mut(thread).is_some_and(|node| {
            node.user == NodeUser::Owner && node.consume_timeslice(ticks_per_timeslice)
        });
        if expired {
            self.yield_thread(thread);
        }
    }

    fn set_affinity(&mut self, thread: ThreadId, affinity: CpuSet) -> SchedResult<()> {
        if self.nodes.get(thread).is_none() {
            return Err(SchedError::ThreadNotFound { id: thread });
        }
        V::KIND.check_affinity(self.processors, affinity)?;

        let Some(node) = self.nodes.get_mut(thread) else {
            return Err(SchedError::ThreadNotFound { id: thread });
        };
        node.payload = V::payload(affinity);
        let misplaced = node.state == NodeState::Scheduled
            && node.cpu.is_some_and(|cpu| !node.admits(cpu));

        if misplaced {
            if let Some(cpu) = self.vacate(thread) {
                log::debug!("{}: leaving cpu {} after affinity change", thread, cpu);
                self.schedule_highest_ready(cpu);
            }
            self.enqueue(thread, false);
        }
        self.rebalance();
        Ok(())
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
        let lent = matches!(node.user, NodeUser::Helped(_));

        if lent && !state.may_lend() {
            self.reclaim_node(thread);
        }
        self.withdraw(thread);
        self.rebalance();
        Ok(())
    }

    fn lend_node(&mut self, rival: ThreadId, helped: ThreadId) -> bool {
        let Some(node) = self.nodes.get_mut(rival) else {
            return false;
        };
        let eligible = node.state == NodeState::Scheduled
            && node.user == NodeUser::Owner
            && !node.owner_blocked
            && node.help_state.may_lend();
        if eligible {
            log::debug!("{} lends its node on {:?} to {}", rival, node.cpu, helped);
            node.user = NodeUser::Helped(helped);
        }
        eligible
    }

    fn reclaim_node(&mut self, rival: ThreadId) -> Option<ThreadId> {
        let node = self.nodes.get_mut(rival)?;
        let NodeUser::Helped(helped) = node.user else {
            return None;
        };
        node.user = NodeUser::Owner;
        let sticky_blocked = node.owner_blocked && node.help_state.is_sticky();
        if sticky_blocked {
            if let Some(idle) = self.idle_pool.pop() {
                if let Some(node) = self.nodes.get_mut(rival) {
                    node.user = NodeUser::Idle(idle);
                }
            }
        }
        self.withdraw(rival);
        self.rebalance();
        Some(helped)
    }

    fn release_job(&self, deadline: u64) -> SchedResult<NodePriority> {
        if !V::KIND.is_edf() {
            return Err(SchedError::NotSupported {
                operation: "release_job",
            });
        }
        Ok(NodePriority::deadline(deadline))
    }

    fn cancel_job(&self, priority: Priority) -> SchedResult<NodePriority> {
        if !V::KIND.is_edf() {
            return Err(SchedError::NotSupported {
                operation: "cancel_job",
            });
        }
        self.map_priority(priority)
    }

    fn pin(&mut self, thread: ThreadId, cpu: usize) -> SchedResult<()> {
        if !self.processors.contains(cpu) {
            return Err(SchedError::InvalidCpuId { cpu });
        }
        let node = self
            .nodes
            .get_mut(thread)
            .ok_or(SchedError::ThreadNotFound { id: thread })?;
        node.pinned = Some(cpu);
        let elsewhere = node.state == NodeState::Scheduled && node.cpu.is_some_and(|c| c != cpu);

        if elsewhere {
            if let Some(old) = self.vacate(thread) {
                log::debug!("{}: pinned to cpu {}, leaving cpu {}", thread, cpu, old);
                self.schedule_highest_ready(old);
            }
            self.enqueue(thread, true);
        }
        self.rebalance();
        Ok(())
    }

    fn unpin(&mut self, thread: ThreadId) {
        match self.nodes.get_mut(thread) {
            Some(node) => node.pinned = None,
            None => {
                unknown_node("unpin", thread);
                return;
            }
        }
        self.rebalance();
    }

    fn set_preemptible(&mut self, thread: ThreadId, preemptible: bool) {
        match self.nodes.get_mut(thread) {
            Some(node) => node.preemptible = preemptible,
            None => unknown_node("set_preemptible", thread),
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
        let (_, slot) = self.slots.iter().find(|(id, _)| *id == cpu)?;
        match slot {
            CpuSlot::Vacant => None,
            CpuSlot::Idle(idle) => Some(idle.id()),
            CpuSlot::Node(thread) => self.nodes.get(*thread).map(SchedulerNode::user_thread),
        }
    }

    fn node(&self, thread: ThreadId) -> Option<&SchedulerNode> {
        self.nodes.get(thread)
    }

    fn ready_order(&self) -> Vec<ThreadId> {
        let mut order = self.scheduled.clone();
        order.extend(self.ready.order());
        order
    }

    fn check_consistency(&self) -> bool {
        if !self.ready.is_consistent() {
            return false;
        }
        let ready = self.ready.order();
        let owned = self.slots.len() == self.processors.count()
            && self.slots.iter().all(|(cpu, _)| self.processors.contains(*cpu));

        let placed = self.scheduled.iter().all(|&thread| {
            self.nodes.get(thread).is_some_and(|node| {
                node.state == NodeState::Scheduled
                    && node.cpu.is_some_and(|cpu| {
                        node.admits(cpu)
                            && self.slots.iter().any(|(id, slot)| {
                                *id == cpu && matches!(slot, CpuSlot::Node(t) if *t == thread)
                            })
                    })
            })
        });
        let ordered = self
            .scheduled
            .windows(2)
            .all(|pair| self.prio(pair[0]) <= self.prio(pair[1]));
        let queued = ready.iter().all(|&thread| {
            self.nodes
                .get(thread)
                .is_some_and(|node| node.state == NodeState::Ready)
        });

        let started = self
            .slots
            .iter()
            .filter(|(_, slot)| !matches!(slot, CpuSlot::Vacant))
            .count();
        let idle_on_cpus = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, CpuSlot::Idle(_)))
            .count();
        let idle_in_nodes = self
            .nodes
            .iter()
            .filter(|node| matches!(node.user, NodeUser::Idle(_)))
            .count();
        let tokens = self.idle_pool.len() + idle_on_cpus + idle_in_nodes == started;

        // No ready node is better than the occupant of a processor it admits.
        let optimal = ready.iter().all(|&thread| {
            let mine = self.prio(thread);
            self.slots.iter().all(|(cpu, _)| {
                !self.admits(thread, *cpu)
                    || self.occupant_priority(*cpu).is_some_and(|theirs| theirs <= mine)
            })
        });

        owned && placed && ordered && queued && tokens && optimal
    }
}
