//! Scheduler nodes
//!
//! A node is one thread's participation in one scheduler instance. Nodes
//! live in a per-scheduler [`NodeTable`] indexed by thread slot and are
//! only mutated by the owning scheduler's operations.

use alloc::vec::Vec;

use super::{help::HelpState, priority::NodePriority, CpuSet, ThreadId};

/// Dispatch state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Blocked,
    Ready,
    Scheduled,
}

impl NodeState {
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Blocked => "blocked",
            NodeState::Ready => "ready",
            NodeState::Scheduled => "scheduled",
        }
    }
}

/// Lifecycle of a node slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLifecycle {
    Inactive,
    Active,
    Destroyed,
}

/// An idle thread. Not `Clone`: whoever holds the token is the only user of
/// that idle thread.
#[derive(Debug, PartialEq, Eq)]
pub struct IdleThread(ThreadId);

impl IdleThread {
    pub(crate) fn new(thread: ThreadId) -> Self {
        Self(thread)
    }

    pub fn id(&self) -> ThreadId {
        self.0
    }
}

/// Thread currently executing with a node
#[derive(Debug, PartialEq, Eq)]
pub enum NodeUser {
    /// The owning thread
    Owner,
    /// An idle thread keeping the processor for a blocked owner
    Idle(IdleThread),
    /// A resource owner borrowing this node
    Helped(ThreadId),
}

/// Policy-specific node data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePayload {
    Basic,
    /// Processors the thread may run on
    Affinity(CpuSet),
    /// Absolute deadline of the released job, if any
    Edf { deadline: Option<u64> },
}

/// Per-thread CPU budget algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuBudget {
    #[default]
    None,
    /// Yield to equal-priority peers when the timeslice is used up
    Timeslice,
}

#[derive(Debug)]
pub struct SchedulerNode {
    pub owner: ThreadId,
    pub priority: NodePriority,
    pub state: NodeState,
    /// Processor the node is scheduled on
    pub cpu: Option<usize>,
    pub user: NodeUser,
    pub help_state: HelpState,
    /// Thread that would benefit from this node being lent
    pub accepts_help: Option<ThreadId>,
    /// Owner is blocked while the node itself may stay ready or scheduled
    pub owner_blocked: bool,
    pub lifecycle: NodeLifecycle,
    pub payload: NodePayload,
    /// Processor the thread is pinned to; overrides the affinity
    pub pinned: Option<usize>,
    pub preemptible: bool,
    pub budget: CpuBudget,
    /// Remaining ticks of the current timeslice
    pub timeslice: u32,
}

impl SchedulerNode {
    pub fn new(owner: ThreadId, priority: NodePriority, payload: NodePayload) -> Self {
        Self {
            owner,
            priority,
            state: NodeState::Blocked,
            cpu: None,
            user: NodeUser::Owner,
            help_state: HelpState::Yourself,
            accepts_help: None,
            owner_blocked: true,
            lifecycle: NodeLifecycle::Active,
            payload,
            pinned: None,
            preemptible: true,
            budget: CpuBudget::None,
            timeslice: 0,
        }
    }

    /// Thread that actually runs when this node is scheduled
    pub fn user_thread(&self) -> ThreadId {
        match &self.user {
            NodeUser::Owner => self.owner,
            NodeUser::Idle(idle) => idle.id(),
            NodeUser::Helped(thread) => *thread,
        }
    }

    /// Whether the node may be placed on `cpu`
    pub fn admits(&self, cpu: usize) -> bool {
        if let Some(pinned) = self.pinned {
            return pinned == cpu;
        }
        match self.payload {
            NodePayload::Affinity(set) => set.contains(cpu),
            _ => true,
        }
    }

    /// Consume one tick of the timeslice; true when it expired and was
    /// reloaded with `reload` ticks.
    pub fn consume_timeslice(&mut self, reload: u32) -> bool {
        if self.budget != CpuBudget::Timeslice || !self.preemptible {
            return false;
        }
        self.timeslice = self.timeslice.saturating_sub(1);
        if self.timeslice == 0 {
            self.timeslice = reload;
            true
        } else {
            false
        }
    }
}

/// Node storage of one scheduler instance, indexed by thread slot
#[derive(Debug)]
pub struct NodeTable {
    nodes: Vec<Option<SchedulerNode>>,
}

impl NodeTable {
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize_with(capacity, || None);
        Self { nodes }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Active node of `thread`
    pub fn get(&self, thread: ThreadId) -> Option<&SchedulerNode> {
        self.nodes
            .get(thread.index())
            .and_then(Option::as_ref)
            .filter(|node| node.lifecycle == NodeLifecycle::Active)
    }

    pub fn get_mut(&mut self, thread: ThreadId) -> Option<&mut SchedulerNode> {
        self.nodes
            .get_mut(thread.index())
            .and_then(Option::as_mut)
            .filter(|node| node.lifecycle == NodeLifecycle::Active)
    }

    /// Lifecycle of the slot, including destroyed nodes
    pub fn lifecycle(&self, thread: ThreadId) -> NodeLifecycle {
        match self.nodes.get(thread.index()).and_then(Option::as_ref) {
            Some(node) => node.lifecycle,
            None => NodeLifecycle::Inactive,
        }
    }

    /// Install a node; fails if the slot holds an active node.
    pub fn insert(&mut self, node: SchedulerNode) -> Result<(), SchedulerNode> {
        let index = node.owner.index();
        match self.nodes.get_mut(index) {
            Some(slot) if slot.as_ref().map_or(true, |n| n.lifecycle != NodeLifecycle::Active) => {
                *slot = Some(node);
                Ok(())
            }
            _ => Err(node),
        }
    }

    /// Mark the node destroyed and hand back its user.
    pub fn destroy(&mut self, thread: ThreadId) -> Option<NodeUser> {
        let node = self.get_mut(thread)?;
        node.lifecycle = NodeLifecycle::Destroyed;
        node.state = NodeState::Blocked;
        node.cpu = None;
        Some(core::mem::replace(&mut node.user, NodeUser::Owner))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchedulerNode> {
        self.nodes
            .iter()
            .filter_map(Option::as_ref)
            .filter(|node| node.lifecycle == NodeLifecycle::Active)
    }
}
