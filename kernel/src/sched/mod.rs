//! Thread scheduling core
//!
//! Scheduler instances own disjoint processor sets and implement one policy
//! each:
//! - Simple and deterministic priority uniprocessor schedulers
//! - EDF, optionally with constant bandwidth servers
//! - Global and affinity-aware fixed-priority SMP schedulers and EDF SMP,
//!   all with resource helping and run-time processor handover
//!
//! The [`System`](crate::system::System) ties instances, threads, CBS
//! servers and helping resources together.

pub mod cbs;
pub mod cpu;
pub mod help;
pub mod node;
pub mod policy;
pub mod priority;
pub mod queue;
pub mod resource;
pub mod smp;
pub mod thread;
pub mod uniprocessor;

use core::fmt;

pub use cbs::{CbsParameters, ExecutionTime, OverrunHandler};
pub use cpu::{CpuSet, MAX_CPUS};
pub use help::HelpState;
pub use node::{CpuBudget, IdleThread, NodeState};
pub use policy::{PolicyKind, SchedulerPolicy};
pub use priority::{NodePriority, Priority, PriorityMap, MAX_PRIORITY};
pub use resource::{ObtainStatus, WaitMode};
pub use thread::{WaitFlags, WaitStatus};

/// Thread identifier, also the index of the thread's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler instance identifier (configuration order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchedulerId(pub usize);

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CBS server identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerId(pub u32);

impl ServerId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Helping resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
