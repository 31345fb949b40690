//! Real-time scheduler core
//!
//! This library provides the thread scheduling core of a real-time kernel:
//! fixed-priority and EDF uniprocessor schedulers, constant bandwidth
//! servers, and global or affinity-aware SMP schedulers in which threads
//! spinning on a resource lend their processor to the resource owner.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod error;
pub mod sched;
pub mod sync;
pub mod system;

pub use config::{SchedulerConfig, SystemConfig};
pub use error::{CbsError, ConfigError, KernelError, KernelResult, SchedError};
// Re-export scheduler items for tests
pub use sched::{
    CpuSet, NodePriority, PolicyKind, Priority, ResourceId, SchedulerId, ServerId, ThreadId,
};
pub use system::System;
