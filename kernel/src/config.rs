//! System configuration
//!
//! The configuration table is checked once by [`SystemConfig::validate`];
//! a system with an invalid configuration does not start.

use alloc::vec::Vec;

use crate::{
    error::ConfigError,
    sched::{CpuSet, PolicyKind, Priority, MAX_CPUS, MAX_PRIORITY},
};

/// Default ticks a thread may run before a timeslice yield
pub const DEFAULT_TICKS_PER_TIMESLICE: u32 = 50;

/// Default clock tick length
pub const DEFAULT_MICROSECONDS_PER_TICK: u64 = 10_000;

/// Default maximum number of application threads
pub const DEFAULT_MAX_THREADS: usize = 64;

/// Default maximum number of CBS servers
pub const DEFAULT_MAX_CBS_SERVERS: usize = 16;

/// One scheduler instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub name: &'static str,
    pub policy: PolicyKind,
    /// Processors owned by the instance
    pub processors: CpuSet,
    /// Least urgent priority; the range is `0..=max_priority`
    pub max_priority: Priority,
}

impl SchedulerConfig {
    pub fn new(name: &'static str, policy: PolicyKind, processors: CpuSet) -> Self {
        Self {
            name,
            policy,
            processors,
            max_priority: Priority(MAX_PRIORITY),
        }
    }

    pub fn with_max_priority(mut self, max_priority: Priority) -> Self {
        self.max_priority = max_priority;
        self
    }
}

/// Whole-system configuration table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub cpu_count: usize,
    /// Application threads; idle threads are extra
    pub max_threads: usize,
    pub ticks_per_timeslice: u32,
    pub microseconds_per_tick: u64,
    pub max_cbs_servers: usize,
    pub schedulers: Vec<SchedulerConfig>,
}

impl SystemConfig {
    /// Configuration for `cpu_count` processors and no schedulers yet
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpu_count,
            max_threads: DEFAULT_MAX_THREADS,
            ticks_per_timeslice: DEFAULT_TICKS_PER_TIMESLICE,
            microseconds_per_tick: DEFAULT_MICROSECONDS_PER_TICK,
            max_cbs_servers: DEFAULT_MAX_CBS_SERVERS,
            schedulers: Vec::new(),
        }
    }

    /// One instance of `policy` owning every processor
    pub fn single(cpu_count: usize, policy: PolicyKind) -> Self {
        Self::new(cpu_count).with_scheduler(SchedulerConfig::new(
            policy.name(),
            policy,
            CpuSet::first(cpu_count),
        ))
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_ticks_per_timeslice(mut self, ticks: u32) -> Self {
        self.ticks_per_timeslice = ticks;
        self
    }

    pub fn with_microseconds_per_tick(mut self, microseconds: u64) -> Self {
        self.microseconds_per_tick = microseconds;
        self
    }

    pub fn with_max_cbs_servers(mut self, servers: usize) -> Self {
        self.max_cbs_servers = servers;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.schedulers.push(scheduler);
        self
    }

    /// Thread slots including one idle thread per processor
    pub fn thread_capacity(&self) -> usize {
        self.cpu_count + self.max_threads
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 {
            return Err(ConfigError::NoProcessors);
        }
        if self.cpu_count > MAX_CPUS {
            return Err(ConfigError::TooManyProcessors {
                count: self.cpu_count,
                max: MAX_CPUS,
            });
        }
        if self.max_threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.microseconds_per_tick == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.ticks_per_timeslice == 0 {
            return Err(ConfigError::ZeroTimeslice);
        }
        if self.schedulers.is_empty() {
            return Err(ConfigError::NoSchedulers);
        }

        let present = CpuSet::first(self.cpu_count);
        let mut claimed = CpuSet::empty();
        for (index, scheduler) in self.schedulers.iter().enumerate() {
            let name = scheduler.name;
            if self.schedulers[..index].iter().any(|other| other.name == name) {
                return Err(ConfigError::DuplicateName { scheduler: name });
            }
            if scheduler.processors.is_empty() {
                return Err(ConfigError::EmptyProcessorSet { scheduler: name });
            }
            if let Some(cpu) = scheduler.processors.iter().find(|&cpu| !present.contains(cpu)) {
                return Err(ConfigError::ProcessorOutOfRange {
                    scheduler: name,
                    cpu,
                });
            }
            if let Some(cpu) = scheduler.processors.intersection(claimed).lowest() {
                return Err(ConfigError::OverlappingProcessors { cpu });
            }
            let count = scheduler.processors.count();
            if !scheduler.policy.is_smp() && count != 1 {
                return Err(ConfigError::UniprocessorSpan {
                    scheduler: name,
                    count,
                });
            }
            if scheduler.max_priority.value() > MAX_PRIORITY {
                return Err(ConfigError::InvalidPriorityRange {
                    scheduler: name,
                    max: scheduler.max_priority,
                });
            }
            claimed = CpuSet::from_mask(claimed.mask() | scheduler.processors.mask());
        }
        Ok(())
    }
}
