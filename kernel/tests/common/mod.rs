//! Common test utilities for the scheduler integration tests

#![allow(dead_code)]

use rtsched_kernel::{
    sched::{thread::WaitFlags, CpuSet},
    PolicyKind, Priority, SchedulerConfig, SchedulerId, System, SystemConfig, ThreadId,
};

/// System with one instance of `policy` on `cpus` processors
pub fn single(cpus: usize, policy: PolicyKind) -> System {
    System::new(SystemConfig::single(cpus, policy)).expect("valid configuration")
}

/// Two uniprocessor priority instances, one per processor
pub fn partitioned() -> System {
    let config = SystemConfig::new(2)
        .with_scheduler(SchedulerConfig::new(
            "left",
            PolicyKind::Priority,
            CpuSet::single(0),
        ))
        .with_scheduler(SchedulerConfig::new(
            "right",
            PolicyKind::Priority,
            CpuSet::single(1),
        ));
    System::new(config).expect("valid configuration")
}

/// Create and start a thread in the first instance.
pub fn started(system: &System, priority: u32) -> ThreadId {
    started_in(system, SchedulerId(0), priority)
}

pub fn started_in(system: &System, scheduler: SchedulerId, priority: u32) -> ThreadId {
    let thread = system
        .create_thread(scheduler, Priority(priority))
        .expect("thread slot");
    system.start_thread(thread).expect("dormant thread");
    thread
}

/// Heirs of every processor in index order
pub fn heirs(system: &System) -> Vec<Option<ThreadId>> {
    (0..system.cpu_count()).map(|cpu| system.heir(cpu)).collect()
}

pub fn assert_consistent(system: &System) {
    for instance in system.schedulers() {
        assert!(
            system.check_consistency(instance.id()).expect("instance"),
            "{} is inconsistent",
            instance.name()
        );
    }
}

/// A resource owner that is ready but not executing must be outranked on
/// every processor it may use: the node holding the processor is at least
/// as urgent as the owner.
pub fn assert_owner_not_inverted(system: &System, owner: ThreadId) {
    if system.cpu_of(owner).is_some() || system.is_thread_blocked(owner).expect("thread") {
        return;
    }
    let mine = system.effective_priority(owner).expect("thread");
    let affinity = system.affinity(owner).expect("thread");
    for cpu in (0..system.cpu_count()).filter(|&cpu| affinity.contains(cpu)) {
        let Some(holder) = system.node_on_cpu(cpu) else {
            panic!("owner {} is ready while cpu {} idles", owner, cpu);
        };
        let theirs = system.effective_priority(holder).expect("holder");
        assert!(
            theirs <= mine,
            "owner {} at {} displaced by {} at {} on cpu {}",
            owner,
            mine,
            holder,
            theirs,
            cpu
        );
    }
}

/// Put a thread to sleep on an event and return once it is blocked.
pub fn sleep(system: &System, thread: ThreadId) {
    assert!(system
        .block_on(thread, WaitFlags::CLASS_EVENT)
        .expect("active thread"));
}
