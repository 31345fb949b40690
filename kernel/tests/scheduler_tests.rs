//! Scheduler Tests
//!
//! End-to-end tests for the scheduler system: dispatch order, priority
//! changes, affinity, constant bandwidth servers, resource helping and the
//! wait completion race.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use rtsched_kernel::{
    sched::{
        queue::ReadyQueue, CbsParameters, HelpState, NodeState, ObtainStatus, OverrunHandler,
        WaitFlags, WaitMode, WaitStatus,
    },
    CbsError, CpuSet, PolicyKind, Priority, SchedError, SchedulerConfig, SchedulerId, ServerId,
    System, SystemConfig, ThreadId,
};

mod common;

use common::{
    assert_consistent, assert_owner_not_inverted, heirs, partitioned, single, sleep, started,
    started_in,
};

const UNIPROCESSOR_POLICIES: [PolicyKind; 4] = [
    PolicyKind::Simple,
    PolicyKind::Priority,
    PolicyKind::Edf,
    PolicyKind::Cbs,
];

fn counting_handler(count: &Arc<AtomicUsize>) -> OverrunHandler {
    let count = Arc::clone(count);
    Arc::new(move |_: ServerId| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

// ===== Dispatch Order =====

#[test]
fn test_ready_queue_priority_then_fifo() {
    let mut queue = ReadyQueue::new(256, 8);
    let (low, first, second) = (ThreadId(1), ThreadId(2), ThreadId(3));
    queue.enqueue(first, 3);
    queue.enqueue(second, 3);
    queue.enqueue(low, 5);

    let mut order = Vec::new();
    while let Some(thread) = queue.first() {
        order.push(thread);
        assert!(queue.extract(thread));
        assert!(queue.is_consistent());
    }
    assert_eq!(order, [first, second, low]);
}

#[test]
fn test_dispatch_priority_then_fifo() {
    for policy in UNIPROCESSOR_POLICIES {
        let system = single(1, policy);
        let low = system.create_thread(SchedulerId(0), Priority(5)).unwrap();
        let first = system.create_thread(SchedulerId(0), Priority(3)).unwrap();
        let second = system.create_thread(SchedulerId(0), Priority(3)).unwrap();
        for thread in [first, second, low] {
            system.start_thread(thread).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let heir = system.heir(0).unwrap();
            order.push(heir);
            system.block(heir).unwrap();
            assert_consistent(&system);
        }
        assert_eq!(order, [first, second, low], "{}", policy.name());
        assert_eq!(system.heir(0), Some(ThreadId(0)));
    }
}

#[test]
fn test_equal_priorities_run_in_start_order() {
    for policy in [PolicyKind::Simple, PolicyKind::Priority, PolicyKind::PrioritySmp] {
        let system = single(1, policy);
        let threads: Vec<ThreadId> = (0..4).map(|_| started(&system, 7)).collect();
        let mut order = Vec::new();
        while let Some(heir) = system.heir(0).filter(|&t| !system.is_idle_thread(t)) {
            order.push(heir);
            system.block(heir).unwrap();
        }
        assert_eq!(order, threads, "{}", policy.name());
    }
}

#[test]
fn test_smp_runs_best_threads() {
    let system = single(2, PolicyKind::PrioritySmp);
    let mut running: Vec<(u32, ThreadId)> = Vec::new();
    for priority in [9, 7, 12, 5, 3, 8] {
        running.push((priority, started(&system, priority)));
        running.sort();

        let mut expected: Vec<ThreadId> = running.iter().take(2).map(|&(_, t)| t).collect();
        let mut actual: Vec<ThreadId> = heirs(&system)
            .into_iter()
            .flatten()
            .filter(|&t| !system.is_idle_thread(t))
            .collect();
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);
        assert_consistent(&system);
    }
}

// ===== Priority Changes =====

#[test]
fn test_unchanged_priority_keeps_position() {
    let system = single(1, PolicyKind::Priority);
    let a = started(&system, 5);
    let b = started(&system, 5);
    let c = started(&system, 5);
    assert_eq!(system.ready_order(SchedulerId(0)).unwrap(), [a, b, c]);

    assert_eq!(system.set_priority(b, Priority(5)), Ok(Priority(5)));
    assert_eq!(system.ready_order(SchedulerId(0)).unwrap(), [a, b, c]);
    assert!(!system.current_priority(b).unwrap().prepend_it);
    assert_eq!(system.heir(0), Some(a));

    // A real change requeues behind the peers.
    system.set_priority(b, Priority(4)).unwrap();
    assert_eq!(system.heir(0), Some(b));
    system.set_priority(b, Priority(5)).unwrap();
    assert_eq!(system.ready_order(SchedulerId(0)).unwrap(), [a, c, b]);
    assert_eq!(system.heir(0), Some(a));
}

#[test]
fn test_priority_reads_never_torn() {
    let system = single(1, PolicyKind::Priority);
    let target = started(&system, 10);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let value = system.current_priority(target).unwrap().value;
                    assert!(value == 10 || value == 20, "torn read {}", value);
                }
            });
        }
        for round in 0..2_000 {
            let priority = if round % 2 == 0 { 20 } else { 10 };
            system.set_priority(target, Priority(priority)).unwrap();
        }
        done.store(true, Ordering::Release);
    });
    assert_eq!(system.current_priority(target).unwrap().value, 10);
}

// ===== Affinity =====

#[test]
fn test_affinity_migrates_thread() {
    let system = single(2, PolicyKind::PriorityAffinitySmp);
    let mover = started(&system, 5);
    let other = started(&system, 6);
    assert_eq!(system.cpu_of(mover), Some(0));

    system.set_affinity(mover, CpuSet::single(1)).unwrap();
    assert_eq!(system.cpu_of(mover), Some(1));
    assert_eq!(system.cpu_of(other), Some(0));
    assert_consistent(&system);

    let urgent = started(&system, 2);
    let steps: [&dyn Fn(&System); 7] = [
        &|s: &System| s.tick(),
        &|s: &System| s.block(urgent).unwrap(),
        &|s: &System| s.unblock(urgent).unwrap(),
        &|s: &System| {
            s.set_priority(mover, Priority(9)).unwrap();
        },
        &|s: &System| s.yield_thread(other).unwrap(),
        &|s: &System| {
            s.set_priority(mover, Priority(1)).unwrap();
        },
        &|s: &System| s.block(other).unwrap(),
    ];
    for step in steps {
        step(&system);
        assert_ne!(system.cpu_of(mover), Some(0));
        assert_consistent(&system);
    }
    assert_eq!(system.cpu_of(mover), Some(1));

    system.set_affinity(mover, CpuSet::first(2)).unwrap();
    system.set_affinity(urgent, CpuSet::single(1)).unwrap();
    assert_eq!(system.cpu_of(mover), Some(1));
    assert_eq!(system.node_state(urgent), Ok(NodeState::Ready));

    // Once outranked on processor 1 the mover may use processor 0 again.
    system.set_priority(mover, Priority(9)).unwrap();
    assert_eq!(system.cpu_of(urgent), Some(1));
    assert_eq!(system.cpu_of(mover), Some(0));
    assert_consistent(&system);
}

#[test]
fn test_global_smp_rejects_partial_affinity() {
    let system = single(2, PolicyKind::PrioritySmp);
    let thread = started(&system, 5);
    assert_eq!(
        system.set_affinity(thread, CpuSet::single(1)),
        Err(SchedError::InvalidAffinity)
    );
    assert_eq!(
        system.set_affinity(thread, CpuSet::empty()),
        Err(SchedError::InvalidAffinity)
    );
    assert_eq!(system.set_affinity(thread, CpuSet::all()), Ok(()));
    assert_eq!(system.affinity(thread), Ok(CpuSet::all()));
}

// ===== Constant Bandwidth Server =====

#[test]
fn test_cbs_budget_overrun_and_replenishment() {
    let system = single(1, PolicyKind::Cbs);
    let worker = started(&system, 10);
    let overruns = Arc::new(AtomicUsize::new(0));
    let server = system
        .cbs_create_server(CbsParameters::new(100, 20), Some(counting_handler(&overruns)))
        .unwrap();
    system.cbs_attach_thread(server, worker).unwrap();
    assert_eq!(system.current_priority(worker).unwrap().value, 100);
    assert_eq!(system.cbs_get_server_id(worker), Ok(server));

    for _ in 0..20 {
        system.tick();
    }
    assert_eq!(system.cbs_get_remaining_budget(server), Ok(0));
    assert_eq!(overruns.load(Ordering::SeqCst), 1);
    assert_eq!(system.heir(0), Some(worker));

    while system.now() < 99 {
        system.tick();
    }
    assert_eq!(system.cbs_get_remaining_budget(server), Ok(0));
    assert_eq!(overruns.load(Ordering::SeqCst), 1);

    system.tick();
    assert_eq!(system.now(), 100);
    assert_eq!(system.cbs_get_remaining_budget(server), Ok(20));
    assert_eq!(system.cbs_get_approved_budget(server), Ok(20));
    assert_eq!(system.current_priority(worker).unwrap().value, 200);
    let consumed = system.cbs_get_execution_time(server).unwrap();
    assert_eq!((consumed.period, consumed.total), (0, 100));
}

#[test]
fn test_cbs_overrun_once_per_exhaustion() {
    let system = single(1, PolicyKind::Cbs);
    let worker = started(&system, 10);
    let overruns = Arc::new(AtomicUsize::new(0));
    let server = system
        .cbs_create_server(CbsParameters::new(100, 20), Some(counting_handler(&overruns)))
        .unwrap();
    system.cbs_attach_thread(server, worker).unwrap();

    for _ in 0..500 {
        system.tick();
        let remaining = system.cbs_get_remaining_budget(server).unwrap();
        assert!(remaining <= 20);
        if system.now() % 100 == 0 {
            assert_eq!(remaining, 20, "tick {}", system.now());
        }
    }
    assert_eq!(overruns.load(Ordering::SeqCst), 5);
}

#[test]
fn test_cbs_overrun_lowers_priority() {
    let system = single(1, PolicyKind::Cbs);
    let background = started(&system, 1);
    let worker = started(&system, 50);
    assert_eq!(system.heir(0), Some(background));

    let server = system
        .cbs_create_server(CbsParameters::new(100, 20), None)
        .unwrap();
    system.cbs_attach_thread(server, worker).unwrap();
    assert_eq!(system.heir(0), Some(worker));

    for _ in 0..20 {
        system.tick();
    }
    assert_eq!(system.heir(0), Some(background));

    while system.now() < 100 {
        system.tick();
    }
    assert_eq!(system.heir(0), Some(worker));
    assert_eq!(system.cpu_time(worker), Ok(20));
    assert_consistent(&system);
}

#[test]
fn test_cbs_admission_and_errors() {
    let system = single(1, PolicyKind::Cbs);
    let worker = started(&system, 10);
    let big = system
        .cbs_create_server(CbsParameters::new(100, 60), None)
        .unwrap();
    assert_eq!(
        system.cbs_create_server(CbsParameters::new(100, 50), None),
        Err(CbsError::SystemOverload)
    );
    assert_eq!(
        system.cbs_set_parameters(big, CbsParameters::new(100, 200)),
        Err(CbsError::InvalidParameter)
    );
    system
        .cbs_set_parameters(big, CbsParameters::new(200, 60))
        .unwrap();
    assert_eq!(
        system.cbs_get_parameters(big),
        Ok(CbsParameters::new(200, 60))
    );

    system.cbs_attach_thread(big, worker).unwrap();
    assert_eq!(
        system.cbs_attach_thread(big, worker),
        Err(CbsError::InvalidParameter)
    );
    system.cbs_detach_thread(big, worker).unwrap();
    assert_eq!(
        system.cbs_get_server_id(worker),
        Err(CbsError::InvalidParameter)
    );

    system.cbs_destroy_server(big).unwrap();
    assert_eq!(
        system.cbs_get_remaining_budget(big),
        Err(CbsError::NoServer { id: big })
    );

    let fixed = single(1, PolicyKind::Priority);
    let thread = started(&fixed, 10);
    let server = fixed
        .cbs_create_server(CbsParameters::new(100, 10), None)
        .unwrap();
    assert_eq!(
        fixed.cbs_attach_thread(server, thread),
        Err(CbsError::InvalidParameter)
    );
}

// ===== Resource Helping =====

#[test]
fn test_blocked_owner_keeps_processor_with_idle() {
    let system = single(2, PolicyKind::PrioritySmp);
    let resource = system.create_resource(Priority(2)).unwrap();
    let owner = started(&system, 5);
    assert_eq!(
        system.obtain_resource(resource, owner, WaitMode::Spin),
        Ok(ObtainStatus::Acquired)
    );
    assert_eq!(system.help_state(owner), Ok(HelpState::ActiveOwner));
    assert_eq!(system.effective_priority(owner), Ok(Priority(2)));

    let busy = started(&system, 6);
    let waiting = started(&system, 7);
    assert_eq!(system.cpu_of(owner), Some(0));
    assert_eq!(system.cpu_of(busy), Some(1));

    sleep(&system, owner);
    let heir = system.heir(0).unwrap();
    assert!(system.is_idle_thread(heir));
    assert_eq!(system.node_state(owner), Ok(NodeState::Scheduled));
    assert_eq!(system.node_state(waiting), Ok(NodeState::Ready));
    assert_eq!(system.resource_owner(resource), Ok(Some(owner)));
    assert_consistent(&system);

    assert!(system.satisfy_wait(owner).unwrap());
    assert_eq!(system.heir(0), Some(owner));

    system.release_resource(resource, owner).unwrap();
    assert_eq!(system.help_state(owner), Ok(HelpState::Yourself));
    sleep(&system, owner);
    assert_eq!(system.heir(0), Some(waiting));
    assert_consistent(&system);
}

#[test]
fn test_blocking_waiter_receives_ownership() {
    let system = single(2, PolicyKind::PrioritySmp);
    let resource = system.create_resource(Priority(1)).unwrap();
    let owner = started(&system, 5);
    let waiter = started(&system, 6);
    system
        .obtain_resource(resource, owner, WaitMode::Block)
        .unwrap();
    assert_eq!(
        system.obtain_resource(resource, waiter, WaitMode::Block),
        Ok(ObtainStatus::Waiting)
    );
    assert_eq!(system.node_state(waiter), Ok(NodeState::Blocked));
    assert_eq!(system.help_state(waiter), Ok(HelpState::Passive));

    system.release_resource(resource, owner).unwrap();
    assert_eq!(system.resource_owner(resource), Ok(Some(waiter)));
    assert_eq!(system.node_state(waiter), Ok(NodeState::Scheduled));
    assert_eq!(system.help_state(waiter), Ok(HelpState::ActiveOwner));
    assert_eq!(system.effective_priority(waiter), Ok(Priority(1)));
    assert_eq!(system.effective_priority(owner), Ok(Priority(5)));
    assert_consistent(&system);
}

#[test]
fn test_rival_node_helps_preempted_owner() {
    let system = single(2, PolicyKind::PriorityAffinitySmp);
    let resource = system.create_resource(Priority(3)).unwrap();

    let owner = started(&system, 5);
    system
        .obtain_resource(resource, owner, WaitMode::Spin)
        .unwrap();
    let rival = started(&system, 6);
    assert_eq!(
        system.obtain_resource(resource, rival, WaitMode::Spin),
        Ok(ObtainStatus::Waiting)
    );
    assert_eq!(system.help_state(rival), Ok(HelpState::ActiveRival));
    assert_eq!(system.effective_priority(rival), Ok(Priority(3)));
    assert_eq!(heirs(&system), [Some(owner), Some(rival)]);
    assert_owner_not_inverted(&system, owner);

    let urgent = system.create_thread(SchedulerId(0), Priority(1)).unwrap();
    system.set_affinity(urgent, CpuSet::single(0)).unwrap();
    system.start_thread(urgent).unwrap();

    // The owner lost its processor and now runs on the rival's node.
    assert_eq!(heirs(&system), [Some(urgent), Some(owner)]);
    assert_eq!(system.node_state(owner), Ok(NodeState::Ready));
    assert!(system.pending_help_requests().is_empty());
    assert_owner_not_inverted(&system, owner);
    assert_consistent(&system);
    assert_eq!(
        system.delete_thread(rival),
        Err(SchedError::ResourceInUse)
    );

    system.block(urgent).unwrap();
    assert_eq!(heirs(&system), [Some(owner), Some(rival)]);
    assert_owner_not_inverted(&system, owner);
    assert_consistent(&system);

    system.release_resource(resource, owner).unwrap();
    assert_eq!(system.resource_owner(resource), Ok(Some(rival)));
    assert_eq!(system.help_state(rival), Ok(HelpState::ActiveOwner));
    assert_eq!(system.effective_priority(owner), Ok(Priority(5)));
    assert_owner_not_inverted(&system, rival);

    system.release_resource(resource, rival).unwrap();
    assert_eq!(system.help_state(rival), Ok(HelpState::Yourself));
    assert_eq!(system.effective_priority(rival), Ok(Priority(6)));
    assert_consistent(&system);
}

#[test]
fn test_owner_without_lendable_rival_is_pending() {
    let system = partitioned();
    let left = system.scheduler_by_name("left").unwrap();
    let right = system.scheduler_by_name("right").unwrap();
    let resource = system.create_resource(Priority(3)).unwrap();

    let owner = started_in(&system, left, 5);
    system
        .obtain_resource(resource, owner, WaitMode::Spin)
        .unwrap();
    let rival = started_in(&system, right, 6);
    system
        .obtain_resource(resource, rival, WaitMode::Spin)
        .unwrap();

    let urgent = started_in(&system, left, 1);
    assert_eq!(system.heir(0), Some(urgent));
    assert_eq!(system.heir(1), Some(rival));
    assert_eq!(system.pending_help_requests(), [owner]);

    system.block(urgent).unwrap();
    assert_eq!(system.heir(0), Some(owner));
    assert!(system.pending_help_requests().is_empty());
}

#[test]
fn test_resource_errors() {
    let system = single(2, PolicyKind::PrioritySmp);
    let first = system.create_resource(Priority(2)).unwrap();
    let second = system.create_resource(Priority(2)).unwrap();
    let owner = started(&system, 5);
    let other = started(&system, 6);

    system.obtain_resource(first, owner, WaitMode::Spin).unwrap();
    system.obtain_resource(second, owner, WaitMode::Spin).unwrap();
    assert!(system.obtain_resource(first, owner, WaitMode::Spin).is_err());
    assert_eq!(
        system.release_resource(first, other),
        Err(SchedError::NotOwner { resource: first })
    );

    system.obtain_resource(first, other, WaitMode::Spin).unwrap();
    assert_eq!(
        system.obtain_resource(second, other, WaitMode::Spin),
        Err(SchedError::AlreadyWaiting { thread: other })
    );
    assert_eq!(system.delete_thread(owner), Err(SchedError::ResourceInUse));
    assert_eq!(system.restart_thread(other), Err(SchedError::ResourceInUse));
    assert_eq!(
        system.create_resource(Priority(300)),
        Err(SchedError::InvalidPriority {
            priority: Priority(300)
        })
    );

    // Giving up one of two resources keeps the other ceiling.
    system.release_resource(second, owner).unwrap();
    assert_eq!(system.help_state(owner), Ok(HelpState::ActiveOwner));
    assert_eq!(system.effective_priority(owner), Ok(Priority(2)));
    assert_consistent(&system);
}

// ===== Wait Race =====

#[test]
fn test_completion_before_block() {
    let system = single(1, PolicyKind::Priority);
    let waiter = started(&system, 5);
    system
        .prepare_wait(waiter, WaitFlags::CLASS_EVENT)
        .unwrap();
    assert_eq!(
        system.prepare_wait(waiter, WaitFlags::CLASS_EVENT),
        Err(SchedError::AlreadyWaiting { thread: waiter })
    );
    assert_eq!(system.satisfy_wait(waiter), Ok(true));
    assert_eq!(system.commit_wait(waiter), Ok(false));
    assert_eq!(system.wait_status(waiter), Ok(Some(WaitStatus::Successful)));
    assert_eq!(system.heir(0), Some(waiter));
}

#[test]
fn test_timeout_after_block() {
    let system = single(1, PolicyKind::Priority);
    let waiter = started(&system, 5);
    sleep(&system, waiter);
    assert_eq!(system.heir(0), Some(ThreadId(0)));
    assert_eq!(system.timeout_wait(waiter), Ok(true));
    assert_eq!(system.satisfy_wait(waiter), Ok(false));
    assert_eq!(system.wait_status(waiter), Ok(Some(WaitStatus::Timeout)));
    assert_eq!(system.heir(0), Some(waiter));
}

#[test]
fn test_timeout_and_completion_race() {
    let system = single(2, PolicyKind::PrioritySmp);
    let waiter = started(&system, 5);
    let _peer = started(&system, 6);

    for round in 0..200 {
        system
            .prepare_wait(waiter, WaitFlags::CLASS_OBJECT)
            .unwrap();
        let (satisfied, timed_out) = thread::scope(|scope| {
            let commit = scope.spawn(|| system.commit_wait(waiter).unwrap());
            let satisfy = scope.spawn(|| system.satisfy_wait(waiter).unwrap());
            let timeout = scope.spawn(|| system.timeout_wait(waiter).unwrap());
            commit.join().unwrap();
            (satisfy.join().unwrap(), timeout.join().unwrap())
        });

        assert!(satisfied ^ timed_out, "round {}: both or neither", round);
        let expected = if satisfied {
            WaitStatus::Successful
        } else {
            WaitStatus::Timeout
        };
        assert_eq!(system.wait_status(waiter), Ok(Some(expected)));
        assert!(system.wait_flags(waiter).unwrap().state().is_empty());
        assert_eq!(system.node_state(waiter), Ok(NodeState::Scheduled));
        assert_consistent(&system);
    }
}

// ===== Lifecycle =====

#[test]
fn test_deleted_slot_is_reused() {
    let system = single(1, PolicyKind::Cbs);
    let thread = started(&system, 10);
    let server = system
        .cbs_create_server(CbsParameters::new(50, 5), None)
        .unwrap();
    system.cbs_attach_thread(server, thread).unwrap();

    system.delete_thread(thread).unwrap();
    assert_eq!(
        system.cbs_get_server_id(thread),
        Err(CbsError::InvalidParameter)
    );
    assert_eq!(
        system.start_thread(thread),
        Err(SchedError::ThreadNotFound { id: thread })
    );

    let again = system.create_thread(SchedulerId(0), Priority(20)).unwrap();
    assert_eq!(again, thread);
    assert_eq!(system.node_state(again), Ok(NodeState::Blocked));
    assert_eq!(system.cpu_time(again), Ok(0));
}

#[test]
fn test_set_scheduler_between_partitions() {
    let system = partitioned();
    let right = system.scheduler_by_name("right").unwrap();
    let thread = started(&system, 5);
    let stays = started(&system, 8);
    assert_eq!(system.heir(0), Some(thread));

    system.set_scheduler(thread, right, Priority(3)).unwrap();
    assert_eq!(system.scheduler_of(thread), Ok(right));
    assert_eq!(system.heir(0), Some(stays));
    assert_eq!(system.heir(1), Some(thread));
    assert_eq!(system.real_priority(thread), Ok(Priority(3)));
    assert_consistent(&system);
}

#[test]
fn test_block_and_unblock_race_with_set_scheduler() {
    let system = partitioned();
    let (left, right) = (SchedulerId(0), SchedulerId(1));
    let workers: Vec<ThreadId> = (0..3).map(|i| started_in(&system, left, 5 + i)).collect();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let (system, done) = (&system, &done);
        for &worker in &workers {
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    system.block(worker).unwrap();
                    system.unblock(worker).unwrap();
                }
            });
        }
        for round in 0..500 {
            let target = if round % 2 == 0 { right } else { left };
            for &worker in &workers {
                system.set_scheduler(worker, target, Priority(5)).unwrap();
            }
        }
        done.store(true, Ordering::Release);
    });

    for &worker in &workers {
        assert_eq!(system.is_thread_blocked(worker), Ok(false));
        assert_ne!(system.node_state(worker), Ok(NodeState::Blocked));
    }
    assert!(workers.iter().any(|&worker| system.cpu_of(worker).is_some()));
    assert_consistent(&system);
}

// ===== Processor handover and pinning =====

#[test]
fn test_smp_priority_drop_and_yield_among_equals() {
    let system = single(2, PolicyKind::PrioritySmp);
    let threads: Vec<ThreadId> = (0..4).map(|_| started(&system, 2)).collect();
    assert_eq!(heirs(&system), [Some(threads[0]), Some(threads[1])]);

    system.set_priority(threads[0], Priority(3)).unwrap();
    assert_eq!(heirs(&system), [Some(threads[2]), Some(threads[1])]);
    assert_consistent(&system);

    system.yield_thread(threads[1]).unwrap();
    assert_eq!(heirs(&system), [Some(threads[2]), Some(threads[3])]);
    system.yield_thread(threads[2]).unwrap();
    assert_eq!(heirs(&system), [Some(threads[1]), Some(threads[3])]);
    assert_eq!(system.node_state(threads[0]), Ok(NodeState::Ready));
    assert_consistent(&system);
}

#[test]
fn test_processor_moves_between_instances() {
    let config = SystemConfig::new(3)
        .with_scheduler(SchedulerConfig::new(
            "fixed",
            PolicyKind::PrioritySmp,
            CpuSet::first(2),
        ))
        .with_scheduler(SchedulerConfig::new(
            "deadline",
            PolicyKind::EdfSmp,
            CpuSet::single(2),
        ));
    let system = System::new(config).unwrap();
    let (fixed, deadline) = (SchedulerId(0), SchedulerId(1));
    let first = started_in(&system, fixed, 4);
    let second = started_in(&system, fixed, 5);
    let third = started_in(&system, fixed, 6);
    let background = started_in(&system, deadline, 10);
    assert_eq!(heirs(&system), [Some(first), Some(second), Some(background)]);

    assert_eq!(
        system.add_processor(deadline, 1),
        Err(SchedError::ProcessorInUse { cpu: 1 })
    );
    system.remove_processor(fixed, 1).unwrap();
    assert_eq!(system.heir(1), None);
    assert_eq!(system.node_state(second), Ok(NodeState::Ready));
    assert_eq!(
        system.remove_processor(fixed, 0),
        Err(SchedError::ProcessorInUse { cpu: 0 })
    );

    system.add_processor(deadline, 1).unwrap();
    assert!(system.is_idle_thread(system.heir(1).unwrap()));
    let late = started_in(&system, deadline, 10);
    assert_eq!(system.heir(1), Some(late));
    assert_consistent(&system);

    system.remove_processor(deadline, 2).unwrap();
    assert_eq!(system.node_state(background), Ok(NodeState::Ready));
    system.add_processor(fixed, 2).unwrap();
    assert_eq!(heirs(&system), [Some(first), Some(late), Some(second)]);
    assert_eq!(system.node_state(third), Ok(NodeState::Ready));
    assert_consistent(&system);
}

#[test]
fn test_pinned_thread_waits_for_its_processor() {
    let system = single(2, PolicyKind::PrioritySmp);
    let high = started(&system, 3);
    let low = started(&system, 6);
    assert_eq!(system.pin_thread(low), Ok(1));
    assert_eq!(system.pin_thread(low), Ok(1));

    let urgent = started(&system, 2);
    assert_eq!(heirs(&system), [Some(high), Some(urgent)]);
    system.block(urgent).unwrap();
    assert_eq!(system.heir(1), Some(low));
    system.block(high).unwrap();
    assert!(system.is_idle_thread(system.heir(0).unwrap()));
    assert_eq!(system.heir(1), Some(low));

    system.unpin_thread(low).unwrap();
    assert_eq!(system.pinned_cpu(low), Ok(Some(1)));
    system.unpin_thread(low).unwrap();
    assert_eq!(system.pinned_cpu(low), Ok(None));
    assert!(matches!(
        system.unpin_thread(low),
        Err(SchedError::InvalidState { .. })
    ));

    system.unblock(high).unwrap();
    system.unblock(urgent).unwrap();
    assert_eq!(system.node_state(low), Ok(NodeState::Ready));
    assert!(matches!(
        system.pin_thread(low),
        Err(SchedError::InvalidState { .. })
    ));
    assert_consistent(&system);
}

#[test]
fn test_edf_smp_jobs_preempt_background_threads() {
    let system = single(2, PolicyKind::EdfSmp);
    let first = started(&system, 5);
    let second = started(&system, 6);
    let third = started(&system, 7);
    assert_eq!(heirs(&system), [Some(first), Some(second)]);

    system.release_job(third, 100).unwrap();
    assert_eq!(heirs(&system), [Some(first), Some(third)]);
    system.release_job(second, 50).unwrap();
    assert_eq!(heirs(&system), [Some(second), Some(third)]);
    system.cancel_job(third).unwrap();
    assert_eq!(heirs(&system), [Some(second), Some(first)]);

    assert_eq!(
        system.set_affinity(third, CpuSet::empty()),
        Err(SchedError::InvalidAffinity)
    );
    system.set_affinity(first, CpuSet::single(1)).unwrap();
    assert_eq!(system.heir(1), Some(first));
    assert_consistent(&system);
}

