//! Property-based scheduler tests
//!
//! Random operation sequences against the ready queue, the priority bitmap,
//! whole scheduler systems and the resource helping protocol.

use std::collections::BTreeSet;

use proptest::prelude::*;
use rtsched_kernel::{
    sched::{
        priority::PriorityBitMap, queue::ReadyQueue, HelpState, ResourceId, WaitMode,
    },
    CpuSet, PolicyKind, Priority, System, ThreadId,
};

mod common;

use common::{assert_consistent, assert_owner_not_inverted, single, started};

const LEVELS: usize = 32;
const SLOTS: u32 = 16;

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue { thread: u32, level: usize, first: bool },
    Extract { thread: u32 },
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        (0..SLOTS, 0..LEVELS, any::<bool>())
            .prop_map(|(thread, level, first)| QueueOp::Enqueue { thread, level, first }),
        (0..SLOTS).prop_map(|thread| QueueOp::Extract { thread }),
    ]
}

#[derive(Debug, Clone)]
enum SystemOp {
    SetAffinity { thread: usize, mask: u64 },
    SetPriority { thread: usize, priority: u32 },
    Block { thread: usize },
    Unblock { thread: usize },
    Yield { thread: usize },
    Tick,
}

const THREADS: usize = 5;

fn system_op() -> impl Strategy<Value = SystemOp> {
    prop_oneof![
        (0..THREADS, 1u64..8).prop_map(|(thread, mask)| SystemOp::SetAffinity { thread, mask }),
        (0..THREADS, 1u32..20)
            .prop_map(|(thread, priority)| SystemOp::SetPriority { thread, priority }),
        (0..THREADS).prop_map(|thread| SystemOp::Block { thread }),
        (0..THREADS).prop_map(|thread| SystemOp::Unblock { thread }),
        (0..THREADS).prop_map(|thread| SystemOp::Yield { thread }),
        Just(SystemOp::Tick),
    ]
}

fn apply(system: &System, threads: &[ThreadId], op: &SystemOp) {
    match *op {
        SystemOp::SetAffinity { thread, mask } => system
            .set_affinity(threads[thread], CpuSet::from_mask(mask))
            .unwrap(),
        SystemOp::SetPriority { thread, priority } => {
            system
                .set_priority(threads[thread], Priority(priority))
                .unwrap();
        }
        SystemOp::Block { thread } => system.block(threads[thread]).unwrap(),
        SystemOp::Unblock { thread } => system.unblock(threads[thread]).unwrap(),
        SystemOp::Yield { thread } => system.yield_thread(threads[thread]).unwrap(),
        SystemOp::Tick => system.tick(),
    }
}

#[derive(Debug, Clone)]
enum HelpOp {
    Obtain { thread: usize, resource: usize, spin: bool },
    Release { thread: usize, resource: usize },
    Block { thread: usize },
    Unblock { thread: usize },
}

const CONTENDERS: usize = 4;
const RESOURCES: usize = 2;

fn help_op() -> impl Strategy<Value = HelpOp> {
    prop_oneof![
        (0..CONTENDERS, 0..RESOURCES, any::<bool>()).prop_map(|(thread, resource, spin)| {
            HelpOp::Obtain {
                thread,
                resource,
                spin,
            }
        }),
        (0..CONTENDERS, 0..RESOURCES)
            .prop_map(|(thread, resource)| HelpOp::Release { thread, resource }),
        (0..CONTENDERS).prop_map(|thread| HelpOp::Block { thread }),
        (0..CONTENDERS).prop_map(|thread| HelpOp::Unblock { thread }),
    ]
}

fn apply_help(system: &System, threads: &[ThreadId], resources: &[ResourceId], op: &HelpOp) {
    match *op {
        HelpOp::Obtain {
            thread,
            resource,
            spin,
        } => {
            // Threads hold or await at most one resource
            if system.help_state(threads[thread]).unwrap() != HelpState::Yourself {
                return;
            }
            let mode = if spin { WaitMode::Spin } else { WaitMode::Block };
            let _ = system.obtain_resource(resources[resource], threads[thread], mode);
        }
        HelpOp::Release { thread, resource } => {
            let _ = system.release_resource(resources[resource], threads[thread]);
        }
        HelpOp::Block { thread } => system.block(threads[thread]).unwrap(),
        HelpOp::Unblock { thread } => {
            // Blocked waiters wake up when ownership passes to them
            if system.help_state(threads[thread]).unwrap() != HelpState::Passive {
                system.unblock(threads[thread]).unwrap();
            }
        }
    }
}

/// Real priorities of the non-idle heirs, sorted
fn heir_priorities(system: &System) -> Vec<u32> {
    let mut priorities: Vec<u32> = (0..system.cpu_count())
        .filter_map(|cpu| system.heir(cpu))
        .filter(|&thread| !system.is_idle_thread(thread))
        .map(|thread| system.real_priority(thread).unwrap().value())
        .collect();
    priorities.sort_unstable();
    priorities
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_bitmap_tracks_chains(ops in prop::collection::vec(queue_op(), 1..200)) {
        let mut queue = ReadyQueue::new(LEVELS, SLOTS as usize);
        let mut model: Vec<Vec<u32>> = vec![Vec::new(); LEVELS];

        for op in ops {
            match op {
                QueueOp::Enqueue { thread, level, first } => {
                    if queue.contains(ThreadId(thread)) {
                        continue;
                    }
                    if first {
                        queue.enqueue_first(ThreadId(thread), level);
                        model[level].insert(0, thread);
                    } else {
                        queue.enqueue(ThreadId(thread), level);
                        model[level].push(thread);
                    }
                }
                QueueOp::Extract { thread } => {
                    if !queue.contains(ThreadId(thread)) {
                        continue;
                    }
                    prop_assert!(queue.extract(ThreadId(thread)));
                    for chain in model.iter_mut() {
                        chain.retain(|&queued| queued != thread);
                    }
                }
            }

            prop_assert!(queue.is_consistent());
            for (level, chain) in model.iter().enumerate() {
                let actual: Vec<u32> = queue.level(level).iter().map(|t| t.0).collect();
                prop_assert_eq!(&actual, chain);
            }
            let expected = model.iter().find_map(|chain| chain.first().copied());
            prop_assert_eq!(queue.first().map(|t| t.0), expected);
        }
    }

    #[test]
    fn prop_bitmap_highest_level(levels in prop::collection::btree_set(0usize..256, 0..40)) {
        let mut bitmap = PriorityBitMap::new();
        for &level in &levels {
            bitmap.add(level);
        }
        let mut remaining: BTreeSet<usize> = levels.clone();
        for &level in &levels {
            prop_assert!(bitmap.contains(level));
            prop_assert_eq!(bitmap.highest(), remaining.first().copied());
            prop_assert_eq!(
                bitmap.next_after(level),
                remaining.range(level + 1..).next().copied()
            );
            bitmap.remove(level);
            remaining.remove(&level);
        }
        prop_assert!(bitmap.is_empty());
    }

    #[test]
    fn prop_uniprocessor_heir_is_most_urgent(
        priorities in prop::collection::vec(0u32..64, 1..12),
        policy in prop_oneof![
            Just(PolicyKind::Simple),
            Just(PolicyKind::Priority),
            Just(PolicyKind::Edf),
        ],
    ) {
        let system = single(1, policy);
        let mut best: Option<(u32, ThreadId)> = None;
        for &priority in &priorities {
            let thread = started(&system, priority);
            if best.map_or(true, |(current, _)| priority < current) {
                best = Some((priority, thread));
            }
            prop_assert_eq!(system.heir(0), best.map(|(_, t)| t));
        }
    }

    #[test]
    fn prop_smp_heirs_are_most_urgent(
        priorities in prop::collection::vec(0u32..64, 1..12),
        cpus in 1usize..4,
    ) {
        let system = single(cpus, PolicyKind::PrioritySmp);
        let mut started_priorities = Vec::new();
        for &priority in &priorities {
            started(&system, priority);
            started_priorities.push(priority);
            started_priorities.sort_unstable();

            let expected: Vec<u32> = started_priorities.iter().take(cpus).copied().collect();
            prop_assert_eq!(heir_priorities(&system), expected);
        }
        assert_consistent(&system);
    }

    #[test]
    fn prop_affinity_containment(
        initial in prop::collection::vec((1u32..20, 1u64..8), THREADS),
        ops in prop::collection::vec(system_op(), 1..60),
    ) {
        let system = single(3, PolicyKind::PriorityAffinitySmp);
        let threads: Vec<ThreadId> = initial
            .iter()
            .map(|&(priority, mask)| {
                let thread = started(&system, priority);
                system.set_affinity(thread, CpuSet::from_mask(mask)).unwrap();
                thread
            })
            .collect();

        for op in &ops {
            apply(&system, &threads, op);
            for &thread in &threads {
                if let Some(cpu) = system.cpu_of(thread) {
                    let affinity = system.affinity(thread).unwrap();
                    prop_assert!(
                        affinity.contains(cpu),
                        "{} on cpu {} outside {:?} after {:?}",
                        thread,
                        cpu,
                        affinity,
                        op
                    );
                }
            }
            assert_consistent(&system);
        }
    }

    #[test]
    fn prop_helping_keeps_owners_running(
        priorities in prop::collection::vec(3u32..12, CONTENDERS),
        ops in prop::collection::vec(help_op(), 1..80),
    ) {
        let system = single(2, PolicyKind::PrioritySmp);
        let threads: Vec<ThreadId> = priorities
            .iter()
            .map(|&priority| started(&system, priority))
            .collect();
        let resources = [
            system.create_resource(Priority(1)).unwrap(),
            system.create_resource(Priority(2)).unwrap(),
        ];

        for op in &ops {
            apply_help(&system, &threads, &resources, op);
            for &resource in &resources {
                if let Some(owner) = system.resource_owner(resource).unwrap() {
                    assert_owner_not_inverted(&system, owner);
                }
            }
            assert_consistent(&system);
        }
    }
}
