//! The scheduler system
//!
//! `System` owns every scheduler instance, the thread table, the per-CPU
//! dispatch state, the CBS servers and the helping resources. All entry
//! points take `&self`; state is protected by per-instance locks, so
//! instances owning disjoint processors never contend.
//!
//! Lock order: resource table, then scheduler instances (one at a time),
//! then leaf locks (thread control blocks, parked idle threads, per-CPU
//! atomics). The CBS table lock is never held together with a scheduler
//! lock.
//!
//! A thread's instance and its blocked flag only change while the lock of
//! the instance the thread belongs to is held; operations on a thread go
//! through [`System::with_thread_policy`], which re-checks the instance
//! under its lock.
//!
//! After every operation the heirs chosen by the affected instance are
//! published to the per-CPU state, and outstanding help requests are
//! processed.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    config::{SchedulerConfig, SystemConfig},
    error::{CbsError, CbsResult, KernelResult, SchedError, SchedResult},
    sched::{
        cbs::{CbsEvent, CbsParameters, CbsTable, ExecutionTime, OverrunHandler},
        cpu::{CpuTable, PerCpu},
        node::{CpuBudget, IdleThread, NodeState, NodeUser},
        policy::{PolicyKind, SchedulerPolicy},
        priority::{NodePriority, Priority, PriorityMap, MAX_PRIORITY},
        resource::{Lend, ObtainStatus, ResourceTable, WaitMode},
        smp::{EdfSmpScheduler, PriorityAffinitySmpScheduler, PrioritySmpScheduler},
        thread::{
            ThreadControl, ThreadLifecycle, ThreadSlot, ThreadTable, WaitFlags, WaitOutcome,
            WaitStatus,
        },
        uniprocessor::{EdfScheduler, PriorityScheduler, SimpleScheduler},
        CpuSet, HelpState, ResourceId, SchedulerId, ServerId, ThreadId,
    },
};

/// A configured scheduler instance and its lock
pub struct SchedulerInstance {
    id: SchedulerId,
    name: &'static str,
    kind: PolicyKind,
    /// Mask of owned processors, updated under the instance lock
    processors: AtomicU64,
    map: PriorityMap,
    policy: Mutex<Box<dyn SchedulerPolicy>>,
}

impl SchedulerInstance {
    fn new(id: SchedulerId, config: &SchedulerConfig, capacity: usize) -> Self {
        let map = PriorityMap::new(config.max_priority);
        let cpu = config.processors.lowest().unwrap_or(0);
        let policy: Box<dyn SchedulerPolicy> = match config.policy {
            PolicyKind::Simple => Box::new(SimpleScheduler::new(config.policy, cpu, map, capacity)),
            PolicyKind::Priority => {
                Box::new(PriorityScheduler::new(config.policy, cpu, map, capacity))
            }
            PolicyKind::Edf | PolicyKind::Cbs => {
                Box::new(EdfScheduler::new(config.policy, cpu, map, capacity))
            }
            PolicyKind::PrioritySmp => {
                Box::new(PrioritySmpScheduler::new(config.processors, map, capacity))
            }
            PolicyKind::PriorityAffinitySmp => {
                Box::new(PriorityAffinitySmpScheduler::new(config.processors, map, capacity))
            }
            PolicyKind::EdfSmp => Box::new(EdfSmpScheduler::new(config.processors, map, capacity)),
        };
        Self {
            id,
            name: config.name,
            kind: config.policy,
            processors: AtomicU64::new(config.processors.mask()),
            map,
            policy: Mutex::new(policy),
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Processors owned right now
    pub fn processors(&self) -> CpuSet {
        CpuSet::from_mask(self.processors.load(Ordering::Acquire))
    }

    pub fn priority_map(&self) -> PriorityMap {
        self.map
    }
}

/// Node priority of a thread with an optional released job
fn node_priority(
    policy: &dyn SchedulerPolicy,
    job_deadline: Option<u64>,
    effective: Priority,
) -> SchedResult<NodePriority> {
    match job_deadline {
        Some(deadline) => policy.release_job(deadline),
        None => policy.map_priority(effective),
    }
}

/// Requeue `control`'s thread at the priority derived from its real
/// priority, ceilings and released job.
fn apply_priority(
    policy: &mut dyn SchedulerPolicy,
    slot: &ThreadSlot,
    control: &ThreadControl,
    prepend: bool,
) -> SchedResult<()> {
    let mut priority = node_priority(policy, control.job_deadline, control.effective_priority())?;
    slot.priority.write(priority);
    priority.prepend_it = prepend;
    policy.update_priority(control.id, priority);
    Ok(())
}

fn log_failure(context: &str, result: SchedResult<()>) {
    if let Err(err) = result {
        log::error!("{}: {}", context, err);
    }
}

pub struct System {
    config: SystemConfig,
    schedulers: Vec<SchedulerInstance>,
    threads: ThreadTable,
    cpus: CpuTable,
    cbs: Mutex<CbsTable>,
    resources: Mutex<ResourceTable>,
    /// Idle threads of processors no instance owns, indexed by processor
    parked: Mutex<Vec<Option<IdleThread>>>,
    /// Ticks since start
    now: AtomicU64,
}

impl System {
    /// Validate `config`, build the scheduler instances and hand each
    /// processor its idle thread.
    pub fn new(config: SystemConfig) -> KernelResult<Self> {
        config.validate()?;
        let capacity = config.thread_capacity();

        let schedulers: Vec<SchedulerInstance> = config
            .schedulers
            .iter()
            .enumerate()
            .map(|(index, sched)| SchedulerInstance::new(SchedulerId(index), sched, capacity))
            .collect();
        let owners: Vec<Option<SchedulerId>> = (0..config.cpu_count)
            .map(|cpu| {
                schedulers
                    .iter()
                    .find(|instance| instance.processors().contains(cpu))
                    .map(|instance| instance.id)
            })
            .collect();

        let system = Self {
            cpus: CpuTable::new(&owners),
            threads: ThreadTable::new(capacity),
            cbs: Mutex::new(CbsTable::new(config.max_cbs_servers)),
            resources: Mutex::new(ResourceTable::new()),
            parked: Mutex::new((0..config.cpu_count).map(|_| None).collect()),
            now: AtomicU64::new(0),
            schedulers,
            config,
        };
        for (cpu, owner) in owners.iter().enumerate() {
            system.start_idle(cpu, *owner);
        }

        log::info!(
            "scheduler system started: {} processors, {} instances, {} thread slots",
            system.config.cpu_count,
            system.schedulers.len(),
            capacity
        );
        Ok(system)
    }

    fn start_idle(&self, cpu: usize, owner: Option<SchedulerId>) {
        let instance = owner.and_then(|id| self.schedulers.get(id.0));
        let priority = instance.map_or(Priority(MAX_PRIORITY), |i| i.map.max());
        let affinity = instance.map_or(CpuSet::single(cpu), SchedulerInstance::processors);
        let thread = self.threads.allocate(|control| {
            control.lifecycle = ThreadLifecycle::Active;
            control.is_idle = true;
            control.scheduler = owner.unwrap_or(SchedulerId(0));
            control.initial_priority = priority;
            control.real_priority = priority;
            control.affinity = affinity;
            control.blocked = false;
        });

        let Some(thread) = thread else {
            return;
        };
        let Some(instance) = instance else {
            self.park(cpu, IdleThread::new(thread));
            return;
        };
        let mut policy = instance.policy.lock();
        if policy.start_idle(cpu, IdleThread::new(thread)).is_err() {
            log::error!("cpu {}: {} refused idle thread {}", cpu, instance.name, thread);
        }
        self.publish(instance, &**policy);
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    pub fn scheduler(&self, id: SchedulerId) -> SchedResult<&SchedulerInstance> {
        self.schedulers
            .get(id.0)
            .ok_or(SchedError::SchedulerNotFound { id })
    }

    pub fn scheduler_by_name(&self, name: &str) -> Option<SchedulerId> {
        self.schedulers
            .iter()
            .find(|instance| instance.name == name)
            .map(|instance| instance.id)
    }

    pub fn schedulers(&self) -> impl Iterator<Item = &SchedulerInstance> {
        self.schedulers.iter()
    }

    /// Idle threads occupy the first thread slots, one per processor.
    pub fn is_idle_thread(&self, thread: ThreadId) -> bool {
        thread.index() < self.config.cpu_count
    }

    fn slot(&self, thread: ThreadId) -> SchedResult<&ThreadSlot> {
        self.threads
            .get(thread)
            .filter(|slot| slot.control.lock().is_usable())
            .ok_or(SchedError::ThreadNotFound { id: thread })
    }

    /// Slot of an application thread
    fn user_slot(&self, thread: ThreadId) -> SchedResult<&ThreadSlot> {
        if self.is_idle_thread(thread) {
            log::warn!("operation on idle thread {} rejected", thread);
            return Err(SchedError::IdleThread { id: thread });
        }
        self.slot(thread)
    }

    fn active_slot(&self, thread: ThreadId) -> SchedResult<&ThreadSlot> {
        let slot = self.user_slot(thread)?;
        let lifecycle = slot.control.lock().lifecycle;
        if lifecycle != ThreadLifecycle::Active {
            return Err(SchedError::InvalidState {
                expected: "active",
                actual: lifecycle.name(),
            });
        }
        Ok(slot)
    }

    pub fn scheduler_of(&self, thread: ThreadId) -> SchedResult<SchedulerId> {
        Ok(self.slot(thread)?.control.lock().scheduler)
    }

    /// Run `f` under the instance lock and publish the resulting heirs.
    fn with_policy<R, F>(&self, id: SchedulerId, f: F) -> SchedResult<R>
    where
        F: FnOnce(&mut dyn SchedulerPolicy) -> R,
    {
        let instance = self.scheduler(id)?;
        let mut policy = instance.policy.lock();
        let result = f(&mut **policy);
        self.publish(instance, &**policy);
        Ok(result)
    }

    /// Run `f` under the lock of the instance `slot`'s thread belongs to,
    /// with the thread control locked, and publish the resulting heirs.
    /// Starts over when the thread moved to another instance before the
    /// lock was taken.
    fn with_thread_policy<R, F>(&self, slot: &ThreadSlot, f: F) -> SchedResult<R>
    where
        F: FnOnce(&mut dyn SchedulerPolicy, &mut ThreadControl) -> R,
    {
        loop {
            let scheduler = slot.control.lock().scheduler;
            let instance = self.scheduler(scheduler)?;
            let mut policy = instance.policy.lock();
            let mut control = slot.control.lock();
            if control.scheduler != scheduler {
                log::trace!("thread {} moved away from {}, retrying", control.id, instance.name);
                continue;
            }
            let result = f(&mut **policy, &mut *control);
            drop(control);
            self.publish(instance, &**policy);
            return Ok(result);
        }
    }

    /// Read-only access to an instance
    fn inspect<R, F>(&self, id: SchedulerId, f: F) -> SchedResult<R>
    where
        F: FnOnce(&dyn SchedulerPolicy) -> R,
    {
        let instance = self.scheduler(id)?;
        let policy = instance.policy.lock();
        Ok(f(&**policy))
    }

    fn publish(&self, instance: &SchedulerInstance, policy: &dyn SchedulerPolicy) {
        for cpu in policy.processors().iter() {
            let Some(per_cpu) = self.cpus.get(cpu) else {
                continue;
            };
            let heir = policy.heir(cpu);
            if per_cpu.set_heir(heir) {
                log::trace!("{} cpu {}: heir {:?}", instance.name, cpu, heir);
            }
        }
    }

    /// Recompute the node priority of `thread` from its real priority,
    /// ceilings and released job.
    fn refresh_priority(&self, thread: ThreadId, prepend: bool) -> SchedResult<()> {
        let slot = self.slot(thread)?;
        self.with_thread_policy(slot, |policy, control| {
            apply_priority(policy, slot, control, prepend)
        })?
    }

    fn park(&self, cpu: usize, idle: IdleThread) {
        match self.parked.lock().get_mut(cpu) {
            Some(place) => *place = Some(idle),
            None => log::error!("cpu {}: nowhere to park idle thread {}", cpu, idle.id()),
        }
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Create a dormant thread in `scheduler`.
    pub fn create_thread(&self, scheduler: SchedulerId, priority: Priority) -> SchedResult<ThreadId> {
        let instance = self.scheduler(scheduler)?;
        if !instance.map.is_valid(priority) {
            log::warn!("priority {} outside the range of {}", priority, instance.name);
            return Err(SchedError::InvalidPriority { priority });
        }
        let thread = self
            .threads
            .allocate(|control| {
                control.lifecycle = ThreadLifecycle::Dormant;
                control.scheduler = scheduler;
                control.initial_priority = priority;
                control.real_priority = priority;
            })
            .ok_or(SchedError::TooManyThreads {
                max: self.config.max_threads,
            })?;
        let slot = self.slot(thread)?;

        let ticks = self.config.ticks_per_timeslice;
        let result = self.with_policy(scheduler, |policy| -> SchedResult<()> {
            let node_priority = policy.map_priority(priority)?;
            slot.priority.write(node_priority);
            policy.node_initialize(thread, node_priority, CpuSet::all())?;
            policy.set_cpu_budget(thread, CpuBudget::None, ticks);
            Ok(())
        })?;
        if let Err(err) = result {
            slot.control.lock().reset();
            return Err(err);
        }

        log::debug!(
            "thread {} created in {} at priority {}",
            thread,
            instance.name,
            priority
        );
        Ok(thread)
    }

    /// Make a dormant thread ready.
    pub fn start_thread(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        self.with_thread_policy(slot, |policy, control| {
            if control.lifecycle != ThreadLifecycle::Dormant {
                return Err(SchedError::InvalidState {
                    expected: "dormant",
                    actual: control.lifecycle.name(),
                });
            }
            control.lifecycle = ThreadLifecycle::Active;
            control.blocked = false;
            policy.unblock(thread);
            Ok(())
        })??;
        log::debug!("thread {} started", thread);
        self.process_help();
        Ok(())
    }

    /// Delete a thread that neither owns nor waits for a resource.
    pub fn delete_thread(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let mut resources = self.resources.lock();
        if resources.involves(thread) || resources.is_lending(thread) {
            log::warn!("thread {} cannot be deleted while using resources", thread);
            return Err(SchedError::ResourceInUse);
        }
        self.detach_from_server(thread);

        self.with_thread_policy(slot, |policy, _| {
            slot.wait.set(WaitFlags::READY);
            policy.node_destroy(thread);
        })?;
        slot.priority.write(NodePriority::default());
        slot.control.lock().reset();

        log::debug!("thread {} deleted", thread);
        self.reconcile_help(&mut resources);
        Ok(())
    }

    /// Cancel any pending wait, restore the initial priority and make the
    /// thread ready.
    pub fn restart_thread(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let mut resources = self.resources.lock();
        if resources.involves(thread) || resources.is_lending(thread) {
            log::warn!("thread {} cannot be restarted while using resources", thread);
            return Err(SchedError::ResourceInUse);
        }
        self.detach_from_server(thread);

        let ticks = self.config.ticks_per_timeslice;
        self.with_thread_policy(slot, |policy, control| -> SchedResult<()> {
            control.lifecycle = ThreadLifecycle::Active;
            control.real_priority = control.initial_priority;
            control.ceilings.clear();
            control.job_deadline = None;
            control.wait_status = None;
            control.blocked = false;
            slot.wait.set(WaitFlags::READY);
            let priority = policy.map_priority(control.initial_priority)?;
            slot.priority.write(priority);
            policy.update_priority(thread, priority);
            policy.set_cpu_budget(thread, control.budget, ticks);
            policy.unblock(thread);
            Ok(())
        })??;

        log::debug!("thread {} restarted", thread);
        self.reconcile_help(&mut resources);
        Ok(())
    }

    /// Move a thread to another scheduler instance.
    pub fn set_scheduler(
        &self,
        thread: ThreadId,
        scheduler: SchedulerId,
        priority: Priority,
    ) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let target = self.scheduler(scheduler)?;
        if !target.map.is_valid(priority) {
            return Err(SchedError::InvalidPriority { priority });
        }

        let mut resources = self.resources.lock();
        if resources.involves(thread) || resources.is_lending(thread) {
            log::warn!("thread {} cannot change scheduler while using resources", thread);
            return Err(SchedError::ResourceInUse);
        }

        let current = slot.control.lock().scheduler;
        if current == scheduler {
            self.with_thread_policy(slot, |policy, control| {
                control.real_priority = priority;
                apply_priority(policy, slot, control, false)
            })??;
            self.reconcile_help(&mut resources);
            return Ok(());
        }

        let movable = |control: &ThreadControl| -> SchedResult<()> {
            if control.pinned_cpu.is_some() {
                return Err(SchedError::InvalidState {
                    expected: "unpinned",
                    actual: "pinned",
                });
            }
            target.kind.check_affinity(target.processors(), control.affinity)
        };
        movable(&*slot.control.lock())?;

        self.detach_from_server(thread);
        self.with_thread_policy(slot, |policy, control| -> SchedResult<()> {
            movable(&*control)?;
            policy.node_destroy(thread);
            control.scheduler = scheduler;
            control.real_priority = priority;
            control.job_deadline = None;
            Ok(())
        })??;

        // Blocked state, budget and preemption mode are read under the
        // target lock; a block or unblock racing with the move lands there.
        let ticks = self.config.ticks_per_timeslice;
        self.with_thread_policy(slot, |policy, control| -> SchedResult<()> {
            let node_priority = policy.map_priority(control.real_priority)?;
            slot.priority.write(node_priority);
            policy.node_initialize(thread, node_priority, control.affinity)?;
            policy.set_cpu_budget(thread, control.budget, ticks);
            policy.set_preemptible(thread, control.preemptible);
            if control.lifecycle == ThreadLifecycle::Active && !control.blocked {
                policy.unblock(thread);
            }
            Ok(())
        })??;

        log::debug!("thread {} moved to {}", thread, target.name);
        self.reconcile_help(&mut resources);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling operations
    // ------------------------------------------------------------------

    pub fn block(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.active_slot(thread)?;
        let changed = self.with_thread_policy(slot, |policy, control| {
            if control.blocked {
                return false;
            }
            control.blocked = true;
            policy.block(thread);
            true
        })?;
        if changed {
            self.process_help();
        }
        Ok(())
    }

    pub fn unblock(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.active_slot(thread)?;
        let changed = self.with_thread_policy(slot, |policy, control| {
            if !control.blocked {
                return false;
            }
            control.blocked = false;
            policy.unblock(thread);
            true
        })?;
        if changed {
            self.process_help();
        }
        Ok(())
    }

    /// Thread is blocked by an explicit block or a committed wait
    pub fn is_thread_blocked(&self, thread: ThreadId) -> SchedResult<bool> {
        Ok(self.slot(thread)?.control.lock().blocked)
    }

    pub fn yield_thread(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.active_slot(thread)?;
        self.with_thread_policy(slot, |policy, _| policy.yield_thread(thread))?;
        self.process_help();
        Ok(())
    }

    /// Change the real priority; returns the previous one.
    pub fn set_priority(&self, thread: ThreadId, priority: Priority) -> SchedResult<Priority> {
        let slot = self.user_slot(thread)?;
        let previous = self.with_thread_policy(slot, |policy, control| -> SchedResult<Priority> {
            if !policy.priority_map().is_valid(priority) {
                log::warn!("thread {}: priority {} out of range", thread, priority);
                return Err(SchedError::InvalidPriority { priority });
            }
            let previous = core::mem::replace(&mut control.real_priority, priority);
            apply_priority(policy, slot, control, false)?;
            Ok(previous)
        })??;
        self.process_help();
        Ok(previous)
    }

    pub fn real_priority(&self, thread: ThreadId) -> SchedResult<Priority> {
        Ok(self.slot(thread)?.control.lock().real_priority)
    }

    /// Real priority raised by resource ceilings
    pub fn effective_priority(&self, thread: ThreadId) -> SchedResult<Priority> {
        Ok(self.slot(thread)?.control.lock().effective_priority())
    }

    /// Node priority as published to the scheduler, read without locking
    pub fn current_priority(&self, thread: ThreadId) -> SchedResult<NodePriority> {
        let slot = self
            .threads
            .get(thread)
            .ok_or(SchedError::ThreadNotFound { id: thread })?;
        Ok(slot.priority.read())
    }

    pub fn set_affinity(&self, thread: ThreadId, affinity: CpuSet) -> SchedResult<()> {
        if affinity.is_empty() {
            return Err(SchedError::InvalidAffinity);
        }
        let slot = self.user_slot(thread)?;
        self.with_thread_policy(slot, |policy, control| -> SchedResult<()> {
            policy.set_affinity(thread, affinity)?;
            control.affinity = affinity;
            Ok(())
        })??;
        log::debug!("thread {} affinity {:?}", thread, affinity);
        self.process_help();
        Ok(())
    }

    pub fn affinity(&self, thread: ThreadId) -> SchedResult<CpuSet> {
        Ok(self.slot(thread)?.control.lock().affinity)
    }

    pub fn set_preemptible(&self, thread: ThreadId, preemptible: bool) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        self.with_thread_policy(slot, |policy, control| {
            control.preemptible = preemptible;
            policy.set_preemptible(thread, preemptible);
        })?;
        self.process_help();
        Ok(())
    }

    pub fn set_cpu_budget(&self, thread: ThreadId, budget: CpuBudget) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let ticks = self.config.ticks_per_timeslice;
        self.with_thread_policy(slot, |policy, control| {
            control.budget = budget;
            policy.set_cpu_budget(thread, budget, ticks);
        })?;
        Ok(())
    }

    /// Release an EDF job due `relative_deadline` ticks from now.
    pub fn release_job(&self, thread: ThreadId, relative_deadline: u64) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let deadline = self.now().saturating_add(relative_deadline);
        self.with_thread_policy(slot, |policy, control| {
            if !policy.kind().is_edf() {
                return Err(SchedError::NotSupported {
                    operation: "release_job",
                });
            }
            control.job_deadline = Some(deadline);
            apply_priority(policy, slot, control, false)
        })??;
        self.process_help();
        Ok(())
    }

    /// Drop the released job; the thread falls back to its background
    /// priority.
    pub fn cancel_job(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        self.with_thread_policy(slot, |policy, control| {
            if !policy.kind().is_edf() {
                return Err(SchedError::NotSupported {
                    operation: "cancel_job",
                });
            }
            control.job_deadline = None;
            apply_priority(policy, slot, control, false)
        })??;
        self.process_help();
        Ok(())
    }

    /// Account one clock tick: CPU time, CBS budgets and timeslices.
    pub fn tick(&self) {
        let now = self.now.fetch_add(1, Ordering::AcqRel) + 1;

        let mut running: Vec<ThreadId> = Vec::with_capacity(self.cpus.len());
        for per_cpu in self.cpus.iter() {
            let Some(thread) = per_cpu.heir() else {
                continue;
            };
            if self.is_idle_thread(thread) {
                continue;
            }
            if let Some(slot) = self.threads.get(thread) {
                slot.control.lock().cpu_time += 1;
            }
            running.push(thread);
        }

        let events = self.cbs.lock().tick(now, |thread| running.contains(&thread));
        let mut handlers: Vec<(ServerId, OverrunHandler)> = Vec::new();
        for event in events {
            match event {
                CbsEvent::Overrun {
                    server,
                    threads,
                    handler,
                } => {
                    for thread in threads {
                        self.set_job(thread, None);
                    }
                    if let Some(handler) = handler {
                        handlers.push((server, handler));
                    }
                }
                CbsEvent::Replenished {
                    threads, deadline, ..
                } => {
                    for thread in threads {
                        self.set_job(thread, Some(deadline));
                    }
                }
            }
        }

        let ticks = self.config.ticks_per_timeslice;
        for instance in &self.schedulers {
            let mut policy = instance.policy.lock();
            for cpu in policy.processors().iter() {
                policy.tick(cpu, ticks);
            }
            self.publish(instance, &**policy);
        }

        self.process_help();
        for (server, handler) in handlers {
            handler(server);
        }
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    pub fn ticks_to_microseconds(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.config.microseconds_per_tick)
    }

    /// Ticks a thread has spent as a processor heir
    pub fn cpu_time(&self, thread: ThreadId) -> SchedResult<u64> {
        Ok(self.slot(thread)?.control.lock().cpu_time)
    }

    // ------------------------------------------------------------------
    // Thread wait flags
    // ------------------------------------------------------------------

    /// Announce that `thread` is about to wait for an event of `class`.
    pub fn prepare_wait(&self, thread: ThreadId, class: WaitFlags) -> SchedResult<()> {
        let slot = self.active_slot(thread)?;
        if slot.wait.is_waiting() {
            return Err(SchedError::AlreadyWaiting { thread });
        }
        slot.control.lock().wait_status = None;
        slot.wait.prepare(class);
        Ok(())
    }

    /// Block for the prepared wait. Returns false if the wait was satisfied
    /// or timed out in the meantime.
    pub fn commit_wait(&self, thread: ThreadId) -> SchedResult<bool> {
        let slot = self.active_slot(thread)?;
        let blocked = self.with_thread_policy(slot, |policy, control| {
            if !slot.wait.commit() {
                return false;
            }
            control.blocked = true;
            policy.block(thread);
            true
        })?;
        if blocked {
            self.process_help();
        }
        Ok(blocked)
    }

    pub fn block_on(&self, thread: ThreadId, class: WaitFlags) -> SchedResult<bool> {
        self.prepare_wait(thread, class)?;
        self.commit_wait(thread)
    }

    /// Complete the wait successfully. Returns false if the wait already
    /// ended.
    pub fn satisfy_wait(&self, thread: ThreadId) -> SchedResult<bool> {
        self.complete_wait(thread, WaitStatus::Successful)
    }

    /// Complete the wait with a timeout. Returns false if the wait already
    /// ended.
    pub fn timeout_wait(&self, thread: ThreadId) -> SchedResult<bool> {
        self.complete_wait(thread, WaitStatus::Timeout)
    }

    fn complete_wait(&self, thread: ThreadId, status: WaitStatus) -> SchedResult<bool> {
        let slot = self.active_slot(thread)?;
        let outcome = self.with_thread_policy(slot, |policy, control| {
            let outcome = slot.wait.complete();
            if outcome != WaitOutcome::Lost {
                control.wait_status = Some(status);
                if outcome == WaitOutcome::Unblock {
                    control.blocked = false;
                    policy.unblock(thread);
                }
            }
            outcome
        })?;
        if outcome == WaitOutcome::Unblock {
            self.process_help();
        }
        Ok(outcome != WaitOutcome::Lost)
    }

    /// How the last wait ended
    pub fn wait_status(&self, thread: ThreadId) -> SchedResult<Option<WaitStatus>> {
        Ok(self.slot(thread)?.control.lock().wait_status)
    }

    pub fn wait_flags(&self, thread: ThreadId) -> SchedResult<WaitFlags> {
        Ok(self.slot(thread)?.wait.get())
    }

    // ------------------------------------------------------------------
    // Constant bandwidth servers
    // ------------------------------------------------------------------

    pub fn cbs_create_server(
        &self,
        params: CbsParameters,
        overrun: Option<OverrunHandler>,
    ) -> CbsResult<ServerId> {
        self.cbs.lock().create(params, overrun)
    }

    /// Destroy a server; its threads lose their job deadline.
    pub fn cbs_destroy_server(&self, server: ServerId) -> CbsResult<()> {
        let threads = self.cbs.lock().destroy(server)?;
        for thread in threads {
            self.set_job(thread, None);
        }
        self.process_help();
        Ok(())
    }

    /// Attach a thread of a CBS scheduler to `server`.
    pub fn cbs_attach_thread(&self, server: ServerId, thread: ThreadId) -> CbsResult<()> {
        let slot = self
            .user_slot(thread)
            .map_err(|_| CbsError::InvalidParameter)?;
        let scheduler = slot.control.lock().scheduler;
        let kind = self
            .scheduler(scheduler)
            .map_err(|_| CbsError::InvalidParameter)?
            .kind;
        if kind != PolicyKind::Cbs {
            log::warn!("thread {} is not in a CBS scheduler", thread);
            return Err(CbsError::InvalidParameter);
        }
        let deadline = self.cbs.lock().attach(server, thread, self.now())?;
        self.set_job(thread, deadline);
        self.process_help();
        Ok(())
    }

    pub fn cbs_detach_thread(&self, server: ServerId, thread: ThreadId) -> CbsResult<()> {
        self.cbs.lock().detach(server, thread)?;
        self.set_job(thread, None);
        self.process_help();
        Ok(())
    }

    pub fn cbs_get_parameters(&self, server: ServerId) -> CbsResult<CbsParameters> {
        Ok(self.cbs.lock().get(server)?.parameters())
    }

    pub fn cbs_set_parameters(&self, server: ServerId, params: CbsParameters) -> CbsResult<()> {
        self.cbs.lock().set_parameters(server, params)
    }

    pub fn cbs_get_execution_time(&self, server: ServerId) -> CbsResult<ExecutionTime> {
        Ok(self.cbs.lock().get(server)?.execution_time())
    }

    pub fn cbs_get_remaining_budget(&self, server: ServerId) -> CbsResult<u64> {
        Ok(self.cbs.lock().get(server)?.remaining_budget())
    }

    pub fn cbs_get_approved_budget(&self, server: ServerId) -> CbsResult<u64> {
        Ok(self.cbs.lock().get(server)?.parameters().budget)
    }

    pub fn cbs_get_server_id(&self, thread: ThreadId) -> CbsResult<ServerId> {
        self.cbs
            .lock()
            .server_of(thread)
            .ok_or(CbsError::InvalidParameter)
    }

    fn detach_from_server(&self, thread: ThreadId) {
        let mut cbs = self.cbs.lock();
        if let Some(server) = cbs.server_of(thread) {
            if cbs.detach(server, thread).is_ok() {
                log::debug!("thread {} left cbs server {}", thread, server);
            }
        }
    }

    fn set_job(&self, thread: ThreadId, deadline: Option<u64>) {
        let Ok(slot) = self.slot(thread) else {
            return;
        };
        let result = self.with_thread_policy(slot, |policy, control| {
            control.job_deadline = deadline;
            apply_priority(policy, slot, control, false)
        });
        log_failure("job update", result.and_then(|applied| applied));
    }

    // ------------------------------------------------------------------
    // Helping resources
    // ------------------------------------------------------------------

    pub fn create_resource(&self, ceiling: Priority) -> SchedResult<ResourceId> {
        if ceiling.value() > MAX_PRIORITY {
            return Err(SchedError::InvalidPriority { priority: ceiling });
        }
        Ok(self.resources.lock().create(ceiling))
    }

    pub fn resource_owner(&self, resource: ResourceId) -> SchedResult<Option<ThreadId>> {
        Ok(self.resources.lock().get(resource)?.owner())
    }

    /// Obtain `resource` for the executing `thread`, or wait for it in
    /// `mode`.
    pub fn obtain_resource(
        &self,
        resource: ResourceId,
        thread: ThreadId,
        mode: WaitMode,
    ) -> SchedResult<ObtainStatus> {
        let slot = self.active_slot(thread)?;
        let mut resources = self.resources.lock();
        let ceiling = resources.get(resource)?.ceiling;
        let (scheduler, blocked) = {
            let control = slot.control.lock();
            (control.scheduler, control.blocked)
        };
        if blocked {
            return Err(SchedError::InvalidState {
                expected: "ready",
                actual: "blocked",
            });
        }
        if !self.scheduler(scheduler)?.map.is_valid(ceiling) {
            return Err(SchedError::InvalidPriority { priority: ceiling });
        }

        let status = resources.obtain(resource, thread, mode)?;
        match (status, mode) {
            (ObtainStatus::Acquired, _) | (ObtainStatus::Waiting, WaitMode::Spin) => {
                slot.control.lock().add_ceiling(resource, ceiling);
                log_failure("ceiling boost", self.refresh_priority(thread, false));
                log_failure("help state", self.sync_help_state(&resources, thread));
            }
            (ObtainStatus::Waiting, WaitMode::Block) => {
                log_failure("help state", self.sync_help_state(&resources, thread));
                self.with_thread_policy(slot, |policy, control| {
                    control.blocked = true;
                    policy.block(thread);
                })?;
            }
        }

        log::debug!("thread {} obtain resource {}: {:?}", thread, resource, status);
        self.reconcile_help(&mut resources);
        Ok(status)
    }

    /// Release `resource`; ownership passes to the first waiter.
    pub fn release_resource(&self, resource: ResourceId, thread: ThreadId) -> SchedResult<()> {
        let slot = self.user_slot(thread)?;
        let mut resources = self.resources.lock();
        let ceiling = resources.get(resource)?.ceiling;
        let next = resources.release(resource, thread)?;

        slot.control.lock().remove_ceiling(resource);
        log_failure("help state", self.sync_help_state(&resources, thread));
        log_failure("ceiling removal", self.refresh_priority(thread, true));

        if let Some(waiter) = next {
            let next_slot = self.slot(waiter.thread)?;
            next_slot.control.lock().add_ceiling(resource, ceiling);
            log_failure("help state", self.sync_help_state(&resources, waiter.thread));
            log_failure("ceiling boost", self.refresh_priority(waiter.thread, false));
            if waiter.mode == WaitMode::Block {
                self.with_thread_policy(next_slot, |policy, control| {
                    control.blocked = false;
                    policy.unblock(waiter.thread);
                })?;
            }
            log::debug!("resource {} passed to thread {}", resource, waiter.thread);
        }

        self.reconcile_help(&mut resources);
        Ok(())
    }

    /// Bring the node help state of `thread` in line with its resource
    /// involvement. Edges missing from the help-state graph go through
    /// `Yourself`.
    fn sync_help_state(&self, resources: &ResourceTable, thread: ThreadId) -> SchedResult<()> {
        let (state, accepts_help) = resources.help_state_of(thread);
        let scheduler = self.scheduler_of(thread)?;
        self.with_policy(scheduler, |policy| {
            let current = policy
                .node(thread)
                .map(|node| node.help_state)
                .ok_or(SchedError::ThreadNotFound { id: thread })?;
            if !current.can_transition(state) {
                policy.set_help_state(thread, HelpState::Yourself, None)?;
            }
            policy.set_help_state(thread, state, accepts_help)
        })?
    }

    fn is_blocked(&self, thread: ThreadId) -> bool {
        self.slot(thread)
            .map_or(true, |slot| slot.control.lock().blocked)
    }

    /// Thread executes with its own node
    fn runs_on_own_node(&self, thread: ThreadId) -> bool {
        let Ok(scheduler) = self.scheduler_of(thread) else {
            return false;
        };
        self.inspect(scheduler, |policy| {
            policy.node(thread).is_some_and(|node| {
                node.state == NodeState::Scheduled && node.user == NodeUser::Owner
            })
        })
        .unwrap_or(false)
    }

    /// Processor of a rival node that can be lent right now
    fn lendable_cpu(&self, rival: ThreadId) -> Option<(usize, SchedulerId)> {
        let scheduler = self.scheduler_of(rival).ok()?;
        let cpu = self
            .inspect(scheduler, |policy| {
                policy
                    .node(rival)
                    .filter(|node| {
                        node.state == NodeState::Scheduled
                            && node.user == NodeUser::Owner
                            && node.help_state.may_lend()
                    })
                    .and_then(|node| node.cpu)
            })
            .ok()??;
        Some((cpu, scheduler))
    }

    fn process_help(&self) {
        let mut resources = self.resources.lock();
        self.reconcile_help(&mut resources);
    }

    /// Reclaim lent nodes that are no longer needed, then lend rival nodes
    /// to owners that are ready but not executing. Among eligible rivals
    /// the one on the lowest processor index wins.
    fn reconcile_help(&self, resources: &mut ResourceTable) {
        let lends: Vec<Lend> = resources.lends().to_vec();
        for lend in lends {
            let still_lent = self
                .inspect(lend.scheduler, |policy| {
                    policy
                        .node(lend.rival)
                        .is_some_and(|node| node.user == NodeUser::Helped(lend.owner))
                })
                .unwrap_or(false);
            if !still_lent {
                resources.remove_lend(lend.rival);
                continue;
            }

            let needed = resources.owns_any(lend.owner)
                && !self.is_blocked(lend.owner)
                && !self.runs_on_own_node(lend.owner);
            if !needed {
                log_failure(
                    "reclaim",
                    self.with_policy(lend.scheduler, |policy| {
                        policy.reclaim_node(lend.rival);
                    }),
                );
                resources.remove_lend(lend.rival);
                log::debug!("thread {} reclaims its node from {}", lend.rival, lend.owner);
            }
        }

        let mut pending = Vec::new();
        for owner in resources.owners() {
            if resources.helper_of(owner).is_some()
                || self.is_blocked(owner)
                || self.runs_on_own_node(owner)
            {
                continue;
            }
            let Ok(affinity) = self.affinity(owner) else {
                continue;
            };

            let helper = resources
                .rivals_of(owner)
                .into_iter()
                .filter_map(|rival| {
                    self.lendable_cpu(rival)
                        .map(|(cpu, scheduler)| (cpu, rival, scheduler))
                })
                .filter(|(cpu, _, _)| affinity.contains(*cpu))
                .min_by_key(|(cpu, _, _)| *cpu);

            let lent = helper.is_some_and(|(cpu, rival, scheduler)| {
                let lent = self
                    .with_policy(scheduler, |policy| policy.lend_node(rival, owner))
                    .unwrap_or(false);
                if lent {
                    resources.add_lend(Lend {
                        rival,
                        owner,
                        scheduler,
                    });
                    log::debug!("thread {} helps {} on cpu {}", rival, owner, cpu);
                }
                lent
            });
            if !lent {
                pending.push(owner);
            }
        }
        resources.set_pending(pending);
    }

    /// Resource owners waiting for a helper
    pub fn pending_help_requests(&self) -> Vec<ThreadId> {
        self.resources.lock().pending().to_vec()
    }

    // ------------------------------------------------------------------
    // Processor handover and pinning
    // ------------------------------------------------------------------

    /// Hand the unowned processor `cpu` to `scheduler`.
    pub fn add_processor(&self, scheduler: SchedulerId, cpu: usize) -> SchedResult<()> {
        let instance = self.scheduler(scheduler)?;
        let per_cpu = self.cpus.get(cpu).ok_or(SchedError::InvalidCpuId { cpu })?;
        let idle = self
            .parked
            .lock()
            .get_mut(cpu)
            .and_then(Option::take)
            .ok_or(SchedError::ProcessorInUse { cpu })?;
        let idle_thread = idle.id();

        let mut policy = instance.policy.lock();
        if let Err(idle) = policy.add_processor(cpu, idle) {
            self.park(cpu, idle);
            log::warn!("{} cannot take over cpu {}", instance.name, cpu);
            return Err(SchedError::NotSupported {
                operation: "add_processor",
            });
        }
        instance
            .processors
            .store(policy.processors().mask(), Ordering::Release);
        per_cpu.set_scheduler(Some(scheduler));
        if let Some(slot) = self.threads.get(idle_thread) {
            slot.control.lock().scheduler = scheduler;
        }
        self.publish(instance, &**policy);
        drop(policy);

        log::info!("cpu {} added to {}", cpu, instance.name);
        self.process_help();
        Ok(())
    }

    /// Take `cpu` away from `scheduler`. Fails while a thread of the
    /// instance could run nowhere else: its affinity or pin needs the
    /// processor, or it is the instance's last one.
    pub fn remove_processor(&self, scheduler: SchedulerId, cpu: usize) -> SchedResult<()> {
        let instance = self.scheduler(scheduler)?;
        let per_cpu = self.cpus.get(cpu).ok_or(SchedError::InvalidCpuId { cpu })?;

        let mut policy = instance.policy.lock();
        let mut remaining = policy.processors();
        if !remaining.contains(cpu) {
            return Err(SchedError::ProcessorNotOwned { cpu });
        }
        remaining.remove(cpu);
        let stranded = self.threads.iter().any(|slot| {
            let control = slot.control.lock();
            !control.is_idle
                && control.is_usable()
                && control.scheduler == scheduler
                && (remaining.is_empty()
                    || !control.affinity.intersects(remaining)
                    || control.pinned_cpu == Some(cpu))
        });
        if stranded {
            log::warn!("cpu {} still needed by a thread of {}", cpu, instance.name);
            return Err(SchedError::ProcessorInUse { cpu });
        }

        let Some(idle) = policy.remove_processor(cpu) else {
            log::error!("{} refused to give up cpu {}", instance.name, cpu);
            return Err(SchedError::ProcessorNotOwned { cpu });
        };
        instance
            .processors
            .store(policy.processors().mask(), Ordering::Release);
        per_cpu.set_scheduler(None);
        per_cpu.set_heir(None);
        self.park(cpu, idle);
        self.publish(instance, &**policy);
        drop(policy);

        log::info!("cpu {} removed from {}", cpu, instance.name);
        self.process_help();
        Ok(())
    }

    /// Pin `thread` to the processor it executes on and return that
    /// processor. Pins nest.
    pub fn pin_thread(&self, thread: ThreadId) -> SchedResult<usize> {
        let slot = self.active_slot(thread)?;
        let cpu = self.with_thread_policy(slot, |policy, control| -> SchedResult<usize> {
            if let Some(cpu) = control.pinned_cpu {
                control.pin_level += 1;
                return Ok(cpu);
            }
            let cpu = policy
                .processors()
                .iter()
                .find(|&cpu| policy.heir(cpu) == Some(thread))
                .ok_or(SchedError::InvalidState {
                    expected: "executing",
                    actual: "not executing",
                })?;
            policy.pin(thread, cpu)?;
            control.pin_level = 1;
            control.pinned_cpu = Some(cpu);
            Ok(cpu)
        })??;
        log::debug!("thread {} pinned to cpu {}", thread, cpu);
        Ok(cpu)
    }

    /// Undo one [`System::pin_thread`]; the last one lets the thread
    /// migrate again.
    pub fn unpin_thread(&self, thread: ThreadId) -> SchedResult<()> {
        let slot = self.active_slot(thread)?;
        self.with_thread_policy(slot, |policy, control| {
            if control.pinned_cpu.is_none() {
                return Err(SchedError::InvalidState {
                    expected: "pinned",
                    actual: "unpinned",
                });
            }
            control.pin_level = control.pin_level.saturating_sub(1);
            if control.pin_level == 0 {
                control.pinned_cpu = None;
                policy.unpin(thread);
                log::debug!("thread {} unpinned", thread);
            }
            Ok(())
        })??;
        self.process_help();
        Ok(())
    }

    /// Processor `thread` is pinned to
    pub fn pinned_cpu(&self, thread: ThreadId) -> SchedResult<Option<usize>> {
        Ok(self.slot(thread)?.control.lock().pinned_cpu)
    }

    // ------------------------------------------------------------------
    // Dispatcher interface and introspection
    // ------------------------------------------------------------------

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn heir(&self, cpu: usize) -> Option<ThreadId> {
        self.cpus.get(cpu).and_then(PerCpu::heir)
    }

    pub fn executing(&self, cpu: usize) -> Option<ThreadId> {
        self.cpus.get(cpu).and_then(PerCpu::executing)
    }

    pub fn dispatch_necessary(&self, cpu: usize) -> bool {
        self.cpus.get(cpu).is_some_and(PerCpu::dispatch_necessary)
    }

    /// Switch `cpu` to its heir; returns the thread now executing.
    pub fn dispatch(&self, cpu: usize) -> SchedResult<Option<ThreadId>> {
        let per_cpu = self.cpus.get(cpu).ok_or(SchedError::InvalidCpuId { cpu })?;
        Ok(per_cpu.dispatch())
    }

    /// Processor `thread` is heir of
    pub fn cpu_of(&self, thread: ThreadId) -> Option<usize> {
        self.cpus
            .iter()
            .find(|per_cpu| per_cpu.heir() == Some(thread))
            .map(|per_cpu| per_cpu.id)
    }

    /// Thread whose scheduler node holds `cpu`. Differs from the heir while
    /// the node is lent to a resource owner or kept by an idle thread.
    pub fn node_on_cpu(&self, cpu: usize) -> Option<ThreadId> {
        let scheduler = self.cpus.get(cpu)?.scheduler()?;
        self.inspect(scheduler, |policy| {
            (0..self.threads.capacity())
                .map(|index| ThreadId(index as u32))
                .find(|&thread| {
                    policy.node(thread).is_some_and(|node| {
                        node.state == NodeState::Scheduled && node.cpu == Some(cpu)
                    })
                })
        })
        .ok()
        .flatten()
    }

    pub fn node_state(&self, thread: ThreadId) -> SchedResult<NodeState> {
        let scheduler = self.scheduler_of(thread)?;
        self.inspect(scheduler, |policy| policy.node_state(thread))?
            .ok_or(SchedError::ThreadNotFound { id: thread })
    }

    pub fn help_state(&self, thread: ThreadId) -> SchedResult<HelpState> {
        let scheduler = self.scheduler_of(thread)?;
        self.inspect(scheduler, |policy| policy.node(thread).map(|node| node.help_state))?
            .ok_or(SchedError::ThreadNotFound { id: thread })
    }

    /// Ready and scheduled threads of an instance in dispatch order
    pub fn ready_order(&self, scheduler: SchedulerId) -> SchedResult<Vec<ThreadId>> {
        self.inspect(scheduler, |policy| policy.ready_order())
    }

    /// Instance invariants hold, its heirs are published, node priorities
    /// match the published priorities and no thread is heir of two
    /// processors.
    pub fn check_consistency(&self, scheduler: SchedulerId) -> SchedResult<bool> {
        let instance = self.scheduler(scheduler)?;
        let policy = instance.policy.lock();

        let internal = policy.check_consistency();
        let owned = policy.processors();
        let published = owned.iter().all(|cpu| {
            self.cpus.get(cpu).is_some_and(|per_cpu| {
                per_cpu.heir() == policy.heir(cpu) && per_cpu.scheduler() == Some(scheduler)
            })
        }) && instance.processors() == owned;
        let priorities = self.threads.iter().all(|slot| {
            let control = slot.control.lock();
            if control.is_idle || !control.is_usable() || control.scheduler != scheduler {
                return true;
            }
            policy
                .node(control.id)
                .is_some_and(|node| node.priority.value == slot.priority.read().value)
        });
        drop(policy);

        let heirs: Vec<ThreadId> = self.cpus.iter().filter_map(PerCpu::heir).collect();
        let distinct = heirs
            .iter()
            .enumerate()
            .all(|(index, thread)| !heirs[..index].contains(thread));

        if !(internal && published && priorities && distinct) {
            log::error!(
                "{}: inconsistent (internal {}, published {}, priorities {}, distinct {})",
                instance.name,
                internal,
                published,
                priorities,
                distinct
            );
        }
        Ok(internal && published && priorities && distinct)
    }
}
