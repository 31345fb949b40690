//! Constant Bandwidth Server
//!
//! A server reserves `budget` ticks of execution per `deadline` ticks for
//! the threads attached to it. While budget remains, attached threads run
//! with the server's absolute deadline as their EDF priority; once it is
//! used up they are postponed to the background band until the next
//! replenishment.
//!
//! The table only does bookkeeping. It reports what happened as
//! [`CbsEvent`]s and the caller applies the priority changes and runs the
//! overrun handlers after dropping the table lock.

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use super::{ServerId, ThreadId};
use crate::error::{CbsError, CbsResult};

/// Full processor utilization in parts per million
pub const FULL_UTILIZATION_PPM: u64 = 1_000_000;

/// Called with the server id when a server runs out of budget
pub type OverrunHandler = Arc<dyn Fn(ServerId) + Send + Sync>;

/// Reservation of `budget` ticks every `deadline` ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbsParameters {
    pub deadline: u64,
    pub budget: u64,
}

impl CbsParameters {
    pub const fn new(deadline: u64, budget: u64) -> Self {
        Self { deadline, budget }
    }

    pub fn validate(&self) -> CbsResult<()> {
        if self.deadline == 0 || self.budget == 0 || self.budget > self.deadline {
            return Err(CbsError::InvalidParameter);
        }
        Ok(())
    }

    /// Processor share in parts per million, rounded up
    pub fn utilization_ppm(&self) -> u64 {
        if self.deadline == 0 {
            return u64::MAX;
        }
        let share = (u128::from(self.budget) * u128::from(FULL_UTILIZATION_PPM))
            .div_ceil(u128::from(self.deadline));
        u64::try_from(share).unwrap_or(u64::MAX)
    }
}

/// Execution time consumed by a server's threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionTime {
    /// Ticks consumed in the current period
    pub period: u64,
    /// Ticks consumed since the server was created
    pub total: u64,
}

pub struct CbsServer {
    pub id: ServerId,
    params: CbsParameters,
    threads: Vec<ThreadId>,
    remaining: u64,
    /// Absolute deadline of the current period
    deadline_at: u64,
    consumed: ExecutionTime,
    overrun: Option<OverrunHandler>,
}

impl CbsServer {
    pub fn parameters(&self) -> CbsParameters {
        self.params
    }

    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn remaining_budget(&self) -> u64 {
        self.remaining
    }

    pub fn deadline_at(&self) -> u64 {
        self.deadline_at
    }

    pub fn execution_time(&self) -> ExecutionTime {
        self.consumed
    }

    fn release(&mut self, now: u64) {
        self.remaining = self.params.budget;
        self.deadline_at = now.saturating_add(self.params.deadline);
        self.consumed.period = 0;
    }

    /// Priority deadline for attached threads, `None` while postponed
    fn job_deadline(&self) -> Option<u64> {
        (self.remaining > 0).then_some(self.deadline_at)
    }
}

impl fmt::Debug for CbsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbsServer")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("threads", &self.threads)
            .field("remaining", &self.remaining)
            .field("deadline_at", &self.deadline_at)
            .field("consumed", &self.consumed)
            .field("overrun", &self.overrun.is_some())
            .finish()
    }
}

/// Budget event reported by [`CbsTable::tick`]
pub enum CbsEvent {
    /// Budget used up; threads are postponed until replenishment
    Overrun {
        server: ServerId,
        threads: Vec<ThreadId>,
        handler: Option<OverrunHandler>,
    },
    /// New period; threads run with `deadline` again
    Replenished {
        server: ServerId,
        threads: Vec<ThreadId>,
        deadline: u64,
    },
}

impl fmt::Debug for CbsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CbsEvent::Overrun { server, threads, .. } => f
                .debug_struct("Overrun")
                .field("server", server)
                .field("threads", threads)
                .finish(),
            CbsEvent::Replenished {
                server,
                threads,
                deadline,
            } => f
                .debug_struct("Replenished")
                .field("server", server)
                .field("threads", threads)
                .field("deadline", deadline)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct CbsTable {
    servers: Vec<Option<CbsServer>>,
}

impl CbsTable {
    pub fn new(max_servers: usize) -> Self {
        let mut servers = Vec::with_capacity(max_servers);
        servers.resize_with(max_servers, || None);
        Self { servers }
    }

    pub fn capacity(&self) -> usize {
        self.servers.len()
    }

    pub fn get(&self, id: ServerId) -> CbsResult<&CbsServer> {
        self.servers
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(CbsError::NoServer { id })
    }

    fn get_mut(&mut self, id: ServerId) -> CbsResult<&mut CbsServer> {
        self.servers
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(CbsError::NoServer { id })
    }

    /// Admitted utilization of every server except `except`
    fn utilization_ppm(&self, except: Option<ServerId>) -> u64 {
        self.servers
            .iter()
            .flatten()
            .filter(|server| Some(server.id) != except)
            .map(|server| server.params.utilization_ppm())
            .fold(0, u64::saturating_add)
    }

    fn admit(&self, params: CbsParameters, except: Option<ServerId>) -> CbsResult<()> {
        params.validate()?;
        let total = self
            .utilization_ppm(except)
            .saturating_add(params.utilization_ppm());
        if total > FULL_UTILIZATION_PPM {
            return Err(CbsError::SystemOverload);
        }
        Ok(())
    }

    pub fn create(
        &mut self,
        params: CbsParameters,
        overrun: Option<OverrunHandler>,
    ) -> CbsResult<ServerId> {
        self.admit(params, None)?;
        let index = self
            .servers
            .iter()
            .position(Option::is_none)
            .ok_or(CbsError::Full)?;
        let id = ServerId(index as u32);
        self.servers[index] = Some(CbsServer {
            id,
            params,
            threads: Vec::new(),
            remaining: params.budget,
            deadline_at: 0,
            consumed: ExecutionTime::default(),
            overrun,
        });
        log::debug!(
            "cbs server {} created: budget {} per {}",
            id,
            params.budget,
            params.deadline
        );
        Ok(id)
    }

    /// Remove a server; returns the threads that were attached.
    pub fn destroy(&mut self, id: ServerId) -> CbsResult<Vec<ThreadId>> {
        let server = self
            .servers
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(CbsError::NoServer { id })?;
        log::debug!("cbs server {} destroyed", id);
        Ok(server.threads)
    }

    /// Server a thread is attached to
    pub fn server_of(&self, thread: ThreadId) -> Option<ServerId> {
        self.servers
            .iter()
            .flatten()
            .find(|server| server.threads.contains(&thread))
            .map(|server| server.id)
    }

    /// Attach `thread`; the first thread starts a new period at `now`.
    /// Returns the job deadline the thread runs with, if budget remains.
    pub fn attach(&mut self, id: ServerId, thread: ThreadId, now: u64) -> CbsResult<Option<u64>> {
        self.get(id)?;
        if self.server_of(thread).is_some() {
            return Err(CbsError::InvalidParameter);
        }
        let server = self.get_mut(id)?;
        if server.threads.is_empty() {
            server.release(now);
        }
        server.threads.push(thread);
        log::debug!("{} attached to cbs server {}", thread, id);
        Ok(server.job_deadline())
    }

    pub fn detach(&mut self, id: ServerId, thread: ThreadId) -> CbsResult<()> {
        let server = self.get_mut(id)?;
        let at = server
            .threads
            .iter()
            .position(|&t| t == thread)
            .ok_or(CbsError::InvalidParameter)?;
        server.threads.remove(at);
        log::debug!("{} detached from cbs server {}", thread, id);
        Ok(())
    }

    /// Replace the parameters; the remaining budget is clamped to the new
    /// budget and the new period starts at the next replenishment.
    pub fn set_parameters(&mut self, id: ServerId, params: CbsParameters) -> CbsResult<()> {
        self.get(id)?;
        self.admit(params, Some(id))?;
        let server = self.get_mut(id)?;
        server.params = params;
        server.remaining = server.remaining.min(params.budget);
        Ok(())
    }

    /// Account one clock tick at time `now`. `running` tells whether a
    /// thread executed during the tick.
    pub fn tick<F>(&mut self, now: u64, running: F) -> Vec<CbsEvent>
    where
        F: Fn(ThreadId) -> bool,
    {
        let mut events = Vec::new();
        for server in self.servers.iter_mut().flatten() {
            if server.threads.is_empty() {
                continue;
            }

            if server.threads.iter().any(|&thread| running(thread)) {
                server.consumed.period += 1;
                server.consumed.total += 1;
                if server.remaining > 0 {
                    server.remaining -= 1;
                    if server.remaining == 0 {
                        log::debug!("cbs server {} overrun at {}", server.id, now);
                        events.push(CbsEvent::Overrun {
                            server: server.id,
                            threads: server.threads.clone(),
                            handler: server.overrun.clone(),
                        });
                    }
                }
            }

            if now >= server.deadline_at {
                // Deadlines saturate at the end of time
                let next = server.deadline_at.saturating_add(server.params.deadline);
                server.release(now);
                server.deadline_at = next.max(now.saturating_add(1));
                events.push(CbsEvent::Replenished {
                    server: server.id,
                    threads: server.threads.clone(),
                    deadline: server.deadline_at,
                });
            }
        }
        events
    }
}
