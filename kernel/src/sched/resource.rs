//! Helping resources
//!
//! A helping resource has a priority ceiling and FIFO ownership hand-over.
//! Threads waiting for it either spin (and stay ready, so their scheduler
//! node can be lent to the owner) or block. The table also records which
//! rival nodes are currently lent to which owners, and owners still waiting
//! for a helper.

use alloc::{collections::VecDeque, vec::Vec};

use super::{help::HelpState, priority::Priority, ResourceId, SchedulerId, ThreadId};
use crate::error::{SchedError, SchedResult};

/// How a thread waits for an owned resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Stay ready and busy-wait; the node may help the owner
    Spin,
    /// Block until ownership is handed over
    Block,
}

/// Result of an obtain request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObtainStatus {
    Acquired,
    /// Queued behind the current owner
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub thread: ThreadId,
    pub mode: WaitMode,
}

#[derive(Debug)]
pub struct HelpingResource {
    pub id: ResourceId,
    pub ceiling: Priority,
    owner: Option<ThreadId>,
    waiters: VecDeque<Waiter>,
}

impl HelpingResource {
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    pub fn waiters(&self) -> impl Iterator<Item = &Waiter> {
        self.waiters.iter()
    }
}

/// A rival's node executing a resource owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lend {
    pub rival: ThreadId,
    pub owner: ThreadId,
    /// Scheduler instance holding the rival's node
    pub scheduler: SchedulerId,
}

#[derive(Debug, Default)]
pub struct ResourceTable {
    resources: Vec<HelpingResource>,
    lends: Vec<Lend>,
    pending: Vec<ThreadId>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, ceiling: Priority) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        self.resources.push(HelpingResource {
            id,
            ceiling,
            owner: None,
            waiters: VecDeque::new(),
        });
        log::debug!("resource {} created with ceiling {}", id, ceiling);
        id
    }

    pub fn get(&self, id: ResourceId) -> SchedResult<&HelpingResource> {
        self.resources
            .get(id.index())
            .ok_or(SchedError::ResourceNotFound { id })
    }

    /// Take the resource or queue behind its owner.
    pub fn obtain(
        &mut self,
        id: ResourceId,
        thread: ThreadId,
        mode: WaitMode,
    ) -> SchedResult<ObtainStatus> {
        if let Some((resource, _)) = self.waiting_for(thread) {
            log::warn!("{} already waits for resource {}", thread, resource);
            return Err(SchedError::AlreadyWaiting { thread });
        }
        let resource = self
            .resources
            .get_mut(id.index())
            .ok_or(SchedError::ResourceNotFound { id })?;
        match resource.owner {
            None => {
                resource.owner = Some(thread);
                Ok(ObtainStatus::Acquired)
            }
            Some(owner) if owner == thread => Err(SchedError::InvalidState {
                expected: "not owner",
                actual: "owner",
            }),
            Some(_) => {
                resource.waiters.push_back(Waiter { thread, mode });
                Ok(ObtainStatus::Waiting)
            }
        }
    }

    /// Give up ownership; the first waiter becomes the new owner.
    pub fn release(&mut self, id: ResourceId, thread: ThreadId) -> SchedResult<Option<Waiter>> {
        let resource = self
            .resources
            .get_mut(id.index())
            .ok_or(SchedError::ResourceNotFound { id })?;
        if resource.owner != Some(thread) {
            return Err(SchedError::NotOwner { resource: id });
        }
        let next = resource.waiters.pop_front();
        resource.owner = next.map(|waiter| waiter.thread);
        Ok(next)
    }

    pub fn owns_any(&self, thread: ThreadId) -> bool {
        self.resources.iter().any(|r| r.owner == Some(thread))
    }

    /// Threads owning at least one resource, in resource order
    pub fn owners(&self) -> Vec<ThreadId> {
        let mut owners: Vec<ThreadId> = Vec::new();
        for owner in self.resources.iter().filter_map(|r| r.owner) {
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        owners
    }

    pub fn waiting_for(&self, thread: ThreadId) -> Option<(ResourceId, WaitMode)> {
        self.resources.iter().find_map(|resource| {
            resource
                .waiters
                .iter()
                .find(|waiter| waiter.thread == thread)
                .map(|waiter| (resource.id, waiter.mode))
        })
    }

    /// Spinning waiters of resources owned by `owner`, in queue order
    pub fn rivals_of(&self, owner: ThreadId) -> Vec<ThreadId> {
        self.resources
            .iter()
            .filter(|resource| resource.owner == Some(owner))
            .flat_map(|resource| resource.waiters.iter())
            .filter(|waiter| waiter.mode == WaitMode::Spin)
            .map(|waiter| waiter.thread)
            .collect()
    }

    /// Thread takes part in resource sharing as owner or waiter
    pub fn involves(&self, thread: ThreadId) -> bool {
        self.owns_any(thread) || self.waiting_for(thread).is_some()
    }

    /// Help state a thread's node should have
    pub fn help_state_of(&self, thread: ThreadId) -> (HelpState, Option<ThreadId>) {
        if self.owns_any(thread) {
            return (HelpState::ActiveOwner, None);
        }
        match self.waiting_for(thread) {
            Some((id, mode)) => {
                let owner = self.resources.get(id.index()).and_then(|r| r.owner);
                let state = match mode {
                    WaitMode::Spin => HelpState::ActiveRival,
                    WaitMode::Block => HelpState::Passive,
                };
                (state, owner)
            }
            None => (HelpState::Yourself, None),
        }
    }

    pub fn lends(&self) -> &[Lend] {
        &self.lends
    }

    pub fn is_lending(&self, thread: ThreadId) -> bool {
        self.lends
            .iter()
            .any(|lend| lend.rival == thread || lend.owner == thread)
    }

    pub fn helper_of(&self, owner: ThreadId) -> Option<Lend> {
        self.lends.iter().copied().find(|lend| lend.owner == owner)
    }

    pub fn add_lend(&mut self, lend: Lend) {
        self.lends.push(lend);
    }

    pub fn remove_lend(&mut self, rival: ThreadId) -> Option<Lend> {
        let at = self.lends.iter().position(|lend| lend.rival == rival)?;
        Some(self.lends.remove(at))
    }

    /// Owners that are ready but found no helper
    pub fn pending(&self) -> &[ThreadId] {
        &self.pending
    }

    pub fn set_pending(&mut self, pending: Vec<ThreadId>) {
        self.pending = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u32) -> ThreadId {
        ThreadId(id)
    }

    #[test]
    fn test_fifo_hand_over() {
        let mut table = ResourceTable::new();
        let r = table.create(Priority(2));
        assert_eq!(table.obtain(r, t(1), WaitMode::Spin), Ok(ObtainStatus::Acquired));
        assert_eq!(table.obtain(r, t(2), WaitMode::Block), Ok(ObtainStatus::Waiting));
        assert_eq!(table.obtain(r, t(3), WaitMode::Spin), Ok(ObtainStatus::Waiting));

        assert_eq!(table.release(r, t(2)), Err(SchedError::NotOwner { resource: r }));
        let next = table.release(r, t(1)).unwrap();
        assert_eq!(next, Some(Waiter { thread: t(2), mode: WaitMode::Block }));
        assert_eq!(table.get(r).unwrap().owner(), Some(t(2)));
        assert_eq!(table.rivals_of(t(2)), [t(3)]);
    }

    #[test]
    fn test_help_states_follow_involvement() {
        let mut table = ResourceTable::new();
        let r = table.create(Priority(1));
        table.obtain(r, t(1), WaitMode::Spin).unwrap();
        table.obtain(r, t(2), WaitMode::Spin).unwrap();
        table.obtain(r, t(3), WaitMode::Block).unwrap();
        assert_eq!(table.help_state_of(t(1)), (HelpState::ActiveOwner, None));
        assert_eq!(table.help_state_of(t(2)), (HelpState::ActiveRival, Some(t(1))));
        assert_eq!(table.help_state_of(t(3)), (HelpState::Passive, Some(t(1))));
        assert_eq!(table.help_state_of(t(4)), (HelpState::Yourself, None));
        assert!(table.involves(t(3)));
    }

    #[test]
    fn test_rejects_double_wait_and_recursion() {
        let mut table = ResourceTable::new();
        let a = table.create(Priority(1));
        let b = table.create(Priority(1));
        table.obtain(a, t(1), WaitMode::Spin).unwrap();
        table.obtain(b, t(2), WaitMode::Spin).unwrap();
        assert!(table.obtain(a, t(1), WaitMode::Spin).is_err());
        table.obtain(a, t(3), WaitMode::Spin).unwrap();
        assert_eq!(
            table.obtain(b, t(3), WaitMode::Spin),
            Err(SchedError::AlreadyWaiting { thread: t(3) })
        );
        assert_eq!(
            table.obtain(ResourceId(9), t(4), WaitMode::Spin),
            Err(SchedError::ResourceNotFound { id: ResourceId(9) })
        );
    }

    #[test]
    fn test_lend_ledger() {
        let mut table = ResourceTable::new();
        let lend = Lend {
            rival: t(2),
            owner: t(1),
            scheduler: SchedulerId(0),
        };
        table.add_lend(lend);
        assert!(table.is_lending(t(1)));
        assert_eq!(table.helper_of(t(1)), Some(lend));
        assert_eq!(table.remove_lend(t(2)), Some(lend));
        assert!(!table.is_lending(t(2)));
    }
}
