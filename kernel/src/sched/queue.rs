//! Ready queues
//!
//! [`ReadyQueue`] keeps one FIFO chain per dense priority level plus a
//! bitmap. Chains are doubly linked through a link arena indexed by thread
//! slot, so enqueue, enqueue-first and extract are O(1) and never allocate
//! after construction.
//!
//! Schedulers see ready threads through [`ReadyStore`], implemented by the
//! bitmap queue, a single sorted chain and an EDF tree.

use alloc::{
    collections::{BTreeMap, VecDeque},
    vec,
    vec::Vec,
};

use super::{priority::PriorityBitMap, ThreadId};

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<u32>,
    next: Option<u32>,
    /// Level the entry is queued on, `None` when not queued
    level: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Chain {
    head: Option<u32>,
    tail: Option<u32>,
}

/// Per-priority FIFO ready chains with an O(1) highest-level lookup
#[derive(Debug, Clone)]
pub struct ReadyQueue {
    chains: Vec<Chain>,
    links: Vec<Link>,
    bitmap: PriorityBitMap,
    len: usize,
}

impl ReadyQueue {
    /// Queue with `levels` priority levels for thread slots `0..capacity`.
    pub fn new(levels: usize, capacity: usize) -> Self {
        Self {
            chains: vec![Chain::default(); levels],
            links: vec![Link::default(); capacity],
            bitmap: PriorityBitMap::new(),
            len: 0,
        }
    }

    pub fn levels(&self) -> usize {
        self.chains.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.links
            .get(thread.index())
            .is_some_and(|link| link.level.is_some())
    }

    /// Level the thread is queued on
    pub fn level_of(&self, thread: ThreadId) -> Option<usize> {
        self.links
            .get(thread.index())
            .and_then(|link| link.level)
            .map(usize::from)
    }

    fn admissible(&self, thread: ThreadId, level: usize) -> bool {
        if thread.index() >= self.links.len() || level >= self.chains.len() {
            log::error!("ready queue: {} at level {} out of range", thread, level);
            debug_assert!(false, "ready queue index out of range");
            return false;
        }
        if self.contains(thread) {
            log::error!("ready queue: {} enqueued twice", thread);
            debug_assert!(false, "thread already enqueued");
            return false;
        }
        true
    }

    /// Insert at the tail of `level`.
    pub fn enqueue(&mut self, thread: ThreadId, level: usize) {
        if !self.admissible(thread, level) {
            return;
        }
        let id = thread.0;
        let chain = &mut self.chains[level];
        let old_tail = chain.tail;
        chain.tail = Some(id);
        if chain.head.is_none() {
            chain.head = Some(id);
        }
        if let Some(tail) = old_tail {
            self.links[tail as usize].next = Some(id);
        }
        self.links[thread.index()] = Link {
            prev: old_tail,
            next: None,
            level: Some(level as u16),
        };
        self.bitmap.add(level);
        self.len += 1;
    }

    /// Insert at the head of `level`.
    pub fn enqueue_first(&mut self, thread: ThreadId, level: usize) {
        if !self.admissible(thread, level) {
            return;
        }
        let id = thread.0;
        let chain = &mut self.chains[level];
        let old_head = chain.head;
        chain.head = Some(id);
        if chain.tail.is_none() {
            chain.tail = Some(id);
        }
        if let Some(head) = old_head {
            self.links[head as usize].prev = Some(id);
        }
        self.links[thread.index()] = Link {
            prev: None,
            next: old_head,
            level: Some(level as u16),
        };
        self.bitmap.add(level);
        self.len += 1;
    }

    /// Remove the thread from its chain; returns false if it was not queued.
    pub fn extract(&mut self, thread: ThreadId) -> bool {
        let Some(link) = self.links.get(thread.index()).copied() else {
            debug_assert!(false, "ready queue index out of range");
            return false;
        };
        let Some(level) = link.level.map(usize::from) else {
            log::error!("ready queue: {} extracted while not queued", thread);
            debug_assert!(false, "thread not enqueued");
            return false;
        };

        match link.prev {
            Some(prev) => self.links[prev as usize].next = link.next,
            None => self.chains[level].head = link.next,
        }
        match link.next {
            Some(next) => self.links[next as usize].prev = link.prev,
            None => self.chains[level].tail = link.prev,
        }
        self.links[thread.index()] = Link::default();

        if self.chains[level].head.is_none() {
            self.bitmap.remove(level);
        }
        self.len -= 1;
        true
    }

    /// Head of the most urgent non-empty level
    pub fn first(&self) -> Option<ThreadId> {
        let level = self.bitmap.highest()?;
        self.chains[level].head.map(ThreadId)
    }

    /// Queued threads in dispatch order: by level, FIFO within a level.
    pub fn iter(&self) -> ReadyIter<'_> {
        let cursor = self
            .bitmap
            .highest()
            .and_then(|level| self.chains[level].head);
        ReadyIter {
            queue: self,
            cursor,
        }
    }

    /// Threads queued on one level, head first
    pub fn level(&self, level: usize) -> Vec<ThreadId> {
        let mut out = Vec::new();
        let mut cursor = self.chains.get(level).and_then(|chain| chain.head);
        while let Some(id) = cursor {
            out.push(ThreadId(id));
            cursor = self.links[id as usize].next;
        }
        out
    }

    /// Bitmap bit for each level is set iff its chain is non-empty, and the
    /// chains agree with the link arena.
    pub fn is_consistent(&self) -> bool {
        let mut counted = 0;
        for (level, chain) in self.chains.iter().enumerate() {
            if self.bitmap.contains(level) != chain.head.is_some() {
                return false;
            }
            if chain.head.is_some() != chain.tail.is_some() {
                return false;
            }
            let mut prev = None;
            let mut cursor = chain.head;
            while let Some(id) = cursor {
                let link = self.links[id as usize];
                if link.prev != prev || link.level != Some(level as u16) {
                    return false;
                }
                counted += 1;
                if counted > self.len {
                    return false;
                }
                prev = Some(id);
                cursor = link.next;
            }
            if prev != chain.tail {
                return false;
            }
        }
        counted == self.len
            && self.links.iter().filter(|link| link.level.is_some()).count() == self.len
    }
}

/// Iterator returned by [`ReadyQueue::iter`]
pub struct ReadyIter<'a> {
    queue: &'a ReadyQueue,
    cursor: Option<u32>,
}

impl Iterator for ReadyIter<'_> {
    type Item = ThreadId;

    fn next(&mut self) -> Option<ThreadId> {
        let id = self.cursor?;
        let link = self.queue.links[id as usize];
        self.cursor = match link.next {
            Some(next) => Some(next),
            None => link
                .level
                .and_then(|level| self.queue.bitmap.next_after(usize::from(level)))
                .and_then(|level| self.queue.chains[level].head),
        };
        Some(ThreadId(id))
    }
}

/// Ordered storage for the ready threads of a scheduler
pub trait ReadyStore: Send {
    fn with_capacity(levels: usize, capacity: usize) -> Self
    where
        Self: Sized;

    /// Insert behind every thread with a key less than or equal to `key`.
    fn enqueue(&mut self, thread: ThreadId, key: u64);

    /// Insert ahead of every thread with a key greater than or equal to
    /// `key`.
    fn enqueue_first(&mut self, thread: ThreadId, key: u64);

    fn extract(&mut self, thread: ThreadId) -> bool;

    fn first(&self) -> Option<ThreadId>;

    /// First result of `f` over the ready threads in dispatch order
    fn find_map<R, F>(&self, f: F) -> Option<R>
    where
        F: FnMut(ThreadId) -> Option<R>;

    fn order(&self) -> Vec<ThreadId>;

    fn is_consistent(&self) -> bool {
        true
    }
}

/// One chain sorted by key; O(n) insertion.
pub struct SimpleChain {
    chain: VecDeque<(u64, ThreadId)>,
}

impl ReadyStore for SimpleChain {
    fn with_capacity(_levels: usize, capacity: usize) -> Self {
        Self {
            chain: VecDeque::with_capacity(capacity),
        }
    }

    fn enqueue(&mut self, thread: ThreadId, key: u64) {
        let at = self
            .chain
            .iter()
            .position(|&(k, _)| k > key)
            .unwrap_or(self.chain.len());
        self.chain.insert(at, (key, thread));
    }

    fn enqueue_first(&mut self, thread: ThreadId, key: u64) {
        let at = self
            .chain
            .iter()
            .position(|&(k, _)| k >= key)
            .unwrap_or(self.chain.len());
        self.chain.insert(at, (key, thread));
    }

    fn extract(&mut self, thread: ThreadId) -> bool {
        match self.chain.iter().position(|&(_, t)| t == thread) {
            Some(at) => {
                self.chain.remove(at);
                true
            }
            None => false,
        }
    }

    fn first(&self) -> Option<ThreadId> {
        self.chain.front().map(|&(_, t)| t)
    }

    fn find_map<R, F>(&self, f: F) -> Option<R>
    where
        F: FnMut(ThreadId) -> Option<R>,
    {
        self.chain.iter().map(|&(_, t)| t).find_map(f)
    }

    fn order(&self) -> Vec<ThreadId> {
        self.chain.iter().map(|&(_, t)| t).collect()
    }

    fn is_consistent(&self) -> bool {
        self.chain.iter().zip(self.chain.iter().skip(1)).all(|(a, b)| a.0 <= b.0)
    }
}

/// Per-level FIFO chains with the priority bitmap.
pub struct DeterministicQueue {
    queue: ReadyQueue,
}

impl DeterministicQueue {
    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }
}

impl ReadyStore for DeterministicQueue {
    fn with_capacity(levels: usize, capacity: usize) -> Self {
        Self {
            queue: ReadyQueue::new(levels, capacity),
        }
    }

    fn enqueue(&mut self, thread: ThreadId, key: u64) {
        self.queue.enqueue(thread, key as usize);
    }

    fn enqueue_first(&mut self, thread: ThreadId, key: u64) {
        self.queue.enqueue_first(thread, key as usize);
    }

    fn extract(&mut self, thread: ThreadId) -> bool {
        self.queue.extract(thread)
    }

    fn first(&self) -> Option<ThreadId> {
        self.queue.first()
    }

    fn find_map<R, F>(&self, f: F) -> Option<R>
    where
        F: FnMut(ThreadId) -> Option<R>,
    {
        self.queue.iter().find_map(f)
    }

    fn order(&self) -> Vec<ThreadId> {
        self.queue.iter().collect()
    }

    fn is_consistent(&self) -> bool {
        self.queue.is_consistent()
    }
}

/// Ordered map keyed by (deadline or background priority, arrival).
pub struct EdfQueue {
    tree: BTreeMap<(u64, i64), ThreadId>,
    keys: Vec<Option<(u64, i64)>>,
    next_append: i64,
    next_prepend: i64,
}

impl ReadyStore for EdfQueue {
    fn with_capacity(_levels: usize, capacity: usize) -> Self {
        Self {
            tree: BTreeMap::new(),
            keys: vec![None; capacity],
            next_append: 0,
            next_prepend: -1,
        }
    }

    fn enqueue(&mut self, thread: ThreadId, key: u64) {
        let Some(slot) = self.keys.get_mut(thread.index()) else {
            return;
        };
        let entry = (key, self.next_append);
        self.next_append += 1;
        *slot = Some(entry);
        self.tree.insert(entry, thread);
    }

    fn enqueue_first(&mut self, thread: ThreadId, key: u64) {
        let Some(slot) = self.keys.get_mut(thread.index()) else {
            return;
        };
        let entry = (key, self.next_prepend);
        self.next_prepend -= 1;
        *slot = Some(entry);
        self.tree.insert(entry, thread);
    }

    fn extract(&mut self, thread: ThreadId) -> bool {
        match self.keys.get_mut(thread.index()).and_then(Option::take) {
            Some(entry) => self.tree.remove(&entry).is_some(),
            None => false,
        }
    }

    fn first(&self) -> Option<ThreadId> {
        self.tree.values().next().copied()
    }

    fn find_map<R, F>(&self, f: F) -> Option<R>
    where
        F: FnMut(ThreadId) -> Option<R>,
    {
        self.tree.values().copied().find_map(f)
    }

    fn order(&self) -> Vec<ThreadId> {
        self.tree.values().copied().collect()
    }

    fn is_consistent(&self) -> bool {
        self.keys.iter().filter(|k| k.is_some()).count() == self.tree.len()
    }
}
