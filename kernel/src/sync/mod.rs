//! Synchronization Primitives
//!
//! Per-instance locks come from `spin`; this module adds the sequence lock
//! used for lock-free priority reads on the scheduling fast path.

pub mod seqlock;

pub use seqlock::SeqLock;
