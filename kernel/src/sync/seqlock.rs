//! Sequence lock
//!
//! Readers never block: they copy the value out and retry when the sequence
//! counter shows that a writer was active during the copy. Writers exclude
//! each other by moving the counter from even to odd with a compare-and-swap.

use core::{
    cell::UnsafeCell,
    hint,
    sync::atomic::{fence, AtomicU32, Ordering},
};

/// A `Copy` value guarded by a sequence counter.
pub struct SeqLock<T: Copy> {
    /// Even while stable, odd while a write is in progress.
    seq: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: Readers only ever copy `T` out and discard copies that raced with a
// writer; writers are serialized by the odd/even protocol on `seq`.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}
// SAFETY: Moving the lock moves the owned `T`.
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    /// Create a new sequence lock holding `value`
    pub const fn new(value: T) -> Self {
        Self {
            seq: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Read once; `None` when a writer was active during the read.
    pub fn try_read(&self) -> Option<T> {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 != 0 {
            return None;
        }

        // SAFETY: The pointer is valid for the lifetime of `self`. A
        // concurrent writer may tear the copy, in which case the sequence
        // check below rejects it before the value is ever observed.
        let value = unsafe { core::ptr::read_volatile(self.value.get()) };

        fence(Ordering::Acquire);
        let after = self.seq.load(Ordering::Relaxed);
        if before == after {
            Some(value)
        } else {
            None
        }
    }

    /// Read, retrying until no writer interferes.
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            hint::spin_loop();
        }
    }

    /// Replace the value.
    pub fn write(&self, value: T) {
        let start = self.begin_write();

        // SAFETY: `begin_write` made the counter odd, so no other writer can
        // be inside this section and readers will discard what they copy.
        unsafe { core::ptr::write_volatile(self.value.get(), value) };

        self.seq.store(start.wrapping_add(2), Ordering::Release);
    }

    /// Read-modify-write under writer exclusion.
    pub fn update<F>(&self, f: F) -> T
    where
        F: FnOnce(T) -> T,
    {
        let start = self.begin_write();

        // SAFETY: Same exclusion argument as in `write`.
        let value = f(unsafe { core::ptr::read_volatile(self.value.get()) });
        // SAFETY: Same exclusion argument as in `write`.
        unsafe { core::ptr::write_volatile(self.value.get(), value) };

        self.seq.store(start.wrapping_add(2), Ordering::Release);
        value
    }

    /// Current sequence number; changes on every completed write.
    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    fn begin_write(&self) -> u32 {
        loop {
            let current = self.seq.load(Ordering::Relaxed);
            if current & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(
                        current,
                        current.wrapping_add(1),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                fence(Ordering::Release);
                return current;
            }
            hint::spin_loop();
        }
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
