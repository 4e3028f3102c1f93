//! Thread barrier and spinlock primitives
//!
//! The barrier is the only blocking rendezvous in the engine; the spinlock
//! lives inside hash-table bucket headers and must stay a single word.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Reusable counting barrier over a fixed number of threads.
///
/// Every caller of [`arrive`](Self::arrive) increments a shared counter
/// under a mutex; the last arriver resets the counter and wakes everyone,
/// earlier arrivers wait on the condition variable. The barrier is
/// immediately reusable for the next rendezvous.
pub struct Barrier {
    threads: usize,
    count: Mutex<usize>,
    generation: Condvar,
}

impl Barrier {
    /// Creates a barrier for `threads` participants.
    pub fn new(threads: usize) -> Result<Self> {
        if threads < 1 {
            return Err(Error::Config("barrier needs at least one thread".into()));
        }
        Ok(Self { threads, count: Mutex::new(0), generation: Condvar::new() })
    }

    /// Blocks until all participants have arrived.
    pub fn arrive(&self) {
        let mut count = self.count.lock();
        *count += 1;
        if *count == self.threads {
            *count = 0;
            self.generation.notify_all();
        } else {
            self.generation.wait(&mut count);
        }
    }

    /// Number of participating threads.
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").field("threads", &self.threads).finish()
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Single-word test-and-set spinlock.
///
/// Sized and aligned to fit inside a hash-table bucket header. `reset`
/// reinitializes to unlocked and is sound only while no other thread is
/// contending (bucket-clear time).
#[repr(C)]
pub struct Spinlock {
    state: AtomicU32,
}

impl Spinlock {
    /// Creates an unlocked spinlock.
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(UNLOCKED) }
    }

    /// Busy-waits until the lock is held.
    #[inline]
    pub fn lock(&self) {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.state.load(Ordering::Relaxed) == LOCKED {
                std::hint::spin_loop();
            }
        }
    }

    /// Attempts to take the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    #[inline]
    pub fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Reinitializes to unlocked. Callers must guarantee no contention.
    #[inline]
    pub fn reset(&self) {
        self.state.store(UNLOCKED, Ordering::Relaxed);
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Spinlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &(self.state.load(Ordering::Relaxed) == LOCKED))
            .finish()
    }
}
