//! Blocking kernel mutex.
//!
//! Acquire spins optimistically for a bounded count before falling back
//! to a wait on the embedded header. Recursive acquisition by the owner
//! is rejected rather than counted.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex as SpinMutex;

use crate::error::{KernelError, KernelResult};
use crate::irql;
use crate::platform;
use crate::sched::{self, ThreadId};

use super::wait::{self, WaitHeader, Waitable};

/// Optimistic spin budget before blocking.
const SPIN_BUDGET: usize = 100_000;

pub struct KernelMutex {
    hdr: WaitHeader,
    flag: AtomicBool,
    owner: SpinMutex<Option<ThreadId>>,
    /// Set during teardown: every acquire (pending or future) fails with
    /// `Aborted`.
    poisoned: AtomicBool,
}

impl KernelMutex {
    pub const fn new() -> Self {
        Self {
            // Release latches the header like a sync event, so a waiter
            // arriving after the release still gets through.
            hdr: WaitHeader::new(true, true),
            flag: AtomicBool::new(false),
            owner: SpinMutex::new(None),
            poisoned: AtomicBool::new(false),
        }
    }

    fn try_take(&self, me: ThreadId) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            *self.owner.lock() = Some(me);
            true
        } else {
            false
        }
    }

    pub fn acquire(&self) -> KernelResult<()> {
        if irql::current() > irql::DISPATCH {
            return Err(KernelError::InvalidIrql {
                current: irql::current(),
            });
        }
        let me = sched::current_thread()
            .ok_or(KernelError::InvalidOperation)?
            .tid;
        if *self.owner.lock() == Some(me) {
            return Err(KernelError::RecursiveLock);
        }
        loop {
            if self.poisoned.load(Ordering::Acquire) {
                return Err(KernelError::Aborted);
            }
            for _ in 0..SPIN_BUDGET {
                if self.try_take(me) {
                    return Ok(());
                }
                platform::spin_hint();
            }
            wait::wait_one(&self.hdr)?;
        }
    }

    pub fn try_acquire(&self) -> KernelResult<()> {
        if self.flag.load(Ordering::Acquire) {
            return Err(KernelError::InUse);
        }
        self.acquire()
    }

    pub fn release(&self) -> KernelResult<()> {
        if !self.flag.load(Ordering::Acquire) {
            return Ok(());
        }
        let me = sched::current_thread().map(|t| t.tid);
        {
            let mut owner = self.owner.lock();
            if me.is_some() && *owner != me {
                return Err(KernelError::AccessDenied);
            }
            *owner = None;
        }
        self.flag.store(false, Ordering::Release);
        wait::signal(&self.hdr, false, false)
    }

    pub fn is_held(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail every pending and future acquire. Used when the owning object
    /// is torn down underneath its users.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        let _ = wait::abort_waiters(&self.hdr);
    }
}

impl Default for KernelMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitable for KernelMutex {
    fn wait_header(&self) -> &WaitHeader {
        &self.hdr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Priority, Thread, ThreadState};
    use alloc::sync::Arc;

    fn adopted() -> Arc<Thread> {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        t
    }

    #[test]
    fn recursive_acquire_is_rejected() {
        let _me = adopted();
        let m = KernelMutex::new();
        m.acquire().unwrap();
        assert_eq!(m.acquire(), Err(KernelError::RecursiveLock));
        m.release().unwrap();
    }

    #[test]
    fn release_by_non_owner_is_denied() {
        let m = Arc::new(KernelMutex::new());
        let m2 = m.clone();
        let owner = Thread::new(None, Priority::Normal, u64::MAX);
        let o2 = owner.clone();
        std::thread::spawn(move || {
            sched::adopt(&o2);
            m2.acquire().unwrap();
        })
        .join()
        .unwrap();
        let _me = adopted();
        assert_eq!(m.release(), Err(KernelError::AccessDenied));
    }

    #[test]
    fn contended_acquire_blocks_until_release() {
        let m = Arc::new(KernelMutex::new());
        let _me = adopted();
        m.acquire().unwrap();

        let m2 = m.clone();
        let waiter = Thread::new(None, Priority::Normal, u64::MAX);
        let w2 = waiter.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&w2);
            let r = m2.acquire();
            m2.release().unwrap();
            r
        });
        // Wait until the contender parks (it may spin first).
        while waiter.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        m.release().unwrap();
        assert_eq!(join.join().unwrap(), Ok(()));
        assert!(!m.is_held());
    }

    #[test]
    fn poison_aborts_waiters() {
        let m = Arc::new(KernelMutex::new());
        let _me = adopted();
        m.acquire().unwrap();
        let m2 = m.clone();
        let waiter = Thread::new(None, Priority::Normal, u64::MAX);
        let w2 = waiter.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&w2);
            m2.acquire()
        });
        while waiter.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        m.poison();
        assert_eq!(join.join().unwrap(), Err(KernelError::Aborted));
    }
}
