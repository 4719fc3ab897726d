//! IRQL-coupled spinlock, the base mutual-exclusion primitive.
//!
//! Acquire raises the CPU to the requested level before spinning on the
//! flag, so the lock can never be taken at a lower level than a holder
//! runs at. Release restores the saved level; when that crosses below
//! DISPATCH the lowering path drains the CPU's DPC queue. Spinlocks are
//! never held across blocking waits.

use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::irql;
use crate::platform;

pub struct SpinLock {
    locked: AtomicBool,
    /// Source location of the holding acquire, for wedged-lock debugging.
    holder: AtomicPtr<Location<'static>>,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Acquire at [`irql::DISPATCH`], the common case.
    #[track_caller]
    pub fn acquire(&self) -> u8 {
        self.acquire_at(irql::DISPATCH)
    }

    /// Raise to `level` (keeping a higher current level) and spin until
    /// the flag is ours. Returns the IRQL to pass back to
    /// [`release`](Self::release).
    #[track_caller]
    pub fn acquire_at(&self, level: u8) -> u8 {
        let caller = Location::caller();
        let old = irql::raise(level.max(irql::current()));
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            platform::spin_hint();
        }
        self.holder
            .store(caller as *const _ as *mut _, Ordering::Relaxed);
        old
    }

    /// Try once without spinning.
    #[track_caller]
    pub fn try_acquire_at(&self, level: u8) -> Option<u8> {
        let old = irql::raise(level.max(irql::current()));
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.holder
                .store(Location::caller() as *const _ as *mut _, Ordering::Relaxed);
            Some(old)
        } else {
            irql::lower(old);
            None
        }
    }

    /// Clear the flag and restore the IRQL saved by acquire.
    pub fn release(&self, old_irql: u8) {
        self.holder.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        irql::lower(old_irql);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
