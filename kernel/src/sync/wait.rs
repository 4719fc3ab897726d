//! Waitable-object rendezvous.
//!
//! A [`WaitHeader`] is embedded in every synchronizable object: mutexes,
//! semaphores, events, push locks, futex buckets, IRP completion events,
//! pipes and process zombie records. Threads join the header's FIFO
//! waiter list; signaling pops waiters and readies those whose multi-wait
//! count is satisfied.
//!
//! The waiter that blocks re-checks its satisfaction count under the
//! scheduler lock, so a signal landing between list insertion and the
//! block cannot be lost.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{collections::VecDeque, sync::Arc};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::irql;
use crate::sched::{self, Thread, ThreadState};

/// Shared header for every waitable kernel object.
pub struct WaitHeader {
    waiters: Mutex<VecDeque<Arc<Thread>>>,
    signaled: AtomicBool,
    interrupted: AtomicBool,
    /// Whether `signaled` short-circuits waits (synchronization objects).
    use_signaled: bool,
    /// Whether a satisfied wait consumes `signaled` (sync events).
    auto_clear: bool,
}

impl WaitHeader {
    pub const fn new(use_signaled: bool, auto_clear: bool) -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            signaled: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            use_signaled,
            auto_clear,
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Clear the signaled latch.
    pub fn clear(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn remove_waiter(&self, thread: &Arc<Thread>) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|t| Arc::ptr_eq(t, thread)) {
            waiters.remove(pos);
        }
    }

    /// Fast path: consume an existing signal without queuing.
    fn try_consume_signal(&self) -> bool {
        if !self.use_signaled {
            return false;
        }
        if self.auto_clear {
            self.signaled.swap(false, Ordering::AcqRel)
        } else {
            self.signaled.load(Ordering::Acquire)
        }
    }
}

/// Objects embedding a [`WaitHeader`].
pub trait Waitable {
    fn wait_header(&self) -> &WaitHeader;
}

impl Waitable for WaitHeader {
    fn wait_header(&self) -> &WaitHeader {
        self
    }
}

fn block_until_satisfied(thread: &Arc<Thread>) {
    let prev = sched::with_scheduler(|s| {
        let satisfied = thread.n_signaled.load(Ordering::Acquire)
            >= thread.n_waiting.load(Ordering::Acquire);
        if satisfied || thread.interrupted.load(Ordering::Acquire) {
            None
        } else {
            s.block(thread);
            s.reschedule(crate::platform::cpu_id())
        }
    });
    let _ = prev;
    while thread.state() == ThreadState::Blocked {
        crate::platform::wait_for_interrupt();
    }
}

/// Block the calling thread until `obj` is signaled.
///
/// Returns [`KernelError::Aborted`] when the wait was cancelled, either
/// by a signal aimed at the thread or by an abort of the object itself.
pub fn wait_one(obj: &dyn Waitable) -> KernelResult<()> {
    let hdr = obj.wait_header();
    if irql::current() > irql::DISPATCH {
        return Err(KernelError::InvalidIrql {
            current: irql::current(),
        });
    }

    let old = irql::raise(irql::DISPATCH);
    {
        let waiters = hdr.waiters.lock();
        if hdr.try_consume_signal() {
            drop(waiters);
            irql::lower(old);
            return Ok(());
        }
    }
    // Joining the list needs a thread identity.
    let thread = match sched::current_thread() {
        Some(t) => t,
        None => {
            irql::lower(old);
            return Err(KernelError::InvalidOperation);
        }
    };
    {
        let mut waiters = hdr.waiters.lock();
        if hdr.try_consume_signal() {
            drop(waiters);
            irql::lower(old);
            return Ok(());
        }
        thread.n_signaled.store(0, Ordering::Release);
        thread.n_waiting.store(1, Ordering::Release);
        waiters.push_back(thread.clone());
    }
    irql::lower(old);

    block_until_satisfied(&thread);

    if let Some(by_signal) = thread.take_interrupted() {
        if by_signal {
            hdr.remove_waiter(&thread);
        }
        return Err(KernelError::Aborted);
    }
    if hdr.interrupted.load(Ordering::Acquire) {
        return Err(KernelError::Aborted);
    }
    Ok(())
}

/// Like [`wait_one`], but join the waiter list only while `pred` still
/// holds, evaluated under the header's waiter lock.
///
/// A signal lands either before the predicate runs (the caller sees the
/// changed state and gets `Ok(false)`) or after the thread is already on
/// the list (the signal pops and readies it) — there is no window where
/// a wake can be missed. Futexes use this for their compare-then-sleep
/// step.
pub fn wait_one_checked(
    obj: &dyn Waitable,
    pred: impl FnOnce() -> bool,
) -> KernelResult<bool> {
    let hdr = obj.wait_header();
    if irql::current() > irql::DISPATCH {
        return Err(KernelError::InvalidIrql {
            current: irql::current(),
        });
    }
    let thread = sched::current_thread().ok_or(KernelError::InvalidOperation)?;

    let old = irql::raise(irql::DISPATCH);
    {
        let mut waiters = hdr.waiters.lock();
        if !pred() {
            drop(waiters);
            irql::lower(old);
            return Ok(false);
        }
        if hdr.try_consume_signal() {
            drop(waiters);
            irql::lower(old);
            return Ok(true);
        }
        thread.n_signaled.store(0, Ordering::Release);
        thread.n_waiting.store(1, Ordering::Release);
        waiters.push_back(thread.clone());
    }
    irql::lower(old);

    block_until_satisfied(&thread);

    if let Some(by_signal) = thread.take_interrupted() {
        if by_signal {
            hdr.remove_waiter(&thread);
        }
        return Err(KernelError::Aborted);
    }
    if hdr.interrupted.load(Ordering::Acquire) {
        return Err(KernelError::Aborted);
    }
    Ok(true)
}

/// Block until every object in `objs` has been signaled.
///
/// Already-signaled synchronization objects are consumed up front; the
/// thread wakes only when its satisfied count reaches the number of
/// headers it actually queued on.
pub fn wait_many(objs: &[&dyn Waitable]) -> KernelResult<()> {
    if objs.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    if irql::current() > irql::DISPATCH {
        return Err(KernelError::InvalidIrql {
            current: irql::current(),
        });
    }
    let thread = sched::current_thread().ok_or(KernelError::InvalidOperation)?;

    thread.n_signaled.store(0, Ordering::Release);
    thread.n_waiting.store(0, Ordering::Release);
    let mut joined = 0usize;
    for obj in objs {
        let hdr = obj.wait_header();
        let old = irql::raise(irql::DISPATCH);
        let mut waiters = hdr.waiters.lock();
        if hdr.try_consume_signal() {
            drop(waiters);
            irql::lower(old);
            continue;
        }
        // Count the join before the list insertion becomes visible, so a
        // racing signal never sees a stale satisfaction threshold.
        thread.n_waiting.fetch_add(1, Ordering::AcqRel);
        waiters.push_back(thread.clone());
        drop(waiters);
        irql::lower(old);
        joined += 1;
    }

    if joined == 0 {
        return Ok(());
    }

    block_until_satisfied(&thread);

    if thread.take_interrupted().is_some() {
        for obj in objs {
            obj.wait_header().remove_waiter(&thread);
        }
        return Err(KernelError::Aborted);
    }
    Ok(())
}

/// Signal `obj`: latch the signaled bit (synchronization objects), pop
/// the first waiter (or all of them) and ready each one whose multi-wait
/// count is now satisfied, optionally with a priority boost.
pub fn signal(obj: &dyn Waitable, all: bool, boost: bool) -> KernelResult<()> {
    let hdr = obj.wait_header();
    if irql::current() > irql::DISPATCH {
        return Err(KernelError::InvalidIrql {
            current: irql::current(),
        });
    }
    if hdr.use_signaled {
        hdr.signaled.store(true, Ordering::Release);
    }

    let old = irql::raise(irql::DISPATCH);
    let mut woke_any = false;
    loop {
        let waiter = hdr.waiters.lock().pop_front();
        let waiter = match waiter {
            Some(w) => w,
            None => break,
        };
        let satisfied = waiter.n_signaled.fetch_add(1, Ordering::AcqRel) + 1
            >= waiter.n_waiting.load(Ordering::Acquire);
        if satisfied {
            let _ = sched::ready_thread(&waiter, boost);
            woke_any = true;
        }
        if !all {
            break;
        }
    }
    irql::lower(old);

    if hdr.auto_clear && woke_any {
        hdr.signaled.store(false, Ordering::Release);
    }
    Ok(())
}

/// Abort `obj`: mark it interrupted and wake every waiter with an abort
/// indication. Composed with a timer, this is how timeouts are built.
pub fn abort_waiters(obj: &dyn Waitable) -> KernelResult<()> {
    let hdr = obj.wait_header();
    hdr.interrupted.store(true, Ordering::Release);
    let old = irql::raise(irql::DISPATCH.max(irql::current()));
    loop {
        let waiter = hdr.waiters.lock().pop_front();
        match waiter {
            Some(w) => {
                w.interrupted.store(true, Ordering::Release);
                let _ = sched::ready_thread(&w, false);
            }
            None => break,
        }
    }
    irql::lower(old);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Priority;

    fn spawn_waiter<F>(f: F) -> (Arc<Thread>, std::thread::JoinHandle<KernelResult<()>>)
    where
        F: FnOnce() -> KernelResult<()> + Send + 'static,
    {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let t2 = t.clone();
        let handle = std::thread::spawn(move || {
            sched::adopt(&t2);
            f()
        });
        (t, handle)
    }

    fn wait_until_blocked(t: &Arc<Thread>) {
        while t.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
    }

    #[test]
    fn signaled_sync_object_returns_immediately() {
        let hdr = Arc::new(WaitHeader::new(true, false));
        signal(&*hdr, false, false).unwrap();
        let h = hdr.clone();
        let (_t, join) = spawn_waiter(move || wait_one(&*h));
        assert_eq!(join.join().unwrap(), Ok(()));
    }

    #[test]
    fn fifo_signal_wakes_exactly_the_head() {
        let hdr = Arc::new(WaitHeader::new(false, false));
        let h1 = hdr.clone();
        let (t1, j1) = spawn_waiter(move || wait_one(&*h1));
        wait_until_blocked(&t1);
        let h2 = hdr.clone();
        let (t2, j2) = spawn_waiter(move || wait_one(&*h2));
        wait_until_blocked(&t2);

        signal(&*hdr, false, false).unwrap();
        assert_eq!(j1.join().unwrap(), Ok(()));
        // The second waiter is still parked.
        assert_eq!(t2.state(), ThreadState::Blocked);
        assert_eq!(hdr.waiter_count(), 1);
        signal(&*hdr, false, false).unwrap();
        assert_eq!(j2.join().unwrap(), Ok(()));
        drop(t1);
    }

    #[test]
    fn wait_many_needs_every_object() {
        let e1 = Arc::new(WaitHeader::new(true, false));
        let e2 = Arc::new(WaitHeader::new(true, false));
        let (a1, a2) = (e1.clone(), e2.clone());
        let (t, join) = spawn_waiter(move || {
            let objs: [&dyn Waitable; 2] = [&*a1, &*a2];
            wait_many(&objs)
        });
        wait_until_blocked(&t);

        signal(&*e1, false, false).unwrap();
        // One of two signals: still blocked.
        std::thread::yield_now();
        assert_eq!(t.state(), ThreadState::Blocked);
        signal(&*e2, false, false).unwrap();
        assert_eq!(join.join().unwrap(), Ok(()));
        // Extra signals find no waiters.
        signal(&*e1, false, false).unwrap();
        assert_eq!(e1.waiter_count(), 0);
    }

    #[test]
    fn abort_wakes_with_aborted_status() {
        let hdr = Arc::new(WaitHeader::new(false, false));
        let h = hdr.clone();
        let (t, join) = spawn_waiter(move || wait_one(&*h));
        wait_until_blocked(&t);
        abort_waiters(&*hdr).unwrap();
        assert_eq!(join.join().unwrap(), Err(KernelError::Aborted));
    }

    #[test]
    fn checked_wait_declines_when_the_predicate_fails() {
        let hdr = WaitHeader::new(false, false);
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        assert_eq!(wait_one_checked(&hdr, || false), Ok(false));
        assert_eq!(hdr.waiter_count(), 0);
        assert_ne!(t.state(), ThreadState::Blocked);
    }

    #[test]
    fn checked_wait_parks_and_wakes_when_the_predicate_holds() {
        let hdr = Arc::new(WaitHeader::new(false, false));
        let h = hdr.clone();
        let (t, join) = spawn_waiter(move || wait_one_checked(&*h, || true).map(|_| ()));
        wait_until_blocked(&t);
        assert_eq!(hdr.waiter_count(), 1);
        signal(&*hdr, false, false).unwrap();
        assert_eq!(join.join().unwrap(), Ok(()));
    }

    #[test]
    fn notification_latch_persists_until_cleared() {
        let hdr = WaitHeader::new(true, false);
        signal(&hdr, true, false).unwrap();
        assert!(hdr.is_signaled());
        hdr.clear();
        assert!(!hdr.is_signaled());
    }
}
