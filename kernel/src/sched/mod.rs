//! Preemptive priority scheduler.
//!
//! One run-queue set per CPU ([`scheduler::SchedState`]), a global
//! scheduler spinlock serializing list edits across CPUs, and the
//! blocking/waking entry points the waitable-object layer builds on.
//!
//! On bare metal a reschedule ends in a context switch through the
//! platform shim. On the host target threads are bookkeeping objects and
//! a blocked thread parks in a spin-wait until it is readied; the
//! observable state machine is identical.

pub mod scheduler;
pub mod thread;

pub use scheduler::SchedState;
pub use thread::{KernelStack, Priority, Thread, ThreadId, ThreadState};

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::irql;
use crate::platform;

static SCHEDULER: Mutex<SchedState> = Mutex::new(SchedState::empty());

/// Power-management freeze bit: CPUs observing it park at MASKED.
static SUSPENDED: AtomicBool = AtomicBool::new(false);
static PARKED_CPUS: AtomicUsize = AtomicUsize::new(0);

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static HOST_CURRENT: core::cell::RefCell<Option<Arc<Thread>>> =
        const { core::cell::RefCell::new(None) };
}

/// Initialize the global scheduler for `ncpus`. Idle threads are
/// installed separately by the boot glue once stacks exist.
pub fn init(ncpus: usize) {
    let mut sched = SCHEDULER.lock();
    if !sched.cpus.is_empty() {
        log::warn!("sched: init called twice");
        return;
    }
    *sched = SchedState::new(ncpus);
    log::info!("sched: {} cpu run-queue sets", ncpus);
}

/// Run `f` under the global scheduler lock at DISPATCH. The run-queue
/// set is sized on first use when `init` has not run yet.
pub fn with_scheduler<R>(f: impl FnOnce(&mut SchedState) -> R) -> R {
    let old = irql::raise(irql::DISPATCH.max(irql::current()));
    let r = {
        let mut sched = SCHEDULER.lock();
        if sched.cpus.is_empty() {
            *sched = SchedState::new(platform::cpu_count());
        }
        f(&mut sched)
    };
    irql::lower(old);
    r
}

/// The thread executing the caller, if one has been installed.
pub fn current_thread() -> Option<Arc<Thread>> {
    #[cfg(not(target_os = "none"))]
    {
        HOST_CURRENT.with(|c| c.borrow().clone())
    }
    #[cfg(target_os = "none")]
    {
        with_scheduler(|s| {
            s.cpus
                .get(platform::cpu_id())
                .and_then(|c| c.current.clone())
        })
    }
}

/// Install `thread` as the caller's current thread. The boot path adopts
/// the boot thread per CPU; host-side callers adopt per hosting thread.
pub fn adopt(thread: &Arc<Thread>) {
    thread.set_state(ThreadState::Running);
    #[cfg(not(target_os = "none"))]
    {
        HOST_CURRENT.with(|c| *c.borrow_mut() = Some(thread.clone()));
    }
    #[cfg(target_os = "none")]
    {
        with_scheduler(|s| {
            let cpu = platform::cpu_id();
            if let Some(queues) = s.cpus.get_mut(cpu) {
                queues.current = Some(thread.clone());
            }
        });
    }
}

/// Link a thread into a run list, optionally with a wake boost.
pub fn ready_thread(thread: &Arc<Thread>, boost: bool) -> KernelResult<()> {
    with_scheduler(|s| s.ready(thread, boost))
}

/// Mark the calling thread Blocked, hand the CPU onward and return once
/// the thread has been readied again.
pub fn block_current() -> KernelResult<()> {
    let thread = current_thread().ok_or(KernelError::InvalidOperation)?;
    let prev = with_scheduler(|s| {
        s.block(&thread);
        s.reschedule(platform::cpu_id())
    });
    #[cfg(target_os = "none")]
    if let Some(next) = prev {
        switch_to(Some(&thread), &next);
    }
    #[cfg(not(target_os = "none"))]
    let _ = prev;
    while thread.state() == ThreadState::Blocked {
        platform::wait_for_interrupt();
    }
    Ok(())
}

/// Voluntary yield with quantum accounting: the full reschedule runs only
/// when the quantum expired, the thread blocked, or its affinity excludes
/// this CPU. A killed thread terminates here after one grace yield.
pub fn yield_now() {
    let cur = current_thread();
    if let Some(cur) = &cur {
        if cur.kill_requested() && cur.yields_since_kill.fetch_add(1, Ordering::AcqRel) >= 1 {
            exit_current();
            return;
        }
    }
    maybe_park_for_suspend();
    let next = with_scheduler(|s| s.yield_on(platform::cpu_id()));
    #[cfg(target_os = "none")]
    if let Some(next) = next {
        switch_to(cur.as_ref(), &next);
    }
    #[cfg(not(target_os = "none"))]
    let _ = next;
}

/// Terminate the calling thread.
pub fn exit_current() {
    if let Some(thread) = current_thread() {
        let next = with_scheduler(|s| {
            s.exit(&thread);
            s.reschedule(platform::cpu_id())
        });
        #[cfg(target_os = "none")]
        if let Some(next) = next {
            switch_to(None, &next);
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = next;
            HOST_CURRENT.with(|c| *c.borrow_mut() = None);
        }
    }
}

/// Scheduler tick from the timer interrupt, at DISPATCH.
pub fn timer_tick() {
    yield_now();
}

/// Freeze or thaw scheduling globally. Used by the power path before
/// suspend; CPUs observing the freeze park at MASKED.
pub fn suspend_scheduler(frozen: bool) {
    if frozen {
        PARKED_CPUS.store(0, Ordering::SeqCst);
    }
    SUSPENDED.store(frozen, Ordering::SeqCst);
}

/// Wait until every other CPU parked for the freeze.
pub fn wait_for_scheduler_suspend() {
    while SUSPENDED.load(Ordering::SeqCst)
        && PARKED_CPUS.load(Ordering::SeqCst) + 1 < platform::cpu_count()
    {
        platform::spin_hint();
    }
}

fn maybe_park_for_suspend() {
    if !SUSPENDED.load(Ordering::SeqCst) {
        return;
    }
    PARKED_CPUS.fetch_add(1, Ordering::SeqCst);
    let old = irql::raise(irql::MASKED);
    while SUSPENDED.load(Ordering::SeqCst) {
        platform::spin_hint();
    }
    irql::lower(old);
}

#[cfg(target_os = "none")]
fn switch_to(prev: Option<&Arc<Thread>>, next: &Arc<Thread>) {
    if let Some(prev) = prev {
        if Arc::ptr_eq(prev, next) {
            return;
        }
        let mut save = prev.context.lock();
        let load = next.context.lock().clone();
        platform::switch_context(Some(&mut save), &load);
    } else {
        let load = next.context.lock().clone();
        platform::switch_context(None, &load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_installs_current_thread() {
        let t = Thread::new(Some("adopted".into()), Priority::Normal, u64::MAX);
        adopt(&t);
        let cur = current_thread().unwrap();
        assert!(Arc::ptr_eq(&cur, &t));
        assert_eq!(cur.state(), ThreadState::Running);
    }

    #[test]
    fn kill_flag_terminates_after_grace_yield() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        adopt(&t);
        t.request_kill();
        yield_now(); // grace
        assert!(t.is_alive());
        yield_now(); // terminates
        assert_eq!(t.state(), ThreadState::Dead);
    }

    #[test]
    fn block_then_ready_round_trip() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let waiter = {
            let t = t.clone();
            std::thread::spawn(move || {
                adopt(&t);
                block_current().unwrap();
                t.state()
            })
        };
        // Wait for the waiter to actually block.
        while t.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        ready_thread(&t, false).unwrap();
        let observed = waiter.join().unwrap();
        assert_ne!(observed, ThreadState::Blocked);
    }
}
