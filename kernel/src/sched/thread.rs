//! Thread objects and their lifecycle state.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use alloc::{string::String, sync::Arc, sync::Weak};
use spin::Mutex;

use crate::mm::VirtAddr;
use crate::platform::CpuContext;
use crate::process::Process;
use crate::signal::SignalHeader;

/// Thread identifier, unique for the kernel lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Scheduler state machine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Dead = 3,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Dead,
        }
    }
}

/// Thread priority, lowest to highest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
    RealTime = 5,
}

/// Number of priority levels (and of per-CPU run lists).
pub const PRIORITY_LEVELS: usize = 6;

impl Priority {
    pub fn from_index(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Idle),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Urgent),
            5 => Some(Self::RealTime),
            _ => None,
        }
    }

    /// Ticks a thread of this priority may run before rotation.
    /// Real-time threads rotate only voluntarily.
    pub fn quantum(&self) -> u64 {
        match self {
            Self::Idle => 2,
            Self::Low => 4,
            Self::Normal => 8,
            Self::High => 12,
            Self::Urgent => 12,
            Self::RealTime => u64::MAX,
        }
    }
}

/// A kernel stack owned by a thread: non-pageable pages plus a guard
/// page, carved from the kernel address space.
#[derive(Debug, Clone, Copy)]
pub struct KernelStack {
    pub base: VirtAddr,
    pub pages: usize,
}

/// Hook invoked with `(base, pages)` when a dead thread's stack is
/// released. Installed once by the boot glue.
static STACK_FREE_HOOK: spin::Once<fn(VirtAddr, usize)> = spin::Once::new();

pub fn set_stack_free_hook(hook: fn(VirtAddr, usize)) {
    STACK_FREE_HOOK.call_once(|| hook);
}

pub(super) fn release_stack(stack: KernelStack) {
    if let Some(hook) = STACK_FREE_HOOK.get() {
        hook(stack.base, stack.pages);
    }
}

/// Sentinel for "not linked into any CPU's run lists".
pub(super) const NO_CPU: usize = usize::MAX;

/// An execution entity.
///
/// Wait bookkeeping (`n_waiting`, `n_signaled`, the interrupted flags)
/// belongs to the waitable-header protocol in `sync::wait`; the scheduler
/// only reads it when waking.
pub struct Thread {
    pub tid: ThreadId,
    pub name: Option<String>,
    state: AtomicU8,
    priority: AtomicU8,
    pub affinity: AtomicU64,
    pub(super) quantum: AtomicU64,
    pub total_quantums: AtomicU64,
    pub(super) boosted: AtomicBool,
    kill_requested: AtomicBool,
    pub(super) yields_since_kill: AtomicU32,
    pub last_run_tick: AtomicU64,
    pub(super) queued_cpu: AtomicUsize,
    pub n_waiting: AtomicUsize,
    pub n_signaled: AtomicUsize,
    pub interrupted: AtomicBool,
    pub signal_interrupted: AtomicBool,
    pub signals: SignalHeader,
    process: Mutex<Weak<Process>>,
    pub context: Mutex<CpuContext>,
    pub kernel_stack: Mutex<Option<KernelStack>>,
}

impl Thread {
    /// Create a thread in the `Ready`-eligible state; it runs only after
    /// `sched::ready_thread` links it into a run list.
    pub fn new(name: Option<String>, priority: Priority, affinity: u64) -> Arc<Self> {
        Arc::new(Self {
            tid: ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed)),
            name,
            state: AtomicU8::new(ThreadState::Ready as u8),
            priority: AtomicU8::new(priority as u8),
            affinity: AtomicU64::new(affinity),
            quantum: AtomicU64::new(0),
            total_quantums: AtomicU64::new(0),
            boosted: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            yields_since_kill: AtomicU32::new(0),
            last_run_tick: AtomicU64::new(0),
            queued_cpu: AtomicUsize::new(NO_CPU),
            n_waiting: AtomicUsize::new(0),
            n_signaled: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
            signal_interrupted: AtomicBool::new(false),
            signals: SignalHeader::new(),
            process: Mutex::new(Weak::new()),
            context: Mutex::new(CpuContext::default()),
            kernel_stack: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(super) fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn priority(&self) -> Priority {
        Priority::from_index(self.priority.load(Ordering::Acquire)).unwrap_or(Priority::Normal)
    }

    pub(super) fn set_priority_raw(&self, p: Priority) {
        self.priority.store(p as u8, Ordering::Release);
    }

    /// Set the base priority. The caller relinks the thread when it is
    /// sitting in a run list.
    pub fn set_priority(&self, p: Priority) {
        self.priority.store(p as u8, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ThreadState::Dead
    }

    /// Flag the thread for termination at its next yield (after one
    /// grace yield, giving the victim a chance to unwind).
    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::Release);
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    /// True when the thread may run on `cpu`.
    pub fn allows_cpu(&self, cpu: usize) -> bool {
        self.affinity.load(Ordering::Acquire) & (1u64 << cpu) != 0
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().upgrade()
    }

    pub fn set_process(&self, proc: &Arc<Process>) {
        *self.process.lock() = Arc::downgrade(proc);
    }

    /// Consume the interrupted flag, reporting whether a signal (rather
    /// than an object abort) raised it.
    pub fn take_interrupted(&self) -> Option<bool> {
        if self.interrupted.swap(false, Ordering::AcqRel) {
            Some(self.signal_interrupted.swap(false, Ordering::AcqRel))
        } else {
            None
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_table_matches_priorities() {
        assert_eq!(Priority::Idle.quantum(), 2);
        assert_eq!(Priority::Low.quantum(), 4);
        assert_eq!(Priority::Normal.quantum(), 8);
        assert_eq!(Priority::High.quantum(), 12);
        assert_eq!(Priority::Urgent.quantum(), 12);
        assert_eq!(Priority::RealTime.quantum(), u64::MAX);
    }

    #[test]
    fn tids_are_unique_and_monotonic() {
        let a = Thread::new(None, Priority::Normal, 1);
        let b = Thread::new(None, Priority::Normal, 1);
        assert!(b.tid.0 > a.tid.0);
    }

    #[test]
    fn affinity_mask_checks() {
        let t = Thread::new(None, Priority::Normal, 0b101);
        assert!(t.allows_cpu(0));
        assert!(!t.allows_cpu(1));
        assert!(t.allows_cpu(2));
    }
}
