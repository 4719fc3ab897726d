//! Deferred procedure calls.
//!
//! A DPC is a callback plus one context word, queued onto a CPU from
//! interrupt context (or any code at or above DISPATCH) and run at
//! [`super::DISPATCH`] when that CPU next lowers below it. Enqueue picks
//! the least-loaded CPU allowed by the caller's affinity mask.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::{collections::VecDeque, sync::Arc};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::platform::{self, MAX_CPUS};

/// Affinity mask covering every online CPU.
pub fn default_affinity() -> u64 {
    let n = platform::cpu_count();
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// One deferred procedure call.
///
/// The record is reusable: once the handler has run, the DPC may be
/// enqueued again. Double-enqueue before that fails with
/// [`KernelError::DpcAlreadyEnqueued`].
pub struct Dpc {
    handler: fn(usize),
    context: AtomicUsize,
    enqueued: AtomicBool,
}

impl Dpc {
    pub const fn new(handler: fn(usize)) -> Self {
        Self {
            handler,
            context: AtomicUsize::new(0),
            enqueued: AtomicBool::new(false),
        }
    }

    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire)
    }
}

static QUEUES: [Mutex<VecDeque<Arc<Dpc>>>; MAX_CPUS] =
    [const { Mutex::new(VecDeque::new()) }; MAX_CPUS];

/// Queue `dpc` with `context` onto the least-loaded CPU allowed by
/// `affinity`. A zero mask falls back to every online CPU.
pub fn enqueue(dpc: &Arc<Dpc>, context: usize, affinity: u64) -> KernelResult<()> {
    if dpc
        .enqueued
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(KernelError::DpcAlreadyEnqueued);
    }
    dpc.context.store(context, Ordering::Release);

    let mut mask = affinity & default_affinity();
    if mask == 0 {
        mask = default_affinity();
    }
    let mut target = None;
    let mut target_len = usize::MAX;
    for cpu in 0..platform::cpu_count() {
        if mask & (1 << cpu) == 0 {
            continue;
        }
        let len = QUEUES[cpu].lock().len();
        if len < target_len {
            target = Some(cpu);
            target_len = len;
        }
    }
    match target {
        Some(cpu) => {
            QUEUES[cpu].lock().push_back(dpc.clone());
            Ok(())
        }
        None => {
            dpc.enqueued.store(false, Ordering::Release);
            Err(KernelError::InvalidAffinity)
        }
    }
}

/// Unlink a queued DPC before it runs. Success if it was not queued.
pub fn cancel(dpc: &Arc<Dpc>) {
    if !dpc.enqueued.load(Ordering::Acquire) {
        return;
    }
    for queue in QUEUES.iter().take(platform::cpu_count()) {
        let mut q = queue.lock();
        if let Some(pos) = q.iter().position(|d| Arc::ptr_eq(d, dpc)) {
            q.remove(pos);
            dpc.enqueued.store(false, Ordering::Release);
            return;
        }
    }
}

/// Pop and run every DPC queued on the calling CPU. Runs at DISPATCH;
/// called from the IRQL lowering path with the level already set.
pub fn drain_current_cpu() {
    let cpu = platform::cpu_id();
    loop {
        let next = QUEUES[cpu].lock().pop_front();
        match next {
            Some(dpc) => {
                dpc.enqueued.store(false, Ordering::Release);
                let ctx = dpc.context.load(Ordering::Acquire);
                (dpc.handler)(ctx);
            }
            None => break,
        }
    }
}
