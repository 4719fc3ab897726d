//! Software timers over the single platform timer.
//!
//! One monotonic tick counter per kernel, fed by the timer interrupt.
//! Pending timers sit in a per-CPU list ordered by expiry tick; the tick
//! interrupt queues a DPC that fires every expired timer's handler with
//! its user argument. Deadline timers fire once at an absolute tick,
//! interval timers rearm themselves until cancelled.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::{sync::Arc, vec::Vec};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::irql::dpc::{self, Dpc};
use crate::platform::{self, MAX_CPUS};

/// Scheduler/timer tick rate.
pub const TIMER_HZ: u64 = 1000;

/// Monotonic tick counter.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Tick recorded by the most recent timer interrupt. Consumers compare
/// against [`now`] to detect missed ticks.
static LAST_TIME_TICKED: AtomicU64 = AtomicU64::new(0);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one timer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Firing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fire once when the tick counter reaches the absolute tick.
    Deadline { at_tick: u64 },
    /// Fire every `period_us` microseconds until cancelled.
    Interval { period_us: u64 },
}

pub type TimerHandler = fn(usize);

pub struct Timer {
    pub id: TimerId,
    mode: TimerMode,
    handler: TimerHandler,
    arg: usize,
    armed: AtomicBool,
    fired: AtomicBool,
    /// Tick this timer next expires at; only meaningful while armed.
    next_fire: AtomicU64,
}

impl Timer {
    pub fn new(mode: TimerMode, handler: TimerHandler, arg: usize) -> Arc<Self> {
        Arc::new(Self {
            id: TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed)),
            mode,
            handler,
            arg,
            armed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            next_fire: AtomicU64::new(0),
        })
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

fn us_to_ticks(us: u64) -> u64 {
    ((us * TIMER_HZ) / 1_000_000).max(1)
}

static PENDING: [Mutex<Vec<Arc<Timer>>>; MAX_CPUS] = [const { Mutex::new(Vec::new()) }; MAX_CPUS];

lazy_static! {
    static ref EXPIRY_DPCS: Vec<Arc<Dpc>> = (0..MAX_CPUS)
        .map(|_| Arc::new(Dpc::new(expire_on_cpu)))
        .collect();
}

/// Current tick count.
pub fn now() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn last_time_ticked() -> u64 {
    LAST_TIME_TICKED.load(Ordering::Acquire)
}

fn insert_sorted(cpu: usize, timer: Arc<Timer>) {
    let mut pending = PENDING[cpu].lock();
    let at = timer.next_fire.load(Ordering::Acquire);
    let pos = pending
        .iter()
        .position(|t| t.next_fire.load(Ordering::Acquire) > at)
        .unwrap_or(pending.len());
    pending.insert(pos, timer);
}

/// Arm a timer on the calling CPU's pending list.
pub fn arm(timer: &Arc<Timer>) -> KernelResult<()> {
    if timer.armed.swap(true, Ordering::AcqRel) {
        return Err(KernelError::InUse);
    }
    timer.fired.store(false, Ordering::Release);
    let at = match timer.mode {
        TimerMode::Deadline { at_tick } => at_tick,
        TimerMode::Interval { period_us } => now() + us_to_ticks(period_us),
    };
    timer.next_fire.store(at, Ordering::Release);
    insert_sorted(platform::cpu_id(), timer.clone());
    Ok(())
}

/// Unlink a timer. Cancelling one that has already fired is a success
/// no-op.
pub fn cancel(timer: &Arc<Timer>) -> KernelResult<()> {
    if !timer.armed.swap(false, Ordering::AcqRel) {
        return Ok(());
    }
    for pending in PENDING.iter().take(platform::cpu_count()) {
        let mut list = pending.lock();
        if let Some(pos) = list.iter().position(|t| Arc::ptr_eq(t, timer)) {
            list.remove(pos);
            return Ok(());
        }
    }
    Ok(())
}

fn expire_on_cpu(cpu: usize) {
    let tick = now();
    loop {
        let due = {
            let mut pending = PENDING[cpu].lock();
            match pending.first() {
                Some(t) if t.next_fire.load(Ordering::Acquire) <= tick => Some(pending.remove(0)),
                _ => None,
            }
        };
        let timer = match due {
            Some(t) => t,
            None => break,
        };
        (timer.handler)(timer.arg);
        match timer.mode {
            TimerMode::Interval { period_us } => {
                if timer.armed.load(Ordering::Acquire) {
                    timer
                        .next_fire
                        .store(tick + us_to_ticks(period_us), Ordering::Release);
                    insert_sorted(cpu, timer);
                }
            }
            TimerMode::Deadline { .. } => {
                timer.fired.store(true, Ordering::Release);
                timer.armed.store(false, Ordering::Release);
            }
        }
    }
}

/// Timer-interrupt entry, at device IRQL. Advances the tick counter and
/// defers expiry to a DPC on this CPU.
pub fn on_tick() {
    let tick = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    LAST_TIME_TICKED.store(tick, Ordering::Release);
    let cpu = platform::cpu_id();
    // Already queued from the previous tick: the drain will see the new
    // tick value anyway.
    let _ = dpc::enqueue(&EXPIRY_DPCS[cpu], cpu, 1 << cpu);
}

/// Program the platform timer and go live.
pub fn init() -> KernelResult<()> {
    platform::program_timer(TIMER_HZ)?;
    log::info!("timer: {} Hz tick", TIMER_HZ);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irql;
    use core::sync::atomic::AtomicUsize;

    static DEADLINE_FIRES: AtomicUsize = AtomicUsize::new(0);
    static INTERVAL_FIRES: AtomicUsize = AtomicUsize::new(0);

    fn deadline_fire(arg: usize) {
        DEADLINE_FIRES.fetch_add(arg, Ordering::SeqCst);
    }

    fn interval_fire(arg: usize) {
        INTERVAL_FIRES.fetch_add(arg, Ordering::SeqCst);
    }

    fn run_ticks(n: u64) {
        for _ in 0..n {
            let old = irql::raise(irql::DISPATCH);
            on_tick();
            irql::lower(old); // drains the expiry DPC
        }
    }

    #[test]
    fn deadline_timer_fires_once() {
        let t = Timer::new(
            TimerMode::Deadline {
                at_tick: now() + 3,
            },
            deadline_fire,
            10,
        );
        arm(&t).unwrap();
        let before = DEADLINE_FIRES.load(Ordering::SeqCst);
        run_ticks(5);
        assert!(t.has_fired());
        assert!(!t.is_armed());
        let after = DEADLINE_FIRES.load(Ordering::SeqCst);
        assert_eq!(after - before, 10);
        // Fired deadline: cancel is a success no-op.
        assert_eq!(cancel(&t), Ok(()));
    }

    #[test]
    fn interval_timer_rearms_until_cancelled() {
        let t = Timer::new(TimerMode::Interval { period_us: 1000 }, interval_fire, 1);
        arm(&t).unwrap();
        let before = INTERVAL_FIRES.load(Ordering::SeqCst);
        run_ticks(4);
        let fired = INTERVAL_FIRES.load(Ordering::SeqCst) - before;
        assert!(fired >= 2, "interval fired {} times", fired);
        cancel(&t).unwrap();
        let frozen = INTERVAL_FIRES.load(Ordering::SeqCst);
        run_ticks(3);
        assert_eq!(INTERVAL_FIRES.load(Ordering::SeqCst), frozen);
    }

    #[test]
    fn last_time_ticked_tracks_ticks() {
        run_ticks(1);
        assert_eq!(last_time_ticked(), now());
    }
}
