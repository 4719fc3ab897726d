//! POSIX-shaped signals.
//!
//! Per-thread pending/mask state lives in the [`SignalHeader`] embedded
//! in every thread; per-process dispositions live in the process's
//! action table. Sending ORs the pending bit and kicks blocked threads
//! out of their waits; delivery happens on the way back to user mode,
//! where the lowest deliverable signal either applies its default action
//! or gets a handler frame built on the user stack.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{user_access, VirtAddr};
use crate::platform::CpuContext;
use crate::process::{Process, ProcessGroup};
use crate::sched::{self, Thread, ThreadState};
use crate::sync::{Event, EventKind};

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGSTKFLT: i32 = 16;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGSYS: i32 = 27;

/// Highest signal number.
pub const SIGMAX: usize = 64;

fn sig_bit(sig: i32) -> u64 {
    1u64 << (sig - 1)
}

fn valid_signal(sig: i32) -> bool {
    (1..=SIGMAX as i32).contains(&sig)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        const SIGINFO   = 1 << 0;
        const ONSTACK   = 1 << 1;
        const RESETHAND = 1 << 2;
        const NODEFER   = 1 << 3;
        const NOCLDWAIT = 1 << 4;
        const NOCLDSTOP = 1 << 5;
    }
}

/// What a signal does when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigDisposition {
    #[default]
    Default,
    Ignore,
    /// User handler: entry point plus the libc restorer the pushed
    /// return address points at.
    Handler { entry: u64, trampoline: u64 },
}

/// One per-process `sigaction` slot plus the ephemeral sender info
/// filled at send time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SigAction {
    pub disposition: SigDisposition,
    pub flags: SaFlags,
    pub sender_tid: u64,
    pub fault_addr: u64,
    pub status: i32,
    pub sigcode: i32,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            disposition: SigDisposition::Default,
            flags: SaFlags::empty(),
            sender_tid: 0,
            fault_addr: 0,
            status: 0,
            sigcode: 0,
        }
    }
}

/// Fixed per-signal default actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Ignore,
    Terminate,
    Stop,
    Continue,
}

pub fn default_action(sig: i32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

/// Alternate signal stack (`sigaltstack`).
#[derive(Debug, Clone, Copy)]
pub struct AltStack {
    pub base: u64,
    pub size: usize,
}

/// Per-thread signal state.
pub struct SignalHeader {
    pending: AtomicU64,
    mask: AtomicU64,
    alt_stack: Mutex<Option<AltStack>>,
    /// Fires whenever a signal becomes deliverable; `sigsuspend` parks
    /// here.
    pub event: Event,
}

impl SignalHeader {
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            mask: AtomicU64::new(0),
            alt_stack: Mutex::new(None),
            event: Event::new(EventKind::Notification),
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn mask(&self) -> u64 {
        self.mask.load(Ordering::Acquire)
    }

    fn deliverable(&self) -> u64 {
        self.pending() & !self.mask()
    }

    /// Lowest deliverable signal, without consuming it.
    pub fn next_deliverable(&self) -> Option<i32> {
        let bits = self.deliverable();
        if bits == 0 {
            None
        } else {
            Some(bits.trailing_zeros() as i32 + 1)
        }
    }

    fn take(&self, sig: i32) {
        self.pending.fetch_and(!sig_bit(sig), Ordering::AcqRel);
    }

    pub fn alt_stack(&self) -> Option<AltStack> {
        *self.alt_stack.lock()
    }
}

impl Default for SignalHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Kick a thread out of a blocking wait with an abort indication.
pub fn interrupt_blocked_thread(thread: &Arc<Thread>) -> KernelResult<()> {
    if thread.state() != ThreadState::Blocked {
        return Ok(());
    }
    thread.interrupted.store(true, Ordering::Release);
    thread.signal_interrupted.store(true, Ordering::Release);
    sched::ready_thread(thread, false)
}

/// Post `sig` to one thread. Unmasked signals wake the target from a
/// blocking wait, which then returns `Aborted`.
pub fn kill_thread(thread: &Arc<Thread>, sig: i32) -> KernelResult<()> {
    if !valid_signal(sig) {
        return Err(KernelError::InvalidArgument);
    }
    thread
        .signals
        .pending
        .fetch_or(sig_bit(sig), Ordering::AcqRel);
    if thread.signals.mask() & sig_bit(sig) == 0 {
        let _ = thread.signals.event.set(false);
        interrupt_blocked_thread(thread)?;
    }
    Ok(())
}

/// Post `sig` to a process: any thread that does not mask the signal
/// receives it; if every thread masks it, the first thread holds it
/// pending.
pub fn kill_process(proc: &Arc<Process>, sig: i32) -> KernelResult<()> {
    if !valid_signal(sig) {
        return Err(KernelError::InvalidArgument);
    }
    let threads = proc.threads.lock();
    let target = threads
        .iter()
        .find(|t| t.signals.mask() & sig_bit(sig) == 0 && t.is_alive())
        .or_else(|| threads.first())
        .cloned();
    drop(threads);
    match target {
        Some(thread) => kill_thread(&thread, sig),
        None => Ok(()),
    }
}

/// Post `sig` to every member of a process group.
pub fn kill_process_group(group: &Arc<ProcessGroup>, sig: i32) -> KernelResult<()> {
    if !valid_signal(sig) {
        return Err(KernelError::InvalidArgument);
    }
    group.each_member(|proc| {
        let _ = kill_process(proc, sig);
    });
    Ok(())
}

/// SIGSEGV from the fault handler, aimed at the faulting thread.
pub fn post_segv(fault_addr: usize) {
    if let Some(thread) = sched::current_thread() {
        if let Some(proc) = thread.process() {
            if let Some(slot) = proc.actions.lock().get_mut(SIGSEGV as usize) {
                slot.fault_addr = fault_addr as u64;
            }
        }
        let _ = kill_thread(&thread, SIGSEGV);
    }
}

/// How `sig_proc_mask` edits the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

/// Edit a thread's signal mask, returning the previous one. SIGKILL and
/// SIGSTOP can never be masked.
pub fn sig_proc_mask(thread: &Arc<Thread>, how: MaskHow, mask: Option<u64>) -> u64 {
    let old = thread.signals.mask();
    if let Some(m) = mask {
        let m = m & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
        let new = match how {
            MaskHow::Block => old | m,
            MaskHow::Unblock => old & !m,
            MaskHow::SetMask => m,
        };
        thread.signals.mask.store(new, Ordering::Release);
        if thread.signals.deliverable() != 0 {
            let _ = thread.signals.event.set(false);
        }
    }
    old
}

/// Install a new action for `sig`, returning the old one. The
/// dispositions of SIGKILL and SIGSTOP are fixed.
pub fn sig_action(
    proc: &Arc<Process>,
    sig: i32,
    new: Option<SigAction>,
) -> KernelResult<SigAction> {
    if !valid_signal(sig) || sig == SIGKILL || sig == SIGSTOP {
        return Err(KernelError::InvalidArgument);
    }
    let mut actions = proc.actions.lock();
    let old = actions[sig as usize];
    if let Some(act) = new {
        actions[sig as usize] = act;
    }
    Ok(old)
}

/// Install or query the alternate stack.
pub fn sig_alt_stack(thread: &Arc<Thread>, new: Option<AltStack>) -> Option<AltStack> {
    let mut slot = thread.signals.alt_stack.lock();
    let old = *slot;
    if new.is_some() {
        *slot = new;
    }
    old
}

/// Atomically swap the mask and wait until a signal is deliverable.
pub fn sig_suspend(thread: &Arc<Thread>, temp_mask: u64) -> KernelResult<()> {
    let old = sig_proc_mask(thread, MaskHow::SetMask, Some(temp_mask));
    let result = loop {
        if thread.signals.deliverable() != 0 {
            break Ok(());
        }
        thread.signals.event.clear();
        if thread.signals.deliverable() != 0 {
            break Ok(());
        }
        match thread.signals.event.wait() {
            Ok(()) => continue,
            Err(KernelError::Aborted) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    sig_proc_mask(thread, MaskHow::SetMask, Some(old));
    result
}

/// The frame pushed onto the user stack for a handler invocation:
/// `ucontext` (saved register file plus the prior mask) and the
/// `siginfo` payload.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct SignalFrame {
    pub prior_mask: u64,
    pub info: SigInfo,
    pub ctx: CpuContext,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub signum: i32,
    pub sigcode: i32,
    pub sender_tid: u64,
    pub fault_addr: u64,
    pub status: i32,
}

fn as_bytes<T>(v: &T) -> &[u8] {
    // SAFETY: reading a repr(C) struct as raw bytes for the user copy.
    unsafe { core::slice::from_raw_parts(v as *const T as *const u8, core::mem::size_of::<T>()) }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing deliverable.
    None,
    /// Default/ignore action applied in kernel, no user frame.
    DefaultApplied,
    /// A handler frame was built; `frame` now enters the handler.
    HandlerEntered,
}

/// Deliver the lowest pending unmasked signal at interrupt return.
///
/// `frame` is the interrupted user context; on handler entry it is
/// rewritten to start the handler with the trampoline as its return
/// address.
pub fn deliver_pending(thread: &Arc<Thread>, frame: &mut CpuContext) -> KernelResult<Delivery> {
    let sig = match thread.signals.next_deliverable() {
        Some(s) => s,
        None => return Ok(Delivery::None),
    };
    thread.signals.take(sig);

    let proc = match thread.process() {
        Some(p) => p,
        None => return Ok(Delivery::DefaultApplied),
    };
    let action = *proc
        .actions
        .lock()
        .get(sig as usize)
        .unwrap_or(&SigAction::default());

    let (entry, trampoline) = match action.disposition {
        SigDisposition::Ignore => return Ok(Delivery::DefaultApplied),
        SigDisposition::Default => {
            match default_action(sig) {
                DefaultAction::Ignore | DefaultAction::Continue => {}
                DefaultAction::Terminate => {
                    proc.exit(128 + sig);
                }
                DefaultAction::Stop => {
                    sched::with_scheduler(|s| s.block(thread));
                }
            }
            return Ok(Delivery::DefaultApplied);
        }
        SigDisposition::Handler { entry, trampoline } => (entry, trampoline),
    };

    // Pick the stack: alternate if requested and configured, else the
    // interrupted stack.
    let alt = thread.signals.alt_stack();
    let mut sp = match (action.flags.contains(SaFlags::ONSTACK), alt) {
        (true, Some(stack)) => stack.base + stack.size as u64,
        _ => frame.sp,
    };

    let sigframe = SignalFrame {
        prior_mask: thread.signals.mask(),
        info: SigInfo {
            signum: sig,
            sigcode: action.sigcode,
            sender_tid: action.sender_tid,
            fault_addr: action.fault_addr,
            status: action.status,
        },
        ctx: frame.clone(),
    };
    sp -= core::mem::size_of::<SignalFrame>() as u64;
    sp &= !0xf;
    let frame_ptr = sp;
    user_access::copy_to_user(&proc.space, VirtAddr::new(frame_ptr), as_bytes(&sigframe))?;

    // Return address: the libc restorer that calls sigreturn.
    sp -= 8;
    user_access::copy_to_user(&proc.space, VirtAddr::new(sp), &trampoline.to_ne_bytes())?;

    frame.ip = entry;
    frame.sp = sp;
    frame.gpr[0] = sig as u64;
    if action.flags.contains(SaFlags::SIGINFO) {
        frame.gpr[1] = frame_ptr + 8; // &SignalFrame.info
        frame.gpr[2] = frame_ptr; // ucontext
    } else {
        frame.gpr[1] = 0;
        frame.gpr[2] = frame_ptr;
    }

    if !action.flags.contains(SaFlags::NODEFER) {
        thread
            .signals
            .mask
            .fetch_or(sig_bit(sig), Ordering::AcqRel);
    }
    if action.flags.contains(SaFlags::RESETHAND) {
        let mut actions = proc.actions.lock();
        actions[sig as usize].disposition = SigDisposition::Default;
    }
    Ok(Delivery::HandlerEntered)
}

/// Restore the context saved by [`deliver_pending`]; called by the
/// trampoline when the user handler returns.
pub fn sigreturn(
    thread: &Arc<Thread>,
    uctx_user: VirtAddr,
    frame: &mut CpuContext,
) -> KernelResult<()> {
    let proc = thread.process().ok_or(KernelError::InvalidOperation)?;
    let mut restored = SignalFrame::default();
    let size = core::mem::size_of::<SignalFrame>();
    // SAFETY: writing into a repr(C) struct from the validated user copy.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut restored as *mut SignalFrame as *mut u8, size)
    };
    user_access::copy_from_user(&proc.space, uctx_user, bytes)?;
    thread
        .signals
        .mask
        .store(restored.prior_mask, Ordering::Release);
    *frame = restored.ctx;
    thread.signals.event.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::mm::page_range::{AllocFlags, Protection};
    use crate::sched::Priority;
    use alloc::string::String;

    fn process_with_thread() -> (Arc<Process>, Arc<Thread>) {
        let proc = Process::new(String::from("sig-test"), user_space(32));
        let thread = Thread::new(None, Priority::Normal, u64::MAX);
        proc.adopt_thread(&thread);
        sched::adopt(&thread);
        (proc, thread)
    }

    #[test]
    fn masked_signal_stays_pending_and_undelivered() {
        let (_proc, thread) = process_with_thread();
        sig_proc_mask(&thread, MaskHow::Block, Some(sig_bit(SIGUSR1)));
        kill_thread(&thread, SIGUSR1).unwrap();
        assert_ne!(thread.signals.pending() & sig_bit(SIGUSR1), 0);
        let mut frame = CpuContext::default();
        assert_eq!(
            deliver_pending(&thread, &mut frame).unwrap(),
            Delivery::None
        );
        // Unmask: now it delivers (default action for USR1 terminates).
        sig_proc_mask(&thread, MaskHow::Unblock, Some(sig_bit(SIGUSR1)));
        assert_eq!(thread.signals.next_deliverable(), Some(SIGUSR1));
    }

    #[test]
    fn handler_frame_is_built_on_the_user_stack() {
        let (proc, thread) = process_with_thread();
        let stack = proc
            .space
            .alloc(
                None,
                4 * crate::mm::PAGE_SIZE,
                Protection::empty(),
                AllocFlags::PREFAULT,
                None,
            )
            .unwrap();
        let stack_top = stack.as_u64() + 4 * crate::mm::PAGE_SIZE as u64;

        sig_action(
            &proc,
            SIGUSR2,
            Some(SigAction {
                disposition: SigDisposition::Handler {
                    entry: 0xDEAD_BEE0,
                    trampoline: 0x7777_0000,
                },
                flags: SaFlags::SIGINFO,
                ..Default::default()
            }),
        )
        .unwrap();
        kill_thread(&thread, SIGUSR2).unwrap();

        let mut frame = CpuContext {
            ip: 0x4000_1234,
            sp: stack_top,
            ..Default::default()
        };
        let outcome = deliver_pending(&thread, &mut frame).unwrap();
        assert_eq!(outcome, Delivery::HandlerEntered);
        assert_eq!(frame.ip, 0xDEAD_BEE0);
        assert!(frame.sp < stack_top);
        assert_eq!(frame.gpr[0], SIGUSR2 as u64);
        // The signal is now masked until sigreturn (no SA_NODEFER).
        assert_ne!(thread.signals.mask() & sig_bit(SIGUSR2), 0);

        // The saved context on the user stack round-trips via sigreturn.
        let uctx = VirtAddr::new(frame.gpr[2]);
        let mut restored = CpuContext::default();
        sigreturn(&thread, uctx, &mut restored).unwrap();
        assert_eq!(restored.ip, 0x4000_1234);
        assert_eq!(restored.sp, stack_top);
        assert_eq!(thread.signals.mask() & sig_bit(SIGUSR2), 0);
    }

    #[test]
    fn resethand_restores_default_disposition() {
        let (proc, thread) = process_with_thread();
        let stack = proc
            .space
            .alloc(
                None,
                crate::mm::PAGE_SIZE,
                Protection::empty(),
                AllocFlags::PREFAULT,
                None,
            )
            .unwrap();
        sig_action(
            &proc,
            SIGHUP,
            Some(SigAction {
                disposition: SigDisposition::Handler {
                    entry: 0x1000,
                    trampoline: 0x2000,
                },
                flags: SaFlags::RESETHAND,
                ..Default::default()
            }),
        )
        .unwrap();
        kill_thread(&thread, SIGHUP).unwrap();
        let mut frame = CpuContext {
            sp: stack.as_u64() + crate::mm::PAGE_SIZE as u64,
            ..Default::default()
        };
        deliver_pending(&thread, &mut frame).unwrap();
        assert_eq!(
            proc.actions.lock()[SIGHUP as usize].disposition,
            SigDisposition::Default
        );
    }

    #[test]
    fn sigkill_and_sigstop_cannot_be_masked_or_handled() {
        let (proc, thread) = process_with_thread();
        sig_proc_mask(&thread, MaskHow::Block, Some(sig_bit(SIGKILL)));
        assert_eq!(thread.signals.mask() & sig_bit(SIGKILL), 0);
        assert_eq!(
            sig_action(&proc, SIGKILL, Some(SigAction::default())),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn default_terminate_kills_the_process() {
        let (proc, thread) = process_with_thread();
        kill_thread(&thread, SIGTERM).unwrap();
        let mut frame = CpuContext::default();
        deliver_pending(&thread, &mut frame).unwrap();
        assert!(proc.is_dead());
        assert_eq!(proc.exit_status(), 128 + SIGTERM);
    }

    #[test]
    fn kill_process_prefers_an_unmasking_thread() {
        let (proc, t1) = process_with_thread();
        let t2 = Thread::new(None, Priority::Normal, u64::MAX);
        proc.adopt_thread(&t2);
        sig_proc_mask(&t1, MaskHow::Block, Some(sig_bit(SIGUSR1)));
        kill_process(&proc, SIGUSR1).unwrap();
        assert_eq!(t1.signals.pending() & sig_bit(SIGUSR1), 0);
        assert_ne!(t2.signals.pending() & sig_bit(SIGUSR1), 0);
    }
}
