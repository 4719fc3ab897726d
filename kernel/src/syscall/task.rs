//! Thread, process, signal and futex system calls.

use alloc::{string::String, sync::Arc, vec};

use crate::error::{KernelError, KernelResult};
use crate::fs::{self, OpenFlags};
use crate::mm::VirtAddr;
use crate::process::{HandleType, KernelObject, Process};
use crate::sched::{self, Priority, Thread};
use crate::signal::{self, AltStack, MaskHow, SaFlags, SigAction, SigDisposition};
use crate::sync::{futex_wait, futex_wake};

use super::{SyscallArgs, SyscallContext};

fn thread_from(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<Thread>> {
    match ctx.lookup(handle as u32, HandleType::Thread)? {
        KernelObject::Thread(t) => Ok(t),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn process_from(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<Process>> {
    match ctx.lookup(handle as u32, HandleType::Process)? {
        KernelObject::Process(p) => Ok(p),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_yield(_ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    sched::yield_now();
    Ok(0)
}

/// `(entry, stack_top, priority)` -> thread handle. The thread starts
/// only after `ThreadReady`.
pub fn sys_thread_create(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let priority =
        Priority::from_index(args[2] as u8).ok_or(KernelError::InvalidArgument)?;
    let thread = Thread::new(None, priority, u64::MAX);
    {
        let mut context = thread.context.lock();
        context.ip = args[0] as u64;
        context.sp = args[1] as u64;
    }
    ctx.process.adopt_thread(&thread);
    let handle = ctx.process.handles.allocate(KernelObject::Thread(thread));
    Ok(handle as usize)
}

pub fn sys_thread_ready(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let thread = thread_from(ctx, args[0])?;
    sched::ready_thread(&thread, false)?;
    Ok(0)
}

pub fn sys_thread_block(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let thread = thread_from(ctx, args[0])?;
    if Arc::ptr_eq(&thread, &ctx.thread) {
        sched::block_current()?;
    } else {
        sched::with_scheduler(|s| s.block(&thread));
    }
    Ok(0)
}

pub fn sys_thread_priority(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let thread = thread_from(ctx, args[0])?;
    let priority =
        Priority::from_index(args[1] as u8).ok_or(KernelError::InvalidArgument)?;
    sched::with_scheduler(|s| {
        s.dequeue(&thread);
        thread.set_priority(priority);
        if thread.state() == crate::sched::ThreadState::Ready {
            s.enqueue(&thread)
        } else {
            Ok(())
        }
    })?;
    Ok(0)
}

pub fn sys_thread_affinity(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let thread = thread_from(ctx, args[0])?;
    sched::with_scheduler(|s| s.set_affinity(&thread, args[1] as u64))?;
    Ok(0)
}

pub fn sys_thread_get_tid(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    Ok(ctx.thread.tid.0 as usize)
}

pub fn sys_exit_thread(_ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    sched::exit_current();
    Ok(0)
}

/// Minimal ELF exec: map the PT_LOAD segments into a fresh process's
/// space and record the entry point in its first thread.
fn load_user_image(proc: &Arc<Process>, image: &[u8]) -> KernelResult<u64> {
    use crate::driver::loader::{Elf64Header, Elf64ProgramHeader};
    use crate::mm::page_range::{AllocFlags, Protection};

    if image.len() < core::mem::size_of::<Elf64Header>() {
        return Err(KernelError::InvalidFile);
    }
    // SAFETY: bounds checked; the header is plain repr(C) data.
    let ehdr =
        unsafe { core::ptr::read_unaligned(image.as_ptr() as *const Elf64Header) };
    if &ehdr.magic != b"\x7fELF" {
        return Err(KernelError::InvalidFile);
    }
    for i in 0..ehdr.phnum as usize {
        let off = ehdr.phoff as usize + i * ehdr.phentsize as usize;
        if off + core::mem::size_of::<Elf64ProgramHeader>() > image.len() {
            return Err(KernelError::InvalidFile);
        }
        // SAFETY: bounds checked above.
        let ph = unsafe {
            core::ptr::read_unaligned(image.as_ptr().add(off) as *const Elf64ProgramHeader)
        };
        if ph.p_type != 1 {
            continue;
        }
        if ph.offset as usize + ph.filesz as usize > image.len() {
            return Err(KernelError::InvalidFile);
        }
        let seg_base = VirtAddr::new(ph.vaddr).page_base();
        let span = (ph.vaddr - seg_base.as_u64()) as usize + ph.memsz as usize;
        proc.space.alloc(
            Some(seg_base),
            span,
            Protection::EXEC,
            AllocFlags::PREFAULT,
            None,
        )?;
        crate::mm::user_access::copy_to_user(
            &proc.space,
            VirtAddr::new(ph.vaddr),
            &image[ph.offset as usize..(ph.offset + ph.filesz) as usize],
        )?;
    }
    Ok(ehdr.entry)
}

/// Launch a program: resolve the image, verify exec permission, build a
/// process with one ready thread.
pub fn spawn_process(path: &str, creds: &crate::process::Credentials) -> KernelResult<Arc<Process>> {
    let file = fs::fd::open(path, OpenFlags::READ | OpenFlags::EXEC, creds)?;
    let size = file.vnode.len() as usize;
    let mut image = vec![0u8; size];
    file.read_at(0, &mut image)?;

    let space = crate::mm::AddressSpace::new_user(crate::mm::pmm::global_pool())?;
    let proc = Process::new(String::from(path), space);
    let entry = load_user_image(&proc, &image)?;

    let thread = Thread::new(Some(String::from(path)), Priority::Normal, u64::MAX);
    {
        let mut context = thread.context.lock();
        context.ip = entry;
    }
    proc.adopt_thread(&thread);
    sched::ready_thread(&thread, false)?;
    Ok(proc)
}

pub fn sys_process_start(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let creds = ctx.process.creds.lock().clone();
    let child = spawn_process(&path, &creds)?;
    ctx.process.adopt_child(&child);
    let handle = ctx.process.handles.allocate(KernelObject::Process(child));
    Ok(handle as usize)
}

pub fn sys_process_open(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let proc = Process::by_pid(crate::process::ProcessId(args[0] as u64))
        .ok_or(KernelError::NotFound)?;
    let handle = ctx.process.handles.allocate(KernelObject::Process(proc));
    Ok(handle as usize)
}

pub fn sys_wait_process(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let proc = process_from(ctx, args[0])?;
    let status = proc.wait_for_exit()?;
    Ok(status as u32 as usize)
}

pub fn sys_exit_process(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    ctx.process.exit(args[0] as i32);
    sched::exit_current();
    Ok(0)
}

pub fn sys_fork(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    let child = ctx.process.fork()?;
    // The child's first thread resumes from the caller's context; the
    // return-value register distinguishes the two sides.
    let thread = Thread::new(None, ctx.thread.priority(), u64::MAX);
    {
        let mut context = thread.context.lock();
        *context = ctx.thread.context.lock().clone();
        context.gpr[14] = 0; // child sees zero
    }
    child.adopt_thread(&thread);
    sched::ready_thread(&thread, false)?;
    // The parent gets the child's pid; a process handle comes from
    // `ProcessOpen` when the caller wants one.
    Ok(child.pid.0 as usize)
}

pub fn sys_futex_wait(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    futex_wait(
        ctx.process.space.root,
        VirtAddr::new(args[0] as u64),
        args[1] as u32,
    )?;
    Ok(0)
}

pub fn sys_futex_wake(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    futex_wake(
        ctx.process.space.root,
        VirtAddr::new(args[0] as u64),
        args[1],
    )?;
    Ok(0)
}

pub fn sys_kill(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let thread = thread_from(ctx, args[0])?;
    signal::kill_thread(&thread, args[1] as i32)?;
    Ok(0)
}

pub fn sys_kill_process(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let proc = process_from(ctx, args[0])?;
    signal::kill_process(&proc, args[1] as i32)?;
    Ok(0)
}

/// User-visible sigaction layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SigActionUser {
    pub handler: u64,
    pub trampoline: u64,
    pub flags: u32,
}

const SIG_DFL: u64 = 0;
const SIG_IGN: u64 = 1;

pub fn sys_sig_action(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sig = args[0] as i32;
    let new = if args[1] != 0 {
        let user: SigActionUser = ctx.read_user(args[1])?;
        let disposition = match user.handler {
            SIG_DFL => SigDisposition::Default,
            SIG_IGN => SigDisposition::Ignore,
            entry => SigDisposition::Handler {
                entry,
                trampoline: user.trampoline,
            },
        };
        Some(SigAction {
            disposition,
            flags: SaFlags::from_bits_truncate(user.flags),
            ..Default::default()
        })
    } else {
        None
    };
    let old = signal::sig_action(&ctx.process, sig, new)?;
    if args[2] != 0 {
        let out = SigActionUser {
            handler: match old.disposition {
                SigDisposition::Default => SIG_DFL,
                SigDisposition::Ignore => SIG_IGN,
                SigDisposition::Handler { entry, .. } => entry,
            },
            trampoline: match old.disposition {
                SigDisposition::Handler { trampoline, .. } => trampoline,
                _ => 0,
            },
            flags: old.flags.bits(),
        };
        ctx.write_user(args[2], &out)?;
    }
    Ok(0)
}

pub fn sys_sig_proc_mask(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let how = match args[0] {
        0 => MaskHow::Block,
        1 => MaskHow::SetMask,
        2 => MaskHow::Unblock,
        _ => return Err(KernelError::InvalidArgument),
    };
    let mask = if args[1] != 0 {
        Some(ctx.read_user::<u64>(args[1])?)
    } else {
        None
    };
    let old = signal::sig_proc_mask(&ctx.thread, how, mask);
    if args[2] != 0 {
        ctx.write_user(args[2], &old)?;
    }
    Ok(0)
}

pub fn sys_sig_suspend(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    signal::sig_suspend(&ctx.thread, args[0] as u64)?;
    Ok(0)
}

/// User-visible `stack_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StackUser {
    pub sp: u64,
    pub flags: u32,
    pub size: u64,
}

pub fn sys_sig_alt_stack(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let new = if args[0] != 0 {
        let user: StackUser = ctx.read_user(args[0])?;
        Some(AltStack {
            base: user.sp,
            size: user.size as usize,
        })
    } else {
        None
    };
    let old = signal::sig_alt_stack(&ctx.thread, new);
    if args[1] != 0 {
        let out = old
            .map(|s| StackUser {
                sp: s.base,
                flags: 0,
                size: s.size as u64,
            })
            .unwrap_or_default();
        ctx.write_user(args[1], &out)?;
    }
    Ok(0)
}

pub fn sys_sig_pending(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let pending = ctx.thread.signals.pending();
    ctx.write_user(args[0], &pending)?;
    Ok(0)
}

pub fn sys_sig_return(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let mut frame = ctx.thread.context.lock().clone();
    signal::sigreturn(&ctx.thread, VirtAddr::new(args[0] as u64), &mut frame)?;
    *ctx.thread.context.lock() = frame;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{dispatch, Syscall};
    use super::*;

    #[test]
    fn thread_create_and_ready() {
        let (proc, _t) = calling_process();
        let h = dispatch(Syscall::ThreadCreate as usize, [0x1000, 0x2000, 2, 0, 0]);
        assert!(h >= 0);
        assert_eq!(proc.threads.lock().len(), 2);
        assert_eq!(dispatch(Syscall::ThreadReady as usize, [h as usize, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn sig_mask_round_trips_through_user_memory() {
        let (proc, _t) = calling_process();
        let mask_ptr = user_buffer(&proc, 8);
        let old_ptr = user_buffer(&proc, 8);
        let mask: u64 = 1 << 9; // SIGUSR1
        crate::mm::user_access::copy_to_user(
            &proc.space,
            VirtAddr::new(mask_ptr as u64),
            &mask.to_ne_bytes(),
        )
        .unwrap();
        assert_eq!(
            dispatch(Syscall::SigProcMask as usize, [0, mask_ptr, old_ptr, 0, 0]),
            0
        );
        let mut old = [0u8; 8];
        crate::mm::user_access::copy_from_user(
            &proc.space,
            VirtAddr::new(old_ptr as u64),
            &mut old,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(old), 0);
    }

    #[test]
    fn invalid_priority_is_rejected() {
        let (_p, _t) = calling_process();
        let status = dispatch(Syscall::ThreadCreate as usize, [0, 0, 99, 0, 0]);
        assert_eq!(status, KernelError::InvalidArgument.as_status());
    }
}
