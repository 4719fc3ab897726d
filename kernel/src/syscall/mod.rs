//! System-call dispatch.
//!
//! A fixed table maps numbers to `(argc, handler)` entries. Arguments
//! arrive in up to five registers; every user pointer goes through the
//! user-memory view helpers, which report `PageFault` for bad buffers.
//! The returned status word is zero-or-positive on success and a
//! negative [`KernelError::as_status`] code on failure.

mod files;
mod memory;
mod net;
mod system;
mod task;

pub use task::spawn_process;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::mm::{user_access, VirtAddr};
use crate::process::{HandleType, KernelObject, Process, RawHandle, HANDLE_CURRENT};
use crate::sched::Thread;

/// Caller identity handed to every handler.
pub struct SyscallContext {
    pub thread: Arc<Thread>,
    pub process: Arc<Process>,
}

pub type SyscallArgs = [usize; 5];
pub type SyscallFn = fn(&SyscallContext, &SyscallArgs) -> KernelResult<usize>;

/// Numbered system calls.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Yield = 0,
    ThreadCreate = 1,
    ThreadReady = 2,
    ThreadBlock = 3,
    ThreadPriority = 4,
    ThreadAffinity = 5,
    ThreadGetTid = 6,
    ExitCurrentThread = 7,
    ProcessStart = 8,
    ProcessOpen = 9,
    WaitProcess = 10,
    ExitCurrentProcess = 11,
    Fork = 12,
    FutexWait = 13,
    FutexWake = 14,
    VirtualMemoryAlloc = 15,
    VirtualMemoryFree = 16,
    VirtualMemoryProtect = 17,
    VirtualMemoryLock = 18,
    VirtualMemoryUnlock = 19,
    MakeNewContext = 20,
    ContextGetStat = 21,
    QueryPageInfo = 22,
    FdOpen = 23,
    FdRead = 24,
    FdWrite = 25,
    FdPRead = 26,
    FdPWrite = 27,
    FdSeek = 28,
    FdTellOff = 29,
    FdEof = 30,
    FdIoctl = 31,
    FdFlush = 32,
    FdClose = 33,
    Stat = 34,
    Mkdir = 35,
    UnlinkAt = 36,
    IrpCreate = 37,
    IrpSubmit = 38,
    IrpWait = 39,
    IrpQueryState = 40,
    IrpGetBuffer = 41,
    IrpGetStatus = 42,
    Kill = 43,
    KillProcess = 44,
    SigAction = 45,
    SigProcMask = 46,
    SigSuspend = 47,
    SigAltStack = 48,
    SigPending = 49,
    SigReturn = 50,
    Socket = 51,
    Bind = 52,
    Connect = 53,
    Listen = 54,
    Accept = 55,
    SendTo = 56,
    RecvFrom = 57,
    Shutdown = 58,
    GetSockOpt = 59,
    SetSockOpt = 60,
    SockName = 61,
    PeerName = 62,
    ClockGet = 63,
    Reboot = 64,
    PowerOff = 65,
    Suspend = 66,
    LoadDriver = 67,
    StartDriver = 68,
    UnloadDriver = 69,
    FindDriverByName = 70,
    QueryDriverName = 71,
    Mount = 72,
    Unmount = 73,
    Chdir = 74,
    GetCwd = 75,
    ReadEntries = 76,
    CreatePipe = 77,
    Fcntl = 78,
    PPoll = 79,
    PSelect = 80,
}

pub struct SyscallEntry {
    pub argc: u8,
    pub handler: SyscallFn,
}

fn entry_for(num: usize) -> Option<SyscallEntry> {
    use Syscall as S;
    let (argc, handler): (u8, SyscallFn) = match num {
        n if n == S::Yield as usize => (0, task::sys_yield),
        n if n == S::ThreadCreate as usize => (3, task::sys_thread_create),
        n if n == S::ThreadReady as usize => (1, task::sys_thread_ready),
        n if n == S::ThreadBlock as usize => (1, task::sys_thread_block),
        n if n == S::ThreadPriority as usize => (2, task::sys_thread_priority),
        n if n == S::ThreadAffinity as usize => (2, task::sys_thread_affinity),
        n if n == S::ThreadGetTid as usize => (0, task::sys_thread_get_tid),
        n if n == S::ExitCurrentThread as usize => (0, task::sys_exit_thread),
        n if n == S::ProcessStart as usize => (2, task::sys_process_start),
        n if n == S::ProcessOpen as usize => (1, task::sys_process_open),
        n if n == S::WaitProcess as usize => (1, task::sys_wait_process),
        n if n == S::ExitCurrentProcess as usize => (1, task::sys_exit_process),
        n if n == S::Fork as usize => (0, task::sys_fork),
        n if n == S::FutexWait as usize => (3, task::sys_futex_wait),
        n if n == S::FutexWake as usize => (2, task::sys_futex_wake),
        n if n == S::VirtualMemoryAlloc as usize => (4, memory::sys_vm_alloc),
        n if n == S::VirtualMemoryFree as usize => (1, memory::sys_vm_free),
        n if n == S::VirtualMemoryProtect as usize => (4, memory::sys_vm_protect),
        n if n == S::VirtualMemoryLock as usize => (2, memory::sys_vm_lock),
        n if n == S::VirtualMemoryUnlock as usize => (2, memory::sys_vm_unlock),
        n if n == S::MakeNewContext as usize => (0, memory::sys_make_context),
        n if n == S::ContextGetStat as usize => (2, memory::sys_context_stat),
        n if n == S::QueryPageInfo as usize => (3, memory::sys_query_page),
        n if n == S::FdOpen as usize => (2, files::sys_fd_open),
        n if n == S::FdRead as usize => (3, files::sys_fd_read),
        n if n == S::FdWrite as usize => (3, files::sys_fd_write),
        n if n == S::FdPRead as usize => (4, files::sys_fd_pread),
        n if n == S::FdPWrite as usize => (4, files::sys_fd_pwrite),
        n if n == S::FdSeek as usize => (3, files::sys_fd_seek),
        n if n == S::FdTellOff as usize => (1, files::sys_fd_tell),
        n if n == S::FdEof as usize => (1, files::sys_fd_eof),
        n if n == S::FdIoctl as usize => (3, files::sys_fd_ioctl),
        n if n == S::FdFlush as usize => (1, files::sys_fd_flush),
        n if n == S::FdClose as usize => (1, files::sys_fd_close),
        n if n == S::Stat as usize => (2, files::sys_stat),
        n if n == S::Mkdir as usize => (2, files::sys_mkdir),
        n if n == S::UnlinkAt as usize => (1, files::sys_unlink),
        n if n == S::IrpCreate as usize => (4, files::sys_irp_create),
        n if n == S::IrpSubmit as usize => (1, files::sys_irp_submit),
        n if n == S::IrpWait as usize => (1, files::sys_irp_wait),
        n if n == S::IrpQueryState as usize => (1, files::sys_irp_query_state),
        n if n == S::IrpGetBuffer as usize => (3, files::sys_irp_get_buffer),
        n if n == S::IrpGetStatus as usize => (1, files::sys_irp_get_status),
        n if n == S::Kill as usize => (2, task::sys_kill),
        n if n == S::KillProcess as usize => (2, task::sys_kill_process),
        n if n == S::SigAction as usize => (3, task::sys_sig_action),
        n if n == S::SigProcMask as usize => (3, task::sys_sig_proc_mask),
        n if n == S::SigSuspend as usize => (1, task::sys_sig_suspend),
        n if n == S::SigAltStack as usize => (2, task::sys_sig_alt_stack),
        n if n == S::SigPending as usize => (1, task::sys_sig_pending),
        n if n == S::SigReturn as usize => (1, task::sys_sig_return),
        n if n == S::Socket as usize => (2, net::sys_socket),
        n if n == S::Bind as usize => (2, net::sys_bind),
        n if n == S::Connect as usize => (2, net::sys_connect),
        n if n == S::Listen as usize => (2, net::sys_listen),
        n if n == S::Accept as usize => (1, net::sys_accept),
        n if n == S::SendTo as usize => (4, net::sys_send_to),
        n if n == S::RecvFrom as usize => (4, net::sys_recv_from),
        n if n == S::Shutdown as usize => (2, net::sys_shutdown),
        n if n == S::GetSockOpt as usize => (3, net::sys_getsockopt),
        n if n == S::SetSockOpt as usize => (4, net::sys_setsockopt),
        n if n == S::SockName as usize => (2, net::sys_sockname),
        n if n == S::PeerName as usize => (2, net::sys_peername),
        n if n == S::ClockGet as usize => (0, system::sys_clock_get),
        n if n == S::Reboot as usize => (0, system::sys_reboot),
        n if n == S::PowerOff as usize => (0, system::sys_poweroff),
        n if n == S::Suspend as usize => (0, system::sys_suspend),
        n if n == S::LoadDriver as usize => (2, system::sys_load_driver),
        n if n == S::StartDriver as usize => (1, system::sys_start_driver),
        n if n == S::UnloadDriver as usize => (1, system::sys_unload_driver),
        n if n == S::FindDriverByName as usize => (1, system::sys_find_driver),
        n if n == S::QueryDriverName as usize => (3, system::sys_query_driver_name),
        n if n == S::Mount as usize => (2, files::sys_mount),
        n if n == S::Unmount as usize => (1, files::sys_unmount),
        n if n == S::Chdir as usize => (1, files::sys_chdir),
        n if n == S::GetCwd as usize => (2, files::sys_getcwd),
        n if n == S::ReadEntries as usize => (3, files::sys_read_entries),
        n if n == S::CreatePipe as usize => (1, files::sys_create_pipe),
        n if n == S::Fcntl as usize => (3, files::sys_fcntl),
        n if n == S::PPoll as usize => (3, files::sys_ppoll),
        n if n == S::PSelect as usize => (3, files::sys_pselect),
        _ => return None,
    };
    Some(SyscallEntry { argc, handler })
}

/// Dispatch a trap: resolve the caller, run the handler, fold the
/// result into the user status word.
pub fn dispatch(num: usize, args: SyscallArgs) -> isize {
    let entry = match entry_for(num) {
        Some(e) => e,
        None => return KernelError::InvalidArgument.as_status(),
    };
    let thread = match crate::sched::current_thread() {
        Some(t) => t,
        None => return KernelError::InvalidOperation.as_status(),
    };
    let process = match thread.process() {
        Some(p) => p,
        None => return KernelError::InvalidOperation.as_status(),
    };
    let ctx = SyscallContext { thread, process };
    match (entry.handler)(&ctx, &args) {
        Ok(v) => v as isize,
        Err(e) => e.as_status(),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

impl SyscallContext {
    /// Copy a NUL-terminated path out of the caller's address space.
    pub fn user_path(&self, ptr: usize) -> KernelResult<alloc::string::String> {
        user_access::copy_string_from_user(&self.process.space, VirtAddr::new(ptr as u64), 4096)
    }

    pub fn copy_in(&self, ptr: usize, buf: &mut [u8]) -> KernelResult<()> {
        user_access::copy_from_user(&self.process.space, VirtAddr::new(ptr as u64), buf)
    }

    pub fn copy_out(&self, ptr: usize, data: &[u8]) -> KernelResult<()> {
        user_access::copy_to_user(&self.process.space, VirtAddr::new(ptr as u64), data)
    }

    /// Read a plain repr(C) value from user memory.
    pub fn read_user<T: Copy + Default>(&self, ptr: usize) -> KernelResult<T> {
        let mut value = T::default();
        let size = core::mem::size_of::<T>();
        // SAFETY: T is plain repr(C) data read from a validated copy.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(&mut value as *mut T as *mut u8, size)
        };
        self.copy_in(ptr, bytes)?;
        Ok(value)
    }

    /// Write a plain repr(C) value into user memory.
    pub fn write_user<T: Copy>(&self, ptr: usize, value: &T) -> KernelResult<()> {
        let size = core::mem::size_of::<T>();
        // SAFETY: T is plain repr(C) data.
        let bytes =
            unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size) };
        self.copy_out(ptr, bytes)
    }

    /// Look up a handle, honoring `HANDLE_CURRENT` for threads,
    /// processes and address spaces.
    pub fn lookup(&self, handle: RawHandle, ty: HandleType) -> KernelResult<KernelObject> {
        if handle == HANDLE_CURRENT {
            return match ty {
                HandleType::Thread => Ok(KernelObject::Thread(self.thread.clone())),
                HandleType::Process => Ok(KernelObject::Process(self.process.clone())),
                HandleType::Space => Ok(KernelObject::Space(self.process.space.clone())),
                _ => Err(KernelError::InvalidArgument),
            };
        }
        self.process.handles.lookup(handle, ty)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::sched::{self, Priority};

    /// Adopt a thread inside a fresh process; `dispatch` then sees a
    /// full caller identity.
    pub fn calling_process() -> (Arc<Process>, Arc<Thread>) {
        let proc = Process::new(alloc::string::String::from("syscall-test"), user_space(64));
        let thread = Thread::new(None, Priority::Normal, u64::MAX);
        proc.adopt_thread(&thread);
        sched::adopt(&thread);
        (proc, thread)
    }

    /// Allocate user memory in the caller and return its base.
    pub fn user_buffer(proc: &Arc<Process>, len: usize) -> usize {
        use crate::mm::page_range::{AllocFlags, Protection};
        proc.space
            .alloc(
                None,
                len.max(crate::mm::PAGE_SIZE),
                Protection::empty(),
                AllocFlags::PREFAULT,
                None,
            )
            .unwrap()
            .as_usize()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn unknown_number_is_invalid_argument() {
        let (_p, _t) = calling_process();
        assert_eq!(
            dispatch(0xFFFF, [0; 5]),
            KernelError::InvalidArgument.as_status()
        );
    }

    #[test]
    fn yield_succeeds_for_a_full_caller() {
        let (_p, _t) = calling_process();
        assert_eq!(dispatch(Syscall::Yield as usize, [0; 5]), 0);
    }

    #[test]
    fn memory_alloc_free_via_dispatch() {
        let (_p, _t) = calling_process();
        let base = dispatch(
            Syscall::VirtualMemoryAlloc as usize,
            [0, crate::mm::PAGE_SIZE, 0, 0, 0],
        );
        assert!(base > 0);
        assert_eq!(
            dispatch(Syscall::VirtualMemoryFree as usize, [base as usize, 0, 0, 0, 0]),
            0
        );
    }

    #[test]
    fn bad_user_pointer_reports_page_fault() {
        let (_p, _t) = calling_process();
        // FdOpen with a wild path pointer.
        let status = dispatch(Syscall::FdOpen as usize, [0xdead_0000, 0, 0, 0, 0]);
        assert_eq!(status, KernelError::PageFault { addr: 0 }.as_status());
    }

    #[test]
    fn tid_round_trips() {
        let (_p, t) = calling_process();
        let tid = dispatch(Syscall::ThreadGetTid as usize, [0; 5]);
        assert_eq!(tid as u64, t.tid.0);
    }
}
