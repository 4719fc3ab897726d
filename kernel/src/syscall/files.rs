//! File, IRP, mount and pipe system calls.

use alloc::{sync::Arc, vec};

use crate::error::{KernelError, KernelResult};
use crate::fs::{
    self, dirent, fd,
    irp::{self, Irp, IrpOp},
    mount, pipe::Pipe,
    vnode::{Vnode, VnodeKind, VnodePayload},
    File, OpenFlags, SeekFrom,
};
use crate::process::{HandleType, KernelObject};

use super::{SyscallArgs, SyscallContext};

fn file_from(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<File>> {
    match ctx.lookup(handle as u32, HandleType::Fd)? {
        KernelObject::Fd(f) => Ok(f),
        _ => Err(KernelError::InvalidArgument),
    }
}

fn irp_from(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<Irp>> {
    match ctx.lookup(handle as u32, HandleType::Irp)? {
        KernelObject::Irp(i) => Ok(i),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_fd_open(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let flags = OpenFlags::from_bits_truncate(args[1] as u32);
    let creds = ctx.process.creds.lock().clone();
    let umask = ctx.process.umask.load(core::sync::atomic::Ordering::Acquire) as u16;
    let file = fd::open_at(&fs::current_cwd(), &path, flags, &creds, umask)?;
    Ok(ctx.process.handles.allocate(KernelObject::Fd(file)) as usize)
}

pub fn sys_fd_read(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 20)];
    let n = file.read(&mut buf)?;
    ctx.copy_out(args[1], &buf[..n])?;
    Ok(n)
}

pub fn sys_fd_write(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 20)];
    ctx.copy_in(args[1], &mut buf)?;
    file.write(&buf)
}

pub fn sys_fd_pread(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 20)];
    let n = file.read_at(args[3] as u64, &mut buf)?;
    ctx.copy_out(args[1], &buf[..n])?;
    Ok(n)
}

pub fn sys_fd_pwrite(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 20)];
    ctx.copy_in(args[1], &mut buf)?;
    file.write_at(args[3] as u64, &buf)
}

pub fn sys_fd_seek(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let from = match args[1] {
        0 => SeekFrom::Start(args[2] as u64),
        1 => SeekFrom::Current(args[2] as isize as i64),
        2 => SeekFrom::End(args[2] as isize as i64),
        _ => return Err(KernelError::InvalidArgument),
    };
    Ok(file.seek(from)? as usize)
}

pub fn sys_fd_tell(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    Ok(file_from(ctx, args[0])?.offset() as usize)
}

pub fn sys_fd_eof(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    Ok(file_from(ctx, args[0])?.at_eof() as usize)
}

pub fn sys_fd_ioctl(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    file_from(ctx, args[0])?.ioctl(args[1] as u32, args[2])
}

pub fn sys_fd_flush(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    file_from(ctx, args[0])?.flush()?;
    Ok(0)
}

pub fn sys_fd_close(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    ctx.process.handles.free(args[0] as u32)?;
    Ok(0)
}

/// User-visible stat layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StatUser {
    pub kind: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

pub fn sys_stat(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let entry = dirent::lookup_from(&fs::current_cwd(), &path, true)?;
    let vn = entry.vnode().ok_or(KernelError::NotFound)?;
    let out = StatUser {
        kind: vn.kind as u32,
        mode: vn.perm.lock().mode() as u32,
        uid: vn.uid.load(core::sync::atomic::Ordering::Acquire),
        gid: vn.gid.load(core::sync::atomic::Ordering::Acquire),
        size: vn.len(),
    };
    ctx.write_user(args[1], &out)?;
    Ok(0)
}

pub fn sys_mkdir(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let creds = ctx.process.creds.lock().clone();
    fd::mkdir_at(&fs::current_cwd(), &path, args[1] as u16, &creds)?;
    Ok(0)
}

pub fn sys_unlink(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let creds = ctx.process.creds.lock().clone();
    fd::unlink_at(&fs::current_cwd(), &path, &creds)?;
    Ok(0)
}

pub fn sys_irp_create(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    let irp = match args[1] {
        0 => Irp::read(file.vnode.clone(), args[2] as u64, args[3])?,
        1 => Irp::write(file.vnode.clone(), args[2] as u64, vec![0u8; args[3]])?,
        2 => Irp::dry_read(file.vnode.clone(), args[2] as u64, args[3])?,
        _ => return Err(KernelError::InvalidArgument),
    };
    Ok(ctx.process.handles.allocate(KernelObject::Irp(irp)) as usize)
}

pub fn sys_irp_submit(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    irp::submit(&irp_from(ctx, args[0])?)?;
    Ok(0)
}

pub fn sys_irp_wait(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let irp = irp_from(ctx, args[0])?;
    irp::wait(&irp)?;
    Ok(irp.blocks_transferred())
}

pub fn sys_irp_query_state(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    Ok(irp_from(ctx, args[0])?.is_complete() as usize)
}

pub fn sys_irp_get_buffer(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let irp = irp_from(ctx, args[0])?;
    let buffer = irp.buffer.lock();
    let n = buffer.len().min(args[2]);
    ctx.copy_out(args[1], &buffer[..n])?;
    Ok(n)
}

pub fn sys_irp_get_status(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    match irp_from(ctx, args[0])?.status() {
        None => Err(KernelError::Retry),
        Some(Ok(())) => Ok(0),
        Some(Err(e)) => Err(e),
    }
}

pub fn sys_mount(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let fs_name = ctx.user_path(args[1])?;
    let creds = ctx.process.creds.lock().clone();
    crate::caps::check("mount", &creds)?;
    let driver = crate::driver::find_by_name(&fs_name).ok_or(KernelError::NotFound)?;
    mount::mount(&path, driver, None)?;
    Ok(0)
}

pub fn sys_unmount(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    let creds = ctx.process.creds.lock().clone();
    crate::caps::check("mount", &creds)?;
    mount::unmount(&path)?;
    Ok(0)
}

pub fn sys_chdir(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let path = ctx.user_path(args[0])?;
    fs::chdir(&path)?;
    Ok(0)
}

pub fn sys_getcwd(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let cwd = fs::getcwd();
    let bytes = cwd.as_bytes();
    if bytes.len() + 1 > args[1] {
        return Err(KernelError::InvalidArgument);
    }
    ctx.copy_out(args[0], bytes)?;
    ctx.copy_out(args[0] + bytes.len(), &[0u8])?;
    Ok(bytes.len())
}

/// Directory listing: names are written NUL-separated; the return value
/// is the byte count.
pub fn sys_read_entries(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    if file.vnode.kind != VnodeKind::Directory {
        return Err(KernelError::InvalidFile);
    }
    let (driver, desc, _) = file.vnode.io_path()?;
    let mut out = vec![];
    driver.ops.list_dir(desc, &mut |name, _| {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        true
    })?;
    let n = out.len().min(args[2]);
    ctx.copy_out(args[1], &out[..n])?;
    Ok(n)
}

/// Create a pipe; writes `[read_handle, write_handle]` as two `u32`s.
pub fn sys_create_pipe(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let pipe = Pipe::new();
    let mk_end = |flags: OpenFlags| {
        let vn = Vnode::new(
            VnodeKind::Fifo,
            crate::fs::FilePerm::from_mode(0o600),
            0,
            0,
        );
        *vn.payload.lock() = VnodePayload::Pipe(pipe.clone());
        fd::from_vnode(vn, flags)
    };
    let read_end = mk_end(OpenFlags::READ);
    let write_end = mk_end(OpenFlags::WRITE);
    let rh = ctx.process.handles.allocate(KernelObject::Fd(read_end));
    let wh = ctx.process.handles.allocate(KernelObject::Fd(write_end));
    let words = [rh, wh];
    // SAFETY: plain u32 pair for the user copy.
    let bytes = unsafe {
        core::slice::from_raw_parts(words.as_ptr() as *const u8, core::mem::size_of_val(&words))
    };
    ctx.copy_out(args[0], bytes)?;
    Ok(0)
}

pub const F_GETFL: usize = 1;
pub const F_SETFL: usize = 2;

pub fn sys_fcntl(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let file = file_from(ctx, args[0])?;
    match args[1] {
        F_GETFL => Ok(file.flags.lock().bits() as usize),
        F_SETFL => {
            // Only the nonblocking bit is switchable after open.
            let mut flags = file.flags.lock();
            if args[2] & OpenFlags::NONBLOCK.bits() as usize != 0 {
                flags.insert(OpenFlags::NONBLOCK);
            } else {
                flags.remove(OpenFlags::NONBLOCK);
            }
            Ok(0)
        }
        _ => Err(KernelError::InvalidArgument),
    }
}

/// One `pollfd` as user space sees it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PollFdUser {
    pub handle: u32,
    pub events: u16,
    pub revents: u16,
}

pub const POLLIN: u16 = 1;
pub const POLLOUT: u16 = 4;

fn poll_ready(file: &Arc<File>, events: u16) -> u16 {
    let mut revents = 0;
    match file.vnode.kind {
        VnodeKind::Fifo => {
            if let VnodePayload::Pipe(p) = &*file.vnode.payload.lock() {
                if events & POLLIN != 0 && p.available() > 0 {
                    revents |= POLLIN;
                }
                if events & POLLOUT != 0 {
                    revents |= POLLOUT;
                }
            }
        }
        VnodeKind::Regular | VnodeKind::BlockDev => revents |= events & (POLLIN | POLLOUT),
        _ => {}
    }
    revents
}

/// Minimal ppoll: sweep readiness, yielding until something is ready or
/// the tick deadline passes. `timeout == usize::MAX` waits forever.
pub fn sys_ppoll(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let nfds = args[1].min(64);
    let deadline = match args[2] {
        usize::MAX => u64::MAX,
        t => crate::timer::now() + t as u64,
    };
    loop {
        let mut fds = vec![PollFdUser::default(); nfds];
        for (i, slot) in fds.iter_mut().enumerate() {
            *slot = ctx.read_user(args[0] + i * core::mem::size_of::<PollFdUser>())?;
        }
        let mut ready = 0usize;
        for slot in fds.iter_mut() {
            if let Ok(file) = file_from(ctx, slot.handle as usize) {
                slot.revents = poll_ready(&file, slot.events);
                if slot.revents != 0 {
                    ready += 1;
                }
            }
        }
        if ready > 0 || crate::timer::now() >= deadline {
            for (i, slot) in fds.iter().enumerate() {
                ctx.write_user(args[0] + i * core::mem::size_of::<PollFdUser>(), slot)?;
            }
            return Ok(ready);
        }
        crate::sched::yield_now();
        crate::platform::wait_for_interrupt();
    }
}

/// `pselect` rides the same readiness sweep as [`sys_ppoll`]: the
/// caller passes a pollfd array rather than fd_set bitmaps, which the
/// libc shim converts.
pub fn sys_pselect(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    sys_ppoll(ctx, args)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{dispatch, Syscall};
    use super::*;
    use crate::driver::{register_builtin, DriverHeader};
    use crate::fs::ramfs::RamFs;
    use crate::mm::VirtAddr;

    fn mount_fs(tag: &str) -> Arc<RamFs> {
        let r = dirent::root();
        dirent::add_child(
            &r,
            tag,
            Vnode::new(
                VnodeKind::Directory,
                crate::fs::FilePerm::from_mode(0o755),
                0,
                0,
            ),
        );
        let fs = Arc::new(RamFs::new());
        let drv = register_builtin(DriverHeader::named(tag), fs.clone());
        mount::mount(&alloc::format!("/{}", tag), drv, None).unwrap();
        fs
    }

    fn put_user_str(proc: &Arc<crate::process::Process>, s: &str) -> usize {
        let ptr = user_buffer(proc, s.len() + 1);
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        crate::mm::user_access::copy_to_user(&proc.space, VirtAddr::new(ptr as u64), &bytes)
            .unwrap();
        ptr
    }

    #[test]
    fn open_write_read_via_dispatch() {
        let (proc, _t) = calling_process();
        let _fs = mount_fs("systest-files");
        let path = put_user_str(&proc, "/systest-files/a.txt");
        let h = dispatch(
            Syscall::FdOpen as usize,
            [
                path,
                (OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE).bits() as usize,
                0,
                0,
                0,
            ],
        );
        assert!(h >= 0, "open failed: {}", h);

        let data = put_user_str(&proc, "payload");
        assert_eq!(
            dispatch(Syscall::FdWrite as usize, [h as usize, data, 7, 0, 0]),
            7
        );
        assert_eq!(
            dispatch(Syscall::FdSeek as usize, [h as usize, 0, 0, 0, 0]),
            0
        );
        let out = user_buffer(&proc, 16);
        assert_eq!(
            dispatch(Syscall::FdRead as usize, [h as usize, out, 7, 0, 0]),
            7
        );
        let mut readback = [0u8; 7];
        crate::mm::user_access::copy_from_user(
            &proc.space,
            VirtAddr::new(out as u64),
            &mut readback,
        )
        .unwrap();
        assert_eq!(&readback, b"payload");
        assert_eq!(dispatch(Syscall::FdClose as usize, [h as usize, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn pipe_syscall_round_trip() {
        let (proc, _t) = calling_process();
        let out = user_buffer(&proc, 8);
        assert_eq!(dispatch(Syscall::CreatePipe as usize, [out, 0, 0, 0, 0]), 0);
        let mut words = [0u8; 8];
        crate::mm::user_access::copy_from_user(
            &proc.space,
            VirtAddr::new(out as u64),
            &mut words,
        )
        .unwrap();
        let rh = u32::from_ne_bytes(words[0..4].try_into().unwrap()) as usize;
        let wh = u32::from_ne_bytes(words[4..8].try_into().unwrap()) as usize;

        let msg = put_user_str(&proc, "ping");
        assert_eq!(dispatch(Syscall::FdWrite as usize, [wh, msg, 4, 0, 0]), 4);
        let buf = user_buffer(&proc, 8);
        assert_eq!(dispatch(Syscall::FdRead as usize, [rh, buf, 4, 0, 0]), 4);
    }

    #[test]
    fn stat_reports_size_and_kind() {
        let (proc, _t) = calling_process();
        let fs = mount_fs("systest-stat");
        fs.add_file(crate::fs::mount::ROOT_DESC, "f.bin", &[9u8; 123])
            .unwrap();
        let path = put_user_str(&proc, "/systest-stat/f.bin");
        let out = user_buffer(&proc, core::mem::size_of::<StatUser>());
        assert_eq!(dispatch(Syscall::Stat as usize, [path, out, 0, 0, 0]), 0);
        let stat: StatUser = {
            let mut v = StatUser::default();
            let size = core::mem::size_of::<StatUser>();
            // SAFETY: plain repr(C) readback.
            let bytes = unsafe {
                core::slice::from_raw_parts_mut(&mut v as *mut StatUser as *mut u8, size)
            };
            crate::mm::user_access::copy_from_user(
                &proc.space,
                VirtAddr::new(out as u64),
                bytes,
            )
            .unwrap();
            v
        };
        assert_eq!(stat.size, 123);
        assert_eq!(stat.kind, VnodeKind::Regular as u32);
    }
}
