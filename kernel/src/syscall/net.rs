//! Socket system calls.

use alloc::{sync::Arc, vec};

use crate::error::{KernelError, KernelResult};
use crate::fs::socket::{self, ShutdownHow, SockAddr, SocketOps};
use crate::process::{HandleType, KernelObject};

use super::{SyscallArgs, SyscallContext};

fn socket_from(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<dyn SocketOps>> {
    match ctx.lookup(handle as u32, HandleType::Socket)? {
        KernelObject::Socket(s) => Ok(s),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_socket(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sock = socket::create_socket(args[0] as u16, args[1] as u16)?;
    Ok(ctx.process.handles.allocate(KernelObject::Socket(sock)) as usize)
}

pub fn sys_bind(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sock = socket_from(ctx, args[0])?;
    let addr: SockAddr = ctx.read_user(args[1])?;
    sock.bind(&addr)?;
    Ok(0)
}

pub fn sys_connect(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sock = socket_from(ctx, args[0])?;
    let addr: SockAddr = ctx.read_user(args[1])?;
    sock.connect(&addr)?;
    Ok(0)
}

pub fn sys_listen(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    socket_from(ctx, args[0])?.listen(args[1])?;
    Ok(0)
}

pub fn sys_accept(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let (conn, _peer) = socket_from(ctx, args[0])?.accept()?;
    Ok(ctx.process.handles.allocate(KernelObject::Socket(conn)) as usize)
}

pub fn sys_send_to(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sock = socket_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 16)];
    ctx.copy_in(args[1], &mut buf)?;
    let addr = if args[3] != 0 {
        Some(ctx.read_user::<SockAddr>(args[3])?)
    } else {
        None
    };
    sock.send_to(&buf, addr.as_ref())
}

pub fn sys_recv_from(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let sock = socket_from(ctx, args[0])?;
    let mut buf = vec![0u8; args[2].min(1 << 16)];
    let (n, from) = sock.recv_from(&mut buf, false)?;
    ctx.copy_out(args[1], &buf[..n])?;
    if args[3] != 0 {
        ctx.write_user(args[3], &from)?;
    }
    Ok(n)
}

pub fn sys_shutdown(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let how = match args[1] {
        0 => ShutdownHow::Read,
        1 => ShutdownHow::Write,
        _ => ShutdownHow::Both,
    };
    socket_from(ctx, args[0])?.shutdown(how)?;
    Ok(0)
}

pub fn sys_getsockopt(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    socket_from(ctx, args[0])?.getsockopt(args[1] as u32, args[2] as u32)
}

pub fn sys_setsockopt(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    socket_from(ctx, args[0])?.setsockopt(args[1] as u32, args[2] as u32, args[3])?;
    Ok(0)
}

pub fn sys_sockname(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let addr = socket_from(ctx, args[0])?.sockname()?;
    ctx.write_user(args[1], &addr)?;
    Ok(0)
}

pub fn sys_peername(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let addr = socket_from(ctx, args[0])?.peername()?;
    ctx.write_user(args[1], &addr)?;
    Ok(0)
}
