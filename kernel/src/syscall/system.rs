//! Clock, power and driver-management system calls.

use alloc::vec;

use crate::error::{KernelError, KernelResult};
use crate::process::{HandleType, KernelObject};

use super::{SyscallArgs, SyscallContext};

pub fn sys_clock_get(_ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    Ok(crate::timer::now() as usize)
}

fn power_permitted(ctx: &SyscallContext) -> KernelResult<()> {
    let creds = ctx.process.creds.lock().clone();
    crate::caps::check("power", &creds)
}

pub fn sys_reboot(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    power_permitted(ctx)?;
    log::warn!("power: reboot requested by pid {}", ctx.process.pid);
    crate::driver::for_each_on_suspend();
    Err(KernelError::Unimplemented)
}

pub fn sys_poweroff(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    power_permitted(ctx)?;
    log::warn!("power: shutdown requested by pid {}", ctx.process.pid);
    crate::driver::for_each_on_suspend();
    Err(KernelError::Unimplemented)
}

/// Suspend: freeze scheduling, sweep drivers down and (after the
/// platform wake path) back up.
pub fn sys_suspend(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    power_permitted(ctx)?;
    crate::sched::suspend_scheduler(true);
    crate::driver::for_each_on_suspend();
    // The wake interrupt lands here on real hardware.
    crate::driver::for_each_on_wake();
    crate::sched::suspend_scheduler(false);
    Ok(0)
}

pub fn sys_load_driver(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let creds = ctx.process.creds.lock().clone();
    crate::caps::check("drivers", &creds)?;
    let len = args[1].min(16 << 20);
    let mut image = vec![0u8; len];
    ctx.copy_in(args[0], &mut image)?;
    let driver = crate::driver::loader::load(&image)?;
    Ok(ctx
        .process
        .handles
        .allocate(KernelObject::Driver(driver)) as usize)
}

fn driver_from(
    ctx: &SyscallContext,
    handle: usize,
) -> KernelResult<alloc::sync::Arc<crate::driver::LoadedDriver>> {
    match ctx.lookup(handle as u32, HandleType::Driver)? {
        KernelObject::Driver(d) => Ok(d),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_start_driver(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let driver = driver_from(ctx, args[0])?;
    crate::driver::loader::start(&driver)?;
    Ok(0)
}

pub fn sys_unload_driver(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let creds = ctx.process.creds.lock().clone();
    crate::caps::check("drivers", &creds)?;
    let driver = driver_from(ctx, args[0])?;
    crate::driver::unload(&driver)?;
    ctx.process.handles.free(args[0] as u32)?;
    Ok(0)
}

pub fn sys_find_driver(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let name = ctx.user_path(args[0])?;
    let driver = crate::driver::find_by_name(&name).ok_or(KernelError::NotFound)?;
    Ok(ctx
        .process
        .handles
        .allocate(KernelObject::Driver(driver)) as usize)
}

pub fn sys_query_driver_name(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let driver = driver_from(ctx, args[0])?;
    let name = driver.header.name.as_bytes();
    let n = name.len().min(args[2].saturating_sub(1));
    ctx.copy_out(args[1], &name[..n])?;
    ctx.copy_out(args[1] + n, &[0u8])?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{dispatch, Syscall};

    #[test]
    fn clock_get_is_monotonic() {
        let (_p, _t) = calling_process();
        let a = dispatch(Syscall::ClockGet as usize, [0; 5]);
        let b = dispatch(Syscall::ClockGet as usize, [0; 5]);
        assert!(b >= a);
    }

    #[test]
    fn driver_find_reports_not_found_for_unknown() {
        let (proc, _t) = calling_process();
        let name = {
            let ptr = user_buffer(&proc, 32);
            crate::mm::user_access::copy_to_user(
                &proc.space,
                crate::mm::VirtAddr::new(ptr as u64),
                b"no-such-driver\0",
            )
            .unwrap();
            ptr
        };
        let status = dispatch(Syscall::FindDriverByName as usize, [name, 0, 0, 0, 0]);
        assert_eq!(
            status,
            crate::error::KernelError::NotFound.as_status()
        );
    }
}
