//! Memory-family system calls.

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    page_range::{AllocFlags, PageSlot, Protection},
    AddressSpace, VirtAddr,
};
use crate::process::{HandleType, KernelObject};

use super::{SyscallArgs, SyscallContext};

fn space_from_handle(ctx: &SyscallContext, handle: usize) -> KernelResult<Arc<AddressSpace>> {
    match ctx.lookup(handle as u32, HandleType::Space)? {
        KernelObject::Space(space) => Ok(space),
        _ => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_vm_alloc(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let hint = if args[0] == 0 {
        None
    } else {
        Some(VirtAddr::new(args[0] as u64))
    };
    let prot = Protection::from_bits_truncate(args[2] as u32);
    let flags = AllocFlags::from_bits_truncate(args[3] as u32);
    let base = ctx.process.space.alloc(hint, args[1], prot, flags, None)?;
    Ok(base.as_usize())
}

pub fn sys_vm_free(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    ctx.process.space.free(VirtAddr::new(args[0] as u64))?;
    Ok(0)
}

pub fn sys_vm_protect(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let prot = Protection::from_bits_truncate(args[2] as u32);
    // 0 clears pageable, 1 sets it, anything larger preserves.
    let pageable = match args[3] {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    };
    ctx.process
        .space
        .protect(VirtAddr::new(args[0] as u64), args[1], prot, pageable)?;
    Ok(0)
}

pub fn sys_vm_lock(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    ctx.process
        .space
        .lock_range(VirtAddr::new(args[0] as u64), args[1]);
    Ok(0)
}

pub fn sys_vm_unlock(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    ctx.process
        .space
        .unlock_range(VirtAddr::new(args[0] as u64), args[1]);
    Ok(0)
}

pub fn sys_make_context(ctx: &SyscallContext, _args: &SyscallArgs) -> KernelResult<usize> {
    let space = AddressSpace::new_user(ctx.process.space.pool())?;
    let handle = ctx.process.handles.allocate(KernelObject::Space(space));
    Ok(handle as usize)
}

/// Layout shared with user space for `ContextGetStat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextStatUser {
    pub committed: u64,
    pub pageable: u64,
    pub non_paged: u64,
    pub paged_out: u64,
}

pub fn sys_context_stat(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let space = space_from_handle(ctx, args[0])?;
    let (committed, pageable, non_paged, paged_out) = space.stats.snapshot();
    let out = ContextStatUser {
        committed,
        pageable,
        non_paged,
        paged_out,
    };
    ctx.write_user(args[1], &out)?;
    Ok(0)
}

/// Layout shared with user space for `QueryPageInfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PageInfoUser {
    pub range_base: u64,
    pub range_size: u64,
    pub prot: u32,
    pub present: u32,
    pub swapped: u32,
    pub file_backed: u32,
}

pub fn sys_query_page(ctx: &SyscallContext, args: &SyscallArgs) -> KernelResult<usize> {
    let space = space_from_handle(ctx, args[0])?;
    let info = space
        .query_page(VirtAddr::new(args[1] as u64))
        .ok_or(KernelError::NotFound)?;
    let out = PageInfoUser {
        range_base: info.base.as_u64(),
        range_size: info.size as u64,
        prot: info.prot.bits(),
        present: matches!(info.slot, Some(PageSlot::Present { .. })) as u32,
        swapped: matches!(info.slot, Some(PageSlot::Swapped { .. })) as u32,
        file_backed: info.file_backed as u32,
    };
    ctx.write_user(args[2], &out)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{dispatch, Syscall};
    use super::*;
    use crate::process::HANDLE_CURRENT;

    #[test]
    fn protect_preserves_pageable_when_asked() {
        let (proc, _t) = calling_process();
        let base = dispatch(
            Syscall::VirtualMemoryAlloc as usize,
            [0, crate::mm::PAGE_SIZE, 0, AllocFlags::PREFAULT.bits() as usize, 0],
        ) as usize;
        assert!(base > 0);
        let status = dispatch(
            Syscall::VirtualMemoryProtect as usize,
            [base, crate::mm::PAGE_SIZE, Protection::RO.bits() as usize, 2, 0],
        );
        assert_eq!(status, 0);
        let info = proc.process_space_info(base);
        assert!(info.prot.contains(Protection::RO));
        assert!(info.pageable);
    }

    #[test]
    fn context_stat_writes_back() {
        let (proc, _t) = calling_process();
        let out_ptr = user_buffer(&proc, core::mem::size_of::<ContextStatUser>());
        let status = dispatch(
            Syscall::ContextGetStat as usize,
            [HANDLE_CURRENT as usize, out_ptr, 0, 0, 0],
        );
        assert_eq!(status, 0);
    }
}

#[cfg(test)]
impl crate::process::Process {
    fn process_space_info(&self, base: usize) -> crate::mm::context::PageRangeInfo {
        self.space
            .query_page(VirtAddr::new(base as u64))
            .expect("range must exist")
    }
}
