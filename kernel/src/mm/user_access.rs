//! Kernel views of user memory.
//!
//! Syscalls never dereference user pointers directly. A [`UserView`]
//! walks the user range, demand-faults absent pages, pins the backing
//! frames and exposes chunked copy in/out through the physical window.
//! Any unmappable page reports [`KernelError::PageFault`].

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    context::AddressSpace,
    frame,
    page_fault::{self, FaultResolution},
    PhysAddr, VirtAddr, PAGE_SIZE,
};
use crate::platform::{self, PageQuery};

/// A pinned kernel view of a user range.
pub struct UserView {
    pages: Vec<PhysAddr>,
    first_offset: usize,
    len: usize,
}

impl UserView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn for_each_chunk(&self, mut f: impl FnMut(*mut u8, usize, usize)) {
        let mut copied = 0usize;
        for (i, page) in self.pages.iter().enumerate() {
            let off = if i == 0 { self.first_offset } else { 0 };
            let take = (PAGE_SIZE - off).min(self.len - copied);
            if take == 0 {
                break;
            }
            let ptr = platform::phys_to_virt(page.offset(off as u64));
            f(ptr, copied, take);
            copied += take;
        }
    }

    /// Copy the viewed user bytes into `dst`.
    pub fn read(&self, dst: &mut [u8]) -> KernelResult<()> {
        if dst.len() < self.len {
            return Err(KernelError::InvalidArgument);
        }
        self.for_each_chunk(|ptr, copied, take| {
            // SAFETY: the frame is pinned and window-covered.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr().add(copied), take);
            }
        });
        Ok(())
    }

    /// Copy `src` into the viewed user bytes.
    pub fn write(&self, src: &[u8]) -> KernelResult<()> {
        if src.len() > self.len {
            return Err(KernelError::InvalidArgument);
        }
        let limit = src.len();
        self.for_each_chunk(|ptr, copied, take| {
            if copied >= limit {
                return;
            }
            let take = take.min(limit - copied);
            // SAFETY: the frame is pinned and window-covered.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), ptr, take);
            }
        });
        Ok(())
    }
}

impl Drop for UserView {
    fn drop(&mut self) {
        for page in &self.pages {
            frame::deref_page(*page);
        }
    }
}

/// Build a pinned view of `[ubase, ubase + len)` in `space`.
///
/// With `for_write` the pages are faulted writable first, so CoW splits
/// happen before the kernel stores through the view.
pub fn map_user_view(
    space: &Arc<AddressSpace>,
    ubase: VirtAddr,
    len: usize,
    for_write: bool,
) -> KernelResult<UserView> {
    if len == 0 {
        return Ok(UserView {
            pages: Vec::new(),
            first_offset: 0,
            len: 0,
        });
    }
    let mut pages = Vec::new();
    let mut addr = ubase.page_base();
    let end = ubase.as_u64() + len as u64;
    while addr.as_u64() < end {
        let needs_fault = match platform::query_page(space.root, addr) {
            PageQuery::Mapped(info) => {
                for_write && info.prot.contains(crate::mm::page_range::Protection::RO)
            }
            _ => true,
        };
        if needs_fault {
            let resolution = if for_write {
                page_fault::user_write_fault(space, addr)?
            } else {
                page_fault::user_read_fault(space, addr)?
            };
            if resolution == FaultResolution::Unhandled {
                // Unwind the pins taken so far.
                for page in &pages {
                    frame::deref_page(*page);
                }
                return Err(KernelError::PageFault {
                    addr: addr.as_usize(),
                });
            }
        }
        let phys = match platform::query_page(space.root, addr) {
            PageQuery::Mapped(info) => info.phys,
            _ => {
                for page in &pages {
                    frame::deref_page(*page);
                }
                return Err(KernelError::PageFault {
                    addr: addr.as_usize(),
                });
            }
        };
        frame::ref_page(phys);
        pages.push(phys);
        addr = addr.offset(PAGE_SIZE as u64);
    }
    Ok(UserView {
        pages,
        first_offset: ubase.page_offset(),
        len,
    })
}

/// `memcpy` from user space into a kernel buffer.
pub fn copy_from_user(
    space: &Arc<AddressSpace>,
    ubase: VirtAddr,
    dst: &mut [u8],
) -> KernelResult<()> {
    map_user_view(space, ubase, dst.len(), false)?.read(dst)
}

/// `memcpy` from a kernel buffer into user space.
pub fn copy_to_user(space: &Arc<AddressSpace>, ubase: VirtAddr, src: &[u8]) -> KernelResult<()> {
    map_user_view(space, ubase, src.len(), true)?.write(src)
}

/// Copy a NUL-terminated user string, up to `max` bytes.
pub fn copy_string_from_user(
    space: &Arc<AddressSpace>,
    ubase: VirtAddr,
    max: usize,
) -> KernelResult<String> {
    let mut out = Vec::new();
    let mut addr = ubase;
    'outer: while out.len() < max {
        let chunk = (PAGE_SIZE - addr.page_offset()).min(max - out.len());
        let mut buf = alloc::vec![0u8; chunk];
        copy_from_user(space, addr, &mut buf)?;
        for b in buf {
            if b == 0 {
                break 'outer;
            }
            out.push(b);
        }
        addr = addr.offset(chunk as u64);
    }
    String::from_utf8(out).map_err(|_| KernelError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::mm::page_range::{AllocFlags, Protection};

    #[test]
    fn round_trip_across_a_page_boundary() {
        let space = user_space(16);
        let base = space
            .alloc(None, 2 * PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        // Straddle the boundary.
        let target = base.offset(PAGE_SIZE as u64 - 3);
        let payload = *b"helion";
        copy_to_user(&space, target, &payload).unwrap();
        let mut readback = [0u8; 6];
        copy_from_user(&space, target, &mut readback).unwrap();
        assert_eq!(&readback, &payload);
    }

    #[test]
    fn absent_pages_are_demand_faulted() {
        let space = user_space(8);
        let base = space
            .alloc(None, PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert!(space.query_page(base).unwrap().slot.is_none());
        let mut buf = [0u8; 4];
        copy_from_user(&space, base, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        assert!(space.query_page(base).unwrap().slot.is_some());
    }

    #[test]
    fn unmapped_address_reports_page_fault() {
        let space = user_space(4);
        let mut buf = [0u8; 4];
        assert!(matches!(
            copy_from_user(&space, VirtAddr::new(0x5000_0000), &mut buf),
            Err(KernelError::PageFault { .. })
        ));
    }

    #[test]
    fn string_copy_stops_at_nul() {
        let space = user_space(8);
        let base = space
            .alloc(None, PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        copy_to_user(&space, base, b"init\0garbage").unwrap();
        let s = copy_string_from_user(&space, base, 64).unwrap();
        assert_eq!(s, "init");
    }
}
