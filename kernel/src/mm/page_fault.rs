//! The page-fault handler.
//!
//! Resolution order: locate the range, validate the access against its
//! protection, then handle swap-in, CoW splits, file-backed population
//! and demand-zero anonymous pages. Faults with no I/O are soft, the
//! rest hard. An unresolvable fault posts SIGSEGV to the faulting
//! thread and reports [`FaultResolution::Unhandled`].

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    context::AddressSpace,
    frame,
    page_range::{Backing, PageSlot, Protection},
    swap, VirtAddr, PAGE_SIZE,
};
use crate::platform;

/// Decoded fault cause.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultAccess {
    pub write: bool,
    pub exec: bool,
    pub user: bool,
    /// The translation was present (protection fault rather than a miss).
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Resolved without I/O (CoW split, demand-zero, spurious).
    Soft,
    /// Resolved with I/O (swap-in, file read).
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    Resolved(FaultClass),
    /// No range, or the access violates the range's protection. SIGSEGV
    /// has been posted to the faulting thread.
    Unhandled,
}

static SOFT_FAULTS: AtomicU64 = AtomicU64::new(0);
static HARD_FAULTS: AtomicU64 = AtomicU64::new(0);

/// `(soft, hard)` resolved-fault counters.
pub fn fault_counts() -> (u64, u64) {
    (
        SOFT_FAULTS.load(Ordering::Relaxed),
        HARD_FAULTS.load(Ordering::Relaxed),
    )
}

fn resolved(class: FaultClass) -> KernelResult<FaultResolution> {
    match class {
        FaultClass::Soft => SOFT_FAULTS.fetch_add(1, Ordering::Relaxed),
        FaultClass::Hard => HARD_FAULTS.fetch_add(1, Ordering::Relaxed),
    };
    Ok(FaultResolution::Resolved(class))
}

fn unhandled(addr: VirtAddr) -> KernelResult<FaultResolution> {
    crate::signal::post_segv(addr.as_usize());
    Ok(FaultResolution::Unhandled)
}

/// Resolve a fault at `addr` in `space`.
pub fn handle_fault(
    space: &Arc<AddressSpace>,
    addr: VirtAddr,
    access: FaultAccess,
) -> KernelResult<FaultResolution> {
    let pool = space.pool();
    let root = space.root;
    let page = addr.page_base();

    let mut inner = space.inner();
    let range = match inner.range_containing_mut(addr) {
        Some(r) => r,
        None => {
            drop(inner);
            return unhandled(addr);
        }
    };

    // Access validation against the range's own protection.
    let violates = (access.write && range.prot.contains(Protection::RO))
        || (access.exec && !range.prot.contains(Protection::EXEC))
        || (access.user && !range.prot.contains(Protection::USER))
        || range.reserved;
    if violates {
        drop(inner);
        return unhandled(addr);
    }

    let prot = range.prot;
    match range.slot(page) {
        // Swap marker: read the slot back into a fresh frame.
        Some(PageSlot::Swapped { slot }) => {
            let phys = pool.lock().allocate(1, 1)?;
            swap::read_in(slot, phys)?;
            swap::deref_entry(slot);
            frame::track(phys, 1, false, false, Some(pool.clone()));
            platform::map_page(root, page, phys, prot, true, false)?;
            range.set_slot(page, PageSlot::Present { phys });
            space
                .stats
                .paged_out
                .fetch_sub(PAGE_SIZE as u64, Ordering::AcqRel);
            drop(inner);
            resolved(FaultClass::Hard)
        }

        // Present: either a CoW write or a spurious fault.
        Some(PageSlot::Present { phys }) => {
            if access.write {
                let shared = frame::refs_of(phys) > 1;
                if shared {
                    // Split: private copy, dereference the original.
                    let fresh = pool.lock().allocate(1, 1)?;
                    // SAFETY: both frames are live and window-covered.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            platform::phys_to_virt(phys),
                            platform::phys_to_virt(fresh),
                            PAGE_SIZE,
                        );
                    }
                    let remaining = frame::deref_page(phys);
                    if remaining == 1 && frame::cow_of(phys) == frame::CowKind::Symmetric {
                        // Sole owner left: its next write restores the
                        // writable mapping in place.
                        frame::set_cow(phys, frame::CowKind::Disabled);
                    }
                    frame::track(fresh, 1, false, false, Some(pool.clone()));
                    platform::map_page(root, page, fresh, prot, true, false)?;
                    range.set_slot(page, PageSlot::Present { phys: fresh });
                } else {
                    // Last CoW owner: make the mapping writable again.
                    frame::set_cow(phys, frame::CowKind::Disabled);
                    platform::map_page(root, page, phys, prot, true, false)?;
                }
            } else {
                // Spurious (stale TLB on another CPU): remap and go.
                platform::map_page(root, page, phys, prot, true, false)?;
            }
            drop(inner);
            resolved(FaultClass::Soft)
        }

        // Not yet populated.
        None => {
            let phys = pool.lock().allocate(1, 1)?;
            let backing = range.backing.clone();
            let class = match &backing {
                Backing::File { vnode, .. } => {
                    let file_off = range.file_offset_of(page).unwrap_or(0);
                    // SAFETY: fresh frame from this space's pool.
                    let buf = unsafe {
                        core::slice::from_raw_parts_mut(platform::phys_to_virt(phys), PAGE_SIZE)
                    };
                    buf.fill(0);
                    let _ = crate::fs::pagecache::read_backing(vnode, file_off, buf)?;
                    FaultClass::Hard
                }
                Backing::Anon => {
                    AddressSpace::zero_frame_pub(phys, 1);
                    FaultClass::Soft
                }
            };
            frame::track(phys, 1, false, false, Some(pool.clone()));
            platform::map_page(root, page, phys, prot, true, false)?;
            range.set_slot(page, PageSlot::Present { phys });
            drop(inner);
            resolved(class)
        }
    }
    .and_then(|r| {
        // Keep the working set inside its budget.
        if space.resident_bytes() > space.working_set_limit.load(Ordering::Acquire) {
            space.trim_working_set();
        }
        Ok(r)
    })
}

/// Convenience wrapper for write access from user mode.
pub fn user_write_fault(space: &Arc<AddressSpace>, addr: VirtAddr) -> KernelResult<FaultResolution> {
    handle_fault(
        space,
        addr,
        FaultAccess {
            write: true,
            user: true,
            ..Default::default()
        },
    )
}

/// Convenience wrapper for read access from user mode.
pub fn user_read_fault(space: &Arc<AddressSpace>, addr: VirtAddr) -> KernelResult<FaultResolution> {
    handle_fault(
        space,
        addr,
        FaultAccess {
            user: true,
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::mm::page_range::AllocFlags;
    use crate::mm::PhysAddr;

    fn phys_of(space: &Arc<AddressSpace>, addr: VirtAddr) -> PhysAddr {
        match space.query_page(addr).unwrap().slot {
            Some(PageSlot::Present { phys }) => phys,
            other => panic!("expected resident page, got {:?}", other),
        }
    }

    fn poke(phys: PhysAddr, value: u8) {
        // SAFETY: test frames come from a private host-arena pool.
        unsafe { platform::phys_to_virt(phys).write(value) }
    }

    fn peek(phys: PhysAddr) -> u8 {
        // SAFETY: as above.
        unsafe { platform::phys_to_virt(phys).read() }
    }

    #[test]
    fn demand_anon_fault_maps_a_zero_page() {
        let space = user_space(16);
        let base = space
            .alloc(None, PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert!(space.query_page(base).unwrap().slot.is_none());
        let r = user_read_fault(&space, base).unwrap();
        assert_eq!(r, FaultResolution::Resolved(FaultClass::Soft));
        assert_eq!(peek(phys_of(&space, base)), 0);
    }

    #[test]
    fn fault_outside_any_range_is_unhandled() {
        let space = user_space(4);
        let r = user_read_fault(&space, VirtAddr::new(0x6000_0000)).unwrap();
        assert_eq!(r, FaultResolution::Unhandled);
    }

    #[test]
    fn write_to_read_only_range_is_unhandled() {
        let space = user_space(8);
        let base = space
            .alloc(None, PAGE_SIZE, Protection::RO, AllocFlags::empty(), None)
            .unwrap();
        let r = user_write_fault(&space, base).unwrap();
        assert_eq!(r, FaultResolution::Unhandled);
    }

    #[test]
    fn fork_then_cow_split_keeps_both_sides_private() {
        let parent = user_space(32);
        let base = parent
            .alloc(None, PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        user_write_fault(&parent, base).unwrap();
        poke(phys_of(&parent, base), 0xAA);

        let child = AddressSpace::new_user(parent.pool()).unwrap();
        child.fork_from(&parent).unwrap();

        // Same frame, both read-only, shared refcount.
        let shared = phys_of(&parent, base);
        assert_eq!(phys_of(&child, base), shared);
        assert_eq!(frame::refs_of(shared), 2);
        assert_eq!(peek(phys_of(&child, base)), 0xAA);

        // Parent writes: split into a private frame.
        user_write_fault(&parent, base).unwrap();
        let parent_phys = phys_of(&parent, base);
        assert_ne!(parent_phys, shared);
        poke(parent_phys, 0xBB);

        // Child still sees the original byte on the original frame.
        assert_eq!(phys_of(&child, base), shared);
        assert_eq!(peek(phys_of(&child, base)), 0xAA);
        assert_eq!(frame::refs_of(shared), 1);

        // Committed charge is equal on both sides.
        assert_eq!(
            parent.stats.committed.load(Ordering::Acquire),
            child.stats.committed.load(Ordering::Acquire)
        );

        // The child's own write needs no copy: it is the last owner.
        user_write_fault(&child, base).unwrap();
        assert_eq!(phys_of(&child, base), shared);
        assert_eq!(peek(phys_of(&child, base)), 0xAA);
    }

    #[test]
    fn swapped_page_comes_back_with_its_bytes() {
        let space = user_space(16);
        let base = space
            .alloc(None, PAGE_SIZE, Protection::empty(), AllocFlags::PREFAULT, None)
            .unwrap();
        poke(phys_of(&space, base), 0x5C);
        space.page_out(base).unwrap();
        let (_, hard_before) = fault_counts();
        let r = user_read_fault(&space, base).unwrap();
        assert_eq!(r, FaultResolution::Resolved(FaultClass::Hard));
        assert_eq!(peek(phys_of(&space, base)), 0x5C);
        let (_, hard_after) = fault_counts();
        assert!(hard_after > hard_before);
    }
}
