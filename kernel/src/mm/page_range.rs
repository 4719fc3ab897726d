//! Page ranges: contiguous virtual runs with uniform protection.
//!
//! Ranges in one address space form a tree keyed by base address and
//! never overlap. Each range tracks the per-page population state keyed
//! by absolute page address, so splitting a range on a partial protect
//! is a partition of the key space.

use alloc::{collections::BTreeMap, sync::Arc};

use bitflags::bitflags;

use crate::mm::{VirtAddr, PAGE_SIZE};

bitflags! {
    /// Mapping protection. Writable is the absence of `RO`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const RO = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
        const UNCACHED = 1 << 3;
        /// Install read-only and split on the first write.
        const COW = 1 << 4;
        const HUGE = 1 << 5;
    }
}

bitflags! {
    /// Allocation behavior for `AddressSpace::alloc`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        const HUGE = 1 << 0;
        const GUARD_BELOW = 1 << 1;
        const GUARD_ABOVE = 1 << 2;
        /// Restrict the *virtual* placement below 4 GiB.
        const BITMASK_32 = 1 << 3;
        /// The hint address is advisory rather than mandatory.
        const HINT = 1 << 4;
        const NON_PAGED = 1 << 5;
        /// CoW-on-write file backing instead of shared.
        const PRIVATE = 1 << 6;
        /// Populate every page now instead of on first touch.
        const PREFAULT = 1 << 7;
        /// Restrict the *physical* frames below 4 GiB.
        const BITMASK_32_PHYS = 1 << 8;
        /// Skip this range when forking.
        const NO_FORK = 1 << 9;
        /// Framebuffer-style mapping: caching disabled.
        const FRAMEBUFFER = 1 << 10;
        const POSIX_COMPAT = 1 << 11;
        /// Reserve address space without committing memory.
        const RESERVE = 1 << 12;
        /// Wired stack with a guard page below.
        const KERNEL_STACK = Self::NON_PAGED.bits() | Self::GUARD_BELOW.bits();
    }
}

/// Population state of one page of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSlot {
    /// Resident, backed by the frame.
    Present { phys: crate::mm::PhysAddr },
    /// Paged out into the swap slot.
    Swapped { slot: u64 },
}

/// What backs a range's pages.
#[derive(Clone)]
pub enum Backing {
    /// Demand-zero anonymous memory.
    Anon,
    /// A window onto a file, starting at `offset`.
    File {
        vnode: Arc<crate::fs::vnode::Vnode>,
        offset: u64,
    },
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Anon => write!(f, "Anon"),
            Self::File { offset, .. } => write!(f, "File(offset={})", offset),
        }
    }
}

/// A contiguous virtual run with uniform protection.
pub struct PageRange {
    /// First usable address (guard pages sit outside of this).
    pub base: VirtAddr,
    /// Usable length in bytes; page-aligned.
    pub size: usize,
    pub prot: Protection,
    pub flags: AllocFlags,
    pub backing: Backing,
    pub pageable: bool,
    pub can_fork: bool,
    pub reserved: bool,
    /// Absolute page address -> population state. Missing key = absent.
    pub pages: BTreeMap<u64, PageSlot>,
}

impl PageRange {
    pub fn end(&self) -> u64 {
        self.base.as_u64() + self.size as u64
    }

    /// Span including guard pages; used for overlap checks.
    pub fn span(&self) -> (u64, u64) {
        let mut start = self.base.as_u64();
        let mut end = self.end();
        if self.flags.contains(AllocFlags::GUARD_BELOW) {
            start -= PAGE_SIZE as u64;
        }
        if self.flags.contains(AllocFlags::GUARD_ABOVE) {
            end += PAGE_SIZE as u64;
        }
        (start, end)
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end()
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Resident pages in this range.
    pub fn resident(&self) -> usize {
        self.pages
            .values()
            .filter(|s| matches!(s, PageSlot::Present { .. }))
            .count()
    }

    pub fn slot(&self, addr: VirtAddr) -> Option<PageSlot> {
        self.pages.get(&addr.page_base().0).copied()
    }

    pub fn set_slot(&mut self, addr: VirtAddr, slot: PageSlot) {
        self.pages.insert(addr.page_base().0, slot);
    }

    pub fn clear_slot(&mut self, addr: VirtAddr) {
        self.pages.remove(&addr.page_base().0);
    }

    /// File offset backing `addr`, for file-backed ranges.
    pub fn file_offset_of(&self, addr: VirtAddr) -> Option<u64> {
        match &self.backing {
            Backing::File { offset, .. } => {
                Some(offset + (addr.page_base().0 - self.base.as_u64()))
            }
            Backing::Anon => None,
        }
    }
}

impl core::fmt::Debug for PageRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRange")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("prot", &self.prot)
            .field("backing", &self.backing)
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysAddr;

    fn range(base: u64, size: usize, flags: AllocFlags) -> PageRange {
        PageRange {
            base: VirtAddr::new(base),
            size,
            prot: Protection::USER,
            flags,
            backing: Backing::Anon,
            pageable: true,
            can_fork: true,
            reserved: false,
            pages: BTreeMap::new(),
        }
    }

    #[test]
    fn span_includes_guard_pages() {
        let r = range(0x10000, 0x2000, AllocFlags::GUARD_BELOW | AllocFlags::GUARD_ABOVE);
        assert_eq!(r.span(), (0x10000 - 0x1000, 0x12000 + 0x1000));
        assert!(r.contains(VirtAddr::new(0x10000)));
        assert!(!r.contains(VirtAddr::new(0x12000)));
    }

    #[test]
    fn slots_key_by_page_base() {
        let mut r = range(0x10000, 0x2000, AllocFlags::empty());
        r.set_slot(
            VirtAddr::new(0x10123),
            PageSlot::Present {
                phys: PhysAddr::new(0x5000),
            },
        );
        assert_eq!(
            r.slot(VirtAddr::new(0x10fff)),
            Some(PageSlot::Present {
                phys: PhysAddr::new(0x5000)
            })
        );
        assert_eq!(r.resident(), 1);
        r.clear_slot(VirtAddr::new(0x10000));
        assert_eq!(r.resident(), 0);
    }

    #[test]
    fn kernel_stack_flag_implies_wired_and_guarded() {
        let f = AllocFlags::KERNEL_STACK;
        assert!(f.contains(AllocFlags::NON_PAGED));
        assert!(f.contains(AllocFlags::GUARD_BELOW));
    }
}
