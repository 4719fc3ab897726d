//! Address spaces.
//!
//! One per process plus the reserved kernel context. An address space is
//! a page-table root plus the page-range tree, a usage counter set, a
//! working-set budget and the owning process backlink. Range-tree edits
//! are serialized by the context's lock.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
    vec::Vec,
};
use spin::{Mutex, MutexGuard, Once};

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    frame,
    page_range::{AllocFlags, Backing, PageRange, PageSlot, Protection},
    pmm::{self, SharedFrameSource},
    swap, PhysAddr, VirtAddr, PAGE_SIZE,
};
use crate::platform::{self, PageTableRoot};

/// Lowest base handed to user mappings.
const USER_FLOOR: u64 = 0x1000_0000;
/// Lowest base for kernel-context mappings.
const KERNEL_FLOOR: u64 = 0x2000_0000;
/// Ceiling for 32-bit-restricted virtual placement.
const FOUR_GIB: u64 = 1 << 32;

/// Default working-set budget: effectively unlimited until the glue
/// configures one.
const DEFAULT_WORKING_SET: usize = usize::MAX;

/// Memory usage counters, in bytes.
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub committed: AtomicU64,
    pub pageable: AtomicU64,
    pub non_paged: AtomicU64,
    pub paged_out: AtomicU64,
}

impl MemoryStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.committed.load(Ordering::Acquire),
            self.pageable.load(Ordering::Acquire),
            self.non_paged.load(Ordering::Acquire),
            self.paged_out.load(Ordering::Acquire),
        )
    }
}

pub struct SpaceInner {
    pub ranges: BTreeMap<u64, PageRange>,
    /// Pages pinned against replacement, by page address.
    pub locked: BTreeSet<u64>,
}

impl SpaceInner {
    pub fn range_containing(&self, addr: VirtAddr) -> Option<&PageRange> {
        self.ranges
            .range(..=addr.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    pub fn range_containing_mut(&mut self, addr: VirtAddr) -> Option<&mut PageRange> {
        self.ranges
            .range_mut(..=addr.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }
}

pub struct AddressSpace {
    pub root: PageTableRoot,
    inner: Mutex<SpaceInner>,
    pub stats: MemoryStats,
    pub working_set_limit: AtomicUsize,
    pool: SharedFrameSource,
    owner: Mutex<Weak<crate::process::Process>>,
    user: bool,
}

static KERNEL_SPACE: Once<Arc<AddressSpace>> = Once::new();

/// The reserved kernel context, created on first use over the global
/// frame pool.
pub fn kernel_space() -> Arc<AddressSpace> {
    KERNEL_SPACE
        .call_once(|| {
            AddressSpace::new_kernel(pmm::global_pool())
                .expect("kernel address space must be constructible")
        })
        .clone()
}

impl AddressSpace {
    fn new(pool: SharedFrameSource, user: bool) -> KernelResult<Arc<Self>> {
        Ok(Arc::new(Self {
            root: platform::new_page_root()?,
            inner: Mutex::new(SpaceInner {
                ranges: BTreeMap::new(),
                locked: BTreeSet::new(),
            }),
            stats: MemoryStats::default(),
            working_set_limit: AtomicUsize::new(DEFAULT_WORKING_SET),
            pool,
            owner: Mutex::new(Weak::new()),
            user,
        }))
    }

    pub fn new_user(pool: SharedFrameSource) -> KernelResult<Arc<Self>> {
        Self::new(pool, true)
    }

    pub fn new_kernel(pool: SharedFrameSource) -> KernelResult<Arc<Self>> {
        Self::new(pool, false)
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn owner(&self) -> Option<Arc<crate::process::Process>> {
        self.owner.lock().upgrade()
    }

    pub fn set_owner(&self, proc: &Arc<crate::process::Process>) {
        *self.owner.lock() = Arc::downgrade(proc);
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    pub(crate) fn pool(&self) -> SharedFrameSource {
        self.pool.clone()
    }

    fn floor(&self) -> u64 {
        if self.user {
            USER_FLOOR
        } else {
            KERNEL_FLOOR
        }
    }

    fn effective_protection(&self, prot: Protection, flags: AllocFlags) -> Protection {
        let mut eff = prot;
        if self.user {
            eff |= Protection::USER;
        }
        if flags.contains(AllocFlags::FRAMEBUFFER) {
            eff |= Protection::UNCACHED;
        }
        if flags.contains(AllocFlags::HUGE) {
            eff |= Protection::HUGE;
        }
        eff
    }

    /// First gap of `span` bytes at or after `from`, against the spans
    /// (guards included) of the existing ranges.
    fn find_free(inner: &SpaceInner, from: u64, span: u64, ceiling: u64) -> Option<u64> {
        let mut candidate = from;
        for r in inner.ranges.values() {
            let (start, end) = r.span();
            if end <= candidate {
                continue;
            }
            if start >= candidate + span {
                break;
            }
            candidate = end;
        }
        if candidate + span <= ceiling {
            Some(candidate)
        } else {
            None
        }
    }

    fn overlaps(inner: &SpaceInner, start: u64, end: u64) -> bool {
        inner.ranges.values().any(|r| {
            let (s, e) = r.span();
            s < end && start < e
        })
    }

    fn alloc_frames(&self, pages: usize, align: usize, flags: AllocFlags) -> KernelResult<PhysAddr> {
        let mut pool = self.pool.lock();
        if flags.contains(AllocFlags::BITMASK_32_PHYS) {
            pool.allocate32(pages, align)
        } else {
            pool.allocate(pages, align)
        }
    }

    fn zero_frame(phys: PhysAddr, pages: usize) {
        // SAFETY: freshly allocated frames, covered by the window.
        unsafe {
            core::ptr::write_bytes(platform::phys_to_virt(phys), 0, pages * PAGE_SIZE);
        }
    }

    pub(crate) fn zero_frame_pub(phys: PhysAddr, pages: usize) {
        Self::zero_frame(phys, pages)
    }

    /// Reserve (and optionally populate) a page range.
    pub fn alloc(
        self: &Arc<Self>,
        hint: Option<VirtAddr>,
        size: usize,
        prot: Protection,
        flags: AllocFlags,
        file: Option<(Arc<crate::fs::vnode::Vnode>, u64)>,
    ) -> KernelResult<VirtAddr> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = crate::mm::page_align_up(size);
        let eff_prot = self.effective_protection(prot, flags);
        let pageable = !flags.contains(AllocFlags::NON_PAGED);
        let reserved = flags.contains(AllocFlags::RESERVE);

        let mut guard_span = 0u64;
        if flags.contains(AllocFlags::GUARD_BELOW) {
            guard_span += PAGE_SIZE as u64;
        }
        if flags.contains(AllocFlags::GUARD_ABOVE) {
            guard_span += PAGE_SIZE as u64;
        }
        let span = size as u64 + guard_span;
        let below_guard = if flags.contains(AllocFlags::GUARD_BELOW) {
            PAGE_SIZE as u64
        } else {
            0
        };

        let mut inner = self.inner.lock();

        // An exact allocation inside an existing reservation commits
        // those pages in place (the page-cache arena pattern).
        if let Some(h) = hint {
            if !flags.contains(AllocFlags::HINT) && !reserved {
                if let Some(r) = inner.range_containing(h) {
                    if r.reserved && h.as_u64() + size as u64 <= r.end() {
                        let base = h.page_base();
                        drop(inner);
                        self.commit_in_reservation(base, size, flags)?;
                        return Ok(base);
                    }
                }
            }
        }

        let ceiling = if flags.contains(AllocFlags::BITMASK_32) {
            FOUR_GIB
        } else {
            u64::MAX - span
        };
        let base = match hint {
            Some(h) if !flags.contains(AllocFlags::HINT) => {
                let start = h.page_base().as_u64() - below_guard;
                if Self::overlaps(&inner, start, start + span) {
                    return Err(KernelError::InUse);
                }
                h.page_base().as_u64()
            }
            other => {
                let from = other
                    .map(|h| h.page_base().as_u64().max(self.floor()))
                    .unwrap_or(self.floor());
                Self::find_free(&inner, from, span, ceiling).ok_or(
                    KernelError::NotEnoughMemory { requested: size },
                )? + below_guard
            }
        };
        let base = VirtAddr::new(base);

        let backing = match file {
            Some((vnode, offset)) => Backing::File { vnode, offset },
            None => Backing::Anon,
        };
        let mut range = PageRange {
            base,
            size,
            prot: eff_prot,
            flags,
            backing,
            pageable,
            can_fork: !flags.contains(AllocFlags::NO_FORK),
            reserved,
            pages: BTreeMap::new(),
        };

        let populate_now =
            !reserved && (flags.contains(AllocFlags::PREFAULT) || !pageable);
        if populate_now && matches!(range.backing, Backing::Anon) {
            let (frames_pages, align) = if flags.contains(AllocFlags::HUGE) {
                (crate::mm::HUGE_PAGE_SIZE / PAGE_SIZE, crate::mm::HUGE_PAGE_SIZE / PAGE_SIZE)
            } else {
                (1, 1)
            };
            let mut addr = base;
            while addr.as_u64() < range.end() {
                let phys = self.alloc_frames(frames_pages, align, flags)?;
                Self::zero_frame(phys, frames_pages);
                frame::track(
                    phys,
                    frames_pages,
                    frames_pages > 1,
                    flags.contains(AllocFlags::BITMASK_32_PHYS),
                    Some(self.pool.clone()),
                );
                platform::map_page(
                    self.root,
                    addr,
                    phys,
                    eff_prot,
                    true,
                    frames_pages > 1,
                )?;
                for i in 0..frames_pages {
                    range.set_slot(
                        addr.offset((i * PAGE_SIZE) as u64),
                        PageSlot::Present {
                            phys: phys.offset((i * PAGE_SIZE) as u64),
                        },
                    );
                }
                addr = addr.offset((frames_pages * PAGE_SIZE) as u64);
            }
        }

        if !reserved {
            self.stats.committed.fetch_add(size as u64, Ordering::AcqRel);
            if pageable {
                self.stats.pageable.fetch_add(size as u64, Ordering::AcqRel);
            } else {
                self.stats.non_paged.fetch_add(size as u64, Ordering::AcqRel);
            }
        }
        inner.ranges.insert(base.as_u64(), range);
        Ok(base)
    }

    /// Commit pages inside an existing reservation.
    fn commit_in_reservation(
        self: &Arc<Self>,
        base: VirtAddr,
        size: usize,
        flags: AllocFlags,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let root = self.root;
        let pool = self.pool.clone();
        let range = inner
            .range_containing_mut(base)
            .ok_or(KernelError::NotFound)?;
        let prot = range.prot;
        let mut addr = base;
        while addr.as_u64() < base.as_u64() + size as u64 {
            if range.slot(addr).is_none() {
                let phys = {
                    let mut p = pool.lock();
                    if flags.contains(AllocFlags::BITMASK_32_PHYS) {
                        p.allocate32(1, 1)?
                    } else {
                        p.allocate(1, 1)?
                    }
                };
                Self::zero_frame(phys, 1);
                frame::track(phys, 1, false, false, Some(pool.clone()));
                platform::map_page(root, addr, phys, prot, true, false)?;
                range.set_slot(addr, PageSlot::Present { phys });
            }
            addr = addr.offset(PAGE_SIZE as u64);
        }
        self.stats.committed.fetch_add(size as u64, Ordering::AcqRel);
        self.stats.non_paged.fetch_add(size as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Release the range starting at `base`: dereference frames, return
    /// swap slots, drop translations and shoot the TLB down.
    pub fn free(&self, base: VirtAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let range = inner
            .ranges
            .remove(&base.as_u64())
            .ok_or(KernelError::NotFound)?;
        for (addr, slot) in &range.pages {
            match slot {
                PageSlot::Present { phys } => {
                    let _ = platform::map_page(
                        self.root,
                        VirtAddr::new(*addr),
                        *phys,
                        range.prot,
                        false,
                        false,
                    );
                    frame::deref_page(phys.page_base());
                }
                PageSlot::Swapped { slot } => {
                    let _ = platform::map_page(
                        self.root,
                        VirtAddr::new(*addr),
                        PhysAddr::new(0),
                        range.prot,
                        false,
                        false,
                    );
                    swap::deref_entry(*slot);
                }
            }
            inner.locked.remove(addr);
        }
        platform::invalidate_range(self.root, range.base, range.size);
        if !range.reserved {
            self.stats
                .committed
                .fetch_sub(range.size as u64, Ordering::AcqRel);
            if range.pageable {
                self.stats
                    .pageable
                    .fetch_sub(range.size as u64, Ordering::AcqRel);
            } else {
                self.stats
                    .non_paged
                    .fetch_sub(range.size as u64, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    /// Split the range containing `at` so that `at` begins a new range.
    /// No-op when `at` is already a range boundary.
    fn split_at(inner: &mut SpaceInner, at: VirtAddr) {
        let key = match inner.range_containing(at) {
            Some(r) if r.base.as_u64() != at.as_u64() => r.base.as_u64(),
            _ => return,
        };
        let mut left = match inner.ranges.remove(&key) {
            Some(r) => r,
            None => return,
        };
        let right_pages = left.pages.split_off(&at.as_u64());
        let left_size = (at.as_u64() - left.base.as_u64()) as usize;
        let right = PageRange {
            base: at,
            size: left.size - left_size,
            prot: left.prot,
            // Guards stay with the edge they protect.
            flags: left.flags - AllocFlags::GUARD_BELOW,
            backing: match &left.backing {
                Backing::Anon => Backing::Anon,
                Backing::File { vnode, offset } => Backing::File {
                    vnode: vnode.clone(),
                    offset: offset + left_size as u64,
                },
            },
            pageable: left.pageable,
            can_fork: left.can_fork,
            reserved: left.reserved,
            pages: right_pages,
        };
        left.size = left_size;
        left.flags -= AllocFlags::GUARD_ABOVE;
        inner.ranges.insert(key, left);
        inner.ranges.insert(at.as_u64(), right);
    }

    /// Edit protection over `[base, base + size)`. `pageable`: `Some`
    /// overrides the pageable flag, `None` preserves it. Applying the
    /// same protection twice leaves the tree and translations unchanged.
    pub fn protect(
        &self,
        base: VirtAddr,
        size: usize,
        new_prot: Protection,
        pageable: Option<bool>,
    ) -> KernelResult<()> {
        if size == 0 || !base.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        let size = crate::mm::page_align_up(size);
        let end = VirtAddr::new(base.as_u64() + size as u64);
        let mut inner = self.inner.lock();
        if inner.range_containing(base).is_none() {
            return Err(KernelError::NotFound);
        }
        Self::split_at(&mut inner, base);
        Self::split_at(&mut inner, end);

        let keys: Vec<u64> = inner
            .ranges
            .range(base.as_u64()..end.as_u64())
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let root = self.root;
            let range = match inner.ranges.get_mut(&key) {
                Some(r) => r,
                None => continue,
            };
            let eff = if range.prot.contains(Protection::USER) {
                new_prot | Protection::USER
            } else {
                new_prot
            };
            let was_pageable = range.pageable;
            range.prot = eff;
            if let Some(p) = pageable {
                range.pageable = p;
            }
            if was_pageable != range.pageable && !range.reserved {
                let delta = range.size as u64;
                if range.pageable {
                    self.stats.pageable.fetch_add(delta, Ordering::AcqRel);
                    self.stats.non_paged.fetch_sub(delta, Ordering::AcqRel);
                } else {
                    self.stats.pageable.fetch_sub(delta, Ordering::AcqRel);
                    self.stats.non_paged.fetch_add(delta, Ordering::AcqRel);
                }
            }
            for (addr, slot) in &range.pages {
                if let PageSlot::Present { phys } = slot {
                    // Frames still fork-shared keep their read-only
                    // translation; the fault path splits them.
                    let mapped = if frame::refs_of(phys.page_base()) > 1 {
                        eff | Protection::RO
                    } else {
                        eff
                    };
                    platform::map_page(root, VirtAddr::new(*addr), *phys, mapped, true, false)?;
                }
            }
        }
        platform::invalidate_range(self.root, base, size);
        Ok(())
    }

    /// Pin pages against working-set replacement.
    pub fn lock_range(&self, base: VirtAddr, size: usize) {
        let mut inner = self.inner.lock();
        let mut addr = base.page_base();
        while addr.as_u64() < base.as_u64() + size as u64 {
            inner.locked.insert(addr.as_u64());
            addr = addr.offset(PAGE_SIZE as u64);
        }
    }

    pub fn unlock_range(&self, base: VirtAddr, size: usize) {
        let mut inner = self.inner.lock();
        let mut addr = base.page_base();
        while addr.as_u64() < base.as_u64() + size as u64 {
            inner.locked.remove(&addr.as_u64());
            addr = addr.offset(PAGE_SIZE as u64);
        }
    }

    /// Resident bytes across all ranges.
    pub fn resident_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .ranges
            .values()
            .map(|r| r.resident() * PAGE_SIZE)
            .sum()
    }

    /// Clock-style replacement: evict least-recently-used unpinned pages
    /// until resident usage fits the working-set budget. Pages with a
    /// set accessed bit get a second chance. Returns evicted page count.
    pub fn trim_working_set(&self) -> usize {
        let limit = self.working_set_limit.load(Ordering::Acquire);
        let mut evicted = 0usize;
        loop {
            if self.resident_bytes() <= limit {
                break;
            }
            let victim = {
                let inner = self.inner.lock();
                let mut second_chance: Option<u64> = None;
                let mut chosen: Option<u64> = None;
                'scan: for range in inner.ranges.values() {
                    if !range.pageable || range.reserved {
                        continue;
                    }
                    for (addr, slot) in &range.pages {
                        let phys = match slot {
                            PageSlot::Present { phys } => *phys,
                            _ => continue,
                        };
                        if inner.locked.contains(addr) {
                            continue;
                        }
                        if frame::refs_of(phys.page_base()) > 1 {
                            continue;
                        }
                        if platform::take_accessed(self.root, VirtAddr::new(*addr)) {
                            // Recently used: clear and move on.
                            second_chance.get_or_insert(*addr);
                            continue;
                        }
                        chosen = Some(*addr);
                        break 'scan;
                    }
                }
                chosen.or(second_chance)
            };
            let addr = match victim {
                Some(a) => VirtAddr::new(a),
                None => break,
            };
            if self.page_out(addr).is_err() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Evict one resident page into swap.
    pub fn page_out(&self, addr: VirtAddr) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let root = self.root;
        let range = inner
            .range_containing_mut(addr)
            .ok_or(KernelError::NotFound)?;
        let phys = match range.slot(addr) {
            Some(PageSlot::Present { phys }) => phys,
            _ => return Err(KernelError::InvalidOperation),
        };
        let slot = swap::reserve_entry()?;
        swap::write_out(slot, phys.page_base())?;
        platform::set_swap_entry(root, addr, slot)?;
        range.set_slot(addr, PageSlot::Swapped { slot });
        frame::deref_page(phys.page_base());
        self.stats
            .paged_out
            .fetch_add(PAGE_SIZE as u64, Ordering::AcqRel);
        platform::invalidate_range(root, addr.page_base(), PAGE_SIZE);
        Ok(())
    }

    /// Copy the forkable ranges of `src` into `self`, sharing frames
    /// copy-on-write and re-referencing swap slots.
    pub fn fork_from(self: &Arc<Self>, src: &Arc<AddressSpace>) -> KernelResult<()> {
        let src_inner = src.inner.lock();
        let mut dst_inner = self.inner.lock();
        for range in src_inner.ranges.values() {
            if !range.can_fork || range.reserved {
                continue;
            }
            let mut cloned = PageRange {
                base: range.base,
                size: range.size,
                prot: range.prot,
                flags: range.flags,
                backing: range.backing.clone(),
                pageable: range.pageable,
                can_fork: true,
                reserved: false,
                pages: range.pages.clone(),
            };
            for (addr, slot) in &mut cloned.pages {
                match slot {
                    PageSlot::Present { phys } => {
                        let page = phys.page_base();
                        frame::ref_page(page);
                        frame::set_cow(page, frame::CowKind::Symmetric);
                        let ro = range.prot | Protection::RO;
                        platform::map_page(src.root, VirtAddr::new(*addr), *phys, ro, true, false)?;
                        platform::map_page(self.root, VirtAddr::new(*addr), *phys, ro, true, false)?;
                    }
                    PageSlot::Swapped { slot } => {
                        swap::ref_entry(*slot);
                        platform::set_swap_entry(self.root, VirtAddr::new(*addr), *slot)?;
                    }
                }
            }
            dst_inner.ranges.insert(cloned.base.as_u64(), cloned);
            self.stats
                .committed
                .fetch_add(range.size as u64, Ordering::AcqRel);
            if range.pageable {
                self.stats
                    .pageable
                    .fetch_add(range.size as u64, Ordering::AcqRel);
            } else {
                self.stats
                    .non_paged
                    .fetch_add(range.size as u64, Ordering::AcqRel);
            }
        }
        platform::invalidate_range(src.root, VirtAddr::new(0), usize::MAX);
        platform::invalidate_range(self.root, VirtAddr::new(0), usize::MAX);
        Ok(())
    }

    /// Per-page view for `QueryPageInfo`.
    pub fn query_page(&self, addr: VirtAddr) -> Option<PageRangeInfo> {
        let inner = self.inner.lock();
        let range = inner.range_containing(addr)?;
        Some(PageRangeInfo {
            base: range.base,
            size: range.size,
            prot: range.prot,
            pageable: range.pageable,
            reserved: range.reserved,
            file_backed: matches!(range.backing, Backing::File { .. }),
            slot: range.slot(addr),
        })
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for range in inner.ranges.values() {
            for slot in range.pages.values() {
                match slot {
                    PageSlot::Present { phys } => {
                        frame::deref_page(phys.page_base());
                    }
                    PageSlot::Swapped { slot } => swap::deref_entry(*slot),
                }
            }
        }
        platform::free_page_root(self.root);
    }
}

/// Result of [`AddressSpace::query_page`].
#[derive(Debug, Clone)]
pub struct PageRangeInfo {
    pub base: VirtAddr,
    pub size: usize,
    pub prot: Protection,
    pub pageable: bool,
    pub reserved: bool,
    pub file_backed: bool,
    pub slot: Option<PageSlot>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::mm::pmm::{FrameAllocator, MemoryMapEntry};
    use crate::platform::host;

    /// A user address space over a private pool of host-arena frames.
    pub fn user_space(pages: usize) -> Arc<AddressSpace> {
        let base = host::reserve_frames(pages);
        let pool: SharedFrameSource = Arc::new(Mutex::new(FrameAllocator::from_map(&[
            MemoryMapEntry {
                base,
                pages,
                usable: true,
            },
        ])));
        AddressSpace::new_user(pool).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::user_space;
    use super::*;

    #[test]
    fn ranges_never_overlap() {
        let space = user_space(32);
        let a = space
            .alloc(None, 4 * PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        let b = space
            .alloc(None, 4 * PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None)
            .unwrap();
        assert!(b.as_u64() >= a.as_u64() + 4 * PAGE_SIZE as u64);
        // Exact placement over a live range is refused.
        assert_eq!(
            space.alloc(Some(a), PAGE_SIZE, Protection::empty(), AllocFlags::empty(), None),
            Err(KernelError::InUse)
        );
        let inner = space.inner();
        let spans: Vec<(u64, u64)> = inner.ranges.values().map(|r| r.span()).collect();
        for (i, x) in spans.iter().enumerate() {
            for y in spans.iter().skip(i + 1) {
                assert!(x.1 <= y.0 || y.1 <= x.0, "{:?} overlaps {:?}", x, y);
            }
        }
    }

    #[test]
    fn non_paged_alloc_is_populated_and_zeroed() {
        let space = user_space(16);
        let base = space
            .alloc(
                None,
                2 * PAGE_SIZE,
                Protection::empty(),
                AllocFlags::NON_PAGED,
                None,
            )
            .unwrap();
        let info = space.query_page(base).unwrap();
        let phys = match info.slot {
            Some(PageSlot::Present { phys }) => phys,
            other => panic!("expected resident page, got {:?}", other),
        };
        // SAFETY: the frame belongs to this space's private pool.
        let byte = unsafe { *platform::phys_to_virt(phys) };
        assert_eq!(byte, 0);
        let (committed, _, non_paged, _) = space.stats.snapshot();
        assert_eq!(committed, 2 * PAGE_SIZE as u64);
        assert_eq!(non_paged, 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn free_returns_frames_and_stats() {
        let space = user_space(16);
        let pool = space.pool();
        let used_before = pool.lock().stats().used;
        let base = space
            .alloc(
                None,
                2 * PAGE_SIZE,
                Protection::empty(),
                AllocFlags::NON_PAGED,
                None,
            )
            .unwrap();
        assert!(pool.lock().stats().used > used_before);
        space.free(base).unwrap();
        assert_eq!(pool.lock().stats().used, used_before);
        let (committed, _, _, _) = space.stats.snapshot();
        assert_eq!(committed, 0);
        assert_eq!(space.query_page(base).map(|i| i.base), None);
    }

    #[test]
    fn protect_is_idempotent() {
        let space = user_space(16);
        let base = space
            .alloc(
                None,
                4 * PAGE_SIZE,
                Protection::empty(),
                AllocFlags::NON_PAGED,
                None,
            )
            .unwrap();
        // Protect the middle two pages read-only, twice.
        let mid = base.offset(PAGE_SIZE as u64);
        space
            .protect(mid, 2 * PAGE_SIZE, Protection::RO, None)
            .unwrap();
        let snapshot = |s: &Arc<AddressSpace>| {
            let inner = s.inner();
            inner
                .ranges
                .values()
                .map(|r| (r.base.as_u64(), r.size, r.prot))
                .collect::<Vec<_>>()
        };
        let first = snapshot(&space);
        space
            .protect(mid, 2 * PAGE_SIZE, Protection::RO, None)
            .unwrap();
        assert_eq!(first, snapshot(&space));
        // The middle range carries RO, the edges stayed writable.
        assert!(space.query_page(mid).unwrap().prot.contains(Protection::RO));
        assert!(!space.query_page(base).unwrap().prot.contains(Protection::RO));
    }

    #[test]
    fn guard_pages_keep_neighbours_apart() {
        let space = user_space(16);
        let a = space
            .alloc(
                None,
                PAGE_SIZE,
                Protection::empty(),
                AllocFlags::KERNEL_STACK,
                None,
            )
            .unwrap();
        // The guard page below the stack is never mapped.
        let guard = VirtAddr::new(a.as_u64() - PAGE_SIZE as u64);
        assert!(matches!(
            platform::query_page(space.root, guard),
            crate::platform::PageQuery::Unmapped
        ));
    }

    #[test]
    fn page_out_then_stats() {
        let space = user_space(16);
        let base = space
            .alloc(
                None,
                PAGE_SIZE,
                Protection::empty(),
                AllocFlags::NON_PAGED,
                None,
            )
            .unwrap();
        // Write a marker, page it out, verify the slot records it.
        let phys = match space.query_page(base).unwrap().slot {
            Some(PageSlot::Present { phys }) => phys,
            _ => unreachable!(),
        };
        // SAFETY: frame from this space's pool.
        unsafe { platform::phys_to_virt(phys).write(0x7E) };
        space.page_out(base).unwrap();
        match space.query_page(base).unwrap().slot {
            Some(PageSlot::Swapped { .. }) => {}
            other => panic!("expected swapped slot, got {:?}", other),
        }
        let (_, _, _, paged_out) = space.stats.snapshot();
        assert_eq!(paged_out, PAGE_SIZE as u64);
    }

    #[test]
    fn working_set_trim_evicts_cold_pages() {
        let space = user_space(32);
        let base = space
            .alloc(
                None,
                4 * PAGE_SIZE,
                Protection::empty(),
                AllocFlags::PREFAULT,
                None,
            )
            .unwrap();
        let _ = base;
        assert_eq!(space.resident_bytes(), 4 * PAGE_SIZE);
        space
            .working_set_limit
            .store(2 * PAGE_SIZE, Ordering::Release);
        let evicted = space.trim_working_set();
        assert!(evicted >= 2);
        assert!(space.resident_bytes() <= 2 * PAGE_SIZE);
    }
}
