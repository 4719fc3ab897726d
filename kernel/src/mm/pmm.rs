//! Physical frame allocator.
//!
//! A free list of frame runs keyed by physical address, seeded from the
//! boot memory map. Allocation is a first-fit scan that splits the first
//! node the run fits in (accounting for alignment padding); freeing
//! appends at the tail without coalescing, leaving fragmentation to the
//! next scan. Frames below the 4 GiB line live in a distinct pool so
//! DMA-constrained callers can be served without walking high memory.

use alloc::{collections::VecDeque, sync::Arc};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{PhysAddr, PAGE_SIZE};

/// One entry of the boot-supplied physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: PhysAddr,
    pub pages: usize,
    pub usable: bool,
}

/// Allocation counters, all in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmmStats {
    pub total: usize,
    pub usable: usize,
    pub used: usize,
}

impl PmmStats {
    pub fn free(&self) -> usize {
        self.usable - self.used
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRun {
    base: PhysAddr,
    pages: usize,
}

impl FreeRun {
    fn end(&self) -> u64 {
        self.base.as_u64() + (self.pages * PAGE_SIZE) as u64
    }
}

const FOUR_GIB: u64 = 1 << 32;

/// Free-list allocator over physical page frames.
pub struct FrameAllocator {
    /// Runs at or above the 4 GiB line.
    high: VecDeque<FreeRun>,
    /// Runs below 4 GiB, reserved first for [`FrameAllocator::allocate32`].
    low: VecDeque<FreeRun>,
    stats: PmmStats,
}

impl FrameAllocator {
    pub const fn empty() -> Self {
        Self {
            high: VecDeque::new(),
            low: VecDeque::new(),
            stats: PmmStats {
                total: 0,
                usable: 0,
                used: 0,
            },
        }
    }

    /// Build an allocator from a boot memory map. Page 0 is dropped even
    /// when the map calls it usable.
    pub fn from_map(map: &[MemoryMapEntry]) -> Self {
        let mut pmm = Self::empty();
        for entry in map {
            pmm.stats.total += entry.pages;
            if !entry.usable {
                continue;
            }
            let mut base = entry.base;
            let mut pages = entry.pages;
            if base.as_u64() == 0 {
                base = PhysAddr::new(PAGE_SIZE as u64);
                pages = pages.saturating_sub(1);
            }
            if pages == 0 {
                continue;
            }
            pmm.stats.usable += pages;
            pmm.insert_run(FreeRun { base, pages });
        }
        pmm
    }

    fn insert_run(&mut self, run: FreeRun) {
        if run.end() <= FOUR_GIB {
            self.low.push_back(run);
        } else {
            self.high.push_back(run);
        }
    }

    fn scan(
        list: &mut VecDeque<FreeRun>,
        pages: usize,
        align_pages: usize,
    ) -> Option<PhysAddr> {
        let align = (align_pages.max(1) * PAGE_SIZE) as u64;
        let len = (pages * PAGE_SIZE) as u64;
        for i in 0..list.len() {
            let run = list[i];
            let aligned = run.base.as_u64().next_multiple_of(align);
            if aligned + len > run.end() {
                continue;
            }
            // Split: keep the alignment padding as a prefix run and the
            // remainder as a suffix run, preserving list order.
            let prefix_pages = ((aligned - run.base.as_u64()) / PAGE_SIZE as u64) as usize;
            let suffix_pages = ((run.end() - (aligned + len)) / PAGE_SIZE as u64) as usize;
            list.remove(i);
            if suffix_pages > 0 {
                list.insert(
                    i,
                    FreeRun {
                        base: PhysAddr::new(aligned + len),
                        pages: suffix_pages,
                    },
                );
            }
            if prefix_pages > 0 {
                list.insert(i, FreeRun { base: run.base, pages: prefix_pages });
            }
            return Some(PhysAddr::new(aligned));
        }
        None
    }

    /// Allocate `pages` physically contiguous frames whose base address is
    /// a multiple of `align_pages * PAGE_SIZE`.
    pub fn allocate(&mut self, pages: usize, align_pages: usize) -> KernelResult<PhysAddr> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let found = Self::scan(&mut self.high, pages, align_pages)
            .or_else(|| Self::scan(&mut self.low, pages, align_pages));
        match found {
            Some(base) => {
                self.stats.used += pages;
                Ok(base)
            }
            None => Err(KernelError::NotEnoughMemory {
                requested: pages * PAGE_SIZE,
            }),
        }
    }

    /// Like [`allocate`](Self::allocate) but restricted to frames below
    /// the 4 GiB line.
    pub fn allocate32(&mut self, pages: usize, align_pages: usize) -> KernelResult<PhysAddr> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        match Self::scan(&mut self.low, pages, align_pages) {
            Some(base) => {
                self.stats.used += pages;
                Ok(base)
            }
            None => Err(KernelError::NotEnoughMemory {
                requested: pages * PAGE_SIZE,
            }),
        }
    }

    /// Return a run to the free list. Inserted at the tail; no coalescing.
    pub fn free(&mut self, base: PhysAddr, pages: usize) {
        debug_assert!(base.as_u64() != 0, "freeing page 0");
        debug_assert!(base.is_page_aligned());
        self.insert_run(FreeRun { base, pages });
        self.stats.used -= pages;
    }

    pub fn stats(&self) -> PmmStats {
        self.stats
    }
}

/// A frame pool shared between an address space and the frame tree, so
/// frames freed on the last dereference return to the pool they came
/// from. The kernel uses one global pool; tests build their own.
pub type SharedFrameSource = Arc<Mutex<FrameAllocator>>;

lazy_static! {
    static ref FRAME_ALLOCATOR: SharedFrameSource = Arc::new(Mutex::new(FrameAllocator::empty()));
}

/// Handle to the kernel's global frame pool.
pub fn global_pool() -> SharedFrameSource {
    FRAME_ALLOCATOR.clone()
}

/// Seed the global allocator from the boot memory map. Single-threaded
/// boot context; later mutation only through the lock.
pub fn init(map: &[MemoryMapEntry]) {
    let mut pmm = FRAME_ALLOCATOR.lock();
    if pmm.stats.usable != 0 {
        log::warn!("pmm: init called twice, keeping first map");
        return;
    }
    *pmm = FrameAllocator::from_map(map);
    let stats = pmm.stats();
    log::info!(
        "pmm: {} usable frames ({} MiB), {} total",
        stats.usable,
        stats.usable * PAGE_SIZE / (1024 * 1024),
        stats.total
    );
}

pub fn allocate(pages: usize, align_pages: usize) -> KernelResult<PhysAddr> {
    FRAME_ALLOCATOR.lock().allocate(pages, align_pages)
}

pub fn allocate32(pages: usize, align_pages: usize) -> KernelResult<PhysAddr> {
    FRAME_ALLOCATOR.lock().allocate32(pages, align_pages)
}

pub fn free(base: PhysAddr, pages: usize) {
    FRAME_ALLOCATOR.lock().free(base, pages)
}

pub fn stats() -> PmmStats {
    FRAME_ALLOCATOR.lock().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests never touch frame contents, so synthetic addresses are
    // fine and keep parallel tests independent.
    fn fresh_at(base: u64, pages: usize) -> (FrameAllocator, PhysAddr) {
        let base = PhysAddr::new(base);
        let pmm = FrameAllocator::from_map(&[MemoryMapEntry {
            base,
            pages,
            usable: true,
        }]);
        (pmm, base)
    }

    fn fresh(pages: usize) -> (FrameAllocator, PhysAddr) {
        fresh_at(0x100000, pages)
    }

    #[test]
    fn sequential_allocations_then_free_reuses_block() {
        let (mut pmm, base) = fresh(512);
        let a = pmm.allocate(256, 1).unwrap();
        assert_eq!(a, base);
        assert_eq!(pmm.stats().used, 256);
        let b = pmm.allocate(256, 1).unwrap();
        assert_eq!(b, base.offset(0x100000));
        pmm.free(a, 256);
        assert_eq!(pmm.stats().used, 256);
        let c = pmm.allocate(256, 1).unwrap();
        assert_eq!(c, a);
        assert_eq!(pmm.stats().used, 512);
    }

    #[test]
    fn round_trip_restores_used_count() {
        let (mut pmm, _) = fresh(64);
        let before = pmm.stats();
        let run = pmm.allocate(8, 1).unwrap();
        assert_eq!(pmm.stats().used, before.used + 8);
        pmm.free(run, 8);
        assert_eq!(pmm.stats(), before);
        // The freed frames are reusable.
        let again = pmm.allocate(8, 1).unwrap();
        assert_eq!(again, run);
    }

    #[test]
    fn alignment_pads_within_a_node() {
        // Base is page-aligned but not 4-page-aligned, forcing padding.
        let (mut pmm, base) = fresh_at(0x101000, 64);
        let aligned = pmm.allocate(4, 4).unwrap();
        assert_eq!(aligned.as_u64() % (4 * PAGE_SIZE as u64), 0);
        assert!(aligned.as_u64() > base.as_u64());
        // The padding stays allocatable.
        let pad = pmm.allocate(1, 1).unwrap();
        assert!(pad.as_u64() >= base.as_u64() && pad.as_u64() < aligned.as_u64());
    }

    #[test]
    fn exhaustion_reports_not_enough_memory() {
        let (mut pmm, _) = fresh(16);
        assert!(matches!(
            pmm.allocate(17, 1),
            Err(KernelError::NotEnoughMemory { .. })
        ));
        let all = pmm.allocate(16, 1).unwrap();
        assert!(matches!(
            pmm.allocate(1, 1),
            Err(KernelError::NotEnoughMemory { .. })
        ));
        pmm.free(all, 16);
        assert_eq!(pmm.stats().used, 0);
    }

    #[test]
    fn no_frame_handed_out_twice() {
        let (mut pmm, _) = fresh(32);
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..8 {
            let run = pmm.allocate(4, 1).unwrap();
            assert!(!seen.contains(&run));
            seen.push(run);
        }
    }

    #[test]
    fn allocate32_only_uses_low_memory() {
        // The host arena sits below 4 GiB, so the low pool serves both.
        let (mut pmm, _) = fresh(8);
        let run = pmm.allocate32(4, 1).unwrap();
        assert!(run.is_32bit((4 * PAGE_SIZE) as u64));
        pmm.free(run, 4);
    }

    #[test]
    fn page_zero_is_never_returned() {
        let pmm = FrameAllocator::from_map(&[MemoryMapEntry {
            base: PhysAddr::new(0),
            pages: 4,
            usable: true,
        }]);
        let mut pmm = pmm;
        while let Ok(run) = pmm.allocate(1, 1) {
            assert_ne!(run.as_u64(), 0);
        }
    }
}
