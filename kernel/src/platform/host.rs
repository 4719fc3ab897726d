//! Host-target platform implementation.
//!
//! Physical memory is a process-global arena indexed by physical address;
//! page tables are software maps in a registry keyed by root token. The
//! arena makes byte-level assertions (CoW splits, page-cache coherence,
//! PMM round-trips) real in unit tests. Tests reserve disjoint frame
//! regions with [`reserve_frames`] so parallel tests never alias.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use alloc::{boxed::Box, collections::BTreeMap, vec};
use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::mm::{page_range::Protection, PhysAddr, VirtAddr, PAGE_SIZE};

use super::{PageInfo, PageQuery, PageTableRoot};

/// Size of the simulated physical address space.
const ARENA_BYTES: usize = 64 * 1024 * 1024;

struct Arena {
    base: *mut u8,
}

// SAFETY: the arena is plain memory; all slicing is bounds-checked by the
// frame reservation discipline and callers synchronize frame ownership.
unsafe impl Send for Arena {}
// SAFETY: as above.
unsafe impl Sync for Arena {}

static ARENA: Once<Arena> = Once::new();

/// Next free physical address for test reservations. Address 0 is never
/// handed out, matching the PMM's page-0 invariant.
static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(PAGE_SIZE as u64);

static CPU_COUNT: AtomicUsize = AtomicUsize::new(4);

static NATIVE_TICK: AtomicU64 = AtomicU64::new(0);

static NEXT_ROOT: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy)]
enum HostEntry {
    Mapped {
        phys: PhysAddr,
        prot: Protection,
        huge: bool,
        accessed: bool,
        dirty: bool,
    },
    Swapped {
        id: u64,
    },
}

type HostSpace = BTreeMap<u64, HostEntry>;

static PAGE_TABLES: Mutex<BTreeMap<u64, HostSpace>> = Mutex::new(BTreeMap::new());

std::thread_local! {
    static THREAD_IRQL: core::cell::Cell<u8> = const { core::cell::Cell::new(0) };
}

fn arena() -> &'static Arena {
    ARENA.call_once(|| {
        let slab = Box::leak(vec![0u8; ARENA_BYTES].into_boxed_slice());
        Arena {
            base: slab.as_mut_ptr(),
        }
    })
}

/// Reserve `pages` frames of simulated RAM and return their base address.
///
/// Each caller gets a disjoint region; tests build their own frame
/// allocators on top of one reservation.
pub fn reserve_frames(pages: usize) -> PhysAddr {
    let len = (pages * PAGE_SIZE) as u64;
    let base = NEXT_RESERVATION.fetch_add(len, Ordering::SeqCst);
    assert!(
        (base + len) as usize <= ARENA_BYTES,
        "host arena exhausted: raise ARENA_BYTES"
    );
    PhysAddr::new(base)
}

/// Advance the simulated platform timer.
pub fn advance_native_ticks(n: u64) {
    NATIVE_TICK.fetch_add(n, Ordering::SeqCst);
}

/// Mark a page accessed, as hardware would on a load or store.
pub fn touch(root: PageTableRoot, virt: VirtAddr) {
    let mut tables = PAGE_TABLES.lock();
    if let Some(space) = tables.get_mut(&root.0) {
        if let Some(HostEntry::Mapped { accessed, .. }) = space.get_mut(&virt.page_base().0) {
            *accessed = true;
        }
    }
}

/// Override the simulated CPU count.
pub fn set_cpu_count(n: usize) {
    CPU_COUNT.store(n.clamp(1, super::MAX_CPUS), Ordering::SeqCst);
}

pub(super) fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst)
}

pub(super) fn cpu_id() -> usize {
    0
}

pub(super) fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    debug_assert!(phys.as_usize() < ARENA_BYTES);
    // SAFETY: the arena spans ARENA_BYTES; the assertion above keeps the
    // offset inside it.
    unsafe { arena().base.add(phys.as_usize()) }
}

pub(super) fn new_page_root() -> KernelResult<PageTableRoot> {
    let id = NEXT_ROOT.fetch_add(1, Ordering::SeqCst);
    PAGE_TABLES.lock().insert(id, BTreeMap::new());
    Ok(PageTableRoot(id))
}

pub(super) fn free_page_root(root: PageTableRoot) {
    PAGE_TABLES.lock().remove(&root.0);
}

pub(super) fn map_page(
    root: PageTableRoot,
    virt: VirtAddr,
    phys: PhysAddr,
    prot: Protection,
    present: bool,
    huge: bool,
) -> KernelResult<()> {
    let mut tables = PAGE_TABLES.lock();
    let space = tables.get_mut(&root.0).ok_or(KernelError::NotFound)?;
    let key = virt.page_base().0;
    if present {
        space.insert(
            key,
            HostEntry::Mapped {
                phys,
                prot,
                huge,
                accessed: true,
                dirty: false,
            },
        );
    } else {
        space.remove(&key);
    }
    Ok(())
}

pub(super) fn set_swap_entry(root: PageTableRoot, virt: VirtAddr, id: u64) -> KernelResult<()> {
    let mut tables = PAGE_TABLES.lock();
    let space = tables.get_mut(&root.0).ok_or(KernelError::NotFound)?;
    space.insert(virt.page_base().0, HostEntry::Swapped { id });
    Ok(())
}

pub(super) fn query_page(root: PageTableRoot, virt: VirtAddr) -> PageQuery {
    let tables = PAGE_TABLES.lock();
    let space = match tables.get(&root.0) {
        Some(s) => s,
        None => return PageQuery::Unmapped,
    };
    match space.get(&virt.page_base().0) {
        None => PageQuery::Unmapped,
        Some(HostEntry::Swapped { id }) => PageQuery::Swapped { id: *id },
        Some(HostEntry::Mapped {
            phys,
            prot,
            huge,
            accessed,
            dirty,
        }) => PageQuery::Mapped(PageInfo {
            phys: *phys,
            prot: *prot,
            huge: *huge,
            accessed: *accessed,
            dirty: *dirty,
        }),
    }
}

pub(super) fn take_accessed(root: PageTableRoot, virt: VirtAddr) -> bool {
    let mut tables = PAGE_TABLES.lock();
    if let Some(space) = tables.get_mut(&root.0) {
        if let Some(HostEntry::Mapped { accessed, .. }) = space.get_mut(&virt.page_base().0) {
            let was = *accessed;
            *accessed = false;
            return was;
        }
    }
    false
}

pub(super) fn invalidate_range(_root: PageTableRoot, _base: VirtAddr, _len: usize) {
    // Software page tables have no TLB; the shootdown is a no-op here.
}

pub(super) fn set_hardware_priority(irql: u8) {
    THREAD_IRQL.with(|v| v.set(irql));
}

pub(super) fn end_of_interrupt() {}

pub(super) fn program_timer(_hz: u64) -> KernelResult<()> {
    Ok(())
}

pub(super) fn native_tick() -> u64 {
    NATIVE_TICK.load(Ordering::SeqCst)
}

pub(super) fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub(super) fn console_write(s: &str) {
    std::eprint!("{}", s);
}

pub(super) fn halt_forever() -> ! {
    std::process::abort();
}

pub(super) fn switch_context(_save: Option<&mut super::CpuContext>, _load: &super::CpuContext) {
    // Threads on the host target never switch stacks; the scheduler's
    // state machine carries the blocking semantics.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_round_trip() {
        let base = reserve_frames(1);
        let p = phys_to_virt(base);
        // SAFETY: base names a freshly reserved frame.
        unsafe {
            p.write(0x5a);
            assert_eq!(p.read(), 0x5a);
        }
    }

    #[test]
    fn software_page_table_map_and_query() {
        let root = new_page_root().unwrap();
        let virt = VirtAddr::new(0x4000_0000);
        let phys = reserve_frames(1);
        map_page(root, virt, phys, Protection::USER, true, false).unwrap();
        match query_page(root, virt) {
            PageQuery::Mapped(info) => assert_eq!(info.phys, phys),
            other => panic!("expected mapping, got {:?}", other),
        }
        assert!(take_accessed(root, virt));
        assert!(!take_accessed(root, virt));
        set_swap_entry(root, virt, 7).unwrap();
        assert_eq!(query_page(root, virt), PageQuery::Swapped { id: 7 });
        map_page(root, virt, phys, Protection::USER, false, false).unwrap();
        assert_eq!(query_page(root, virt), PageQuery::Unmapped);
        free_page_root(root);
    }
}
