//! Platform shim: the contract between the portable core and the
//! architecture code.
//!
//! Everything the core needs from the hardware goes through this module:
//! page-table edits, the physical-memory window, TLB shootdown, the
//! hardware interrupt-priority mirror, the platform timer, CPU identity
//! and the context-switch entry points. The bare-metal x86_64 side lives
//! in [`x86_64`]; on every other target the [`host`] implementation backs
//! the same calls with a RAM arena and software page tables so the whole
//! core runs under the standard test harness.

use crate::error::KernelResult;
use crate::mm::{page_range::Protection, PhysAddr, VirtAddr};

#[cfg(not(target_os = "none"))]
pub mod host;
#[cfg(not(target_os = "none"))]
use host as imp;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64 as imp;

/// Portable register container for one thread of execution.
///
/// The scheduler stores one per thread together with the IRQL it was
/// saved at; signal delivery copies it into the user `ucontext`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct CpuContext {
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
    pub gpr: [u64; 15],
    pub irql: u8,
}

/// Opaque token naming one top-level page table.
///
/// On x86_64 this is the physical address loaded into CR3; the host
/// implementation hands out registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageTableRoot(pub u64);

/// Result of querying one virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageQuery {
    /// No translation and no swap marker.
    Unmapped,
    /// Non-present entry carrying a swap-slot id.
    Swapped { id: u64 },
    /// Present translation.
    Mapped(PageInfo),
}

/// Attributes of one present page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub phys: PhysAddr,
    pub prot: Protection,
    pub huge: bool,
    pub accessed: bool,
    pub dirty: bool,
}

/// Maximum CPUs the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 32;

/// Number of online CPUs.
pub fn cpu_count() -> usize {
    imp::cpu_count()
}

/// Index of the CPU executing the caller.
pub fn cpu_id() -> usize {
    imp::cpu_id()
}

/// Map a physical address into the kernel's physical-memory window.
///
/// The window covers all usable RAM for the lifetime of the kernel; the
/// PMM free list, CoW copies, futex word access and the page cache all
/// read and write frames through it.
pub fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    imp::phys_to_virt(phys)
}

/// Allocate an empty top-level page table.
pub fn new_page_root() -> KernelResult<PageTableRoot> {
    imp::new_page_root()
}

/// Release a top-level page table and every paging structure under it.
pub fn free_page_root(root: PageTableRoot) {
    imp::free_page_root(root)
}

/// Install, replace or remove one translation.
///
/// `present == false` removes the entry (both translations and swap
/// markers). `huge` selects the large-page size; the address must then be
/// huge-page aligned.
pub fn map_page(
    root: PageTableRoot,
    virt: VirtAddr,
    phys: PhysAddr,
    prot: Protection,
    present: bool,
    huge: bool,
) -> KernelResult<()> {
    imp::map_page(root, virt, phys, prot, present, huge)
}

/// Replace a translation with a non-present entry holding a swap-slot id.
pub fn set_swap_entry(root: PageTableRoot, virt: VirtAddr, id: u64) -> KernelResult<()> {
    imp::set_swap_entry(root, virt, id)
}

/// Query the entry for `virt`.
pub fn query_page(root: PageTableRoot, virt: VirtAddr) -> PageQuery {
    imp::query_page(root, virt)
}

/// Clear the accessed bit for `virt`, returning its previous value.
/// The working-set clock hand uses this for second-chance scanning.
pub fn take_accessed(root: PageTableRoot, virt: VirtAddr) -> bool {
    imp::take_accessed(root, virt)
}

/// Drop TLB entries for `[base, base + len)` on every CPU currently using
/// `root`. On SMP this raises a shootdown IPI per CPU and waits for the
/// acknowledgements.
pub fn invalidate_range(root: PageTableRoot, base: VirtAddr, len: usize) {
    imp::invalidate_range(root, base, len)
}

/// Mirror the software IRQL into the hardware interrupt mask.
pub fn set_hardware_priority(irql: u8) {
    imp::set_hardware_priority(irql)
}

/// Signal end-of-interrupt to the interrupt controller.
pub fn end_of_interrupt() {
    imp::end_of_interrupt()
}

/// Program the platform timer to `hz` ticks per second.
pub fn program_timer(hz: u64) -> KernelResult<()> {
    imp::program_timer(hz)
}

/// Raw monotonic tick from the platform timer source.
pub fn native_tick() -> u64 {
    imp::native_tick()
}

/// Pause inside a spin loop.
#[inline]
pub fn spin_hint() {
    core::hint::spin_loop()
}

/// Halt the calling CPU until the next interrupt (bare metal) or yield
/// the hosting thread (host target).
pub fn wait_for_interrupt() {
    imp::wait_for_interrupt()
}

/// Write bytes to the boot console. Used by the logger and the panic path.
pub fn console_write(s: &str) {
    imp::console_write(s)
}

/// Stop the calling CPU permanently. Only the panic path calls this.
pub fn halt_forever() -> ! {
    imp::halt_forever()
}

/// Save the current register file into `save` (when given) and resume
/// `load`. On the host target this is a no-op: blocked threads park in
/// the scheduler's state machine instead of switching stacks.
pub fn switch_context(save: Option<&mut CpuContext>, load: &CpuContext) {
    imp::switch_context(save, load)
}
