//! Bare-metal x86_64 platform implementation.
//!
//! Page tables are the real 4-level trees; the physical window is the
//! bootloader's full-RAM mapping. The interrupt controller, the IDT
//! trampolines and the context-switch stubs are provided by the boot
//! objects; this module consumes them through their linked symbols.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::{
    instructions::{hlt, interrupts, port::Port, tlb},
    structures::paging::{page_table::PageTableEntry, PageTable, PageTableFlags},
};

use crate::error::{KernelError, KernelResult};
use crate::irql;
use crate::mm::{page_range::Protection, pmm, PhysAddr, VirtAddr, PAGE_SIZE};

use super::{CpuContext, PageInfo, PageQuery, PageTableRoot};

/// Physical-window offset installed by the bootloader.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(1);

static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Swap markers live in non-present entries: bit 9 tags the entry, the
/// slot id sits in the address bits.
const SWAP_TAG: PageTableFlags = PageTableFlags::BIT_9;

extern "C" {
    /// Context-switch stub from the boot objects. Saves the current
    /// register file into `save` (when non-null) and resumes `load`.
    fn helion_context_switch(save: *mut CpuContext, load: *const CpuContext);
    /// End-of-interrupt lane into the interrupt-controller driver.
    fn helion_eoi();
    /// Raise a TLB-shootdown IPI for the given range on every other CPU
    /// and wait for the acknowledgements.
    fn helion_tlb_shootdown(base: u64, len: u64);
}

/// Record boot facts before any other platform call. Called once from the
/// kernel entry point.
pub fn early_init(phys_offset: u64, cpus: usize) {
    PHYS_OFFSET.store(phys_offset, Ordering::SeqCst);
    ONLINE_CPUS.store(cpus.clamp(1, super::MAX_CPUS), Ordering::SeqCst);
    let mut serial = SERIAL.lock();
    if serial.is_none() {
        // SAFETY: 0x3F8 is the standard COM1 base.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        *serial = Some(port);
    }
}

pub(super) fn cpu_count() -> usize {
    ONLINE_CPUS.load(Ordering::SeqCst)
}

pub(super) fn cpu_id() -> usize {
    // The AP bring-up trampoline stores the CPU index in IA32_TSC_AUX.
    // Before SMP start only the BSP runs.
    if ONLINE_CPUS.load(Ordering::SeqCst) == 1 {
        return 0;
    }
    // SAFETY: rdpid/rdtscp are unprivileged reads of IA32_TSC_AUX.
    unsafe {
        let mut aux: u32 = 0;
        core::arch::x86_64::__rdtscp(&mut aux as *mut u32);
        aux as usize
    }
}

pub(super) fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    (PHYS_OFFSET.load(Ordering::SeqCst) + phys.as_u64()) as *mut u8
}

fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    // SAFETY: every paging structure is a frame inside the physical
    // window; the caller owns the table it names.
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

fn alloc_table() -> KernelResult<PhysAddr> {
    let frame = pmm::allocate(1, 1)?;
    let table = table_mut(frame);
    table.zero();
    Ok(frame)
}

fn prot_to_flags(prot: Protection, huge: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if !prot.contains(Protection::RO) {
        flags |= PageTableFlags::WRITABLE;
    }
    if prot.contains(Protection::USER) {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    if !prot.contains(Protection::EXEC) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    if prot.contains(Protection::UNCACHED) {
        flags |= PageTableFlags::NO_CACHE;
    }
    if huge {
        flags |= PageTableFlags::HUGE_PAGE;
    }
    flags
}

fn flags_to_prot(flags: PageTableFlags) -> Protection {
    let mut prot = Protection::empty();
    if !flags.contains(PageTableFlags::WRITABLE) {
        prot |= Protection::RO;
    }
    if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        prot |= Protection::USER;
    }
    if !flags.contains(PageTableFlags::NO_EXECUTE) {
        prot |= Protection::EXEC;
    }
    if flags.contains(PageTableFlags::NO_CACHE) {
        prot |= Protection::UNCACHED;
    }
    prot
}

fn index(virt: VirtAddr, level: usize) -> usize {
    ((virt.as_u64() >> (12 + 9 * level)) & 0x1FF) as usize
}

/// Walk to the L1 entry for `virt`, allocating intermediate tables when
/// `create` is set. With `stop_at_l2` the walk returns the L2 entry
/// (huge-page mappings).
fn walk(
    root: PageTableRoot,
    virt: VirtAddr,
    create: bool,
    stop_at_l2: bool,
) -> KernelResult<&'static mut PageTableEntry> {
    let mut table = table_mut(PhysAddr::new(root.0));
    let lowest = if stop_at_l2 { 1 } else { 0 };
    for level in (1..=3).rev() {
        let entry = &mut table[index(virt, level)];
        if level == lowest {
            break;
        }
        if entry.is_unused() || !entry.flags().contains(PageTableFlags::PRESENT) {
            if !create {
                return Err(KernelError::NotFound);
            }
            let sub = alloc_table()?;
            entry.set_addr(
                x86_64::PhysAddr::new(sub.as_u64()),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Ok(entry);
        }
        table = table_mut(PhysAddr::new(entry.addr().as_u64()));
    }
    Ok(&mut table[index(virt, lowest)])
}

pub(super) fn new_page_root() -> KernelResult<PageTableRoot> {
    let root = alloc_table()?;
    // Kernel-half entries are shared from the live root so every address
    // space sees the same kernel image and physical window.
    let (current, _) = x86_64::registers::control::Cr3::read();
    let src = table_mut(PhysAddr::new(current.start_address().as_u64()));
    let dst = table_mut(root);
    for i in 256..512 {
        dst[i] = src[i].clone();
    }
    Ok(PageTableRoot(root.as_u64()))
}

pub(super) fn free_page_root(root: PageTableRoot) {
    // User-half subtables only; kernel-half entries are shared.
    let l4 = table_mut(PhysAddr::new(root.0));
    for i in 0..256 {
        let e3 = &l4[i];
        if !e3.flags().contains(PageTableFlags::PRESENT) {
            continue;
        }
        let l3 = table_mut(PhysAddr::new(e3.addr().as_u64()));
        for j in 0..512 {
            let e2 = &l3[j];
            if !e2.flags().contains(PageTableFlags::PRESENT)
                || e2.flags().contains(PageTableFlags::HUGE_PAGE)
            {
                continue;
            }
            let l2 = table_mut(PhysAddr::new(e2.addr().as_u64()));
            for k in 0..512 {
                let e1 = &l2[k];
                if !e1.flags().contains(PageTableFlags::PRESENT)
                    || e1.flags().contains(PageTableFlags::HUGE_PAGE)
                {
                    continue;
                }
                pmm::free(PhysAddr::new(e1.addr().as_u64()), 1);
            }
            pmm::free(PhysAddr::new(e2.addr().as_u64()), 1);
        }
        pmm::free(PhysAddr::new(e3.addr().as_u64()), 1);
    }
    pmm::free(PhysAddr::new(root.0), 1);
}

pub(super) fn map_page(
    root: PageTableRoot,
    virt: VirtAddr,
    phys: PhysAddr,
    prot: Protection,
    present: bool,
    huge: bool,
) -> KernelResult<()> {
    if !present {
        if let Ok(entry) = walk(root, virt, false, huge) {
            entry.set_unused();
            tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
        }
        return Ok(());
    }
    let entry = walk(root, virt, true, huge)?;
    entry.set_addr(x86_64::PhysAddr::new(phys.as_u64()), prot_to_flags(prot, huge));
    tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    Ok(())
}

pub(super) fn set_swap_entry(root: PageTableRoot, virt: VirtAddr, id: u64) -> KernelResult<()> {
    let entry = walk(root, virt, true, false)?;
    entry.set_addr(x86_64::PhysAddr::new(id << 12), SWAP_TAG);
    tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    Ok(())
}

pub(super) fn query_page(root: PageTableRoot, virt: VirtAddr) -> PageQuery {
    let entry = match walk(root, virt, false, false) {
        Ok(e) => e,
        Err(_) => return PageQuery::Unmapped,
    };
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) {
        if flags.contains(SWAP_TAG) {
            return PageQuery::Swapped {
                id: entry.addr().as_u64() >> 12,
            };
        }
        return PageQuery::Unmapped;
    }
    PageQuery::Mapped(PageInfo {
        phys: PhysAddr::new(entry.addr().as_u64()),
        prot: flags_to_prot(flags),
        huge: flags.contains(PageTableFlags::HUGE_PAGE),
        accessed: flags.contains(PageTableFlags::ACCESSED),
        dirty: flags.contains(PageTableFlags::DIRTY),
    })
}

pub(super) fn take_accessed(root: PageTableRoot, virt: VirtAddr) -> bool {
    let entry = match walk(root, virt, false, false) {
        Ok(e) => e,
        Err(_) => return false,
    };
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::ACCESSED) {
        return false;
    }
    entry.set_flags(flags - PageTableFlags::ACCESSED);
    tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    true
}

pub(super) fn invalidate_range(_root: PageTableRoot, base: VirtAddr, len: usize) {
    // Whole-space invalidations (fork, exec) flush everything at once.
    if len > 512 * PAGE_SIZE {
        tlb::flush_all();
    } else {
        let mut addr = base.page_base().as_u64();
        let end = base.as_u64() + len as u64;
        while addr < end {
            tlb::flush(x86_64::VirtAddr::new(addr));
            addr += PAGE_SIZE as u64;
        }
    }
    if ONLINE_CPUS.load(Ordering::SeqCst) > 1 {
        // SAFETY: provided by the interrupt-controller objects; blocks
        // until every other CPU acknowledged the flush.
        unsafe { helion_tlb_shootdown(base.as_u64(), len as u64) };
    }
}

pub(super) fn set_hardware_priority(level: u8) {
    // Fine-grained masking belongs to the interrupt-controller driver;
    // the core contract only needs "device interrupts off at or above
    // their level".
    if level >= irql::DEVICE_LOW {
        interrupts::disable();
    } else {
        interrupts::enable();
    }
}

pub(super) fn end_of_interrupt() {
    // SAFETY: linked from the interrupt-controller objects.
    unsafe { helion_eoi() }
}

pub(super) fn program_timer(hz: u64) -> KernelResult<()> {
    if hz == 0 || hz > 1_193_182 {
        return Err(KernelError::InvalidArgument);
    }
    let divisor = (1_193_182u64 / hz) as u16;
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);
    // SAFETY: standard PIT channel-0 rate-generator programming.
    unsafe {
        cmd.write(0x36);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    Ok(())
}

pub(super) fn native_tick() -> u64 {
    // SAFETY: rdtsc is an unprivileged counter read.
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub(super) fn wait_for_interrupt() {
    hlt();
}

pub(super) fn console_write(s: &str) {
    use core::fmt::Write;
    let mut serial = SERIAL.lock();
    if let Some(port) = serial.as_mut() {
        let _ = port.write_str(s);
    }
}

pub(super) fn halt_forever() -> ! {
    interrupts::disable();
    loop {
        hlt();
    }
}

pub(super) fn switch_context(save: Option<&mut CpuContext>, load: &CpuContext) {
    let save_ptr = match save {
        Some(ctx) => ctx as *mut CpuContext,
        None => core::ptr::null_mut(),
    };
    // SAFETY: linked from the boot objects; `load` was produced by a
    // previous save or by thread creation.
    unsafe { helion_context_switch(save_ptr, load as *const CpuContext) }
}
