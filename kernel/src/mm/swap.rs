//! Swap providers and refcounted swap entries.
//!
//! The provider is a late-bound trait so a disk-backed pager can replace
//! the default in-RAM provider. Swap slots are refcounted: forked
//! address spaces share a slot until every side has either faulted the
//! page back in or died, and the last dereference returns the slot.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec};

use spin::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::platform;

/// Backing store interface: slots hold exactly one page.
pub trait SwapProvider: Send + Sync {
    fn reserve(&self) -> KernelResult<u64>;
    fn free(&self, slot: u64);
    fn write(&self, slot: u64, src: &[u8]) -> KernelResult<()>;
    fn read(&self, slot: u64, dst: &mut [u8]) -> KernelResult<()>;
}

/// Default provider for systems without a pagefile: pages live on the
/// kernel heap. This trades RAM for the ability to exercise the full
/// page-out path everywhere.
pub struct RamSwap {
    slots: Mutex<BTreeMap<u64, Box<[u8]>>>,
    next: AtomicU64,
}

impl RamSwap {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(1),
        }
    }
}

impl Default for RamSwap {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapProvider for RamSwap {
    fn reserve(&self) -> KernelResult<u64> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .insert(slot, vec![0u8; PAGE_SIZE].into_boxed_slice());
        Ok(slot)
    }

    fn free(&self, slot: u64) {
        self.slots.lock().remove(&slot);
    }

    fn write(&self, slot: u64, src: &[u8]) -> KernelResult<()> {
        let mut slots = self.slots.lock();
        let buf = slots.get_mut(&slot).ok_or(KernelError::NotFound)?;
        buf[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read(&self, slot: u64, dst: &mut [u8]) -> KernelResult<()> {
        let slots = self.slots.lock();
        let buf = slots.get(&slot).ok_or(KernelError::NotFound)?;
        dst.copy_from_slice(&buf[..dst.len()]);
        Ok(())
    }
}

static PROVIDER: RwLock<Option<Arc<dyn SwapProvider>>> = RwLock::new(None);

/// Slot id -> reference count.
static ENTRIES: Mutex<BTreeMap<u64, usize>> = Mutex::new(BTreeMap::new());

/// Install a swap provider. The in-RAM default is used until one is
/// registered.
pub fn register_provider(provider: Arc<dyn SwapProvider>) {
    *PROVIDER.write() = Some(provider);
}

fn provider() -> Arc<dyn SwapProvider> {
    if let Some(p) = PROVIDER.read().as_ref() {
        return p.clone();
    }
    let mut slot = PROVIDER.write();
    if slot.is_none() {
        *slot = Some(Arc::new(RamSwap::new()));
    }
    slot.as_ref().cloned().unwrap_or_else(|| Arc::new(RamSwap::new()))
}

/// Reserve a slot with one reference.
pub fn reserve_entry() -> KernelResult<u64> {
    let slot = provider().reserve()?;
    ENTRIES.lock().insert(slot, 1);
    Ok(slot)
}

/// Share an existing slot (fork of a swapped page).
pub fn ref_entry(slot: u64) {
    if let Some(refs) = ENTRIES.lock().get_mut(&slot) {
        *refs += 1;
    }
}

/// Drop a reference; the last one returns the slot to the provider.
pub fn deref_entry(slot: u64) {
    let mut entries = ENTRIES.lock();
    let gone = match entries.get_mut(&slot) {
        Some(refs) => {
            *refs = refs.saturating_sub(1);
            *refs == 0
        }
        None => false,
    };
    if gone {
        entries.remove(&slot);
        provider().free(slot);
    }
}

pub fn entry_refs(slot: u64) -> usize {
    ENTRIES.lock().get(&slot).copied().unwrap_or(0)
}

/// Page a frame out into `slot`.
pub fn write_out(slot: u64, phys: PhysAddr) -> KernelResult<()> {
    // SAFETY: the caller owns the frame; the window covers it.
    let src = unsafe { core::slice::from_raw_parts(platform::phys_to_virt(phys), PAGE_SIZE) };
    provider().write(slot, src)
}

/// Page a slot back into a frame.
pub fn read_in(slot: u64, phys: PhysAddr) -> KernelResult<()> {
    // SAFETY: the caller owns the destination frame.
    let dst =
        unsafe { core::slice::from_raw_parts_mut(platform::phys_to_virt(phys), PAGE_SIZE) };
    provider().read(slot, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::host;

    #[test]
    fn ram_swap_round_trips_a_page() {
        let frame = host::reserve_frames(1);
        // SAFETY: freshly reserved frame.
        unsafe {
            core::slice::from_raw_parts_mut(platform::phys_to_virt(frame), PAGE_SIZE).fill(0xCD);
        }
        let slot = reserve_entry().unwrap();
        write_out(slot, frame).unwrap();
        // Scribble, then restore from swap.
        unsafe {
            core::slice::from_raw_parts_mut(platform::phys_to_virt(frame), PAGE_SIZE).fill(0);
        }
        read_in(slot, frame).unwrap();
        // SAFETY: same frame.
        let byte = unsafe { *platform::phys_to_virt(frame) };
        assert_eq!(byte, 0xCD);
        deref_entry(slot);
        assert_eq!(entry_refs(slot), 0);
    }

    #[test]
    fn shared_entries_survive_one_deref() {
        let slot = reserve_entry().unwrap();
        ref_entry(slot);
        assert_eq!(entry_refs(slot), 2);
        deref_entry(slot);
        assert_eq!(entry_refs(slot), 1);
        deref_entry(slot);
        assert_eq!(entry_refs(slot), 0);
        // Freed slots no longer accept IO.
        let mut buf = [0u8; PAGE_SIZE];
        assert!(provider().read(slot, &mut buf).is_err());
    }
}
