//! Shared physical-frame tree.
//!
//! Every frame reachable from more than one address space (CoW after
//! fork, shared file pages, futex-pinned pages) has an entry here keyed
//! by physical address. Dereferencing to zero removes the entry and,
//! for frames the tree owns, returns them to their originating pool.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::mm::{pmm::SharedFrameSource, PhysAddr};

/// Copy-on-write state of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CowKind {
    /// Plain frame; writes go straight through.
    #[default]
    Disabled,
    /// Fork-shared: both sides fault and split on write; the last owner
    /// regains a writable mapping in place.
    Symmetric,
    /// One privileged owner keeps the original; other mappings split.
    Asymmetric,
}

pub struct FrameInfo {
    pub refs: usize,
    pub cow: CowKind,
    pub huge: bool,
    pub dma32: bool,
    /// Frames in a run tracked as one entry (huge pages).
    pub pages: usize,
    source: Option<SharedFrameSource>,
}

static FRAMES: Mutex<BTreeMap<u64, FrameInfo>> = Mutex::new(BTreeMap::new());

/// Register a freshly allocated frame run with one reference. `source`
/// makes the tree the owner: the run is freed there on the last deref.
pub fn track(phys: PhysAddr, pages: usize, huge: bool, dma32: bool, source: Option<SharedFrameSource>) {
    let mut frames = FRAMES.lock();
    frames.insert(
        phys.as_u64(),
        FrameInfo {
            refs: 1,
            cow: CowKind::Disabled,
            huge,
            dma32,
            pages,
            source,
        },
    );
}

/// Take one reference on a frame. Untracked frames get a non-owning
/// entry, which is how transient pins (futex words) work.
pub fn ref_page(phys: PhysAddr) -> usize {
    let mut frames = FRAMES.lock();
    let info = frames.entry(phys.as_u64()).or_insert(FrameInfo {
        refs: 0,
        cow: CowKind::Disabled,
        huge: false,
        dma32: false,
        pages: 1,
        source: None,
    });
    info.refs += 1;
    info.refs
}

/// Drop one reference. At zero the entry is removed and owned frames
/// return to their pool. Returns the remaining count.
pub fn deref_page(phys: PhysAddr) -> usize {
    let mut frames = FRAMES.lock();
    let remaining = match frames.get_mut(&phys.as_u64()) {
        Some(info) => {
            info.refs = info.refs.saturating_sub(1);
            info.refs
        }
        None => return 0,
    };
    if remaining == 0 {
        if let Some(info) = frames.remove(&phys.as_u64()) {
            if let Some(source) = info.source {
                source.lock().free(phys, info.pages);
            }
        }
    }
    remaining
}

pub fn refs_of(phys: PhysAddr) -> usize {
    FRAMES.lock().get(&phys.as_u64()).map_or(0, |i| i.refs)
}

pub fn cow_of(phys: PhysAddr) -> CowKind {
    FRAMES.lock().get(&phys.as_u64()).map_or(CowKind::Disabled, |i| i.cow)
}

pub fn set_cow(phys: PhysAddr, kind: CowKind) {
    if let Some(info) = FRAMES.lock().get_mut(&phys.as_u64()) {
        info.cow = kind;
    }
}

pub fn is_tracked(phys: PhysAddr) -> bool {
    FRAMES.lock().contains_key(&phys.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::{FrameAllocator, MemoryMapEntry};
    use alloc::sync::Arc;

    #[test]
    fn ref_deref_round_trip() {
        let phys = PhysAddr::new(0x9990_0000);
        track(phys, 1, false, false, None);
        assert_eq!(refs_of(phys), 1);
        assert_eq!(ref_page(phys), 2);
        assert_eq!(deref_page(phys), 1);
        assert_eq!(deref_page(phys), 0);
        assert!(!is_tracked(phys));
    }

    #[test]
    fn owned_frame_returns_to_its_pool() {
        let pool: SharedFrameSource = Arc::new(spin::Mutex::new(FrameAllocator::from_map(&[
            MemoryMapEntry {
                base: PhysAddr::new(0x9980_0000),
                pages: 4,
                usable: true,
            },
        ])));
        let frame = pool.lock().allocate(1, 1).unwrap();
        track(frame, 1, false, false, Some(pool.clone()));
        assert_eq!(pool.lock().stats().used, 1);
        deref_page(frame);
        assert_eq!(pool.lock().stats().used, 0);
    }

    #[test]
    fn cow_state_is_per_frame() {
        let phys = PhysAddr::new(0x99A0_0000);
        track(phys, 1, false, false, None);
        assert_eq!(cow_of(phys), CowKind::Disabled);
        set_cow(phys, CowKind::Symmetric);
        assert_eq!(cow_of(phys), CowKind::Symmetric);
        deref_page(phys);
    }
}
