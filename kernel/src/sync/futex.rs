//! Futexes: user-mode 32-bit words the kernel can sleep on.
//!
//! Buckets are keyed by the word's *physical* address, so processes
//! sharing a mapping contend on the same bucket. Wait pins the backing
//! frame, compares the user word through the physical window and parks on
//! the bucket's header; a value mismatch reports `Retry`.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::{collections::BTreeMap, sync::Arc};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{frame, PhysAddr, VirtAddr};
use crate::platform::{self, PageQuery, PageTableRoot};

use super::wait::{self, WaitHeader, Waitable};

static BUCKETS: Mutex<BTreeMap<u64, Arc<Mutex<FutexBucketSlot>>>> = Mutex::new(BTreeMap::new());

struct FutexBucketSlot {
    bucket: Arc<FutexBucketInner>,
    refs: usize,
}

struct FutexBucketInner {
    hdr: WaitHeader,
}

impl Waitable for FutexBucketInner {
    fn wait_header(&self) -> &WaitHeader {
        &self.hdr
    }
}

fn word_phys(root: PageTableRoot, uaddr: VirtAddr) -> KernelResult<PhysAddr> {
    if uaddr.as_u64() & 0b11 != 0 {
        return Err(KernelError::InvalidArgument);
    }
    match platform::query_page(root, uaddr) {
        PageQuery::Mapped(info) => Ok(info.phys.offset(uaddr.page_offset() as u64)),
        _ => Err(KernelError::PageFault {
            addr: uaddr.as_usize(),
        }),
    }
}

fn bucket_for(key: u64, create: bool) -> Option<Arc<Mutex<FutexBucketSlot>>> {
    let mut buckets = BUCKETS.lock();
    match buckets.get(&key) {
        Some(slot) => {
            slot.lock().refs += 1;
            Some(slot.clone())
        }
        None if create => {
            let slot = Arc::new(Mutex::new(FutexBucketSlot {
                bucket: Arc::new(FutexBucketInner {
                    hdr: WaitHeader::new(false, false),
                }),
                refs: 1,
            }));
            buckets.insert(key, slot.clone());
            Some(slot)
        }
        None => None,
    }
}

fn deref_bucket(key: u64) {
    let mut buckets = BUCKETS.lock();
    let empty = match buckets.get(&key) {
        Some(slot) => {
            let mut s = slot.lock();
            s.refs -= 1;
            s.refs == 0
        }
        None => false,
    };
    if empty {
        buckets.remove(&key);
    }
}

/// Sleep until a wake lands on the word, provided it still holds
/// `expected`. A mismatch reports [`KernelError::Retry`].
///
/// The value comparison runs under the bucket header's waiter lock —
/// the same lock `futex_wake` signals through — so a wake arriving
/// after the comparison always finds the sleeper on the list.
pub fn futex_wait(root: PageTableRoot, uaddr: VirtAddr, expected: u32) -> KernelResult<()> {
    let phys = word_phys(root, uaddr)?;
    // Pin the frame: page-out must not recycle the word under the
    // sleeping thread.
    frame::ref_page(phys.page_base());
    let result = (|| {
        let slot = match bucket_for(phys.as_u64(), true) {
            Some(s) => s,
            None => return Err(KernelError::InternalError { reason: "futex bucket" }),
        };
        let bucket = slot.lock().bucket.clone();
        let word_ptr = platform::phys_to_virt(phys) as *const AtomicU32;
        let r = wait::wait_one_checked(&*bucket, || {
            // SAFETY: word_phys validated alignment and presence; the
            // pin keeps the frame alive.
            let word = unsafe { &*word_ptr };
            word.load(Ordering::SeqCst) == expected
        });
        deref_bucket(phys.as_u64());
        match r {
            Ok(true) => Ok(()),
            Ok(false) => Err(KernelError::Retry),
            Err(e) => Err(e),
        }
    })();
    frame::deref_page(phys.page_base());
    result
}

/// Wake up to `count` sleepers on the word (`usize::MAX` wakes all).
pub fn futex_wake(root: PageTableRoot, uaddr: VirtAddr, count: usize) -> KernelResult<()> {
    let phys = word_phys(root, uaddr)?;
    let slot = match bucket_for(phys.as_u64(), false) {
        Some(s) => s,
        None => return Ok(()),
    };
    let bucket = slot.lock().bucket.clone();
    if count == usize::MAX {
        wait::signal(&*bucket, true, false)?;
    } else {
        for _ in 0..count {
            wait::signal(&*bucket, false, false)?;
        }
    }
    deref_bucket(phys.as_u64());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_range::Protection;
    use crate::platform::host;
    use crate::sched::{self, Priority, Thread, ThreadState};

    fn mapped_word(value: u32) -> (PageTableRoot, VirtAddr) {
        let root = platform::new_page_root().unwrap();
        let frame = host::reserve_frames(1);
        let virt = VirtAddr::new(0x7000_0000);
        platform::map_page(root, virt, frame, Protection::USER, true, false).unwrap();
        // SAFETY: freshly reserved frame.
        unsafe {
            (platform::phys_to_virt(frame) as *mut u32).write(value);
        }
        (root, virt)
    }

    #[test]
    fn mismatch_reports_retry() {
        let (root, virt) = mapped_word(5);
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        assert_eq!(futex_wait(root, virt, 6), Err(KernelError::Retry));
    }

    #[test]
    fn misaligned_word_is_invalid() {
        let (root, virt) = mapped_word(0);
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        assert_eq!(
            futex_wait(root, virt.offset(2), 0),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn wake_releases_a_sleeper() {
        let (root, virt) = mapped_word(1);
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let t2 = t.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&t2);
            futex_wait(root, virt, 1)
        });
        while t.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        futex_wake(root, virt, 1).unwrap();
        assert_eq!(join.join().unwrap(), Ok(()));
    }

    #[test]
    fn unmapped_word_faults() {
        let root = platform::new_page_root().unwrap();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        assert!(matches!(
            futex_wait(root, VirtAddr::new(0x7100_0000), 0),
            Err(KernelError::PageFault { .. })
        ));
    }
}
