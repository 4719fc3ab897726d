//! Counting semaphore over the waitable header.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};

use super::wait::{self, WaitHeader, Waitable};

pub struct Semaphore {
    hdr: WaitHeader,
    count: AtomicUsize,
}

impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Self {
            hdr: WaitHeader::new(true, true),
            count: AtomicUsize::new(initial),
        }
    }

    fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .is_ok()
    }

    /// Decrement the counter, waiting while it is zero.
    pub fn acquire(&self) -> KernelResult<()> {
        loop {
            if self.try_take() {
                return Ok(());
            }
            wait::wait_one(&self.hdr)?;
        }
    }

    pub fn try_acquire(&self) -> KernelResult<()> {
        if self.try_take() {
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    /// Increment the counter and wake one waiter.
    pub fn release(&self) -> KernelResult<()> {
        self.count.fetch_add(1, Ordering::AcqRel);
        wait::signal(&self.hdr, false, false)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Waitable for Semaphore {
    fn wait_header(&self) -> &WaitHeader {
        &self.hdr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{self, Priority, Thread, ThreadState};
    use alloc::sync::Arc;

    #[test]
    fn counter_gates_acquires() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        let s = Semaphore::new(2);
        s.acquire().unwrap();
        s.acquire().unwrap();
        assert_eq!(s.try_acquire(), Err(KernelError::WouldBlock));
        s.release().unwrap();
        assert_eq!(s.try_acquire(), Ok(()));
    }

    #[test]
    fn release_wakes_a_parked_acquirer() {
        let s = Arc::new(Semaphore::new(0));
        let s2 = s.clone();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let t2 = t.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&t2);
            s2.acquire()
        });
        while t.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        let main = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&main);
        s.release().unwrap();
        assert_eq!(join.join().unwrap(), Ok(()));
        assert_eq!(s.count(), 0);
    }
}
