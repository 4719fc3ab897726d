//! Reader-preferring push lock.
//!
//! Any number of readers share the lock; a writer takes it alone.
//! Readers joining while a writer waits are admitted first, which is the
//! dirent-tree access pattern this lock exists for.

use spin::Mutex as SpinMutex;

use crate::error::KernelResult;

use super::wait::{self, WaitHeader, Waitable};

#[derive(Default)]
struct PushState {
    readers: usize,
    writer: bool,
}

pub struct PushLock {
    state: SpinMutex<PushState>,
    hdr: WaitHeader,
}

impl PushLock {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(PushState {
                readers: 0,
                writer: false,
            }),
            hdr: WaitHeader::new(true, true),
        }
    }

    /// Park on the header, or spin when no thread identity exists yet
    /// (early boot runs before the scheduler has a current thread).
    fn wait_for_turn(&self) -> KernelResult<()> {
        if crate::sched::current_thread().is_some() {
            wait::wait_one(&self.hdr)
        } else {
            crate::platform::spin_hint();
            Ok(())
        }
    }

    /// Enter shared. Waits only while a writer holds the lock.
    pub fn lock_shared(&self) -> KernelResult<()> {
        loop {
            {
                let mut st = self.state.lock();
                if !st.writer {
                    st.readers += 1;
                    return Ok(());
                }
            }
            self.wait_for_turn()?;
        }
    }

    pub fn unlock_shared(&self) -> KernelResult<()> {
        let wake = {
            let mut st = self.state.lock();
            debug_assert!(st.readers > 0);
            st.readers -= 1;
            st.readers == 0
        };
        if wake {
            wait::signal(&self.hdr, false, false)?;
        }
        Ok(())
    }

    /// Enter exclusive. Waits until no reader and no writer holds it.
    pub fn lock_exclusive(&self) -> KernelResult<()> {
        loop {
            {
                let mut st = self.state.lock();
                if !st.writer && st.readers == 0 {
                    st.writer = true;
                    return Ok(());
                }
            }
            self.wait_for_turn()?;
        }
    }

    pub fn unlock_exclusive(&self) -> KernelResult<()> {
        {
            let mut st = self.state.lock();
            debug_assert!(st.writer);
            st.writer = false;
        }
        // Wake the whole list: a waiting swarm of readers may all enter.
        wait::signal(&self.hdr, true, false)
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }
}

impl Default for PushLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Waitable for PushLock {
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
    fn readers_share() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        let l = PushLock::new();
        l.lock_shared().unwrap();
        l.lock_shared().unwrap();
        assert_eq!(l.reader_count(), 2);
        l.unlock_shared().unwrap();
        l.unlock_shared().unwrap();
    }

    #[test]
    fn writer_waits_for_readers() {
        let l = Arc::new(PushLock::new());
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        l.lock_shared().unwrap();

        let l2 = l.clone();
        let w = Thread::new(None, Priority::Normal, u64::MAX);
        let w2 = w.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&w2);
            l2.lock_exclusive().unwrap();
            l2.unlock_exclusive().unwrap();
        });
        while w.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        l.unlock_shared().unwrap();
        join.join().unwrap();
    }
}
