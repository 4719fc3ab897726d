//! Kernel events.
//!
//! Notification events latch: one set wakes every waiter and stays
//! signaled until cleared. Synchronization events wake exactly one
//! waiter and consume the signal.

use crate::error::KernelResult;

use super::wait::{self, WaitHeader, Waitable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Notification,
    Sync,
}

pub struct Event {
    hdr: WaitHeader,
    kind: EventKind,
}

impl Event {
    pub const fn new(kind: EventKind) -> Self {
        Self {
            hdr: WaitHeader::new(true, matches!(kind, EventKind::Sync)),
            kind,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_set(&self) -> bool {
        self.hdr.is_signaled()
    }

    /// Signal the event; notification events wake all waiters, sync
    /// events wake the head of the list.
    pub fn set(&self, boost: bool) -> KernelResult<()> {
        wait::signal(&self.hdr, matches!(self.kind, EventKind::Notification), boost)
    }

    pub fn clear(&self) {
        self.hdr.clear()
    }

    pub fn wait(&self) -> KernelResult<()> {
        wait::wait_one(&self.hdr)
    }
}

impl Waitable for Event {
    fn wait_header(&self) -> &WaitHeader {
        &self.hdr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_event_latches() {
        let e = Event::new(EventKind::Notification);
        assert!(!e.is_set());
        e.set(false).unwrap();
        assert!(e.is_set());
        e.clear();
        assert!(!e.is_set());
    }

    #[test]
    fn sync_event_consumed_by_one_wait() {
        use crate::sched::{self, Priority, Thread};
        let e = alloc::sync::Arc::new(Event::new(EventKind::Sync));
        e.set(false).unwrap();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let e2 = e.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&t);
            e2.wait()
        });
        assert_eq!(join.join().unwrap(), Ok(()));
        // The signal was consumed by the satisfied wait.
        assert!(!e.is_set());
    }
}
