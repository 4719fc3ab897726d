//! Synchronization primitives.
//!
//! [`spinlock::SpinLock`] is the base primitive, tied to the IRQL. The
//! rest build on the waitable-header rendezvous in [`wait`]: events,
//! the blocking mutex, the counting semaphore, the reader-preferring
//! push lock and futexes.

pub mod event;
pub mod futex;
pub mod mutex;
pub mod pushlock;
pub mod semaphore;
pub mod spinlock;
pub mod wait;

pub use event::{Event, EventKind};
pub use futex::{futex_wait, futex_wake};
pub use mutex::KernelMutex;
pub use pushlock::PushLock;
pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
pub use wait::{
    abort_waiters, signal, wait_many, wait_one, wait_one_checked, WaitHeader, Waitable,
};
