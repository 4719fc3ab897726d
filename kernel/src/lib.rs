//! Helion kernel library.
//!
//! The core of a preemptive multitasking kernel: physical and virtual
//! memory management, IRQL-based interrupt priority with DPCs, the
//! per-CPU priority scheduler, waitable-object synchronization, signals,
//! the process substrate, the VFS and the driver interface.
//!
//! The crate builds for bare metal and for the host target; on the host
//! the platform shim swaps in a RAM arena and software page tables so
//! the unit tests run under the standard harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: the system allocator backs `alloc` so tests can use the
// standard collections.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub mod caps;
pub mod cmdline;
pub mod driver;
pub mod error;
pub mod fs;
pub mod irql;
pub mod klog;
pub mod mm;
pub mod platform;
pub mod process;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod util;

/// Seed the bare-metal kernel heap from a frame run handed over by the
/// boot path.
///
/// # Safety
///
/// `start` must point at `size` bytes of unused, mapped kernel memory
/// and must be called exactly once before the first heap allocation.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn init_heap(start: *mut u8, size: usize) {
    // SAFETY: forwarded contract; the caller owns the region.
    unsafe { ALLOCATOR.lock().init(start, size) };
}

/// Heap exhaustion in a `no_std` kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
