//! I/O request packets.
//!
//! The uniform carrier for device I/O, synchronous or not. The caller
//! fills in the operation, submits, and waits on the packet's event;
//! drivers that implement `submit_irp` complete asynchronously, all
//! others are emulated over their synchronous entry points. Finalize
//! settles the transfer counts and status; packets free when the last
//! reference drops.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{sync::Arc, vec, vec::Vec};
use spin::Mutex;

use crate::driver::DevDesc;
use crate::error::{KernelError, KernelResult};
use crate::sync::{wait_one, Event, EventKind};

use super::vnode::Vnode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrpOp {
    Read,
    Write,
}

pub struct Irp {
    pub op: IrpOp,
    pub vnode: Arc<Vnode>,
    pub desc: DevDesc,
    pub buffer: Mutex<Vec<u8>>,
    pub blk_offset: u64,
    pub blk_count: usize,
    /// Report the required transfer without moving bytes.
    pub dry: bool,
    /// Set by the driver (or the emulation) when the operation is done.
    event: Mutex<Option<Arc<Event>>>,
    status: Mutex<Option<KernelResult<()>>>,
    blocks_transferred: AtomicUsize,
    refs: AtomicUsize,
}

impl Irp {
    pub fn read(vnode: Arc<Vnode>, blk_offset: u64, blk_count: usize) -> KernelResult<Arc<Self>> {
        let (driver, desc, _) = vnode.io_path()?;
        let blk = driver.ops.get_blk_size(desc)?;
        Ok(Arc::new(Self {
            op: IrpOp::Read,
            vnode,
            desc,
            buffer: Mutex::new(vec![0u8; blk * blk_count]),
            blk_offset,
            blk_count,
            dry: false,
            event: Mutex::new(None),
            status: Mutex::new(None),
            blocks_transferred: AtomicUsize::new(0),
            refs: AtomicUsize::new(1),
        }))
    }

    pub fn write(vnode: Arc<Vnode>, blk_offset: u64, data: Vec<u8>) -> KernelResult<Arc<Self>> {
        let (driver, desc, _) = vnode.io_path()?;
        let blk = driver.ops.get_blk_size(desc)?;
        let blk_count = data.len().div_ceil(blk);
        Ok(Arc::new(Self {
            op: IrpOp::Write,
            vnode,
            desc,
            buffer: Mutex::new(data),
            blk_offset,
            blk_count,
            dry: false,
            event: Mutex::new(None),
            status: Mutex::new(None),
            blocks_transferred: AtomicUsize::new(0),
            refs: AtomicUsize::new(1),
        }))
    }

    /// Size-probe variant of [`read`](Self::read).
    pub fn dry_read(
        vnode: Arc<Vnode>,
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<Arc<Self>> {
        let irp = Self::read(vnode, blk_offset, blk_count)?;
        // SAFETY-free: sole owner right now.
        let this = Arc::into_inner(irp).ok_or(KernelError::InternalError {
            reason: "fresh irp had extra refs",
        })?;
        Ok(Arc::new(Self { dry: true, ..this }))
    }

    pub fn set_event(&self, event: Arc<Event>) {
        *self.event.lock() = Some(event);
    }

    pub fn event(&self) -> Option<Arc<Event>> {
        self.event.lock().clone()
    }

    pub fn complete(&self, status: KernelResult<()>, blocks: usize) {
        self.blocks_transferred.store(blocks, Ordering::Release);
        *self.status.lock() = Some(status);
        if let Some(event) = self.event.lock().clone() {
            let _ = event.set(false);
        }
    }

    pub fn status(&self) -> Option<KernelResult<()>> {
        *self.status.lock()
    }

    pub fn blocks_transferred(&self) -> usize {
        self.blocks_transferred.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.status.lock().is_some()
    }

    pub fn reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; the packet's buffer is released with the last
    /// one (the `Arc` owns the storage).
    pub fn unreference(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }
}

/// Hand the packet to its driver. Drivers without an asynchronous path
/// are emulated synchronously; the event is pre-signaled.
pub fn submit(irp: &Arc<Irp>) -> KernelResult<()> {
    let (driver, _, base) = irp.vnode.io_path()?;
    match driver.ops.submit_irp(irp) {
        Ok(()) => Ok(()),
        Err(KernelError::Unimplemented) => {
            let event = Arc::new(Event::new(EventKind::Notification));
            irp.set_event(event);
            let blk = driver.ops.get_blk_size(irp.desc)? as u64;
            let base_blocks = base / blk;
            if irp.dry {
                irp.complete(Ok(()), 0);
                return Ok(());
            }
            let result = {
                let mut buffer = irp.buffer.lock();
                match irp.op {
                    IrpOp::Read => driver.ops.read_sync(
                        irp.desc,
                        &mut buffer,
                        base_blocks + irp.blk_offset,
                        irp.blk_count,
                    ),
                    IrpOp::Write => driver.ops.write_sync(
                        irp.desc,
                        &buffer,
                        base_blocks + irp.blk_offset,
                        irp.blk_count,
                    ),
                }
            };
            match result {
                Ok(blocks) => irp.complete(Ok(()), blocks),
                Err(e) => irp.complete(Err(e), 0),
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Park until the packet completes, then run the driver's finalize hook
/// and return the settled status.
pub fn wait(irp: &Arc<Irp>) -> KernelResult<()> {
    if let Some(event) = irp.event() {
        if !irp.is_complete() {
            wait_one(&*event)?;
        }
    }
    let (driver, _, _) = irp.vnode.io_path()?;
    driver.ops.finalize_irp(irp)?;
    irp.status().unwrap_or(Err(KernelError::InternalError {
        reason: "irp completed without a status",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverOps;
    use crate::fs::blockdev::{ramdisk_vnode, RamDisk, RAMDISK_BLOCK};
    use crate::sched::{self, Priority, Thread};

    fn adopt() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
    }

    #[test]
    fn synchronous_read_emulation_completes() {
        adopt();
        let disk = RamDisk::new(4);
        disk.write_sync(0, &[0x42u8; RAMDISK_BLOCK], 2, 1).unwrap();
        let (_driver, vn) = ramdisk_vnode("irp-read-test", disk);
        let irp = Irp::read(vn, 2, 1).unwrap();
        submit(&irp).unwrap();
        wait(&irp).unwrap();
        assert_eq!(irp.blocks_transferred(), 1);
        assert!(irp.blocks_transferred() <= irp.blk_count);
        assert_eq!(irp.buffer.lock()[0], 0x42);
    }

    #[test]
    fn write_then_read_back() {
        adopt();
        let (_driver, vn) = ramdisk_vnode("irp-write-test", RamDisk::new(4));
        let irp = Irp::write(vn.clone(), 1, vec![0x77u8; RAMDISK_BLOCK]).unwrap();
        submit(&irp).unwrap();
        wait(&irp).unwrap();
        assert_eq!(irp.blocks_transferred(), 1);

        let back = Irp::read(vn, 1, 1).unwrap();
        submit(&back).unwrap();
        wait(&back).unwrap();
        assert_eq!(back.buffer.lock()[0], 0x77);
    }

    #[test]
    fn dry_run_reports_without_transfer() {
        adopt();
        let (_driver, vn) = ramdisk_vnode("irp-dry-test", RamDisk::new(4));
        let irp = Irp::dry_read(vn, 0, 2).unwrap();
        submit(&irp).unwrap();
        wait(&irp).unwrap();
        assert_eq!(irp.blocks_transferred(), 0);
        assert!(irp.buffer.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_transfer_has_zero_counts() {
        adopt();
        let (_driver, vn) = ramdisk_vnode("irp-fail-test", RamDisk::new(2));
        // Write far past the device end.
        let irp = Irp::write(vn, 100, vec![0u8; RAMDISK_BLOCK]).unwrap();
        submit(&irp).unwrap();
        assert!(wait(&irp).is_err());
        assert_eq!(irp.blocks_transferred(), 0);
    }

    #[test]
    fn refcount_lifecycle() {
        adopt();
        let (_driver, vn) = ramdisk_vnode("irp-ref-test", RamDisk::new(2));
        let irp = Irp::read(vn, 0, 1).unwrap();
        irp.reference();
        assert_eq!(irp.unreference(), 1);
        assert_eq!(irp.unreference(), 0);
    }
}
