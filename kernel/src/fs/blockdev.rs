//! RAM-backed block device.
//!
//! The early-boot block device (initrd image, tests): 512-byte blocks
//! over a heap buffer, served through the standard driver interface so
//! everything above it (page cache, partitions, filesystems) is
//! exercised the same way a disk would be.

use alloc::{sync::Arc, vec, vec::Vec};
use spin::Mutex;

use crate::driver::{register_builtin, DevDesc, DriverHeader, DriverOps, LoadedDriver};
use crate::error::{KernelError, KernelResult};

use super::vnode::{FilePerm, Vnode, VnodeKind};

/// Block size every RAM disk uses.
pub const RAMDISK_BLOCK: usize = 512;

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; blocks * RAMDISK_BLOCK]),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = bytes.to_vec();
        let rem = data.len() % RAMDISK_BLOCK;
        if rem != 0 {
            data.resize(data.len() + RAMDISK_BLOCK - rem, 0);
        }
        Self {
            data: Mutex::new(data),
        }
    }
}

impl DriverOps for RamDisk {
    fn get_blk_size(&self, _desc: DevDesc) -> KernelResult<usize> {
        Ok(RAMDISK_BLOCK)
    }

    fn get_max_blk_count(&self, _desc: DevDesc) -> KernelResult<u64> {
        Ok((self.data.lock().len() / RAMDISK_BLOCK) as u64)
    }

    fn read_sync(
        &self,
        _desc: DevDesc,
        buf: &mut [u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let data = self.data.lock();
        let start = blk_offset as usize * RAMDISK_BLOCK;
        if start >= data.len() {
            return Ok(0);
        }
        let want = (blk_count * RAMDISK_BLOCK).min(buf.len());
        let take = want.min(data.len() - start);
        buf[..take].copy_from_slice(&data[start..start + take]);
        Ok(take / RAMDISK_BLOCK)
    }

    fn write_sync(
        &self,
        _desc: DevDesc,
        buf: &[u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let mut data = self.data.lock();
        let start = blk_offset as usize * RAMDISK_BLOCK;
        if start >= data.len() {
            return Err(KernelError::InvalidArgument);
        }
        let want = (blk_count * RAMDISK_BLOCK).min(buf.len());
        let take = want.min(data.len() - start);
        data[start..start + take].copy_from_slice(&buf[..take]);
        Ok(take / RAMDISK_BLOCK)
    }

    fn query_user_readable_name(&self, _desc: DevDesc) -> KernelResult<alloc::string::String> {
        Ok(alloc::string::String::from("RAM disk"))
    }
}

/// Register a RAM disk driver and wrap it in a block-device vnode.
pub fn ramdisk_vnode(name: &str, disk: RamDisk) -> (Arc<LoadedDriver>, Arc<Vnode>) {
    let driver = register_builtin(DriverHeader::named(name), Arc::new(disk));
    let vn = Vnode::with_driver(
        VnodeKind::BlockDev,
        FilePerm::from_mode(0o600),
        driver.clone(),
        0,
    );
    let blocks = driver.ops.get_max_blk_count(0).unwrap_or(0);
    vn.size
        .store(blocks * RAMDISK_BLOCK as u64, core::sync::atomic::Ordering::Release);
    (driver, vn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_io_round_trip() {
        let disk = RamDisk::new(8);
        let mut block = [0xA5u8; RAMDISK_BLOCK];
        assert_eq!(disk.write_sync(0, &block, 3, 1), Ok(1));
        block.fill(0);
        assert_eq!(disk.read_sync(0, &mut block, 3, 1), Ok(1));
        assert!(block.iter().all(|&b| b == 0xA5));
        // Out-of-range write is refused.
        assert!(disk.write_sync(0, &block, 100, 1).is_err());
    }

    #[test]
    fn vnode_wrapping_records_size() {
        let (driver, vn) = ramdisk_vnode("ramdisk-size-test", RamDisk::new(4));
        assert_eq!(vn.kind, VnodeKind::BlockDev);
        assert_eq!(vn.len(), 4 * RAMDISK_BLOCK as u64);
        let _ = crate::driver::unload(&driver);
    }
}
