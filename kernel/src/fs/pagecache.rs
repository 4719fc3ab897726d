//! Per-vnode page cache.
//!
//! A sparse set of file-offset-indexed pages faulted in from the backing
//! driver on first touch. Writes land in the cache and record a dirty
//! region; regions coalesce when they overlap, and flush walks them in
//! file order writing through the driver.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::PAGE_SIZE;

use super::vnode::Vnode;

/// One dirty byte region, in file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRegion {
    pub fileoff: u64,
    pub sz: u64,
}

impl DirtyRegion {
    fn end(&self) -> u64 {
        self.fileoff + self.sz
    }

    fn overlaps_or_touches(&self, other: &DirtyRegion) -> bool {
        self.fileoff <= other.end() && other.fileoff <= self.end()
    }
}

pub struct PageCache {
    pages: Mutex<BTreeMap<u64, Box<[u8]>>>,
    dirty: Mutex<Vec<DirtyRegion>>,
    refs: AtomicUsize,
}

impl PageCache {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(Vec::new()),
            refs: AtomicUsize::new(1),
        }
    }

    pub fn reference(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Dropping the last reference discards the cached pages.
    pub fn dereference(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pages.lock().clear();
            self.dirty.lock().clear();
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Discard every cached page and dirty record (unmount, tests).
    pub fn drop_pages(&self) {
        self.pages.lock().clear();
        self.dirty.lock().clear();
    }

    /// Read one backing page through the vnode's driver.
    fn fill_from_backing(vn: &Vnode, page_index: u64, buf: &mut [u8]) -> KernelResult<()> {
        let (driver, desc, base) = vn.io_path()?;
        let blk_size = driver.ops.get_blk_size(desc)?;
        if blk_size == 0 || PAGE_SIZE % blk_size != 0 {
            return Err(KernelError::InternalError {
                reason: "bad device block size",
            });
        }
        let byte_off = base + page_index * PAGE_SIZE as u64;
        let blocks = PAGE_SIZE / blk_size;
        let read = driver
            .ops
            .read_sync(desc, buf, byte_off / blk_size as u64, blocks)?;
        // Short reads at end-of-device leave the tail zeroed.
        let _ = read;
        Ok(())
    }

    /// Ensure the page holding `page_index` is resident; runs `f` over
    /// its bytes.
    fn with_page<R>(
        &self,
        vn: &Vnode,
        page_index: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> KernelResult<R> {
        let mut pages = self.pages.lock();
        if !pages.contains_key(&page_index) {
            let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
            Self::fill_from_backing(vn, page_index, &mut buf)?;
            pages.insert(page_index, buf);
        }
        let page = pages.get_mut(&page_index).ok_or(KernelError::InternalError {
            reason: "page vanished under the cache lock",
        })?;
        Ok(f(page))
    }

    /// Read `out.len()` bytes at `offset`, stopping at end of file.
    /// Returns bytes read.
    pub fn read(&self, vn: &Vnode, offset: u64, out: &mut [u8]) -> KernelResult<usize> {
        let file_len = vn.len();
        if offset >= file_len {
            return Ok(0);
        }
        let want = out.len().min((file_len - offset) as usize);
        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let page_index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - in_page).min(want - done);
            self.with_page(vn, page_index, |page| {
                out[done..done + take].copy_from_slice(&page[in_page..in_page + take]);
            })?;
            done += take;
        }
        Ok(done)
    }

    /// Write `data` at `offset`, extending the file when needed and
    /// recording a dirty region.
    pub fn write(&self, vn: &Vnode, offset: u64, data: &[u8]) -> KernelResult<usize> {
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page_index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - in_page).min(data.len() - done);
            self.with_page(vn, page_index, |page| {
                page[in_page..in_page + take].copy_from_slice(&data[done..done + take]);
            })?;
            done += take;
        }
        let end = offset + data.len() as u64;
        if end > vn.len() {
            vn.size.store(end, Ordering::Release);
        }
        self.dirty_region_create(offset, data.len() as u64);
        Ok(done)
    }

    /// Record `[off, off + sz)` dirty, merging overlapping or adjacent
    /// regions into one.
    pub fn dirty_region_create(&self, off: u64, sz: u64) {
        if sz == 0 {
            return;
        }
        let mut dirty = self.dirty.lock();
        let mut merged = DirtyRegion { fileoff: off, sz };
        loop {
            let hit = dirty.iter().position(|r| r.overlaps_or_touches(&merged));
            match hit {
                Some(i) => {
                    let r = dirty.remove(i);
                    let start = r.fileoff.min(merged.fileoff);
                    let end = r.end().max(merged.end());
                    merged = DirtyRegion {
                        fileoff: start,
                        sz: end - start,
                    };
                }
                None => break,
            }
        }
        dirty.push(merged);
    }

    pub fn dirty_regions(&self) -> Vec<DirtyRegion> {
        let mut v = self.dirty.lock().clone();
        v.sort_by_key(|r| r.fileoff);
        v
    }

    /// Write every dirty region back through the driver, in file order.
    pub fn flush(&self, vn: &Vnode) -> KernelResult<()> {
        let regions = {
            let mut dirty = self.dirty.lock();
            let mut v = core::mem::take(&mut *dirty);
            v.sort_by_key(|r| r.fileoff);
            v
        };
        if regions.is_empty() {
            return Ok(());
        }
        let (driver, desc, base) = vn.io_path()?;
        let blk_size = driver.ops.get_blk_size(desc)? as u64;
        if blk_size == 0 {
            return Err(KernelError::InternalError {
                reason: "bad device block size",
            });
        }
        for region in regions {
            // Widen to block boundaries.
            let start = region.fileoff - region.fileoff % blk_size;
            let end = (region.end() + blk_size - 1) / blk_size * blk_size;
            let mut buf = vec![0u8; (end - start) as usize];
            self.read_for_flush(vn, start, &mut buf)?;
            driver
                .ops
                .write_sync(desc, &buf, (base + start) / blk_size, buf.len() / blk_size as usize)?;
        }
        Ok(())
    }

    /// Raw cache read ignoring the file size, for flush widening.
    fn read_for_flush(&self, vn: &Vnode, offset: u64, out: &mut [u8]) -> KernelResult<()> {
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let page_index = pos / PAGE_SIZE as u64;
            let in_page = (pos % PAGE_SIZE as u64) as usize;
            let take = (PAGE_SIZE - in_page).min(out.len() - done);
            self.with_page(vn, page_index, |page| {
                out[done..done + take].copy_from_slice(&page[in_page..in_page + take]);
            })?;
            done += take;
        }
        Ok(())
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Populate `buf` from a file-backed mapping's vnode. Entry point for
/// the page-fault handler.
pub fn read_backing(vn: &Arc<Vnode>, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
    vn.cache.read(vn, offset, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_regions_coalesce() {
        let pc = PageCache::new();
        pc.dirty_region_create(0, 16);
        pc.dirty_region_create(8, 16);
        assert_eq!(
            pc.dirty_regions(),
            alloc::vec![DirtyRegion { fileoff: 0, sz: 24 }]
        );
        pc.dirty_region_create(100, 4);
        assert_eq!(pc.dirty_regions().len(), 2);
        // Bridging region merges everything.
        pc.dirty_region_create(20, 90);
        assert_eq!(
            pc.dirty_regions(),
            alloc::vec![DirtyRegion { fileoff: 0, sz: 110 }]
        );
    }
}
