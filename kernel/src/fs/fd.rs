//! File descriptions: an offset, open flags and a vnode reference.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::process::Credentials;

use super::dirent::{self, Dirent};
use super::vnode::{FilePerm, Vnode, VnodeKind, VnodePayload};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const APPEND = 1 << 3;
        const CREATE = 1 << 4;
        const TRUNC = 1 << 5;
        /// Bypass the page cache; I/O goes straight to the driver.
        const UNCACHED = 1 << 6;
        const NONBLOCK = 1 << 7;
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Stat snapshot returned to user mode.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub kind: VnodeKind,
    pub size: u64,
    pub perm: FilePerm,
    pub uid: u32,
    pub gid: u32,
}

pub struct File {
    pub vnode: Arc<Vnode>,
    pub dirent: Option<Arc<Dirent>>,
    pub flags: Mutex<OpenFlags>,
    offset: AtomicU64,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

/// Resolve and open `path` relative to `base`.
pub fn open_at(
    base: &Arc<Dirent>,
    path: &str,
    flags: OpenFlags,
    creds: &Credentials,
    umask: u16,
) -> KernelResult<Arc<File>> {
    let entry = match dirent::lookup_from(base, path, true) {
        Ok(e) => e,
        Err(KernelError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            create_entry(base, path, umask)?
        }
        Err(e) => return Err(e),
    };
    let vnode = entry.vnode().ok_or(KernelError::NotFound)?;
    vnode.check_access(
        creds,
        flags.contains(OpenFlags::READ),
        flags.contains(OpenFlags::WRITE),
        flags.contains(OpenFlags::EXEC),
    )?;
    if flags.contains(OpenFlags::TRUNC) && vnode.kind == VnodeKind::Regular {
        vnode.size.store(0, Ordering::Release);
        vnode.cache.drop_pages();
    }
    vnode.reference();
    Ok(Arc::new(File {
        vnode,
        dirent: Some(entry),
        flags: Mutex::new(flags),
        offset: AtomicU64::new(0),
    }))
}

/// Open from the root namespace.
pub fn open(path: &str, flags: OpenFlags, creds: &Credentials) -> KernelResult<Arc<File>> {
    open_at(&dirent::root(), path, flags, creds, 0o022)
}

/// Wrap an existing vnode (pipes, sockets, devices handed out by the
/// kernel itself).
pub fn from_vnode(vnode: Arc<Vnode>, flags: OpenFlags) -> Arc<File> {
    vnode.reference();
    Arc::new(File {
        vnode,
        dirent: None,
        flags: Mutex::new(flags),
        offset: AtomicU64::new(0),
    })
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

fn create_entry(base: &Arc<Dirent>, path: &str, umask: u16) -> KernelResult<Arc<Dirent>> {
    let (dir_path, name) = split_parent(path);
    if name.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let parent = if dir_path.is_empty() {
        // "name" creates under `base`; "/name" under the root.
        if path.starts_with('/') {
            dirent::root()
        } else {
            base.clone()
        }
    } else {
        dirent::lookup_from(base, dir_path, true)?
    };
    let parent_vn = parent.vnode().ok_or(KernelError::NotFound)?;
    let (driver, desc, _) = parent_vn.io_path()?;
    let perm = FilePerm::from_mode(0o666 & !umask);
    let new_desc = driver.ops.mk_file(desc, name, VnodeKind::Regular, perm)?;
    let vn = Vnode::new(VnodeKind::Regular, perm, 0, 0);
    *vn.driver.lock() = Some(driver);
    vn.desc.store(new_desc, Ordering::Release);
    *vn.mount.lock() = parent_vn.mount.lock().clone();
    Ok(dirent::add_child(&parent, name, vn))
}

/// Create a directory.
pub fn mkdir_at(
    base: &Arc<Dirent>,
    path: &str,
    mode: u16,
    creds: &Credentials,
) -> KernelResult<Arc<Dirent>> {
    let (dir_path, name) = split_parent(path);
    if name.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let parent = if dir_path.is_empty() {
        if path.starts_with('/') {
            dirent::root()
        } else {
            base.clone()
        }
    } else {
        dirent::lookup_from(base, dir_path, true)?
    };
    let parent_vn = parent.vnode().ok_or(KernelError::NotFound)?;
    parent_vn.check_access(creds, false, true, false)?;
    let (driver, desc, _) = parent_vn.io_path()?;
    let perm = FilePerm::from_mode(mode);
    let new_desc = driver
        .ops
        .mk_file(desc, name, VnodeKind::Directory, perm)?;
    let vn = Vnode::new(VnodeKind::Directory, perm, 0, 0);
    *vn.driver.lock() = Some(driver);
    vn.desc.store(new_desc, Ordering::Release);
    *vn.mount.lock() = parent_vn.mount.lock().clone();
    Ok(dirent::add_child(&parent, name, vn))
}

/// Remove a name (and its object when the driver agrees).
pub fn unlink_at(base: &Arc<Dirent>, path: &str, creds: &Credentials) -> KernelResult<()> {
    let entry = dirent::lookup_from(base, path, false)?;
    let vn = entry.vnode().ok_or(KernelError::NotFound)?;
    let parent = entry.parent().ok_or(KernelError::InvalidOperation)?;
    let parent_vn = parent.vnode().ok_or(KernelError::NotFound)?;
    parent_vn.check_access(creds, false, true, false)?;
    let (driver, _, _) = vn.io_path()?;
    driver.ops.remove_file(vn.desc.load(Ordering::Acquire))?;
    dirent::remove_child(&parent, &entry.name);
    Ok(())
}

impl File {
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn at_eof(&self) -> bool {
        self.vnode.kind == VnodeKind::Regular && self.offset() >= self.vnode.len()
    }

    pub fn seek(&self, from: SeekFrom) -> KernelResult<u64> {
        match self.vnode.kind {
            VnodeKind::Fifo | VnodeKind::Socket | VnodeKind::CharDev => {
                return Err(KernelError::InvalidOperation)
            }
            _ => {}
        }
        let new = match from {
            SeekFrom::Start(o) => o as i128,
            SeekFrom::Current(d) => self.offset() as i128 + d as i128,
            SeekFrom::End(d) => self.vnode.len() as i128 + d as i128,
        };
        if new < 0 {
            return Err(KernelError::InvalidArgument);
        }
        self.offset.store(new as u64, Ordering::Release);
        Ok(new as u64)
    }

    /// Read at the descriptor offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let off = self.offset();
        let n = self.read_at(off, buf)?;
        self.offset.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    /// Positional read; the descriptor offset is untouched.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.lock().contains(OpenFlags::READ) {
            return Err(KernelError::AccessDenied);
        }
        match self.vnode.kind {
            VnodeKind::Regular => {
                if self.flags.lock().contains(OpenFlags::UNCACHED) {
                    let (driver, desc, base) = self.vnode.io_path()?;
                    let blk = driver.ops.get_blk_size(desc)? as u64;
                    let n = driver
                        .ops
                        .read_sync(desc, buf, (base + offset) / blk, buf.len())?;
                    Ok(n)
                } else {
                    self.vnode.cache.read(&self.vnode, offset, buf)
                }
            }
            VnodeKind::CharDev | VnodeKind::BlockDev => {
                let (driver, desc, base) = self.vnode.io_path()?;
                let blk = driver.ops.get_blk_size(desc)?.max(1) as u64;
                let blocks = buf.len() / blk as usize;
                let n = driver
                    .ops
                    .read_sync(desc, buf, (base + offset) / blk, blocks.max(1))?;
                Ok(n * blk as usize)
            }
            VnodeKind::Fifo => {
                let pipe = match &*self.vnode.payload.lock() {
                    VnodePayload::Pipe(p) => p.clone(),
                    _ => return Err(KernelError::InvalidFile),
                };
                pipe.read(buf, self.flags.lock().contains(OpenFlags::NONBLOCK))
            }
            VnodeKind::EventDev => Err(KernelError::InvalidOperation),
            _ => {
                let tty = match &*self.vnode.payload.lock() {
                    VnodePayload::Tty(t) => Some(t.clone()),
                    _ => None,
                };
                match tty {
                    Some(t) => t.read(buf, self.flags.lock().contains(OpenFlags::NONBLOCK)),
                    None => Err(KernelError::InvalidOperation),
                }
            }
        }
    }

    /// Write at the descriptor offset (or the end with `APPEND`).
    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let off = if self.flags.lock().contains(OpenFlags::APPEND) {
            self.vnode.len()
        } else {
            self.offset()
        };
        let n = self.write_at(off, buf)?;
        self.offset.store(off + n as u64, Ordering::Release);
        Ok(n)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        if !self.flags.lock().contains(OpenFlags::WRITE) {
            return Err(KernelError::AccessDenied);
        }
        match self.vnode.kind {
            VnodeKind::Regular => {
                if self.flags.lock().contains(OpenFlags::UNCACHED) {
                    let (driver, desc, base) = self.vnode.io_path()?;
                    let blk = driver.ops.get_blk_size(desc)? as u64;
                    driver
                        .ops
                        .write_sync(desc, buf, (base + offset) / blk, buf.len())
                } else {
                    self.vnode.cache.write(&self.vnode, offset, buf)
                }
            }
            VnodeKind::CharDev | VnodeKind::BlockDev => {
                let (driver, desc, base) = self.vnode.io_path()?;
                let blk = driver.ops.get_blk_size(desc)?.max(1) as u64;
                let blocks = (buf.len() / blk as usize).max(1);
                let n = driver
                    .ops
                    .write_sync(desc, buf, (base + offset) / blk, blocks)?;
                Ok(n * blk as usize)
            }
            VnodeKind::Fifo => {
                let pipe = match &*self.vnode.payload.lock() {
                    VnodePayload::Pipe(p) => p.clone(),
                    _ => return Err(KernelError::InvalidFile),
                };
                pipe.write(buf, self.flags.lock().contains(OpenFlags::NONBLOCK))
            }
            _ => {
                let tty = match &*self.vnode.payload.lock() {
                    VnodePayload::Tty(t) => Some(t.clone()),
                    _ => None,
                };
                match tty {
                    Some(t) => t.write(buf),
                    None => Err(KernelError::InvalidOperation),
                }
            }
        }
    }

    /// Write the vnode's dirty cache regions back to the device.
    pub fn flush(&self) -> KernelResult<()> {
        self.vnode.cache.flush(&self.vnode)
    }

    pub fn ioctl(&self, code: u32, arg: usize) -> KernelResult<usize> {
        let (driver, desc, _) = self.vnode.io_path()?;
        driver.ops.ioctl(desc, code, arg)
    }

    pub fn stat(&self) -> FileStat {
        FileStat {
            kind: self.vnode.kind,
            size: self.vnode.len(),
            perm: *self.vnode.perm.lock(),
            uid: self.vnode.uid.load(Ordering::Acquire),
            gid: self.vnode.gid.load(Ordering::Acquire),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let _ = self.vnode.cache.flush(&self.vnode);
        self.vnode.dereference();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{register_builtin, DriverHeader, DriverOps};
    use crate::fs::mount::{self, ROOT_DESC};
    use crate::fs::ramfs::RamFs;
    use alloc::vec;

    fn mounted_ramfs(tag: &str) -> (Arc<RamFs>, Arc<Dirent>) {
        let r = dirent::root();
        let dir_vn = Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0);
        let at = dirent::add_child(&r, tag, dir_vn);
        let fs = Arc::new(RamFs::new());
        let drv = register_builtin(DriverHeader::named(tag), fs.clone());
        mount::mount(&alloc::format!("/{}", tag), drv, None).unwrap();
        (fs, at)
    }

    #[test]
    fn read_through_page_cache_then_flush_hits_the_device() {
        let (fs, _at) = mounted_ramfs("fdtest-cache");
        let desc = fs
            .add_file(ROOT_DESC, "data.bin", &vec![0x01u8; 8192])
            .unwrap();

        let creds = Credentials::root();
        let f = open(
            "/fdtest-cache/data.bin",
            OpenFlags::READ | OpenFlags::WRITE,
            &creds,
        )
        .unwrap();

        // Cold cache: first read faults the first page in.
        assert_eq!(f.vnode.cache.cached_pages(), 0);
        let mut one = [0u8; 1];
        assert_eq!(f.read(&mut one).unwrap(), 1);
        assert_eq!(one[0], 0x01);
        assert!(f.vnode.cache.cached_pages() >= 1);

        // Rewrite the first byte, flush, and check the backing store.
        assert_eq!(f.write_at(0, &[0x02]).unwrap(), 1);
        f.flush().unwrap();
        let mut raw = [0u8; 1];
        assert_eq!(fs.read_sync(desc, &mut raw, 0, 1).unwrap(), 1);
        assert_eq!(raw[0], 0x02);
    }

    #[test]
    fn create_write_reopen_read() {
        let (_fs, _at) = mounted_ramfs("fdtest-create");
        let creds = Credentials::root();
        let f = open(
            "/fdtest-create/notes.txt",
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            &creds,
        )
        .unwrap();
        assert_eq!(f.write(b"persisted").unwrap(), 9);
        f.flush().unwrap();
        drop(f);

        let again = open("/fdtest-create/notes.txt", OpenFlags::READ, &creds).unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(again.read(&mut buf).unwrap(), 9);
        assert_eq!(&buf, b"persisted");
    }

    #[test]
    fn permission_denied_without_matching_bits() {
        let (fs, _at) = mounted_ramfs("fdtest-perm");
        fs.add_file(ROOT_DESC, "secret", b"root only").unwrap();
        fs.set_file_perms(
            fs.path_search(ROOT_DESC, "secret").unwrap(),
            FilePerm::from_mode(0o600),
        )
        .unwrap();
        let mut creds = Credentials::root();
        creds.euid = 1000;
        creds.egid = 1000;
        assert_eq!(
            open("/fdtest-perm/secret", OpenFlags::READ, &creds).unwrap_err(),
            KernelError::AccessDenied
        );
    }

    #[test]
    fn seek_and_eof_tracking() {
        let (fs, _at) = mounted_ramfs("fdtest-seek");
        fs.add_file(ROOT_DESC, "f", b"0123456789").unwrap();
        let creds = Credentials::root();
        let f = open("/fdtest-seek/f", OpenFlags::READ, &creds).unwrap();
        assert_eq!(f.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert!(f.at_eof());
        assert_eq!(f.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert!(!f.at_eof());
    }

    #[test]
    fn unlink_removes_the_name() {
        let (fs, _at) = mounted_ramfs("fdtest-unlink");
        fs.add_file(ROOT_DESC, "gone", b"x").unwrap();
        let creds = Credentials::root();
        assert!(open("/fdtest-unlink/gone", OpenFlags::READ, &creds).is_ok());
        unlink_at(&dirent::root(), "/fdtest-unlink/gone", &creds).unwrap();
        assert_eq!(
            open("/fdtest-unlink/gone", OpenFlags::READ, &creds).unwrap_err(),
            KernelError::NotFound
        );
    }
}
