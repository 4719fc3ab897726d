//! Vnodes: filesystem-agnostic objects behind every open file.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::{sync::Arc, sync::Weak, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;

use crate::driver::{DevDesc, LoadedDriver};
use crate::error::{KernelError, KernelResult};
use crate::process::Credentials;

use super::pagecache::PageCache;

/// Vnode kind; polymorphism collapses to this tag plus the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    CharDev,
    BlockDev,
    Fifo,
    Symlink,
    Socket,
    EventDev,
}

impl VnodeKind {
    /// Decode the wire representation used at the driver ABI.
    pub fn from_index(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Regular),
            1 => Some(Self::Directory),
            2 => Some(Self::CharDev),
            3 => Some(Self::BlockDev),
            4 => Some(Self::Fifo),
            5 => Some(Self::Symlink),
            6 => Some(Self::Socket),
            7 => Some(Self::EventDev),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FilePerm: u16 {
        const OWNER_R = 0o400;
        const OWNER_W = 0o200;
        const OWNER_X = 0o100;
        const GROUP_R = 0o040;
        const GROUP_W = 0o020;
        const GROUP_X = 0o010;
        const OTHER_R = 0o004;
        const OTHER_W = 0o002;
        const OTHER_X = 0o001;
    }
}

impl FilePerm {
    pub fn from_mode(mode: u16) -> Self {
        Self::from_bits_truncate(mode & 0o777)
    }

    pub fn mode(&self) -> u16 {
        self.bits()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VnodeFlags: u32 {
        const MOUNTPOINT = 1 << 0;
        const PARTITION = 1 << 1;
        const EVENT_DEV = 1 << 2;
    }
}

/// A partition overlay on a block device.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInfo {
    /// Byte offset of the partition on the parent device.
    pub off: u64,
    pub len: u64,
    pub part_id: u32,
    pub type_uuid: [u8; 16],
    pub unique_uuid: [u8; 16],
}

/// Kind-specific payload.
#[derive(Clone, Default)]
pub enum VnodePayload {
    #[default]
    None,
    /// The filesystem mounted *on* this vnode.
    Mounted(Arc<super::mount::Mount>),
    Pipe(Arc<super::pipe::Pipe>),
    Event(Arc<crate::sync::Event>),
    Tty(Arc<super::tty::Tty>),
}

pub struct Vnode {
    pub kind: VnodeKind,
    pub perm: Mutex<FilePerm>,
    pub uid: AtomicU32,
    pub gid: AtomicU32,
    pub size: AtomicU64,
    refs: AtomicUsize,
    pub flags: Mutex<VnodeFlags>,
    pub cache: PageCache,
    /// Driver providing the object (device driver or fs driver).
    pub driver: Mutex<Option<Arc<LoadedDriver>>>,
    /// Opaque per-object cookie owned by that driver.
    pub desc: AtomicU64,
    pub payload: Mutex<VnodePayload>,
    pub partitions: Mutex<Vec<PartitionInfo>>,
    /// Mount this vnode belongs to (regular files and directories).
    pub mount: Mutex<Weak<super::mount::Mount>>,
}

impl Vnode {
    pub fn new(kind: VnodeKind, perm: FilePerm, uid: u32, gid: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            perm: Mutex::new(perm),
            uid: AtomicU32::new(uid),
            gid: AtomicU32::new(gid),
            size: AtomicU64::new(0),
            refs: AtomicUsize::new(1),
            flags: Mutex::new(VnodeFlags::empty()),
            cache: PageCache::new(),
            driver: Mutex::new(None),
            desc: AtomicU64::new(0),
            payload: Mutex::new(VnodePayload::None),
            partitions: Mutex::new(Vec::new()),
            mount: Mutex::new(Weak::new()),
        })
    }

    /// A vnode served by `driver` with the given cookie.
    pub fn with_driver(
        kind: VnodeKind,
        perm: FilePerm,
        driver: Arc<LoadedDriver>,
        desc: DevDesc,
    ) -> Arc<Self> {
        let vn = Self::new(kind, perm, 0, 0);
        *vn.driver.lock() = Some(driver);
        vn.desc.store(desc, Ordering::Release);
        vn
    }

    pub fn reference(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dereference(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Driver, cookie and byte base used for raw I/O on this vnode.
    /// Regular files go through their mount's filesystem driver; device
    /// nodes through their own driver. Partition vnodes shift all block
    /// I/O by the partition start.
    pub fn io_path(&self) -> KernelResult<(Arc<LoadedDriver>, DevDesc, u64)> {
        let base = if self.flags.lock().contains(VnodeFlags::PARTITION) {
            self.partitions.lock().first().map(|p| p.off).unwrap_or(0)
        } else {
            0
        };
        match self.kind {
            VnodeKind::CharDev | VnodeKind::BlockDev => {
                let driver = self
                    .driver
                    .lock()
                    .clone()
                    .ok_or(KernelError::InvalidFile)?;
                Ok((driver, self.desc.load(Ordering::Acquire), base))
            }
            _ => {
                if let Some(mount) = self.mount.lock().upgrade() {
                    return Ok((mount.fs_driver.clone(), self.desc.load(Ordering::Acquire), base));
                }
                let driver = self
                    .driver
                    .lock()
                    .clone()
                    .ok_or(KernelError::InvalidFile)?;
                Ok((driver, self.desc.load(Ordering::Acquire), base))
            }
        }
    }

    /// Check an access request against the permission triple. Root
    /// bypasses; otherwise owner, then group (including supplementary
    /// groups), then other.
    pub fn check_access(
        &self,
        creds: &Credentials,
        read: bool,
        write: bool,
        exec: bool,
    ) -> KernelResult<()> {
        if creds.euid == 0 {
            return Ok(());
        }
        let perm = *self.perm.lock();
        let (r, w, x) = if creds.euid == self.uid.load(Ordering::Acquire) {
            (FilePerm::OWNER_R, FilePerm::OWNER_W, FilePerm::OWNER_X)
        } else if creds.in_group(self.gid.load(Ordering::Acquire)) {
            (FilePerm::GROUP_R, FilePerm::GROUP_W, FilePerm::GROUP_X)
        } else {
            (FilePerm::OTHER_R, FilePerm::OTHER_W, FilePerm::OTHER_X)
        };
        if (read && !perm.contains(r)) || (write && !perm.contains(w)) || (exec && !perm.contains(x))
        {
            return Err(KernelError::AccessDenied);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_triples_resolve_by_identity() {
        let vn = Vnode::new(VnodeKind::Regular, FilePerm::from_mode(0o640), 100, 50);
        let owner = Credentials {
            ruid: 100,
            euid: 100,
            suid: 100,
            rgid: 1,
            egid: 1,
            sgid: 1,
            groups: alloc::vec::Vec::new(),
        };
        let group_member = Credentials {
            ruid: 200,
            euid: 200,
            suid: 200,
            rgid: 50,
            egid: 50,
            sgid: 50,
            groups: alloc::vec::Vec::new(),
        };
        let stranger = Credentials {
            ruid: 300,
            euid: 300,
            suid: 300,
            rgid: 9,
            egid: 9,
            sgid: 9,
            groups: alloc::vec::Vec::new(),
        };
        assert!(vn.check_access(&owner, true, true, false).is_ok());
        assert!(vn.check_access(&group_member, true, false, false).is_ok());
        assert_eq!(
            vn.check_access(&group_member, false, true, false),
            Err(KernelError::AccessDenied)
        );
        assert_eq!(
            vn.check_access(&stranger, true, false, false),
            Err(KernelError::AccessDenied)
        );
        // Root bypasses the triple entirely.
        assert!(vn
            .check_access(&Credentials::root(), true, true, true)
            .is_ok());
    }

    #[test]
    fn supplementary_groups_grant_group_class() {
        let vn = Vnode::new(VnodeKind::Regular, FilePerm::from_mode(0o040), 1, 77);
        let creds = Credentials {
            ruid: 5,
            euid: 5,
            suid: 5,
            rgid: 6,
            egid: 6,
            sgid: 6,
            groups: alloc::vec![77],
        };
        assert!(vn.check_access(&creds, true, false, false).is_ok());
    }

    #[test]
    fn mode_round_trip() {
        let p = FilePerm::from_mode(0o755);
        assert_eq!(p.mode(), 0o755);
        assert!(p.contains(FilePerm::OWNER_W));
        assert!(!p.contains(FilePerm::GROUP_W));
    }
}
