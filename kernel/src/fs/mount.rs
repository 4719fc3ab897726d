//! Mount table.
//!
//! Mounting swaps the mountpoint dirent's vnode for the filesystem
//! root's vnode (keeping the old one for unmount) and clears the cached
//! children so names resolve in the mounted filesystem. Filesystem
//! drivers address their root with descriptor 0.

use core::sync::atomic::Ordering;

use alloc::{sync::Arc, vec::Vec};
use spin::Mutex;

use crate::driver::{DevDesc, LoadedDriver};
use crate::error::{KernelError, KernelResult};

use super::dirent::{self, Dirent, NAMESPACE_LOCK};
use super::vnode::{FilePerm, Vnode, VnodeFlags, VnodeKind};

/// Filesystem-root descriptor by convention.
pub const ROOT_DESC: DevDesc = 0;

pub struct Mount {
    pub fs_driver: Arc<LoadedDriver>,
    /// Backing block device, when the filesystem has one.
    pub device: Option<Arc<Vnode>>,
    pub root_vnode: Mutex<Option<Arc<Vnode>>>,
    pub mountpoint: Mutex<Option<Arc<Dirent>>>,
    /// The vnode displaced by the mount, restored at unmount.
    prev_vnode: Mutex<Option<Arc<Vnode>>>,
}

static MOUNTS: Mutex<Vec<Arc<Mount>>> = Mutex::new(Vec::new());

/// Mount `fs_driver` (optionally backed by `device`) over the directory
/// at `path`.
pub fn mount(
    path: &str,
    fs_driver: Arc<LoadedDriver>,
    device: Option<Arc<Vnode>>,
) -> KernelResult<Arc<Mount>> {
    let at = dirent::lookup(path)?;
    let old_vn = at.vnode().ok_or(KernelError::NotFound)?;
    if old_vn.kind != VnodeKind::Directory {
        return Err(KernelError::InvalidFile);
    }

    NAMESPACE_LOCK.lock_exclusive()?;
    let result = (|| {
        let mount = Arc::new(Mount {
            fs_driver: fs_driver.clone(),
            device,
            root_vnode: Mutex::new(None),
            mountpoint: Mutex::new(Some(at.clone())),
            prev_vnode: Mutex::new(None),
        });

        let perm = fs_driver
            .ops
            .get_file_perms(ROOT_DESC)
            .unwrap_or_else(|_| FilePerm::from_mode(0o755));
        let root_vn = Vnode::new(VnodeKind::Directory, perm, 0, 0);
        *root_vn.driver.lock() = Some(fs_driver.clone());
        root_vn.desc.store(ROOT_DESC, Ordering::Release);
        *root_vn.mount.lock() = Arc::downgrade(&mount);
        root_vn.flags.lock().insert(VnodeFlags::MOUNTPOINT);
        *mount.root_vnode.lock() = Some(root_vn.clone());

        let prev = at.set_vnode(Some(root_vn));
        *mount.prev_vnode.lock() = prev;
        at.clear_children();
        at.is_mountpoint.store(true, Ordering::Release);

        fs_driver.refcount.fetch_add(1, Ordering::AcqRel);
        MOUNTS.lock().push(mount.clone());
        log::info!("vfs: mounted '{}' at {}", fs_driver.header.name, path);
        Ok(mount)
    })();
    NAMESPACE_LOCK.unlock_exclusive()?;
    result
}

/// Tear a mount down, restoring the covered vnode. Fails when the
/// path is not a mountpoint.
pub fn unmount(path: &str) -> KernelResult<()> {
    let at = dirent::lookup(path)?;
    if !at.is_mountpoint.load(Ordering::Acquire) {
        return Err(KernelError::NotFound);
    }
    NAMESPACE_LOCK.lock_exclusive()?;
    let result = (|| {
        let mut mounts = MOUNTS.lock();
        let idx = mounts
            .iter()
            .position(|m| {
                m.mountpoint
                    .lock()
                    .as_ref()
                    .map(|d| Arc::ptr_eq(d, &at))
                    .unwrap_or(false)
            })
            .ok_or(KernelError::NotFound)?;
        let mount = mounts.remove(idx);
        drop(mounts);

        // Write back everything the root cache still holds.
        if let Some(root_vn) = mount.root_vnode.lock().clone() {
            let _ = root_vn.cache.flush(&root_vn);
        }
        let prev = mount.prev_vnode.lock().take();
        at.set_vnode(prev);
        at.clear_children();
        at.is_mountpoint.store(false, Ordering::Release);
        mount.fs_driver.refcount.fetch_sub(1, Ordering::AcqRel);
        log::info!("vfs: unmounted {}", path);
        Ok(())
    })();
    NAMESPACE_LOCK.unlock_exclusive()?;
    result
}

pub fn mount_count() -> usize {
    MOUNTS.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{register_builtin, DriverHeader, DriverOps};
    use crate::fs::ramfs::RamFs;

    #[test]
    fn mount_swaps_the_dirent_vnode_and_unmount_restores() {
        let r = dirent::root();
        let plain = Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0);
        let at = dirent::add_child(&r, "mnt-test", plain.clone());
        let _ = at;

        let fs: alloc::sync::Arc<dyn DriverOps> = Arc::new(RamFs::new());
        let drv = register_builtin(DriverHeader::named("ramfs-mnt-test"), fs);
        mount("/mnt-test", drv.clone(), None).unwrap();

        let mounted = dirent::lookup("/mnt-test").unwrap();
        let vn = mounted.vnode().unwrap();
        assert!(vn.flags.lock().contains(VnodeFlags::MOUNTPOINT));
        assert!(!Arc::ptr_eq(&vn, &plain));

        unmount("/mnt-test").unwrap();
        let restored = dirent::lookup("/mnt-test").unwrap();
        assert!(Arc::ptr_eq(&restored.vnode().unwrap(), &plain));
        dirent::remove_child(&r, "mnt-test");
        let _ = crate::driver::unload(&drv);
    }
}
