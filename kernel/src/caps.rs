//! Capability database.
//!
//! Capabilities are regular files under a configured prefix directory;
//! a file's owner, group and the three exec bits encode who may use the
//! named capability. A missing file permits root only, unless the
//! default-allow switch is on. With several matching supplementary
//! groups, the first match wins.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;
use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::fs::{
    dirent::{self, Dirent},
    vnode::{FilePerm, VnodeKind},
};
use crate::process::Credentials;

/// Where the capability files live unless re-pointed at init.
pub const DEFAULT_PREFIX: &str = "/etc/perms";

static CAP_ROOT: Once<Arc<Dirent>> = Once::new();
static DEFAULT_ALLOW: AtomicBool = AtomicBool::new(false);
static PREFIX: Mutex<&'static str> = Mutex::new(DEFAULT_PREFIX);

/// Decoded capability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub owner: u32,
    pub group: u32,
    pub allow_user: bool,
    pub allow_group: bool,
    pub allow_other: bool,
}

/// Resolve and pin the capability directory. The prefix directory must
/// exist by the time this runs (the boot glue creates it on the root
/// filesystem).
pub fn init(prefix: &'static str, default_allow: bool) -> KernelResult<()> {
    *PREFIX.lock() = prefix;
    DEFAULT_ALLOW.store(default_allow, Ordering::Release);
    let root = dirent::lookup(prefix)?;
    CAP_ROOT.call_once(|| root);
    Ok(())
}

fn cap_root() -> KernelResult<Arc<Dirent>> {
    if let Some(root) = CAP_ROOT.get() {
        return Ok(root.clone());
    }
    dirent::lookup(*PREFIX.lock())
}

fn check_id(id: &str) -> KernelResult<()> {
    if id.is_empty() || id.starts_with('/') {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// Read a capability record.
pub fn fetch(id: &str) -> KernelResult<Capability> {
    check_id(id)?;
    let root = cap_root()?;
    let entry = dirent::lookup_from(&root, id, true)?;
    let vn = entry.vnode().ok_or(KernelError::InternalError {
        reason: "capability dirent without vnode",
    })?;
    let perm = *vn.perm.lock();
    let cap = Capability {
        owner: vn.uid.load(Ordering::Acquire),
        group: vn.gid.load(Ordering::Acquire),
        allow_user: perm.contains(FilePerm::OWNER_X),
        allow_group: perm.contains(FilePerm::GROUP_X),
        allow_other: perm.contains(FilePerm::OTHER_X),
    };
    if cap.allow_other {
        log::warn!("caps: capability \"{}\" allows 'other'", id);
    }
    if !cap.allow_user && !cap.allow_group && !cap.allow_other {
        log::warn!("caps: capability \"{}\" is disabled", id);
    }
    Ok(cap)
}

/// Create or update a capability file.
pub fn set(id: &str, cap: &Capability) -> KernelResult<()> {
    check_id(id)?;
    let root = cap_root()?;
    let entry = match dirent::lookup_from(&root, id, true) {
        Ok(e) => e,
        Err(KernelError::NotFound) => {
            let root_vn = root.vnode().ok_or(KernelError::NotFound)?;
            let (driver, desc, _) = root_vn.io_path()?;
            let new_desc =
                driver
                    .ops
                    .mk_file(desc, id, VnodeKind::Regular, FilePerm::from_mode(0o100))?;
            let vn = crate::fs::vnode::Vnode::new(
                VnodeKind::Regular,
                FilePerm::from_mode(0o100),
                cap.owner,
                cap.group,
            );
            *vn.driver.lock() = Some(driver);
            vn.desc.store(new_desc, Ordering::Release);
            *vn.mount.lock() = root_vn.mount.lock().clone();
            dirent::add_child(&root, id, vn)
        }
        Err(e) => return Err(e),
    };
    let vn = entry.vnode().ok_or(KernelError::NotFound)?;
    let mut mode = FilePerm::empty();
    if cap.allow_user {
        mode |= FilePerm::OWNER_X;
    }
    if cap.allow_group {
        mode |= FilePerm::GROUP_X;
    }
    if cap.allow_other {
        mode |= FilePerm::OTHER_X;
    }
    *vn.perm.lock() = mode;
    vn.uid.store(cap.owner, Ordering::Release);
    vn.gid.store(cap.group, Ordering::Release);
    if let Some(driver) = vn.driver.lock().clone() {
        let _ = driver
            .ops
            .set_file_perms(vn.desc.load(Ordering::Acquire), mode);
    }
    Ok(())
}

/// Whether `creds` may exercise capability `id`.
pub fn check(id: &str, creds: &Credentials) -> KernelResult<()> {
    match fetch(id) {
        Ok(cap) => {
            if creds.euid == 0 {
                return Ok(());
            }
            if cap.allow_user && creds.euid == cap.owner {
                return Ok(());
            }
            if cap.allow_group {
                // First supplementary match wins; the effective gid is
                // checked first.
                if creds.egid == cap.group || creds.groups.iter().any(|&g| g == cap.group) {
                    return Ok(());
                }
            }
            if cap.allow_other {
                return Ok(());
            }
            Err(KernelError::AccessDenied)
        }
        Err(KernelError::NotFound) => {
            if creds.euid == 0 || DEFAULT_ALLOW.load(Ordering::Acquire) {
                Ok(())
            } else {
                Err(KernelError::AccessDenied)
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{register_builtin, DriverHeader};
    use crate::fs::{mount, ramfs::RamFs, vnode::Vnode};

    fn creds(euid: u32, egid: u32, groups: &[u32]) -> Credentials {
        Credentials {
            ruid: euid,
            euid,
            suid: euid,
            rgid: egid,
            egid,
            sgid: egid,
            groups: groups.to_vec(),
        }
    }

    fn mounted_cap_dir() -> Arc<Dirent> {
        static SETUP: Once<Arc<Dirent>> = Once::new();
        SETUP
            .call_once(|| {
                let r = dirent::root();
                let at = dirent::add_child(
                    &r,
                    "captest-perms",
                    Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0),
                );
                let fs = Arc::new(RamFs::new());
                let drv = register_builtin(DriverHeader::named("captest-ramfs"), fs);
                mount::mount("/captest-perms", drv, None).unwrap();
                init("/captest-perms", false).unwrap();
                at
            })
            .clone()
    }

    #[test]
    fn owner_and_group_matching() {
        let _dir = mounted_cap_dir();
        set(
            "net-admin",
            &Capability {
                owner: 100,
                group: 50,
                allow_user: true,
                allow_group: true,
                allow_other: false,
            },
        )
        .unwrap();
        assert!(check("net-admin", &creds(100, 1, &[])).is_ok());
        assert!(check("net-admin", &creds(200, 50, &[])).is_ok());
        // Supplementary group match.
        assert!(check("net-admin", &creds(200, 1, &[50])).is_ok());
        assert_eq!(
            check("net-admin", &creds(200, 1, &[])),
            Err(KernelError::AccessDenied)
        );
        // Root always passes.
        assert!(check("net-admin", &creds(0, 0, &[])).is_ok());
    }

    #[test]
    fn missing_capability_permits_root_only() {
        let _dir = mounted_cap_dir();
        assert!(check("never-created", &creds(0, 0, &[])).is_ok());
        assert_eq!(
            check("never-created", &creds(5, 5, &[])),
            Err(KernelError::AccessDenied)
        );
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert_eq!(
            check("/absolute", &creds(0, 0, &[])),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            check("", &creds(0, 0, &[])),
            Err(KernelError::InvalidArgument)
        );
    }
}
