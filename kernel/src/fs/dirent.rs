//! Directory-entry cache and path resolution.
//!
//! The dirent tree rooted at `/` is the global name space. Lookups walk
//! component by component: cache hits short-circuit, misses consult the
//! filesystem driver behind the directory's vnode (`path_search`).
//! Mount points are dirents whose vnode is the mounted filesystem root,
//! so resolution crosses filesystems transparently. Symlinks follow
//! through the driver with a hop limit.
//!
//! The tree and the mount table share one reader-preferring push lock.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
};
use spin::{Mutex, Once};

use crate::error::{KernelError, KernelResult};
use crate::sync::PushLock;

use super::vnode::{FilePerm, Vnode, VnodeKind};

/// Symlink hops tolerated in one resolution.
const SYMLINK_HOP_LIMIT: usize = 16;

/// Serializes dirent-tree and mount edits; readers share.
pub static NAMESPACE_LOCK: PushLock = PushLock::new();

pub struct Dirent {
    pub name: String,
    vnode: Mutex<Option<Arc<Vnode>>>,
    parent: Mutex<Weak<Dirent>>,
    children: Mutex<BTreeMap<String, Arc<Dirent>>>,
    pub is_mountpoint: AtomicBool,
}

static ROOT: Once<Arc<Dirent>> = Once::new();

/// The root dirent. Created on first use with a bare directory vnode;
/// mounting the real root filesystem replaces that vnode.
pub fn root() -> Arc<Dirent> {
    ROOT.call_once(|| {
        let vn = Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0);
        Arc::new(Dirent {
            name: String::new(),
            vnode: Mutex::new(Some(vn)),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(BTreeMap::new()),
            is_mountpoint: AtomicBool::new(false),
        })
    })
    .clone()
}

impl Dirent {
    pub fn vnode(&self) -> Option<Arc<Vnode>> {
        self.vnode.lock().clone()
    }

    pub fn set_vnode(&self, vn: Option<Arc<Vnode>>) -> Option<Arc<Vnode>> {
        core::mem::replace(&mut *self.vnode.lock(), vn)
    }

    pub fn parent(&self) -> Option<Arc<Dirent>> {
        self.parent.lock().upgrade()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Dirent>> {
        self.children.lock().get(name).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Drop the cached children (mount, unmount, invalidation).
    pub fn clear_children(&self) {
        self.children.lock().clear();
    }

    /// Full path from the root.
    pub fn path(self: &Arc<Dirent>) -> String {
        let mut parts = alloc::vec::Vec::new();
        let mut cur = self.clone();
        while let Some(parent) = cur.parent() {
            parts.push(cur.name.clone());
            cur = parent;
        }
        if parts.is_empty() {
            return String::from("/");
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push('/');
            out.push_str(part);
        }
        out
    }
}

/// Insert a named child with its vnode; returns the new dirent.
pub fn add_child(parent: &Arc<Dirent>, name: &str, vnode: Arc<Vnode>) -> Arc<Dirent> {
    let child = Arc::new(Dirent {
        name: name.to_string(),
        vnode: Mutex::new(Some(vnode)),
        parent: Mutex::new(Arc::downgrade(parent)),
        children: Mutex::new(BTreeMap::new()),
        is_mountpoint: AtomicBool::new(false),
    });
    parent
        .children
        .lock()
        .insert(name.to_string(), child.clone());
    child
}

pub fn remove_child(parent: &Arc<Dirent>, name: &str) -> Option<Arc<Dirent>> {
    parent.children.lock().remove(name)
}

/// Build a vnode for a driver object discovered during resolution.
fn vnode_from_desc(
    parent_vn: &Arc<Vnode>,
    desc: crate::driver::DevDesc,
) -> KernelResult<Arc<Vnode>> {
    let (driver, _, _) = parent_vn.io_path()?;
    let kind = driver.ops.get_file_type(desc)?;
    let perm = driver
        .ops
        .get_file_perms(desc)
        .unwrap_or_else(|_| FilePerm::from_mode(0o644));
    let vn = Vnode::new(kind, perm, 0, 0);
    *vn.driver.lock() = Some(driver.clone());
    vn.desc.store(desc, Ordering::Release);
    *vn.mount.lock() = parent_vn.mount.lock().clone();
    if let Ok(size) = driver.ops.get_file_size(desc) {
        vn.size.store(size, Ordering::Release);
    }
    Ok(vn)
}

/// Resolve one component under `dir`, consulting the cache first and the
/// filesystem driver on a miss.
fn resolve_component(dir: &Arc<Dirent>, name: &str) -> KernelResult<Arc<Dirent>> {
    if let Some(hit) = dir.child(name) {
        return Ok(hit);
    }
    let dir_vn = dir.vnode().ok_or(KernelError::NotFound)?;
    if dir_vn.kind != VnodeKind::Directory {
        return Err(KernelError::InvalidFile);
    }
    let (driver, desc, _) = dir_vn.io_path()?;
    let child_desc = driver.ops.path_search(desc, name)?;
    let vn = vnode_from_desc(&dir_vn, child_desc)?;
    Ok(add_child(dir, name, vn))
}

/// Follow a symlink dirent's target through its driver.
fn follow_symlink(entry: &Arc<Dirent>) -> KernelResult<Arc<Vnode>> {
    let vn = entry.vnode().ok_or(KernelError::NotFound)?;
    let (driver, _, _) = vn.io_path()?;
    let target = driver.ops.get_linked_desc(vn.desc.load(Ordering::Acquire))?;
    vnode_from_desc(&vn, target)
}

/// Resolve `path` starting at `base` (absolute paths restart at `/`).
/// `follow_final` also dereferences a symlink in the last component.
pub fn lookup_from(
    base: &Arc<Dirent>,
    path: &str,
    follow_final: bool,
) -> KernelResult<Arc<Dirent>> {
    NAMESPACE_LOCK.lock_shared()?;
    let result = lookup_locked(base, path, follow_final, 0);
    NAMESPACE_LOCK.unlock_shared()?;
    result
}

fn lookup_locked(
    base: &Arc<Dirent>,
    path: &str,
    follow_final: bool,
    hops: usize,
) -> KernelResult<Arc<Dirent>> {
    let mut hop_count = hops;
    let mut cur = if path.starts_with('/') {
        root()
    } else {
        base.clone()
    };
    let components: alloc::vec::Vec<&str> =
        path.split('/').filter(|c| !c.is_empty()).collect();
    for (i, comp) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        match *comp {
            "." => continue,
            ".." => {
                if let Some(parent) = cur.parent() {
                    cur = parent;
                }
                continue;
            }
            name => {
                let entry = resolve_component(&cur, name)?;
                let is_symlink = entry
                    .vnode()
                    .map(|v| v.kind == VnodeKind::Symlink)
                    .unwrap_or(false);
                if is_symlink && (!last || follow_final) {
                    hop_count += 1;
                    if hop_count > SYMLINK_HOP_LIMIT {
                        return Err(KernelError::InvalidOperation);
                    }
                    let target_vn = follow_symlink(&entry)?;
                    // Hop: graft the target vnode onto a fresh traversal
                    // position without disturbing the cached symlink.
                    let hop = Arc::new(Dirent {
                        name: entry.name.clone(),
                        vnode: Mutex::new(Some(target_vn)),
                        parent: Mutex::new(Arc::downgrade(&cur)),
                        children: Mutex::new(BTreeMap::new()),
                        is_mountpoint: AtomicBool::new(false),
                    });
                    if last {
                        return Ok(hop);
                    }
                    cur = hop;
                    continue;
                }
                cur = entry;
            }
        }
    }
    Ok(cur)
}

/// Resolve `path` from the root.
pub fn lookup(path: &str) -> KernelResult<Arc<Dirent>> {
    lookup_from(&root(), path, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_children_resolve_without_a_driver() {
        let r = root();
        let dir_vn = Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0);
        let dir = add_child(&r, "lookup-test", dir_vn);
        let file_vn = Vnode::new(VnodeKind::Regular, FilePerm::from_mode(0o644), 0, 0);
        add_child(&dir, "inner.txt", file_vn.clone());

        let found = lookup("/lookup-test/inner.txt").unwrap();
        assert!(Arc::ptr_eq(&found.vnode().unwrap(), &file_vn));
        assert_eq!(found.path(), "/lookup-test/inner.txt");
        remove_child(&r, "lookup-test");
    }

    #[test]
    fn dot_and_dotdot_navigate() {
        let r = root();
        let a = add_child(
            &r,
            "dot-test",
            Vnode::new(VnodeKind::Directory, FilePerm::from_mode(0o755), 0, 0),
        );
        add_child(
            &a,
            "leaf",
            Vnode::new(VnodeKind::Regular, FilePerm::from_mode(0o644), 0, 0),
        );
        let found = lookup("/dot-test/./../dot-test/leaf").unwrap();
        assert_eq!(found.name, "leaf");
        remove_child(&r, "dot-test");
    }

    #[test]
    fn missing_component_reports_not_found() {
        // The bare root vnode has no driver: misses cannot be filled.
        assert!(lookup("/no-such-entry-anywhere").is_err());
    }
}
