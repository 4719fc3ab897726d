//! In-memory filesystem.
//!
//! Serves as the initial root and the initrd mount target, and doubles
//! as the reference implementation of the filesystem half of the driver
//! function table. Nodes live in one descriptor-indexed table; data is
//! byte-addressed (block size 1).

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use spin::Mutex;

use crate::driver::{DevDesc, DriverOps};
use crate::error::{KernelError, KernelResult};

use super::vnode::{FilePerm, VnodeKind};

struct RamNode {
    kind: VnodeKind,
    perm: FilePerm,
    data: Vec<u8>,
    children: BTreeMap<String, DevDesc>,
    link_target: Option<DevDesc>,
    parent: DevDesc,
}

pub struct RamFs {
    nodes: Mutex<BTreeMap<DevDesc, RamNode>>,
    next_desc: Mutex<DevDesc>,
}

impl RamFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            super::mount::ROOT_DESC,
            RamNode {
                kind: VnodeKind::Directory,
                perm: FilePerm::from_mode(0o755),
                data: Vec::new(),
                children: BTreeMap::new(),
                link_target: None,
                parent: super::mount::ROOT_DESC,
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            next_desc: Mutex::new(1),
        }
    }

    fn alloc_desc(&self) -> DevDesc {
        let mut next = self.next_desc.lock();
        let d = *next;
        *next += 1;
        d
    }

    /// Point an existing symlink node at a target descriptor.
    pub fn set_link_target(&self, link: DevDesc, target: DevDesc) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&link).ok_or(KernelError::NotFound)?;
        if node.kind != VnodeKind::Symlink {
            return Err(KernelError::InvalidFile);
        }
        node.link_target = Some(target);
        Ok(())
    }

    /// Convenience used by the initrd unpacker and tests.
    pub fn add_file(&self, parent: DevDesc, name: &str, contents: &[u8]) -> KernelResult<DevDesc> {
        let desc = self.mk_file(parent, name, VnodeKind::Regular, FilePerm::from_mode(0o644))?;
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&desc).ok_or(KernelError::NotFound)?;
        node.data = contents.to_vec();
        Ok(desc)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverOps for RamFs {
    fn get_blk_size(&self, _desc: DevDesc) -> KernelResult<usize> {
        Ok(1)
    }

    fn get_max_blk_count(&self, desc: DevDesc) -> KernelResult<u64> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&desc).ok_or(KernelError::NotFound)?;
        Ok(node.data.len() as u64)
    }

    fn read_sync(
        &self,
        desc: DevDesc,
        buf: &mut [u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&desc).ok_or(KernelError::NotFound)?;
        let off = blk_offset as usize;
        if off >= node.data.len() {
            // Past the end: report zero blocks, leave the buffer zeroed.
            return Ok(0);
        }
        let take = blk_count.min(buf.len()).min(node.data.len() - off);
        buf[..take].copy_from_slice(&node.data[off..off + take]);
        Ok(take)
    }

    fn write_sync(
        &self,
        desc: DevDesc,
        buf: &[u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&desc).ok_or(KernelError::NotFound)?;
        if node.kind != VnodeKind::Regular {
            return Err(KernelError::InvalidOperation);
        }
        let off = blk_offset as usize;
        let len = blk_count.min(buf.len());
        if off + len > node.data.len() {
            node.data.resize(off + len, 0);
        }
        node.data[off..off + len].copy_from_slice(&buf[..len]);
        Ok(len)
    }

    fn path_search(&self, parent: DevDesc, name: &str) -> KernelResult<DevDesc> {
        let nodes = self.nodes.lock();
        let dir = nodes.get(&parent).ok_or(KernelError::NotFound)?;
        dir.children.get(name).copied().ok_or(KernelError::NotFound)
    }

    fn get_linked_desc(&self, desc: DevDesc) -> KernelResult<DevDesc> {
        let nodes = self.nodes.lock();
        let node = nodes.get(&desc).ok_or(KernelError::NotFound)?;
        node.link_target.ok_or(KernelError::InvalidFile)
    }

    fn mk_file(
        &self,
        parent: DevDesc,
        name: &str,
        kind: VnodeKind,
        perm: FilePerm,
    ) -> KernelResult<DevDesc> {
        if name.is_empty() || name.contains('/') {
            return Err(KernelError::InvalidArgument);
        }
        let desc = self.alloc_desc();
        let mut nodes = self.nodes.lock();
        let dir = nodes.get_mut(&parent).ok_or(KernelError::NotFound)?;
        if dir.kind != VnodeKind::Directory {
            return Err(KernelError::InvalidFile);
        }
        if dir.children.contains_key(name) {
            return Err(KernelError::InUse);
        }
        dir.children.insert(name.to_string(), desc);
        nodes.insert(
            desc,
            RamNode {
                kind,
                perm,
                data: Vec::new(),
                children: BTreeMap::new(),
                link_target: None,
                parent,
            },
        );
        Ok(desc)
    }

    fn remove_file(&self, desc: DevDesc) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get(&desc).ok_or(KernelError::NotFound)?;
        if !node.children.is_empty() {
            return Err(KernelError::InUse);
        }
        let parent = node.parent;
        nodes.remove(&desc);
        if let Some(dir) = nodes.get_mut(&parent) {
            dir.children.retain(|_, d| *d != desc);
        }
        Ok(())
    }

    fn get_file_perms(&self, desc: DevDesc) -> KernelResult<FilePerm> {
        let nodes = self.nodes.lock();
        nodes
            .get(&desc)
            .map(|n| n.perm)
            .ok_or(KernelError::NotFound)
    }

    fn set_file_perms(&self, desc: DevDesc, perm: FilePerm) -> KernelResult<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&desc).ok_or(KernelError::NotFound)?;
        node.perm = perm;
        Ok(())
    }

    fn get_file_type(&self, desc: DevDesc) -> KernelResult<VnodeKind> {
        let nodes = self.nodes.lock();
        nodes
            .get(&desc)
            .map(|n| n.kind)
            .ok_or(KernelError::NotFound)
    }

    fn get_file_size(&self, desc: DevDesc) -> KernelResult<u64> {
        self.get_max_blk_count(desc)
    }

    fn list_dir(
        &self,
        desc: DevDesc,
        cb: &mut dyn FnMut(&str, DevDesc) -> bool,
    ) -> KernelResult<()> {
        let entries: Vec<(String, DevDesc)> = {
            let nodes = self.nodes.lock();
            let dir = nodes.get(&desc).ok_or(KernelError::NotFound)?;
            if dir.kind != VnodeKind::Directory {
                return Err(KernelError::InvalidFile);
            }
            dir.children
                .iter()
                .map(|(n, d)| (n.clone(), *d))
                .collect()
        };
        for (name, d) in entries {
            if !cb(&name, d) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mount::ROOT_DESC;

    #[test]
    fn files_round_trip_and_list() {
        let fs = RamFs::new();
        let f = fs.add_file(ROOT_DESC, "hello.txt", b"hi there").unwrap();
        assert_eq!(fs.get_file_size(f), Ok(8));
        let mut buf = [0u8; 8];
        assert_eq!(fs.read_sync(f, &mut buf, 0, 8), Ok(8));
        assert_eq!(&buf, b"hi there");
        // Partial read from an offset.
        let mut tail = [0u8; 5];
        assert_eq!(fs.read_sync(f, &mut tail, 3, 5), Ok(5));
        assert_eq!(&tail, b"there");

        let mut names = Vec::new();
        fs.list_dir(ROOT_DESC, &mut |name, _| {
            names.push(name.to_string());
            true
        })
        .unwrap();
        assert_eq!(names, alloc::vec![String::from("hello.txt")]);
    }

    #[test]
    fn directories_nest_and_resolve() {
        let fs = RamFs::new();
        let d = fs
            .mk_file(ROOT_DESC, "etc", VnodeKind::Directory, FilePerm::from_mode(0o755))
            .unwrap();
        let f = fs.add_file(d, "motd", b"welcome").unwrap();
        assert_eq!(fs.path_search(ROOT_DESC, "etc"), Ok(d));
        assert_eq!(fs.path_search(d, "motd"), Ok(f));
        assert_eq!(fs.path_search(d, "nope"), Err(KernelError::NotFound));
        assert_eq!(fs.get_file_type(d), Ok(VnodeKind::Directory));
    }

    #[test]
    fn symlinks_store_their_target() {
        let fs = RamFs::new();
        let target = fs.add_file(ROOT_DESC, "real", b"data").unwrap();
        let link = fs
            .mk_file(ROOT_DESC, "alias", VnodeKind::Symlink, FilePerm::from_mode(0o777))
            .unwrap();
        fs.set_link_target(link, target).unwrap();
        assert_eq!(fs.get_linked_desc(link), Ok(target));
    }

    #[test]
    fn non_empty_directories_cannot_be_removed() {
        let fs = RamFs::new();
        let d = fs
            .mk_file(ROOT_DESC, "dir", VnodeKind::Directory, FilePerm::from_mode(0o755))
            .unwrap();
        fs.add_file(d, "f", b"x").unwrap();
        assert_eq!(fs.remove_file(d), Err(KernelError::InUse));
    }
}
