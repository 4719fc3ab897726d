//! Virtual file system.
//!
//! Vnodes, the dirent name cache, mounts, file descriptions, the
//! per-vnode page cache, the IRP framework, pipes, terminals, sockets
//! and partition scanning.

pub mod blockdev;
pub mod dirent;
pub mod fd;
pub mod irp;
pub mod mount;
pub mod pagecache;
pub mod partition;
pub mod pipe;
pub mod ramfs;
pub mod socket;
pub mod tty;
pub mod vnode;

pub use fd::{File, OpenFlags, SeekFrom};
pub use vnode::{FilePerm, Vnode, VnodeKind};

use alloc::{string::String, sync::Arc};

use crate::error::{KernelError, KernelResult};
use crate::process::Process;

/// Mount a fresh in-memory filesystem as the root namespace. Called by
/// the boot glue before drivers and the init process need paths.
pub fn init_root() -> KernelResult<Arc<mount::Mount>> {
    let fs = Arc::new(ramfs::RamFs::new());
    let driver = crate::driver::register_builtin(
        crate::driver::DriverHeader::named("ramfs-root"),
        fs,
    );
    mount::mount("/", driver, None)
}

/// The calling process's working directory (the root when unset).
pub fn current_cwd() -> Arc<dirent::Dirent> {
    Process::current()
        .and_then(|p| p.cwd.lock().clone())
        .unwrap_or_else(dirent::root)
}

/// Change the calling process's working directory.
pub fn chdir(path: &str) -> KernelResult<()> {
    let proc = Process::current().ok_or(KernelError::InvalidOperation)?;
    let entry = dirent::lookup_from(&current_cwd(), path, true)?;
    let vn = entry.vnode().ok_or(KernelError::NotFound)?;
    if vn.kind != VnodeKind::Directory {
        return Err(KernelError::InvalidFile);
    }
    *proc.cwd.lock() = Some(entry);
    Ok(())
}

/// Absolute path of the calling process's working directory.
pub fn getcwd() -> String {
    current_cwd().path()
}
