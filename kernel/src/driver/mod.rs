//! Driver interface.
//!
//! Every driver, built-in or loaded from a relocatable image, presents a
//! [`DriverHeader`] and an implementation of [`DriverOps`]: one trait
//! with the full function table, every method defaulting to
//! `Unimplemented` so a driver only fills in what its device class
//! supports. Loaded drivers join the global list and can be found by
//! name or by PCI identity.

pub mod loader;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::vnode::{FilePerm, VnodeKind};

/// `b"HELDRV1\0"`, little-endian.
pub const DRIVER_MAGIC: u64 = u64::from_le_bytes(*b"HELDRV1\0");

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFlags: u32 {
        /// The ftable carries the standard file interfaces.
        const HAS_STANDARD_INTERFACES = 1 << 0;
        /// Match devices through the PCI selector.
        const DETECT_VIA_PCI = 1 << 1;
        const HAS_VERSION = 1 << 2;
        const PCI_HAS_DEVICE_ID = 1 << 3;
        const PCI_HAS_VENDOR_ID = 1 << 4;
    }
}

/// PCI identity a driver binds to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciSelector {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Mask of class codes the driver accepts besides the exact triple.
    pub classes_mask: u32,
}

impl PciSelector {
    /// Whether a discovered function matches this selector under the
    /// header's flag set.
    pub fn matches(
        &self,
        flags: DriverFlags,
        class: u8,
        subclass: u8,
        prog_if: u8,
        vendor: u16,
        device: u16,
    ) -> bool {
        if !flags.contains(DriverFlags::DETECT_VIA_PCI) {
            return false;
        }
        if flags.contains(DriverFlags::PCI_HAS_VENDOR_ID) && self.vendor_id != vendor {
            return false;
        }
        if flags.contains(DriverFlags::PCI_HAS_DEVICE_ID) && self.device_id != device {
            return false;
        }
        if self.classes_mask != 0 && self.classes_mask & (1 << (class as u32 & 31)) != 0 {
            return true;
        }
        self.class == class && self.subclass == subclass && self.prog_if == prog_if
    }
}

/// The descriptor embedded in a driver image (and filled in by built-in
/// drivers at registration).
#[derive(Debug, Clone)]
pub struct DriverHeader {
    pub magic: u64,
    pub flags: DriverFlags,
    pub pci: PciSelector,
    pub name: String,
    pub version: u32,
    pub acpi_init_level: u32,
}

impl DriverHeader {
    pub fn named(name: &str) -> Self {
        Self {
            magic: DRIVER_MAGIC,
            flags: DriverFlags::HAS_STANDARD_INTERFACES,
            pci: PciSelector::default(),
            name: String::from(name),
            version: 1,
            acpi_init_level: 0,
        }
    }
}

/// Opaque per-device cookie a driver hands the VFS.
pub type DevDesc = u64;

/// The driver function table.
///
/// Default implementations return [`KernelError::Unimplemented`], so the
/// VFS can probe capability by calling.
#[allow(unused_variables)]
pub trait DriverOps: Send + Sync {
    fn cleanup(&self) -> KernelResult<()> {
        Ok(())
    }

    fn ioctl(&self, desc: DevDesc, code: u32, arg: usize) -> KernelResult<usize> {
        Err(KernelError::InvalidIoctl)
    }

    /// Block size of the device backing `desc`, in bytes.
    fn get_blk_size(&self, desc: DevDesc) -> KernelResult<usize> {
        Err(KernelError::Unimplemented)
    }

    fn get_max_blk_count(&self, desc: DevDesc) -> KernelResult<u64> {
        Err(KernelError::Unimplemented)
    }

    /// Synchronous read of `blk_count` blocks at `blk_offset` into `buf`.
    /// Returns blocks read.
    fn read_sync(
        &self,
        desc: DevDesc,
        buf: &mut [u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        Err(KernelError::Unimplemented)
    }

    fn write_sync(
        &self,
        desc: DevDesc,
        buf: &[u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        Err(KernelError::Unimplemented)
    }

    /// Begin an asynchronous request; the driver assigns the IRP's event.
    fn submit_irp(&self, irp: &Arc<crate::fs::irp::Irp>) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    /// Complete bookkeeping after the IRP's event fired.
    fn finalize_irp(&self, irp: &Arc<crate::fs::irp::Irp>) -> KernelResult<()> {
        Ok(())
    }

    fn reference_device(&self, desc: DevDesc) -> KernelResult<()> {
        Ok(())
    }

    fn unreference_device(&self, desc: DevDesc) {}

    fn query_user_readable_name(&self, desc: DevDesc) -> KernelResult<String> {
        Err(KernelError::Unimplemented)
    }

    /// Walk every device this driver exposes; stop when the callback
    /// returns `false`.
    fn foreach_device(&self, cb: &mut dyn FnMut(DevDesc) -> bool) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    /// Canonical path of `desc` inside the driver's namespace.
    fn query_path(&self, desc: DevDesc) -> KernelResult<String> {
        Err(KernelError::Unimplemented)
    }

    /// Resolve one path component under a directory descriptor.
    fn path_search(&self, parent: DevDesc, name: &str) -> KernelResult<DevDesc> {
        Err(KernelError::Unimplemented)
    }

    /// Symlink target descriptor.
    fn get_linked_desc(&self, desc: DevDesc) -> KernelResult<DevDesc> {
        Err(KernelError::Unimplemented)
    }

    fn move_desc_to(&self, desc: DevDesc, new_parent: DevDesc, name: &str) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn mk_file(
        &self,
        parent: DevDesc,
        name: &str,
        kind: VnodeKind,
        perm: FilePerm,
    ) -> KernelResult<DevDesc> {
        Err(KernelError::Unimplemented)
    }

    fn remove_file(&self, desc: DevDesc) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn get_file_perms(&self, desc: DevDesc) -> KernelResult<FilePerm> {
        Err(KernelError::Unimplemented)
    }

    fn set_file_perms(&self, desc: DevDesc, perm: FilePerm) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn get_file_type(&self, desc: DevDesc) -> KernelResult<VnodeKind> {
        Err(KernelError::Unimplemented)
    }

    /// File size in bytes, for filesystems backing regular files.
    fn get_file_size(&self, desc: DevDesc) -> KernelResult<u64> {
        Err(KernelError::Unimplemented)
    }

    fn list_dir(
        &self,
        desc: DevDesc,
        cb: &mut dyn FnMut(&str, DevDesc) -> bool,
    ) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    /// Whether this filesystem driver recognizes the given block device.
    fn probe(&self, dev: &Arc<crate::fs::vnode::Vnode>) -> bool {
        false
    }

    fn on_suspend(&self) {}

    fn on_wake(&self) {}
}

/// Status a driver entry point reports.
#[derive(Debug, Clone, Copy)]
pub struct DriverInitStatus {
    pub status: KernelResult<()>,
    /// A failed *fatal* init unloads the driver.
    pub fatal: bool,
}

impl DriverInitStatus {
    pub fn ok() -> Self {
        Self {
            status: Ok(()),
            fatal: false,
        }
    }
}

static NEXT_DRIVER_ID: AtomicU32 = AtomicU32::new(1);

/// One registered driver.
pub struct LoadedDriver {
    pub id: u32,
    pub header: DriverHeader,
    pub ops: Arc<dyn DriverOps>,
    /// Dependents plus one for the kernel itself.
    pub refcount: AtomicUsize,
    pub started: AtomicBool,
    /// Image placement for drivers loaded from a relocatable binary.
    pub image_base: u64,
    pub image_size: usize,
    pub entry_addr: u64,
    /// The driver's exported symbols.
    pub symbols: BTreeMap<String, u64>,
}

static DRIVERS: Mutex<Vec<Arc<LoadedDriver>>> = Mutex::new(Vec::new());

/// Register a built-in (statically linked) driver.
pub fn register_builtin(header: DriverHeader, ops: Arc<dyn DriverOps>) -> Arc<LoadedDriver> {
    let driver = Arc::new(LoadedDriver {
        id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
        header,
        ops,
        refcount: AtomicUsize::new(1),
        started: AtomicBool::new(true),
        image_base: 0,
        image_size: 0,
        entry_addr: 0,
        symbols: BTreeMap::new(),
    });
    DRIVERS.lock().push(driver.clone());
    log::info!(
        "driver: registered '{}' (id {})",
        driver.header.name,
        driver.id
    );
    driver
}

pub(crate) fn install(driver: Arc<LoadedDriver>) {
    DRIVERS.lock().push(driver);
}

pub fn find_by_name(name: &str) -> Option<Arc<LoadedDriver>> {
    DRIVERS.lock().iter().find(|d| d.header.name == name).cloned()
}

pub fn find_by_id(id: u32) -> Option<Arc<LoadedDriver>> {
    DRIVERS.lock().iter().find(|d| d.id == id).cloned()
}

/// First driver whose PCI selector matches the function.
pub fn find_for_pci(
    class: u8,
    subclass: u8,
    prog_if: u8,
    vendor: u16,
    device: u16,
) -> Option<Arc<LoadedDriver>> {
    DRIVERS
        .lock()
        .iter()
        .find(|d| {
            d.header
                .pci
                .matches(d.header.flags, class, subclass, prog_if, vendor, device)
        })
        .cloned()
}

/// Unload a driver: refuse while referenced, run cleanup, unlink.
pub fn unload(driver: &Arc<LoadedDriver>) -> KernelResult<()> {
    if driver.refcount.load(Ordering::Acquire) > 1 {
        return Err(KernelError::InUse);
    }
    driver.ops.cleanup()?;
    DRIVERS.lock().retain(|d| d.id != driver.id);
    log::info!("driver: unloaded '{}'", driver.header.name);
    Ok(())
}

/// Suspend/resume sweep over every registered driver.
pub fn for_each_on_suspend() {
    for d in DRIVERS.lock().iter() {
        d.ops.on_suspend();
    }
}

pub fn for_each_on_wake() {
    for d in DRIVERS.lock().iter() {
        d.ops.on_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;
    impl DriverOps for NullDriver {}

    #[test]
    fn defaults_report_unimplemented() {
        let d = NullDriver;
        assert_eq!(d.get_blk_size(0), Err(KernelError::Unimplemented));
        assert_eq!(
            d.path_search(0, "x").unwrap_err(),
            KernelError::Unimplemented
        );
        assert_eq!(d.ioctl(0, 0, 0), Err(KernelError::InvalidIoctl));
        assert!(d.cleanup().is_ok());
    }

    #[test]
    fn registry_finds_by_name_and_refuses_busy_unload() {
        let drv = register_builtin(DriverHeader::named("null-test"), Arc::new(NullDriver));
        assert!(find_by_name("null-test").is_some());
        drv.refcount.fetch_add(1, Ordering::AcqRel);
        assert_eq!(unload(&drv), Err(KernelError::InUse));
        drv.refcount.fetch_sub(1, Ordering::AcqRel);
        unload(&drv).unwrap();
        assert!(find_by_name("null-test").is_none());
    }

    #[test]
    fn pci_selector_matching() {
        let sel = PciSelector {
            class: 1,
            subclass: 6,
            prog_if: 1,
            vendor_id: 0x8086,
            device_id: 0,
            classes_mask: 0,
        };
        let flags = DriverFlags::DETECT_VIA_PCI | DriverFlags::PCI_HAS_VENDOR_ID;
        assert!(sel.matches(flags, 1, 6, 1, 0x8086, 0x1234));
        assert!(!sel.matches(flags, 1, 6, 1, 0x1022, 0x1234));
        assert!(!sel.matches(DriverFlags::empty(), 1, 6, 1, 0x8086, 0x1234));
    }
}
