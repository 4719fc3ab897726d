//! Relocatable driver image loader.
//!
//! Driver binaries are ELF64 shared objects carrying their descriptor in
//! a `.driver.header` section. Loading copies the PT_LOAD segments into
//! a fresh kernel allocation, resolves undefined symbols against the
//! kernel symbol table, applies the relocations and registers the result
//! in the global driver list. The image's function table entries are
//! wrapped behind [`super::DriverOps`].

use core::mem;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::{DevDesc, DriverFlags, DriverHeader, DriverOps, LoadedDriver, PciSelector, DRIVER_MAGIC};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64SectionHeader {
    pub name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Sym {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Rela {
    pub offset: u64,
    pub info: u64,
    pub addend: i64,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_RELA: u32 = 4;

const R_X86_64_64: u32 = 1;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

/// Section carrying the driver descriptor.
pub const HEADER_SECTION: &str = ".driver.header";

/// On-disk layout of the descriptor inside [`HEADER_SECTION`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDriverHeader {
    pub magic: u64,
    pub flags: u32,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub _pad: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub classes_mask: u32,
    /// Image-relative addresses of the function-table entries; zero for
    /// "not provided".
    pub ftable: RawFtable,
    pub driver_name: [u8; 32],
    pub version: u32,
    pub uacpi_init_level: u32,
}

/// The jump table embedded in the on-disk header. Every entry is an
/// image-relative function address or zero.
///
/// Entries follow the C ABI; negative `i64` returns carry a
/// [`KernelError::as_status`] code, non-negative returns carry the
/// value (descriptor, byte count, mode word, kind index). Strings
/// travel as `(ptr, len)` pairs; out-strings are written into a
/// caller-supplied buffer and the length returned. `foreach_device`
/// and `list_dir` take a callback plus an opaque context word the
/// kernel round-trips; IRPs and probe targets arrive as opaque object
/// pointers valid for the duration of the call.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFtable {
    pub cleanup: u64,
    pub ioctl: u64,
    pub get_blk_size: u64,
    pub get_max_blk_count: u64,
    pub read_sync: u64,
    pub write_sync: u64,
    pub submit_irp: u64,
    pub finalize_irp: u64,
    pub reference_device: u64,
    pub unreference_device: u64,
    pub query_user_readable_name: u64,
    pub foreach_device: u64,
    pub query_path: u64,
    pub path_search: u64,
    pub get_linked_desc: u64,
    pub move_desc_to: u64,
    pub mk_file: u64,
    pub remove_file: u64,
    pub get_file_perms: u64,
    pub set_file_perms: u64,
    pub get_file_type: u64,
    pub list_dir: u64,
    pub probe: u64,
    pub on_suspend: u64,
    pub on_wake: u64,
}

/// Kernel exports the loader resolves undefined driver symbols against.
static KERNEL_SYMBOLS: Mutex<BTreeMap<String, u64>> = Mutex::new(BTreeMap::new());

/// Export a kernel symbol for drivers.
pub fn register_kernel_symbol(name: &str, addr: u64) {
    KERNEL_SYMBOLS.lock().insert(name.to_string(), addr);
}

pub fn resolve_kernel_symbol(name: &str) -> Option<u64> {
    KERNEL_SYMBOLS.lock().get(name).copied()
}

pub fn validate_header(data: &[u8]) -> KernelResult<Elf64Header> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err(KernelError::InvalidFile);
    }
    // SAFETY: length checked; Elf64Header is plain repr(C) data.
    let header = unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Elf64Header) };
    if header.magic != ELF_MAGIC
        || header.class != ELF_CLASS_64
        || header.data != ELF_DATA_2LSB
        || header.elf_type != ET_DYN
    {
        return Err(KernelError::InvalidFile);
    }
    Ok(header)
}

fn read_at<T: Copy>(data: &[u8], offset: usize) -> KernelResult<T> {
    if offset + mem::size_of::<T>() > data.len() {
        return Err(KernelError::InvalidFile);
    }
    // SAFETY: bounds checked; T is plain repr(C) data.
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

fn section_headers(data: &[u8], ehdr: &Elf64Header) -> KernelResult<Vec<Elf64SectionHeader>> {
    let mut out = Vec::with_capacity(ehdr.shnum as usize);
    for i in 0..ehdr.shnum as usize {
        out.push(read_at(
            data,
            ehdr.shoff as usize + i * ehdr.shentsize as usize,
        )?);
    }
    Ok(out)
}

fn section_name<'a>(data: &'a [u8], shstr: &Elf64SectionHeader, name_off: u32) -> &'a str {
    let start = shstr.offset as usize + name_off as usize;
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(start);
    core::str::from_utf8(&data[start..end]).unwrap_or("")
}

fn symbol_name<'a>(data: &'a [u8], strtab: &Elf64SectionHeader, name_off: u32) -> &'a str {
    let start = strtab.offset as usize + name_off as usize;
    if start >= data.len() {
        return "";
    }
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(start);
    core::str::from_utf8(&data[start..end]).unwrap_or("")
}

/// Apply one RELA entry to the placed image.
pub fn apply_relocation(
    image: &mut [u8],
    base: u64,
    rela: &Elf64Rela,
    symval: u64,
) -> KernelResult<()> {
    let kind = (rela.info & 0xffff_ffff) as u32;
    let target = rela.offset as usize;
    if target + 8 > image.len() {
        return Err(KernelError::InvalidFile);
    }
    let value = match kind {
        R_X86_64_RELATIVE => (base as i64 + rela.addend) as u64,
        R_X86_64_64 => (symval as i64 + rela.addend) as u64,
        R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => symval,
        _ => return Err(KernelError::Unimplemented),
    };
    image[target..target + 8].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

struct PlacedImage {
    bytes: Box<[u8]>,
    base: u64,
}

fn place_segments(data: &[u8], ehdr: &Elf64Header) -> KernelResult<PlacedImage> {
    let mut top = 0u64;
    let mut loads = Vec::new();
    for i in 0..ehdr.phnum as usize {
        let ph: Elf64ProgramHeader =
            read_at(data, ehdr.phoff as usize + i * ehdr.phentsize as usize)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        top = top.max(ph.vaddr + ph.memsz);
        loads.push(ph);
    }
    if loads.is_empty() {
        return Err(KernelError::InvalidFile);
    }
    let mut bytes = vec![0u8; top as usize].into_boxed_slice();
    for ph in &loads {
        let src = ph.offset as usize..(ph.offset + ph.filesz) as usize;
        if src.end > data.len() {
            return Err(KernelError::InvalidFile);
        }
        let dst = ph.vaddr as usize..(ph.vaddr + ph.filesz) as usize;
        bytes[dst].copy_from_slice(&data[src]);
    }
    let base = bytes.as_ptr() as u64;
    Ok(PlacedImage { bytes, base })
}

/// Driver ops backed by the image's raw jump table. Entries the image
/// did not provide fall through to the trait defaults.
struct ImageOps {
    ftable: RawFtable,
    base: u64,
    /// Keeps the placed image alive as long as the ops are callable.
    _image: Box<[u8]>,
}

// SAFETY: the jump-table targets are immutable after load; concurrent
// calls are the driver's contract, as with any C driver ABI.
unsafe impl Send for ImageOps {}
// SAFETY: as above.
unsafe impl Sync for ImageOps {}

/// Trampoline for `foreach_device`: the context pointer is the borrowed
/// kernel callback.
extern "C" fn foreach_device_shim(ctx: *mut core::ffi::c_void, desc: u64) -> i32 {
    // SAFETY: `ctx` is the `&mut dyn FnMut` passed by `foreach_device`
    // below, alive for the duration of the driver call.
    let cb = unsafe { &mut *ctx.cast::<&mut dyn FnMut(DevDesc) -> bool>() };
    cb(desc) as i32
}

/// Trampoline for `list_dir`: forwards `(name, desc)` pairs.
extern "C" fn list_dir_shim(
    ctx: *mut core::ffi::c_void,
    name: *const u8,
    name_len: usize,
    desc: u64,
) -> i32 {
    // SAFETY: as for `foreach_device_shim`; the name bytes live for the
    // duration of this call per the ABI.
    let cb = unsafe { &mut *ctx.cast::<&mut dyn FnMut(&str, DevDesc) -> bool>() };
    let bytes = if name.is_null() {
        &[][..]
    } else {
        // SAFETY: driver-provided pointer/length pair per the ABI.
        unsafe { core::slice::from_raw_parts(name, name_len) }
    };
    cb(core::str::from_utf8(bytes).unwrap_or(""), desc) as i32
}

macro_rules! image_call {
    ($self:ident, $entry:ident, $sig:ty, $($arg:expr),*) => {{
        if $self.ftable.$entry == 0 {
            return Err(KernelError::Unimplemented);
        }
        // SAFETY: the entry was relocated into the placed image and the
        // image outlives `self`.
        let f: $sig = unsafe { core::mem::transmute($self.base + $self.ftable.$entry) };
        // SAFETY: calling into the driver's own code per the ABI.
        unsafe { f($($arg),*) }
    }};
}

impl DriverOps for ImageOps {
    fn cleanup(&self) -> KernelResult<()> {
        if self.ftable.cleanup == 0 {
            return Ok(());
        }
        let status: i64 = image_call!(self, cleanup, unsafe extern "C" fn() -> i64,);
        status_to_result(status)
    }

    fn ioctl(&self, desc: DevDesc, code: u32, arg: usize) -> KernelResult<usize> {
        let r: i64 = image_call!(
            self,
            ioctl,
            unsafe extern "C" fn(u64, u32, usize) -> i64,
            desc,
            code,
            arg
        );
        if r < 0 {
            Err(KernelError::InvalidIoctl)
        } else {
            Ok(r as usize)
        }
    }

    fn get_blk_size(&self, desc: DevDesc) -> KernelResult<usize> {
        let r: i64 = image_call!(self, get_blk_size, unsafe extern "C" fn(u64) -> i64, desc);
        if r <= 0 {
            Err(KernelError::InvalidOperation)
        } else {
            Ok(r as usize)
        }
    }

    fn get_max_blk_count(&self, desc: DevDesc) -> KernelResult<u64> {
        let r: i64 = image_call!(self, get_max_blk_count, unsafe extern "C" fn(u64) -> i64, desc);
        if r < 0 {
            Err(KernelError::InvalidOperation)
        } else {
            Ok(r as u64)
        }
    }

    fn read_sync(
        &self,
        desc: DevDesc,
        buf: &mut [u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let r: i64 = image_call!(
            self,
            read_sync,
            unsafe extern "C" fn(u64, *mut u8, usize, u64) -> i64,
            desc,
            buf.as_mut_ptr(),
            blk_count,
            blk_offset
        );
        if r < 0 {
            Err(KernelError::InvalidOperation)
        } else {
            Ok(r as usize)
        }
    }

    fn write_sync(
        &self,
        desc: DevDesc,
        buf: &[u8],
        blk_offset: u64,
        blk_count: usize,
    ) -> KernelResult<usize> {
        let r: i64 = image_call!(
            self,
            write_sync,
            unsafe extern "C" fn(u64, *const u8, usize, u64) -> i64,
            desc,
            buf.as_ptr(),
            blk_count,
            blk_offset
        );
        if r < 0 {
            Err(KernelError::InvalidOperation)
        } else {
            Ok(r as usize)
        }
    }

    fn submit_irp(&self, irp: &Arc<crate::fs::irp::Irp>) -> KernelResult<()> {
        let r: i64 = image_call!(
            self,
            submit_irp,
            unsafe extern "C" fn(*const core::ffi::c_void) -> i64,
            Arc::as_ptr(irp) as *const core::ffi::c_void
        );
        status_to_result(r)
    }

    fn finalize_irp(&self, irp: &Arc<crate::fs::irp::Irp>) -> KernelResult<()> {
        if self.ftable.finalize_irp == 0 {
            return Ok(());
        }
        let r: i64 = image_call!(
            self,
            finalize_irp,
            unsafe extern "C" fn(*const core::ffi::c_void) -> i64,
            Arc::as_ptr(irp) as *const core::ffi::c_void
        );
        status_to_result(r)
    }

    fn reference_device(&self, desc: DevDesc) -> KernelResult<()> {
        if self.ftable.reference_device == 0 {
            return Ok(());
        }
        let r: i64 = image_call!(
            self,
            reference_device,
            unsafe extern "C" fn(u64) -> i64,
            desc
        );
        status_to_result(r)
    }

    fn unreference_device(&self, desc: DevDesc) {
        if self.ftable.unreference_device != 0 {
            // SAFETY: relocated entry, image alive.
            let f: unsafe extern "C" fn(u64) =
                unsafe { core::mem::transmute(self.base + self.ftable.unreference_device) };
            // SAFETY: driver ABI call.
            unsafe { f(desc) }
        }
    }

    fn query_user_readable_name(&self, desc: DevDesc) -> KernelResult<String> {
        let mut buf = [0u8; 128];
        let r: i64 = image_call!(
            self,
            query_user_readable_name,
            unsafe extern "C" fn(u64, *mut u8, usize) -> i64,
            desc,
            buf.as_mut_ptr(),
            buf.len()
        );
        let len = check_value(r)? as usize;
        Ok(String::from_utf8_lossy(&buf[..len.min(buf.len())]).into_owned())
    }

    fn foreach_device(&self, cb: &mut dyn FnMut(DevDesc) -> bool) -> KernelResult<()> {
        let mut cb = cb;
        let ctx = (&mut cb as *mut _) as *mut core::ffi::c_void;
        let r: i64 = image_call!(
            self,
            foreach_device,
            unsafe extern "C" fn(
                extern "C" fn(*mut core::ffi::c_void, u64) -> i32,
                *mut core::ffi::c_void,
            ) -> i64,
            foreach_device_shim,
            ctx
        );
        status_to_result(r)
    }

    fn query_path(&self, desc: DevDesc) -> KernelResult<String> {
        let mut buf = [0u8; 256];
        let r: i64 = image_call!(
            self,
            query_path,
            unsafe extern "C" fn(u64, *mut u8, usize) -> i64,
            desc,
            buf.as_mut_ptr(),
            buf.len()
        );
        let len = check_value(r)? as usize;
        Ok(String::from_utf8_lossy(&buf[..len.min(buf.len())]).into_owned())
    }

    fn path_search(&self, parent: DevDesc, name: &str) -> KernelResult<DevDesc> {
        let r: i64 = image_call!(
            self,
            path_search,
            unsafe extern "C" fn(u64, *const u8, usize) -> i64,
            parent,
            name.as_ptr(),
            name.len()
        );
        check_value(r)
    }

    fn get_linked_desc(&self, desc: DevDesc) -> KernelResult<DevDesc> {
        let r: i64 = image_call!(self, get_linked_desc, unsafe extern "C" fn(u64) -> i64, desc);
        check_value(r)
    }

    fn move_desc_to(&self, desc: DevDesc, new_parent: DevDesc, name: &str) -> KernelResult<()> {
        let r: i64 = image_call!(
            self,
            move_desc_to,
            unsafe extern "C" fn(u64, u64, *const u8, usize) -> i64,
            desc,
            new_parent,
            name.as_ptr(),
            name.len()
        );
        status_to_result(r)
    }

    fn mk_file(
        &self,
        parent: DevDesc,
        name: &str,
        kind: crate::fs::vnode::VnodeKind,
        perm: crate::fs::vnode::FilePerm,
    ) -> KernelResult<DevDesc> {
        let r: i64 = image_call!(
            self,
            mk_file,
            unsafe extern "C" fn(u64, *const u8, usize, u32, u32) -> i64,
            parent,
            name.as_ptr(),
            name.len(),
            kind as u32,
            perm.mode() as u32
        );
        check_value(r)
    }

    fn remove_file(&self, desc: DevDesc) -> KernelResult<()> {
        let r: i64 = image_call!(self, remove_file, unsafe extern "C" fn(u64) -> i64, desc);
        status_to_result(r)
    }

    fn get_file_perms(&self, desc: DevDesc) -> KernelResult<crate::fs::vnode::FilePerm> {
        let r: i64 = image_call!(self, get_file_perms, unsafe extern "C" fn(u64) -> i64, desc);
        let mode = check_value(r)?;
        Ok(crate::fs::vnode::FilePerm::from_mode(mode as u16))
    }

    fn set_file_perms(&self, desc: DevDesc, perm: crate::fs::vnode::FilePerm) -> KernelResult<()> {
        let r: i64 = image_call!(
            self,
            set_file_perms,
            unsafe extern "C" fn(u64, u32) -> i64,
            desc,
            perm.mode() as u32
        );
        status_to_result(r)
    }

    fn get_file_type(&self, desc: DevDesc) -> KernelResult<crate::fs::vnode::VnodeKind> {
        let r: i64 = image_call!(self, get_file_type, unsafe extern "C" fn(u64) -> i64, desc);
        let code = check_value(r)?;
        crate::fs::vnode::VnodeKind::from_index(code as u32).ok_or(KernelError::InvalidFile)
    }

    fn get_file_size(&self, desc: DevDesc) -> KernelResult<u64> {
        // The on-disk table has no dedicated size slot; size is the
        // block count times the block size, as the original interface
        // derives it.
        let blocks = self.get_max_blk_count(desc)?;
        let blk = self.get_blk_size(desc)? as u64;
        Ok(blocks * blk)
    }

    fn list_dir(
        &self,
        desc: DevDesc,
        cb: &mut dyn FnMut(&str, DevDesc) -> bool,
    ) -> KernelResult<()> {
        let mut cb = cb;
        let ctx = (&mut cb as *mut _) as *mut core::ffi::c_void;
        let r: i64 = image_call!(
            self,
            list_dir,
            unsafe extern "C" fn(
                u64,
                extern "C" fn(*mut core::ffi::c_void, *const u8, usize, u64) -> i32,
                *mut core::ffi::c_void,
            ) -> i64,
            desc,
            list_dir_shim,
            ctx
        );
        status_to_result(r)
    }

    fn probe(&self, dev: &Arc<crate::fs::vnode::Vnode>) -> bool {
        if self.ftable.probe == 0 {
            return false;
        }
        // SAFETY: relocated entry, image alive.
        let f: unsafe extern "C" fn(*const core::ffi::c_void) -> i32 =
            unsafe { core::mem::transmute(self.base + self.ftable.probe) };
        // SAFETY: driver ABI call; the vnode reference outlives it.
        unsafe { f(Arc::as_ptr(dev) as *const core::ffi::c_void) != 0 }
    }

    fn on_suspend(&self) {
        if self.ftable.on_suspend != 0 {
            // SAFETY: relocated entry, image alive.
            let f: unsafe extern "C" fn() =
                unsafe { core::mem::transmute(self.base + self.ftable.on_suspend) };
            // SAFETY: driver ABI call.
            unsafe { f() }
        }
    }

    fn on_wake(&self) {
        if self.ftable.on_wake != 0 {
            // SAFETY: relocated entry, image alive.
            let f: unsafe extern "C" fn() =
                unsafe { core::mem::transmute(self.base + self.ftable.on_wake) };
            // SAFETY: driver ABI call.
            unsafe { f() }
        }
    }
}

/// Map a driver status word: zero and positive mean success.
fn status_to_result(status: i64) -> KernelResult<()> {
    if status >= 0 {
        Ok(())
    } else {
        Err(KernelError::from_status(status as isize))
    }
}

/// Map a value-or-status word: non-negative is the value.
fn check_value(r: i64) -> KernelResult<u64> {
    if r >= 0 {
        Ok(r as u64)
    } else {
        Err(KernelError::from_status(r as isize))
    }
}

/// Load a relocatable driver binary, resolve and relocate it, register
/// it and invoke its entry point. A fatal non-success entry status
/// unloads the image again.
pub fn load(data: &[u8]) -> KernelResult<Arc<LoadedDriver>> {
    let ehdr = validate_header(data)?;
    let mut placed = place_segments(data, &ehdr)?;
    let shdrs = section_headers(data, &ehdr)?;
    let shstr = shdrs
        .get(ehdr.shstrndx as usize)
        .copied()
        .ok_or(KernelError::InvalidFile)?;

    // Locate the descriptor, the symbol table and its string table.
    let mut raw_header: Option<RawDriverHeader> = None;
    let mut symtab: Option<(Elf64SectionHeader, Elf64SectionHeader)> = None;
    for sh in &shdrs {
        let name = section_name(data, &shstr, sh.name);
        if name == HEADER_SECTION {
            raw_header = Some(read_at(data, sh.offset as usize)?);
        }
        if sh.sh_type == SHT_SYMTAB {
            let strtab = shdrs
                .get(sh.link as usize)
                .copied()
                .ok_or(KernelError::InvalidFile)?;
            symtab = Some((*sh, strtab));
        }
    }
    let raw = raw_header.ok_or(KernelError::InvalidFile)?;
    if raw.magic != DRIVER_MAGIC {
        return Err(KernelError::InvalidFile);
    }

    // Resolve the symbol table: defined symbols rebase onto the image,
    // undefined ones come from the kernel exports.
    let mut symvals = Vec::new();
    let mut exports = BTreeMap::new();
    if let Some((sym_sh, str_sh)) = &symtab {
        let count = (sym_sh.size / sym_sh.entsize.max(1)) as usize;
        for i in 0..count {
            let sym: Elf64Sym =
                read_at(data, sym_sh.offset as usize + i * sym_sh.entsize as usize)?;
            let name = symbol_name(data, str_sh, sym.name);
            let value = if sym.shndx != 0 {
                let v = placed.base + sym.value;
                if !name.is_empty() {
                    exports.insert(name.to_string(), v);
                }
                v
            } else if name.is_empty() {
                0
            } else {
                resolve_kernel_symbol(name).ok_or(KernelError::NotFound)?
            };
            symvals.push(value);
        }
    }

    // Apply every RELA section.
    for sh in &shdrs {
        if sh.sh_type != SHT_RELA {
            continue;
        }
        let count = (sh.size / sh.entsize.max(1)) as usize;
        for i in 0..count {
            let rela: Elf64Rela = read_at(data, sh.offset as usize + i * sh.entsize as usize)?;
            let sym_index = (rela.info >> 32) as usize;
            let symval = symvals.get(sym_index).copied().unwrap_or(0);
            apply_relocation(&mut placed.bytes, placed.base, &rela, symval)?;
        }
    }

    let name = cstr_field(&raw.driver_name);
    let header = DriverHeader {
        magic: raw.magic,
        flags: DriverFlags::from_bits_truncate(raw.flags),
        pci: PciSelector {
            class: raw.class,
            subclass: raw.subclass,
            prog_if: raw.prog_if,
            vendor_id: raw.vendor_id,
            device_id: raw.device_id,
            classes_mask: raw.classes_mask,
        },
        name,
        version: raw.version,
        acpi_init_level: raw.uacpi_init_level,
    };

    let base = placed.base;
    let size = placed.bytes.len();
    let entry_addr = if ehdr.entry != 0 { base + ehdr.entry } else { 0 };
    let ops = Arc::new(ImageOps {
        ftable: raw.ftable,
        base,
        _image: placed.bytes,
    });

    let driver = Arc::new(LoadedDriver {
        id: super::NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
        header,
        ops,
        refcount: AtomicUsize::new(1),
        started: AtomicBool::new(false),
        image_base: base,
        image_size: size,
        entry_addr,
        symbols: exports,
    });
    super::install(driver.clone());
    log::info!(
        "driver: loaded '{}' at {:#x} ({} bytes)",
        driver.header.name,
        base,
        size
    );
    Ok(driver)
}

/// Run the driver's entry point; a fatal failure unloads it.
pub fn start(driver: &Arc<LoadedDriver>) -> KernelResult<()> {
    if driver.started.swap(true, Ordering::AcqRel) {
        return Err(KernelError::AlreadyInitialized);
    }
    if driver.entry_addr == 0 {
        return Ok(());
    }
    // SAFETY: the entry was relocated into the live image.
    let entry: unsafe extern "C" fn() -> i64 =
        unsafe { core::mem::transmute(driver.entry_addr) };
    // SAFETY: driver ABI call.
    let status = unsafe { entry() };
    if status < 0 {
        driver.started.store(false, Ordering::Release);
        let _ = super::unload(driver);
        return Err(KernelError::InternalError {
            reason: "driver entry reported fatal failure",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            validate_header(&[0u8; 8]),
            Err(KernelError::InvalidFile)
        ));
        let mut fake = [0u8; 64];
        fake[..4].copy_from_slice(&ELF_MAGIC);
        // Wrong class.
        fake[4] = 1;
        assert!(matches!(
            validate_header(&fake),
            Err(KernelError::InvalidFile)
        ));
    }

    #[test]
    fn relative_relocation_rebases_a_word() {
        let mut image = vec![0u8; 32];
        let rela = Elf64Rela {
            offset: 8,
            info: R_X86_64_RELATIVE as u64,
            addend: 0x40,
        };
        apply_relocation(&mut image, 0x1000, &rela, 0).unwrap();
        assert_eq!(
            u64::from_le_bytes(image[8..16].try_into().unwrap()),
            0x1040
        );
    }

    #[test]
    fn symbol_relocation_uses_resolved_value() {
        register_kernel_symbol("helion_test_export", 0xABCD);
        assert_eq!(resolve_kernel_symbol("helion_test_export"), Some(0xABCD));
        let mut image = vec![0u8; 16];
        let rela = Elf64Rela {
            offset: 0,
            info: ((3u64) << 32) | R_X86_64_GLOB_DAT as u64,
            addend: 0,
        };
        apply_relocation(&mut image, 0, &rela, 0xABCD).unwrap();
        assert_eq!(u64::from_le_bytes(image[0..8].try_into().unwrap()), 0xABCD);
    }

    #[test]
    fn out_of_bounds_relocation_is_an_error() {
        let mut image = vec![0u8; 8];
        let rela = Elf64Rela {
            offset: 4,
            info: R_X86_64_RELATIVE as u64,
            addend: 0,
        };
        assert_eq!(
            apply_relocation(&mut image, 0, &rela, 0),
            Err(KernelError::InvalidFile)
        );
    }
}
