//! Per-process handle tables.
//!
//! A handle is `(type << 24) | slot`: the type tag is validated on every
//! lookup, released slots chain into a free list for recycling. The
//! special encodings short-circuit table lookups for syscalls that
//! operate on the calling thread, process or address space.

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Raw handle word as it crosses the syscall boundary.
pub type RawHandle = u32;

pub const HANDLE_INVALID: RawHandle = u32::MAX;
/// Refers to the calling thread/process/context without a table lookup.
pub const HANDLE_CURRENT: RawHandle = u32::MAX - 1;
/// Matches any object of the required type (waits).
pub const HANDLE_ANY: RawHandle = u32::MAX - 2;

const SLOT_MASK: u32 = (1 << 24) - 1;

/// Object type tag embedded in the handle word.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Fd = 0,
    Timer = 1,
    Dirent = 2,
    Thread = 3,
    Process = 4,
    Space = 5,
    Mutex = 6,
    Semaphore = 7,
    PushLock = 8,
    Event = 9,
    Driver = 10,
    Irp = 11,
    Socket = 12,
}

impl HandleType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Fd),
            1 => Some(Self::Timer),
            2 => Some(Self::Dirent),
            3 => Some(Self::Thread),
            4 => Some(Self::Process),
            5 => Some(Self::Space),
            6 => Some(Self::Mutex),
            7 => Some(Self::Semaphore),
            8 => Some(Self::PushLock),
            9 => Some(Self::Event),
            10 => Some(Self::Driver),
            11 => Some(Self::Irp),
            12 => Some(Self::Socket),
            _ => None,
        }
    }
}

/// The tagged union a slot holds.
#[derive(Clone)]
pub enum KernelObject {
    Fd(Arc<crate::fs::fd::File>),
    Timer(Arc<crate::timer::Timer>),
    Dirent(Arc<crate::fs::dirent::Dirent>),
    Thread(Arc<crate::sched::Thread>),
    Process(Arc<crate::process::Process>),
    Space(Arc<crate::mm::AddressSpace>),
    Mutex(Arc<crate::sync::KernelMutex>),
    Semaphore(Arc<crate::sync::Semaphore>),
    PushLock(Arc<crate::sync::PushLock>),
    Event(Arc<crate::sync::Event>),
    Driver(Arc<crate::driver::LoadedDriver>),
    Irp(Arc<crate::fs::irp::Irp>),
    Socket(Arc<dyn crate::fs::socket::SocketOps>),
}

impl core::fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelObject::{:?}", self.handle_type())
    }
}

impl PartialEq for KernelObject {
    fn eq(&self, other: &Self) -> bool {
        use KernelObject::*;
        match (self, other) {
            (Fd(a), Fd(b)) => Arc::ptr_eq(a, b),
            (Timer(a), Timer(b)) => Arc::ptr_eq(a, b),
            (Dirent(a), Dirent(b)) => Arc::ptr_eq(a, b),
            (Thread(a), Thread(b)) => Arc::ptr_eq(a, b),
            (Process(a), Process(b)) => Arc::ptr_eq(a, b),
            (Space(a), Space(b)) => Arc::ptr_eq(a, b),
            (Mutex(a), Mutex(b)) => Arc::ptr_eq(a, b),
            (Semaphore(a), Semaphore(b)) => Arc::ptr_eq(a, b),
            (PushLock(a), PushLock(b)) => Arc::ptr_eq(a, b),
            (Event(a), Event(b)) => Arc::ptr_eq(a, b),
            (Driver(a), Driver(b)) => Arc::ptr_eq(a, b),
            (Irp(a), Irp(b)) => Arc::ptr_eq(a, b),
            (Socket(a), Socket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl KernelObject {
    pub fn handle_type(&self) -> HandleType {
        match self {
            Self::Fd(_) => HandleType::Fd,
            Self::Timer(_) => HandleType::Timer,
            Self::Dirent(_) => HandleType::Dirent,
            Self::Thread(_) => HandleType::Thread,
            Self::Process(_) => HandleType::Process,
            Self::Space(_) => HandleType::Space,
            Self::Mutex(_) => HandleType::Mutex,
            Self::Semaphore(_) => HandleType::Semaphore,
            Self::PushLock(_) => HandleType::PushLock,
            Self::Event(_) => HandleType::Event,
            Self::Driver(_) => HandleType::Driver,
            Self::Irp(_) => HandleType::Irp,
            Self::Socket(_) => HandleType::Socket,
        }
    }
}

enum Slot {
    Used(KernelObject),
    Free { next: Option<u32> },
}

struct TableInner {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

/// Dense per-process handle array with a free list.
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: Vec::new(),
                free_head: None,
            }),
        }
    }

    fn encode(ty: HandleType, slot: u32) -> RawHandle {
        ((ty as u32) << 24) | (slot & SLOT_MASK)
    }

    fn decode(handle: RawHandle) -> Option<(HandleType, u32)> {
        let ty = HandleType::from_u8((handle >> 24) as u8)?;
        Some((ty, handle & SLOT_MASK))
    }

    /// Install an object and return its handle.
    pub fn allocate(&self, obj: KernelObject) -> RawHandle {
        let ty = obj.handle_type();
        let mut inner = self.inner.lock();
        let slot = match inner.free_head.take() {
            Some(idx) => {
                let next = match &inner.slots[idx as usize] {
                    Slot::Free { next } => *next,
                    Slot::Used(_) => None,
                };
                inner.free_head = next;
                inner.slots[idx as usize] = Slot::Used(obj);
                idx
            }
            None => {
                inner.slots.push(Slot::Used(obj));
                (inner.slots.len() - 1) as u32
            }
        };
        Self::encode(ty, slot)
    }

    /// Look up a handle, validating its type tag.
    pub fn lookup(&self, handle: RawHandle, expect: HandleType) -> KernelResult<KernelObject> {
        let (ty, slot) = Self::decode(handle).ok_or(KernelError::InvalidArgument)?;
        if ty != expect {
            return Err(KernelError::InvalidArgument);
        }
        let inner = self.inner.lock();
        match inner.slots.get(slot as usize) {
            Some(Slot::Used(obj)) if obj.handle_type() == expect => Ok(obj.clone()),
            _ => Err(KernelError::NotFound),
        }
    }

    /// Release a handle; its slot joins the free list.
    pub fn free(&self, handle: RawHandle) -> KernelResult<()> {
        let (_, slot) = Self::decode(handle).ok_or(KernelError::InvalidArgument)?;
        let mut inner = self.inner.lock();
        match inner.slots.get(slot as usize) {
            Some(Slot::Used(_)) => {
                let next = inner.free_head;
                inner.slots[slot as usize] = Slot::Free { next };
                inner.free_head = Some(slot);
                Ok(())
            }
            _ => Err(KernelError::NotFound),
        }
    }

    /// Overwrite this table with a copy of `other`'s slots (fork).
    pub fn copy_from(&self, other: &HandleTable) {
        let src = other.inner.lock();
        let mut dst = self.inner.lock();
        dst.slots = src
            .slots
            .iter()
            .map(|s| match s {
                Slot::Used(obj) => Slot::Used(obj.clone()),
                Slot::Free { next } => Slot::Free { next: *next },
            })
            .collect();
        dst.free_head = src.free_head;
    }

    /// Duplicate every live slot (fork).
    pub fn clone_table(&self) -> HandleTable {
        let inner = self.inner.lock();
        let slots = inner
            .slots
            .iter()
            .map(|s| match s {
                Slot::Used(obj) => Slot::Used(obj.clone()),
                Slot::Free { next } => Slot::Free { next: *next },
            })
            .collect();
        HandleTable {
            inner: Mutex::new(TableInner {
                slots,
                free_head: inner.free_head,
            }),
        }
    }

    pub fn live_handles(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Used(_)))
            .count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Priority, Thread};

    #[test]
    fn allocate_lookup_free_cycle() {
        let table = HandleTable::new();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let h = table.allocate(KernelObject::Thread(t.clone()));
        assert_eq!(h >> 24, HandleType::Thread as u32);
        match table.lookup(h, HandleType::Thread).unwrap() {
            KernelObject::Thread(found) => assert!(Arc::ptr_eq(&found, &t)),
            _ => panic!("wrong object"),
        }
        table.free(h).unwrap();
        assert_eq!(table.lookup(h, HandleType::Thread), Err(KernelError::NotFound));
    }

    #[test]
    fn type_tag_mismatch_is_rejected() {
        let table = HandleTable::new();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        let h = table.allocate(KernelObject::Thread(t));
        assert_eq!(
            table.lookup(h, HandleType::Process),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn freed_slots_are_recycled() {
        let table = HandleTable::new();
        let t1 = Thread::new(None, Priority::Normal, u64::MAX);
        let t2 = Thread::new(None, Priority::Normal, u64::MAX);
        let h1 = table.allocate(KernelObject::Thread(t1));
        table.free(h1).unwrap();
        let h2 = table.allocate(KernelObject::Thread(t2));
        // Same slot, reused through the free list.
        assert_eq!(h1 & SLOT_MASK, h2 & SLOT_MASK);
        assert_eq!(table.live_handles(), 1);
    }
}
