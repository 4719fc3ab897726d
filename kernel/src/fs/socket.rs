//! Socket surface.
//!
//! A `SocketOps` vtable selects the protocol backend; backends register
//! per (family, type) in a global table. The kernel ships a loopback
//! datagram backend so the socket path is exercisable without a network
//! stack; real interface tables plug in through the same registry.

use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc, vec::Vec};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::{Event, EventKind};

/// Address family.
pub const AF_UNIX: u16 = 1;
pub const AF_INET: u16 = 2;

/// Socket type.
pub const SOCK_STREAM: u16 = 1;
pub const SOCK_DGRAM: u16 = 2;

/// Wire-format-ish socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockAddr {
    pub family: u16,
    pub port: u16,
    pub addr: u32,
}

/// How `shutdown` cuts the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// Protocol backend interface. Defaults report `Unimplemented` so a
/// backend only fills in the operations its protocol has.
#[allow(unused_variables)]
pub trait SocketOps: Send + Sync {
    fn bind(&self, addr: &SockAddr) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn listen(&self, backlog: usize) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn accept(&self) -> KernelResult<(Arc<dyn SocketOps>, SockAddr)> {
        Err(KernelError::Unimplemented)
    }

    fn connect(&self, addr: &SockAddr) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn send_to(&self, data: &[u8], addr: Option<&SockAddr>) -> KernelResult<usize> {
        Err(KernelError::Unimplemented)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        nonblock: bool,
    ) -> KernelResult<(usize, SockAddr)> {
        Err(KernelError::Unimplemented)
    }

    fn getsockopt(&self, level: u32, name: u32) -> KernelResult<usize> {
        Err(KernelError::Unimplemented)
    }

    fn setsockopt(&self, level: u32, name: u32, value: usize) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }

    fn sockname(&self) -> KernelResult<SockAddr> {
        Err(KernelError::Unimplemented)
    }

    fn peername(&self) -> KernelResult<SockAddr> {
        Err(KernelError::Unimplemented)
    }

    fn shutdown(&self, how: ShutdownHow) -> KernelResult<()> {
        Err(KernelError::Unimplemented)
    }
}

/// Creates backend instances for one (family, type) pair.
pub trait SocketFactory: Send + Sync {
    fn create(&self) -> KernelResult<Arc<dyn SocketOps>>;
}

static BACKENDS: Mutex<BTreeMap<(u16, u16), Arc<dyn SocketFactory>>> =
    Mutex::new(BTreeMap::new());

pub fn register_backend(family: u16, socktype: u16, factory: Arc<dyn SocketFactory>) {
    BACKENDS.lock().insert((family, socktype), factory);
}

/// Create a socket of the requested family and type.
pub fn create_socket(family: u16, socktype: u16) -> KernelResult<Arc<dyn SocketOps>> {
    ensure_loopback_registered();
    let factory = BACKENDS
        .lock()
        .get(&(family, socktype))
        .cloned()
        .ok_or(KernelError::Unimplemented)?;
    factory.create()
}

// ---------------------------------------------------------------------------
// Loopback datagram backend
// ---------------------------------------------------------------------------

struct LoDgramInner {
    local: Option<SockAddr>,
    peer: Option<SockAddr>,
    rx: VecDeque<(SockAddr, Vec<u8>)>,
    shut_read: bool,
    shut_write: bool,
}

struct LoDgramSocket {
    inner: Mutex<LoDgramInner>,
    readable: Event,
}

static LO_PORTS: Mutex<BTreeMap<u16, Arc<LoDgramSocket>>> = Mutex::new(BTreeMap::new());

impl LoDgramSocket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LoDgramInner {
                local: None,
                peer: None,
                rx: VecDeque::new(),
                shut_read: false,
                shut_write: false,
            }),
            readable: Event::new(EventKind::Notification),
        })
    }

    fn deliver(&self, from: SockAddr, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.shut_read {
            return;
        }
        inner.rx.push_back((from, data));
        let _ = self.readable.set(false);
    }
}

impl SocketOps for LoDgramSocket {
    fn bind(&self, addr: &SockAddr) -> KernelResult<()> {
        let mut ports = LO_PORTS.lock();
        if ports.contains_key(&addr.port) {
            return Err(KernelError::InUse);
        }
        let mut inner = self.inner.lock();
        if inner.local.is_some() {
            return Err(KernelError::AlreadyInitialized);
        }
        inner.local = Some(*addr);
        drop(inner);
        // The registry keeps delivery possible while the socket lives.
        let me = LO_SELF.lock().remove(&(self as *const _ as usize));
        if let Some(me) = me {
            ports.insert(addr.port, me);
        }
        Ok(())
    }

    fn connect(&self, addr: &SockAddr) -> KernelResult<()> {
        self.inner.lock().peer = Some(*addr);
        Ok(())
    }

    fn send_to(&self, data: &[u8], addr: Option<&SockAddr>) -> KernelResult<usize> {
        let inner = self.inner.lock();
        if inner.shut_write {
            return Err(KernelError::InvalidOperation);
        }
        let target = match addr.copied().or(inner.peer) {
            Some(a) => a,
            None => return Err(KernelError::InvalidArgument),
        };
        let from = inner.local.unwrap_or_default();
        drop(inner);
        let dest = LO_PORTS.lock().get(&target.port).cloned();
        match dest {
            Some(sock) => {
                sock.deliver(from, data.to_vec());
                Ok(data.len())
            }
            None => Err(KernelError::NotFound),
        }
    }

    fn recv_from(&self, buf: &mut [u8], nonblock: bool) -> KernelResult<(usize, SockAddr)> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some((from, data)) = inner.rx.pop_front() {
                    let take = buf.len().min(data.len());
                    buf[..take].copy_from_slice(&data[..take]);
                    if inner.rx.is_empty() {
                        self.readable.clear();
                    }
                    return Ok((take, from));
                }
                if inner.shut_read {
                    return Ok((0, SockAddr::default()));
                }
                self.readable.clear();
            }
            if nonblock {
                return Err(KernelError::WouldBlock);
            }
            self.readable.wait()?;
        }
    }

    fn sockname(&self) -> KernelResult<SockAddr> {
        self.inner.lock().local.ok_or(KernelError::NotFound)
    }

    fn peername(&self) -> KernelResult<SockAddr> {
        self.inner.lock().peer.ok_or(KernelError::NotFound)
    }

    fn shutdown(&self, how: ShutdownHow) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        match how {
            ShutdownHow::Read => inner.shut_read = true,
            ShutdownHow::Write => inner.shut_write = true,
            ShutdownHow::Both => {
                inner.shut_read = true;
                inner.shut_write = true;
            }
        }
        let _ = self.readable.set(false);
        if let Some(local) = inner.local {
            if inner.shut_read {
                LO_PORTS.lock().remove(&local.port);
            }
        }
        LO_SELF.lock().remove(&(self as *const _ as usize));
        Ok(())
    }
}

/// Sockets awaiting their bind, keyed by pointer identity so `bind` can
/// register the owning `Arc` in the port table.
static LO_SELF: Mutex<BTreeMap<usize, Arc<LoDgramSocket>>> = Mutex::new(BTreeMap::new());

struct LoDgramFactory;

impl SocketFactory for LoDgramFactory {
    fn create(&self) -> KernelResult<Arc<dyn SocketOps>> {
        let sock = LoDgramSocket::new();
        LO_SELF
            .lock()
            .insert(&*sock as *const _ as usize, sock.clone());
        Ok(sock)
    }
}

static LOOPBACK_REGISTERED: spin::Once<()> = spin::Once::new();

fn ensure_loopback_registered() {
    LOOPBACK_REGISTERED.call_once(|| {
        register_backend(AF_INET, SOCK_DGRAM, Arc::new(LoDgramFactory));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{self, Priority, Thread};

    fn adopt() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
    }

    fn addr(port: u16) -> SockAddr {
        SockAddr {
            family: AF_INET,
            port,
            addr: 0x7f00_0001,
        }
    }

    #[test]
    fn datagram_loopback_round_trip() {
        adopt();
        let rx = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        rx.bind(&addr(4101)).unwrap();
        let tx = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        tx.bind(&addr(4102)).unwrap();
        tx.send_to(b"ping", Some(&addr(4101))).unwrap();

        let mut buf = [0u8; 8];
        let (n, from) = rx.recv_from(&mut buf, false).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port, 4102);
        rx.shutdown(ShutdownHow::Both).unwrap();
        tx.shutdown(ShutdownHow::Both).unwrap();
    }

    #[test]
    fn double_bind_same_port_is_in_use() {
        adopt();
        let a = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        a.bind(&addr(4201)).unwrap();
        let b = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        assert_eq!(b.bind(&addr(4201)), Err(KernelError::InUse));
        a.shutdown(ShutdownHow::Both).unwrap();
    }

    #[test]
    fn unknown_backend_is_unimplemented() {
        assert!(matches!(
            create_socket(AF_UNIX, SOCK_STREAM),
            Err(KernelError::Unimplemented)
        ));
    }

    #[test]
    fn connected_send_uses_the_peer() {
        adopt();
        let rx = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        rx.bind(&addr(4301)).unwrap();
        let tx = create_socket(AF_INET, SOCK_DGRAM).unwrap();
        tx.connect(&addr(4301)).unwrap();
        tx.send_to(b"hi", None).unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = rx.recv_from(&mut buf, false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(tx.peername().unwrap().port, 4301);
        rx.shutdown(ShutdownHow::Both).unwrap();
    }
}
