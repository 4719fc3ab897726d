//! Terminals.
//!
//! A TTY vnode wraps a [`TtyInterface`] (the device side: write bytes,
//! drain). Input bytes arrive through [`Tty::input_bytes`] from the
//! device driver's receive path. Canonical mode edits a line buffer with
//! the ERASE/KILL/EOF characters; ISIG control characters signal the
//! foreground process group; IXON pauses and resumes output. Raw mode
//! hands bytes straight to readers.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::process::{ProcessGroup, Session};
use crate::signal::{self, SIGINT, SIGQUIT, SIGTSTP};
use crate::sync::{Event, EventKind};

bitflags! {
    /// Input-mode flags (`termios.c_iflag` subset).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const IXON = 1 << 0;
        const ICRNL = 1 << 1;
    }
}

bitflags! {
    /// Local-mode flags (`termios.c_lflag` subset).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LocalFlags: u32 {
        const ICANON = 1 << 0;
        const ECHO = 1 << 1;
        const ISIG = 1 << 2;
    }
}

/// Control-character indices in [`Termios::cc`].
pub const VINTR: usize = 0;
pub const VQUIT: usize = 1;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VSTART: usize = 5;
pub const VSTOP: usize = 6;
pub const VSUSP: usize = 7;
pub const NCCS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Termios {
    pub iflag: InputFlags,
    pub lflag: LocalFlags,
    pub cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        let mut cc = [0u8; NCCS];
        cc[VINTR] = 0x03; // ^C
        cc[VQUIT] = 0x1c; // ^\
        cc[VERASE] = 0x7f;
        cc[VKILL] = 0x15; // ^U
        cc[VEOF] = 0x04; // ^D
        cc[VSTART] = 0x11; // ^Q
        cc[VSTOP] = 0x13; // ^S
        cc[VSUSP] = 0x1a; // ^Z
        Self {
            iflag: InputFlags::IXON | InputFlags::ICRNL,
            lflag: LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG,
            cc,
        }
    }
}

/// Device side of a terminal.
pub trait TtyInterface: Send + Sync {
    fn write(&self, data: &[u8]);
    /// Block until the device transmitted everything (`tcdrain`).
    fn drain(&self) {}
}

pub struct Tty {
    pub termios: Mutex<Termios>,
    iface: Arc<dyn TtyInterface>,
    /// Canonical-mode edit buffer.
    line: Mutex<Vec<u8>>,
    /// Cooked bytes ready for readers.
    ready: Mutex<VecDeque<u8>>,
    readable: Event,
    output_paused: AtomicBool,
    pub foreground: Mutex<Option<Arc<ProcessGroup>>>,
    pub session: Mutex<Option<Arc<Session>>>,
}

impl Tty {
    pub fn new(iface: Arc<dyn TtyInterface>) -> Arc<Self> {
        Arc::new(Self {
            termios: Mutex::new(Termios::default()),
            iface,
            line: Mutex::new(Vec::new()),
            ready: Mutex::new(VecDeque::new()),
            readable: Event::new(EventKind::Notification),
            output_paused: AtomicBool::new(false),
            foreground: Mutex::new(None),
            session: Mutex::new(None),
        })
    }

    fn echo(&self, t: &Termios, bytes: &[u8]) {
        if t.lflag.contains(LocalFlags::ECHO) {
            self.iface.write(bytes);
        }
    }

    fn signal_foreground(&self, sig: i32) {
        if let Some(group) = self.foreground.lock().clone() {
            let _ = signal::kill_process_group(&group, sig);
        }
    }

    /// Input from the device driver's data-ready path.
    pub fn input_bytes(&self, bytes: &[u8]) {
        let t = *self.termios.lock();
        for &b in bytes {
            let b = if t.iflag.contains(InputFlags::ICRNL) && b == b'\r' {
                b'\n'
            } else {
                b
            };
            if t.lflag.contains(LocalFlags::ISIG) {
                if b == t.cc[VINTR] {
                    self.signal_foreground(SIGINT);
                    continue;
                }
                if b == t.cc[VQUIT] {
                    self.signal_foreground(SIGQUIT);
                    continue;
                }
                if b == t.cc[VSUSP] {
                    self.signal_foreground(SIGTSTP);
                    continue;
                }
            }
            if t.iflag.contains(InputFlags::IXON) {
                if b == t.cc[VSTOP] {
                    self.output_paused.store(true, Ordering::Release);
                    continue;
                }
                if b == t.cc[VSTART] {
                    self.output_paused.store(false, Ordering::Release);
                    continue;
                }
            }
            if !t.lflag.contains(LocalFlags::ICANON) {
                self.ready.lock().push_back(b);
                let _ = self.readable.set(false);
                continue;
            }
            // Canonical editing.
            if b == t.cc[VERASE] {
                if self.line.lock().pop().is_some() {
                    self.echo(&t, b"\x08 \x08");
                }
                continue;
            }
            if b == t.cc[VKILL] {
                let erased = self.line.lock().len();
                self.line.lock().clear();
                for _ in 0..erased {
                    self.echo(&t, b"\x08 \x08");
                }
                continue;
            }
            if b == t.cc[VEOF] {
                self.flush_line();
                continue;
            }
            self.line.lock().push(b);
            self.echo(&t, &[b]);
            if b == b'\n' {
                self.flush_line();
            }
        }
    }

    fn flush_line(&self) {
        let mut line = self.line.lock();
        if line.is_empty() {
            // EOF on an empty line still wakes readers (read returns 0).
            let _ = self.readable.set(false);
            return;
        }
        let mut ready = self.ready.lock();
        for b in line.drain(..) {
            ready.push_back(b);
        }
        let _ = self.readable.set(false);
    }

    /// Read cooked input. In canonical mode data arrives line-at-a-time.
    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> KernelResult<usize> {
        loop {
            {
                let mut ready = self.ready.lock();
                if !ready.is_empty() {
                    let take = buf.len().min(ready.len());
                    for slot in buf.iter_mut().take(take) {
                        *slot = ready.pop_front().unwrap_or(0);
                    }
                    if ready.is_empty() {
                        self.readable.clear();
                    }
                    return Ok(take);
                }
                self.readable.clear();
            }
            if nonblock {
                return Err(KernelError::WouldBlock);
            }
            self.readable.wait()?;
            if self.ready.lock().is_empty() {
                // Woken by an empty-line EOF.
                return Ok(0);
            }
        }
    }

    /// Write through to the device, honoring IXOFF/IXON output pause.
    pub fn write(&self, data: &[u8]) -> KernelResult<usize> {
        while self.output_paused.load(Ordering::Acquire) {
            crate::platform::spin_hint();
        }
        self.iface.write(data);
        Ok(data.len())
    }

    pub fn drain(&self) {
        self.iface.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::process::Process;
    use crate::sched::{self, Priority, Thread};
    use alloc::string::String;

    struct SinkIface {
        out: Mutex<Vec<u8>>,
    }

    impl TtyInterface for SinkIface {
        fn write(&self, data: &[u8]) {
            self.out.lock().extend_from_slice(data);
        }
    }

    fn tty_with_sink() -> (Arc<Tty>, Arc<SinkIface>) {
        let sink = Arc::new(SinkIface {
            out: Mutex::new(Vec::new()),
        });
        (Tty::new(sink.clone()), sink)
    }

    #[test]
    fn canonical_line_editing() {
        let (tty, _sink) = tty_with_sink();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        // Type "cat", erase the 't', finish the line.
        tty.input_bytes(b"cat");
        tty.input_bytes(&[0x7f]);
        tty.input_bytes(b"r\n");
        let mut buf = [0u8; 16];
        let n = tty.read(&mut buf, false).unwrap();
        assert_eq!(&buf[..n], b"car\n");
    }

    #[test]
    fn kill_char_discards_the_line() {
        let (tty, _sink) = tty_with_sink();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        tty.input_bytes(b"wrong");
        tty.input_bytes(&[0x15]); // ^U
        tty.input_bytes(b"right\n");
        let mut buf = [0u8; 16];
        let n = tty.read(&mut buf, false).unwrap();
        assert_eq!(&buf[..n], b"right\n");
    }

    #[test]
    fn raw_mode_passes_bytes_through() {
        let (tty, _sink) = tty_with_sink();
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        tty.termios.lock().lflag.remove(LocalFlags::ICANON);
        tty.input_bytes(&[0x01, 0x02]);
        let mut buf = [0u8; 4];
        assert_eq!(tty.read(&mut buf, true).unwrap(), 2);
        assert_eq!(&buf[..2], &[0x01, 0x02]);
    }

    #[test]
    fn isig_sends_sigint_to_foreground_group() {
        let (tty, _sink) = tty_with_sink();
        let proc = Process::new(String::from("fg"), user_space(8));
        let thread = Thread::new(None, Priority::Normal, u64::MAX);
        proc.adopt_thread(&thread);
        let group = ProcessGroup::new(proc.pid.0);
        proc.join_group(&group);
        *tty.foreground.lock() = Some(group);

        tty.input_bytes(&[0x03]); // ^C
        assert_ne!(
            thread.signals.pending() & (1 << (SIGINT - 1)),
            0,
            "SIGINT pending on the foreground thread"
        );
    }

    #[test]
    fn ixon_pauses_and_resumes_output() {
        let (tty, sink) = tty_with_sink();
        tty.input_bytes(&[0x13]); // ^S
        assert!(tty.output_paused.load(Ordering::Acquire));
        tty.input_bytes(&[0x11]); // ^Q
        assert!(!tty.output_paused.load(Ordering::Acquire));
        tty.write(b"ok").unwrap();
        assert_eq!(&*sink.out.lock(), b"ok");
    }

    #[test]
    fn echo_writes_back_to_the_device() {
        let (tty, sink) = tty_with_sink();
        tty.input_bytes(b"hi");
        assert_eq!(&*sink.out.lock(), b"hi");
        tty.termios.lock().lflag.remove(LocalFlags::ECHO);
        tty.input_bytes(b"!");
        assert_eq!(&*sink.out.lock(), b"hi");
    }
}
