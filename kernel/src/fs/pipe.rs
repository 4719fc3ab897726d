//! Kernel pipes.
//!
//! A bounded ring buffer with two events: data-available for readers,
//! space-available for writers. Writes of at most `PIPE_BUF` bytes are
//! atomic; larger writes split. Descriptors opened with `O_NONBLOCK`
//! report `WouldBlock` instead of parking.

use alloc::{collections::VecDeque, sync::Arc};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::signal::{self, SIGPIPE};
use crate::sync::{Event, EventKind};

/// POSIX atomicity threshold, also the default capacity.
pub const PIPE_BUF: usize = 512;

struct PipeInner {
    buffer: VecDeque<u8>,
    capacity: usize,
    read_closed: bool,
    write_closed: bool,
}

pub struct Pipe {
    inner: Mutex<PipeInner>,
    data_available: Event,
    space_available: Event,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(PIPE_BUF)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipeInner {
                buffer: VecDeque::with_capacity(capacity),
                capacity,
                read_closed: false,
                write_closed: false,
            }),
            data_available: Event::new(EventKind::Notification),
            space_available: Event::new(EventKind::Notification),
        })
    }

    pub fn close_read(&self) {
        self.inner.lock().read_closed = true;
        let _ = self.space_available.set(false);
    }

    pub fn close_write(&self) {
        self.inner.lock().write_closed = true;
        let _ = self.data_available.set(false);
    }

    pub fn available(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Read up to `buf.len()` bytes. Zero means end-of-stream (write end
    /// closed, buffer drained).
    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> KernelResult<usize> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.buffer.is_empty() {
                    let take = buf.len().min(inner.buffer.len());
                    for slot in buf.iter_mut().take(take) {
                        *slot = inner.buffer.pop_front().unwrap_or(0);
                    }
                    if inner.buffer.is_empty() {
                        self.data_available.clear();
                    }
                    let _ = self.space_available.set(false);
                    return Ok(take);
                }
                if inner.write_closed {
                    return Ok(0);
                }
                self.data_available.clear();
            }
            if nonblock {
                return Err(KernelError::WouldBlock);
            }
            // Recheck-after-clear keeps a racing writer's latch visible.
            if self.available() == 0 && !self.inner.lock().write_closed {
                self.data_available.wait()?;
            }
        }
    }

    /// Write `data`. Writes up to [`PIPE_BUF`] bytes go in whole or not
    /// at all; larger writes move in chunks. Writing with the read end
    /// closed raises SIGPIPE and reports end-of-stream.
    pub fn write(&self, data: &[u8], nonblock: bool) -> KernelResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let atomic = data.len() <= PIPE_BUF;
        let mut written = 0usize;
        while written < data.len() {
            {
                let mut inner = self.inner.lock();
                if inner.read_closed {
                    if let Some(thread) = crate::sched::current_thread() {
                        let _ = signal::kill_thread(&thread, SIGPIPE);
                    }
                    return Err(KernelError::Eof);
                }
                let space = inner.capacity - inner.buffer.len();
                let need = if atomic { data.len() } else { 1 };
                if space >= need {
                    let take = space.min(data.len() - written);
                    for &b in &data[written..written + take] {
                        inner.buffer.push_back(b);
                    }
                    written += take;
                    let _ = self.data_available.set(false);
                    if inner.buffer.len() == inner.capacity {
                        self.space_available.clear();
                    }
                    if written == data.len() {
                        return Ok(written);
                    }
                    continue;
                }
                self.space_available.clear();
            }
            if nonblock {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(KernelError::WouldBlock)
                };
            }
            self.space_available.wait()?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{self, Priority, Thread, ThreadState};

    fn adopt_thread() -> Arc<Thread> {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        t
    }

    #[test]
    fn basic_byte_stream() {
        let _t = adopt_thread();
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"hello", false).unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf, false).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn eof_after_writer_closes() {
        let _t = adopt_thread();
        let pipe = Pipe::new();
        pipe.write(b"tail", false).unwrap();
        pipe.close_write();
        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf, false).unwrap(), 4);
        assert_eq!(pipe.read(&mut buf, false).unwrap(), 0);
    }

    #[test]
    fn nonblocking_empty_read_would_block() {
        let _t = adopt_thread();
        let pipe = Pipe::new();
        let mut buf = [0u8; 4];
        assert_eq!(
            pipe.read(&mut buf, true),
            Err(KernelError::WouldBlock)
        );
    }

    #[test]
    fn full_pipe_blocks_writer_until_drained() {
        let pipe = Pipe::with_capacity(8);
        let main = adopt_thread();
        let _ = main;
        pipe.write(&[0u8; 8], false).unwrap();

        let p2 = pipe.clone();
        let writer = Thread::new(None, Priority::Normal, u64::MAX);
        let w2 = writer.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&w2);
            p2.write(b"x", false)
        });
        while writer.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        let mut buf = [0u8; 4];
        pipe.read(&mut buf, false).unwrap();
        assert_eq!(join.join().unwrap(), Ok(1));
    }

    #[test]
    fn write_to_closed_read_end_is_epipe() {
        let _t = adopt_thread();
        let pipe = Pipe::new();
        pipe.close_read();
        assert_eq!(pipe.write(b"data", false), Err(KernelError::Eof));
    }

    #[test]
    fn small_writes_are_atomic() {
        let _t = adopt_thread();
        let pipe = Pipe::with_capacity(PIPE_BUF);
        // Fill almost to capacity: an atomic write that does not fit
        // must not partially land.
        pipe.write(&[1u8; PIPE_BUF - 4], false).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            pipe.write(&[2u8; 8], true),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(pipe.available(), PIPE_BUF - 4);
        let _ = buf;
    }
}
