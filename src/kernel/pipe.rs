//! Asynchronous bounded pipe
//!
//! A unidirectional byte FIFO between one read end and one write end.
//! Reads suspend while the pipe is empty and writers remain; async writes
//! accept what fits and suspend for the remainder while the pipe is full.
//! Each side carries an open-handle count: sharing an endpoint into a
//! child's fd table retains it, closing releases it. EOF (0) appears once
//! every write handle is gone and the buffer drains; EPIPE (−1) appears
//! once every read handle is gone.
//!
//! At most one continuation may be parked per side at any instant; the
//! slot holds exactly one waker.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tracing::trace;

/// Default pipe capacity: 64 KiB.
pub const PIPE_CAPACITY: usize = 65536;

/// Write-side result of a pipe operation: bytes accepted, or −1 once the
/// read side has gone away.
pub const EPIPE: i64 = -1;

struct PipeState {
    data: VecDeque<u8>,
    capacity: usize,
    /// Open read handles
    readers: u32,
    /// Open write handles
    writers: u32,
    /// Parked reader, if any
    read_waker: Option<Waker>,
    /// Parked writer, if any
    write_waker: Option<Waker>,
}

impl PipeState {
    fn space(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Create a pipe with the default capacity.
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(PIPE_CAPACITY)
}

pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let state = Rc::new(RefCell::new(PipeState {
        data: VecDeque::with_capacity(capacity.min(4096)),
        capacity,
        readers: 1,
        writers: 1,
        read_waker: None,
        write_waker: None,
    }));
    (
        PipeReader {
            state: state.clone(),
        },
        PipeWriter { state },
    )
}

/// Read end of a pipe. Cloning shares the handle; use `retain`/`release`
/// to track table membership.
#[derive(Clone)]
pub struct PipeReader {
    state: Rc<RefCell<PipeState>>,
}

impl PipeReader {
    /// Account one more open handle (a new fd-table slot).
    pub fn retain(&self) {
        self.state.borrow_mut().readers += 1;
    }

    /// Release one handle. The last release closes the read side: any
    /// parked writer resolves with EPIPE and buffered data is dropped.
    pub fn release(&self) {
        let mut state = self.state.borrow_mut();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            trace!("pipe read side closed");
            state.data.clear();
            state.wake_writer();
        }
    }

    /// Read up to `max` bytes. Resolves with an empty vec at EOF;
    /// suspends while the pipe is empty and write handles remain.
    pub fn read(&self, max: usize) -> PipeReadFuture {
        PipeReadFuture {
            state: self.state.clone(),
            max,
        }
    }

    /// Non-blocking read; `None` means "would block".
    pub fn try_read(&self, max: usize) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        if !state.data.is_empty() {
            let n = max.min(state.data.len());
            let out: Vec<u8> = state.data.drain(..n).collect();
            state.wake_writer();
            Some(out)
        } else if state.writers == 0 {
            Some(Vec::new())
        } else {
            None
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().readers == 0
    }
}

/// Write end of a pipe.
#[derive(Clone)]
pub struct PipeWriter {
    state: Rc<RefCell<PipeState>>,
}

impl PipeWriter {
    pub fn retain(&self) {
        self.state.borrow_mut().writers += 1;
    }

    /// Release one handle. The last release closes the write side: a
    /// parked reader resolves with EOF once the buffer drains.
    pub fn release(&self) {
        let mut state = self.state.borrow_mut();
        state.writers = state.writers.saturating_sub(1);
        if state.writers == 0 {
            trace!("pipe write side closed");
            state.wake_reader();
        }
    }

    /// Synchronous write: accept what fits right now and return the
    /// (possibly short, possibly zero) count, or EPIPE.
    pub fn try_write(&self, data: &[u8]) -> i64 {
        let mut state = self.state.borrow_mut();
        if state.readers == 0 {
            return EPIPE;
        }
        let n = data.len().min(state.space());
        state.data.extend(&data[..n]);
        if n > 0 {
            state.wake_reader();
        }
        n as i64
    }

    /// Asynchronous write: accepts the whole buffer, suspending while the
    /// pipe is full. Resolves with the byte count, or EPIPE once the read
    /// side has gone away.
    pub fn write(&self, data: &[u8]) -> PipeWriteFuture {
        PipeWriteFuture {
            state: self.state.clone(),
            data: data.to_vec(),
            written: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().writers == 0
    }
}

pub struct PipeReadFuture {
    state: Rc<RefCell<PipeState>>,
    max: usize,
}

impl Future for PipeReadFuture {
    type Output = Vec<u8>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if !state.data.is_empty() {
            let n = self.max.min(state.data.len());
            let out: Vec<u8> = state.data.drain(..n).collect();
            state.wake_writer();
            return Poll::Ready(out);
        }
        if state.writers == 0 {
            return Poll::Ready(Vec::new()); // EOF
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

pub struct PipeWriteFuture {
    state: Rc<RefCell<PipeState>>,
    data: Vec<u8>,
    written: usize,
}

impl Future for PipeWriteFuture {
    type Output = i64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.state.borrow_mut();
        if state.readers == 0 {
            return Poll::Ready(EPIPE);
        }
        let remaining = &this.data[this.written..];
        let n = remaining.len().min(state.space());
        if n > 0 {
            state.data.extend(&remaining[..n]);
            this.written += n;
            state.wake_reader();
        }
        if this.written == this.data.len() {
            Poll::Ready(this.written as i64)
        } else {
            state.write_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::executor::Executor;
    use std::cell::RefCell;

    #[test]
    fn test_write_then_read() {
        let (reader, writer) = pipe();
        assert_eq!(writer.try_write(b"hello"), 5);
        assert_eq!(reader.try_read(64).unwrap(), b"hello");
    }

    #[test]
    fn test_byte_order_preserved() {
        let (reader, writer) = pipe();
        writer.try_write(b"abc");
        writer.try_write(b"def");
        assert_eq!(reader.try_read(2).unwrap(), b"ab");
        assert_eq!(reader.try_read(64).unwrap(), b"cdef");
    }

    #[test]
    fn test_sync_write_exact_capacity() {
        let (_reader, writer) = pipe_with_capacity(8);
        assert_eq!(writer.try_write(&[1u8; 8]), 8);
    }

    #[test]
    fn test_sync_write_over_capacity_is_short() {
        let (_reader, writer) = pipe_with_capacity(8);
        assert_eq!(writer.try_write(&[1u8; 9]), 8);
        // Full pipe: synchronous write returns 0.
        assert_eq!(writer.try_write(&[2u8; 1]), 0);
    }

    #[test]
    fn test_eof_after_writer_release() {
        let (reader, writer) = pipe();
        writer.try_write(b"tail");
        writer.release();
        assert_eq!(reader.try_read(64).unwrap(), b"tail");
        assert_eq!(reader.try_read(64).unwrap(), b"");
        assert_eq!(reader.try_read(64).unwrap(), b"");
    }

    #[test]
    fn test_epipe_after_reader_release() {
        let (reader, writer) = pipe();
        reader.release();
        assert_eq!(writer.try_write(b"x"), EPIPE);
    }

    #[test]
    fn test_retain_keeps_side_open() {
        let (reader, writer) = pipe();
        writer.retain();
        writer.release();
        // One write handle remains: no EOF yet.
        assert!(reader.try_read(4).is_none());
        writer.release();
        assert_eq!(reader.try_read(4).unwrap(), b"");
    }

    #[test]
    fn test_async_read_suspends_until_write() {
        let exec = Executor::new();
        let (reader, writer) = pipe();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_clone = seen.clone();
        exec.spawn(async move {
            let data = reader.read(64).await;
            seen_clone.borrow_mut().extend_from_slice(&data);
        });

        exec.run_until_stalled();
        assert!(seen.borrow().is_empty());

        writer.try_write(b"late");
        exec.run_until_stalled();
        assert_eq!(&*seen.borrow(), b"late");
    }

    #[test]
    fn test_async_write_suspends_while_full() {
        let exec = Executor::new();
        let (reader, writer) = pipe_with_capacity(4);
        let result = Rc::new(RefCell::new(None));

        let result_clone = result.clone();
        exec.spawn(async move {
            // 4 bytes fit; the 5th suspends until the reader drains.
            let n = writer.write(b"12345").await;
            *result_clone.borrow_mut() = Some(n);
        });

        exec.run_until_stalled();
        assert!(result.borrow().is_none());

        assert_eq!(reader.try_read(2).unwrap(), b"12");
        exec.run_until_stalled();
        assert_eq!(*result.borrow(), Some(5));
        assert_eq!(reader.try_read(64).unwrap(), b"345");
    }

    #[test]
    fn test_reader_close_wakes_parked_writer_with_epipe() {
        let exec = Executor::new();
        let (reader, writer) = pipe_with_capacity(2);
        let result = Rc::new(RefCell::new(None));

        let result_clone = result.clone();
        exec.spawn(async move {
            let n = writer.write(b"abcdef").await;
            *result_clone.borrow_mut() = Some(n);
        });

        exec.run_until_stalled();
        assert!(result.borrow().is_none());

        reader.release();
        exec.run_until_stalled();
        assert_eq!(*result.borrow(), Some(EPIPE));
    }

    #[test]
    fn test_writer_close_wakes_parked_reader_with_eof() {
        let exec = Executor::new();
        let (reader, writer) = pipe();
        let result = Rc::new(RefCell::new(None));

        let result_clone = result.clone();
        exec.spawn(async move {
            let data = reader.read(64).await;
            *result_clone.borrow_mut() = Some(data);
        });

        exec.run_until_stalled();
        assert!(result.borrow().is_none());

        writer.release();
        exec.run_until_stalled();
        assert_eq!(*result.borrow(), Some(Vec::new()));
    }

    #[test]
    fn test_every_byte_appears_once_in_order() {
        let exec = Executor::new();
        let (reader, writer) = pipe_with_capacity(16);
        let collected = Rc::new(RefCell::new(Vec::new()));

        let collected_clone = collected.clone();
        exec.spawn(async move {
            loop {
                let chunk = reader.read(7).await;
                if chunk.is_empty() {
                    break;
                }
                collected_clone.borrow_mut().extend_from_slice(&chunk);
            }
        });

        exec.spawn(async move {
            for block in 0u8..8 {
                let data: Vec<u8> = (0..32).map(|i| block * 32 + i).collect();
                assert_eq!(writer.write(&data).await, 32);
            }
            writer.release();
        });

        exec.run_until_stalled();
        let expected: Vec<u8> = (0u8..=255).collect();
        assert_eq!(*collected.borrow(), expected);
    }
}
