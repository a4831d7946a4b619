//! Fd targets and per-process fd tables
//!
//! What a descriptor means to a guest is a closed tagged union: an
//! accumulating buffer, a static byte source, a pipe endpoint, the null
//! sink, or an open VFS file handle. Fds 0/1/2 always exist; allocation
//! picks the smallest free fd ≥ 3.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::kernel::pipe::{PipeReader, PipeWriter};

/// Accumulates guest output under an optional byte cap. Overflow is
/// accepted and discarded; the `truncated` flag latches.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Rc<RefCell<BufferInner>>,
}

struct BufferInner {
    data: Vec<u8>,
    cap: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BufferInner {
                data: Vec::new(),
                cap,
                truncated: false,
            })),
        }
    }

    /// Append bytes, reporting the full length as written even when the
    /// cap swallows part of it.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        match inner.cap {
            Some(cap) => {
                let room = cap.saturating_sub(inner.data.len());
                let keep = bytes.len().min(room);
                inner.data.extend_from_slice(&bytes[..keep]);
                if keep < bytes.len() {
                    inner.truncated = true;
                }
            }
            None => inner.data.extend_from_slice(bytes),
        }
        bytes.len()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.borrow().data.clone()
    }

    pub fn truncated(&self) -> bool {
        self.inner.borrow().truncated
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().data.is_empty()
    }
}

/// A byte slice with a read offset; reads past the end return nothing.
#[derive(Clone)]
pub struct StaticSource {
    inner: Rc<RefCell<StaticInner>>,
}

struct StaticInner {
    data: Rc<Vec<u8>>,
    pos: usize,
}

impl StaticSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StaticInner {
                data: Rc::new(data),
                pos: 0,
            })),
        }
    }

    pub fn read(&self, max: usize) -> Vec<u8> {
        let mut inner = self.inner.borrow_mut();
        let start = inner.pos.min(inner.data.len());
        let end = (start + max).min(inner.data.len());
        inner.pos = end;
        inner.data[start..end].to_vec()
    }
}

/// An open VFS file: path plus a tracked offset.
#[derive(Clone)]
pub struct VfsFileHandle {
    inner: Rc<RefCell<VfsFileInner>>,
}

struct VfsFileInner {
    path: String,
    offset: u64,
    readable: bool,
    writable: bool,
    append: bool,
}

impl VfsFileHandle {
    pub fn new(path: impl Into<String>, readable: bool, writable: bool, append: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(VfsFileInner {
                path: path.into(),
                offset: 0,
                readable,
                writable,
                append,
            })),
        }
    }

    pub fn path(&self) -> String {
        self.inner.borrow().path.clone()
    }

    pub fn offset(&self) -> u64 {
        self.inner.borrow().offset
    }

    pub fn set_offset(&self, offset: u64) {
        self.inner.borrow_mut().offset = offset;
    }

    pub fn advance(&self, by: u64) {
        self.inner.borrow_mut().offset += by;
    }

    pub fn readable(&self) -> bool {
        self.inner.borrow().readable
    }

    pub fn writable(&self) -> bool {
        self.inner.borrow().writable
    }

    pub fn append(&self) -> bool {
        self.inner.borrow().append
    }
}

/// What an fd means to a guest.
#[derive(Clone)]
pub enum FdTarget {
    /// Accumulating output buffer (stdout/stderr capture)
    Buffer(OutputBuffer),
    /// Static bytes with a read offset (pre-supplied stdin)
    Static(StaticSource),
    /// Read end of an async pipe
    PipeRead(PipeReader),
    /// Write end of an async pipe
    PipeWrite(PipeWriter),
    /// Discard on write, EOF on read
    Null,
    /// Open VFS file with offset
    VfsFile(VfsFileHandle),
}

impl FdTarget {
    /// Retain the underlying pipe handle when the target enters another
    /// table slot.
    pub fn retain(&self) {
        match self {
            FdTarget::PipeRead(r) => r.retain(),
            FdTarget::PipeWrite(w) => w.retain(),
            _ => {}
        }
    }

    /// Release the underlying pipe handle when the target leaves a table
    /// slot.
    pub fn release(&self) {
        match self {
            FdTarget::PipeRead(r) => r.release(),
            FdTarget::PipeWrite(w) => w.release(),
            _ => {}
        }
    }
}

/// Per-process fd table.
pub struct FdTable {
    map: HashMap<u32, FdTarget>,
}

impl FdTable {
    /// Fresh table with fds 0/1/2 wired to the null target.
    pub fn new() -> Self {
        let mut map = HashMap::new();
        map.insert(0, FdTarget::Null);
        map.insert(1, FdTarget::Null);
        map.insert(2, FdTarget::Null);
        Self { map }
    }

    /// Allocate the smallest free fd ≥ 3 for `target`.
    pub fn alloc(&mut self, target: FdTarget) -> u32 {
        let mut fd = 3;
        while self.map.contains_key(&fd) {
            fd += 1;
        }
        self.map.insert(fd, target);
        fd
    }

    pub fn get(&self, fd: u32) -> Option<FdTarget> {
        self.map.get(&fd).cloned()
    }

    /// Install `target` at `fd`, releasing whatever held the slot.
    pub fn set(&mut self, fd: u32, target: FdTarget) {
        if let Some(old) = self.map.insert(fd, target) {
            old.release();
        }
    }

    /// Close one fd, releasing any pipe endpoint behind it. Fds 0/1/2
    /// revert to the null target rather than disappearing.
    pub fn close(&mut self, fd: u32) -> bool {
        match self.map.remove(&fd) {
            Some(target) => {
                target.release();
                if fd < 3 {
                    self.map.insert(fd, FdTarget::Null);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fd: u32) -> bool {
        self.map.contains_key(&fd)
    }

    pub fn fds(&self) -> Vec<u32> {
        let mut fds: Vec<u32> = self.map.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Release every pipe endpoint in the table. Called on process exit
    /// so pipelines observe EOF/EPIPE from departed stages.
    pub fn release_all(&mut self) {
        for (_, target) in self.map.drain() {
            target.release();
        }
    }

    /// Close only the fds holding pipe endpoints, leaving buffers and
    /// files in place. Backs the cancellation sweep.
    pub fn close_pipes(&mut self) {
        let pipe_fds: Vec<u32> = self
            .map
            .iter()
            .filter(|(_, t)| matches!(t, FdTarget::PipeRead(_) | FdTarget::PipeWrite(_)))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in pipe_fds {
            self.close(fd);
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::pipe::pipe;

    #[test]
    fn test_stdio_always_present() {
        let table = FdTable::new();
        assert!(table.contains(0));
        assert!(table.contains(1));
        assert!(table.contains(2));
    }

    #[test]
    fn test_alloc_smallest_free() {
        let mut table = FdTable::new();
        assert_eq!(table.alloc(FdTarget::Null), 3);
        assert_eq!(table.alloc(FdTarget::Null), 4);
        table.close(3);
        assert_eq!(table.alloc(FdTarget::Null), 3);
    }

    #[test]
    fn test_close_stdio_reverts_to_null() {
        let mut table = FdTable::new();
        table.set(1, FdTarget::Buffer(OutputBuffer::new(None)));
        assert!(table.close(1));
        assert!(matches!(table.get(1), Some(FdTarget::Null)));
    }

    #[test]
    fn test_close_releases_pipe_endpoint() {
        let (reader, writer) = pipe();
        let mut table = FdTable::new();
        let fd = table.alloc(FdTarget::PipeWrite(writer));
        table.close(fd);
        // Write side gone: reader sees EOF.
        assert_eq!(reader.try_read(8).unwrap(), b"");
    }

    #[test]
    fn test_release_all() {
        let (reader, writer) = pipe();
        let mut table = FdTable::new();
        table.set(1, FdTarget::PipeWrite(writer));
        table.release_all();
        assert_eq!(reader.try_read(8).unwrap(), b"");
    }

    #[test]
    fn test_buffer_cap_sets_truncated() {
        let buf = OutputBuffer::new(Some(4));
        assert_eq!(buf.push(b"123456"), 6);
        assert_eq!(buf.contents(), b"1234");
        assert!(buf.truncated());
    }

    #[test]
    fn test_buffer_uncapped() {
        let buf = OutputBuffer::new(None);
        buf.push(b"hello");
        assert_eq!(buf.contents(), b"hello");
        assert!(!buf.truncated());
    }

    #[test]
    fn test_static_source_reads_then_eof() {
        let src = StaticSource::new(b"abcdef".to_vec());
        assert_eq!(src.read(4), b"abcd");
        assert_eq!(src.read(4), b"ef");
        assert_eq!(src.read(4), b"");
    }
}
