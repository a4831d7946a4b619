//! The per-guest host
//!
//! Owns the guest's fd table, its args/env snapshot, its working
//! directory, its exit code, and the cancellation view. All I/O a guest
//! performs flows through here; pipe operations are the suspension
//! points.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::RngCore;

use crate::clock::Clock;
use crate::error::FsErrorKind;
use crate::kernel::cancel::CancelState;
use crate::kernel::process::Pid;
use crate::vfs::{path as vpath, Metadata, Vfs};
use crate::wasi::fd::{FdTable, FdTarget, OutputBuffer, VfsFileHandle};
use crate::wasi::{SyscallError, SyscallResult};

/// Shared handle to the sandbox filesystem.
pub type SharedVfs = Rc<RefCell<Vfs>>;

/// Open flags for `path_open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        truncate: false,
        append: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        truncate: true,
        append: false,
    };

    pub const APPEND: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        truncate: false,
        append: true,
    };
}

pub struct WasiHost {
    pid: Pid,
    fds: RefCell<FdTable>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: RefCell<String>,
    exit_code: Cell<Option<i32>>,
    vfs: SharedVfs,
    clock: Rc<dyn Clock>,
    cancel: CancelState,
}

impl WasiHost {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: Pid,
        fds: FdTable,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        vfs: SharedVfs,
        clock: Rc<dyn Clock>,
        cancel: CancelState,
    ) -> Self {
        Self {
            pid,
            fds: RefCell::new(fds),
            args,
            env,
            cwd: RefCell::new(cwd),
            exit_code: Cell::new(None),
            vfs,
            clock,
            cancel,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn env_get(&self, name: &str) -> Option<String> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn cwd(&self) -> String {
        self.cwd.borrow().clone()
    }

    pub fn set_cwd(&self, cwd: impl Into<String>) {
        *self.cwd.borrow_mut() = cwd.into();
    }

    pub fn vfs(&self) -> &SharedVfs {
        &self.vfs
    }

    pub fn cancel_state(&self) -> &CancelState {
        &self.cancel
    }

    /// Absolute form of a guest-supplied path, anchored at the cwd.
    pub fn resolve_path(&self, p: &str) -> String {
        if p.starts_with('/') {
            vpath::normalize(p)
        } else {
            let cwd = self.cwd.borrow();
            if *cwd == "/" {
                vpath::normalize(&format!("/{}", p))
            } else {
                vpath::normalize(&format!("{}/{}", cwd, p))
            }
        }
    }

    // =====================================================================
    // Exit & cancellation
    // =====================================================================

    pub fn proc_exit(&self, code: i32) {
        if self.exit_code.get().is_none() {
            self.exit_code.set(Some(code));
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code.get().is_some()
    }

    /// Deadline check run at every host entry point.
    pub fn check_cancel(&self) -> SyscallResult<()> {
        match self.cancel.check() {
            Some(reason) => Err(SyscallError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    // =====================================================================
    // Fd table
    // =====================================================================

    pub fn fd_target(&self, fd: u32) -> Option<FdTarget> {
        self.fds.borrow().get(fd)
    }

    pub fn set_fd_target(&self, fd: u32, target: FdTarget) {
        self.fds.borrow_mut().set(fd, target);
    }

    pub fn alloc_fd(&self, target: FdTarget) -> u32 {
        self.fds.borrow_mut().alloc(target)
    }

    pub fn close_fd(&self, fd: u32) -> bool {
        self.fds.borrow_mut().close(fd)
    }

    pub fn open_fds(&self) -> Vec<u32> {
        self.fds.borrow().fds()
    }

    /// Release every fd. Called once when the process exits.
    pub fn release_fds(&self) {
        self.fds.borrow_mut().release_all();
    }

    /// Close only pipe-endpoint fds (cancellation sweep).
    pub fn close_pipe_fds(&self) {
        self.fds.borrow_mut().close_pipes();
    }

    /// The output buffer behind `fd`, if that is what it is.
    pub fn output_buffer(&self, fd: u32) -> Option<OutputBuffer> {
        match self.fds.borrow().get(fd) {
            Some(FdTarget::Buffer(buf)) => Some(buf),
            _ => None,
        }
    }

    // =====================================================================
    // Fd I/O
    // =====================================================================

    /// Write through an fd. Suspends on a full pipe; EPIPE once the read
    /// side is gone.
    pub async fn fd_write(&self, fd: u32, data: &[u8]) -> SyscallResult<usize> {
        self.check_cancel()?;
        let target = self
            .fd_target(fd)
            .ok_or(SyscallError::BadFd(fd))?;
        match target {
            FdTarget::Buffer(buf) => Ok(buf.push(data)),
            FdTarget::Null => Ok(data.len()),
            FdTarget::PipeWrite(writer) => {
                let n = writer.write(data).await;
                self.check_cancel()?;
                if n < 0 {
                    Err(SyscallError::BrokenPipe)
                } else {
                    Ok(n as usize)
                }
            }
            FdTarget::VfsFile(handle) => self.write_vfs_file(&handle, data),
            FdTarget::Static(_) | FdTarget::PipeRead(_) => Err(SyscallError::Invalid(format!(
                "fd {} is not writable",
                fd
            ))),
        }
    }

    fn write_vfs_file(&self, handle: &VfsFileHandle, data: &[u8]) -> SyscallResult<usize> {
        if !handle.writable() {
            return Err(SyscallError::Invalid(format!(
                "{} not opened for writing",
                handle.path()
            )));
        }
        let path = handle.path();
        let mut vfs = self.vfs.borrow_mut();
        if handle.append() {
            vfs.append_file(&path, data)?;
        } else {
            vfs.write_file_at(&path, handle.offset(), data)?;
            handle.advance(data.len() as u64);
        }
        Ok(data.len())
    }

    /// Read through an fd. Suspends on an empty pipe while writers
    /// remain; an empty result is EOF.
    pub async fn fd_read(&self, fd: u32, max: usize) -> SyscallResult<Vec<u8>> {
        self.check_cancel()?;
        let target = self
            .fd_target(fd)
            .ok_or(SyscallError::BadFd(fd))?;
        match target {
            FdTarget::Static(src) => Ok(src.read(max)),
            FdTarget::Null => Ok(Vec::new()),
            FdTarget::PipeRead(reader) => {
                let data = reader.read(max).await;
                self.check_cancel()?;
                Ok(data)
            }
            FdTarget::VfsFile(handle) => self.read_vfs_file(&handle, max),
            FdTarget::Buffer(_) | FdTarget::PipeWrite(_) => Err(SyscallError::Invalid(format!(
                "fd {} is not readable",
                fd
            ))),
        }
    }

    fn read_vfs_file(&self, handle: &VfsFileHandle, max: usize) -> SyscallResult<Vec<u8>> {
        if !handle.readable() {
            return Err(SyscallError::Invalid(format!(
                "{} not opened for reading",
                handle.path()
            )));
        }
        let content = self.vfs.borrow().read_file(&handle.path())?;
        let start = (handle.offset() as usize).min(content.len());
        let end = (start + max).min(content.len());
        handle.advance((end - start) as u64);
        Ok(content[start..end].to_vec())
    }

    /// Reposition a VFS file or static-source fd.
    pub fn fd_seek(&self, fd: u32, offset: i64, whence: u8) -> SyscallResult<u64> {
        self.check_cancel()?;
        let target = self
            .fd_target(fd)
            .ok_or(SyscallError::BadFd(fd))?;
        match target {
            FdTarget::VfsFile(handle) => {
                let size = self.vfs.borrow().stat(&handle.path())?.size;
                let base = match whence {
                    0 => 0,
                    1 => handle.offset() as i64,
                    2 => size as i64,
                    _ => return Err(SyscallError::Invalid("bad whence".to_string())),
                };
                let pos = base + offset;
                if pos < 0 {
                    return Err(SyscallError::Invalid("seek before start".to_string()));
                }
                handle.set_offset(pos as u64);
                Ok(pos as u64)
            }
            _ => Err(SyscallError::Invalid(format!("fd {} is not seekable", fd))),
        }
    }

    // =====================================================================
    // Path operations
    // =====================================================================

    pub fn path_open(&self, p: &str, flags: OpenFlags) -> SyscallResult<u32> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        let stat = self.vfs.borrow().stat(&path);
        match stat {
            Ok(meta) if meta.is_dir => {
                return Err(SyscallError::Fs(crate::error::FsError::eisdir(&path)));
            }
            Ok(_) => {
                if flags.truncate {
                    self.vfs.borrow_mut().write_file(&path, b"")?;
                }
            }
            Err(e) if e.kind == FsErrorKind::Enoent && flags.create => {
                self.vfs.borrow_mut().write_file(&path, b"")?;
            }
            Err(e) => return Err(e.into()),
        }
        let handle = VfsFileHandle::new(&path, flags.read, flags.write, flags.append);
        if flags.append {
            let size = self.vfs.borrow().stat(&path)?.size;
            handle.set_offset(size);
        }
        Ok(self.alloc_fd(FdTarget::VfsFile(handle)))
    }

    pub fn path_create_directory(&self, p: &str) -> SyscallResult<()> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        self.vfs.borrow_mut().mkdir(&path)?;
        Ok(())
    }

    pub fn path_remove_directory(&self, p: &str) -> SyscallResult<()> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        self.vfs.borrow_mut().rmdir(&path)?;
        Ok(())
    }

    pub fn path_unlink_file(&self, p: &str) -> SyscallResult<()> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        self.vfs.borrow_mut().unlink(&path)?;
        Ok(())
    }

    pub fn path_stat(&self, p: &str) -> SyscallResult<Metadata> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        Ok(self.vfs.borrow().stat(&path)?)
    }

    pub fn path_readdir(&self, p: &str) -> SyscallResult<Vec<crate::vfs::DirEntry>> {
        self.check_cancel()?;
        let path = self.resolve_path(p);
        Ok(self.vfs.borrow().readdir(&path)?)
    }

    // =====================================================================
    // Clocks, randomness, environment
    // =====================================================================

    /// Monotonic nanoseconds since sandbox creation.
    pub fn clock_monotonic_ns(&self) -> u64 {
        self.clock.monotonic_ms() * 1_000_000
    }

    /// Wall-clock nanoseconds since the epoch.
    pub fn clock_wall_ns(&self) -> u64 {
        self.clock.wall_ms() * 1_000_000
    }

    pub fn monotonic_ms(&self) -> u64 {
        self.clock.monotonic_ms()
    }

    pub fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kernel::cancel::CancelReason;
    use crate::kernel::executor::Executor;
    use crate::kernel::pipe::pipe;
    use crate::wasi::fd::StaticSource;

    fn host_with_vfs() -> (WasiHost, SharedVfs) {
        let vfs: SharedVfs = Rc::new(RefCell::new(Vfs::new()));
        vfs.borrow_mut().with_bypass(|fs| {
            fs.mkdirp("/home/user").unwrap();
            fs.mkdirp("/tmp").unwrap();
        });
        let clock: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let cancel = CancelState::new(clock.clone());
        let host = WasiHost::new(
            Pid(1),
            FdTable::new(),
            vec!["test".to_string()],
            vec![("HOME".to_string(), "/home/user".to_string())],
            "/home/user".to_string(),
            vfs.clone(),
            clock,
            cancel,
        );
        (host, vfs)
    }

    fn block_on_host<F, T>(f: F) -> T
    where
        F: std::future::Future<Output = T> + 'static,
        T: 'static,
    {
        let exec = Executor::new();
        let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let out_clone = out.clone();
        exec.spawn(async move {
            *out_clone.borrow_mut() = Some(f.await);
        });
        exec.run_until_stalled();
        let result = out.borrow_mut().take();
        result.expect("future did not complete")
    }

    #[test]
    fn test_write_to_buffer() {
        let (host, _) = host_with_vfs();
        host.set_fd_target(1, FdTarget::Buffer(OutputBuffer::new(None)));
        let n = block_on_host({
            let host = Rc::new(host);
            let h = host.clone();
            async move {
                let n = h.fd_write(1, b"out").await.unwrap();
                assert_eq!(h.output_buffer(1).unwrap().contents(), b"out");
                n
            }
        });
        assert_eq!(n, 3);
    }

    #[test]
    fn test_read_static_stdin() {
        let (host, _) = host_with_vfs();
        host.set_fd_target(0, FdTarget::Static(StaticSource::new(b"input".to_vec())));
        let host = Rc::new(host);
        let h = host.clone();
        let data = block_on_host(async move { h.fd_read(0, 3).await.unwrap() });
        assert_eq!(data, b"inp");
    }

    #[test]
    fn test_null_read_is_eof() {
        let (host, _) = host_with_vfs();
        let host = Rc::new(host);
        let h = host.clone();
        let data = block_on_host(async move { h.fd_read(0, 64).await.unwrap() });
        assert!(data.is_empty());
    }

    #[test]
    fn test_pipe_write_epipe() {
        let (host, _) = host_with_vfs();
        let (reader, writer) = pipe();
        host.set_fd_target(1, FdTarget::PipeWrite(writer));
        reader.release();
        let host = Rc::new(host);
        let h = host.clone();
        let err = block_on_host(async move { h.fd_write(1, b"x").await.unwrap_err() });
        assert_eq!(err, SyscallError::BrokenPipe);
    }

    #[test]
    fn test_path_open_create_and_rw() {
        let (host, vfs) = host_with_vfs();
        let host = Rc::new(host);
        let h = host.clone();
        block_on_host(async move {
            let fd = h.path_open("notes.txt", OpenFlags::WRITE).unwrap();
            h.fd_write(fd, b"hello").await.unwrap();
            h.close_fd(fd);

            let fd = h.path_open("notes.txt", OpenFlags::READ).unwrap();
            let data = h.fd_read(fd, 64).await.unwrap();
            assert_eq!(data, b"hello");
            // Next read is EOF.
            assert!(h.fd_read(fd, 64).await.unwrap().is_empty());
        });
        assert!(vfs.borrow().exists("/home/user/notes.txt"));
    }

    #[test]
    fn test_path_open_append() {
        let (host, vfs) = host_with_vfs();
        vfs.borrow_mut()
            .write_file("/home/user/log", b"one\n")
            .unwrap();
        let host = Rc::new(host);
        let h = host.clone();
        block_on_host(async move {
            let fd = h.path_open("log", OpenFlags::APPEND).unwrap();
            h.fd_write(fd, b"two\n").await.unwrap();
        });
        assert_eq!(vfs.borrow().read_file("/home/user/log").unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_open_directory_is_eisdir() {
        let (host, _) = host_with_vfs();
        let err = host.path_open("/home", OpenFlags::READ).unwrap_err();
        assert!(matches!(err, SyscallError::Fs(e) if e.kind == FsErrorKind::Eisdir));
    }

    #[test]
    fn test_cancel_blocks_entry_points() {
        let (host, _) = host_with_vfs();
        host.cancel_state().cancel(CancelReason::Timeout);
        let err = host.path_stat("/home").unwrap_err();
        assert_eq!(err, SyscallError::Cancelled(CancelReason::Timeout));
    }

    #[test]
    fn test_proc_exit_latches_first_code() {
        let (host, _) = host_with_vfs();
        host.proc_exit(3);
        host.proc_exit(7);
        assert_eq!(host.exit_code(), Some(3));
    }

    #[test]
    fn test_fd_seek() {
        let (host, vfs) = host_with_vfs();
        vfs.borrow_mut()
            .write_file("/home/user/f", b"abcdef")
            .unwrap();
        let host = Rc::new(host);
        let h = host.clone();
        block_on_host(async move {
            let fd = h.path_open("f", OpenFlags::READ).unwrap();
            assert_eq!(h.fd_seek(fd, 2, 0).unwrap(), 2);
            assert_eq!(h.fd_read(fd, 2).await.unwrap(), b"cd");
            assert_eq!(h.fd_seek(fd, -1, 2).unwrap(), 5);
            assert_eq!(h.fd_read(fd, 2).await.unwrap(), b"f");
        });
    }
}
