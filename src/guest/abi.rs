//! Host-ABI — the kernel imports visible to guests
//!
//! One capability namespace; each guest holds the subset the matrix
//! grants it. Typed calls back the native toolset and the shell; the
//! raw entry points at the bottom carry the bytecode convention —
//! strings and buffers as (pointer, length) pairs, results into an
//! (out-pointer, out-capacity) region, with the required size returned
//! when the output does not fit so the guest can re-allocate and retry.

use std::rc::Rc;

use serde::Serialize;
use tracing::warn;

use crate::guest::memory::{write_out, GuestMemory};
use crate::guest::Capability;
use crate::kernel::kernel::{Kernel, SpawnRequest};
use crate::kernel::mailbox::Mailbox;
use crate::kernel::network::{FetchRequest, FetchResponse};
use crate::kernel::process::Pid;
use crate::vfs::Metadata;
use crate::wasi::host::WasiHost;
use crate::wasi::preview1::errno_for;
use crate::wasi::{SyscallError, SyscallResult};

/// What the shell hands back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub exit_code: i32,
    pub cancelled: bool,
}

/// Driver ↔ shell-guest command rendezvous.
pub type ShellMailbox = Mailbox<String, CommandStatus>;

pub struct HostAbi {
    kernel: Rc<Kernel>,
    host: Rc<WasiHost>,
    caps: Vec<Capability>,
    shell_io: Option<ShellMailbox>,
}

impl HostAbi {
    pub fn new(
        kernel: Rc<Kernel>,
        host: Rc<WasiHost>,
        caps: Vec<Capability>,
        shell_io: Option<ShellMailbox>,
    ) -> Self {
        Self {
            kernel,
            host,
            caps,
            shell_io,
        }
    }

    pub fn host(&self) -> &Rc<WasiHost> {
        &self.host
    }

    pub fn kernel(&self) -> &Rc<Kernel> {
        &self.kernel
    }

    fn require(&self, cap: Capability, call: &str) -> SyscallResult<()> {
        if self.caps.contains(&cap) {
            Ok(())
        } else {
            warn!(pid = %self.host.pid(), call, "capability denied");
            Err(SyscallError::NotPermitted(call.to_string()))
        }
    }

    // =====================================================================
    // Process calls
    // =====================================================================

    pub fn pipe(&self) -> SyscallResult<(u32, u32)> {
        self.require(Capability::Process, "pipe")?;
        self.host.check_cancel()?;
        self.kernel.create_pipe(self.host.pid())
    }

    /// Synchronous return of the child pid; the child runs concurrently.
    pub fn spawn(&self, req: SpawnRequest) -> SyscallResult<u32> {
        self.require(Capability::Process, "spawn")?;
        self.host.check_cancel()?;
        let pid = self.kernel.spawn(self.host.pid(), req)?;
        Ok(pid.0)
    }

    /// Suspends the caller until the target exits.
    pub async fn waitpid(&self, pid: u32) -> SyscallResult<i32> {
        self.require(Capability::Process, "waitpid")?;
        self.kernel.waitpid(Pid(pid)).await
    }

    pub fn close_fd(&self, fd: u32) -> SyscallResult<()> {
        self.require(Capability::Process, "close_fd")?;
        self.kernel.close_fd(self.host.pid(), fd)
    }

    pub fn has_tool(&self, name: &str) -> SyscallResult<bool> {
        self.require(Capability::Process, "has_tool")?;
        Ok(self.kernel.has_tool(name))
    }

    // =====================================================================
    // Always-available calls
    // =====================================================================

    /// 0 = ok, 1 = timeout, 2 = cancelled.
    pub fn check_cancel(&self) -> u32 {
        self.kernel.check_cancel()
    }

    pub fn time_ms(&self) -> SyscallResult<u64> {
        self.require(Capability::Time, "time_ms")?;
        Ok(self.kernel.time_ms())
    }

    // =====================================================================
    // Filesystem calls
    // =====================================================================

    pub fn stat(&self, path: &str) -> SyscallResult<Metadata> {
        self.require(Capability::Filesystem, "stat")?;
        self.host.path_stat(path)
    }

    pub fn read_file(&self, path: &str) -> SyscallResult<Vec<u8>> {
        self.require(Capability::Filesystem, "read_file")?;
        self.host.check_cancel()?;
        let path = self.host.resolve_path(path);
        Ok(self.kernel.vfs().borrow().read_file(&path)?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> SyscallResult<()> {
        self.require(Capability::Filesystem, "write_file")?;
        self.host.check_cancel()?;
        let path = self.host.resolve_path(path);
        Ok(self.kernel.vfs().borrow_mut().write_file(&path, data)?)
    }

    pub fn readdir(&self, path: &str) -> SyscallResult<Vec<crate::vfs::DirEntry>> {
        self.require(Capability::Filesystem, "readdir")?;
        self.host.check_cancel()?;
        let path = self.host.resolve_path(path);
        Ok(self.kernel.vfs().borrow().readdir(&path)?)
    }

    /// Resolve a glob against the VFS, anchored at the guest's cwd.
    pub fn glob(&self, pattern: &str) -> SyscallResult<Vec<String>> {
        self.require(Capability::Filesystem, "glob")?;
        self.host.check_cancel()?;
        Ok(self.kernel.glob(pattern, &self.host.cwd()))
    }

    // =====================================================================
    // Network & extensions
    // =====================================================================

    pub async fn network_fetch(&self, request: FetchRequest) -> SyscallResult<FetchResponse> {
        self.require(Capability::Network, "network_fetch")?;
        self.host.check_cancel()?;
        Ok(self.kernel.network_fetch(request).await)
    }

    pub fn extension_invoke(&self, name: &str, payload: &str) -> SyscallResult<String> {
        self.require(Capability::Extension, "extension_invoke")?;
        self.host.check_cancel()?;
        self.kernel
            .invoke_extension(name, payload)
            .map_err(SyscallError::Network)
    }

    // =====================================================================
    // Shell-only calls
    // =====================================================================

    /// Block for the next command line. Resolves `None` when the driver
    /// shuts the shell down.
    pub async fn read_command(&self) -> SyscallResult<Option<String>> {
        self.require(Capability::ShellIo, "read_command")?;
        let mailbox = self
            .shell_io
            .as_ref()
            .ok_or_else(|| SyscallError::Invalid("no shell mailbox".to_string()))?;
        Ok(mailbox.recv_request().await)
    }

    /// Return the result for the command taken last.
    pub fn write_result(&self, status: CommandStatus) -> SyscallResult<()> {
        self.require(Capability::ShellIo, "write_result")?;
        let mailbox = self
            .shell_io
            .as_ref()
            .ok_or_else(|| SyscallError::Invalid("no shell mailbox".to_string()))?;
        mailbox.post_response(status);
        Ok(())
    }
}

// =========================================================================
// Raw entry points (bytecode convention)
// =========================================================================

/// stat result as marshalled to guests.
#[derive(Serialize)]
struct RawStat<'a> {
    size: u64,
    kind: &'a str,
    mode: u32,
    mtime: u64,
}

fn errno_code(err: &SyscallError) -> i64 {
    -(errno_for(err) as i64)
}

/// read_file over guest memory. Returns bytes written, the required
/// size when `out_cap` is too small, or a negative errno.
pub fn raw_read_file(
    abi: &HostAbi,
    mem: &mut dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
    out_ptr: u32,
    out_cap: u32,
) -> i64 {
    let Ok(path) = mem.read_str(path_ptr, path_len) else {
        return errno_code(&SyscallError::Invalid("bad path pointer".to_string()));
    };
    match abi.read_file(&path) {
        Ok(data) => match write_out(mem, out_ptr, out_cap, &data) {
            Ok(n) => n as i64,
            Err(_) => errno_code(&SyscallError::Invalid("bad out pointer".to_string())),
        },
        Err(err) => errno_code(&err),
    }
}

/// write_file over guest memory. Returns 0 or a negative errno.
pub fn raw_write_file(
    abi: &HostAbi,
    mem: &mut dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
    data_ptr: u32,
    data_len: u32,
) -> i64 {
    let (Ok(path), Ok(data)) = (
        mem.read_str(path_ptr, path_len),
        mem.read(data_ptr, data_len),
    ) else {
        return errno_code(&SyscallError::Invalid("bad pointer".to_string()));
    };
    match abi.write_file(&path, &data) {
        Ok(()) => 0,
        Err(err) => errno_code(&err),
    }
}

/// stat over guest memory; the result is a JSON record.
pub fn raw_stat(
    abi: &HostAbi,
    mem: &mut dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
    out_ptr: u32,
    out_cap: u32,
) -> i64 {
    let Ok(path) = mem.read_str(path_ptr, path_len) else {
        return errno_code(&SyscallError::Invalid("bad path pointer".to_string()));
    };
    match abi.stat(&path) {
        Ok(meta) => {
            let record = RawStat {
                size: meta.size,
                kind: if meta.is_dir {
                    "dir"
                } else if meta.is_symlink {
                    "symlink"
                } else {
                    "file"
                },
                mode: meta.mode,
                mtime: meta.mtime,
            };
            let json = serde_json::to_vec(&record).unwrap_or_default();
            match write_out(mem, out_ptr, out_cap, &json) {
                Ok(n) => n as i64,
                Err(_) => errno_code(&SyscallError::Invalid("bad out pointer".to_string())),
            }
        }
        Err(err) => errno_code(&err),
    }
}

/// glob over guest memory; matches come back newline-joined.
pub fn raw_glob(
    abi: &HostAbi,
    mem: &mut dyn GuestMemory,
    pattern_ptr: u32,
    pattern_len: u32,
    out_ptr: u32,
    out_cap: u32,
) -> i64 {
    let Ok(pattern) = mem.read_str(pattern_ptr, pattern_len) else {
        return errno_code(&SyscallError::Invalid("bad pattern pointer".to_string()));
    };
    match abi.glob(&pattern) {
        Ok(matches) => {
            let joined = matches.join("\n");
            match write_out(mem, out_ptr, out_cap, joined.as_bytes()) {
                Ok(n) => n as i64,
                Err(_) => errno_code(&SyscallError::Invalid("bad out pointer".to_string())),
            }
        }
        Err(err) => errno_code(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::guest::memory::VecMemory;
    use crate::kernel::executor::Executor;
    use crate::kernel::network::NetworkBridge;
    use crate::vfs::Vfs;
    use std::cell::RefCell;

    fn abi_with_caps(caps: Vec<Capability>) -> HostAbi {
        let exec = Rc::new(Executor::new());
        let vfs = Rc::new(RefCell::new(Vfs::new()));
        vfs.borrow_mut().with_bypass(|fs| {
            fs.mkdirp("/home/user").unwrap();
            fs.write_file("/home/user/data.txt", b"contents").unwrap();
        });
        let clock: Rc<dyn crate::clock::Clock> = Rc::new(ManualClock::new());
        let kernel = Rc::new(Kernel::new(
            exec,
            vfs,
            clock.clone(),
            NetworkBridge::disabled(),
        ));
        kernel.set_registry(Rc::new(crate::guest::registry::ProgramRegistry::new()));
        let pid = kernel.alloc_pid();
        let host = kernel.init_process(
            pid,
            vec!["guest".to_string()],
            vec![],
            "/home/user".to_string(),
        );
        HostAbi::new(kernel, host, caps, None)
    }

    #[test]
    fn test_capability_denial() {
        let abi = abi_with_caps(Capability::tool_set());
        assert!(matches!(
            abi.read_file("data.txt"),
            Err(SyscallError::NotPermitted(_))
        ));
        assert!(matches!(abi.pipe(), Err(SyscallError::NotPermitted(_))));
    }

    #[test]
    fn test_filesystem_calls_with_capability() {
        let abi = abi_with_caps(Capability::shell_set());
        assert_eq!(abi.read_file("data.txt").unwrap(), b"contents");
        let meta = abi.stat("/home/user/data.txt").unwrap();
        assert!(meta.is_file);
    }

    #[test]
    fn test_raw_read_file_round_trip() {
        let abi = abi_with_caps(Capability::shell_set());
        let mut mem = VecMemory::new(256);
        mem.write(0, b"/home/user/data.txt").unwrap();
        let n = raw_read_file(&abi, &mut mem, 0, 19, 64, 64);
        assert_eq!(n, 8);
        assert_eq!(mem.read(64, 8).unwrap(), b"contents");
    }

    #[test]
    fn test_raw_read_file_required_size_retry() {
        let abi = abi_with_caps(Capability::shell_set());
        let mut mem = VecMemory::new(256);
        mem.write(0, b"/home/user/data.txt").unwrap();
        // Capacity 4 is too small: the call reports the required size.
        let n = raw_read_file(&abi, &mut mem, 0, 19, 64, 4);
        assert_eq!(n, 8);
        assert_eq!(mem.read(64, 4).unwrap(), vec![0, 0, 0, 0]);
        // The guest retries with enough room.
        let n = raw_read_file(&abi, &mut mem, 0, 19, 64, 8);
        assert_eq!(n, 8);
        assert_eq!(mem.read(64, 8).unwrap(), b"contents");
    }

    #[test]
    fn test_raw_read_file_missing_is_negative_errno() {
        let abi = abi_with_caps(Capability::shell_set());
        let mut mem = VecMemory::new(256);
        mem.write(0, b"/nope").unwrap();
        let n = raw_read_file(&abi, &mut mem, 0, 5, 64, 64);
        assert!(n < 0);
    }

    #[test]
    fn test_raw_write_then_raw_stat() {
        let abi = abi_with_caps(Capability::shell_set());
        let mut mem = VecMemory::new(512);
        mem.write(0, b"/home/user/new.txt").unwrap();
        mem.write(32, b"abc").unwrap();
        assert_eq!(raw_write_file(&abi, &mut mem, 0, 18, 32, 3), 0);

        let n = raw_stat(&abi, &mut mem, 0, 18, 128, 256);
        assert!(n > 0);
        let json = mem.read(128, n as u32).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["size"], 3);
        assert_eq!(value["kind"], "file");
    }

    #[test]
    fn test_check_cancel_codes() {
        let abi = abi_with_caps(Capability::tool_set());
        assert_eq!(abi.check_cancel(), 0);
        abi.host()
            .cancel_state()
            .cancel(crate::kernel::cancel::CancelReason::Timeout);
        assert_eq!(abi.check_cancel(), 1);
    }
}
