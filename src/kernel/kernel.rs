//! The kernel
//!
//! In-process manager of processes, fd tables, and pipes — not an OS
//! kernel. It owns the process table, wires pipelines together through
//! the per-process fd tables, enforces the capability matrix at spawn,
//! and carries the shared services (clock, timers, cancellation, network
//! bridge, extensions) that host calls reach for.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::guest::registry::{GuestCtx, ProgramRegistry};
use crate::kernel::cancel::{CancelReason, CancelState};
use crate::kernel::executor::Executor;
use crate::kernel::network::{FetchRequest, FetchResponse, NetworkBridge};
use crate::kernel::process::{Pid, ProcessTable, WaitPid};
use crate::kernel::timer::TimerQueue;
use crate::vfs::glob;
use crate::wasi::fd::{FdTable, FdTarget};
use crate::wasi::host::{SharedVfs, WasiHost};
use crate::wasi::{SyscallError, SyscallResult};

/// Exit code for a registered-but-denied tool.
pub const EXIT_NOT_PERMITTED: i32 = 126;
/// Exit code for an unknown tool.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when a guest traps.
pub const EXIT_GUEST_CRASHED: i32 = 139;

/// Everything `spawn` needs to start a child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub prog: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub stdin_fd: u32,
    pub stdout_fd: u32,
    pub stderr_fd: u32,
}

/// Host-registered named extension.
pub type ExtensionFn = Box<dyn Fn(&str) -> Result<String, String>>;

pub struct Kernel {
    exec: Rc<Executor>,
    vfs: SharedVfs,
    table: Rc<ProcessTable>,
    registry: RefCell<Option<Rc<ProgramRegistry>>>,
    clock: Rc<dyn Clock>,
    cancel: CancelState,
    timers: Rc<TimerQueue>,
    network: NetworkBridge,
    extensions: RefCell<HashMap<String, ExtensionFn>>,
}

impl Kernel {
    pub fn new(
        exec: Rc<Executor>,
        vfs: SharedVfs,
        clock: Rc<dyn Clock>,
        network: NetworkBridge,
    ) -> Self {
        let cancel = CancelState::new(clock.clone());
        let timers = Rc::new(TimerQueue::new(clock.clone()));
        Self {
            exec,
            vfs,
            table: Rc::new(ProcessTable::new()),
            registry: RefCell::new(None),
            clock,
            cancel,
            timers,
            network,
            extensions: RefCell::new(HashMap::new()),
        }
    }

    pub fn set_registry(&self, registry: Rc<ProgramRegistry>) {
        *self.registry.borrow_mut() = Some(registry);
    }

    fn registry(&self) -> Rc<ProgramRegistry> {
        self.registry
            .borrow()
            .clone()
            .expect("program registry installed at sandbox creation")
    }

    pub fn executor(&self) -> &Rc<Executor> {
        &self.exec
    }

    pub fn vfs(&self) -> &SharedVfs {
        &self.vfs
    }

    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    pub fn cancel_state(&self) -> &CancelState {
        &self.cancel
    }

    pub fn timers(&self) -> &Rc<TimerQueue> {
        &self.timers
    }

    pub fn process_table(&self) -> &Rc<ProcessTable> {
        &self.table
    }

    // =====================================================================
    // Process lifecycle
    // =====================================================================

    pub fn alloc_pid(&self) -> Pid {
        self.table.alloc_pid()
    }

    /// Create and register a process with an empty fd table; the caller
    /// wires stdio afterwards. Used for the long-lived shell guest.
    pub fn init_process(
        &self,
        pid: Pid,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
    ) -> Rc<WasiHost> {
        let host = Rc::new(WasiHost::new(
            pid,
            FdTable::new(),
            args,
            env,
            cwd,
            self.vfs.clone(),
            self.clock.clone(),
            self.cancel.clone(),
        ));
        self.table.register(pid, host.clone());
        host
    }

    /// Allocate a pipe into the caller's fd table as a contiguous
    /// (read_fd, write_fd = read_fd + 1) pair.
    pub fn create_pipe(&self, caller: Pid) -> SyscallResult<(u32, u32)> {
        let host = self
            .table
            .host_of(caller)
            .ok_or(SyscallError::NotFound(format!("no such process {}", caller)))?;
        let (reader, writer) = crate::kernel::pipe::pipe();

        // The pair must be contiguous: find the lowest fd with a free
        // neighbor.
        let open = host.open_fds();
        let mut read_fd = 3;
        while open.contains(&read_fd) || open.contains(&(read_fd + 1)) {
            read_fd += 1;
        }
        host.set_fd_target(read_fd, FdTarget::PipeRead(reader));
        host.set_fd_target(read_fd + 1, FdTarget::PipeWrite(writer));
        debug!(%caller, read_fd, write_fd = read_fd + 1, "pipe created");
        Ok((read_fd, read_fd + 1))
    }

    /// Child fd table for a spawn: the caller's targets at the requested
    /// stdio fds land at child 0/1/2, endpoints shared (retained), never
    /// deep-cloned — the child must see data the parent wrote.
    pub fn build_fd_table_for_spawn(
        &self,
        caller: Pid,
        req: &SpawnRequest,
    ) -> SyscallResult<FdTable> {
        let host = self
            .table
            .host_of(caller)
            .ok_or(SyscallError::NotFound(format!("no such process {}", caller)))?;
        let mut child = FdTable::new();
        for (child_fd, parent_fd) in [
            (0u32, req.stdin_fd),
            (1u32, req.stdout_fd),
            (2u32, req.stderr_fd),
        ] {
            let target = host
                .fd_target(parent_fd)
                .ok_or(SyscallError::BadFd(parent_fd))?;
            target.retain();
            child.set(child_fd, target);
        }
        Ok(child)
    }

    /// Spawn `req.prog` as a child of `caller`. Returns the pid
    /// synchronously; the child runs concurrently. Unknown tools exit
    /// 127 and denied tools 126, both without instantiation.
    pub fn spawn(self: &Rc<Self>, caller: Pid, req: SpawnRequest) -> SyscallResult<Pid> {
        let pid = self.alloc_pid();
        let registry = self.registry();

        let Some(spec) = registry.lookup(&req.prog) else {
            warn!(prog = %req.prog, "spawn of unknown tool");
            self.table.register_exited(pid, EXIT_NOT_FOUND);
            return Ok(pid);
        };
        if !registry.is_allowed(&req.prog) {
            warn!(prog = %req.prog, "spawn of tool outside the allowed set");
            self.table.register_exited(pid, EXIT_NOT_PERMITTED);
            return Ok(pid);
        }

        let fds = self.build_fd_table_for_spawn(caller, &req)?;
        let mut args = vec![req.prog.clone()];
        args.extend(req.args.iter().cloned());
        let host = Rc::new(WasiHost::new(
            pid,
            fds,
            args,
            req.env.clone(),
            req.cwd.clone(),
            self.vfs.clone(),
            self.clock.clone(),
            self.cancel.clone(),
        ));
        self.table.register(pid, host.clone());
        debug!(%pid, prog = %req.prog, "spawned");

        let ctx = GuestCtx {
            kernel: self.clone(),
            host: host.clone(),
            caps: spec.caps.clone(),
            shell_io: None,
        };
        let kernel = self.clone();
        let prog = req.prog.clone();
        self.exec.spawn(async move {
            let outcome = CatchPanic::new((spec.run)(ctx)).await;
            let code = match outcome {
                Ok(code) => host.exit_code().unwrap_or(code),
                Err(()) => {
                    warn!(%pid, %prog, "guest trapped");
                    EXIT_GUEST_CRASHED
                }
            };
            host.release_fds();
            kernel.table.mark_exited(pid, code);
        });
        Ok(pid)
    }

    /// Suspend until `pid` exits; the exit code is consumed.
    pub fn waitpid(&self, pid: Pid) -> WaitPid {
        WaitPid::new(self.table.clone(), pid, self.cancel.clone())
    }

    pub fn close_fd(&self, caller: Pid, fd: u32) -> SyscallResult<()> {
        let host = self
            .table
            .host_of(caller)
            .ok_or(SyscallError::NotFound(format!("no such process {}", caller)))?;
        if host.close_fd(fd) {
            Ok(())
        } else {
            Err(SyscallError::BadFd(fd))
        }
    }

    pub fn get_fd_target(&self, caller: Pid, fd: u32) -> SyscallResult<FdTarget> {
        let host = self
            .table
            .host_of(caller)
            .ok_or(SyscallError::NotFound(format!("no such process {}", caller)))?;
        host.fd_target(fd).ok_or(SyscallError::BadFd(fd))
    }

    pub fn set_fd_target(&self, caller: Pid, fd: u32, target: FdTarget) -> SyscallResult<()> {
        let host = self
            .table
            .host_of(caller)
            .ok_or(SyscallError::NotFound(format!("no such process {}", caller)))?;
        host.set_fd_target(fd, target);
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry().has_tool(name)
    }

    // =====================================================================
    // Shared services
    // =====================================================================

    /// 0 = ok, 1 = timeout, 2 = cancelled.
    pub fn check_cancel(&self) -> u32 {
        match self.cancel.check() {
            None => 0,
            Some(CancelReason::Timeout) => 1,
            Some(CancelReason::Cancelled) => 2,
        }
    }

    /// Fire cancellation: latch the reason, resolve every pending
    /// waitpid, wake every sleeper, and close every pipe endpoint so
    /// parked guests resume, observe the cancel state, and unwind at
    /// what is their next I/O.
    pub fn fire_cancel(&self, reason: CancelReason) {
        self.cancel.cancel(reason);
        self.table.wake_all_waiters();
        self.timers.fire_all();
        self.table.close_all_pipe_fds();
    }

    /// Monotonic millis since sandbox creation.
    pub fn time_ms(&self) -> u64 {
        self.clock.monotonic_ms()
    }

    /// Cancellation-aware sleep.
    pub fn sleep(&self, ms: u64) -> crate::kernel::timer::SleepFuture {
        self.timers.sleep_with_cancel(ms, self.cancel.clone())
    }

    pub fn glob(&self, pattern: &str, cwd: &str) -> Vec<String> {
        glob(&self.vfs.borrow(), pattern, cwd)
    }

    pub async fn network_fetch(&self, request: FetchRequest) -> FetchResponse {
        self.network.fetch(request).await
    }

    pub fn register_extension(&self, name: &str, f: ExtensionFn) {
        self.extensions.borrow_mut().insert(name.to_string(), f);
    }

    /// Invoke a host extension; policy violations come back as `Err`
    /// strings, never host exceptions.
    pub fn invoke_extension(&self, name: &str, payload: &str) -> Result<String, String> {
        let extensions = self.extensions.borrow();
        match extensions.get(name) {
            Some(f) => f(payload),
            None => Err(format!("unknown extension: {}", name)),
        }
    }

    /// Close every pipe endpoint owned by any process and clear every
    /// table. The sandbox is unusable afterwards.
    pub fn dispose(&self) {
        debug!("kernel dispose");
        self.table.dispose();
        self.timers.clear();
        self.exec.clear();
    }
}

/// Contain a guest trap: a panic inside the program future resolves to
/// `Err(())` instead of unwinding through the executor.
pub(crate) struct CatchPanic<F> {
    inner: F,
}

impl<F> CatchPanic<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            inner.poll(cx)
        }));
        match result {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(_) => Poll::Ready(Err(())),
        }
    }
}
