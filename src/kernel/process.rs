//! Process table
//!
//! A process is a pid, the WASI host owning its fd table and exit code,
//! a running/exited state, and the waiters parked in `waitpid`. Exited
//! processes stay in the table until the owning waitpid consumes them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::kernel::cancel::CancelState;
use crate::wasi::host::WasiHost;
use crate::wasi::{SyscallError, SyscallResult};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    Running,
    Exited(i32),
}

pub struct Process {
    pub pid: Pid,
    /// Absent only for spawn denials, which exit without instantiation.
    pub host: Option<Rc<WasiHost>>,
    pub state: ProcessState,
    waiters: Vec<Waker>,
}

/// Kernel-owned table of all processes.
pub struct ProcessTable {
    procs: RefCell<HashMap<u32, Process>>,
    next_pid: Cell<u32>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: RefCell::new(HashMap::new()),
            next_pid: Cell::new(1),
        }
    }

    /// Monotonically increasing non-zero pid.
    pub fn alloc_pid(&self) -> Pid {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        Pid(pid)
    }

    pub fn register(&self, pid: Pid, host: Rc<WasiHost>) {
        self.procs.borrow_mut().insert(
            pid.0,
            Process {
                pid,
                host: Some(host),
                state: ProcessState::Running,
                waiters: Vec::new(),
            },
        );
    }

    /// Register a process that never ran (capability denial).
    pub fn register_exited(&self, pid: Pid, code: i32) {
        self.procs.borrow_mut().insert(
            pid.0,
            Process {
                pid,
                host: None,
                state: ProcessState::Exited(code),
                waiters: Vec::new(),
            },
        );
    }

    /// Latch the exit code and drain the waiters.
    pub fn mark_exited(&self, pid: Pid, code: i32) {
        let waiters = {
            let mut procs = self.procs.borrow_mut();
            let Some(proc_entry) = procs.get_mut(&pid.0) else {
                return;
            };
            proc_entry.state = ProcessState::Exited(code);
            std::mem::take(&mut proc_entry.waiters)
        };
        trace!(%pid, code, "process exited");
        for waker in waiters {
            waker.wake();
        }
    }

    pub fn host_of(&self, pid: Pid) -> Option<Rc<WasiHost>> {
        self.procs.borrow().get(&pid.0).and_then(|p| p.host.clone())
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcessState> {
        self.procs.borrow().get(&pid.0).map(|p| p.state)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.borrow().values().map(|p| p.pid).collect()
    }

    fn poll_wait(&self, pid: Pid, waker: &Waker) -> Option<SyscallResult<i32>> {
        let mut procs = self.procs.borrow_mut();
        match procs.get_mut(&pid.0) {
            None => Some(Err(SyscallError::NotFound(format!("no such process {}", pid)))),
            Some(entry) => match entry.state {
                ProcessState::Exited(code) => {
                    procs.remove(&pid.0);
                    Some(Ok(code))
                }
                ProcessState::Running => {
                    entry.waiters.push(waker.clone());
                    None
                }
            },
        }
    }

    /// Wake every parked waiter (cancellation sweep). The waits resolve
    /// through their own cancel check.
    pub fn wake_all_waiters(&self) {
        let mut wakers = Vec::new();
        for entry in self.procs.borrow_mut().values_mut() {
            wakers.append(&mut entry.waiters);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Drop exited processes nobody will wait for (cancellation leaves
    /// them behind), keeping the pids in `keep` — the long-lived shells.
    pub fn reap_exited(&self, keep: &[Pid]) {
        self.procs.borrow_mut().retain(|_, entry| {
            matches!(entry.state, ProcessState::Running) || keep.contains(&entry.pid)
        });
    }

    /// Close every fd holding a pipe endpoint, in every process. Used by
    /// the cancellation sweep so parked pipe I/O resumes with EOF/EPIPE.
    pub fn close_all_pipe_fds(&self) {
        let hosts: Vec<Rc<WasiHost>> = self
            .procs
            .borrow()
            .values()
            .filter_map(|p| p.host.clone())
            .collect();
        for host in hosts {
            host.close_pipe_fds();
        }
    }

    /// Release every process's fds and drop the table.
    pub fn dispose(&self) {
        let mut procs = self.procs.borrow_mut();
        for entry in procs.values() {
            if let Some(host) = &entry.host {
                host.release_fds();
            }
        }
        procs.clear();
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Future resolving to a child's exit code; consumes the table entry.
/// Cancellation resolves pending waits with the cancellation code.
pub struct WaitPid {
    table: Rc<ProcessTable>,
    pid: Pid,
    cancel: CancelState,
}

impl WaitPid {
    pub fn new(table: Rc<ProcessTable>, pid: Pid, cancel: CancelState) -> Self {
        Self { table, pid, cancel }
    }
}

impl Future for WaitPid {
    type Output = SyscallResult<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A fired deadline resolves the wait with the cancellation code
        // rather than parking forever on a child that will never run on.
        if let Some(reason) = self.cancel.check() {
            return Poll::Ready(Ok(reason.exit_code()));
        }
        match self.table.poll_wait(self.pid, cx.waker()) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}
