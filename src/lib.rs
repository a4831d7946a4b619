//! shellbox — an in-process sandbox
//!
//! Executes a POSIX-shaped shell and a registered toolset against a
//! fully synthetic operating environment: an in-memory filesystem with
//! copy-on-write snapshots and virtual mounts, a process kernel with
//! per-process fd tables and asynchronous pipes, a per-guest WASI-style
//! host, a capability-scoped host-call ABI, a durable state-blob
//! format, and a policy-checked network bridge.
//!
//! Scheduling is single-threaded and cooperative: one executor drives
//! every guest, and a guest parks its task only at suspension points
//! (pipe I/O against an empty or full pipe, waitpid, the command
//! mailbox, network fetch, timers). Platform concerns — the clock, the
//! HTTP fetcher, the guest bytecode engine — are explicit adapters; the
//! core never reaches for an ambient platform.
//!
//! ```no_run
//! use shellbox::{Sandbox, SandboxOptions};
//!
//! let sandbox = Sandbox::create(SandboxOptions::new()).unwrap();
//! let result = sandbox.run("echo hello | tr a-z A-Z").unwrap();
//! assert_eq!(result.stdout, "HELLO\n");
//! ```

pub mod clock;
pub mod error;
pub mod guest;
pub mod kernel;
pub mod persist;
pub mod programs;
pub mod sandbox;
pub mod shell;
pub mod vfs;
pub mod wasi;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{FsError, FsErrorKind, SandboxError, SandboxResult};
pub use guest::{Capability, GuestCtx, HostAbi, ProgramRegistry};
pub use kernel::{
    FetchRequest, FetchResponse, HttpFetcher, Kernel, NetworkPolicy, Pid, SpawnRequest,
};
pub use sandbox::{Sandbox, SandboxOptions, DEFAULT_FS_LIMIT, DEFAULT_OUTPUT_CAP};
pub use shell::{RunOutput, ShellDriver, DEFAULT_TIMEOUT_MS};
pub use vfs::{DirEntry, Metadata, Vfs};
pub use wasi::{FdTable, FdTarget, WasiHost};
