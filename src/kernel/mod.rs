//! The kernel — processes, pipes, and shared services
//!
//! Core abstractions:
//! - Process: unit of isolation, owns a WASI host and its fd table
//! - Pipe: bounded async FIFO with EOF/EPIPE close semantics
//! - Executor: single-threaded cooperative scheduler driving all guests
//! - Mailbox: single-slot sync↔async rendezvous
//! - CancelState: per-session deadline and cancel flag
//! - NetworkBridge: policy-checked synchronous fetch for guests

pub mod cancel;
pub mod executor;
#[allow(clippy::module_inception)]
pub mod kernel;
pub mod mailbox;
pub mod network;
pub mod pipe;
pub mod process;
pub mod task;
pub mod timer;

pub use cancel::{CancelReason, CancelState};
pub use executor::Executor;
pub use kernel::{
    Kernel, SpawnRequest, EXIT_GUEST_CRASHED, EXIT_NOT_FOUND, EXIT_NOT_PERMITTED,
};
pub use mailbox::Mailbox;
pub use network::{FetchRequest, FetchResponse, HttpFetcher, NetworkBridge, NetworkPolicy};
pub use pipe::{pipe, pipe_with_capacity, PipeReader, PipeWriter, EPIPE, PIPE_CAPACITY};
pub use process::{Pid, ProcessState, ProcessTable, WaitPid};
pub use task::{BoxFuture, TaskId};
pub use timer::TimerQueue;
