//! Task types
//!
//! A task is one cooperative strand of execution: a guest program, the
//! shell loop, or a kernel helper. Tasks are futures driven by the
//! sandbox's single-threaded executor and park themselves only at
//! suspension points (pipe I/O, waitpid, timers, the command mailbox).

use std::future::Future;
use std::pin::Pin;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// A boxed future representing a spawned task
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;
