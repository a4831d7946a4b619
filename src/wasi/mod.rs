//! Per-guest WASI host
//!
//! Every guest sees the preview-1 surface plus fd-target dispatch: reads
//! and writes route to buffers, static sources, async pipe endpoints, the
//! null sink, or open VFS files. Path operations route to the VFS. Every
//! entry point checks the cancellation state first.

pub mod fd;
pub mod host;
pub mod preview1;

pub use fd::{FdTable, FdTarget, OutputBuffer, StaticSource, VfsFileHandle};
pub use host::WasiHost;

use thiserror::Error;

use crate::error::FsError;
use crate::kernel::cancel::CancelReason;

/// Errors surfaced to guests by host calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("EPIPE: broken pipe")]
    BrokenPipe,

    #[error("EBADF: bad file descriptor {0}")]
    BadFd(u32),

    #[error("EINVAL: {0}")]
    Invalid(String),

    /// Deadline fired or the driver cancelled the command
    #[error("cancelled ({0:?})")]
    Cancelled(CancelReason),

    /// Capability matrix denied the call
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Unknown tool or extension name
    #[error("not found: {0}")]
    NotFound(String),

    #[error("network: {0}")]
    Network(String),
}

pub type SyscallResult<T> = Result<T, SyscallError>;
