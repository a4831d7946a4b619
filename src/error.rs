//! Error taxonomy
//!
//! Errors are a closed set of kinds. Filesystem failures carry one of the
//! POSIX-shaped kinds below; everything above the VFS wraps them in
//! `SandboxError`. The textual form always carries both the code and a
//! short message, e.g. `ENOENT: /home/user/missing`.

use thiserror::Error;

/// The closed set of filesystem error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsErrorKind {
    /// Missing path component, or symlink depth exceeded
    Enoent,
    /// Traversal through a non-directory, or readdir on a non-directory
    Enotdir,
    /// Read/write on a directory, or unlink on a directory
    Eisdir,
    /// Creating a name that already exists
    Eexist,
    /// rmdir on a non-empty directory
    Enotempty,
    /// Mutation outside the writable set
    Erofs,
    /// Byte quota or entry-count quota exceeded
    Enospc,
}

impl FsErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            FsErrorKind::Enoent => "ENOENT",
            FsErrorKind::Enotdir => "ENOTDIR",
            FsErrorKind::Eisdir => "EISDIR",
            FsErrorKind::Eexist => "EEXIST",
            FsErrorKind::Enotempty => "ENOTEMPTY",
            FsErrorKind::Erofs => "EROFS",
            FsErrorKind::Enospc => "ENOSPC",
        }
    }
}

/// A filesystem error: a kind plus a short message (usually the path).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.code())]
pub struct FsError {
    pub kind: FsErrorKind,
    pub message: String,
}

impl FsError {
    pub fn new(kind: FsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn enoent(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Enoent, path)
    }

    pub fn enotdir(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Enotdir, path)
    }

    pub fn eisdir(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Eisdir, path)
    }

    pub fn eexist(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Eexist, path)
    }

    pub fn enotempty(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Enotempty, path)
    }

    pub fn erofs(path: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Erofs, path)
    }

    pub fn enospc(message: impl Into<String>) -> Self {
        Self::new(FsErrorKind::Enospc, message)
    }
}

/// Result alias for VFS operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors visible at the sandbox facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Fs(#[from] FsError),

    /// Write on a pipe whose read side has gone away
    #[error("EPIPE: broken pipe")]
    Epipe,

    /// The per-command deadline fired
    #[error("TIMEOUT: command timed out")]
    Timeout,

    /// Execution was cancelled by the caller
    #[error("CANCELLED: command cancelled")]
    Cancelled,

    /// State blob failed validation (magic, version, or checksum)
    #[error("CorruptedState: {0}")]
    CorruptedState(String),

    /// Network policy rejected the request
    #[error("NetworkDenied: {0}")]
    NetworkDenied(String),

    /// Network transport failed
    #[error("NetworkError: {0}")]
    NetworkError(String),

    /// The sandbox has been destroyed; no further calls are valid
    #[error("Destroyed: sandbox has been destroyed")]
    Destroyed,

    /// The shell guest trapped; the instance was discarded
    #[error("GuestCrashed: shell guest crashed")]
    GuestCrashed,
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_error_display_carries_code() {
        let err = FsError::enoent("/home/user/missing");
        assert_eq!(err.to_string(), "ENOENT: /home/user/missing");
    }

    #[test]
    fn test_sandbox_error_wraps_fs() {
        let err: SandboxError = FsError::erofs("/proc/uptime").into();
        assert!(err.to_string().contains("EROFS"));
    }

    #[test]
    fn test_timeout_display() {
        assert!(SandboxError::Timeout.to_string().contains("TIMEOUT"));
    }
}
