//! Virtual filesystem
//!
//! An in-memory inode tree with copy-on-write snapshots, byte/entry
//! quotas, a writable-path policy, and virtual mounts that synthesize
//! subtrees (devices, process info, host directories).

pub mod devfs;
pub mod fs;
pub mod glob;
pub mod hostfs;
pub mod inode;
pub mod path;
pub mod procfs;
pub mod provider;

pub use fs::{SnapshotId, Vfs, DEFAULT_WRITABLE_PATHS, MAX_SYMLINK_DEPTH};
pub use glob::glob;
pub use inode::{DirNode, FileNode, Inode, InodeMeta, SymlinkNode};
pub use provider::{MountTable, VirtualProvider};

/// File metadata as reported by stat/lstat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
    /// Unix permission mode (octal)
    pub mode: u32,
    pub mtime: u64,
    pub ctime: u64,
    pub atime: u64,
}

impl Metadata {
    pub fn for_file(size: u64, mode: u32) -> Self {
        Self {
            size,
            is_dir: false,
            is_file: true,
            is_symlink: false,
            symlink_target: None,
            mode,
            mtime: 0,
            ctime: 0,
            atime: 0,
        }
    }

    pub fn for_dir(mode: u32) -> Self {
        Self {
            size: 0,
            is_dir: true,
            is_file: false,
            is_symlink: false,
            symlink_target: None,
            mode,
            mtime: 0,
            ctime: 0,
            atime: 0,
        }
    }
}

/// Directory entry as reported by readdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
}
