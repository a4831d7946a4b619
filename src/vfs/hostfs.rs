//! Host-backed provider
//!
//! Maps a real host directory under a mount prefix. Every operation
//! resolves the sub-path lexically (no `..` survives) and then verifies
//! the resolved path still lies under the declared root, so a hostile
//! path can never escape it. Writes sit behind an explicit flag.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{FsError, FsResult};
use crate::vfs::provider::VirtualProvider;
use crate::vfs::{path as vpath, DirEntry, Metadata};

pub struct HostDirProvider {
    root: PathBuf,
    writable: bool,
}

impl HostDirProvider {
    /// A read-only view of `root`.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: false,
        }
    }

    /// A writable view of `root`.
    pub fn writable(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: true,
        }
    }

    /// Resolve `sub` under the root, rejecting anything that would land
    /// outside it once symlinks on the host side are taken into account.
    fn resolve(&self, sub: &str) -> FsResult<PathBuf> {
        // Lexical normalization pops every `..`, so the joined path
        // cannot escape by segments alone.
        let parts = vpath::components(sub);
        let mut resolved = self.root.clone();
        for part in &parts {
            resolved.push(part);
        }

        // Chase host symlinks on the deepest existing prefix and make
        // sure it is still under the root.
        let mut probe = resolved.clone();
        loop {
            match probe.canonicalize() {
                Ok(canonical) => {
                    let root = self
                        .root
                        .canonicalize()
                        .map_err(|e| map_io_error(&self.root, e))?;
                    if !canonical.starts_with(&root) {
                        warn!(path = %resolved.display(), "host path escapes mount root");
                        return Err(FsError::enoent(format!(
                            "path escapes host mount: {}",
                            sub
                        )));
                    }
                    return Ok(resolved);
                }
                Err(_) => match probe.parent() {
                    Some(parent) if parent.starts_with(&self.root) => {
                        probe = parent.to_path_buf()
                    }
                    _ => return Ok(resolved),
                },
            }
        }
    }

    fn check_writable(&self, sub: &str) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::erofs(format!("host mount is read-only: {}", sub)))
        }
    }
}

fn map_io_error(path: &Path, err: std::io::Error) -> FsError {
    use std::io::ErrorKind;
    let display = path.display().to_string();
    match err.kind() {
        ErrorKind::NotFound => FsError::enoent(display),
        ErrorKind::AlreadyExists => FsError::eexist(display),
        _ => FsError::enoent(format!("{}: {}", display, err)),
    }
}

impl VirtualProvider for HostDirProvider {
    fn read(&self, sub: &str) -> FsResult<Vec<u8>> {
        let p = self.resolve(sub)?;
        if p.is_dir() {
            return Err(FsError::eisdir(sub));
        }
        std::fs::read(&p).map_err(|e| map_io_error(&p, e))
    }

    fn write(&self, sub: &str, data: &[u8]) -> FsResult<()> {
        self.check_writable(sub)?;
        let p = self.resolve(sub)?;
        if p.is_dir() {
            return Err(FsError::eisdir(sub));
        }
        std::fs::write(&p, data).map_err(|e| map_io_error(&p, e))
    }

    fn exists(&self, sub: &str) -> bool {
        self.resolve(sub).map(|p| p.exists()).unwrap_or(false)
    }

    fn stat(&self, sub: &str) -> FsResult<Metadata> {
        let p = self.resolve(sub)?;
        let meta = std::fs::metadata(&p).map_err(|e| map_io_error(&p, e))?;
        Ok(Metadata {
            size: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            is_symlink: false,
            symlink_target: None,
            mode: if meta.is_dir() { 0o755 } else { 0o644 },
            mtime: 0,
            ctime: 0,
            atime: 0,
        })
    }

    fn readdir(&self, sub: &str) -> FsResult<Vec<DirEntry>> {
        let p = self.resolve(sub)?;
        if !p.is_dir() {
            return if p.exists() {
                Err(FsError::enotdir(sub))
            } else {
                Err(FsError::enoent(sub))
            };
        }
        let mut entries = Vec::new();
        let iter = std::fs::read_dir(&p).map_err(|e| map_io_error(&p, e))?;
        for entry in iter {
            let entry = entry.map_err(|e| map_io_error(&p, e))?;
            let file_type = entry.file_type().map_err(|e| map_io_error(&p, e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
                is_symlink: file_type.is_symlink(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
