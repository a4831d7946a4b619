//! Device provider
//!
//! Synthesizes the classic character devices under its mount prefix:
//! `null` (discard sink), `zero` (zero-filled source), and the two random
//! sources `random`/`urandom`. Writes to `null` succeed silently; writes
//! anywhere else are read-only failures.

use rand::RngCore;

use crate::error::{FsError, FsResult};
use crate::vfs::provider::VirtualProvider;
use crate::vfs::{DirEntry, Metadata};

/// Bytes handed out per read of an unbounded source.
const DEVICE_READ_CHUNK: usize = 65536;

const DEVICE_NAMES: &[&str] = &["null", "random", "urandom", "zero"];

pub struct DevProvider;

impl DevProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DevProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualProvider for DevProvider {
    fn read(&self, sub: &str) -> FsResult<Vec<u8>> {
        match sub {
            "" => Err(FsError::eisdir("/dev")),
            "null" => Ok(Vec::new()),
            "zero" => Ok(vec![0u8; DEVICE_READ_CHUNK]),
            "random" | "urandom" => {
                let mut buf = vec![0u8; DEVICE_READ_CHUNK];
                rand::thread_rng().fill_bytes(&mut buf);
                Ok(buf)
            }
            other => Err(FsError::enoent(format!("/dev/{}", other))),
        }
    }

    fn write(&self, sub: &str, _data: &[u8]) -> FsResult<()> {
        match sub {
            "null" => Ok(()),
            "" => Err(FsError::eisdir("/dev")),
            other if DEVICE_NAMES.contains(&other) => {
                Err(FsError::erofs(format!("/dev/{}", other)))
            }
            other => Err(FsError::erofs(format!("/dev/{}", other))),
        }
    }

    fn exists(&self, sub: &str) -> bool {
        sub.is_empty() || DEVICE_NAMES.contains(&sub)
    }

    fn stat(&self, sub: &str) -> FsResult<Metadata> {
        match sub {
            "" => Ok(Metadata::for_dir(0o755)),
            name if DEVICE_NAMES.contains(&name) => Ok(Metadata::for_file(0, 0o666)),
            other => Err(FsError::enoent(format!("/dev/{}", other))),
        }
    }

    fn readdir(&self, sub: &str) -> FsResult<Vec<DirEntry>> {
        match sub {
            "" => Ok(DEVICE_NAMES
                .iter()
                .map(|name| DirEntry {
                    name: name.to_string(),
                    is_dir: false,
                    is_symlink: false,
                })
                .collect()),
            name if DEVICE_NAMES.contains(&name) => {
                Err(FsError::enotdir(format!("/dev/{}", name)))
            }
            other => Err(FsError::enoent(format!("/dev/{}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsErrorKind;

    #[test]
    fn test_null_reads_empty() {
        let dev = DevProvider::new();
        assert!(dev.read("null").unwrap().is_empty());
    }

    #[test]
    fn test_zero_reads_zeroes() {
        let dev = DevProvider::new();
        let data = dev.read("zero").unwrap();
        assert!(!data.is_empty());
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_random_reads_bytes() {
        let dev = DevProvider::new();
        let a = dev.read("random").unwrap();
        let b = dev.read("random").unwrap();
        assert_eq!(a.len(), DEVICE_READ_CHUNK);
        // Astronomically unlikely to collide.
        assert_ne!(a, b);
    }

    #[test]
    fn test_write_null_discards() {
        let dev = DevProvider::new();
        dev.write("null", b"anything").unwrap();
    }

    #[test]
    fn test_write_zero_is_erofs() {
        let dev = DevProvider::new();
        assert_eq!(
            dev.write("zero", b"x").unwrap_err().kind,
            FsErrorKind::Erofs
        );
    }

    #[test]
    fn test_unknown_device_is_enoent() {
        let dev = DevProvider::new();
        assert_eq!(dev.read("tty0").unwrap_err().kind, FsErrorKind::Enoent);
    }

    #[test]
    fn test_readdir_lists_devices() {
        let dev = DevProvider::new();
        let names: Vec<_> = dev
            .readdir("")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["null", "random", "urandom", "zero"]);
    }
}
