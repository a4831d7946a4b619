//! Virtual providers
//!
//! A provider synthesizes a subtree at a mount prefix. The VFS consults
//! the mount table before touching the physical tree, handing the
//! provider the sub-path after its prefix ("" for the mount root).

use std::rc::Rc;

use crate::error::{FsError, FsResult};
use crate::vfs::{path, DirEntry, Metadata};

/// Capability contract every synthetic mount implements.
///
/// Providers share the VFS error taxonomy: a read-only provider fails
/// writes with EROFS, a missing synthetic name is ENOENT.
pub trait VirtualProvider {
    fn read(&self, sub: &str) -> FsResult<Vec<u8>>;
    fn write(&self, sub: &str, data: &[u8]) -> FsResult<()>;
    fn exists(&self, sub: &str) -> bool;
    fn stat(&self, sub: &str) -> FsResult<Metadata>;
    fn readdir(&self, sub: &str) -> FsResult<Vec<DirEntry>>;
}

/// Mount table: absolute prefix → provider.
///
/// Prefixes may not overlap one another; the longest (only) match wins.
#[derive(Default)]
pub struct MountTable {
    mounts: Vec<(String, Rc<dyn VirtualProvider>)>,
}

impl MountTable {
    pub fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Register a provider at `prefix`. Fails with EEXIST when the prefix
    /// overlaps an existing mount (in either direction) or names the root.
    pub fn mount(&mut self, prefix: &str, provider: Rc<dyn VirtualProvider>) -> FsResult<()> {
        let prefix = path::normalize(prefix);
        if prefix == "/" {
            return Err(FsError::eexist("cannot mount over the root"));
        }
        for (existing, _) in &self.mounts {
            if path::starts_with(&prefix, existing) || path::starts_with(existing, &prefix) {
                return Err(FsError::eexist(format!(
                    "mount prefix {} overlaps {}",
                    prefix, existing
                )));
            }
        }
        self.mounts.push((prefix, provider));
        Ok(())
    }

    /// Find the provider owning `p`, returning it with the sub-path after
    /// the mount prefix.
    pub fn find(&self, p: &str) -> Option<(Rc<dyn VirtualProvider>, String)> {
        let p = path::normalize(p);
        for (prefix, provider) in &self.mounts {
            if path::starts_with(&p, prefix) {
                let sub = if p.len() > prefix.len() {
                    p[prefix.len() + 1..].to_string()
                } else {
                    String::new()
                };
                return Some((provider.clone(), sub));
            }
        }
        None
    }

    /// All mounted prefixes (normalized).
    pub fn prefixes(&self) -> Vec<String> {
        self.mounts.iter().map(|(p, _)| p.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    impl VirtualProvider for Empty {
        fn read(&self, sub: &str) -> FsResult<Vec<u8>> {
            Err(FsError::enoent(sub))
        }
        fn write(&self, sub: &str, _data: &[u8]) -> FsResult<()> {
            Err(FsError::erofs(sub))
        }
        fn exists(&self, _sub: &str) -> bool {
            false
        }
        fn stat(&self, sub: &str) -> FsResult<Metadata> {
            Err(FsError::enoent(sub))
        }
        fn readdir(&self, _sub: &str) -> FsResult<Vec<DirEntry>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_mount_and_find() {
        let mut table = MountTable::new();
        table.mount("/dev", Rc::new(Empty)).unwrap();

        let (_, sub) = table.find("/dev/null").unwrap();
        assert_eq!(sub, "null");

        let (_, sub) = table.find("/dev").unwrap();
        assert_eq!(sub, "");

        assert!(table.find("/devices").is_none());
        assert!(table.find("/home").is_none());
    }

    #[test]
    fn test_overlapping_mounts_rejected() {
        let mut table = MountTable::new();
        table.mount("/dev", Rc::new(Empty)).unwrap();
        assert!(table.mount("/dev/pts", Rc::new(Empty)).is_err());
        assert!(table.mount("/", Rc::new(Empty)).is_err());
    }

    #[test]
    fn test_nested_subpath() {
        let mut table = MountTable::new();
        table.mount("/proc", Rc::new(Empty)).unwrap();
        let (_, sub) = table.find("/proc/sys/kernel").unwrap();
        assert_eq!(sub, "sys/kernel");
    }
}
