//! The VFS proper
//!
//! Owns the inode tree, the quotas, the writable-path policy, the
//! snapshot registry, and the mount table. Every operation takes an
//! absolute path and either succeeds deterministically or fails with one
//! of the closed error kinds.
//!
//! Snapshots clone the directory spine (fresh maps) but share file
//! content references; `write_file` replaces content rather than mutating
//! it, so a snapshot keeps seeing a frozen view.

use std::collections::VecDeque;
use std::rc::Rc;

use slab::Slab;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::vfs::inode::{DirNode, FileNode, Inode, InodeMeta, SymlinkNode};
use crate::vfs::path;
use crate::vfs::provider::{MountTable, VirtualProvider};
use crate::vfs::{DirEntry, Metadata};

/// Bound on symlink chases during resolution; exceeding it is ENOENT.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// Paths writable by default: home and tmp.
pub const DEFAULT_WRITABLE_PATHS: &[&str] = &["/home", "/tmp"];

/// Identifier of a snapshot in the registry.
pub type SnapshotId = usize;

/// Outcome of a path resolution: canonical components plus whether the
/// final entry exists.
struct Resolved {
    parts: Vec<String>,
    exists: bool,
}

pub struct Vfs {
    /// Tree root; invariant: always the `Dir` variant.
    root: Inode,
    /// Sum of all file content bytes
    total_bytes: u64,
    /// Files + directories (the root excluded)
    entry_count: u64,
    fs_limit: Option<u64>,
    entry_limit: Option<u64>,
    writable_paths: Vec<String>,
    /// When set, the writable-path check is bypassed (initial layout,
    /// explicit "with write access" scopes, blob import).
    bypass: bool,
    snapshots: Slab<Inode>,
    mounts: MountTable,
    now_ms: u64,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            root: Inode::Dir(DirNode::new(0)),
            total_bytes: 0,
            entry_count: 0,
            fs_limit: None,
            entry_limit: None,
            writable_paths: DEFAULT_WRITABLE_PATHS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bypass: false,
            snapshots: Slab::new(),
            mounts: MountTable::new(),
            now_ms: 0,
        }
    }

    /// Update the clock used for inode timestamps.
    pub fn set_clock(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn set_fs_limit(&mut self, limit: Option<u64>) {
        self.fs_limit = limit;
    }

    pub fn set_entry_limit(&mut self, limit: Option<u64>) {
        self.entry_limit = limit;
    }

    pub fn set_writable_paths(&mut self, paths: Vec<String>) {
        self.writable_paths = paths.iter().map(|p| path::normalize(p)).collect();
    }

    pub fn writable_paths(&self) -> &[String] {
        &self.writable_paths
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Run `f` with the writable-path policy bypassed.
    pub fn with_bypass<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let prev = self.bypass;
        self.bypass = true;
        let out = f(self);
        self.bypass = prev;
        out
    }

    /// Mount a virtual provider at `prefix`, creating the mount-point
    /// directory in the physical tree so it shows up in listings.
    pub fn mount(&mut self, prefix: &str, provider: Rc<dyn VirtualProvider>) -> FsResult<()> {
        self.mounts.mount(prefix, provider)?;
        let prefix = path::normalize(prefix);
        self.with_bypass(|fs| fs.mkdirp_physical(&prefix))?;
        Ok(())
    }

    pub fn mount_prefixes(&self) -> Vec<String> {
        self.mounts.prefixes()
    }

    // =====================================================================
    // Resolution
    // =====================================================================

    fn node_at(&self, parts: &[String]) -> Option<&Inode> {
        let mut cur = &self.root;
        for name in parts {
            let Inode::Dir(dir) = cur else {
                return None;
            };
            cur = dir.children.get(name)?;
        }
        Some(cur)
    }

    fn dir_at_mut(&mut self, parts: &[String]) -> FsResult<&mut DirNode> {
        let joined = path::join(parts);
        let mut cur = &mut self.root;
        for name in parts {
            let Inode::Dir(dir) = cur else {
                return Err(FsError::enotdir(&joined));
            };
            cur = dir
                .children
                .get_mut(name)
                .ok_or_else(|| FsError::enoent(&joined))?;
        }
        match cur {
            Inode::Dir(dir) => Ok(dir),
            _ => Err(FsError::enotdir(joined)),
        }
    }

    /// Walk `p` from the root, chasing symlinks with a bounded depth.
    ///
    /// `follow_last` selects whether a symlink as the final entry is
    /// chased (true for read/stat/write, false for readlink/unlink).
    /// With `allow_missing_last`, a missing final component resolves to
    /// its would-be location with `exists = false`.
    fn resolve(&self, p: &str, follow_last: bool, allow_missing_last: bool) -> FsResult<Resolved> {
        let mut queue: VecDeque<String> = p
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        let mut parts: Vec<String> = Vec::new();
        let mut depth = 0usize;

        while let Some(seg) = queue.pop_front() {
            match seg.as_str() {
                "." => continue,
                ".." => {
                    parts.pop();
                    continue;
                }
                _ => {}
            }

            // The node we are about to traverse out of must be a directory.
            match self.node_at(&parts) {
                Some(Inode::Dir(_)) => {}
                Some(_) => return Err(FsError::enotdir(p)),
                None => return Err(FsError::enoent(p)),
            }

            parts.push(seg);

            match self.node_at(&parts) {
                None => {
                    if queue.is_empty() && allow_missing_last {
                        return Ok(Resolved {
                            parts,
                            exists: false,
                        });
                    }
                    return Err(FsError::enoent(p));
                }
                Some(Inode::Symlink(link)) => {
                    if !queue.is_empty() || follow_last {
                        depth += 1;
                        if depth > MAX_SYMLINK_DEPTH {
                            return Err(FsError::enoent(format!(
                                "too many symbolic links: {}",
                                p
                            )));
                        }
                        let target = link.target.clone();
                        parts.pop(); // drop the link name; target replaces it
                        if target.starts_with('/') {
                            parts.clear();
                        }
                        for seg in target.split('/').rev().filter(|s| !s.is_empty()) {
                            queue.push_front(seg.to_string());
                        }
                    }
                }
                Some(_) => {}
            }
        }

        Ok(Resolved {
            parts,
            exists: true,
        })
    }

    /// Resolve the parent of `p`, yielding (parent components, final name).
    /// Every mutation goes through this, which enforces "must not be root".
    fn resolve_parent(&self, p: &str, follow_last: bool) -> FsResult<(Vec<String>, String)> {
        let resolved = self.resolve(p, follow_last, true)?;
        let mut parts = resolved.parts;
        let name = parts
            .pop()
            .ok_or_else(|| FsError::eisdir("cannot operate on the root directory"))?;
        Ok((parts, name))
    }

    fn check_writable(&self, normalized: &str) -> FsResult<()> {
        if self.bypass {
            return Ok(());
        }
        for prefix in &self.writable_paths {
            if path::starts_with(normalized, prefix) {
                return Ok(());
            }
        }
        Err(FsError::erofs(normalized))
    }

    fn check_byte_quota(&self, delta: i64) -> FsResult<()> {
        if let Some(limit) = self.fs_limit {
            let next = self.total_bytes as i64 + delta;
            if next > limit as i64 {
                debug!(total = self.total_bytes, delta, limit, "byte quota exceeded");
                return Err(FsError::enospc(format!(
                    "filesystem quota of {} bytes exceeded",
                    limit
                )));
            }
        }
        Ok(())
    }

    fn check_entry_quota(&self, added: u64) -> FsResult<()> {
        if let Some(limit) = self.entry_limit {
            if self.entry_count + added > limit {
                return Err(FsError::enospc(format!(
                    "entry quota of {} exceeded",
                    limit
                )));
            }
        }
        Ok(())
    }

    // =====================================================================
    // Read side
    // =====================================================================

    pub fn exists(&self, p: &str) -> bool {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.exists(&sub);
        }
        self.resolve(p, true, false).is_ok()
    }

    pub fn is_dir(&self, p: &str) -> bool {
        self.stat(p).map(|m| m.is_dir).unwrap_or(false)
    }

    /// Read a whole file. Directories are EISDIR; symlinks are chased.
    pub fn read_file(&self, p: &str) -> FsResult<Vec<u8>> {
        self.read_file_ref(p).map(|rc| rc.as_ref().clone())
    }

    /// Read a whole file without copying; the `Rc` is the live content
    /// reference (stable under replacement writes).
    pub fn read_file_ref(&self, p: &str) -> FsResult<Rc<Vec<u8>>> {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.read(&sub).map(Rc::new);
        }
        let resolved = self.resolve(p, true, false)?;
        match self.node_at(&resolved.parts) {
            Some(Inode::File(f)) => Ok(f.content.clone()),
            Some(Inode::Dir(_)) => Err(FsError::eisdir(p)),
            _ => Err(FsError::enoent(p)),
        }
    }

    pub fn stat(&self, p: &str) -> FsResult<Metadata> {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.stat(&sub);
        }
        let resolved = self.resolve(p, true, false)?;
        let node = self
            .node_at(&resolved.parts)
            .ok_or_else(|| FsError::enoent(p))?;
        Ok(self.metadata_of(node))
    }

    /// Like `stat` but does not chase a final symlink.
    pub fn lstat(&self, p: &str) -> FsResult<Metadata> {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.stat(&sub);
        }
        let resolved = self.resolve(p, false, false)?;
        let node = self
            .node_at(&resolved.parts)
            .ok_or_else(|| FsError::enoent(p))?;
        Ok(self.metadata_of(node))
    }

    fn metadata_of(&self, node: &Inode) -> Metadata {
        let meta = node.meta();
        Metadata {
            size: node.size(),
            is_dir: node.is_dir(),
            is_file: node.is_file(),
            is_symlink: node.is_symlink(),
            symlink_target: match node {
                Inode::Symlink(s) => Some(s.target.clone()),
                _ => None,
            },
            mode: meta.mode,
            mtime: meta.mtime,
            ctime: meta.ctime,
            atime: meta.atime,
        }
    }

    pub fn readdir(&self, p: &str) -> FsResult<Vec<DirEntry>> {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.readdir(&sub);
        }
        let resolved = self.resolve(p, true, false)?;
        match self.node_at(&resolved.parts) {
            Some(Inode::Dir(dir)) => Ok(dir
                .children
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    is_dir: node.is_dir(),
                    is_symlink: node.is_symlink(),
                })
                .collect()),
            Some(_) => Err(FsError::enotdir(p)),
            None => Err(FsError::enoent(p)),
        }
    }

    pub fn readlink(&self, p: &str) -> FsResult<String> {
        let resolved = self.resolve(p, false, false)?;
        match self.node_at(&resolved.parts) {
            Some(Inode::Symlink(link)) => Ok(link.target.clone()),
            Some(_) => Err(FsError::enoent(format!("not a symbolic link: {}", p))),
            None => Err(FsError::enoent(p)),
        }
    }

    // =====================================================================
    // Write side
    // =====================================================================

    /// Write a file, replacing any previous content. Creates the file if
    /// missing; the parent must exist.
    pub fn write_file(&mut self, p: &str, data: &[u8]) -> FsResult<()> {
        if let Some((provider, sub)) = self.mounts.find(p) {
            return provider.write(&sub, data);
        }
        let (parent, name) = self.resolve_parent(p, true)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;

        let now = self.now_ms;
        enum Prior {
            Missing,
            Dir,
            Symlink,
            File { old_len: usize, meta: InodeMeta },
        }
        let prior = {
            let dir = self.dir_at_mut(&parent)?;
            match dir.children.get(&name) {
                None => Prior::Missing,
                Some(Inode::Dir(_)) => Prior::Dir,
                Some(Inode::Symlink(_)) => Prior::Symlink,
                Some(Inode::File(old)) => Prior::File {
                    old_len: old.content.len(),
                    meta: old.meta.clone(),
                },
            }
        };
        match prior {
            Prior::Dir => Err(FsError::eisdir(p)),
            // resolve() with follow_last chased symlinks already; a
            // symlink here means the chase bound was hit elsewhere.
            Prior::Symlink => Err(FsError::enoent(p)),
            Prior::File { old_len, meta } => {
                let delta = data.len() as i64 - old_len as i64;
                self.check_byte_quota(delta)?;
                let dir = self.dir_at_mut(&parent)?;
                let mut meta = meta;
                meta.mtime = now;
                // Replacement, not mutation: snapshots holding the old
                // content reference keep seeing the old bytes.
                dir.children.insert(
                    name,
                    Inode::File(FileNode {
                        content: Rc::new(data.to_vec()),
                        meta,
                    }),
                );
                self.total_bytes = (self.total_bytes as i64 + delta) as u64;
                Ok(())
            }
            Prior::Missing => {
                self.check_byte_quota(data.len() as i64)?;
                self.check_entry_quota(1)?;
                let dir = self.dir_at_mut(&parent)?;
                dir.children.insert(name, Inode::file(data.to_vec(), now));
                self.total_bytes += data.len() as u64;
                self.entry_count += 1;
                Ok(())
            }
        }
    }

    /// Append to a file, creating it if missing.
    pub fn append_file(&mut self, p: &str, data: &[u8]) -> FsResult<()> {
        match self.read_file(p) {
            Ok(mut existing) => {
                existing.extend_from_slice(data);
                self.write_file(p, &existing)
            }
            Err(e) if e.kind == crate::error::FsErrorKind::Enoent => self.write_file(p, data),
            Err(e) => Err(e),
        }
    }

    /// Overwrite `data` at `offset`, zero-filling any gap. Backs WASI
    /// file handles, which write at a tracked offset.
    pub fn write_file_at(&mut self, p: &str, offset: u64, data: &[u8]) -> FsResult<()> {
        let mut content = match self.read_file(p) {
            Ok(c) => c,
            Err(e) if e.kind == crate::error::FsErrorKind::Enoent => Vec::new(),
            Err(e) => return Err(e),
        };
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        self.write_file(p, &content)
    }

    pub fn mkdir(&mut self, p: &str) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        let (parent, name) = self.resolve_parent(p, true)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;
        self.check_entry_quota(1)?;
        let now = self.now_ms;
        let dir = self.dir_at_mut(&parent)?;
        if dir.children.contains_key(&name) {
            return Err(FsError::eexist(p));
        }
        dir.children.insert(name, Inode::dir(now));
        self.entry_count += 1;
        Ok(())
    }

    /// Create a directory and any missing ancestors. A no-op when the
    /// directory already exists.
    pub fn mkdirp(&mut self, p: &str) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        self.check_writable(&path::normalize(p))?;
        self.mkdirp_physical(p)
    }

    fn mkdirp_physical(&mut self, p: &str) -> FsResult<()> {
        let parts = path::components(p);
        let now = self.now_ms;
        let mut cur: Vec<String> = Vec::new();
        for name in parts {
            cur.push(name.clone());
            match self.node_at(&cur) {
                Some(Inode::Dir(_)) => continue,
                Some(_) => return Err(FsError::enotdir(path::join(&cur))),
                None => {
                    self.check_entry_quota(1)?;
                    let parent = &cur[..cur.len() - 1];
                    let parent: Vec<String> = parent.to_vec();
                    let dir = self.dir_at_mut(&parent)?;
                    dir.children.insert(name, Inode::dir(now));
                    self.entry_count += 1;
                }
            }
        }
        Ok(())
    }

    /// Remove a file or symlink. Directories are EISDIR.
    pub fn unlink(&mut self, p: &str) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        let (parent, name) = self.resolve_parent(p, false)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;
        let dir = self.dir_at_mut(&parent)?;
        match dir.children.get(&name) {
            Some(Inode::Dir(_)) => Err(FsError::eisdir(p)),
            Some(Inode::File(f)) => {
                let bytes = f.content.len() as u64;
                dir.children.remove(&name);
                self.total_bytes -= bytes;
                self.entry_count -= 1;
                Ok(())
            }
            Some(Inode::Symlink(_)) => {
                dir.children.remove(&name);
                Ok(())
            }
            None => Err(FsError::enoent(p)),
        }
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, p: &str) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        let (parent, name) = self.resolve_parent(p, false)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;
        let dir = self.dir_at_mut(&parent)?;
        match dir.children.get(&name) {
            Some(Inode::Dir(d)) => {
                if !d.children.is_empty() {
                    return Err(FsError::enotempty(p));
                }
                dir.children.remove(&name);
                self.entry_count -= 1;
                Ok(())
            }
            Some(_) => Err(FsError::enotdir(p)),
            None => Err(FsError::enoent(p)),
        }
    }

    /// Remove a file, symlink, or directory subtree.
    pub fn remove_recursive(&mut self, p: &str) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        let (parent, name) = self.resolve_parent(p, false)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;
        let dir = self.dir_at_mut(&parent)?;
        match dir.children.remove(&name) {
            Some(node) => {
                let (bytes, entries) = subtree_totals(&node);
                self.total_bytes -= bytes;
                self.entry_count -= entries;
                Ok(())
            }
            None => Err(FsError::enoent(p)),
        }
    }

    /// Move a file or directory. The destination must not already exist.
    pub fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        if self.mounts.find(from).is_some() || self.mounts.find(to).is_some() {
            return Err(FsError::erofs(from));
        }
        let (from_parent, from_name) = self.resolve_parent(from, false)?;
        let (to_parent, to_name) = self.resolve_parent(to, true)?;
        self.check_writable(&path::join(&{
            let mut v = from_parent.clone();
            v.push(from_name.clone());
            v
        }))?;
        self.check_writable(&path::join(&{
            let mut v = to_parent.clone();
            v.push(to_name.clone());
            v
        }))?;

        {
            let dest_dir = self.dir_at_mut(&to_parent)?;
            if dest_dir.children.contains_key(&to_name) {
                return Err(FsError::eexist(to));
            }
        }
        let node = {
            let src_dir = self.dir_at_mut(&from_parent)?;
            src_dir
                .children
                .remove(&from_name)
                .ok_or_else(|| FsError::enoent(from))?
        };
        let dest_dir = self.dir_at_mut(&to_parent)?;
        dest_dir.children.insert(to_name, node);
        Ok(())
    }

    pub fn symlink(&mut self, target: &str, link: &str) -> FsResult<()> {
        if self.mounts.find(link).is_some() {
            return Err(FsError::erofs(link));
        }
        let (parent, name) = self.resolve_parent(link, false)?;
        let full = path::join(&{
            let mut v = parent.clone();
            v.push(name.clone());
            v
        });
        self.check_writable(&full)?;
        let now = self.now_ms;
        let dir = self.dir_at_mut(&parent)?;
        if dir.children.contains_key(&name) {
            return Err(FsError::eexist(link));
        }
        dir.children.insert(
            name,
            Inode::Symlink(SymlinkNode {
                target: target.to_string(),
                meta: InodeMeta::symlink(now),
            }),
        );
        Ok(())
    }

    pub fn chmod(&mut self, p: &str, mode: u32) -> FsResult<()> {
        if self.mounts.find(p).is_some() {
            return Err(FsError::erofs(p));
        }
        let resolved = self.resolve(p, true, false)?;
        if resolved.parts.is_empty() {
            return Err(FsError::eisdir("cannot chmod the root directory"));
        }
        self.check_writable(&path::join(&resolved.parts))?;
        let now = self.now_ms;
        let (parent, name) = {
            let mut parts = resolved.parts;
            let name = parts.pop().expect("checked non-root above");
            (parts, name)
        };
        let dir = self.dir_at_mut(&parent)?;
        let node = dir
            .children
            .get_mut(&name)
            .ok_or_else(|| FsError::enoent(p))?;
        let meta = node.meta_mut();
        meta.mode = mode & 0o7777;
        meta.ctime = now;
        Ok(())
    }

    // =====================================================================
    // Snapshots
    // =====================================================================

    /// Clone the directory spine into the registry; file bytes stay
    /// shared with the live tree.
    pub fn snapshot(&mut self) -> SnapshotId {
        self.snapshots.insert(self.root.clone())
    }

    /// Re-clone the saved root into the live root. The snapshot stays
    /// registered, so restoring the same id is idempotent.
    pub fn restore(&mut self, id: SnapshotId) -> FsResult<()> {
        let saved = self
            .snapshots
            .get(id)
            .ok_or_else(|| FsError::enoent(format!("no snapshot {}", id)))?;
        self.root = saved.clone();
        let (bytes, entries) = subtree_totals(&self.root);
        self.total_bytes = bytes;
        self.entry_count = entries;
        Ok(())
    }

    pub fn drop_snapshot(&mut self, id: SnapshotId) -> FsResult<()> {
        if self.snapshots.contains(id) {
            self.snapshots.remove(id);
            Ok(())
        } else {
            Err(FsError::enoent(format!("no snapshot {}", id)))
        }
    }

    /// An independent VFS sharing file content references with this one.
    pub fn cow_clone(&self) -> Self {
        let (bytes, entries) = subtree_totals(&self.root);
        Self {
            root: self.root.clone(),
            total_bytes: bytes,
            entry_count: entries,
            fs_limit: self.fs_limit,
            entry_limit: self.entry_limit,
            writable_paths: self.writable_paths.clone(),
            bypass: false,
            snapshots: Slab::new(),
            mounts: MountTable::new(),
            now_ms: self.now_ms,
        }
    }

    // =====================================================================
    // Walking (export support)
    // =====================================================================

    /// Depth-first listing of every physical path with its node, the root
    /// excluded, sorted parent-before-child.
    pub fn walk(&self) -> Vec<(String, &Inode)> {
        let mut out = Vec::new();
        let Inode::Dir(root) = &self.root else {
            return out;
        };
        let mut stack: Vec<(String, &DirNode)> = vec![(String::new(), root)];
        while let Some((prefix, dir)) = stack.pop() {
            for (name, node) in &dir.children {
                let p = format!("{}/{}", prefix, name);
                out.push((p.clone(), node));
                if let Inode::Dir(d) = node {
                    stack.push((p, d));
                }
            }
        }
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        out
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes and entry count of a subtree, the node itself included.
fn subtree_totals(node: &Inode) -> (u64, u64) {
    match node {
        Inode::File(f) => (f.content.len() as u64, 1),
        Inode::Symlink(_) => (0, 0),
        Inode::Dir(dir) => {
            let mut bytes = 0;
            let mut entries = 1;
            for child in dir.children.values() {
                let (b, e) = subtree_totals(child);
                bytes += b;
                entries += e;
            }
            (bytes, entries)
        }
    }
}
