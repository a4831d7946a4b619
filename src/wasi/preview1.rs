//! Raw WASI preview-1 surface
//!
//! The snapshot-preview1 functions as a bytecode engine adapter imports
//! them: scatter/gather iovecs, little-endian out-pointers, errno
//! returns. Everything dispatches into the per-guest `WasiHost`, so the
//! raw surface and the typed one observe identical semantics.

use crate::error::FsErrorKind;
use crate::guest::memory::GuestMemory;
use crate::wasi::host::{OpenFlags, WasiHost};
use crate::wasi::SyscallError;

pub type Errno = u16;

pub const ERRNO_SUCCESS: Errno = 0;
pub const ERRNO_BADF: Errno = 8;
pub const ERRNO_CANCELED: Errno = 11;
pub const ERRNO_EXIST: Errno = 20;
pub const ERRNO_FAULT: Errno = 21;
pub const ERRNO_INVAL: Errno = 28;
pub const ERRNO_IO: Errno = 29;
pub const ERRNO_ISDIR: Errno = 31;
pub const ERRNO_NOENT: Errno = 44;
pub const ERRNO_NOSPC: Errno = 51;
pub const ERRNO_NOTDIR: Errno = 54;
pub const ERRNO_NOTEMPTY: Errno = 55;
pub const ERRNO_PIPE: Errno = 64;
pub const ERRNO_ROFS: Errno = 69;
pub const ERRNO_NOTCAPABLE: Errno = 76;

// path_open oflags
pub const OFLAGS_CREAT: u16 = 0x1;
pub const OFLAGS_DIRECTORY: u16 = 0x2;
pub const OFLAGS_EXCL: u16 = 0x4;
pub const OFLAGS_TRUNC: u16 = 0x8;

// fd rights (subset honored here)
pub const RIGHTS_FD_READ: u64 = 0x2;
pub const RIGHTS_FD_WRITE: u64 = 0x40;

// fdflags
pub const FDFLAGS_APPEND: u16 = 0x1;

// clock ids
pub const CLOCKID_REALTIME: u32 = 0;
pub const CLOCKID_MONOTONIC: u32 = 1;

/// Map a host-call failure onto a preview-1 errno.
pub fn errno_for(err: &SyscallError) -> Errno {
    match err {
        SyscallError::Fs(fs) => match fs.kind {
            FsErrorKind::Enoent => ERRNO_NOENT,
            FsErrorKind::Enotdir => ERRNO_NOTDIR,
            FsErrorKind::Eisdir => ERRNO_ISDIR,
            FsErrorKind::Eexist => ERRNO_EXIST,
            FsErrorKind::Enotempty => ERRNO_NOTEMPTY,
            FsErrorKind::Erofs => ERRNO_ROFS,
            FsErrorKind::Enospc => ERRNO_NOSPC,
        },
        SyscallError::BrokenPipe => ERRNO_PIPE,
        SyscallError::BadFd(_) => ERRNO_BADF,
        SyscallError::Invalid(_) => ERRNO_INVAL,
        SyscallError::Cancelled(_) => ERRNO_CANCELED,
        SyscallError::NotPermitted(_) => ERRNO_NOTCAPABLE,
        SyscallError::NotFound(_) => ERRNO_NOENT,
        SyscallError::Network(_) => ERRNO_IO,
    }
}

/// One iovec: (buf_ptr, buf_len), 8 bytes in guest memory.
fn read_iovecs(
    mem: &dyn GuestMemory,
    iovs_ptr: u32,
    iovs_len: u32,
) -> Result<Vec<(u32, u32)>, Errno> {
    let mut iovecs = Vec::with_capacity(iovs_len as usize);
    for i in 0..iovs_len {
        let base = iovs_ptr + i * 8;
        let ptr = mem.read_u32(base).map_err(|_| ERRNO_FAULT)?;
        let len = mem.read_u32(base + 4).map_err(|_| ERRNO_FAULT)?;
        iovecs.push((ptr, len));
    }
    Ok(iovecs)
}

/// fd_write: gather the iovecs, push them through the host, store the
/// byte count at `nwritten_ptr`.
pub async fn fd_write(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    fd: u32,
    iovs_ptr: u32,
    iovs_len: u32,
    nwritten_ptr: u32,
) -> Errno {
    let iovecs = match read_iovecs(mem, iovs_ptr, iovs_len) {
        Ok(v) => v,
        Err(errno) => return errno,
    };
    let mut gathered = Vec::new();
    for (ptr, len) in iovecs {
        match mem.read(ptr, len) {
            Ok(bytes) => gathered.extend_from_slice(&bytes),
            Err(_) => return ERRNO_FAULT,
        }
    }
    match host.fd_write(fd, &gathered).await {
        Ok(n) => {
            if mem.write_u32(nwritten_ptr, n as u32).is_err() {
                return ERRNO_FAULT;
            }
            ERRNO_SUCCESS
        }
        Err(err) => errno_for(&err),
    }
}

/// fd_read: scatter host bytes across the iovecs, store the byte count
/// at `nread_ptr`; 0 is EOF.
pub async fn fd_read(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    fd: u32,
    iovs_ptr: u32,
    iovs_len: u32,
    nread_ptr: u32,
) -> Errno {
    let iovecs = match read_iovecs(mem, iovs_ptr, iovs_len) {
        Ok(v) => v,
        Err(errno) => return errno,
    };
    let total: u32 = iovecs.iter().map(|(_, len)| len).sum();
    let data = match host.fd_read(fd, total as usize).await {
        Ok(data) => data,
        Err(err) => return errno_for(&err),
    };
    let mut offset = 0usize;
    for (ptr, len) in iovecs {
        if offset >= data.len() {
            break;
        }
        let take = (len as usize).min(data.len() - offset);
        if mem.write(ptr, &data[offset..offset + take]).is_err() {
            return ERRNO_FAULT;
        }
        offset += take;
    }
    if mem.write_u32(nread_ptr, data.len() as u32).is_err() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

pub fn fd_close(host: &WasiHost, fd: u32) -> Errno {
    if host.close_fd(fd) {
        ERRNO_SUCCESS
    } else {
        ERRNO_BADF
    }
}

pub fn fd_seek(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    fd: u32,
    offset: i64,
    whence: u8,
    newoffset_ptr: u32,
) -> Errno {
    match host.fd_seek(fd, offset, whence) {
        Ok(pos) => {
            if mem.write_u64(newoffset_ptr, pos).is_err() {
                return ERRNO_FAULT;
            }
            ERRNO_SUCCESS
        }
        Err(err) => errno_for(&err),
    }
}

/// path_open. The dirfd is ignored (paths resolve against the guest
/// cwd); the honored subset of rights/oflags/fdflags covers read,
/// write, create, exclusive-create, truncate, and append.
#[allow(clippy::too_many_arguments)]
pub fn path_open(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
    oflags: u16,
    rights_base: u64,
    fdflags: u16,
    opened_fd_ptr: u32,
) -> Errno {
    let path = match mem.read_str(path_ptr, path_len) {
        Ok(p) => p,
        Err(_) => return ERRNO_FAULT,
    };
    if oflags & OFLAGS_DIRECTORY != 0 {
        return ERRNO_NOTDIR;
    }
    if oflags & OFLAGS_EXCL != 0 {
        let resolved = host.resolve_path(&path);
        if host.vfs().borrow().exists(&resolved) {
            return ERRNO_EXIST;
        }
    }
    let flags = OpenFlags {
        read: rights_base & RIGHTS_FD_READ != 0,
        write: rights_base & RIGHTS_FD_WRITE != 0,
        create: oflags & OFLAGS_CREAT != 0,
        truncate: oflags & OFLAGS_TRUNC != 0,
        append: fdflags & FDFLAGS_APPEND != 0,
    };
    match host.path_open(&path, flags) {
        Ok(fd) => {
            if mem.write_u32(opened_fd_ptr, fd).is_err() {
                return ERRNO_FAULT;
            }
            ERRNO_SUCCESS
        }
        Err(err) => errno_for(&err),
    }
}

pub fn path_create_directory(
    host: &WasiHost,
    mem: &dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
) -> Errno {
    let path = match mem.read_str(path_ptr, path_len) {
        Ok(p) => p,
        Err(_) => return ERRNO_FAULT,
    };
    match host.path_create_directory(&path) {
        Ok(()) => ERRNO_SUCCESS,
        Err(err) => errno_for(&err),
    }
}

pub fn path_remove_directory(
    host: &WasiHost,
    mem: &dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
) -> Errno {
    let path = match mem.read_str(path_ptr, path_len) {
        Ok(p) => p,
        Err(_) => return ERRNO_FAULT,
    };
    match host.path_remove_directory(&path) {
        Ok(()) => ERRNO_SUCCESS,
        Err(err) => errno_for(&err),
    }
}

pub fn path_unlink_file(
    host: &WasiHost,
    mem: &dyn GuestMemory,
    path_ptr: u32,
    path_len: u32,
) -> Errno {
    let path = match mem.read_str(path_ptr, path_len) {
        Ok(p) => p,
        Err(_) => return ERRNO_FAULT,
    };
    match host.path_unlink_file(&path) {
        Ok(()) => ERRNO_SUCCESS,
        Err(err) => errno_for(&err),
    }
}

/// clock_time_get: monotonic since sandbox creation, plus a wall clock.
pub fn clock_time_get(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    clock_id: u32,
    _precision: u64,
    time_ptr: u32,
) -> Errno {
    let nanos = match clock_id {
        CLOCKID_REALTIME => host.clock_wall_ns(),
        CLOCKID_MONOTONIC => host.clock_monotonic_ns(),
        _ => return ERRNO_INVAL,
    };
    if mem.write_u64(time_ptr, nanos).is_err() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

/// random_get: cryptographically strong bytes into guest memory.
pub fn random_get(host: &WasiHost, mem: &mut dyn GuestMemory, buf_ptr: u32, buf_len: u32) -> Errno {
    let bytes = host.random_bytes(buf_len as usize);
    if mem.write(buf_ptr, &bytes).is_err() {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

fn sizes_get(
    mem: &mut dyn GuestMemory,
    items: &[Vec<u8>],
    count_ptr: u32,
    size_ptr: u32,
) -> Errno {
    let total: usize = items.iter().map(|i| i.len()).sum();
    if mem.write_u32(count_ptr, items.len() as u32).is_err()
        || mem.write_u32(size_ptr, total as u32).is_err()
    {
        return ERRNO_FAULT;
    }
    ERRNO_SUCCESS
}

fn list_get(
    mem: &mut dyn GuestMemory,
    items: &[Vec<u8>],
    ptrs_ptr: u32,
    buf_ptr: u32,
) -> Errno {
    let mut cursor = buf_ptr;
    for (i, item) in items.iter().enumerate() {
        if mem.write_u32(ptrs_ptr + (i as u32) * 4, cursor).is_err()
            || mem.write(cursor, item).is_err()
        {
            return ERRNO_FAULT;
        }
        cursor += item.len() as u32;
    }
    ERRNO_SUCCESS
}

fn environ_bytes(host: &WasiHost) -> Vec<Vec<u8>> {
    host.env()
        .iter()
        .map(|(k, v)| {
            let mut entry = format!("{}={}", k, v).into_bytes();
            entry.push(0);
            entry
        })
        .collect()
}

fn args_bytes(host: &WasiHost) -> Vec<Vec<u8>> {
    host.args()
        .iter()
        .map(|arg| {
            let mut entry = arg.clone().into_bytes();
            entry.push(0);
            entry
        })
        .collect()
}

pub fn environ_sizes_get(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    count_ptr: u32,
    size_ptr: u32,
) -> Errno {
    sizes_get(mem, &environ_bytes(host), count_ptr, size_ptr)
}

pub fn environ_get(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    environ_ptr: u32,
    buf_ptr: u32,
) -> Errno {
    list_get(mem, &environ_bytes(host), environ_ptr, buf_ptr)
}

pub fn args_sizes_get(
    host: &WasiHost,
    mem: &mut dyn GuestMemory,
    count_ptr: u32,
    size_ptr: u32,
) -> Errno {
    sizes_get(mem, &args_bytes(host), count_ptr, size_ptr)
}

pub fn args_get(host: &WasiHost, mem: &mut dyn GuestMemory, argv_ptr: u32, buf_ptr: u32) -> Errno {
    list_get(mem, &args_bytes(host), argv_ptr, buf_ptr)
}

/// proc_exit: record the code and mark the host exited; the engine
/// adapter unwinds the guest stack.
pub fn proc_exit(host: &WasiHost, code: u32) {
    host.proc_exit(code as i32);
}
