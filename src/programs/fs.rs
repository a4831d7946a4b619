//! Filesystem tools: ls, mkdir, rm, touch, basename, dirname

use super::{fail, write_stdout, ProgFut};
use crate::guest::registry::GuestCtx;
use crate::wasi::host::OpenFlags;
use crate::wasi::SyscallError;

pub fn ls(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match ls_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "ls", err).await,
        }
    })
}

async fn ls_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut show_hidden = false;
    let mut paths = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-a" => show_hidden = true,
            _ => paths.push(arg),
        }
    }
    if paths.is_empty() {
        paths.push(".".to_string());
    }

    let mut out = String::new();
    let mut status = 0;
    let many = paths.len() > 1;
    for (i, path) in paths.iter().enumerate() {
        let meta = match ctx.host.path_stat(path) {
            Ok(meta) => meta,
            Err(err) => {
                let message = format!("ls: {}\n", err);
                ctx.host.fd_write(2, message.as_bytes()).await?;
                status = 1;
                continue;
            }
        };
        if !meta.is_dir {
            out.push_str(path);
            out.push('\n');
            continue;
        }
        if many {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("{}:\n", path));
        }
        for entry in ctx.host.path_readdir(path)? {
            if !show_hidden && entry.name.starts_with('.') {
                continue;
            }
            out.push_str(&entry.name);
            out.push('\n');
        }
    }
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(status)
}

pub fn mkdir(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match mkdir_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "mkdir", err).await,
        }
    })
}

async fn mkdir_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut parents = false;
    let mut paths = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-p" => parents = true,
            _ => paths.push(arg),
        }
    }
    if paths.is_empty() {
        ctx.host.fd_write(2, b"mkdir: missing operand\n").await?;
        return Ok(1);
    }
    let mut status = 0;
    for path in &paths {
        let result = if parents {
            mkdir_parents(ctx, path)
        } else {
            ctx.host.path_create_directory(path)
        };
        if let Err(err) = result {
            let message = format!("mkdir: {}\n", err);
            ctx.host.fd_write(2, message.as_bytes()).await?;
            status = 1;
        }
    }
    Ok(status)
}

/// mkdir -p over plain WASI calls: create each prefix, ignoring the
/// ones that already exist.
fn mkdir_parents(ctx: &GuestCtx, path: &str) -> Result<(), SyscallError> {
    let resolved = ctx.host.resolve_path(path);
    let mut prefix = String::new();
    for part in resolved.split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(part);
        match ctx.host.path_create_directory(&prefix) {
            Ok(()) => {}
            Err(SyscallError::Fs(e)) if e.kind == crate::error::FsErrorKind::Eexist => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn rm(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match rm_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "rm", err).await,
        }
    })
}

async fn rm_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut recursive = false;
    let mut force = false;
    let mut paths = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-r" | "-R" | "-rf" | "-fr" => {
                recursive = true;
                if arg.contains('f') {
                    force = true;
                }
            }
            "-f" => force = true,
            _ => paths.push(arg),
        }
    }
    if paths.is_empty() {
        ctx.host.fd_write(2, b"rm: missing operand\n").await?;
        return Ok(1);
    }
    let mut status = 0;
    for path in &paths {
        let result = if recursive {
            remove_tree(ctx, path)
        } else {
            ctx.host.path_unlink_file(path)
        };
        if let Err(err) = result {
            if !force {
                let message = format!("rm: {}\n", err);
                ctx.host.fd_write(2, message.as_bytes()).await?;
                status = 1;
            }
        }
    }
    Ok(status)
}

/// rm -r over plain WASI calls: unlink files depth-first, then remove
/// the emptied directories.
fn remove_tree(ctx: &GuestCtx, path: &str) -> Result<(), SyscallError> {
    let meta = ctx.host.path_stat(path)?;
    if !meta.is_dir {
        return ctx.host.path_unlink_file(path);
    }
    for entry in ctx.host.path_readdir(path)? {
        let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
        remove_tree(ctx, &child)?;
    }
    ctx.host.path_remove_directory(path)
}

pub fn touch(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match touch_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "touch", err).await,
        }
    })
}

async fn touch_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let paths: Vec<String> = ctx.host.args()[1..].to_vec();
    if paths.is_empty() {
        ctx.host.fd_write(2, b"touch: missing operand\n").await?;
        return Ok(1);
    }
    let mut status = 0;
    for path in &paths {
        if ctx.host.path_stat(path).is_ok() {
            continue;
        }
        match ctx.host.path_open(
            path,
            OpenFlags {
                read: false,
                write: true,
                create: true,
                truncate: false,
                append: false,
            },
        ) {
            Ok(fd) => {
                ctx.host.close_fd(fd);
            }
            Err(err) => {
                let message = format!("touch: {}\n", err);
                ctx.host.fd_write(2, message.as_bytes()).await?;
                status = 1;
            }
        }
    }
    Ok(status)
}

pub fn basename(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let args = &ctx.host.args()[1..];
        let Some(path) = args.first() else {
            let _ = ctx.host.fd_write(2, b"basename: missing operand\n").await;
            return 1;
        };
        let trimmed = path.trim_end_matches('/');
        let base = if trimmed.is_empty() {
            "/"
        } else {
            trimmed.rsplit('/').next().unwrap_or(trimmed)
        };
        let mut base = base.to_string();
        // Optional suffix stripping.
        if let Some(suffix) = args.get(1) {
            if base.len() > suffix.len() && base.ends_with(suffix.as_str()) {
                base.truncate(base.len() - suffix.len());
            }
        }
        match write_stdout(&ctx, format!("{}\n", base).as_bytes()).await {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "basename", err).await,
        }
    })
}

pub fn dirname(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let args = &ctx.host.args()[1..];
        let Some(path) = args.first() else {
            let _ = ctx.host.fd_write(2, b"dirname: missing operand\n").await;
            return 1;
        };
        let trimmed = path.trim_end_matches('/');
        let dir = match trimmed.rfind('/') {
            Some(0) => "/",
            Some(idx) => &trimmed[..idx],
            None => ".",
        };
        match write_stdout(&ctx, format!("{}\n", dir).as_bytes()).await {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "dirname", err).await,
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::programs::testutil::bench;

    #[test]
    fn test_ls_lists_cwd() {
        let bench = bench();
        bench
            .kernel
            .vfs()
            .borrow_mut()
            .write_file("/home/user/b.txt", b"")
            .unwrap();
        bench
            .kernel
            .vfs()
            .borrow_mut()
            .write_file("/home/user/a.txt", b"")
            .unwrap();
        assert_eq!(bench.run("ls", &[], b""), 0);
        assert_eq!(bench.stdout_str(), "a.txt\nb.txt\n");
    }

    #[test]
    fn test_ls_hides_dotfiles_without_a() {
        let bench = bench();
        bench
            .kernel
            .vfs()
            .borrow_mut()
            .write_file("/home/user/.secret", b"")
            .unwrap();
        bench.run("ls", &[], b"");
        assert_eq!(bench.stdout_str(), "");

        let bench2 = bench_with_dotfile();
        bench2.run("ls", &["-a"], b"");
        assert!(bench2.stdout_str().contains(".secret"));
    }

    fn bench_with_dotfile() -> crate::programs::testutil::ToolBench {
        let bench = bench();
        bench
            .kernel
            .vfs()
            .borrow_mut()
            .write_file("/home/user/.secret", b"")
            .unwrap();
        bench
    }

    #[test]
    fn test_mkdir_and_rm() {
        let bench = bench();
        assert_eq!(bench.run("mkdir", &["d"], b""), 0);
        assert!(bench.kernel.vfs().borrow().is_dir("/home/user/d"));

        assert_eq!(bench.run("rm", &["-r", "d"], b""), 0);
        assert!(!bench.kernel.vfs().borrow().exists("/home/user/d"));
    }

    #[test]
    fn test_mkdir_p_nested() {
        let bench = bench();
        assert_eq!(bench.run("mkdir", &["-p", "a/b/c"], b""), 0);
        assert!(bench.kernel.vfs().borrow().is_dir("/home/user/a/b/c"));
    }

    #[test]
    fn test_rm_missing_fails_unless_forced() {
        let bench = bench();
        assert_eq!(bench.run("rm", &["nope"], b""), 1);
        assert_eq!(bench.run("rm", &["-f", "nope"], b""), 0);
    }

    #[test]
    fn test_touch_creates_empty() {
        let bench = bench();
        assert_eq!(bench.run("touch", &["new.txt"], b""), 0);
        assert_eq!(
            bench.kernel.vfs().borrow().read_file("/home/user/new.txt").unwrap(),
            b""
        );
    }

    #[test]
    fn test_basename_dirname() {
        let bench1 = bench();
        bench1.run("basename", &["/a/b/c.txt"], b"");
        assert_eq!(bench1.stdout_str(), "c.txt\n");

        let bench2 = bench();
        bench2.run("dirname", &["/a/b/c.txt"], b"");
        assert_eq!(bench2.stdout_str(), "/a/b\n");

        let bench3 = bench();
        bench3.run("basename", &["/a/b/c.txt", ".txt"], b"");
        assert_eq!(bench3.stdout_str(), "c\n");
    }
}
