//! Built-in toolset
//!
//! The programs a stock sandbox ships with. Each is an async guest entry
//! point doing all of its I/O through its WASI host — the same fd
//! dispatch a bytecode guest would exercise. None of them receives any
//! capability beyond pure WASI.

pub mod fs;
pub mod sys;
pub mod text;

use std::future::Future;
use std::pin::Pin;

use crate::guest::registry::{GuestCtx, ProgramRegistry};
use crate::guest::Capability;
use crate::wasi::host::OpenFlags;
use crate::wasi::SyscallError;

pub type ProgFut = Pin<Box<dyn Future<Output = i32>>>;

/// Exit code after observing EPIPE, matching 128 + SIGPIPE.
pub const EXIT_EPIPE: i32 = 141;

/// Register every built-in tool.
pub fn register_builtin_tools(registry: &ProgramRegistry) {
    let tools: &[(&str, fn(GuestCtx) -> ProgFut)] = &[
        ("basename", fs::basename),
        ("cat", text::cat),
        ("dirname", fs::dirname),
        ("echo", sys::echo),
        ("env", sys::env),
        ("false", sys::false_prog),
        ("grep", text::grep),
        ("head", text::head),
        ("ls", fs::ls),
        ("mkdir", fs::mkdir),
        ("pwd", sys::pwd),
        ("rm", fs::rm),
        ("seq", sys::seq),
        ("sleep", sys::sleep),
        ("sort", text::sort),
        ("tail", text::tail),
        ("touch", fs::touch),
        ("tr", text::tr),
        ("true", sys::true_prog),
        ("uniq", text::uniq),
        ("wc", text::wc),
        ("xxd", text::xxd),
        ("yes", sys::yes),
    ];
    for (name, run) in tools {
        registry.register(name, *run, Capability::tool_set());
    }
}

/// Shared failure path: EPIPE terminates quietly (the consumer went
/// away), cancellation carries its own code, everything else prints a
/// diagnostic and fails.
pub(crate) async fn fail(ctx: &GuestCtx, name: &str, err: SyscallError) -> i32 {
    match err {
        SyscallError::BrokenPipe => EXIT_EPIPE,
        SyscallError::Cancelled(reason) => reason.exit_code(),
        other => {
            let message = format!("{}: {}\n", name, other);
            let _ = ctx.host.fd_write(2, message.as_bytes()).await;
            1
        }
    }
}

/// Drain an fd to EOF.
pub(crate) async fn read_all(ctx: &GuestCtx, fd: u32) -> Result<Vec<u8>, SyscallError> {
    let mut out = Vec::new();
    loop {
        let chunk = ctx.host.fd_read(fd, 4096).await?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Read one named input through path_open, or stdin for `-`.
pub(crate) async fn read_input(ctx: &GuestCtx, path: &str) -> Result<Vec<u8>, SyscallError> {
    if path == "-" {
        return read_all(ctx, 0).await;
    }
    let fd = ctx.host.path_open(path, OpenFlags::READ)?;
    let data = read_all(ctx, fd).await;
    ctx.host.close_fd(fd);
    data
}

/// Concatenate the named inputs, stdin when none are given.
pub(crate) async fn gather_inputs(
    ctx: &GuestCtx,
    files: &[String],
) -> Result<Vec<u8>, SyscallError> {
    if files.is_empty() {
        return read_all(ctx, 0).await;
    }
    let mut out = Vec::new();
    for file in files {
        out.extend_from_slice(&read_input(ctx, file).await?);
    }
    Ok(out)
}

pub(crate) async fn write_stdout(ctx: &GuestCtx, data: &[u8]) -> Result<(), SyscallError> {
    ctx.host.fd_write(1, data).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::clock::{Clock, ManualClock};
    use crate::guest::registry::ProgramRegistry;
    use crate::kernel::executor::Executor;
    use crate::kernel::kernel::{Kernel, SpawnRequest};
    use crate::kernel::network::NetworkBridge;
    use crate::kernel::process::Pid;
    use crate::vfs::Vfs;
    use crate::wasi::fd::{FdTarget, OutputBuffer, StaticSource};
    use crate::wasi::host::SharedVfs;

    pub struct ToolBench {
        pub kernel: Rc<Kernel>,
        pub caller: Pid,
        pub stdout: OutputBuffer,
        pub stderr: OutputBuffer,
    }

    /// Kernel + caller process with buffer stdio, the full toolset
    /// registered.
    pub fn bench() -> ToolBench {
        bench_with_clock(Rc::new(ManualClock::new()))
    }

    pub fn bench_with_clock(clock: Rc<dyn Clock>) -> ToolBench {
        let exec = Rc::new(Executor::new());
        let vfs: SharedVfs = Rc::new(RefCell::new(Vfs::new()));
        vfs.borrow_mut().with_bypass(|fs| {
            fs.mkdirp("/home/user").unwrap();
            fs.mkdirp("/tmp").unwrap();
        });
        let kernel = Rc::new(Kernel::new(exec, vfs, clock, NetworkBridge::disabled()));
        let registry = Rc::new(ProgramRegistry::new());
        super::register_builtin_tools(&registry);
        kernel.set_registry(registry);

        let caller = kernel.alloc_pid();
        let host = kernel.init_process(
            caller,
            vec!["bench".to_string()],
            vec![],
            "/home/user".to_string(),
        );
        let stdout = OutputBuffer::new(None);
        let stderr = OutputBuffer::new(None);
        host.set_fd_target(1, FdTarget::Buffer(stdout.clone()));
        host.set_fd_target(2, FdTarget::Buffer(stderr.clone()));

        ToolBench {
            kernel,
            caller,
            stdout,
            stderr,
        }
    }

    impl ToolBench {
        /// Run one tool to completion with the given args and stdin.
        pub fn run(&self, prog: &str, args: &[&str], stdin: &[u8]) -> i32 {
            let host = self.kernel.process_table().host_of(self.caller).unwrap();
            host.set_fd_target(0, FdTarget::Static(StaticSource::new(stdin.to_vec())));

            let req = SpawnRequest {
                prog: prog.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: vec![],
                cwd: "/home/user".to_string(),
                stdin_fd: 0,
                stdout_fd: 1,
                stderr_fd: 2,
            };
            let child = self.kernel.spawn(self.caller, req).unwrap();

            let wait = self.kernel.waitpid(child);
            let out = Rc::new(std::cell::Cell::new(None));
            let out_clone = out.clone();
            self.kernel.executor().spawn(async move {
                out_clone.set(Some(wait.await.unwrap()));
            });
            loop {
                self.kernel.executor().run_until_stalled();
                if let Some(code) = out.get() {
                    return code;
                }
                // Timers may be the only pending wake source.
                if self.kernel.timers().next_deadline_ms().is_some() {
                    self.kernel.clock().sleep_ms(10);
                    self.kernel.timers().fire_due();
                } else {
                    panic!("tool deadlocked");
                }
            }
        }

        pub fn stdout_str(&self) -> String {
            String::from_utf8_lossy(&self.stdout.contents()).into_owned()
        }
    }
}
