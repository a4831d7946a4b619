//! The sandbox facade
//!
//! Assembles the whole system — filesystem with its default layout and
//! mounts, kernel, toolset registry, shell driver — behind one handle.
//! `run` executes a command through the shell with the per-command
//! deadline; the filesystem and environment surfaces operate between
//! commands; export/import round-trip durable state.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::info;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{SandboxError, SandboxResult};
use crate::guest::registry::{ProgramFn, ProgramRegistry};
use crate::guest::Capability;
use crate::kernel::executor::Executor;
use crate::kernel::kernel::{ExtensionFn, Kernel};
use crate::kernel::network::{HttpFetcher, NetworkBridge, NetworkPolicy};
use crate::persist;
use crate::programs::register_builtin_tools;
use crate::shell::driver::{RunOutput, ShellDriver, DEFAULT_SHELL, DEFAULT_TIMEOUT_MS};
use crate::vfs::devfs::DevProvider;
use crate::vfs::hostfs::HostDirProvider;
use crate::vfs::procfs::ProcProvider;
use crate::vfs::{DirEntry, Metadata, Vfs};
use crate::wasi::host::SharedVfs;

/// Default filesystem quota: 256 MiB.
pub const DEFAULT_FS_LIMIT: u64 = 256 * 1024 * 1024;

/// Default cap on captured stdout/stderr per command: 8 MiB.
pub const DEFAULT_OUTPUT_CAP: usize = 8 * 1024 * 1024;

/// Sandbox construction options.
pub struct SandboxOptions {
    timeout_ms: u64,
    fs_limit_bytes: Option<u64>,
    entry_limit: Option<u64>,
    output_cap_bytes: Option<usize>,
    packages: Vec<String>,
    allowed_hosts: Vec<String>,
    allowed_methods: Option<Vec<String>>,
    fetcher: Option<Box<dyn HttpFetcher>>,
    clock: Option<Rc<dyn Clock>>,
    host_mounts: Vec<(String, PathBuf, bool)>,
    /// Reserved for bytecode engine adapters; the built-in toolset is
    /// registered regardless.
    module_dir: Option<PathBuf>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxOptions {
    pub fn new() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fs_limit_bytes: Some(DEFAULT_FS_LIMIT),
            entry_limit: None,
            output_cap_bytes: Some(DEFAULT_OUTPUT_CAP),
            packages: Vec::new(),
            allowed_hosts: Vec::new(),
            allowed_methods: None,
            fetcher: None,
            clock: None,
            host_mounts: Vec::new(),
            module_dir: None,
        }
    }

    /// Per-command deadline in milliseconds.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn fs_limit_bytes(mut self, limit: u64) -> Self {
        self.fs_limit_bytes = Some(limit);
        self
    }

    pub fn entry_limit(mut self, limit: u64) -> Self {
        self.entry_limit = Some(limit);
        self
    }

    pub fn output_cap_bytes(mut self, cap: usize) -> Self {
        self.output_cap_bytes = Some(cap);
        self
    }

    /// Gated tools to allow beyond the default toolset.
    pub fn packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn allowed_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_hosts = hosts;
        self
    }

    pub fn allowed_methods(mut self, methods: Vec<String>) -> Self {
        self.allowed_methods = Some(methods);
        self
    }

    /// HTTP adapter behind the network bridge.
    pub fn fetcher(mut self, fetcher: Box<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Platform clock adapter (tests use a manual clock).
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Map a host directory at `prefix`; `writable` gates writes.
    pub fn host_mount(mut self, prefix: &str, root: impl Into<PathBuf>, writable: bool) -> Self {
        self.host_mounts.push((prefix.to_string(), root.into(), writable));
        self
    }

    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = Some(dir.into());
        self
    }
}

pub struct Sandbox {
    kernel: Rc<Kernel>,
    registry: Rc<ProgramRegistry>,
    driver: ShellDriver,
    destroyed: Cell<bool>,
}

impl Sandbox {
    pub fn create(options: SandboxOptions) -> SandboxResult<Self> {
        let clock: Rc<dyn Clock> = options
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock::new()));
        let exec = Rc::new(Executor::new());

        let mut vfs = Vfs::new();
        vfs.set_clock(clock.wall_ms());
        vfs.with_bypass(|fs| -> SandboxResult<()> {
            for dir in [
                "/bin",
                "/etc",
                "/home/user",
                "/opt/packages",
                "/tmp",
                "/usr/lib/python",
            ] {
                fs.mkdirp(dir)?;
            }
            Ok(())
        })?;
        vfs.set_fs_limit(options.fs_limit_bytes);
        vfs.set_entry_limit(options.entry_limit);

        vfs.mount("/dev", Rc::new(DevProvider::new()))?;
        vfs.mount("/proc", Rc::new(ProcProvider::new(clock.clone())))?;
        for (prefix, root, writable) in &options.host_mounts {
            let provider = if *writable {
                HostDirProvider::writable(root.clone())
            } else {
                HostDirProvider::read_only(root.clone())
            };
            vfs.mount(prefix, Rc::new(provider))?;
        }

        let shared_vfs: SharedVfs = Rc::new(RefCell::new(vfs));

        let policy = match options.allowed_methods {
            Some(methods) => NetworkPolicy::new(options.allowed_hosts).with_methods(methods),
            None => NetworkPolicy::new(options.allowed_hosts),
        };
        let network = NetworkBridge::new(policy, options.fetcher);

        let kernel = Rc::new(Kernel::new(exec, shared_vfs, clock, network));
        let registry = Rc::new(ProgramRegistry::new());
        register_builtin_tools(&registry);
        for package in &options.packages {
            registry.allow(package);
        }
        kernel.set_registry(registry.clone());

        let driver = ShellDriver::new(
            kernel.clone(),
            options.timeout_ms,
            options.output_cap_bytes,
        );

        info!(
            timeout_ms = options.timeout_ms,
            module_dir = ?options.module_dir,
            "sandbox created"
        );
        Ok(Self {
            kernel,
            registry,
            driver,
            destroyed: Cell::new(false),
        })
    }

    fn check_alive(&self) -> SandboxResult<()> {
        if self.destroyed.get() {
            Err(SandboxError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Execute one command line through the default shell.
    pub fn run(&self, command: &str) -> SandboxResult<RunOutput> {
        self.check_alive()?;
        self.driver.run_command(DEFAULT_SHELL, command)
    }

    /// Execute in a named long-lived shell (separate state per name).
    pub fn run_in_shell(&self, shell: &str, command: &str) -> SandboxResult<RunOutput> {
        self.check_alive()?;
        self.driver.run_command(shell, command)
    }

    // =====================================================================
    // Filesystem surface
    // =====================================================================

    pub fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        self.check_alive()?;
        Ok(self.kernel.vfs().borrow().read_file(path)?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> SandboxResult<()> {
        self.check_alive()?;
        self.refresh_vfs_clock();
        Ok(self.kernel.vfs().borrow_mut().write_file(path, data)?)
    }

    pub fn read_dir(&self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        self.check_alive()?;
        Ok(self.kernel.vfs().borrow().readdir(path)?)
    }

    pub fn mkdir(&self, path: &str) -> SandboxResult<()> {
        self.check_alive()?;
        self.refresh_vfs_clock();
        Ok(self.kernel.vfs().borrow_mut().mkdirp(path)?)
    }

    pub fn stat(&self, path: &str) -> SandboxResult<Metadata> {
        self.check_alive()?;
        Ok(self.kernel.vfs().borrow().stat(path)?)
    }

    /// Remove a file or directory subtree.
    pub fn rm(&self, path: &str) -> SandboxResult<()> {
        self.check_alive()?;
        Ok(self.kernel.vfs().borrow_mut().remove_recursive(path)?)
    }

    fn refresh_vfs_clock(&self) {
        let now = self.kernel.clock().wall_ms();
        self.kernel.vfs().borrow_mut().set_clock(now);
    }

    // =====================================================================
    // Environment
    // =====================================================================

    pub fn get_env(&self, name: &str) -> SandboxResult<Option<String>> {
        self.check_alive()?;
        Ok(self.driver.get_env(name))
    }

    pub fn set_env(&self, name: &str, value: &str) -> SandboxResult<()> {
        self.check_alive()?;
        self.driver.set_env(name, value);
        Ok(())
    }

    // =====================================================================
    // Persistence
    // =====================================================================

    pub fn export_state(&self) -> SandboxResult<Vec<u8>> {
        self.check_alive()?;
        let env = self.driver.env_map();
        Ok(persist::export_state(&self.kernel.vfs().borrow(), &env))
    }

    pub fn import_state(&self, blob: &[u8]) -> SandboxResult<()> {
        self.check_alive()?;
        let env = persist::import_state(&mut self.kernel.vfs().borrow_mut(), blob)?;
        if !env.is_empty() {
            self.driver.replace_env(env);
        }
        Ok(())
    }

    // =====================================================================
    // Extensions & tools
    // =====================================================================

    /// Register a host extension reachable through `extension_invoke`.
    pub fn register_extension(&self, name: &str, f: ExtensionFn) -> SandboxResult<()> {
        self.check_alive()?;
        self.kernel.register_extension(name, f);
        Ok(())
    }

    /// Register an additional guest program. Gated programs only run
    /// when their name is in the packages list (or allowed here).
    pub fn register_program(
        &self,
        name: &str,
        run: ProgramFn,
        caps: Vec<Capability>,
        allowed: bool,
    ) -> SandboxResult<()> {
        self.check_alive()?;
        if allowed {
            self.registry.register(name, run, caps);
        } else {
            self.registry.register_gated(name, run, caps);
        }
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.has_tool(name)
    }

    /// Tear the sandbox down; every subsequent call fails with
    /// `Destroyed`.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        info!("sandbox destroyed");
        self.driver.destroy();
        self.kernel.dispose();
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.destroyed.get() {
            self.destroy();
        }
    }
}
