//! Shell driver
//!
//! The host side of the shell: owns the named table of long-lived shell
//! guests, arms the per-command deadline, caps the output buffers,
//! drives the executor until the result mailbox fills, and contains
//! guest crashes. The environment map is shared with the shell state,
//! which is how the facade's get/set-env observes mutations between
//! commands.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{SandboxError, SandboxResult};
use crate::guest::abi::ShellMailbox;
use crate::guest::registry::GuestCtx;
use crate::guest::Capability;
use crate::kernel::cancel::CancelReason;
use crate::kernel::kernel::{CatchPanic, Kernel, EXIT_GUEST_CRASHED};
use crate::kernel::process::{Pid, ProcessState};
use crate::shell::shell_main;
use crate::shell::state::SharedEnv;
use crate::wasi::fd::{FdTarget, OutputBuffer};

/// Default per-command deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// The shell used when no explicit id is given.
pub const DEFAULT_SHELL: &str = "main";

/// What one command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub truncated: bool,
}

struct ShellInstance {
    pid: Pid,
    mailbox: ShellMailbox,
    env: SharedEnv,
}

pub struct ShellDriver {
    kernel: Rc<Kernel>,
    shells: RefCell<HashMap<String, ShellInstance>>,
    timeout_ms: u64,
    output_cap: Option<usize>,
    home: String,
}

impl ShellDriver {
    pub fn new(kernel: Rc<Kernel>, timeout_ms: u64, output_cap: Option<usize>) -> Self {
        Self {
            kernel,
            shells: RefCell::new(HashMap::new()),
            timeout_ms: timeout_ms.max(1),
            output_cap,
            home: "/home/user".to_string(),
        }
    }

    fn default_env(&self) -> Vec<(String, String)> {
        vec![
            ("HOME".to_string(), self.home.clone()),
            ("PATH".to_string(), "/bin:/usr/bin".to_string()),
            ("PWD".to_string(), self.home.clone()),
            ("SHELL".to_string(), "/bin/sh".to_string()),
            ("TMPDIR".to_string(), "/tmp".to_string()),
            ("USER".to_string(), "user".to_string()),
        ]
    }

    /// Get or create the named shell instance.
    fn ensure_shell(&self, id: &str) -> (Pid, ShellMailbox, SharedEnv) {
        // A crashed instance is discarded, never reused.
        let crashed = {
            let shells = self.shells.borrow();
            shells.get(id).map(|instance| {
                matches!(
                    self.kernel.process_table().state_of(instance.pid),
                    Some(ProcessState::Exited(_)) | None
                )
            })
        };
        if crashed == Some(true) {
            warn!(shell = id, "discarding crashed shell instance");
            self.shells.borrow_mut().remove(id);
        }

        if let Some(instance) = self.shells.borrow().get(id) {
            return (instance.pid, instance.mailbox.clone(), instance.env.clone());
        }

        let env_map: HashMap<String, String> = self.default_env().into_iter().collect();
        let env: SharedEnv = Rc::new(RefCell::new(env_map));
        let pid = self.kernel.alloc_pid();
        let host = self.kernel.init_process(
            pid,
            vec!["sh".to_string()],
            self.default_env(),
            self.home.clone(),
        );
        let mailbox = ShellMailbox::new();
        let ctx = GuestCtx {
            kernel: self.kernel.clone(),
            host: host.clone(),
            caps: Capability::shell_set(),
            shell_io: Some(mailbox.clone()),
        };
        let kernel = self.kernel.clone();
        let shell_env = env.clone();
        self.kernel.executor().spawn(async move {
            let outcome = CatchPanic::new(shell_main(ctx, shell_env)).await;
            let code = match outcome {
                Ok(code) => code,
                Err(()) => EXIT_GUEST_CRASHED,
            };
            host.release_fds();
            kernel.process_table().mark_exited(pid, code);
        });
        info!(shell = id, %pid, "shell instance started");

        self.shells.borrow_mut().insert(
            id.to_string(),
            ShellInstance {
                pid,
                mailbox: mailbox.clone(),
                env: env.clone(),
            },
        );
        (pid, mailbox, env)
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        let (_, _, env) = self.ensure_shell(DEFAULT_SHELL);
        let value = env.borrow().get(name).cloned();
        value
    }

    pub fn set_env(&self, name: &str, value: &str) {
        let (_, _, env) = self.ensure_shell(DEFAULT_SHELL);
        env.borrow_mut().insert(name.to_string(), value.to_string());
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        let (_, _, env) = self.ensure_shell(DEFAULT_SHELL);
        let map = env.borrow().clone();
        map
    }

    pub fn replace_env(&self, map: HashMap<String, String>) {
        let (_, _, env) = self.ensure_shell(DEFAULT_SHELL);
        *env.borrow_mut() = map;
    }

    /// Execute one command in the named shell.
    pub fn run_command(&self, id: &str, command: &str) -> SandboxResult<RunOutput> {
        let (pid, mailbox, _env) = self.ensure_shell(id);
        let shell_host = self
            .kernel
            .process_table()
            .host_of(pid)
            .ok_or(SandboxError::GuestCrashed)?;

        // Fresh capture buffers for this command.
        let stdout = OutputBuffer::new(self.output_cap);
        let stderr = OutputBuffer::new(self.output_cap);
        shell_host.set_fd_target(0, FdTarget::Null);
        shell_host.set_fd_target(1, FdTarget::Buffer(stdout.clone()));
        shell_host.set_fd_target(2, FdTarget::Buffer(stderr.clone()));

        let clock = self.kernel.clock().clone();
        let start = clock.monotonic_ms();
        self.kernel
            .cancel_state()
            .arm(Some(start + self.timeout_ms));

        debug!(shell = id, %pid, command, "command dispatched");
        if mailbox.post_request(command.to_string()).is_err() {
            return Err(SandboxError::GuestCrashed);
        }

        let mut fired = false;
        let mut stalls_after_cancel = 0u32;
        let status = loop {
            self.kernel.executor().run_until_stalled();
            if self.kernel.timers().fire_due() > 0 {
                continue;
            }

            if let Some(response) = mailbox.take_response() {
                match response {
                    Ok(status) => break status,
                    Err(_) => return Err(SandboxError::GuestCrashed),
                }
            }

            // The shell task itself died: contain, report 139, discard.
            if matches!(
                self.kernel.process_table().state_of(pid),
                Some(ProcessState::Exited(_)) | None
            ) {
                warn!(shell = id, "shell guest crashed");
                self.shells.borrow_mut().remove(id);
                self.kernel.cancel_state().arm(None);
                return Ok(RunOutput {
                    exit_code: EXIT_GUEST_CRASHED,
                    stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
                    stderr: "shell guest crashed\n".to_string(),
                    execution_time_ms: clock.monotonic_ms() - start,
                    truncated: stdout.truncated(),
                });
            }

            if !fired {
                if let Some(reason) = self.kernel.cancel_state().check() {
                    debug!(shell = id, ?reason, "cancellation fired");
                    self.kernel.fire_cancel(reason);
                    fired = true;
                    continue;
                }
            }

            // Nothing ready: wait for the nearest timer or the deadline.
            let now = clock.monotonic_ms();
            let next_timer = self.kernel.timers().next_deadline_ms();
            let deadline = self.kernel.cancel_state().deadline_ms();
            let target = [next_timer, deadline]
                .into_iter()
                .flatten()
                .filter(|&t| t > now)
                .min();
            match target {
                Some(t) => clock.sleep_ms((t - now).min(25)),
                None => {
                    // Post-cancel drain: everything was woken; if the
                    // shell still refuses to answer, contain it.
                    stalls_after_cancel += 1;
                    if fired && stalls_after_cancel > 1000 {
                        warn!(shell = id, "shell unresponsive after cancellation");
                        self.shells.borrow_mut().remove(id);
                        self.kernel.cancel_state().arm(None);
                        return Ok(RunOutput {
                            exit_code: EXIT_GUEST_CRASHED,
                            stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
                            stderr: "shell guest crashed\n".to_string(),
                            execution_time_ms: clock.monotonic_ms() - start,
                            truncated: stdout.truncated(),
                        });
                    }
                    clock.sleep_ms(1);
                }
            }
        };

        self.kernel.cancel_state().arm(None);
        let elapsed = clock.monotonic_ms() - start;

        let mut stderr_text = String::from_utf8_lossy(&stderr.contents()).into_owned();
        let exit_code = status.exit_code;
        if status.cancelled && exit_code == CancelReason::Timeout.exit_code() {
            stderr_text.push_str("command timed out\n");
        }
        if status.cancelled {
            // Children that were cancelled mid-wait stay exited in the
            // table; sweep them, keeping the shells.
            let keep: Vec<Pid> = self.shells.borrow().values().map(|s| s.pid).collect();
            self.kernel.process_table().reap_exited(&keep);
        }

        debug!(shell = id, exit_code, elapsed, "command complete");
        Ok(RunOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
            stderr: stderr_text,
            execution_time_ms: elapsed,
            truncated: stdout.truncated() || stderr.truncated(),
        })
    }

    /// Shut every shell down and drop the table.
    pub fn destroy(&self) {
        for (_, instance) in self.shells.borrow_mut().drain() {
            instance.mailbox.close();
        }
        self.kernel.executor().run_until_stalled();
    }
}
