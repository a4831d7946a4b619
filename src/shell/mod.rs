//! The shell
//!
//! Split across the host/guest boundary: the driver (host side) owns
//! the named shell table, deadlines, output caps, and env sync; the
//! guest side parses command text and walks the AST, reaching the
//! kernel only through host calls (pipe, spawn, waitpid, glob,
//! read_command, write_result). All shell state lives with the guest.

pub mod builtins;
pub mod driver;
pub mod exec;
pub mod parse;
pub mod state;

pub use driver::{RunOutput, ShellDriver, DEFAULT_SHELL, DEFAULT_TIMEOUT_MS};
pub use exec::{Flow, ShellExec};
pub use state::{Flags, ShellState};

use crate::guest::abi::CommandStatus;
use crate::guest::registry::GuestCtx;
use crate::shell::state::SharedEnv;

/// The shell guest: loop on read command → parse → execute → write
/// result, until the driver closes the mailbox.
pub async fn shell_main(ctx: GuestCtx, env: SharedEnv) -> i32 {
    let abi = ctx.abi();
    let cwd = ctx.host.cwd();
    let mut shell = ShellExec::new(ShellState::new(env, cwd), abi);

    loop {
        let command = match shell.abi.read_command().await {
            Ok(Some(command)) => command,
            Ok(None) | Err(_) => break,
        };
        shell.state.history.push(command.clone());

        let flow = if command.trim().is_empty() {
            Flow::Normal(0)
        } else {
            match parse::parse(&command) {
                Ok(ast) => shell.exec(&ast).await,
                Err(err) => {
                    let message = format!("sh: {}\n", err);
                    let _ = shell.abi.host().fd_write(2, message.as_bytes()).await;
                    Flow::Normal(2)
                }
            }
        };

        let cancelled = matches!(flow, Flow::Cancelled(_));
        let code = flow.code();
        shell.state.last_exit = code;
        // Per-command stdio overrides never outlive the command.
        shell.state.stdin_fd = 0;
        shell.state.stdout_fd = 1;
        shell.state.stderr_fd = 2;

        if shell
            .abi
            .write_result(CommandStatus {
                exit_code: code,
                cancelled,
            })
            .is_err()
        {
            break;
        }
    }
    0
}
