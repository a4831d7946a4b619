//! Shell builtins
//!
//! Run inline in the shell guest against the current stage fds, so they
//! compose with pipelines and redirects without a spawn.

use crate::shell::exec::{Flow, ShellExec, StageIo};

const BUILTINS: &[&str] = &[
    ":", "[", "break", "cd", "continue", "echo", "exit", "export", "false", "local", "pwd",
    "read", "return", "set", "shift", "test", "true", "type", "unset",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

impl ShellExec {
    pub(crate) async fn run_builtin(&mut self, name: &str, args: &[String], io: StageIo) -> Flow {
        match name {
            ":" | "true" => Flow::Normal(0),
            "false" => Flow::Normal(1),
            "echo" => self.builtin_echo(args, io).await,
            "cd" => self.builtin_cd(args, io).await,
            "pwd" => self.builtin_pwd(io).await,
            "export" => self.builtin_export(args),
            "unset" => self.builtin_unset(args),
            "set" => self.builtin_set(args, io).await,
            "shift" => self.builtin_shift(args),
            "exit" => Flow::Exit(parse_code(args)),
            "break" => Flow::Break(parse_count(args)),
            "continue" => Flow::Continue(parse_count(args)),
            "return" => Flow::Return(parse_code(args)),
            "test" => self.builtin_test(args, false, io).await,
            "[" => self.builtin_test(args, true, io).await,
            "type" => self.builtin_type(args, io).await,
            "local" => self.builtin_local(args),
            "read" => self.builtin_read(args, io).await,
            _ => Flow::Normal(127),
        }
    }

    async fn write_to(&self, fd: u32, text: &str) {
        let _ = self.abi.host().fd_write(fd, text.as_bytes()).await;
    }

    async fn builtin_echo(&mut self, args: &[String], io: StageIo) -> Flow {
        let (newline, rest) = match args.first().map(|s| s.as_str()) {
            Some("-n") => (false, &args[1..]),
            _ => (true, args),
        };
        let mut out = rest.join(" ");
        if newline {
            out.push('\n');
        }
        match self.abi.host().fd_write(io.stdout, out.as_bytes()).await {
            Ok(_) => Flow::Normal(0),
            Err(crate::wasi::SyscallError::BrokenPipe) => Flow::Normal(0),
            Err(crate::wasi::SyscallError::Cancelled(reason)) => Flow::Cancelled(reason),
            Err(_) => Flow::Normal(1),
        }
    }

    async fn builtin_cd(&mut self, args: &[String], io: StageIo) -> Flow {
        let target = match args.first() {
            Some(path) => path.clone(),
            None => match self.state.get_env("HOME") {
                Some(home) => home,
                None => {
                    self.write_to(io.stderr, "cd: HOME not set\n").await;
                    return Flow::Normal(1);
                }
            },
        };
        let resolved = self.abi.host().resolve_path(&target);
        match self.abi.stat(&resolved) {
            Ok(meta) if meta.is_dir => {
                let old = self.state.cwd.clone();
                self.state.cwd = resolved.clone();
                self.abi.host().set_cwd(&resolved);
                self.state.set_env("OLDPWD", &old);
                self.state.set_env("PWD", &resolved);
                Flow::Normal(0)
            }
            Ok(_) => {
                self.write_to(io.stderr, &format!("cd: {}: Not a directory\n", target))
                    .await;
                Flow::Normal(1)
            }
            Err(err) => {
                self.write_to(io.stderr, &format!("cd: {}\n", err)).await;
                Flow::Normal(1)
            }
        }
    }

    async fn builtin_pwd(&mut self, io: StageIo) -> Flow {
        let out = format!("{}\n", self.state.cwd);
        self.write_to(io.stdout, &out).await;
        Flow::Normal(0)
    }

    fn builtin_export(&mut self, args: &[String]) -> Flow {
        for arg in args {
            if let Some((name, value)) = arg.split_once('=') {
                self.state.set_env(name, value);
            }
            // Exporting an existing shell variable is a no-op here:
            // every variable already reaches spawned children.
        }
        Flow::Normal(0)
    }

    fn builtin_unset(&mut self, args: &[String]) -> Flow {
        for name in args {
            self.state.unset_env(name);
        }
        Flow::Normal(0)
    }

    async fn builtin_set(&mut self, args: &[String], io: StageIo) -> Flow {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let (enable, flags) = match arg.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => match arg.strip_prefix('+') {
                    Some(rest) => (false, rest),
                    None => {
                        self.write_to(io.stderr, &format!("set: bad option {}\n", arg))
                            .await;
                        return Flow::Normal(2);
                    }
                },
            };
            if flags == "o" {
                match iter.next().map(|s| s.as_str()) {
                    Some("pipefail") => self.state.flags.pipefail = enable,
                    Some("errexit") => self.state.flags.errexit = enable,
                    Some("nounset") => self.state.flags.nounset = enable,
                    Some("xtrace") => self.state.flags.xtrace = enable,
                    other => {
                        self.write_to(
                            io.stderr,
                            &format!("set: bad option {:?}\n", other.unwrap_or("")),
                        )
                        .await;
                        return Flow::Normal(2);
                    }
                }
                continue;
            }
            for flag in flags.chars() {
                match flag {
                    'e' => self.state.flags.errexit = enable,
                    'u' => self.state.flags.nounset = enable,
                    'x' => self.state.flags.xtrace = enable,
                    other => {
                        self.write_to(io.stderr, &format!("set: bad option -{}\n", other))
                            .await;
                        return Flow::Normal(2);
                    }
                }
            }
        }
        Flow::Normal(0)
    }

    fn builtin_shift(&mut self, args: &[String]) -> Flow {
        let count = args
            .first()
            .and_then(|arg| arg.parse::<usize>().ok())
            .unwrap_or(1);
        if count > self.state.positional.len() {
            return Flow::Normal(1);
        }
        self.state.positional.drain(..count);
        Flow::Normal(0)
    }

    async fn builtin_test(&mut self, args: &[String], bracket: bool, io: StageIo) -> Flow {
        let mut args = args.to_vec();
        if bracket {
            if args.last().map(|s| s.as_str()) != Some("]") {
                self.write_to(io.stderr, "[: missing `]`\n").await;
                return Flow::Normal(2);
            }
            args.pop();
        }
        let truth = self.eval_test(&args);
        Flow::Normal(i32::from(!truth))
    }

    fn eval_test(&self, args: &[String]) -> bool {
        match args {
            [] => false,
            [one] => !one.is_empty(),
            [bang, rest @ ..] if bang == "!" => !self.eval_test(rest),
            [op, operand] => match op.as_str() {
                "-z" => operand.is_empty(),
                "-n" => !operand.is_empty(),
                "-e" => self.abi.stat(operand).is_ok(),
                "-f" => self.abi.stat(operand).map(|m| m.is_file).unwrap_or(false),
                "-d" => self.abi.stat(operand).map(|m| m.is_dir).unwrap_or(false),
                "-s" => self.abi.stat(operand).map(|m| m.size > 0).unwrap_or(false),
                _ => false,
            },
            [left, op, right] => {
                let ints = || -> Option<(i64, i64)> {
                    Some((left.parse().ok()?, right.parse().ok()?))
                };
                match op.as_str() {
                    "=" | "==" => left == right,
                    "!=" => left != right,
                    "-eq" => ints().map(|(a, b)| a == b).unwrap_or(false),
                    "-ne" => ints().map(|(a, b)| a != b).unwrap_or(false),
                    "-lt" => ints().map(|(a, b)| a < b).unwrap_or(false),
                    "-le" => ints().map(|(a, b)| a <= b).unwrap_or(false),
                    "-gt" => ints().map(|(a, b)| a > b).unwrap_or(false),
                    "-ge" => ints().map(|(a, b)| a >= b).unwrap_or(false),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    async fn builtin_type(&mut self, args: &[String], io: StageIo) -> Flow {
        let mut status = 0;
        for name in args {
            let line = if is_builtin(name) {
                format!("{} is a shell builtin\n", name)
            } else if self.state.functions.contains_key(name) {
                format!("{} is a function\n", name)
            } else if self.abi.has_tool(name).unwrap_or(false) {
                format!("{} is a tool\n", name)
            } else {
                status = 1;
                format!("{}: not found\n", name)
            };
            self.write_to(io.stdout, &line).await;
        }
        Flow::Normal(status)
    }

    fn builtin_local(&mut self, args: &[String]) -> Flow {
        for arg in args {
            match arg.split_once('=') {
                Some((name, value)) => {
                    self.state.declare_local(name);
                    self.state.set_env(name, value);
                }
                None => self.state.declare_local(arg),
            }
        }
        Flow::Normal(0)
    }

    /// `read NAME`: one line from the stage stdin into a variable.
    async fn builtin_read(&mut self, args: &[String], io: StageIo) -> Flow {
        let name = args.first().cloned().unwrap_or_else(|| "REPLY".to_string());
        let mut line = Vec::new();
        let mut saw_any = false;
        loop {
            match self.abi.host().fd_read(io.stdin, 1).await {
                Ok(byte) if byte.is_empty() => break,
                Ok(byte) => {
                    saw_any = true;
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(crate::wasi::SyscallError::Cancelled(reason)) => {
                    return Flow::Cancelled(reason)
                }
                Err(_) => break,
            }
        }
        let value = String::from_utf8_lossy(&line).into_owned();
        self.state.set_env(&name, &value);
        Flow::Normal(i32::from(!saw_any))
    }
}

/// Numeric argument with a zero default (exit/return codes).
fn parse_code(args: &[String]) -> i32 {
    args.first().and_then(|arg| arg.parse().ok()).unwrap_or(0)
}

/// Loop-nesting count with a one default (break/continue).
fn parse_count(args: &[String]) -> u32 {
    args.first()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_builtin() {
        assert!(is_builtin("cd"));
        assert!(is_builtin("["));
        assert!(!is_builtin("cat"));
    }

    #[test]
    fn test_parse_code_and_count() {
        assert_eq!(parse_code(&["5".to_string()]), 5);
        assert_eq!(parse_code(&[]), 0);
        assert_eq!(parse_count(&[]), 1);
        assert_eq!(parse_count(&["0".to_string()]), 1);
        assert_eq!(parse_count(&["3".to_string()]), 3);
    }
}
