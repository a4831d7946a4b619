//! Shell execution
//!
//! Walks the AST against the kernel host calls: pipelines map to
//! pipe/spawn/waitpid, builtins run inline on the stage fds, compound
//! commands recurse with the shell's stdio overridden. Control flow is
//! an explicit sum type each construct inspects and either consumes or
//! re-emits.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::guest::abi::HostAbi;
use crate::kernel::cancel::CancelReason;
use crate::kernel::kernel::SpawnRequest;
use crate::shell::parse::{
    self, AndOrOp, Command, Quote, Redirect, RedirKind, Seg, SimpleCmd, Word,
};
use crate::shell::state::{ShellState, MAX_SUBST_DEPTH};
use crate::vfs::glob::is_glob_pattern;
use crate::wasi::fd::{FdTarget, OutputBuffer};
use crate::wasi::host::OpenFlags;

/// Result of one statement. Compound constructs consume what they own
/// (loops eat Break/Continue, functions eat Return) and re-emit the
/// rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal(i32),
    Break(u32),
    Continue(u32),
    Return(i32),
    Exit(i32),
    Cancelled(CancelReason),
}

impl Flow {
    pub fn code(&self) -> i32 {
        match self {
            Flow::Normal(code) | Flow::Return(code) | Flow::Exit(code) => *code,
            Flow::Break(_) | Flow::Continue(_) => 0,
            Flow::Cancelled(reason) => reason.exit_code(),
        }
    }
}

/// The stdio triple a command runs against.
#[derive(Debug, Clone, Copy)]
pub struct StageIo {
    pub stdin: u32,
    pub stdout: u32,
    pub stderr: u32,
}

enum SimpleOutcome {
    Done(Flow),
    /// External stage spawned but not yet waited (pipelines).
    Spawned(u32),
}

type LocalFut<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

pub struct ShellExec {
    pub state: ShellState,
    pub abi: HostAbi,
    /// Non-zero inside `if`/loop conditions and and-or operands, where
    /// errexit does not fire.
    suppress_errexit: u32,
}

impl ShellExec {
    pub fn new(state: ShellState, abi: HostAbi) -> Self {
        Self {
            state,
            abi,
            suppress_errexit: 0,
        }
    }

    fn io(&self) -> StageIo {
        StageIo {
            stdin: self.state.stdin_fd,
            stdout: self.state.stdout_fd,
            stderr: self.state.stderr_fd,
        }
    }

    fn check_cancel(&self) -> Option<Flow> {
        match self.abi.check_cancel() {
            0 => None,
            1 => Some(Flow::Cancelled(CancelReason::Timeout)),
            _ => Some(Flow::Cancelled(CancelReason::Cancelled)),
        }
    }

    async fn write_err(&self, message: &str) {
        let _ = self
            .abi
            .host()
            .fd_write(self.state.stderr_fd, message.as_bytes())
            .await;
    }

    fn errexit_check(&self, flow: Flow) -> Flow {
        if self.state.flags.errexit && self.suppress_errexit == 0 {
            if let Flow::Normal(code) = flow {
                if code != 0 {
                    return Flow::Exit(code);
                }
            }
        }
        flow
    }

    /// Execute one command. Boxed for async recursion.
    pub fn exec<'a>(&'a mut self, cmd: &'a Command) -> LocalFut<'a, Flow> {
        Box::pin(async move {
            match cmd {
                Command::Simple(simple) => {
                    let io = self.io();
                    let flow = match self.exec_simple(simple, io, false).await {
                        SimpleOutcome::Done(flow) => flow,
                        SimpleOutcome::Spawned(_) => unreachable!("wait requested"),
                    };
                    if let Flow::Normal(code) = flow {
                        self.state.last_exit = code;
                    }
                    self.errexit_check(flow)
                }
                Command::Pipeline { stages, negate } => {
                    let flow = self.exec_pipeline(stages, *negate).await;
                    if let Flow::Normal(code) = flow {
                        self.state.last_exit = code;
                    }
                    if *negate {
                        flow
                    } else {
                        self.errexit_check(flow)
                    }
                }
                Command::AndOr { op, left, right } => {
                    self.suppress_errexit += 1;
                    let left_flow = self.exec(left).await;
                    let left_code = match left_flow {
                        Flow::Normal(code) => code,
                        other => {
                            self.suppress_errexit -= 1;
                            return other;
                        }
                    };
                    let take_right = match op {
                        AndOrOp::And => left_code == 0,
                        AndOrOp::Or => left_code != 0,
                    };
                    let flow = if take_right {
                        self.exec(right).await
                    } else {
                        Flow::Normal(left_code)
                    };
                    self.suppress_errexit -= 1;
                    flow
                }
                Command::Seq(commands) => {
                    let mut last = 0;
                    for command in commands {
                        if let Some(flow) = self.check_cancel() {
                            return flow;
                        }
                        match self.exec(command).await {
                            Flow::Normal(code) => last = code,
                            other => return other,
                        }
                    }
                    Flow::Normal(last)
                }
                Command::If {
                    cond,
                    then_body,
                    elifs,
                    else_body,
                } => {
                    self.suppress_errexit += 1;
                    let cond_flow = self.exec(cond).await;
                    self.suppress_errexit -= 1;
                    let cond_code = match cond_flow {
                        Flow::Normal(code) => code,
                        other => return other,
                    };
                    if cond_code == 0 {
                        return self.exec(then_body).await;
                    }
                    for (elif_cond, elif_body) in elifs {
                        self.suppress_errexit += 1;
                        let flow = self.exec(elif_cond).await;
                        self.suppress_errexit -= 1;
                        match flow {
                            Flow::Normal(0) => return self.exec(elif_body).await,
                            Flow::Normal(_) => continue,
                            other => return other,
                        }
                    }
                    match else_body {
                        Some(body) => self.exec(body).await,
                        None => Flow::Normal(0),
                    }
                }
                Command::Loop { until, cond, body } => {
                    let mut last = 0;
                    loop {
                        if let Some(flow) = self.check_cancel() {
                            return flow;
                        }
                        self.suppress_errexit += 1;
                        let cond_flow = self.exec(cond).await;
                        self.suppress_errexit -= 1;
                        let cond_code = match cond_flow {
                            Flow::Normal(code) => code,
                            other => return other,
                        };
                        let run_body = (cond_code == 0) != *until;
                        if !run_body {
                            break;
                        }
                        match self.exec(body).await {
                            Flow::Normal(code) => last = code,
                            Flow::Break(1) => break,
                            Flow::Break(n) => return Flow::Break(n - 1),
                            Flow::Continue(1) => continue,
                            Flow::Continue(n) => return Flow::Continue(n - 1),
                            other => return other,
                        }
                    }
                    Flow::Normal(last)
                }
                Command::For { var, items, body } => {
                    let fields = match items {
                        Some(words) => {
                            let mut fields = Vec::new();
                            for word in words {
                                match self.expand_word(word).await {
                                    Ok(expanded) => fields.extend(expanded),
                                    Err(flow) => return flow,
                                }
                            }
                            fields
                        }
                        None => self.state.positional.clone(),
                    };
                    let mut last = 0;
                    'outer: for value in fields {
                        if let Some(flow) = self.check_cancel() {
                            return flow;
                        }
                        self.state.set_env(var, &value);
                        match self.exec(body).await {
                            Flow::Normal(code) => last = code,
                            Flow::Break(1) => break 'outer,
                            Flow::Break(n) => return Flow::Break(n - 1),
                            Flow::Continue(1) => continue,
                            Flow::Continue(n) => return Flow::Continue(n - 1),
                            other => return other,
                        }
                    }
                    Flow::Normal(last)
                }
                Command::Subshell { body, redirects } => {
                    let snapshot = self.state.snapshot();
                    let io = self.io();
                    let (io, temp_fds) = match self.apply_redirects(redirects, io).await {
                        Ok(applied) => applied,
                        Err(flow) => return flow,
                    };
                    let flow = self.exec_with_io(body, io).await;
                    for fd in temp_fds {
                        let _ = self.abi.close_fd(fd);
                    }
                    self.state.restore(snapshot);
                    // cd inside the subshell must not leak out.
                    self.abi.host().set_cwd(&self.state.cwd);
                    // Nothing escapes a subshell but its exit code.
                    match flow {
                        Flow::Cancelled(reason) => Flow::Cancelled(reason),
                        other => Flow::Normal(other.code()),
                    }
                }
                Command::Group { body, redirects } => {
                    let io = self.io();
                    let (io, temp_fds) = match self.apply_redirects(redirects, io).await {
                        Ok(applied) => applied,
                        Err(flow) => return flow,
                    };
                    let flow = self.exec_with_io(body, io).await;
                    for fd in temp_fds {
                        let _ = self.abi.close_fd(fd);
                    }
                    flow
                }
                Command::FuncDef { name, body } => {
                    self.state.functions.insert(name.clone(), body.clone());
                    Flow::Normal(0)
                }
            }
        })
    }

    /// Execute `cmd` with the shell's stdio overridden for the subtree.
    async fn exec_with_io(&mut self, cmd: &Command, io: StageIo) -> Flow {
        let saved = self.io();
        self.state.stdin_fd = io.stdin;
        self.state.stdout_fd = io.stdout;
        self.state.stderr_fd = io.stderr;
        let flow = self.exec(cmd).await;
        self.state.stdin_fd = saved.stdin;
        self.state.stdout_fd = saved.stdout;
        self.state.stderr_fd = saved.stderr;
        flow
    }

    // =====================================================================
    // Pipelines
    // =====================================================================

    async fn exec_pipeline(&mut self, stages: &[Command], negate: bool) -> Flow {
        if let Some(flow) = self.check_cancel() {
            return flow;
        }
        if stages.len() == 1 {
            let flow = self.exec(&stages[0]).await;
            return match flow {
                Flow::Normal(code) if negate => Flow::Normal(i32::from(code == 0)),
                other => other,
            };
        }

        let n = stages.len();
        let mut pipes = Vec::with_capacity(n - 1);
        for _ in 0..n - 1 {
            match self.abi.pipe() {
                Ok(pair) => pipes.push(pair),
                Err(err) => {
                    self.write_err(&format!("sh: {}\n", err)).await;
                    return Flow::Normal(1);
                }
            }
        }
        let base = self.io();
        let mut codes = vec![0i32; n];
        let mut pids: Vec<Option<u32>> = vec![None; n];
        let mut open_fds: Vec<u32> = pipes.iter().flat_map(|&(r, w)| [r, w]).collect();

        for (i, stage) in stages.iter().enumerate() {
            if let Some(flow) = self.check_cancel() {
                self.close_fds(&mut open_fds);
                return flow;
            }
            // The shell must not keep pipe fds open once a stage owns
            // them: the upstream write handle closes before this stage
            // runs (so inline consumers can reach EOF), the read handle
            // right after (so EPIPE reaches producers when a spawned
            // consumer exits early).
            if i > 0 {
                self.close_one(pipes[i - 1].1, &mut open_fds);
            }
            let io = StageIo {
                stdin: if i == 0 { base.stdin } else { pipes[i - 1].0 },
                stdout: if i == n - 1 { base.stdout } else { pipes[i].1 },
                stderr: base.stderr,
            };
            match stage {
                Command::Simple(simple) => {
                    match self.exec_simple(simple, io, true).await {
                        SimpleOutcome::Spawned(pid) => pids[i] = Some(pid),
                        SimpleOutcome::Done(Flow::Cancelled(reason)) => {
                            self.close_fds(&mut open_fds);
                            return Flow::Cancelled(reason);
                        }
                        SimpleOutcome::Done(flow) => codes[i] = flow.code(),
                    }
                }
                compound => {
                    // Compound stages run inline with overridden stdio;
                    // their control flow does not escape the pipeline.
                    match self.exec_with_io(compound, io).await {
                        Flow::Cancelled(reason) => {
                            self.close_fds(&mut open_fds);
                            return Flow::Cancelled(reason);
                        }
                        flow => codes[i] = flow.code(),
                    }
                }
            }
            if i > 0 {
                self.close_one(pipes[i - 1].0, &mut open_fds);
            }
        }
        self.close_fds(&mut open_fds);

        for (i, pid) in pids.iter().enumerate() {
            if let Some(pid) = pid {
                match self.abi.waitpid(*pid).await {
                    Ok(code) => codes[i] = code,
                    Err(err) => {
                        self.write_err(&format!("sh: wait: {}\n", err)).await;
                        codes[i] = 1;
                    }
                }
            }
        }
        if let Some(flow) = self.check_cancel() {
            return flow;
        }

        let mut code = *codes.last().unwrap_or(&0);
        if self.state.flags.pipefail {
            if let Some(bad) = codes.iter().rev().find(|&&c| c != 0) {
                code = *bad;
            }
        }
        debug!(?codes, code, "pipeline complete");
        if negate {
            code = i32::from(code == 0);
        }
        Flow::Normal(code)
    }

    fn close_one(&mut self, fd: u32, open_fds: &mut Vec<u32>) {
        if let Some(pos) = open_fds.iter().position(|&open| open == fd) {
            open_fds.swap_remove(pos);
            let _ = self.abi.close_fd(fd);
        }
    }

    fn close_fds(&mut self, open_fds: &mut Vec<u32>) {
        for fd in std::mem::take(open_fds) {
            let _ = self.abi.close_fd(fd);
        }
    }

    // =====================================================================
    // Simple commands
    // =====================================================================

    /// Run a simple command. With `spawn_only`, an external command is
    /// spawned and returned as `Spawned(pid)` without waiting (pipeline
    /// stages); everything else completes inline.
    async fn exec_simple(
        &mut self,
        simple: &SimpleCmd,
        io: StageIo,
        spawn_only: bool,
    ) -> SimpleOutcome {
        if let Some(flow) = self.check_cancel() {
            return SimpleOutcome::Done(flow);
        }

        let mut assignments = Vec::new();
        for (name, word) in &simple.assignments {
            match self.expand_word_joined(word).await {
                Ok(value) => assignments.push((name.clone(), value)),
                Err(flow) => return SimpleOutcome::Done(flow),
            }
        }

        let mut argv: Vec<String> = Vec::new();
        for word in &simple.words {
            match self.expand_word(word).await {
                Ok(fields) => argv.extend(fields),
                Err(flow) => return SimpleOutcome::Done(flow),
            }
        }

        if argv.is_empty() && simple.redirects.is_empty() {
            for (name, value) in assignments {
                self.state.set_env(&name, &value);
            }
            return SimpleOutcome::Done(Flow::Normal(0));
        }

        if self.state.flags.xtrace && !argv.is_empty() {
            self.write_err(&format!("+ {}\n", argv.join(" "))).await;
        }

        let (io, temp_fds) = match self.apply_redirects(&simple.redirects, io).await {
            Ok(applied) => applied,
            Err(flow) => return SimpleOutcome::Done(flow),
        };

        let outcome = if argv.is_empty() {
            // Redirects without a command still create/truncate.
            for (name, value) in assignments {
                self.state.set_env(&name, &value);
            }
            SimpleOutcome::Done(Flow::Normal(0))
        } else {
            let name = argv[0].clone();
            let args: Vec<String> = argv[1..].to_vec();
            if let Some(func) = self.state.functions.get(&name).cloned() {
                for (var, value) in &assignments {
                    self.state.set_env(var, value);
                }
                SimpleOutcome::Done(self.call_function(&func, &args, io).await)
            } else if crate::shell::builtins::is_builtin(&name) {
                for (var, value) in &assignments {
                    self.state.set_env(var, value);
                }
                SimpleOutcome::Done(self.run_builtin(&name, &args, io).await)
            } else {
                self.run_external(&name, &args, &assignments, io, spawn_only)
                    .await
            }
        };

        // Redirect fds were duplicated into any child; the shell's
        // copies close here so EOF propagates.
        for fd in temp_fds {
            let _ = self.abi.close_fd(fd);
        }
        outcome
    }

    async fn run_external(
        &mut self,
        name: &str,
        args: &[String],
        assignments: &[(String, String)],
        io: StageIo,
        spawn_only: bool,
    ) -> SimpleOutcome {
        let mut env: Vec<(String, String)> = self
            .state
            .env
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        // Assignment prefixes override the inherited values.
        for (name, value) in assignments {
            env.retain(|(k, _)| k != name);
            env.push((name.clone(), value.clone()));
        }

        let req = SpawnRequest {
            prog: name.to_string(),
            args: args.to_vec(),
            env,
            cwd: self.state.cwd.clone(),
            stdin_fd: io.stdin,
            stdout_fd: io.stdout,
            stderr_fd: io.stderr,
        };
        let pid = match self.abi.spawn(req) {
            Ok(pid) => pid,
            Err(err) => {
                self.write_err(&format!("sh: {}: {}\n", name, err)).await;
                return SimpleOutcome::Done(Flow::Normal(126));
            }
        };
        if spawn_only {
            return SimpleOutcome::Spawned(pid);
        }
        match self.abi.waitpid(pid).await {
            Ok(code) => {
                if let Some(flow) = self.check_cancel() {
                    return SimpleOutcome::Done(flow);
                }
                // The kernel enforces the tool matrix at spawn: 127 for
                // an unknown name, 126 for a registered-but-denied one.
                let known = self.abi.has_tool(name).unwrap_or(false);
                if !known && code == 127 {
                    self.write_err(&format!("sh: {}: command not found\n", name))
                        .await;
                } else if !known && code == 126 {
                    self.write_err(&format!("sh: {}: permission denied\n", name))
                        .await;
                }
                SimpleOutcome::Done(Flow::Normal(code))
            }
            Err(err) => {
                self.write_err(&format!("sh: wait: {}\n", err)).await;
                SimpleOutcome::Done(Flow::Normal(1))
            }
        }
    }

    async fn call_function(&mut self, body: &Command, args: &[String], io: StageIo) -> Flow {
        let saved_positional = std::mem::replace(&mut self.state.positional, args.to_vec());
        self.state.push_locals();
        let flow = self.exec_with_io(body, io).await;
        self.state.pop_locals();
        self.state.positional = saved_positional;
        match flow {
            Flow::Return(code) => Flow::Normal(code),
            other => other,
        }
    }

    // =====================================================================
    // Redirects
    // =====================================================================

    async fn apply_redirects(
        &mut self,
        redirects: &[Redirect],
        mut io: StageIo,
    ) -> Result<(StageIo, Vec<u32>), Flow> {
        let mut temp_fds = Vec::new();
        for redirect in redirects {
            let target = match self.expand_word_joined(&redirect.target).await {
                Ok(target) => target,
                Err(flow) => return Err(flow),
            };
            match redirect.kind {
                RedirKind::Dup => {
                    let Ok(source) = target.parse::<u32>() else {
                        self.write_err(&format!("sh: {}: bad fd\n", target)).await;
                        return Err(Flow::Normal(1));
                    };
                    let value = match source {
                        0 => io.stdin,
                        1 => io.stdout,
                        2 => io.stderr,
                        other => other,
                    };
                    match redirect.fd {
                        0 => io.stdin = value,
                        1 => io.stdout = value,
                        2 => io.stderr = value,
                        _ => {}
                    }
                }
                kind => {
                    let flags = match kind {
                        RedirKind::In => OpenFlags::READ,
                        RedirKind::Out => OpenFlags::WRITE,
                        RedirKind::Append => OpenFlags::APPEND,
                        RedirKind::Dup => unreachable!("handled above"),
                    };
                    match self.abi.host().path_open(&target, flags) {
                        Ok(fd) => {
                            temp_fds.push(fd);
                            match redirect.fd {
                                0 => io.stdin = fd,
                                1 => io.stdout = fd,
                                2 => io.stderr = fd,
                                _ => {}
                            }
                        }
                        Err(err) => {
                            self.write_err(&format!("sh: {}: {}\n", target, err)).await;
                            for fd in temp_fds {
                                let _ = self.abi.close_fd(fd);
                            }
                            return Err(Flow::Normal(1));
                        }
                    }
                }
            }
        }
        Ok((io, temp_fds))
    }

    // =====================================================================
    // Word expansion
    // =====================================================================

    /// Expand a word into fields: parameter and command substitution,
    /// field splitting on unquoted text, then pathname expansion with
    /// the classic keep-the-pattern fallback.
    pub async fn expand_word(&mut self, word: &Word) -> Result<Vec<String>, Flow> {
        // Brace expansion first, on fully unquoted words.
        if let [seg] = word.segs.as_slice() {
            if seg.quote == Quote::None && seg.text.contains('{') && seg.text.contains('}') {
                let alternatives = expand_braces(&seg.text);
                if alternatives.len() > 1 {
                    let mut fields = Vec::new();
                    for alternative in alternatives {
                        let sub = Word {
                            segs: vec![Seg {
                                text: alternative,
                                quote: Quote::None,
                            }],
                        };
                        fields.extend(self.expand_word_boxed(&sub).await?);
                    }
                    return Ok(fields);
                }
            }
        }

        let mut fields: Vec<String> = Vec::new();
        let mut globable: Vec<bool> = Vec::new();
        let mut open = false;

        for seg in &word.segs {
            match seg.quote {
                Quote::Single => {
                    append_joined(&mut fields, &mut globable, &mut open, &seg.text);
                }
                Quote::Double => {
                    if seg.text == "$@" {
                        for positional in self.state.positional.clone() {
                            fields.push(positional);
                            globable.push(false);
                        }
                        open = false;
                        continue;
                    }
                    let expanded = self.expand_text(&seg.text, true).await?;
                    append_joined(&mut fields, &mut globable, &mut open, &expanded);
                }
                Quote::None => {
                    let expanded = self.expand_text(&seg.text, false).await?;
                    append_split(&mut fields, &mut globable, &mut open, &expanded);
                }
            }
        }

        // Pathname expansion. The host call resolves against the VFS
        // and hands back absolute paths; a relative pattern gets its
        // matches re-relativized to the cwd.
        let mut out = Vec::new();
        for (field, can_glob) in fields.into_iter().zip(globable) {
            if can_glob && is_glob_pattern(&field) {
                match self.abi.glob(&field) {
                    Ok(matches) if !matches.is_empty() => {
                        if field.starts_with('/') {
                            out.extend(matches);
                        } else {
                            let prefix = if self.state.cwd == "/" {
                                "/".to_string()
                            } else {
                                format!("{}/", self.state.cwd)
                            };
                            for hit in matches {
                                match hit.strip_prefix(&prefix) {
                                    Some(relative) => out.push(relative.to_string()),
                                    None => out.push(hit),
                                }
                            }
                        }
                    }
                    // No match: the pattern stays literally.
                    _ => out.push(field),
                }
            } else {
                out.push(field);
            }
        }
        Ok(out)
    }

    fn expand_word_boxed<'a>(
        &'a mut self,
        word: &'a Word,
    ) -> LocalFut<'a, Result<Vec<String>, Flow>> {
        Box::pin(self.expand_word(word))
    }

    /// Expand to a single string (assignments, redirect targets): no
    /// field splitting, no globbing.
    pub async fn expand_word_joined(&mut self, word: &Word) -> Result<String, Flow> {
        let mut out = String::new();
        for seg in &word.segs {
            match seg.quote {
                Quote::Single => out.push_str(&seg.text),
                Quote::Double => out.push_str(&self.expand_text(&seg.text, true).await?),
                Quote::None => out.push_str(&self.expand_text(&seg.text, false).await?),
            }
        }
        Ok(out)
    }

    /// Substitute `$`-forms and backquotes in a segment.
    fn expand_text<'a>(
        &'a mut self,
        text: &'a str,
        double_quoted: bool,
    ) -> LocalFut<'a, Result<String, Flow>> {
        Box::pin(async move {
            let chars: Vec<char> = text.chars().collect();
            let mut out = String::new();
            let mut i = 0;
            while i < chars.len() {
                match chars[i] {
                    '\\' if double_quoted && i + 1 < chars.len() => {
                        let next = chars[i + 1];
                        if matches!(next, '$' | '`' | '"' | '\\') {
                            out.push(next);
                            i += 2;
                        } else {
                            out.push('\\');
                            i += 1;
                        }
                    }
                    '$' if i + 1 < chars.len() && chars[i + 1] == '(' => {
                        let (body, consumed) = take_balanced(&chars[i + 1..]);
                        out.push_str(&self.command_substitute(&body).await?);
                        i += 1 + consumed;
                    }
                    '$' if i + 1 < chars.len() && chars[i + 1] == '{' => {
                        let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                            out.push_str("${");
                            i += 2;
                            continue;
                        };
                        let inner: String = chars[i + 2..i + 2 + close].iter().collect();
                        out.push_str(&self.expand_parameter(&inner).await?);
                        i += 2 + close + 1;
                    }
                    '$' => {
                        let (name, consumed) = take_var_name(&chars[i + 1..]);
                        if name.is_empty() {
                            out.push('$');
                            i += 1;
                        } else {
                            out.push_str(&self.var_or_fail(&name).await?);
                            i += 1 + consumed;
                        }
                    }
                    '`' => {
                        let mut body = String::new();
                        let mut j = i + 1;
                        while j < chars.len() && chars[j] != '`' {
                            if chars[j] == '\\' && j + 1 < chars.len() {
                                body.push(chars[j + 1]);
                                j += 2;
                            } else {
                                body.push(chars[j]);
                                j += 1;
                            }
                        }
                        out.push_str(&self.command_substitute(&body).await?);
                        i = (j + 1).min(chars.len());
                    }
                    c => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            Ok(out)
        })
    }

    /// `${...}` body: plain name or `name:-default`.
    async fn expand_parameter(&mut self, inner: &str) -> Result<String, Flow> {
        if let Some((name, default)) = inner.split_once(":-") {
            let value = self.var_value(name);
            match value {
                Some(v) if !v.is_empty() => Ok(v),
                _ => self.expand_text(default, false).await,
            }
        } else {
            self.var_or_fail(inner).await
        }
    }

    fn var_value(&self, name: &str) -> Option<String> {
        match name {
            "?" => Some(self.state.last_exit.to_string()),
            "#" => Some(self.state.positional.len().to_string()),
            "@" | "*" => Some(self.state.positional.join(" ")),
            "0" => Some("sh".to_string()),
            _ if name.chars().all(|c| c.is_ascii_digit()) => {
                let index: usize = name.parse().ok()?;
                self.state.positional.get(index.wrapping_sub(1)).cloned()
            }
            _ => self.state.get_env(name),
        }
    }

    async fn var_or_fail(&mut self, name: &str) -> Result<String, Flow> {
        match self.var_value(name) {
            Some(value) => Ok(value),
            None if self.state.flags.nounset => {
                self.write_err(&format!("sh: {}: unbound variable\n", name))
                    .await;
                Err(Flow::Exit(1))
            }
            None => Ok(String::new()),
        }
    }

    /// `$(...)` / backquotes: run the body with stdout captured, then
    /// trim one trailing newline.
    async fn command_substitute(&mut self, body: &str) -> Result<String, Flow> {
        if let Some(flow) = self.check_cancel() {
            return Err(flow);
        }
        if self.state.subst_depth >= MAX_SUBST_DEPTH {
            self.write_err("sh: command substitution depth exceeded\n")
                .await;
            return Err(Flow::Normal(1));
        }
        let body = body.trim();
        if body.is_empty() {
            return Ok(String::new());
        }
        let parsed = match parse::parse(body) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_err(&format!("sh: {}\n", err)).await;
                return Err(Flow::Normal(2));
            }
        };

        self.state.subst_depth += 1;
        let capture = OutputBuffer::new(None);
        let capture_fd = self
            .abi
            .host()
            .alloc_fd(FdTarget::Buffer(capture.clone()));
        let saved_stdout = self.state.stdout_fd;
        self.state.stdout_fd = capture_fd;

        let flow = self.exec(&parsed).await;

        self.state.stdout_fd = saved_stdout;
        self.abi.host().close_fd(capture_fd);
        self.state.subst_depth -= 1;

        if let Flow::Cancelled(reason) = flow {
            return Err(Flow::Cancelled(reason));
        }
        self.state.last_exit = flow.code();

        let mut text = String::from_utf8_lossy(&capture.contents()).into_owned();
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }
}

// =========================================================================
// Field assembly helpers
// =========================================================================

fn append_joined(fields: &mut Vec<String>, globable: &mut Vec<bool>, open: &mut bool, text: &str) {
    if *open {
        if let Some(last) = fields.last_mut() {
            last.push_str(text);
            *open = true;
            return;
        }
    }
    fields.push(text.to_string());
    globable.push(false);
    *open = true;
}

fn append_split(fields: &mut Vec<String>, globable: &mut Vec<bool>, open: &mut bool, text: &str) {
    if text.is_empty() {
        return;
    }
    let starts_ws = text.starts_with(|c: char| c.is_whitespace());
    let ends_ws = text.ends_with(|c: char| c.is_whitespace());
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.is_empty() {
        // Pure whitespace terminates the open field.
        *open = false;
        return;
    }
    for (i, part) in parts.iter().enumerate() {
        if i == 0 && *open && !starts_ws {
            if let Some(last) = fields.last_mut() {
                last.push_str(part);
                if let Some(flag) = globable.last_mut() {
                    *flag = true;
                }
                continue;
            }
        }
        fields.push(part.to_string());
        globable.push(true);
    }
    *open = !ends_ws;
}

/// `(` at `chars[0]`: return the balanced body and the count of chars
/// consumed including both parens.
fn take_balanced(chars: &[char]) -> (String, usize) {
    let mut depth = 0;
    let mut body = String::new();
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '(' => {
                depth += 1;
                if depth > 1 {
                    body.push(c);
                }
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return (body, i + 1);
                }
                body.push(c);
            }
            _ => body.push(c),
        }
    }
    (body, chars.len())
}

fn take_var_name(chars: &[char]) -> (String, usize) {
    match chars.first() {
        Some(&c @ ('?' | '#' | '@' | '*')) => return (c.to_string(), 1),
        Some(c) if c.is_ascii_digit() => return (c.to_string(), 1),
        _ => {}
    }
    let mut name = String::new();
    for &c in chars {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
        } else {
            break;
        }
    }
    let len = name.len();
    (name, len)
}

/// `a{b,c}d` → `abd acd`. One level of alternation with nesting inside
/// handled by recursion on the expanded results.
fn expand_braces(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut open = None;
    let mut depth = 0;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let start = open.expect("matched open brace");
                    let body: String = chars[start + 1..i].iter().collect();
                    if !body.contains(',') {
                        break;
                    }
                    let prefix: String = chars[..start].iter().collect();
                    let suffix: String = chars[i + 1..].iter().collect();
                    let mut out = Vec::new();
                    for alternative in split_brace_body(&body) {
                        let candidate = format!("{}{}{}", prefix, alternative, suffix);
                        out.extend(expand_braces(&candidate));
                    }
                    return out;
                }
            }
            _ => {}
        }
    }
    vec![text.to_string()]
}

fn split_brace_body(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in body.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_braces() {
        assert_eq!(expand_braces("a{b,c}d"), vec!["abd", "acd"]);
        assert_eq!(expand_braces("{x,y}"), vec!["x", "y"]);
        assert_eq!(expand_braces("plain"), vec!["plain"]);
        assert_eq!(
            expand_braces("a{b,{c,d}}"),
            vec!["ab", "ac", "ad"]
        );
    }

    #[test]
    fn test_take_balanced() {
        let chars: Vec<char> = "(echo $(inner)) tail".chars().collect();
        let (body, consumed) = take_balanced(&chars);
        assert_eq!(body, "echo $(inner)");
        assert_eq!(consumed, 15);
    }

    #[test]
    fn test_take_var_name() {
        let chars: Vec<char> = "HOME/rest".chars().collect();
        assert_eq!(take_var_name(&chars), ("HOME".to_string(), 4));
        let chars: Vec<char> = "?x".chars().collect();
        assert_eq!(take_var_name(&chars), ("?".to_string(), 1));
    }

    #[test]
    fn test_append_split_joins_adjacent() {
        let mut fields = Vec::new();
        let mut globable = Vec::new();
        let mut open = false;
        append_joined(&mut fields, &mut globable, &mut open, "pre");
        append_split(&mut fields, &mut globable, &mut open, "fix more");
        assert_eq!(fields, vec!["prefix", "more"]);
    }

    #[test]
    fn test_append_split_whitespace_splits() {
        let mut fields = Vec::new();
        let mut globable = Vec::new();
        let mut open = false;
        append_split(&mut fields, &mut globable, &mut open, "  a  b  ");
        assert_eq!(fields, vec!["a", "b"]);
        assert!(!open);
    }

    #[test]
    fn test_flow_codes() {
        assert_eq!(Flow::Normal(3).code(), 3);
        assert_eq!(Flow::Cancelled(CancelReason::Timeout).code(), 124);
        assert_eq!(Flow::Break(1).code(), 0);
    }
}
