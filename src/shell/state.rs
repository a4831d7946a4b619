//! Shell guest state
//!
//! Everything the shell keeps between commands: environment, working
//! directory, positional parameters, option flags, functions, history,
//! the local-variable stack, and the substitution depth guard. The
//! environment map is shared with the driver, which is how get/set-env
//! on the facade observes and updates it between commands.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::shell::parse::Command;

/// Shell option flags (`set -e` and friends).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub errexit: bool,
    pub nounset: bool,
    pub xtrace: bool,
    pub pipefail: bool,
}

pub type SharedEnv = Rc<RefCell<HashMap<String, String>>>;

/// Saved context for subshells: env, cwd, positional params, flags, and
/// the fd overrides.
pub struct Snapshot {
    env: HashMap<String, String>,
    cwd: String,
    positional: Vec<String>,
    flags: Flags,
    stdin_fd: u32,
    stdout_fd: u32,
    stderr_fd: u32,
}

pub struct ShellState {
    pub env: SharedEnv,
    pub cwd: String,
    pub positional: Vec<String>,
    pub flags: Flags,
    pub last_exit: i32,
    pub functions: HashMap<String, Rc<Command>>,
    pub history: Vec<String>,
    /// Nested `local` frames; each maps a name to its shadowed value.
    pub locals: Vec<HashMap<String, Option<String>>>,
    /// Command-substitution nesting guard.
    pub subst_depth: u32,
    /// Current stdio of the shell itself (overridden inside pipelines,
    /// substitutions, and redirected compounds).
    pub stdin_fd: u32,
    pub stdout_fd: u32,
    pub stderr_fd: u32,
}

/// Bound on `$(...)` nesting.
pub const MAX_SUBST_DEPTH: u32 = 50;

impl ShellState {
    pub fn new(env: SharedEnv, cwd: impl Into<String>) -> Self {
        Self {
            env,
            cwd: cwd.into(),
            positional: Vec::new(),
            flags: Flags::default(),
            last_exit: 0,
            functions: HashMap::new(),
            history: Vec::new(),
            locals: Vec::new(),
            subst_depth: 0,
            stdin_fd: 0,
            stdout_fd: 1,
            stderr_fd: 2,
        }
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.env.borrow().get(name).cloned()
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        // A `local` in scope shadows: record the original once.
        if let Some(frame) = self.locals.last_mut() {
            if frame.contains_key(name) {
                self.env
                    .borrow_mut()
                    .insert(name.to_string(), value.to_string());
                return;
            }
        }
        self.env
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
    }

    pub fn unset_env(&mut self, name: &str) {
        self.env.borrow_mut().remove(name);
    }

    /// Begin a `local` frame (function call).
    pub fn push_locals(&mut self) {
        self.locals.push(HashMap::new());
    }

    /// Declare a local in the current frame, saving the shadowed value.
    pub fn declare_local(&mut self, name: &str) {
        let shadowed = self.get_env(name);
        if let Some(frame) = self.locals.last_mut() {
            frame.entry(name.to_string()).or_insert(shadowed);
        }
    }

    /// End the current frame, restoring every shadowed value.
    pub fn pop_locals(&mut self) {
        let Some(frame) = self.locals.pop() else {
            return;
        };
        for (name, shadowed) in frame {
            match shadowed {
                Some(value) => {
                    self.env.borrow_mut().insert(name, value);
                }
                None => {
                    self.env.borrow_mut().remove(&name);
                }
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            env: self.env.borrow().clone(),
            cwd: self.cwd.clone(),
            positional: self.positional.clone(),
            flags: self.flags,
            stdin_fd: self.stdin_fd,
            stdout_fd: self.stdout_fd,
            stderr_fd: self.stderr_fd,
        }
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        *self.env.borrow_mut() = snapshot.env;
        self.cwd = snapshot.cwd;
        self.positional = snapshot.positional;
        self.flags = snapshot.flags;
        self.stdin_fd = snapshot.stdin_fd;
        self.stdout_fd = snapshot.stdout_fd;
        self.stderr_fd = snapshot.stderr_fd;
    }
}
