//! Program registry
//!
//! Named guest programs with their capability grants. A program is an
//! async entry point taking a `GuestCtx` (kernel handle, WASI host) and
//! returning an exit code. The allowed set on top of registration backs
//! `has_tool` and the spawn-time capability check: unknown names exit
//! 127, registered-but-denied names exit 126, neither instantiates.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::guest::Capability;
use crate::kernel::kernel::Kernel;
use crate::wasi::host::WasiHost;

/// Everything a running guest program sees.
#[derive(Clone)]
pub struct GuestCtx {
    pub kernel: Rc<Kernel>,
    pub host: Rc<WasiHost>,
    pub caps: Vec<Capability>,
    /// Command mailbox, present only for shell guests.
    pub shell_io: Option<crate::guest::abi::ShellMailbox>,
}

impl GuestCtx {
    /// The capability-scoped host-call handle for this guest.
    pub fn abi(&self) -> crate::guest::abi::HostAbi {
        crate::guest::abi::HostAbi::new(
            self.kernel.clone(),
            self.host.clone(),
            self.caps.clone(),
            self.shell_io.clone(),
        )
    }
}

/// Entry point of a guest program.
pub type ProgramFn = fn(GuestCtx) -> Pin<Box<dyn Future<Output = i32>>>;

#[derive(Clone)]
pub struct ProgramSpec {
    pub run: ProgramFn,
    pub caps: Vec<Capability>,
}

pub struct ProgramRegistry {
    programs: RefCell<HashMap<String, ProgramSpec>>,
    allowed: RefCell<HashSet<String>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            programs: RefCell::new(HashMap::new()),
            allowed: RefCell::new(HashSet::new()),
        }
    }

    /// Register a program and allow it.
    pub fn register(&self, name: &str, run: ProgramFn, caps: Vec<Capability>) {
        self.programs
            .borrow_mut()
            .insert(name.to_string(), ProgramSpec { run, caps });
        self.allowed.borrow_mut().insert(name.to_string());
    }

    /// Register a program without allowing it; `allow` gates it later
    /// (package-installed tools).
    pub fn register_gated(&self, name: &str, run: ProgramFn, caps: Vec<Capability>) {
        self.programs
            .borrow_mut()
            .insert(name.to_string(), ProgramSpec { run, caps });
    }

    pub fn allow(&self, name: &str) {
        self.allowed.borrow_mut().insert(name.to_string());
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.programs.borrow().contains_key(name)
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.borrow().contains(name)
    }

    /// Registered and allowed — the `has_tool` answer.
    pub fn has_tool(&self, name: &str) -> bool {
        self.is_registered(name) && self.is_allowed(name)
    }

    pub fn lookup(&self, name: &str) -> Option<ProgramSpec> {
        self.programs.borrow().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.programs.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_ctx: GuestCtx) -> Pin<Box<dyn Future<Output = i32>>> {
        Box::pin(async { 0 })
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = ProgramRegistry::new();
        reg.register("cat", nop, Capability::tool_set());
        assert!(reg.has_tool("cat"));
        assert!(reg.lookup("cat").is_some());
        assert!(!reg.has_tool("dog"));
    }

    #[test]
    fn test_gated_program_needs_allow() {
        let reg = ProgramRegistry::new();
        reg.register_gated("pkg-tool", nop, Capability::tool_set());
        assert!(reg.is_registered("pkg-tool"));
        assert!(!reg.has_tool("pkg-tool"));
        reg.allow("pkg-tool");
        assert!(reg.has_tool("pkg-tool"));
    }

    #[test]
    fn test_names_sorted() {
        let reg = ProgramRegistry::new();
        reg.register("b", nop, vec![]);
        reg.register("a", nop, vec![]);
        assert_eq!(reg.names(), vec!["a", "b"]);
    }
}
