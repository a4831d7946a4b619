//! Guest execution seam
//!
//! Guests run against the WASI host and a capability-scoped host-ABI.
//! The bytecode engine is a platform adapter behind `GuestMemory` and
//! the raw marshalling helpers; the built-in toolset runs as native
//! cooperative tasks registered in the program registry, exercising the
//! identical fd-dispatch and host-call paths.

pub mod abi;
pub mod memory;
pub mod registry;

pub use abi::HostAbi;
pub use memory::{GuestMemory, MemoryError, VecMemory};
pub use registry::{GuestCtx, ProgramRegistry, ProgramSpec};

/// One grantable capability in the host-call namespace.
///
/// The shell receives Filesystem + Process + Time + ShellIo; interpreter
/// guests receive Network + Extension; plain tools receive nothing
/// beyond pure WASI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// stat/read_file/write_file/readdir/glob
    Filesystem,
    /// pipe/spawn/waitpid/close_fd/has_tool
    Process,
    /// time_ms
    Time,
    /// read_command/write_result
    ShellIo,
    /// network_fetch
    Network,
    /// extension_invoke
    Extension,
}

impl Capability {
    /// Grant set for the shell guest.
    pub fn shell_set() -> Vec<Capability> {
        vec![
            Capability::Filesystem,
            Capability::Process,
            Capability::Time,
            Capability::ShellIo,
        ]
    }

    /// Grant set for interpreter guests (network + extensions).
    pub fn interpreter_set() -> Vec<Capability> {
        vec![Capability::Network, Capability::Extension]
    }

    /// Plain tools get nothing beyond WASI.
    pub fn tool_set() -> Vec<Capability> {
        Vec::new()
    }
}
