use std::time::Duration;

use quiesce_debugger::{FunctionSpaceIndex, VirtualAddress};

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Debugger error.
    #[error(transparent)]
    Debugger(#[from] quiesce_debugger::Error),

    /// Invalid module.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Guest code trapped.
    #[error(transparent)]
    Trap(#[from] Trap),

    /// Failed to spawn a worker thread.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker did not start in time.
    #[error("worker not ready after {0:?}")]
    WorkerNotReady(Duration),

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Validation error of a module.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// A function has no code.
    #[error("function {0} has an empty body")]
    EmptyBody(FunctionSpaceIndex),

    /// A branch jumps outside of its function.
    #[error("function {function}: branch target {target} out of bounds")]
    BranchOutOfBounds {
        /// Function containing the branch.
        function: FunctionSpaceIndex,

        /// Target of the branch.
        target: u32,
    },

    /// A call targets a missing function.
    #[error("function {function}: call to unknown function {callee}")]
    UnknownCallee {
        /// Function containing the call.
        function: FunctionSpaceIndex,

        /// Called function.
        callee: u32,
    },

    /// A local access targets a missing local.
    #[error("function {function}: local {local} out of bounds")]
    UnknownLocal {
        /// Function containing the access.
        function: FunctionSpaceIndex,

        /// Accessed local.
        local: u32,
    },

    /// The code does not fit into the address space of an instance.
    #[error("code too large")]
    CodeTooLarge,
}

/// Runtime error of guest code.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// An opcode popped from an empty operand stack.
    #[error("stack underflow at {0}")]
    StackUnderflow(VirtualAddress),

    /// The invoked function does not exist.
    #[error("unknown function {0}")]
    UnknownFunction(FunctionSpaceIndex),

    /// The invoked function was given the wrong number of arguments.
    #[error("function {function} expects {expected} arguments, got {got}")]
    ArityMismatch {
        /// Invoked function.
        function: FunctionSpaceIndex,

        /// Number of parameters.
        expected: u32,

        /// Number of arguments.
        got: usize,
    },

    /// Too many nested calls.
    #[error("call stack exhausted")]
    CallStackExhausted,
}
