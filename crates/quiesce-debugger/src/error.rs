use crate::address::FunctionSpaceIndex;
use crate::thread::ThreadId;

/// Error type of this crate.
///
/// Lifecycle races (e.g., a VM vanishing while the world is being stopped)
/// are never reported as errors. Only misuse of the debugging protocol is.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation requires the world to be stopped.
    #[error("world is not stopped")]
    WorldNotStopped,

    /// No VM is currently designated as the debuggee.
    #[error("no debuggee VM")]
    NoDebuggee,

    /// The thread does not own a live VM.
    #[error("thread {0} owns no live VM")]
    UnknownThread(ThreadId),

    /// The thread's VM is not stopped.
    #[error("VM of thread {0} is not stopped")]
    VmNotStopped(ThreadId),

    /// The debuggee is stopped outside of guest code, so there is nothing to
    /// single-step.
    #[error("VM of thread {0} is stopped outside of guest code")]
    NoGuestFrame(ThreadId),

    /// The thread already owns a live VM.
    #[error("thread {0} already owns a live VM")]
    ThreadAlreadyOwnsVm(ThreadId),

    /// The function space index does not resolve to any code.
    #[error("function {function} not found in instance {instance_id}")]
    UnknownFunction {
        /// Instance in which the lookup happened.
        instance_id: u32,

        /// Index of the unresolved function.
        function: FunctionSpaceIndex,
    },
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
