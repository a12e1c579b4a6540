//! This crate provides a minimal stack-machine engine executing guest code
//! within [quiesce_debugger] VMs.
//!
//! The engine calls the safe-point hooks of its VM before every opcode, so a
//! debugger can stop it at any time. It is made of:
//! - Validated [Module]s of bytecode, instantiated by a [ModuleManager].
//! - An interpreter, started with [invoke].
//! - [Worker] threads, each owning one VM and either idling, running guest
//!   code in a loop, or running it on demand.

mod bytecode;
mod error;
mod host;
mod interpreter;
mod manager;
mod module;

/// Canned guest code.
pub mod workload;

pub use self::bytecode::Opcode;
pub use self::error::{Error, ModuleError, Result, Trap};
pub use self::host::{Worker, WorkerKind};
pub use self::interpreter::{MAX_CALL_DEPTH, invoke};
pub use self::manager::{Instance, ModuleManager};
pub use self::module::{Function, Module};
