//! This crate coordinates stop-the-world debugging of many virtual machines
//! (VMs) running concurrently on their own OS threads.
//!
//! Three main components are provided:
//! - The [VmRegistry], tracking every live VM and the global *world mode*
//!   (all VMs running, or all VMs stopped).
//! - The [ExecutionHandler], the debugger-facing controller able to
//!   interrupt, resume and single-step the world, and to switch the
//!   debugged VM.
//! - The [BreakpointManager], a table of breakpoints shared by all VMs.
//!
//! # Writing an execution engine
//!
//! An execution engine owns a [Vm] on the thread executing guest code, and
//! calls its hooks so that the VM can be suspended:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use quiesce_debugger::{RunLoop, VirtualAddress, Vm, VmRegistry};
//!
//! fn run_guest(registry: &Arc<VmRegistry>, code: &[u8]) -> quiesce_debugger::Result<()> {
//!     let vm = Vm::new(registry)?;
//!
//!     // service callbacks dispatched while the VM is idle
//!     RunLoop::current().service_pending();
//!
//!     let _entered = vm.enter();
//!     vm.function_entry(VirtualAddress::from_parts(0, 0));
//!
//!     for offset in 1..code.len() as u32 {
//!         vm.safe_point(VirtualAddress::from_parts(0, offset));
//!         //
//!         // execute the opcode
//!         //
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Driving the world from a debugger
//!
//! ```no_run
//! use quiesce_debugger::{ExecutionHandler, VmRegistry};
//!
//! let handler = ExecutionHandler::new(VmRegistry::global().clone());
//!
//! handler.interrupt();
//! assert!(handler.registry().info().is_stopped());
//!
//! handler.resume();
//! ```

mod address;
mod breakpoint;
mod debug_state;
mod error;
mod handler;
mod registry;
mod run_loop;
mod suspension;
mod thread;
mod vm;

pub use self::address::{CodeInstance, FunctionSpaceIndex, VirtualAddress};
pub use self::breakpoint::{Breakpoint, BreakpointManager, BreakpointType};
pub use self::debug_state::{DebugState, DebugStateSnapshot, State, StopData};
pub use self::error::{Error, Result};
pub use self::handler::{Builder, ExecutionHandler, HandlerConfig, SessionPhase};
pub use self::registry::{StopCause, StopReason, StopReply, VmRegistry, WorldMode, WorldSnapshot};
pub use self::run_loop::RunLoop;
pub use self::thread::ThreadId;
pub use self::vm::{EnteredScope, Vm, VmHandle, VmOptions};
