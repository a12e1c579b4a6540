//! Guest code used to keep VMs busy.
//!
//! The module holds two functions:
//! - `tick(x)` returns `x + 1`.
//! - `spin(n)` calls `tick` `n` times, and returns `n`.
//!
//! Placing a breakpoint on the entry of [TICK] makes every iteration of
//! [SPIN] hit it.

use quiesce_debugger::FunctionSpaceIndex;

use crate::bytecode::Opcode::{self, Add, Br, BrIf, Call, Const, LocalGet, LocalSet, Return, Sub};
use crate::error::ModuleError;
use crate::module::{Function, Module};

/// Index of `tick`.
pub const TICK: FunctionSpaceIndex = FunctionSpaceIndex(0);

/// Index of `spin`.
pub const SPIN: FunctionSpaceIndex = FunctionSpaceIndex(1);

const TICK_CODE: [Opcode; 4] = [LocalGet(0), Const(1), Add, Return];

// locals: 0 = n, 1 = accumulator
const SPIN_CODE: [Opcode; 13] = [
    LocalGet(0),
    BrIf(3),
    Br(11),
    LocalGet(1),
    Call(TICK.0),
    LocalSet(1),
    LocalGet(0),
    Const(1),
    Sub,
    LocalSet(0),
    Br(0),
    LocalGet(1),
    Return,
];

/// Builds the workload module.
pub fn module() -> Result<Module, ModuleError> {
    Module::new(vec![
        Function::new("tick", 1, 0, TICK_CODE.to_vec()),
        Function::new("spin", 1, 1, SPIN_CODE.to_vec()),
    ])
}
