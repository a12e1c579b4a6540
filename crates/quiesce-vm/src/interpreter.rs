use quiesce_debugger::{FunctionSpaceIndex, VirtualAddress, Vm};

use crate::bytecode::Opcode;
use crate::error::Trap;
use crate::manager::Instance;
use crate::module::{Function, Module};

/// Maximum number of nested calls.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Invokes a function of `instance` on `vm`, returning its result.
///
/// The VM is entered for the whole invocation. Its function entry hook is
/// called on every call (initial one included), and its safe-point hook
/// before every other opcode.
pub fn invoke(
    vm: &Vm,
    instance: &Instance,
    function: FunctionSpaceIndex,
    args: &[i64],
) -> Result<i64, Trap> {
    let _entered = vm.enter();

    let mut frames = vec![Frame::new(instance, function, args.to_vec())?];
    let mut entering = true;

    while let Some(frame) = frames.last_mut() {
        let addr = instance.address(frame.entry + frame.pc);

        if entering {
            vm.function_entry(addr);
            entering = false;
        } else {
            vm.safe_point(addr);
        }

        // falling off the end of a function returns
        let op = frame
            .function
            .code
            .get(frame.pc as usize)
            .copied()
            .unwrap_or(Opcode::Return);

        frame.pc += 1;

        match frame.execute(op, addr)? {
            Control::Next => (),
            Control::Call(callee, args) => {
                if frames.len() >= MAX_CALL_DEPTH {
                    return Err(Trap::CallStackExhausted);
                }

                frames.push(Frame::new(instance, callee, args)?);
                entering = true;
            }
            Control::Return(value) => {
                frames.pop();

                match frames.last_mut() {
                    Some(caller) => caller.stack.push(value),
                    None => return Ok(value),
                }
            }
        }
    }

    // the outermost frame always returns
    Ok(0)
}

enum Control {
    Next,
    Call(FunctionSpaceIndex, Vec<i64>),
    Return(i64),
}

struct Frame<'a> {
    module: &'a Module,
    function: &'a Function,

    /// Code offset of the first opcode of the function.
    entry: u32,

    /// Index of the next opcode.
    pc: u32,

    locals: Vec<i64>,
    stack: Vec<i64>,
}

impl<'a> Frame<'a> {
    fn new(instance: &'a Instance, index: FunctionSpaceIndex, args: Vec<i64>) -> Result<Self, Trap> {
        let module = instance.module();

        let (Some(function), Some(entry)) = (module.function(index), module.entry_offset(index))
        else {
            return Err(Trap::UnknownFunction(index));
        };

        if args.len() != function.params as usize {
            return Err(Trap::ArityMismatch {
                function: index,
                expected: function.params,
                got: args.len(),
            });
        }

        let mut locals = args;
        locals.resize(function.num_locals() as usize, 0);

        Ok(Self {
            module,
            function,
            entry,
            pc: 0,
            locals,
            stack: Vec::new(),
        })
    }

    fn pop(&mut self, addr: VirtualAddress) -> Result<i64, Trap> {
        self.stack.pop().ok_or(Trap::StackUnderflow(addr))
    }

    /// Executes an opcode, with `pc` already pointing past it.
    fn execute(&mut self, op: Opcode, addr: VirtualAddress) -> Result<Control, Trap> {
        match op {
            Opcode::Nop => (),
            Opcode::Const(value) => self.stack.push(value),
            Opcode::Add => {
                let b = self.pop(addr)?;
                let a = self.pop(addr)?;
                self.stack.push(a.wrapping_add(b));
            }
            Opcode::Sub => {
                let b = self.pop(addr)?;
                let a = self.pop(addr)?;
                self.stack.push(a.wrapping_sub(b));
            }
            Opcode::LocalGet(local) => self.stack.push(self.locals[local as usize]),
            Opcode::LocalSet(local) => {
                let value = self.pop(addr)?;
                self.locals[local as usize] = value;
            }
            Opcode::Drop => {
                self.pop(addr)?;
            }
            Opcode::Br(target) => self.pc = target,
            Opcode::BrIf(target) => {
                if self.pop(addr)? != 0 {
                    self.pc = target;
                }
            }
            Opcode::Call(callee) => {
                let callee = FunctionSpaceIndex(callee);
                let params = self
                    .module
                    .function(callee)
                    .map_or(0, |function| function.params as usize);

                if self.stack.len() < params {
                    return Err(Trap::StackUnderflow(addr));
                }

                let args = self.stack.split_off(self.stack.len() - params);
                return Ok(Control::Call(callee, args));
            }
            Opcode::Return => return Ok(Control::Return(self.pop(addr)?)),
        }

        Ok(Control::Next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quiesce_debugger::{FunctionSpaceIndex, VirtualAddress, Vm, VmRegistry};
    use test_log::test;

    use super::invoke;
    use crate::{Function, ModuleManager, Opcode, Trap, workload};

    #[test]
    fn spin_returns_its_argument() {
        let registry = VmRegistry::new();
        let vm = Vm::new(&registry).unwrap();
        let instance = ModuleManager::new().instantiate(Arc::new(workload::module().unwrap()));

        assert_eq!(invoke(&vm, &instance, workload::SPIN, &[0]), Ok(0));
        assert_eq!(invoke(&vm, &instance, workload::SPIN, &[100]), Ok(100));
        assert_eq!(invoke(&vm, &instance, workload::TICK, &[41]), Ok(42));

        assert!(!vm.is_entered());
        assert_eq!(registry.info().number_of_active_vms, 0);
    }

    #[test]
    fn traps() {
        let registry = VmRegistry::new();
        let vm = Vm::new(&registry).unwrap();
        let manager = ModuleManager::new();

        let instance = manager.instantiate(Arc::new(workload::module().unwrap()));
        assert_eq!(
            invoke(&vm, &instance, FunctionSpaceIndex(5), &[]),
            Err(Trap::UnknownFunction(FunctionSpaceIndex(5)))
        );
        assert_eq!(
            invoke(&vm, &instance, workload::SPIN, &[]),
            Err(Trap::ArityMismatch {
                function: workload::SPIN,
                expected: 1,
                got: 0
            })
        );

        let module = crate::Module::new(vec![
            Function::new("underflow", 0, 0, vec![Opcode::Nop, Opcode::Add]),
            Function::new("recurse", 0, 0, vec![Opcode::Call(1), Opcode::Return]),
        ])
        .unwrap();
        let instance = manager.instantiate(Arc::new(module));

        assert_eq!(
            invoke(&vm, &instance, FunctionSpaceIndex(0), &[]),
            Err(Trap::StackUnderflow(VirtualAddress::from_parts(
                instance.id(),
                1
            )))
        );
        assert_eq!(
            invoke(&vm, &instance, FunctionSpaceIndex(1), &[]),
            Err(Trap::CallStackExhausted)
        );

        // a trap leaves the VM
        assert!(!vm.is_entered());
    }
}
