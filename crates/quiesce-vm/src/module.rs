use quiesce_debugger::FunctionSpaceIndex;

use crate::bytecode::Opcode;
use crate::error::ModuleError;

/// Function of a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// Name of the function, for diagnostics.
    pub name: String,

    /// Number of parameters, stored in the first locals.
    pub params: u32,

    /// Number of locals besides parameters, zero-initialized.
    pub locals: u32,

    /// Body of the function.
    pub code: Vec<Opcode>,
}

impl Function {
    /// Creates a function.
    pub fn new(name: impl Into<String>, params: u32, locals: u32, code: Vec<Opcode>) -> Self {
        Self {
            name: name.into(),
            params,
            locals,
            code,
        }
    }

    /// Total number of locals, parameters included.
    pub fn num_locals(&self) -> u32 {
        self.params + self.locals
    }
}

/// Validated module, with its functions laid out contiguously in code
/// address space.
#[derive(Debug)]
pub struct Module {
    functions: Vec<Function>,

    /// Code offset of the first opcode of each function.
    entries: Vec<u32>,

    code_size: u32,
}

impl Module {
    /// Validates and lays out the given functions.
    pub fn new(functions: Vec<Function>) -> Result<Self, ModuleError> {
        let mut entries = Vec::with_capacity(functions.len());
        let mut code_size = 0u32;

        for (idx, function) in functions.iter().enumerate() {
            let index = FunctionSpaceIndex(u32::try_from(idx).map_err(|_| ModuleError::CodeTooLarge)?);

            validate(index, function, functions.len())?;

            entries.push(code_size);

            let len = u32::try_from(function.code.len()).map_err(|_| ModuleError::CodeTooLarge)?;
            code_size = code_size
                .checked_add(len)
                .ok_or(ModuleError::CodeTooLarge)?;
        }

        Ok(Self {
            functions,
            entries,
            code_size,
        })
    }

    /// Returns every function, ordered by function space index.
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Returns a function by index.
    pub fn function(&self, index: FunctionSpaceIndex) -> Option<&Function> {
        self.functions.get(index.0 as usize)
    }

    /// Finds a function by name.
    pub fn function_by_name(&self, name: &str) -> Option<FunctionSpaceIndex> {
        self.functions
            .iter()
            .position(|function| function.name == name)
            .map(|idx| FunctionSpaceIndex(idx as u32))
    }

    /// Returns the code offset of the first opcode of a function.
    pub fn entry_offset(&self, index: FunctionSpaceIndex) -> Option<u32> {
        self.entries.get(index.0 as usize).copied()
    }

    /// Returns the size of the whole code.
    pub fn code_size(&self) -> u32 {
        self.code_size
    }
}

fn validate(
    index: FunctionSpaceIndex,
    function: &Function,
    num_functions: usize,
) -> Result<(), ModuleError> {
    if function.code.is_empty() {
        return Err(ModuleError::EmptyBody(index));
    }

    for op in &function.code {
        match *op {
            Opcode::Br(target) | Opcode::BrIf(target)
                if target as usize >= function.code.len() =>
            {
                return Err(ModuleError::BranchOutOfBounds {
                    function: index,
                    target,
                });
            }
            Opcode::Call(callee) if callee as usize >= num_functions => {
                return Err(ModuleError::UnknownCallee {
                    function: index,
                    callee,
                });
            }
            Opcode::LocalGet(local) | Opcode::LocalSet(local) if local >= function.num_locals() => {
                return Err(ModuleError::UnknownLocal {
                    function: index,
                    local,
                });
            }
            _ => (),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use quiesce_debugger::FunctionSpaceIndex;

    use super::{Function, Module};
    use crate::{ModuleError, Opcode};

    #[test]
    fn layout() {
        let module = Module::new(vec![
            Function::new("a", 0, 0, vec![Opcode::Const(1), Opcode::Return]),
            Function::new("b", 1, 0, vec![Opcode::LocalGet(0), Opcode::Nop, Opcode::Return]),
        ])
        .unwrap();

        assert_eq!(module.entry_offset(FunctionSpaceIndex(0)), Some(0));
        assert_eq!(module.entry_offset(FunctionSpaceIndex(1)), Some(2));
        assert_eq!(module.entry_offset(FunctionSpaceIndex(2)), None);
        assert_eq!(module.code_size(), 5);
        assert_eq!(module.function_by_name("b"), Some(FunctionSpaceIndex(1)));
        assert_eq!(module.function_by_name("c"), None);
    }

    #[test]
    fn validation() {
        let err = Module::new(vec![Function::new("empty", 0, 0, vec![])]).unwrap_err();
        assert_eq!(err, ModuleError::EmptyBody(FunctionSpaceIndex(0)));

        let err = Module::new(vec![Function::new("br", 0, 0, vec![Opcode::Br(1)])]).unwrap_err();
        assert_eq!(
            err,
            ModuleError::BranchOutOfBounds {
                function: FunctionSpaceIndex(0),
                target: 1
            }
        );

        let err = Module::new(vec![Function::new("call", 0, 0, vec![Opcode::Call(1)])]).unwrap_err();
        assert_eq!(
            err,
            ModuleError::UnknownCallee {
                function: FunctionSpaceIndex(0),
                callee: 1
            }
        );

        let err = Module::new(vec![Function::new("local", 1, 1, vec![Opcode::LocalSet(2)])])
            .unwrap_err();
        assert_eq!(
            err,
            ModuleError::UnknownLocal {
                function: FunctionSpaceIndex(0),
                local: 2
            }
        );
    }
}
